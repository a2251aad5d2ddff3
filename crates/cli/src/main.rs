use std::process::ExitCode;

fn main() -> ExitCode {
    poltergeist_cli::run()
}
