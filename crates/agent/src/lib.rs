pub mod coordinator;
pub mod history;
pub mod sweeper;

pub use coordinator::CheckoutCoordinator;
pub use history::{HistoryError, PurchaseHistory};
pub use sweeper::ReservationSweeper;
