pub mod cart;
pub mod error;
pub mod firecrawl;
pub mod resolver;
pub mod rye;

pub use cart::{CartBackend, CartError, CartManager};
pub use error::{CommerceError, GraphQLErrorDetail};
pub use firecrawl::FirecrawlClient;
pub use resolver::ProductResolver;
pub use rye::RyeClient;
