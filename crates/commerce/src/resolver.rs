use std::sync::Arc;

use tracing::info;

use poltergeist_core::domain::product::{Product, ProductCandidate, ProductId};

use crate::error::CommerceError;
use crate::firecrawl::FirecrawlClient;
use crate::rye::RyeClient;

/// Product research and resolution: web search for candidates, then track
/// and fetch through the commerce provider.
pub struct ProductResolver {
    firecrawl: Arc<FirecrawlClient>,
    rye: Arc<RyeClient>,
}

impl ProductResolver {
    pub fn new(firecrawl: Arc<FirecrawlClient>, rye: Arc<RyeClient>) -> Self {
        Self { firecrawl, rye }
    }

    pub async fn research(&self, query: &str) -> Result<Vec<ProductCandidate>, CommerceError> {
        let candidates = self.firecrawl.search(query).await?;
        info!(%query, hits = candidates.len(), "product research complete");
        Ok(candidates)
    }

    /// Start provider-side tracking for a product URL. Must happen before
    /// details can be fetched or a cart created.
    pub async fn track(&self, product_url: &str) -> Result<ProductId, CommerceError> {
        let product_id = self.rye.request_product_tracking(product_url).await?;
        info!(%product_url, %product_id, "product tracking requested");
        Ok(product_id)
    }

    pub async fn resolve(&self, product_id: &ProductId) -> Result<Product, CommerceError> {
        self.rye.product_details(product_id).await
    }
}
