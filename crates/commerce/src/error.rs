use thiserror::Error;

use poltergeist_core::checkout::ProviderError;

/// Errors from the outbound commerce and search integrations.
#[derive(Debug, Error)]
pub enum CommerceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GraphQL errors: {}", format_graphql_errors(.0))]
    GraphQL(Vec<GraphQLErrorDetail>),

    /// Error reported inside a mutation payload (store- or cart-level).
    #[error("provider error {code}: {message}")]
    Store { code: String, message: String },

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("unexpected response shape: {0}")]
    MissingData(String),
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct GraphQLErrorDetail {
    pub message: String,
    #[serde(default)]
    pub path: Vec<serde_json::Value>,
}

fn format_graphql_errors(errors: &[GraphQLErrorDetail]) -> String {
    errors.iter().map(|error| error.message.clone()).collect::<Vec<_>>().join("; ")
}

impl From<CommerceError> for ProviderError {
    fn from(error: CommerceError) -> Self {
        match error {
            CommerceError::Http(http) => {
                let status_5xx = http.status().is_some_and(|status| status.is_server_error());
                if http.is_timeout() || http.is_connect() || status_5xx {
                    ProviderError::Unavailable(http.to_string())
                } else {
                    ProviderError::InvalidResponse(http.to_string())
                }
            }
            CommerceError::Store { code, message } => {
                let upper = code.to_ascii_uppercase();
                if upper.contains("CART_NOT_FOUND") {
                    ProviderError::CartNotFound(message)
                } else if upper.contains("PRODUCT_NOT_FOUND") || upper.contains("NOT_TRACKED") {
                    ProviderError::ProductNotFound(message)
                } else {
                    ProviderError::Declined(format!("{code}: {message}"))
                }
            }
            other => ProviderError::InvalidResponse(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use poltergeist_core::checkout::ProviderError;

    use super::CommerceError;

    #[test]
    fn store_error_codes_map_to_provider_classes() {
        let cart = CommerceError::Store {
            code: "CART_NOT_FOUND".to_string(),
            message: "no such cart".to_string(),
        };
        assert!(matches!(ProviderError::from(cart), ProviderError::CartNotFound(_)));

        let declined = CommerceError::Store {
            code: "OFFER_NOT_AVAILABLE".to_string(),
            message: "item went out of stock".to_string(),
        };
        let mapped = ProviderError::from(declined);
        assert!(matches!(mapped, ProviderError::Declined(_)));
        assert!(!mapped.is_transient());
    }

    #[test]
    fn missing_data_is_not_transient() {
        let mapped = ProviderError::from(CommerceError::MissingData("empty payload".to_string()));
        assert!(matches!(mapped, ProviderError::InvalidResponse(_)));
        assert!(!mapped.is_transient());
    }
}
