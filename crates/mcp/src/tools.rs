//! Tool implementations behind `tools/call`.
//!
//! Every handler takes the shared [`AppState`] plus the raw `arguments`
//! object and returns either a JSON payload for the client or a
//! [`ToolError`]. Business rejections (limit exceeded, declined checkout)
//! are payloads, not failures; only malformed input and infrastructure
//! errors surface as tool errors.

use std::sync::Arc;

use rust_decimal::Decimal;

use poltergeist_agent::{CheckoutCoordinator, HistoryError, PurchaseHistory};
use poltergeist_commerce::{CartError, CartManager, CommerceError, ProductResolver};
use poltergeist_core::checkout::CheckoutError;
use poltergeist_core::errors::ApplicationError;
use poltergeist_core::ledger::LedgerError;
use poltergeist_core::{
    BuyerInfo, CartId, CheckoutOutcome, OverLimitPolicy, ProductId, SpendingLedger, UserId,
};

pub const SERVER_STATUS_MESSAGE: &str =
    "Poltergeist MCP Server is running and ready to haunt... I mean, help!";

/// Everything the tool handlers need, wired once at startup.
pub struct AppState {
    pub resolver: ProductResolver,
    pub carts: CartManager,
    pub coordinator: CheckoutCoordinator,
    pub history: PurchaseHistory,
    pub ledger: Arc<dyn SpendingLedger>,
    pub default_on_limit: OverLimitPolicy,
}

/// How a tool call failed. Bad input keeps its message verbatim so the
/// calling agent can correct itself; application failures are rendered
/// through the layered error mapping with a correlation id.
#[derive(Debug)]
pub enum ToolError {
    BadInput(String),
    App(ApplicationError),
}

impl From<CommerceError> for ToolError {
    fn from(error: CommerceError) -> Self {
        match error {
            CommerceError::MissingCredentials(_) => {
                Self::App(ApplicationError::Configuration(error.to_string()))
            }
            other => Self::App(ApplicationError::Integration(other.to_string())),
        }
    }
}

impl From<CartError> for ToolError {
    fn from(error: CartError) -> Self {
        match error {
            CartError::Domain(domain) => Self::BadInput(domain.to_string()),
            CartError::Commerce(commerce) => Self::from(commerce),
            CartError::Storage(storage) => {
                Self::App(ApplicationError::Persistence(storage.to_string()))
            }
        }
    }
}

impl From<HistoryError> for ToolError {
    fn from(error: HistoryError) -> Self {
        match error {
            HistoryError::Domain(domain) => Self::BadInput(domain.to_string()),
            HistoryError::Storage(storage) => {
                Self::App(ApplicationError::Persistence(storage.to_string()))
            }
        }
    }
}

impl From<LedgerError> for ToolError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::Storage(message) => Self::App(ApplicationError::Persistence(message)),
            other => Self::BadInput(other.to_string()),
        }
    }
}

impl From<CheckoutError> for ToolError {
    fn from(error: CheckoutError) -> Self {
        match error {
            CheckoutError::CartNotFound(_)
            | CheckoutError::CartNotOpen { .. }
            | CheckoutError::MissingBuyerEmail
            | CheckoutError::Domain(_) => Self::BadInput(error.to_string()),
            CheckoutError::Ledger(ledger) => Self::from(ledger),
            CheckoutError::Provider(provider) => {
                Self::App(ApplicationError::Integration(provider.to_string()))
            }
            CheckoutError::History(message) => Self::App(ApplicationError::Persistence(message)),
        }
    }
}

fn required_str<'a>(args: &'a serde_json::Value, name: &str) -> Result<&'a str, ToolError> {
    args.get(name)
        .and_then(|value| value.as_str())
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ToolError::BadInput(format!("Missing '{name}' parameter")))
}

/// Accepts either a JSON number or a numeric string, since MCP clients
/// disagree on how to encode money.
fn decimal_arg(args: &serde_json::Value, name: &str) -> Result<Decimal, ToolError> {
    let value = args
        .get(name)
        .ok_or_else(|| ToolError::BadInput(format!("Missing '{name}' parameter")))?;
    if let Some(text) = value.as_str() {
        return text.trim().parse::<Decimal>().map_err(|_| {
            ToolError::BadInput(format!("'{name}' is not a valid amount: {text}"))
        });
    }
    if let Some(number) = value.as_f64() {
        return Decimal::try_from(number).map_err(|_| {
            ToolError::BadInput(format!("'{name}' is not a representable amount: {number}"))
        });
    }
    Err(ToolError::BadInput(format!(
        "'{name}' must be a number or numeric string"
    )))
}

pub async fn research_products(
    state: &AppState,
    args: serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let query = required_str(&args, "query")?;

    let candidates = state.resolver.research(query).await?;

    Ok(serde_json::json!({
        "status": "success",
        "query": query,
        "results": candidates,
    }))
}

pub async fn request_amazon_product_tracking(
    state: &AppState,
    args: serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let product_url = required_str(&args, "product_url")?;

    let product_id = state.resolver.track(product_url).await?;

    Ok(serde_json::json!({
        "status": "success",
        "product_url": product_url,
        "product_id": product_id,
    }))
}

pub async fn fetch_amazon_product_details(
    state: &AppState,
    args: serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let product_id = ProductId(required_str(&args, "product_id")?.to_string());

    let product = state.resolver.resolve(&product_id).await?;

    Ok(serde_json::json!({
        "status": "success",
        "product": product,
    }))
}

pub async fn create_amazon_cart(
    state: &AppState,
    args: serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let product_id = ProductId(required_str(&args, "product_id")?.to_string());
    let quantity = match args.get("quantity") {
        None | Some(serde_json::Value::Null) => 1,
        Some(value) => value
            .as_i64()
            .ok_or_else(|| ToolError::BadInput("'quantity' must be an integer".to_string()))?,
    };

    let cart = state.carts.create_cart(&product_id, quantity).await?;

    Ok(serde_json::json!({
        "status": "success",
        "cart": cart,
    }))
}

pub async fn get_rye_cart_details(
    state: &AppState,
    args: serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let cart_id = CartId(required_str(&args, "cart_id")?.to_string());

    let cart = state.carts.get_cart(&cart_id).await?;

    Ok(serde_json::json!({
        "status": "success",
        "cart": cart,
    }))
}

pub async fn checkout_amazon_cart(
    state: &AppState,
    args: serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let cart_id = CartId(required_str(&args, "cart_id")?.to_string());
    let buyer: BuyerInfo = serde_json::from_value(
        args.get("buyer_info")
            .cloned()
            .ok_or_else(|| ToolError::BadInput("Missing 'buyer_info' parameter".to_string()))?,
    )
    .map_err(|e| ToolError::BadInput(format!("Invalid 'buyer_info': {e}")))?;

    let outcome = state.coordinator.checkout(&cart_id, &buyer).await?;

    // All four outcomes are answers, not errors; NeedsConfirmation hands
    // the decision back to the caller with the figures it needs.
    let payload = serde_json::to_value(&outcome).map_err(|e| {
        ToolError::App(ApplicationError::Integration(format!(
            "encode checkout outcome: {e}"
        )))
    })?;
    let status = match outcome {
        CheckoutOutcome::Completed { .. } => "success",
        CheckoutOutcome::NeedsConfirmation { .. } => "needs_confirmation",
        CheckoutOutcome::Declined { .. } => "declined",
        CheckoutOutcome::Incomplete { .. } => "incomplete",
    };

    let mut result = serde_json::json!({ "status": status });
    if let serde_json::Value::Object(fields) = payload {
        for (key, value) in fields {
            result[key] = value;
        }
    }
    Ok(result)
}

pub async fn list_my_purchases(
    state: &AppState,
    args: serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let user_id = UserId(required_str(&args, "user_identifier")?.to_string());
    let limit = match args.get("limit") {
        None | Some(serde_json::Value::Null) => None,
        Some(value) => Some(
            value
                .as_i64()
                .ok_or_else(|| ToolError::BadInput("'limit' must be an integer".to_string()))?,
        ),
    };

    let purchases = state.history.list(&user_id, limit).await?;
    let chain = state.history.verify(&user_id).await?;

    Ok(serde_json::json!({
        "status": "success",
        "user_identifier": user_id,
        "purchases": purchases,
        "chain": {
            "valid": chain.valid,
            "verified_entries": chain.verified_entries,
            "latest_hash": chain.latest_hash,
        },
    }))
}

pub async fn set_spending_limit(
    state: &AppState,
    args: serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let user_id = UserId(required_str(&args, "user_identifier")?.to_string());
    let limit_value = decimal_arg(&args, "limit_value")?;
    let on_limit = match args.get("on_limit").and_then(|value| value.as_str()) {
        None => state.default_on_limit,
        Some(text) => OverLimitPolicy::parse(text).ok_or_else(|| {
            ToolError::BadInput(format!(
                "'on_limit' must be 'reject' or 'confirm', got '{text}'"
            ))
        })?,
    };

    state.ledger.set_limit(&user_id, limit_value, on_limit).await?;

    Ok(serde_json::json!({
        "status": "success",
        "user_identifier": user_id,
        "limit_value": limit_value,
        "on_limit": on_limit.as_str(),
    }))
}

pub async fn get_spending_status(
    state: &AppState,
    args: serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let user_id = UserId(required_str(&args, "user_identifier")?.to_string());

    let status = state.ledger.status(&user_id).await?;

    Ok(serde_json::json!({
        "status": "success",
        "user_identifier": status.user_id,
        "spending_limit": status.limit,
        "total_spent": status.spent,
        "reserved": status.reserved,
        "remaining_limit": status.remaining(),
        "on_limit": status.on_limit.as_str(),
        "advice": spending_advice(&status.limit, status.spent),
    }))
}

fn spending_advice(limit: &Option<Decimal>, spent: Decimal) -> &'static str {
    match limit {
        Some(limit) if spent >= *limit => {
            "Whoa, you've hit or exceeded your spending limit! Time for some anti-retail therapy."
        }
        Some(limit) if spent >= *limit * Decimal::new(9, 1) => {
            "You're getting close to your limit, maybe take a breath before splurging more."
        }
        _ => "All clear! You have room to spend.",
    }
}
