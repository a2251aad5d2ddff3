//! Rye GraphQL client for Amazon product tracking, carts, and checkout.
//!
//! Prices come back from Rye in minor units (cents); everything is
//! converted to `Decimal` major units at this boundary so the rest of the
//! system never sees cents.

use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use poltergeist_core::checkout::{BuyerInfo, CommerceProvider, ProviderError, ProviderReceipt};
use poltergeist_core::config::RyeConfig;
use poltergeist_core::domain::cart::{Cart, CartId, CartLine, CartStatus};
use poltergeist_core::domain::product::{Product, ProductId};

use crate::error::{CommerceError, GraphQLErrorDetail};

const TRACK_PRODUCT: &str = "
mutation RequestAmazonProductByURL($input: RequestAmazonProductByURLInput!) {
    requestAmazonProductByURL(input: $input) {
        productId
    }
}";

const PRODUCT_DETAILS: &str = "
query ProductDetails($input: ProductByIDInput!) {
    product: productByID(input: $input) {
        title
        url
        isAvailable
        price { displayValue value currency }
        images { url }
        ... on AmazonProduct {
            ASIN
        }
    }
}";

const CREATE_CART: &str = "
mutation CreateCart($input: CartCreateInput!) {
    createCart(input: $input) {
        cart {
            id
            cost {
                subtotal { value displayValue currency }
            }
            stores {
                ... on AmazonStore {
                    cartLines {
                        quantity
                        product {
                            id
                            title
                            price { value currency }
                        }
                    }
                    errors { code message }
                }
            }
        }
        errors { code message }
    }
}";

const GET_CART: &str = "
query GetCart($id: ID!) {
    getCart(id: $id) {
        cart {
            id
            cost {
                subtotal { value displayValue currency }
            }
            stores {
                ... on AmazonStore {
                    cartLines {
                        quantity
                        product {
                            id
                            title
                            price { value currency }
                        }
                    }
                    errors { code message }
                }
            }
        }
        errors { code message }
    }
}";

const SUBMIT_CART: &str = "
mutation SubmitCart($input: CartSubmitInput!) {
    submitCart(input: $input) {
        cart {
            id
            stores {
                ... on AmazonStore {
                    status
                    requestId
                    errors { code message }
                }
            }
        }
        errors { code message }
    }
}";

#[derive(Clone)]
pub struct RyeClient {
    http: reqwest::Client,
    endpoint: String,
    auth_header: SecretString,
    shopper_ip: String,
}

impl RyeClient {
    pub fn new(config: &RyeConfig) -> Result<Self, CommerceError> {
        let http =
            reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build()?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            auth_header: config.auth_header.clone(),
            shopper_ip: config.shopper_ip.clone(),
        })
    }

    /// Ask Rye to start tracking an Amazon product. Returns the provider's
    /// product id (the ASIN for Amazon items).
    pub async fn request_product_tracking(
        &self,
        product_url: &str,
    ) -> Result<ProductId, CommerceError> {
        let data: TrackData =
            self.execute(TRACK_PRODUCT, json!({ "input": { "url": product_url } })).await?;

        let product_id = data
            .request
            .and_then(|payload| payload.product_id)
            .ok_or_else(|| CommerceError::MissingData("productId absent from Rye response".to_string()))?;

        Ok(ProductId(product_id))
    }

    pub async fn product_details(&self, product_id: &ProductId) -> Result<Product, CommerceError> {
        let data: ProductData = self
            .execute(
                PRODUCT_DETAILS,
                json!({ "input": { "id": product_id.0, "marketplace": "AMAZON" } }),
            )
            .await?;

        let payload = data
            .product
            .ok_or_else(|| CommerceError::MissingData(format!("product `{product_id}` not found")))?;

        product_from_payload(product_id.clone(), payload)
    }

    pub async fn create_cart(
        &self,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<Cart, CommerceError> {
        let input = json!({
            "items": {
                "amazonCartItemsInput": [
                    { "quantity": quantity, "productId": product_id.0 }
                ]
            }
        });
        let data: CreateCartData = self.execute(CREATE_CART, json!({ "input": input })).await?;
        cart_from_envelope(data.create_cart, "createCart")
    }

    pub async fn cart_details(&self, cart_id: &CartId) -> Result<Cart, CommerceError> {
        let data: GetCartData = self.execute(GET_CART, json!({ "id": cart_id.0 })).await?;
        cart_from_envelope(data.get_cart, "getCart")
    }

    pub async fn submit_cart(
        &self,
        cart_id: &CartId,
        buyer: &BuyerInfo,
    ) -> Result<ProviderReceipt, CommerceError> {
        let input = json!({
            "id": cart_id.0,
            "buyerIdentity": {
                "email": buyer.email,
                "firstName": buyer.first_name,
                "lastName": buyer.last_name,
                "address1": buyer.address_line1,
                "city": buyer.city,
                "provinceCode": buyer.state,
                "postalCode": buyer.postal_code,
                "countryCode": buyer.country,
                "phone": buyer.phone,
            }
        });

        let data: SubmitCartData = self.execute(SUBMIT_CART, json!({ "input": input })).await?;
        receipt_from_payload(cart_id, data.submit_cart)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<T, CommerceError> {
        debug!(endpoint = %self.endpoint, "rye graphql request");

        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", self.auth_header.expose_secret())
            .header("Rye-Shopper-IP", &self.shopper_ip)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?
            .error_for_status()?;

        let envelope: GraphQLResponse<T> = response.json().await?;
        if let Some(errors) = envelope.errors {
            if !errors.is_empty() {
                return Err(CommerceError::GraphQL(errors));
            }
        }

        envelope
            .data
            .ok_or_else(|| CommerceError::MissingData("GraphQL response had no data".to_string()))
    }
}

#[async_trait::async_trait]
impl CommerceProvider for RyeClient {
    async fn fetch_cart(&self, cart_id: &CartId) -> Result<Cart, ProviderError> {
        self.cart_details(cart_id).await.map_err(ProviderError::from)
    }

    async fn submit_checkout(
        &self,
        cart_id: &CartId,
        buyer: &BuyerInfo,
    ) -> Result<ProviderReceipt, ProviderError> {
        self.submit_cart(cart_id, buyer).await.map_err(ProviderError::from)
    }
}

#[derive(Debug, Deserialize)]
struct GraphQLResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQLErrorDetail>>,
}

#[derive(Debug, Deserialize)]
struct TrackData {
    #[serde(rename = "requestAmazonProductByURL")]
    request: Option<TrackPayload>,
}

#[derive(Debug, Deserialize)]
struct TrackPayload {
    #[serde(rename = "productId")]
    product_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProductData {
    product: Option<ProductPayload>,
}

#[derive(Debug, Deserialize)]
struct ProductPayload {
    title: String,
    url: String,
    #[serde(rename = "isAvailable")]
    is_available: bool,
    price: Option<MoneyPayload>,
    #[serde(default)]
    images: Vec<ImagePayload>,
    #[serde(rename = "ASIN")]
    asin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MoneyPayload {
    /// Minor units (cents).
    value: i64,
    #[serde(rename = "displayValue")]
    display_value: Option<String>,
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImagePayload {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateCartData {
    #[serde(rename = "createCart")]
    create_cart: Option<CartEnvelope>,
}

#[derive(Debug, Deserialize)]
struct GetCartData {
    #[serde(rename = "getCart")]
    get_cart: Option<CartEnvelope>,
}

#[derive(Debug, Deserialize)]
struct CartEnvelope {
    cart: Option<CartPayload>,
    #[serde(default)]
    errors: Vec<OperationError>,
}

#[derive(Debug, Deserialize)]
struct CartPayload {
    id: String,
    cost: Option<CostPayload>,
    #[serde(default)]
    stores: Vec<StorePayload>,
}

#[derive(Debug, Deserialize)]
struct CostPayload {
    subtotal: Option<MoneyPayload>,
}

#[derive(Debug, Deserialize)]
struct StorePayload {
    #[serde(rename = "cartLines", default)]
    cart_lines: Vec<CartLinePayload>,
    #[serde(default)]
    errors: Vec<OperationError>,
}

#[derive(Debug, Deserialize)]
struct CartLinePayload {
    quantity: u32,
    product: LineProductPayload,
}

#[derive(Debug, Deserialize)]
struct LineProductPayload {
    id: String,
    title: String,
    price: Option<MoneyPayload>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitCartData {
    #[serde(rename = "submitCart")]
    submit_cart: Option<SubmitEnvelope>,
}

#[derive(Debug, Deserialize)]
struct SubmitEnvelope {
    cart: Option<SubmitCartPayload>,
    #[serde(default)]
    errors: Vec<OperationError>,
}

#[derive(Debug, Deserialize)]
struct SubmitCartPayload {
    id: String,
    #[serde(default)]
    stores: Vec<SubmitStorePayload>,
}

#[derive(Debug, Deserialize)]
struct SubmitStorePayload {
    status: Option<String>,
    #[serde(rename = "requestId")]
    request_id: Option<String>,
    #[serde(default)]
    errors: Vec<OperationError>,
}

fn cents_to_decimal(value: i64) -> Decimal {
    Decimal::new(value, 2)
}

fn first_operation_error(errors: &[OperationError]) -> Option<CommerceError> {
    errors.first().map(|error| CommerceError::Store {
        code: error.code.clone().unwrap_or_else(|| "UNKNOWN".to_string()),
        message: error.message.clone().unwrap_or_else(|| "no message".to_string()),
    })
}

fn product_from_payload(id: ProductId, payload: ProductPayload) -> Result<Product, CommerceError> {
    let price = payload
        .price
        .as_ref()
        .ok_or_else(|| CommerceError::MissingData(format!("product `{id}` has no price")))?;

    let mut metadata = serde_json::Map::new();
    if let Some(asin) = &payload.asin {
        metadata.insert("asin".to_string(), Value::String(asin.clone()));
    }
    if let Some(display) = &price.display_value {
        metadata.insert("display_price".to_string(), Value::String(display.clone()));
    }

    Ok(Product {
        id,
        url: payload.url,
        title: payload.title,
        price: cents_to_decimal(price.value),
        currency: price.currency.clone().unwrap_or_else(|| "USD".to_string()),
        available: payload.is_available,
        images: payload.images.into_iter().filter_map(|image| image.url).collect(),
        metadata: Value::Object(metadata),
        fetched_at: Utc::now(),
    })
}

fn cart_from_envelope(
    envelope: Option<CartEnvelope>,
    operation: &str,
) -> Result<Cart, CommerceError> {
    let envelope = envelope
        .ok_or_else(|| CommerceError::MissingData(format!("`{operation}` payload missing")))?;

    if let Some(error) = first_operation_error(&envelope.errors) {
        return Err(error);
    }

    let payload = envelope
        .cart
        .ok_or_else(|| CommerceError::MissingData(format!("`{operation}` returned no cart")))?;

    for store in &payload.stores {
        if let Some(error) = first_operation_error(&store.errors) {
            return Err(error);
        }
    }

    let lines: Vec<CartLine> = payload
        .stores
        .iter()
        .flat_map(|store| &store.cart_lines)
        .map(|line| CartLine {
            product_id: ProductId(line.product.id.clone()),
            title: line.product.title.clone(),
            quantity: line.quantity,
            unit_price: line
                .product
                .price
                .as_ref()
                .map(|price| cents_to_decimal(price.value))
                .unwrap_or(Decimal::ZERO),
        })
        .collect();

    if lines.is_empty() {
        return Err(CommerceError::MissingData(format!(
            "`{operation}` returned a cart with no lines"
        )));
    }

    let (subtotal, currency) = match payload.cost.as_ref().and_then(|cost| cost.subtotal.as_ref())
    {
        Some(subtotal) => (
            cents_to_decimal(subtotal.value),
            subtotal.currency.clone().unwrap_or_else(|| "USD".to_string()),
        ),
        // Rye occasionally omits cost while the cart settles; fall back to
        // summing the lines.
        None => (
            lines.iter().map(|line| line.unit_price * Decimal::from(line.quantity)).sum(),
            "USD".to_string(),
        ),
    };

    Ok(Cart {
        id: CartId(payload.id),
        lines,
        subtotal,
        currency,
        status: CartStatus::Open,
    })
}

fn receipt_from_payload(
    cart_id: &CartId,
    envelope: Option<SubmitEnvelope>,
) -> Result<ProviderReceipt, CommerceError> {
    let envelope = envelope
        .ok_or_else(|| CommerceError::MissingData("`submitCart` payload missing".to_string()))?;

    if let Some(error) = first_operation_error(&envelope.errors) {
        return Err(error);
    }

    let payload = envelope
        .cart
        .ok_or_else(|| CommerceError::MissingData("`submitCart` returned no cart".to_string()))?;

    let mut reference = payload.id.clone();
    for store in &payload.stores {
        if let Some(error) = first_operation_error(&store.errors) {
            return Err(error);
        }
        if let Some(status) = &store.status {
            if status.eq_ignore_ascii_case("FAILED") {
                return Err(CommerceError::Store {
                    code: "SUBMIT_FAILED".to_string(),
                    message: format!("store reported status `{status}` for cart `{cart_id}`"),
                });
            }
        }
        if let Some(request_id) = &store.request_id {
            reference = request_id.clone();
        }
    }

    let raw = serde_json::to_value(RawReceipt {
        cart_id: payload.id,
        stores: payload
            .stores
            .into_iter()
            .map(|store| RawReceiptStore { status: store.status, request_id: store.request_id })
            .collect(),
    })
    .unwrap_or(Value::Null);

    Ok(ProviderReceipt { reference, raw })
}

#[derive(serde::Serialize)]
struct RawReceipt {
    cart_id: String,
    stores: Vec<RawReceiptStore>,
}

#[derive(serde::Serialize)]
struct RawReceiptStore {
    status: Option<String>,
    request_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use serde_json::json;

    use poltergeist_core::domain::cart::CartId;
    use poltergeist_core::domain::product::ProductId;

    use super::{
        cart_from_envelope, product_from_payload, receipt_from_payload, CartEnvelope, ProductData,
        SubmitCartData,
    };
    use crate::error::CommerceError;

    fn decode_cart(value: serde_json::Value) -> Option<CartEnvelope> {
        serde_json::from_value(value).expect("decode cart envelope")
    }

    #[test]
    fn product_payload_converts_cents_to_decimal() {
        let data: ProductData = serde_json::from_value(json!({
            "product": {
                "title": "Anker USB-C Cable",
                "url": "https://www.amazon.com/dp/B07H1V6RMC",
                "isAvailable": true,
                "price": { "displayValue": "$13.99", "value": 1399, "currency": "USD" },
                "images": [{ "url": "https://m.media-amazon.com/images/1.jpg" }],
                "ASIN": "B07H1V6RMC"
            }
        }))
        .expect("decode product data");

        let product =
            product_from_payload(ProductId("B07H1V6RMC".to_string()), data.product.expect("present"))
                .expect("map product");

        assert_eq!(product.price, Decimal::new(13_99, 2));
        assert_eq!(product.currency, "USD");
        assert!(product.available);
        assert_eq!(product.images.len(), 1);
        assert_eq!(product.metadata["asin"], "B07H1V6RMC");
    }

    #[test]
    fn cart_envelope_maps_lines_and_subtotal() {
        let envelope = decode_cart(json!({
            "cart": {
                "id": "cart-abc",
                "cost": { "subtotal": { "value": 2798, "displayValue": "$27.98", "currency": "USD" } },
                "stores": [{
                    "cartLines": [{
                        "quantity": 2,
                        "product": {
                            "id": "B07H1V6RMC",
                            "title": "Anker USB-C Cable",
                            "price": { "value": 1399, "currency": "USD" }
                        }
                    }],
                    "errors": []
                }]
            },
            "errors": []
        }));

        let cart = cart_from_envelope(envelope, "getCart").expect("map cart");
        assert_eq!(cart.id, CartId("cart-abc".to_string()));
        assert_eq!(cart.subtotal, Decimal::new(27_98, 2));
        assert_eq!(cart.lines.len(), 1);
        assert_eq!(cart.lines[0].quantity, 2);
        assert_eq!(cart.lines[0].unit_price, Decimal::new(13_99, 2));
    }

    #[test]
    fn empty_cart_is_an_error() {
        let envelope = decode_cart(json!({
            "cart": { "id": "cart-abc", "cost": null, "stores": [] },
            "errors": []
        }));

        assert!(matches!(
            cart_from_envelope(envelope, "createCart"),
            Err(CommerceError::MissingData(_))
        ));
    }

    #[test]
    fn store_level_error_surfaces_with_code() {
        let envelope = decode_cart(json!({
            "cart": {
                "id": "cart-abc",
                "cost": null,
                "stores": [{
                    "cartLines": [],
                    "errors": [{ "code": "PRODUCT_NOT_FOUND", "message": "unknown ASIN" }]
                }]
            },
            "errors": []
        }));

        match cart_from_envelope(envelope, "createCart") {
            Err(CommerceError::Store { code, .. }) => assert_eq!(code, "PRODUCT_NOT_FOUND"),
            other => panic!("expected store error, got {other:?}"),
        }
    }

    #[test]
    fn submit_receipt_prefers_request_id() {
        let data: SubmitCartData = serde_json::from_value(json!({
            "submitCart": {
                "cart": {
                    "id": "cart-abc",
                    "stores": [{ "status": "COMPLETED", "requestId": "req-42", "errors": [] }]
                },
                "errors": []
            }
        }))
        .expect("decode submit data");

        let receipt = receipt_from_payload(&CartId("cart-abc".to_string()), data.submit_cart)
            .expect("map receipt");
        assert_eq!(receipt.reference, "req-42");
        assert_eq!(receipt.raw["cart_id"], "cart-abc");
    }

    #[test]
    fn failed_submit_status_is_an_error() {
        let data: SubmitCartData = serde_json::from_value(json!({
            "submitCart": {
                "cart": {
                    "id": "cart-abc",
                    "stores": [{ "status": "FAILED", "requestId": null, "errors": [] }]
                },
                "errors": []
            }
        }))
        .expect("decode submit data");

        assert!(matches!(
            receipt_from_payload(&CartId("cart-abc".to_string()), data.submit_cart),
            Err(CommerceError::Store { .. })
        ));
    }
}
