//! Request dispatch and the stdio serve loop.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::protocol::{
    tool_result, JsonRpcRequest, JsonRpcResponse, Tool, METHOD_NOT_FOUND, PARSE_ERROR,
    PROTOCOL_VERSION,
};
use crate::tools::{self, AppState, ToolError};

pub struct McpServer {
    state: Arc<AppState>,
}

impl McpServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Read newline-delimited JSON-RPC requests from stdin until EOF.
    /// stdout carries only protocol frames; all logging goes to stderr.
    pub async fn serve_stdio(&self) -> anyhow::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        info!("serving MCP over stdio");

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            debug!(frame = %line, "received");

            let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
                Ok(request) => {
                    // Notifications get no reply at all.
                    if request.method.starts_with("notifications/") {
                        continue;
                    }
                    self.handle_request(request).await
                }
                Err(e) => JsonRpcResponse::error(
                    serde_json::Value::Null,
                    PARSE_ERROR,
                    format!("Parse error: {e}"),
                ),
            };

            let frame = serde_json::to_string(&response)?;
            debug!(frame = %frame, "sending");
            stdout.write_all(frame.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }

        info!("stdin closed, shutting down");
        Ok(())
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        match request.method.as_str() {
            "initialize" => handle_initialize(request.id),
            "tools/list" => handle_tools_list(request.id),
            "tools/call" => self.handle_tools_call(request.id, request.params).await,
            other => JsonRpcResponse::error(
                request.id,
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ),
        }
    }

    async fn handle_tools_call(
        &self,
        id: serde_json::Value,
        params: serde_json::Value,
    ) -> JsonRpcResponse {
        let tool_name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));

        let state = &self.state;
        let result = match tool_name {
            "get_server_status" => Ok(serde_json::Value::String(
                tools::SERVER_STATUS_MESSAGE.to_string(),
            )),
            "research_products" => tools::research_products(state, arguments).await,
            "request_amazon_product_tracking" => {
                tools::request_amazon_product_tracking(state, arguments).await
            }
            "fetch_amazon_product_details" => {
                tools::fetch_amazon_product_details(state, arguments).await
            }
            "create_amazon_cart" => tools::create_amazon_cart(state, arguments).await,
            "get_rye_cart_details" => tools::get_rye_cart_details(state, arguments).await,
            "checkout_amazon_cart" => tools::checkout_amazon_cart(state, arguments).await,
            "list_my_purchases" => tools::list_my_purchases(state, arguments).await,
            "set_spending_limit" => tools::set_spending_limit(state, arguments).await,
            "get_spending_status" => tools::get_spending_status(state, arguments).await,
            other => Err(ToolError::BadInput(format!("Unknown tool: {other}"))),
        };

        match result {
            Ok(serde_json::Value::String(text)) => {
                JsonRpcResponse::success(id, tool_result(text, false))
            }
            Ok(payload) => {
                let text = match serde_json::to_string_pretty(&payload) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(tool = tool_name, "failed to encode tool payload: {e}");
                        return JsonRpcResponse::success(
                            id,
                            tool_result(format!("Error: {e}"), true),
                        );
                    }
                };
                JsonRpcResponse::success(id, tool_result(text, false))
            }
            // The agent can fix its own input, so those messages pass
            // through verbatim. Application failures are logged in full
            // under a correlation id and the client sees only the
            // sanitized interface message.
            Err(ToolError::BadInput(message)) => {
                debug!(tool = tool_name, %message, "tool rejected input");
                JsonRpcResponse::success(id, tool_result(format!("Error: {message}"), true))
            }
            Err(ToolError::App(app)) => {
                let correlation_id = format!("req-{}", Uuid::new_v4());
                error!(tool = tool_name, %correlation_id, error = %app, "tool failed");
                let interface = app.into_interface(correlation_id.clone());
                JsonRpcResponse::success(
                    id,
                    tool_result(
                        format!("Error: {} (ref {correlation_id})", interface.user_message()),
                        true,
                    ),
                )
            }
        }
    }
}

fn handle_initialize(id: serde_json::Value) -> JsonRpcResponse {
    JsonRpcResponse::success(
        id,
        serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false }
            },
            "serverInfo": {
                "name": "poltergeist",
                "version": env!("CARGO_PKG_VERSION")
            }
        }),
    )
}

fn handle_tools_list(id: serde_json::Value) -> JsonRpcResponse {
    JsonRpcResponse::success(id, serde_json::json!({ "tools": tool_descriptors() }))
}

fn tool_descriptors() -> Vec<Tool> {
    vec![
        Tool {
            name: "get_server_status",
            description: "Check that the Poltergeist purchase server is up.",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {}
            }),
        },
        Tool {
            name: "research_products",
            description: "Search the web for products matching a query and return candidate titles, URLs, and snippets.",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Free-text product search (e.g. 'usb-c hub with hdmi')"
                    }
                },
                "required": ["query"]
            }),
        },
        Tool {
            name: "request_amazon_product_tracking",
            description: "Ask the commerce provider to start tracking an Amazon product URL so it can be purchased. Returns the provider product id.",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "product_url": {
                        "type": "string",
                        "description": "Full Amazon product page URL"
                    }
                },
                "required": ["product_url"]
            }),
        },
        Tool {
            name: "fetch_amazon_product_details",
            description: "Fetch the tracked product record: title, price, availability, and images.",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "product_id": {
                        "type": "string",
                        "description": "Provider product id from request_amazon_product_tracking"
                    }
                },
                "required": ["product_id"]
            }),
        },
        Tool {
            name: "create_amazon_cart",
            description: "Create a cart containing the given product. Quantity defaults to 1.",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "product_id": {
                        "type": "string",
                        "description": "Provider product id"
                    },
                    "quantity": {
                        "type": "integer",
                        "description": "Number of units, default 1",
                        "minimum": 1
                    }
                },
                "required": ["product_id"]
            }),
        },
        Tool {
            name: "get_rye_cart_details",
            description: "Fetch the current contents, subtotal, and status of a cart.",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "cart_id": {
                        "type": "string",
                        "description": "Cart id from create_amazon_cart"
                    }
                },
                "required": ["cart_id"]
            }),
        },
        Tool {
            name: "checkout_amazon_cart",
            description: "Reserve funds against the buyer's spending limit and submit the cart for purchase. Returns the transaction record, or a confirmation request when the purchase would exceed the limit under a 'confirm' policy.",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "cart_id": {
                        "type": "string",
                        "description": "Cart id to check out"
                    },
                    "buyer_info": {
                        "type": "object",
                        "description": "Buyer details; 'email' is required and doubles as the spending-ledger user identifier",
                        "properties": {
                            "email": { "type": "string" },
                            "first_name": { "type": "string" },
                            "last_name": { "type": "string" },
                            "address_line1": { "type": "string" },
                            "city": { "type": "string" },
                            "state": { "type": "string" },
                            "postal_code": { "type": "string" },
                            "country": { "type": "string" },
                            "phone": { "type": "string" }
                        },
                        "required": ["email"]
                    }
                },
                "required": ["cart_id", "buyer_info"]
            }),
        },
        Tool {
            name: "list_my_purchases",
            description: "List a user's purchases, most recent first, with audit-chain verification.",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "user_identifier": {
                        "type": "string",
                        "description": "The buyer's identifier (their email)"
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum entries to return, default 10",
                        "minimum": 1
                    }
                },
                "required": ["user_identifier"]
            }),
        },
        Tool {
            name: "set_spending_limit",
            description: "Set a user's cumulative spending limit and what to do when a purchase would exceed it.",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "user_identifier": {
                        "type": "string",
                        "description": "The buyer's identifier (their email)"
                    },
                    "limit_value": {
                        "type": "number",
                        "description": "Limit in currency units (e.g. 150.00)"
                    },
                    "on_limit": {
                        "type": "string",
                        "enum": ["reject", "confirm"],
                        "description": "Over-limit behavior: hard-reject or pause for confirmation (default 'confirm')"
                    }
                },
                "required": ["user_identifier", "limit_value"]
            }),
        },
        Tool {
            name: "get_spending_status",
            description: "Get a user's spending limit, committed and reserved totals, remaining headroom, and an advisory message.",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "user_identifier": {
                        "type": "string",
                        "description": "The buyer's identifier (their email)"
                    }
                },
                "required": ["user_identifier"]
            }),
        },
    ]
}
