//! HttpRequest - outbound HTTP call
//!
//! Transport failures and 408/429/5xx responses are transient (retried with
//! backoff); other 4xx responses are permanent.

use async_trait::async_trait;
use mel_engine::graph::Node;
use mel_engine::node::{ParameterDef, ParameterKind, ParameterOption};
use mel_engine::{Envelope, ExecutionContext, NodeDefinition, NodeError, NodeOutput, NodeType};
use serde_json::json;

use crate::expr;

pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl HttpRequestNode {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeType for HttpRequestNode {
    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("http_request", "HTTP Request", "Network")
            .with_icon("globe")
            .with_parameters(vec![
                ParameterDef::new("url", ParameterKind::String)
                    .required()
                    .with_label("URL")
                    .with_description("Request URL; templates are rendered against the envelope"),
                ParameterDef::new("method", ParameterKind::Enum)
                    .with_label("Method")
                    .with_default(json!("GET"))
                    .with_options(vec![
                        ParameterOption::new("GET", "GET"),
                        ParameterOption::new("POST", "POST"),
                        ParameterOption::new("PUT", "PUT"),
                        ParameterOption::new("PATCH", "PATCH"),
                        ParameterOption::new("DELETE", "DELETE"),
                    ]),
                ParameterDef::new("headers", ParameterKind::Object)
                    .with_label("Headers")
                    .with_group("Request"),
                ParameterDef::new("body", ParameterKind::Json)
                    .with_label("Body")
                    .with_group("Request"),
                ParameterDef::new("timeout_ms", ParameterKind::Integer)
                    .with_label("Timeout (ms)")
                    .with_default(json!(30_000))
                    .with_group("Request"),
            ])
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        node: &Node,
        envelope: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        let url = expr::render(&node.string_param("url")?, &envelope)?;
        let method_name = node.string_param_or("method", "GET")?;
        let method = reqwest::Method::from_bytes(method_name.to_uppercase().as_bytes())
            .map_err(|_| NodeError::validation(format!("invalid method: {method_name}")))?;
        let timeout_ms = node.i64_param_or("timeout_ms", 30_000)?.max(1) as u64;

        let mut request = self
            .client
            .request(method, &url)
            .timeout(std::time::Duration::from_millis(timeout_ms));

        if let Some(serde_json::Value::Object(headers)) = node.param("headers") {
            for (name, value) in headers {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                request = request.header(name, value);
            }
        }
        if let Some(body) = node.param("body") {
            request = request.json(body);
        }

        let response = tokio::select! {
            result = request.send() => result.map_err(|e| {
                // Connection refused, DNS, timeout: all worth retrying.
                NodeError::transient(format!("request to {url} failed: {e}"))
            })?,
            _ = ctx.cancelled() => return Err(NodeError::Cancelled),
        };

        let status = response.status();
        let headers: serde_json::Map<String, serde_json::Value> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    json!(value.to_str().unwrap_or_default()),
                )
            })
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| NodeError::transient(format!("reading response body failed: {e}")))?;
        let body: serde_json::Value =
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));

        if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            return Err(NodeError::transient(format!("{url} returned {status}")));
        }
        if status.is_client_error() {
            return Err(NodeError::permanent(format!("{url} returned {status}")));
        }

        let output = envelope.with_data(json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        }));
        Ok(NodeOutput::single(output))
    }
}
