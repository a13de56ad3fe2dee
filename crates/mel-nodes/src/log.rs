//! Log - structured logging passthrough

use async_trait::async_trait;
use mel_engine::graph::Node;
use mel_engine::node::{ParameterDef, ParameterKind, ParameterOption};
use mel_engine::{Envelope, ExecutionContext, NodeDefinition, NodeError, NodeOutput, NodeType};

use crate::expr;

/// Logs the envelope data (or a rendered `message` template) at the
/// configured level, then passes the envelope through unchanged.
pub struct LogNode;

#[async_trait]
impl NodeType for LogNode {
    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("log", "Log", "Utility")
            .with_icon("file-text")
            .with_parameters(vec![
                ParameterDef::new("level", ParameterKind::Enum)
                    .with_label("Level")
                    .with_default(serde_json::Value::String("info".to_string()))
                    .with_options(vec![
                        ParameterOption::new("debug", "Debug"),
                        ParameterOption::new("info", "Info"),
                        ParameterOption::new("warn", "Warn"),
                        ParameterOption::new("error", "Error"),
                    ]),
                ParameterDef::new("message", ParameterKind::String)
                    .with_label("Message")
                    .with_description("Optional template; defaults to the envelope data"),
            ])
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        node: &Node,
        envelope: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        let message = match node.param("message") {
            Some(serde_json::Value::String(template)) => expr::render(template, &envelope)?,
            _ => envelope.data.to_string(),
        };

        let level = node.string_param_or("level", "info")?;
        match level.as_str() {
            "debug" => tracing::debug!(run_id = %ctx.run_id, node_id = %node.id, "{message}"),
            "warn" => tracing::warn!(run_id = %ctx.run_id, node_id = %node.id, "{message}"),
            "error" => tracing::error!(run_id = %ctx.run_id, node_id = %node.id, "{message}"),
            _ => tracing::info!(run_id = %ctx.run_id, node_id = %node.id, "{message}"),
        }

        Ok(NodeOutput::single(envelope))
    }
}
