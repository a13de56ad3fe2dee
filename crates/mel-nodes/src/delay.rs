//! Delay - cancellation-aware sleep

use std::time::Duration;

use async_trait::async_trait;
use mel_engine::graph::Node;
use mel_engine::node::{ParameterDef, ParameterKind};
use mel_engine::{Envelope, ExecutionContext, NodeDefinition, NodeError, NodeOutput, NodeType};

/// Sleeps for `duration` (integer milliseconds or `500ms`/`10s`/`2m`) then
/// passes the envelope through. Cancelling the run interrupts the sleep.
pub struct DelayNode;

fn parse_duration(value: &serde_json::Value) -> Result<Duration, NodeError> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(Duration::from_millis)
            .ok_or_else(|| NodeError::validation("duration must be a non-negative integer")),
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Some(ms) = s.strip_suffix("ms") {
                ms.trim()
                    .parse()
                    .map(Duration::from_millis)
                    .map_err(|_| NodeError::validation(format!("invalid duration: {s}")))
            } else if let Some(secs) = s.strip_suffix('s') {
                secs.trim()
                    .parse()
                    .map(Duration::from_secs)
                    .map_err(|_| NodeError::validation(format!("invalid duration: {s}")))
            } else if let Some(mins) = s.strip_suffix('m') {
                mins.trim()
                    .parse::<u64>()
                    .map(|m| Duration::from_secs(m * 60))
                    .map_err(|_| NodeError::validation(format!("invalid duration: {s}")))
            } else {
                Err(NodeError::validation(format!("invalid duration: {s}")))
            }
        }
        other => Err(NodeError::validation(format!(
            "duration must be milliseconds or a suffixed string, got {other}"
        ))),
    }
}

#[async_trait]
impl NodeType for DelayNode {
    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("delay", "Delay", "Utility")
            .with_icon("clock")
            .with_parameters(vec![ParameterDef::new("duration", ParameterKind::String)
                .required()
                .with_label("Duration")
                .with_description("How long to wait, e.g. 500ms, 10s, 2m")])
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        node: &Node,
        envelope: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        let duration = parse_duration(
            node.param("duration")
                .ok_or_else(|| NodeError::validation("missing required parameter: duration"))?,
        )?;

        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(NodeOutput::single(envelope)),
            _ = ctx.cancelled() => Err(NodeError::Cancelled),
        }
    }
}
