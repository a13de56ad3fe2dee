//! Inject - entry point emitting a configured payload

use async_trait::async_trait;
use mel_engine::graph::Node;
use mel_engine::{
    Envelope, ExecutionContext, NodeDefinition, NodeError, NodeOutput, NodeType,
};
use mel_engine::node::{ParameterDef, ParameterKind};

/// Entry-point node. When a `payload` parameter is configured it replaces the
/// run input as the emitted data; otherwise the run input passes through.
pub struct InjectNode;

#[async_trait]
impl NodeType for InjectNode {
    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("inject", "Inject", "Triggers")
            .with_icon("zap")
            .entry_point()
            .with_parameters(vec![ParameterDef::new("payload", ParameterKind::Json)
                .with_label("Payload")
                .with_description("Data emitted to successors; defaults to the run input")])
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        node: &Node,
        envelope: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        let output = match node.param("payload") {
            Some(payload) => envelope.with_data(payload.clone()),
            None => envelope,
        };
        Ok(NodeOutput::single(output))
    }
}
