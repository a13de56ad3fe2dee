//! Noop - passthrough

use async_trait::async_trait;
use mel_engine::graph::Node;
use mel_engine::{Envelope, ExecutionContext, NodeDefinition, NodeError, NodeOutput, NodeType};

pub struct NoopNode;

#[async_trait]
impl NodeType for NoopNode {
    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("noop", "No Operation", "Utility").with_icon("circle")
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        _node: &Node,
        envelope: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::single(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use serde_json::json;

    #[tokio::test]
    async fn test_passthrough() {
        let ctx = testing::ctx();
        let node = testing::node("noop", vec![]);
        let input = testing::envelope(json!({"keep": 1}));

        let output = NoopNode.execute(&ctx, &node, input.clone()).await.unwrap();
        assert_eq!(output.output.data, input.data);
    }
}
