//! SetVariable - writes a run variable visible downstream

use async_trait::async_trait;
use mel_engine::graph::Node;
use mel_engine::node::{ParameterDef, ParameterKind};
use mel_engine::{Envelope, ExecutionContext, NodeDefinition, NodeError, NodeOutput, NodeType};

/// Stores `value` under `name` in the envelope's variables and passes the
/// data through. Successors (and their expressions) see the variable.
pub struct SetVariableNode;

#[async_trait]
impl NodeType for SetVariableNode {
    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("set_variable", "Set Variable", "Data")
            .with_icon("tag")
            .with_parameters(vec![
                ParameterDef::new("name", ParameterKind::String)
                    .required()
                    .with_label("Name"),
                ParameterDef::new("value", ParameterKind::Json)
                    .required()
                    .with_label("Value"),
            ])
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        node: &Node,
        envelope: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        let name = node.string_param("name")?;
        let value = node
            .param("value")
            .cloned()
            .ok_or_else(|| NodeError::validation("missing required parameter: value"))?;

        let mut envelope = envelope;
        envelope.variables.insert(name, value);
        Ok(NodeOutput::single(envelope))
    }
}
