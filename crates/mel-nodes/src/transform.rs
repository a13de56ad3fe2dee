//! Transform - template rendering over the envelope

use async_trait::async_trait;
use mel_engine::graph::Node;
use mel_engine::node::{ParameterDef, ParameterKind};
use mel_engine::{Envelope, ExecutionContext, NodeDefinition, NodeError, NodeOutput, NodeType};

use crate::expr;

/// Renders the `expression` template against `{ input, variables, meta }`.
/// When the rendered text parses as JSON the parsed value becomes the output
/// data, otherwise the raw string does.
pub struct TransformNode;

#[async_trait]
impl NodeType for TransformNode {
    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("transform", "Transform", "Data")
            .with_icon("repeat")
            .with_parameters(vec![ParameterDef::new("expression", ParameterKind::String)
                .required()
                .with_label("Expression")
                .with_description("Template rendered against the input envelope")])
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        node: &Node,
        envelope: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        let template = node.string_param("expression")?;
        let rendered = expr::render(&template, &envelope)?;

        let data = serde_json::from_str(&rendered)
            .unwrap_or(serde_json::Value::String(rendered));

        Ok(NodeOutput::single(envelope.with_data(data)))
    }
}
