//! If - two-way branch on an expression

use async_trait::async_trait;
use mel_engine::graph::Node;
use mel_engine::node::{ParameterDef, ParameterKind};
use mel_engine::{Envelope, ExecutionContext, NodeDefinition, NodeError, NodeOutput, NodeType};

use crate::expr;

/// Branching node firing `true` or `false` depending on the `condition`
/// expression. An expression that fails to evaluate fires `else` with the
/// error recorded on the envelope, so graphs can wire an error branch.
pub struct IfNode;

#[async_trait]
impl NodeType for IfNode {
    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("if", "If", "Logic")
            .with_icon("git-branch")
            .branching(vec!["true", "false", "else"])
            .with_parameters(vec![ParameterDef::new("condition", ParameterKind::String)
                .required()
                .with_label("Condition")
                .with_description("Expression over { input, variables, meta }")])
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        node: &Node,
        envelope: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        let condition = node.string_param("condition")?;

        match expr::eval_bool(&condition, &envelope) {
            Ok(true) => Ok(NodeOutput::routed(envelope, vec!["true".to_string()])),
            Ok(false) => Ok(NodeOutput::routed(envelope, vec!["false".to_string()])),
            Err(error) => {
                let mut envelope = envelope;
                envelope.add_error(&node.id, error.to_string(), None);
                Ok(NodeOutput::routed(envelope, vec!["else".to_string()]))
            }
        }
    }
}
