//! ForEach - fan-out, one successor per array element

use async_trait::async_trait;
use mel_engine::graph::Node;
use mel_engine::node::{ParameterDef, ParameterKind};
use mel_engine::{Envelope, ExecutionContext, NodeDefinition, NodeError, NodeOutput, NodeType};

use crate::expr;

/// Selects an array via the `items` expression (default: the whole input)
/// and emits one successor envelope per element, with the element index
/// recorded for the child trace.
pub struct ForEachNode;

#[async_trait]
impl NodeType for ForEachNode {
    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("for_each", "For Each", "Logic")
            .with_icon("list")
            .with_parameters(vec![ParameterDef::new("items", ParameterKind::String)
                .with_label("Items")
                .with_default(serde_json::Value::String("input".to_string()))
                .with_description("Expression selecting the array to iterate")])
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        node: &Node,
        envelope: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        let selector = node.string_param_or("items", "input")?;
        let selected = expr::eval(&selector, &envelope)?;

        let serde_json::Value::Array(elements) = selected else {
            return Err(NodeError::validation(format!(
                "for_each selector {selector} did not produce an array"
            )));
        };

        let children = elements
            .iter()
            .enumerate()
            .map(|(index, element)| {
                let mut child = envelope.fork().with_data(element.clone());
                child.set_loop_index(index as u64);
                child
            })
            .collect();

        Ok(NodeOutput::fan_out(
            envelope.with_data(serde_json::Value::Array(elements)),
            children,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use mel_engine::Routing;
    use serde_json::json;

    #[tokio::test]
    async fn test_fans_out_per_element() {
        let ctx = testing::ctx();
        let node = testing::node("for_each", vec![("items", json!("input.items"))]);
        let input = testing::envelope(json!({"items": ["a", "b", "c"]}));

        let output = ForEachNode.execute(&ctx, &node, input).await.unwrap();
        let Routing::FanOut(children) = output.routing else {
            panic!("expected fan-out routing");
        };

        assert_eq!(children.len(), 3);
        assert_eq!(children[0].data, json!("a"));
        assert_eq!(children[0].loop_index(), Some(0));
        assert_eq!(children[2].data, json!("c"));
        assert_eq!(children[2].loop_index(), Some(2));
    }

    #[tokio::test]
    async fn test_defaults_to_whole_input() {
        let ctx = testing::ctx();
        let node = testing::node("for_each", vec![]);
        let input = testing::envelope(json!([1, 2]));

        let output = ForEachNode.execute(&ctx, &node, input).await.unwrap();
        assert!(matches!(output.routing, Routing::FanOut(ref c) if c.len() == 2));
    }

    #[tokio::test]
    async fn test_non_array_is_validation_error() {
        let ctx = testing::ctx();
        let node = testing::node("for_each", vec![]);
        let input = testing::envelope(json!({"not": "an array"}));

        let result = ForEachNode.execute(&ctx, &node, input).await;
        assert!(matches!(result, Err(NodeError::Validation(_))));
    }

    #[tokio::test]
    async fn test_empty_array_fans_out_nothing() {
        let ctx = testing::ctx();
        let node = testing::node("for_each", vec![]);
        let input = testing::envelope(json!([]));

        let output = ForEachNode.execute(&ctx, &node, input).await.unwrap();
        assert!(matches!(output.routing, Routing::FanOut(ref c) if c.is_empty()));
    }
}
