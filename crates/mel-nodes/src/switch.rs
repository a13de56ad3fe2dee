//! Switch - case match routed to a named handle

use async_trait::async_trait;
use mel_engine::graph::Node;
use mel_engine::node::{ParameterDef, ParameterKind};
use mel_engine::{Envelope, ExecutionContext, NodeDefinition, NodeError, NodeOutput, NodeType};

use crate::expr;

/// Evaluates the `value` expression and fires the case handle whose name
/// matches the stringified result; unmatched values fire `default`.
pub struct SwitchNode;

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl NodeType for SwitchNode {
    fn definition(&self) -> NodeDefinition {
        // Case handles are instance-defined, so no fixed handle list.
        NodeDefinition::new("switch", "Switch", "Logic")
            .with_icon("split")
            .branching(vec![])
            .with_parameters(vec![
                ParameterDef::new("value", ParameterKind::String)
                    .required()
                    .with_label("Value")
                    .with_description("Expression whose result selects the case"),
                ParameterDef::new("cases", ParameterKind::Json)
                    .required()
                    .with_label("Cases")
                    .with_description("Array of case names, each a named output handle"),
            ])
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        node: &Node,
        envelope: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        let expression = node.string_param("value")?;
        let cases: Vec<String> = match node.param("cases") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|_| NodeError::validation("cases must be an array of strings"))?,
            None => return Err(NodeError::validation("missing required parameter: cases")),
        };

        let value = stringify(&expr::eval(&expression, &envelope)?);
        let handle = if cases.contains(&value) {
            value
        } else {
            "default".to_string()
        };

        Ok(NodeOutput::routed(envelope, vec![handle]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use mel_engine::Routing;
    use serde_json::json;

    async fn route_for(data: serde_json::Value) -> Vec<String> {
        let ctx = testing::ctx();
        let node = testing::node(
            "switch",
            vec![
                ("value", json!("input.kind")),
                ("cases", json!(["order", "refund"])),
            ],
        );
        let output = SwitchNode
            .execute(&ctx, &node, testing::envelope(data))
            .await
            .unwrap();
        match output.routing {
            Routing::Handles(handles) => handles,
            other => panic!("expected routed handles, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_matching_case() {
        assert_eq!(route_for(json!({"kind": "refund"})).await, vec!["refund"]);
    }

    #[tokio::test]
    async fn test_unmatched_value_fires_default() {
        assert_eq!(route_for(json!({"kind": "other"})).await, vec!["default"]);
    }

    #[tokio::test]
    async fn test_non_string_values_are_stringified() {
        let ctx = testing::ctx();
        let node = testing::node(
            "switch",
            vec![("value", json!("input.code")), ("cases", json!(["404"]))],
        );
        let output = SwitchNode
            .execute(&ctx, &node, testing::envelope(json!({"code": 404})))
            .await
            .unwrap();
        assert!(matches!(output.routing, Routing::Handles(ref h) if h == &["404"]));
    }
}
