//! Merge - wait-all join with concat/union/first combination

use async_trait::async_trait;
use mel_engine::graph::Node;
use mel_engine::node::{MergeMode, ParameterDef, ParameterKind, ParameterOption};
use mel_engine::{Envelope, ExecutionContext, NodeDefinition, NodeError, NodeOutput, NodeType};

/// Wait-all node. The engine enqueues it once every inbound edge has
/// delivered, handing over the deliveries as an array in arrival order; the
/// `mode` parameter decides how they combine.
pub struct MergeNode;

fn combine(mode: MergeMode, deliveries: Vec<serde_json::Value>) -> serde_json::Value {
    match mode {
        MergeMode::First => deliveries.into_iter().next().unwrap_or(serde_json::Value::Null),
        MergeMode::Concat => {
            let mut combined = Vec::new();
            for delivery in deliveries {
                match delivery {
                    serde_json::Value::Array(elements) => combined.extend(elements),
                    other => combined.push(other),
                }
            }
            serde_json::Value::Array(combined)
        }
        MergeMode::Union => {
            let mut union = serde_json::Map::new();
            for delivery in deliveries {
                if let serde_json::Value::Object(object) = delivery {
                    for (key, value) in object {
                        union.entry(key).or_insert(value);
                    }
                }
            }
            serde_json::Value::Object(union)
        }
    }
}

#[async_trait]
impl NodeType for MergeNode {
    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("merge", "Merge", "Logic")
            .with_icon("git-merge")
            .wait_all()
            .with_parameters(vec![ParameterDef::new("mode", ParameterKind::Enum)
                .with_label("Mode")
                .with_default(serde_json::Value::String("concat".to_string()))
                .with_options(vec![
                    ParameterOption::new("concat", "Concatenate"),
                    ParameterOption::new("union", "Union (first wins)"),
                    ParameterOption::new("first", "First delivery"),
                ])])
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        node: &Node,
        envelope: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        let mode: MergeMode = node.string_param_or("mode", "concat")?.parse()?;

        let deliveries = match &envelope.data {
            serde_json::Value::Array(elements) => elements.clone(),
            single => vec![single.clone()],
        };

        let merged = combine(mode, deliveries);
        Ok(NodeOutput::single(envelope.with_data(merged)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use serde_json::json;

    async fn merged(mode: &str, data: serde_json::Value) -> serde_json::Value {
        let ctx = testing::ctx();
        let node = testing::node("merge", vec![("mode", json!(mode))]);
        MergeNode
            .execute(&ctx, &node, testing::envelope(data))
            .await
            .unwrap()
            .output
            .data
    }

    #[tokio::test]
    async fn test_concat_flattens_arrays() {
        let result = merged("concat", json!([[1, 2], [3], "x"])).await;
        assert_eq!(result, json!([1, 2, 3, "x"]));
    }

    #[tokio::test]
    async fn test_union_first_wins() {
        let result = merged("union", json!([{"a": 1, "b": 1}, {"b": 2, "c": 3}])).await;
        assert_eq!(result, json!({"a": 1, "b": 1, "c": 3}));
    }

    #[tokio::test]
    async fn test_first_keeps_first_delivery() {
        let result = merged("first", json!([{"winner": true}, {"winner": false}])).await;
        assert_eq!(result, json!({"winner": true}));
    }

    #[tokio::test]
    async fn test_unknown_mode_is_validation_error() {
        let ctx = testing::ctx();
        let node = testing::node("merge", vec![("mode", json!("sideways"))]);
        let result = MergeNode
            .execute(&ctx, &node, testing::envelope(json!([])))
            .await;
        assert!(matches!(result, Err(NodeError::Validation(_))));
    }
}
