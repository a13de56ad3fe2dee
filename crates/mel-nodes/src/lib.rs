//! Built-in node types
//!
//! Each node type contributes a [`NodeDefinition`] (metadata + parameter
//! schema) and an `execute` implementation over envelopes. The registry is
//! assembled explicitly by [`builtin_registry`]; nothing registers itself as
//! an import side effect.
//!
//! | Type | Behavior |
//! |---|---|
//! | `inject` | Entry point emitting a configured payload |
//! | `http_request` | HTTP call with transient/permanent error classification |
//! | `transform` | Template rendering over the envelope |
//! | `if` | Two-way branch on an expression, `else` on evaluation errors |
//! | `switch` | Case match routed to a named handle |
//! | `for_each` | Fan-out, one successor per array element |
//! | `merge` | Wait-all join with concat/union/first combination |
//! | `delay` | Cancellation-aware sleep |
//! | `log` | Structured logging passthrough |
//! | `noop` | Passthrough |
//! | `set_variable` | Writes a run variable |

mod delay;
mod expr;
mod for_each;
mod http_request;
mod if_node;
mod inject;
mod log;
mod merge;
mod noop;
mod set_variable;
mod switch;
mod transform;

pub use delay::DelayNode;
pub use for_each::ForEachNode;
pub use http_request::HttpRequestNode;
pub use if_node::IfNode;
pub use inject::InjectNode;
pub use log::LogNode;
pub use merge::MergeNode;
pub use noop::NoopNode;
pub use set_variable::SetVariableNode;
pub use switch::SwitchNode;
pub use transform::TransformNode;

use mel_engine::NodeRegistry;

/// Build the registry of built-in node types.
///
/// Call once at process start; the result is shared read-only.
pub fn builtin_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    registry.register(InjectNode);
    registry.register(HttpRequestNode::new());
    registry.register(TransformNode);
    registry.register(IfNode);
    registry.register(SwitchNode);
    registry.register(ForEachNode);
    registry.register(MergeNode);
    registry.register(DelayNode);
    registry.register(LogNode);
    registry.register(NoopNode);
    registry.register(SetVariableNode);
    registry
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_contains_all_types() {
        let registry = builtin_registry();
        for key in [
            "inject",
            "http_request",
            "transform",
            "if",
            "switch",
            "for_each",
            "merge",
            "delay",
            "log",
            "noop",
            "set_variable",
        ] {
            assert!(registry.contains(key), "missing node type: {key}");
        }
    }

    #[test]
    fn test_entry_points_flagged() {
        let registry = builtin_registry();
        let inject = registry.get("inject").unwrap();
        assert!(inject.definition().entry_point);

        let noop = registry.get("noop").unwrap();
        assert!(!noop.definition().entry_point);
    }
}
