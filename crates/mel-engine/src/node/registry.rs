//! Process-wide node-type catalog
//!
//! The registry is built explicitly at the composition root: each known node
//! type is registered by an initializer, then the registry is shared read-only
//! for the life of the process. Lookup is by the type's string key.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{NodeDefinition, NodeError, NodeType, Platform};

/// Errors from registry lookups
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Node type not registered
    #[error("unknown node type: {0}")]
    UnknownNodeType(String),
}

/// Catalog of node-type implementations, keyed by type tag
///
/// # Example
///
/// ```ignore
/// let mut registry = NodeRegistry::new();
/// registry.register(InjectNode);
/// registry.register(IfNode);
/// let registry = Arc::new(registry);
///
/// if let Some(node_type) = registry.get("if") {
///     let def = node_type.definition();
/// }
/// ```
#[derive(Default)]
pub struct NodeRegistry {
    types: HashMap<String, Arc<dyn NodeType>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    /// Register a node type. A later registration under the same key replaces
    /// the earlier one.
    pub fn register<T: NodeType>(&mut self, node_type: T) {
        let key = node_type.definition().node_type;
        self.types.insert(key, Arc::new(node_type));
    }

    /// Look up a node type by its string key.
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeType>> {
        self.types.get(node_type).cloned()
    }

    /// Look up a node type, with a typed error for unregistered keys.
    pub fn resolve(&self, node_type: &str) -> Result<Arc<dyn NodeType>, RegistryError> {
        self.get(node_type)
            .ok_or_else(|| RegistryError::UnknownNodeType(node_type.to_string()))
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.types.contains_key(node_type)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Definitions of every registered type, for the catalog endpoint.
    pub fn definitions(&self) -> Vec<NodeDefinition> {
        let mut defs: Vec<_> = self.types.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.node_type.cmp(&b.node_type));
        defs
    }

    /// Registered type keys.
    pub fn type_keys(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(|s| s.as_str())
    }

    /// Run every type's `initialize` hook once at process start.
    pub async fn initialize_all(&self, platform: &Platform) -> Result<(), NodeError> {
        for node_type in self.types.values() {
            node_type.initialize(platform).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
pub mod test_support {
    //! Minimal node types for engine-internal tests

    use async_trait::async_trait;

    use crate::envelope::Envelope;
    use crate::graph::Node;
    use crate::node::{
        ExecutionContext, NodeDefinition, NodeError, NodeOutput, NodeRegistry, NodeType,
    };

    /// A node that forwards its input unchanged on the default handle.
    pub struct Passthrough {
        key: String,
        entry: bool,
    }

    #[async_trait]
    impl NodeType for Passthrough {
        fn definition(&self) -> NodeDefinition {
            let def = NodeDefinition::new(&self.key, &self.key, "Test");
            if self.entry {
                def.entry_point()
            } else {
                def
            }
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

    pub fn passthrough(key: &str) -> Passthrough {
        Passthrough {
            key: key.to_string(),
            entry: false,
        }
    }

    pub fn entry_passthrough(key: &str) -> Passthrough {
        Passthrough {
            key: key.to_string(),
            entry: true,
        }
    }

    pub fn registry_with(types: Vec<Passthrough>) -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        for t in types {
            registry.register(t);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{passthrough, registry_with};
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = registry_with(vec![passthrough("noop"), passthrough("log")]);

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("noop"));
        assert!(!registry.contains("unknown"));
        assert!(registry.get("log").is_some());
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_resolve_unknown_type() {
        let registry = registry_with(vec![passthrough("noop")]);

        assert!(registry.resolve("noop").is_ok());
        let result = registry.resolve("ghost");
        assert!(matches!(result, Err(RegistryError::UnknownNodeType(_))));
    }

    #[test]
    fn test_definitions_sorted() {
        let registry = registry_with(vec![passthrough("zeta"), passthrough("alpha")]);
        let defs = registry.definitions();

        assert_eq!(defs[0].node_type, "alpha");
        assert_eq!(defs[1].node_type, "zeta");
    }

    #[test]
    fn test_debug_lists_types() {
        let registry = registry_with(vec![passthrough("noop")]);
        assert!(format!("{registry:?}").contains("noop"));
    }
}
