use std::collections::BTreeMap;

use crate::{Graph, TensorValue};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProducerInfo {
    pub name: String,
    pub version: String,
    pub opset: i64,
}

/// Owns one converted graph together with its persisted state.
///
/// Passed explicitly from the converter to the exporter; nothing in the
/// pipeline reaches for a process-wide default graph.
#[derive(Clone, Debug, Default)]
pub struct ExecutionContext {
    pub graph: Graph,
    /// Values embedded directly in the graph as `Const` nodes.
    pub constants: BTreeMap<String, TensorValue>,
    /// Values persisted separately under `variables/`.
    pub variables: BTreeMap<String, TensorValue>,
    pub producer: ProducerInfo,
}

impl ExecutionContext {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph,
            ..Self::default()
        }
    }

    pub fn has_variables(&self) -> bool {
        !self.variables.is_empty()
    }

    pub fn value(&self, tensor: &str) -> Option<&TensorValue> {
        self.constants
            .get(tensor)
            .or_else(|| self.variables.get(tensor))
    }
}
