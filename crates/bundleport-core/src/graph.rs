use std::collections::BTreeMap;

use crate::{DType, Error, Result, Shape, TensorDescriptor, TensorValue};

#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    Bool(bool),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Strs(Vec<String>),
    Type(DType),
    Shape(Shape),
    Tensor(TensorValue),
}

/// One operation in the native graph.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub name: String,
    pub op: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl Node {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: op.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }
}

/// Directed acyclic graph of named tensor-producing operations.
///
/// Every tensor that any node reads or writes has a descriptor in `tensors`.
/// Nodes are kept in topological order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Graph {
    pub name: String,
    pub nodes: Vec<Node>,
    pub tensors: BTreeMap<String, TensorDescriptor>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Looks a tensor descriptor up by name.
    pub fn tensor(&self, name: &str) -> Result<&TensorDescriptor> {
        self.tensors
            .get(name)
            .ok_or_else(|| Error::TensorNotFound(name.to_string()))
    }

    pub fn input_descriptors(&self) -> Result<Vec<&TensorDescriptor>> {
        self.inputs.iter().map(|n| self.tensor(n)).collect()
    }

    pub fn output_descriptors(&self) -> Result<Vec<&TensorDescriptor>> {
        self.outputs.iter().map(|n| self.tensor(n)).collect()
    }

    pub fn node_producing(&self, tensor: &str) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.outputs.iter().any(|o| o == tensor))
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    pub fn declare(&mut self, desc: TensorDescriptor) {
        self.tensors.insert(desc.name.clone(), desc);
    }

    /// Checks that every referenced tensor has a producer or is an external input.
    pub fn validate(&self) -> Result<()> {
        let mut produced: std::collections::HashSet<&str> =
            self.inputs.iter().map(String::as_str).collect();
        for node in &self.nodes {
            for input in node.inputs.iter().filter(|i| !i.is_empty()) {
                if !produced.contains(input.as_str()) {
                    return Err(Error::InvalidModel(format!(
                        "node {:?} reads tensor {input:?} before it is produced",
                        node.name
                    )));
                }
            }
            for output in &node.outputs {
                if !self.tensors.contains_key(output) {
                    return Err(Error::TensorNotFound(output.clone()));
                }
                produced.insert(output);
            }
        }
        for output in &self.outputs {
            if !produced.contains(output.as_str()) {
                return Err(Error::InvalidModel(format!(
                    "graph output {output:?} is never produced"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> Graph {
        let mut g = Graph::new("tiny");
        g.declare(TensorDescriptor::new("x", DType::F32, Shape::from_slice(&[1, 4])));
        g.declare(TensorDescriptor::new("y", DType::F32, Shape::from_slice(&[1, 4])));
        g.inputs.push("x".into());
        g.outputs.push("y".into());
        g.add_node(Node::new("relu", "Relu").with_inputs(["x"]).with_outputs(["y"]));
        g
    }

    #[test]
    fn lookup_by_name() {
        let g = tiny();
        assert_eq!(g.tensor("y").unwrap().shape, Some(Shape::from_slice(&[1, 4])));
        assert!(matches!(g.tensor("z"), Err(Error::TensorNotFound(_))));
        assert_eq!(g.node_producing("y").map(|n| n.op.as_str()), Some("Relu"));
    }

    #[test]
    fn validate_catches_dangling_input() {
        let mut g = tiny();
        g.add_node(Node::new("bad", "Relu").with_inputs(["missing"]).with_outputs(["y"]));
        assert!(g.validate().is_err());
        assert!(tiny().validate().is_ok());
    }
}
