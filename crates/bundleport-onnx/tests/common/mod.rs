#![allow(dead_code)]

use bundleport_core::{DType, Dim, Shape, TensorDescriptor, TensorValue};
use bundleport_onnx::{tensor_proto, value_info};
use bundleport_proto::onnx;

pub fn node(op: &str, name: &str, inputs: &[&str], outputs: &[&str]) -> onnx::NodeProto {
    onnx::NodeProto {
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: outputs.iter().map(|s| s.to_string()).collect(),
        name: name.to_string(),
        op_type: op.to_string(),
        ..Default::default()
    }
}

pub fn ints(name: &str, values: &[i64]) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        ints: values.to_vec(),
        r#type: onnx::attribute_proto::AttributeType::Ints as i32,
        ..Default::default()
    }
}

pub fn int(name: &str, value: i64) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        i: value,
        r#type: onnx::attribute_proto::AttributeType::Int as i32,
        ..Default::default()
    }
}

pub fn weights(name: &str, dims: &[usize]) -> onnx::TensorProto {
    let n: usize = dims.iter().product();
    let data: Vec<f32> = (0..n).map(|i| (i % 7) as f32 * 0.01).collect();
    tensor_proto(name, &TensorValue::from_f32(dims, &data).unwrap())
}

pub fn model(graph: onnx::GraphProto, opset: i64) -> onnx::ModelProto {
    onnx::ModelProto {
        ir_version: 7,
        producer_name: "pytorch".to_string(),
        producer_version: "2.1.0".to_string(),
        graph: Some(graph),
        opset_import: vec![onnx::OperatorSetIdProto {
            domain: String::new(),
            version: opset,
        }],
        ..Default::default()
    }
}

/// x[batch,784] -> MatMul -> Add -> Softmax -> y[batch,62]
pub fn linear_classifier() -> onnx::ModelProto {
    let batch = || Shape::from_dims([Dim::Symbolic("batch".into()), Dim::Fixed(784)]);
    let graph = onnx::GraphProto {
        name: "emnist_linear".to_string(),
        node: vec![
            node("MatMul", "fc/matmul", &["x", "fc.weight"], &["fc_out"]),
            node("Add", "fc/add", &["fc_out", "fc.bias"], &["logits"]),
            node("Softmax", "softmax", &["logits"], &["y"]),
        ],
        initializer: vec![weights("fc.weight", &[784, 62]), weights("fc.bias", &[62])],
        input: vec![value_info(&TensorDescriptor::new("x", DType::F32, batch()))],
        output: vec![value_info(&TensorDescriptor {
            name: "y".to_string(),
            dtype: Some(DType::F32),
            shape: None,
        })],
        ..Default::default()
    };
    model(graph, 13)
}

/// x[1,1,28,28] -> Conv -> Relu -> MaxPool -> Flatten -> Gemm -> y[1,62]
pub fn conv_classifier() -> onnx::ModelProto {
    let mut conv = node("Conv", "conv1", &["x", "conv1.weight", "conv1.bias"], &["conv1_out"]);
    conv.attribute = vec![ints("kernel_shape", &[5, 5]), ints("strides", &[1, 1])];
    let mut pool = node("MaxPool", "pool1", &["relu1"], &["pool1_out"]);
    pool.attribute = vec![ints("kernel_shape", &[2, 2]), ints("strides", &[2, 2])];
    let mut flatten = node("Flatten", "flatten", &["pool1_out"], &["flat"]);
    flatten.attribute = vec![int("axis", 1)];
    let mut gemm = node("Gemm", "fc", &["flat", "fc.weight", "fc.bias"], &["y"]);
    gemm.attribute = vec![int("transB", 1)];

    let graph = onnx::GraphProto {
        name: "emnist_conv".to_string(),
        node: vec![
            conv,
            node("Relu", "relu1", &["conv1_out"], &["relu1"]),
            pool,
            flatten,
            gemm,
        ],
        initializer: vec![
            weights("conv1.weight", &[4, 1, 5, 5]),
            weights("conv1.bias", &[4]),
            weights("fc.weight", &[62, 576]),
            weights("fc.bias", &[62]),
        ],
        input: vec![value_info(&TensorDescriptor::new(
            "x",
            DType::F32,
            Shape::from_slice(&[1, 1, 28, 28]),
        ))],
        output: vec![value_info(&TensorDescriptor::untyped("y"))],
        ..Default::default()
    };
    model(graph, 11)
}

pub fn float(name: &str, value: f32) -> onnx::AttributeProto {
    onnx::AttributeProto {
        name: name.to_string(),
        f: value,
        r#type: onnx::attribute_proto::AttributeType::Float as i32,
        ..Default::default()
    }
}

pub fn input(name: &str, dims: &[usize]) -> TensorDescriptor {
    TensorDescriptor::new(name, DType::F32, Shape::from_slice(dims))
}

/// A graph around `nodes` with untyped outputs.
pub fn single_op(
    nodes: Vec<onnx::NodeProto>,
    initializer: Vec<onnx::TensorProto>,
    inputs: Vec<TensorDescriptor>,
    outputs: &[&str],
) -> onnx::ModelProto {
    let graph = onnx::GraphProto {
        name: "ops".to_string(),
        node: nodes,
        initializer,
        input: inputs.iter().map(value_info).collect(),
        output: outputs
            .iter()
            .map(|name| value_info(&TensorDescriptor::untyped(*name)))
            .collect(),
        ..Default::default()
    };
    model(graph, 13)
}
