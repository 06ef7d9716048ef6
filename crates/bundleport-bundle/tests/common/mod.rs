#![allow(dead_code)]

use std::path::Path;

use bundleport_core::{
    classification_signature, predict_signature, ClassifyOutput, DType, Dim, ExecutionContext,
    Shape, SignatureMap, TensorDescriptor, TensorValue, DEFAULT_SERVING_SIGNATURE_KEY,
};
use bundleport_onnx::{convert, tensor_proto, value_info, ConvertOptions};
use bundleport_proto::onnx;

fn weights(name: &str, dims: &[usize]) -> onnx::TensorProto {
    let n: usize = dims.iter().product();
    let data: Vec<f32> = (0..n).map(|i| (i % 11) as f32 * 0.5).collect();
    tensor_proto(name, &TensorValue::from_f32(dims, &data).unwrap())
}

/// Node names follow the torch exporter (`/fc/MatMul`), never the tensor names.
fn node(op: &str, scope: &str, inputs: &[&str], output: &str) -> onnx::NodeProto {
    onnx::NodeProto {
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: vec![output.to_string()],
        name: format!("{scope}/{op}"),
        op_type: op.to_string(),
        ..Default::default()
    }
}

/// 784 -> 62 softmax classifier, the shape of an EMNIST head.
pub fn emnist_model() -> onnx::ModelProto {
    let x = TensorDescriptor::new(
        "x",
        DType::F32,
        Shape::from_dims([Dim::Symbolic("batch".into()), Dim::Fixed(784)]),
    );
    onnx::ModelProto {
        ir_version: 7,
        producer_name: "pytorch".to_string(),
        producer_version: "2.1.0".to_string(),
        opset_import: vec![onnx::OperatorSetIdProto {
            domain: String::new(),
            version: 13,
        }],
        graph: Some(onnx::GraphProto {
            name: "emnist".to_string(),
            node: vec![
                node("MatMul", "/fc", &["x", "fc.weight"], "fc_out"),
                node("Add", "/fc", &["fc_out", "fc.bias"], "logits"),
                node("Softmax", "", &["logits"], "y"),
            ],
            initializer: vec![weights("fc.weight", &[784, 62]), weights("fc.bias", &[62])],
            input: vec![value_info(&x)],
            output: vec![value_info(&TensorDescriptor::untyped("y"))],
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn emnist_context(options: &ConvertOptions) -> ExecutionContext {
    convert(&emnist_model(), options).unwrap()
}

/// Default classification signature plus a `predict_images` entry.
pub fn emnist_signatures(ctx: &ExecutionContext) -> SignatureMap {
    let x = ctx.graph.tensor("x").unwrap().clone();
    let y = ctx.graph.tensor("y").unwrap().clone();
    SignatureMap::new()
        .with(
            DEFAULT_SERVING_SIGNATURE_KEY,
            classification_signature(&x, &y, ClassifyOutput::Scores).unwrap(),
        )
        .with(
            "predict_images",
            predict_signature([("images", x)], [("scores", y)]).unwrap(),
        )
}

/// Names of everything directly under `dir`.
pub fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
