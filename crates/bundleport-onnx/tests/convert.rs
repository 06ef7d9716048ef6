mod common;

use anyhow::{ensure, Context, Result};
use bundleport_core::{AttrValue, DType, Dim, Error, Frontend, ModelArtifact, Shape};
use bundleport_onnx::{convert, load_model, ConvertOptions, OnnxFrontend};
use bundleport_proto::onnx;
use prost::Message;

use common::*;

#[test]
fn loads_onnx_file_into_context() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("emnist.onnx");
    std::fs::write(&path, linear_classifier().encode_to_vec())?;

    let ctx = OnnxFrontend::new().load(&ModelArtifact::OnnxPath(path))?;
    let graph = &ctx.graph;

    assert_eq!(graph.inputs, vec!["x".to_string()]);
    assert_eq!(graph.outputs, vec!["y".to_string()]);

    let y = graph.tensor("y")?;
    ensure!(y.dtype == Some(DType::F32), "output dtype not propagated");
    assert_eq!(
        y.shape,
        Some(Shape::from_dims([Dim::Symbolic("batch".into()), Dim::Fixed(62)]))
    );

    // weights, biases and activations all get descriptors
    for name in ["fc.weight", "fc.bias", "fc_out", "logits"] {
        graph.tensor(name).with_context(|| format!("missing tensor {name}"))?;
    }
    assert_eq!(ctx.constants.len(), 2);
    assert!(!ctx.has_variables());
    assert_eq!(ctx.producer.opset, 13);
    Ok(())
}

#[test]
fn maps_onnx_ops_to_native_ops() -> Result<()> {
    let ctx = convert(&linear_classifier(), &ConvertOptions::default())?;
    let ops: Vec<&str> = ctx.graph.nodes.iter().map(|n| n.op.as_str()).collect();
    assert_eq!(ops, ["Const", "Const", "Placeholder", "MatMul", "AddV2", "Softmax"]);

    let softmax = ctx.graph.node_producing("y").context("no producer for y")?;
    assert_eq!(softmax.attr("axis"), None);
    assert_eq!(softmax.attr("T"), Some(&AttrValue::Type(DType::F32)));
    let matmul = ctx.graph.node_producing("fc_out").context("no producer for fc_out")?;
    assert_eq!(matmul.attr("transpose_b"), Some(&AttrValue::Bool(false)));

    // Nodes are named after their output so inputs resolve to node names.
    for node in &ctx.graph.nodes {
        assert_eq!(node.outputs, vec![node.name.clone()], "node {}", node.name);
        if node.op == "Const" {
            ensure!(node.attr("shape").is_none(), "Const {} carries a shape attr", node.name);
        }
    }
    Ok(())
}

#[test]
fn softmax_over_inner_axis_is_unsupported() {
    let mut model = linear_classifier();
    let softmax = &mut model.graph.as_mut().unwrap().node[2];
    softmax.attribute = vec![int("axis", 0)];
    match convert(&model, &ConvertOptions::default()) {
        Err(Error::UnsupportedOp { op, node }) => {
            assert_eq!(op, "Softmax");
            assert_eq!(node, "softmax");
        }
        other => panic!("expected UnsupportedOp, got {other:?}"),
    }
}

#[test]
fn infers_shapes_through_conv_stack() -> Result<()> {
    let ctx = convert(&conv_classifier(), &ConvertOptions::default())?;
    let g = &ctx.graph;

    assert_eq!(g.tensor("conv1_out")?.shape, Some(Shape::from_slice(&[1, 4, 24, 24])));
    assert_eq!(g.tensor("pool1_out")?.shape, Some(Shape::from_slice(&[1, 4, 12, 12])));
    assert_eq!(g.tensor("flat")?.shape, Some(Shape::from_slice(&[1, 576])));
    assert_eq!(g.tensor("y")?.shape, Some(Shape::from_slice(&[1, 62])));
    assert_eq!(g.tensor("y")?.dtype, Some(DType::F32));

    // Flatten becomes Reshape fed by a generated constant.
    let flat = g.node_producing("flat").context("no producer for flat")?;
    assert_eq!(flat.op, "Reshape");
    let target = ctx.constants.get("flat/shape").context("flatten target missing")?;
    assert_eq!(target.to_i64_vec()?, vec![1, 576]);

    // A biased Conv is Conv2D followed by BiasAdd.
    let bias_add = g.node_producing("conv1_out").context("no producer for conv1_out")?;
    assert_eq!(bias_add.op, "BiasAdd");
    assert_eq!(bias_add.inputs, vec!["conv1_out/conv".to_string(), "conv1.bias".to_string()]);
    let conv = g.node_producing("conv1_out/conv").context("no conv node")?;
    assert_eq!(conv.op, "Conv2D");
    assert_eq!(conv.attr("padding"), Some(&AttrValue::Str("VALID".into())));
    assert_eq!(g.tensor("conv1_out/conv")?.shape, g.tensor("conv1_out")?.shape);
    Ok(())
}

#[test]
fn initializers_can_become_variables() -> Result<()> {
    let options = ConvertOptions {
        initializers_as_variables: true,
        ..Default::default()
    };
    let ctx = convert(&linear_classifier(), &options)?;
    assert!(ctx.constants.is_empty());
    assert_eq!(ctx.variables.len(), 2);
    let node = ctx.graph.node_producing("fc.weight").context("no weight node")?;
    assert_eq!(node.op, "VariableV2");
    Ok(())
}

#[test]
fn rejects_unknown_ops() {
    let mut model = linear_classifier();
    let graph = model.graph.as_mut().unwrap();
    graph.node[2].op_type = "NonMaxSuppression".to_string();

    match convert(&model, &ConvertOptions::default()) {
        Err(Error::UnsupportedOp { op, node }) => {
            assert_eq!(op, "NonMaxSuppression");
            assert_eq!(node, "softmax");
        }
        other => panic!("expected UnsupportedOp, got {other:?}"),
    }
}

#[test]
fn rejects_custom_domains() {
    let mut model = linear_classifier();
    model.graph.as_mut().unwrap().node[2].domain = "com.microsoft".to_string();
    assert!(matches!(
        convert(&model, &ConvertOptions::default()),
        Err(Error::UnsupportedOp { .. })
    ));
}

#[test]
fn rejects_dangling_tensors() {
    let mut model = linear_classifier();
    model.graph.as_mut().unwrap().node[1].input[0] = "nowhere".to_string();
    assert!(matches!(
        convert(&model, &ConvertOptions::default()),
        Err(Error::InvalidModel(_))
    ));
}

#[test]
fn negative_window_attributes_are_invalid() {
    let mut model = conv_classifier();
    let pool = &mut model.graph.as_mut().unwrap().node[2];
    pool.attribute.push(ints("pads", &[-1, 0, 0, 0]));
    assert!(matches!(
        convert(&model, &ConvertOptions::default()),
        Err(Error::InvalidModel(_))
    ));

    let mut model = conv_classifier();
    let conv = &mut model.graph.as_mut().unwrap().node[0];
    conv.attribute[1] = ints("strides", &[0, 1]);
    assert!(matches!(
        convert(&model, &ConvertOptions::default()),
        Err(Error::InvalidModel(_))
    ));
}

#[test]
fn oversized_initializer_is_invalid() {
    let mut model = linear_classifier();
    let graph = model.graph.as_mut().unwrap();
    graph.initializer[1] = onnx::TensorProto {
        name: "fc.bias".to_string(),
        dims: vec![1 << 40, 1 << 40],
        data_type: onnx::tensor_proto::DataType::Float as i32,
        raw_data: vec![0; 4],
        ..Default::default()
    };
    assert!(matches!(
        convert(&model, &ConvertOptions::default()),
        Err(Error::InvalidModel(_))
    ));
}

#[test]
fn reading_a_secondary_output_is_unsupported() {
    let mut model = linear_classifier();
    let graph = model.graph.as_mut().unwrap();
    graph.node.insert(2, node("Dropout", "drop", &["logits"], &["dropped", "mask"]));
    graph.node[3].input[0] = "mask".to_string();
    match convert(&model, &ConvertOptions::default()) {
        Err(Error::UnsupportedOp { op, node }) => {
            assert_eq!(op, "Dropout output \"mask\"");
            assert_eq!(node, "drop");
        }
        other => panic!("expected UnsupportedOp, got {other:?}"),
    }

    // Dropping the mask is fine.
    let mut model = linear_classifier();
    let graph = model.graph.as_mut().unwrap();
    graph.node.insert(2, node("Dropout", "drop", &["logits"], &["dropped", "mask"]));
    graph.node[3].input[0] = "dropped".to_string();
    let ctx = convert(&model, &ConvertOptions::default()).expect("mask is never read");
    let drop = ctx.graph.node_producing("dropped").expect("no producer for dropped");
    assert_eq!(drop.op, "Identity");
}

#[test]
fn reports_undecodable_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("garbage.onnx");
    std::fs::write(&path, b"\xff\xff\xff\xff not a protobuf")?;
    assert!(matches!(load_model(&path), Err(Error::Decode { .. })));

    let missing = dir.path().join("missing.onnx");
    assert!(matches!(load_model(&missing), Err(Error::Io { .. })));
    Ok(())
}

#[test]
fn frontend_rejects_bundle_artifacts() {
    let err = OnnxFrontend::new().load(&ModelArtifact::BundleDir("models/emnist/1".into()));
    assert!(matches!(err, Err(Error::UnsupportedArtifact { .. })));
}
