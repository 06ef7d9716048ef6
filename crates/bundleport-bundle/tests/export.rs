mod common;

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use bundleport_bundle::{
    latest_version, list_versions, load_bundle, load_latest, remove_version, BundleExporter,
    BundleFrontend,
};
use bundleport_core::{
    Error, Frontend, MethodContract, ModelArtifact, SignatureMap, DEFAULT_SERVING_SIGNATURE_KEY,
};
use bundleport_onnx::ConvertOptions;
use bundleport_proto::saved_model as pb;
use prost::Message;
use sha2::{Digest, Sha256};

use common::*;

fn checksum(dir: &Path) -> Result<Vec<u8>> {
    let mut hasher = Sha256::new();
    let mut stack = vec![dir.to_path_buf()];
    let mut files = Vec::new();
    while let Some(path) = stack.pop() {
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                stack.push(entry.path());
            } else {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    for file in files {
        hasher.update(file.strip_prefix(dir)?.to_string_lossy().as_bytes());
        hasher.update(fs::read(&file)?);
    }
    Ok(hasher.finalize().to_vec())
}

/// `^ctrl` and `node:1` both refer to a node by name.
fn node_of(reference: &str) -> &str {
    let name = reference.trim_start_matches('^');
    match name.rsplit_once(':') {
        Some((node, port)) if port.parse::<u32>().is_ok() => node,
        _ => name,
    }
}

#[test]
fn graph_references_resolve_to_nodes() -> Result<()> {
    let root = tempfile::tempdir()?;
    let ctx = emnist_context(&ConvertOptions::default());
    let exported = BundleExporter::new(root.path()).export(1, &emnist_signatures(&ctx), &ctx)?;

    let bytes = fs::read(exported.path.join("saved_model.pb"))?;
    let saved = pb::SavedModel::decode(bytes.as_slice())?;
    let meta = saved.meta_graphs.first().context("no meta graph")?;
    let graph = meta.graph_def.as_ref().context("no graph def")?;
    let names: HashSet<&str> = graph.node.iter().map(|n| n.name.as_str()).collect();
    ensure!(!names.contains("/fc/MatMul"), "onnx node names leaked into the graph");

    for node in &graph.node {
        for input in &node.input {
            ensure!(
                names.contains(node_of(input)),
                "{} input {input:?} names no node",
                node.name
            );
        }
    }
    for (key, signature) in &meta.signature_def {
        for info in signature.inputs.values().chain(signature.outputs.values()) {
            ensure!(
                names.contains(node_of(&info.name)),
                "signature {key} tensor {:?} names no node",
                info.name
            );
        }
    }

    for node in &graph.node {
        match node.op.as_str() {
            "MatMul" | "AddV2" | "Softmax" => {
                ensure!(node.attr.contains_key("T"), "{} has no T attr", node.name)
            }
            "Const" => ensure!(!node.attr.contains_key("shape"), "{} has a shape attr", node.name),
            _ => {}
        }
    }
    Ok(())
}

#[test]
fn exported_bundle_reloads_with_same_io() -> Result<()> {
    let root = tempfile::tempdir()?;
    let model_dir = root.path().join("emnist");
    let ctx = emnist_context(&ConvertOptions::default());
    let signatures = emnist_signatures(&ctx);

    let exported = BundleExporter::new(&model_dir).export(1, &signatures, &ctx)?;
    assert_eq!(exported.path, model_dir.join("1"));
    assert_eq!(entries(&exported.path), vec!["saved_model.pb".to_string()]);

    let loaded = load_bundle(&exported.path)?;
    assert_eq!(loaded.version, Some(1));
    assert_eq!(loaded.tags, vec!["serve".to_string()]);

    let graph = &loaded.context.graph;
    assert_eq!(graph.inputs, ctx.graph.inputs);
    assert_eq!(graph.outputs, ctx.graph.outputs);
    for name in ["x", "y"] {
        assert_eq!(graph.tensor(name)?, ctx.graph.tensor(name)?);
    }
    assert_eq!(graph.nodes.len(), ctx.graph.nodes.len());
    assert_eq!(loaded.context.constants, ctx.constants);
    assert_eq!(loaded.context.producer, ctx.producer);

    let default = loaded
        .signatures
        .get(DEFAULT_SERVING_SIGNATURE_KEY)
        .context("default signature missing")?;
    assert_eq!(default.method, MethodContract::Classify);
    assert_eq!(default.inputs["inputs"].name, "x");
    assert_eq!(default.outputs["scores"].name, "y");

    let predict = loaded.signatures.get("predict_images").context("predict signature")?;
    ensure!(predict.method == "PREDICT", "got {}", predict.method);
    assert_eq!(predict.inputs["images"].name, "x");
    Ok(())
}

#[test]
fn exported_files_are_read_only() -> Result<()> {
    let root = tempfile::tempdir()?;
    let ctx = emnist_context(&ConvertOptions::default());
    let exported = BundleExporter::new(root.path()).export(3, &emnist_signatures(&ctx), &ctx)?;
    for file in &exported.files {
        let perms = fs::metadata(exported.path.join(file))?.permissions();
        ensure!(perms.readonly(), "{} is writable", file.display());
    }
    Ok(())
}

#[test]
fn existing_version_is_left_untouched() -> Result<()> {
    let root = tempfile::tempdir()?;
    let ctx = emnist_context(&ConvertOptions::default());
    let signatures = emnist_signatures(&ctx);
    let exporter = BundleExporter::new(root.path());

    let first = exporter.export(1, &signatures, &ctx)?;
    let before = checksum(&first.path)?;

    let mut other = ctx.clone();
    other.graph.name = "retrained".to_string();
    match exporter.export(1, &signatures, &other) {
        Err(Error::AlreadyExists(path)) => assert_eq!(path, first.path),
        other => panic!("expected AlreadyExists, got {other:?}"),
    }
    assert_eq!(checksum(&first.path)?, before);
    assert_eq!(entries(root.path()), vec!["1".to_string()]);
    Ok(())
}

#[test]
fn config_errors_write_nothing() -> Result<()> {
    let root = tempfile::tempdir()?;
    let model_dir = root.path().join("emnist");
    let ctx = emnist_context(&ConvertOptions::default());
    let exporter = BundleExporter::new(&model_dir);

    let full = emnist_signatures(&ctx);
    let no_default = SignatureMap::new().with(
        "predict_images",
        full.get("predict_images").context("fixture")?.clone(),
    );
    let err = exporter.export(1, &no_default, &ctx).unwrap_err();
    ensure!(err.is_config(), "expected config error, got {err}");

    let err = exporter.export(0, &full, &ctx).unwrap_err();
    ensure!(err.is_config(), "expected config error, got {err}");

    ensure!(!model_dir.exists(), "model dir was created");
    Ok(())
}

#[test]
fn signature_must_reference_graph_tensors() -> Result<()> {
    let root = tempfile::tempdir()?;
    let ctx = emnist_context(&ConvertOptions::default());
    let mut signatures = emnist_signatures(&ctx);
    let mut broken = signatures.get("predict_images").context("fixture")?.clone();
    if let Some(desc) = broken.inputs.get_mut("images") {
        desc.name = "pixels".to_string();
    }
    signatures.insert("predict_images", broken);

    match BundleExporter::new(root.path()).export(1, &signatures, &ctx) {
        Err(Error::TensorNotFound(name)) => assert_eq!(name, "pixels"),
        other => panic!("expected TensorNotFound, got {other:?}"),
    }
    assert!(entries(root.path()).is_empty());
    Ok(())
}

#[test]
fn variables_round_trip() -> Result<()> {
    let root = tempfile::tempdir()?;
    let options = ConvertOptions {
        initializers_as_variables: true,
        ..Default::default()
    };
    let ctx = emnist_context(&options);
    let exported = BundleExporter::new(root.path()).export(1, &emnist_signatures(&ctx), &ctx)?;

    assert_eq!(
        entries(&exported.path),
        vec!["saved_model.pb".to_string(), "variables".to_string()]
    );
    assert_eq!(
        entries(&exported.path.join("variables")),
        vec![
            "variables.data-00000-of-00001".to_string(),
            "variables.index".to_string()
        ]
    );

    let loaded = load_bundle(&exported.path)?;
    assert_eq!(loaded.context.variables, ctx.variables);
    let weight = loaded.context.value("fc.weight").context("weight missing")?;
    assert_eq!(weight.dims.as_slice(), &[784, 62]);
    Ok(())
}

#[test]
fn versions_are_discovered_and_replaceable() -> Result<()> {
    let root = tempfile::tempdir()?;
    let ctx = emnist_context(&ConvertOptions::default());
    let signatures = emnist_signatures(&ctx);
    let exporter = BundleExporter::new(root.path());

    exporter.export(2, &signatures, &ctx)?;
    exporter.export(1, &signatures, &ctx)?;
    fs::create_dir(root.path().join(".3.tmp-abandoned"))?;

    assert_eq!(list_versions(root.path())?, vec![1, 2]);
    assert_eq!(latest_version(root.path())?, Some(2));
    assert_eq!(load_latest(root.path())?.version, Some(2));

    ensure!(remove_version(root.path(), 2)?, "version 2 not removed");
    ensure!(!remove_version(root.path(), 2)?, "second removal reported success");
    exporter.export(2, &signatures, &ctx)?;
    assert_eq!(list_versions(root.path())?, vec![1, 2]);
    Ok(())
}

#[test]
fn bundle_frontend_loads_version_dirs() -> Result<()> {
    let root = tempfile::tempdir()?;
    let ctx = emnist_context(&ConvertOptions::default());
    let exported = BundleExporter::new(root.path()).export(1, &emnist_signatures(&ctx), &ctx)?;

    let frontend = BundleFrontend::new();
    let reloaded = frontend.load(&ModelArtifact::BundleDir(exported.path))?;
    assert_eq!(reloaded.graph.outputs, vec!["y".to_string()]);

    let err = frontend.load(&ModelArtifact::OnnxBytes(Vec::new()));
    assert!(matches!(err, Err(Error::UnsupportedArtifact { .. })));
    Ok(())
}
