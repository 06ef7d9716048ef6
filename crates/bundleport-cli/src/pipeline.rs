use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use bundleport_bundle::{load_bundle, remove_version, BundleExporter};
use bundleport_core::{
    classification_signature, predict_signature, ClassifyOutput, ExecutionContext, Frontend,
    ModelArtifact, SignatureMap, DEFAULT_SERVING_SIGNATURE_KEY,
};
use bundleport_onnx::{ConvertOptions, OnnxFrontend};
use tracing::{info, warn};

use crate::cli::ConvertArgs;

const PREDICT_SIGNATURE_KEY: &str = "predict_images";

pub fn inspect(path: &Path) -> Result<()> {
    if path.is_dir() {
        let bundle = load_bundle(path)
            .with_context(|| format!("failed to load bundle {}", path.display()))?;
        println!("bundle {} (tags: {})", path.display(), bundle.tags.join(","));
        describe(&bundle.context);
        for (key, sig) in bundle.signatures.iter() {
            println!("signature {key} [{}]", sig.method);
            for (k, d) in &sig.inputs {
                println!("  in  {k} -> {}", describe_tensor(d));
            }
            for (k, d) in &sig.outputs {
                println!("  out {k} -> {}", describe_tensor(d));
            }
        }
    } else {
        let ctx = OnnxFrontend::new()
            .load(&ModelArtifact::OnnxPath(path.to_path_buf()))
            .with_context(|| format!("failed to convert {}", path.display()))?;
        describe(&ctx);
    }
    Ok(())
}

fn describe(ctx: &ExecutionContext) {
    let graph = &ctx.graph;
    println!(
        "graph {:?}: {} nodes, producer {} {} (opset {})",
        graph.name,
        graph.nodes.len(),
        ctx.producer.name,
        ctx.producer.version,
        ctx.producer.opset
    );
    for name in &graph.inputs {
        if let Ok(d) = graph.tensor(name) {
            println!("  input  {}", describe_tensor(d));
        }
    }
    for name in &graph.outputs {
        if let Ok(d) = graph.tensor(name) {
            println!("  output {}", describe_tensor(d));
        }
    }
    let mut ops: BTreeMap<&str, usize> = BTreeMap::new();
    for node in &graph.nodes {
        *ops.entry(node.op.as_str()).or_default() += 1;
    }
    let ops: Vec<String> = ops.iter().map(|(op, n)| format!("{op}x{n}")).collect();
    println!("  ops    {}", ops.join(" "));
}

fn describe_tensor(d: &bundleport_core::TensorDescriptor) -> String {
    let dtype = d.dtype.map(|t| t.to_string()).unwrap_or_else(|| "?".into());
    let shape = d.shape.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "?".into());
    format!("{} {dtype}{shape}", d.name)
}

pub fn convert(args: ConvertArgs) -> Result<()> {
    let options = ConvertOptions {
        initializers_as_variables: args.initializers_as_variables,
        ..Default::default()
    };
    let ctx = OnnxFrontend::with_options(options)
        .load(&ModelArtifact::OnnxPath(args.onnx.clone()))
        .with_context(|| format!("failed to convert {}", args.onnx.display()))?;

    let input = pick(&args.input_tensor, &ctx.graph.inputs, "input")?;
    let output = pick(&args.output_tensor, &ctx.graph.outputs, "output")?;
    let x = ctx.graph.tensor(&input)?.clone();
    let y = ctx.graph.tensor(&output)?.clone();

    let signatures = SignatureMap::new()
        .with(
            DEFAULT_SERVING_SIGNATURE_KEY,
            classification_signature(&x, &y, ClassifyOutput::Scores)?,
        )
        .with(
            PREDICT_SIGNATURE_KEY,
            predict_signature(
                [(args.predict_input_key.as_str(), x)],
                [(args.predict_output_key.as_str(), y)],
            )?,
        );

    let model_dir = args.base_path.join(&args.model_name);
    if args.force && remove_version(&model_dir, args.version)? {
        warn!(version = args.version, "replaced existing bundle version");
    }

    let exported = BundleExporter::new(&model_dir).export(args.version, &signatures, &ctx)?;
    info!(path = %exported.path.display(), files = exported.files.len(), "bundle ready");
    println!("{}", exported.path.display());
    Ok(())
}

fn pick(explicit: &Option<String>, available: &[String], what: &str) -> Result<String> {
    if let Some(name) = explicit {
        return Ok(name.clone());
    }
    match available {
        [only] => Ok(only.clone()),
        [first, ..] => {
            warn!(tensor = %first, "graph has several {what}s, using the first");
            Ok(first.clone())
        }
        [] => bail!("graph has no {what} tensors; pass --{what}-tensor"),
    }
}
