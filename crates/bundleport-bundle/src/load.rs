use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use bundleport_core::{
    Error, ExecutionContext, Frontend, ModelArtifact, Result, SignatureMap, TensorValue,
};
use bundleport_proto::saved_model::{self as pb, VariablesIndex};
use bundleport_proto::{
    SAVED_MODEL_FILENAME, VARIABLES_DATA_FILENAME, VARIABLES_DIRECTORY, VARIABLES_INDEX_FILENAME,
};
use bytes::Bytes;
use prost::Message;
use tracing::debug;

use crate::codec::{pb_to_dtype, pb_to_meta_graph, pb_to_shape};
use crate::discovery::latest_version;

#[derive(Clone, Debug)]
pub struct LoadedBundle {
    /// Parsed from the directory name when it is numeric.
    pub version: Option<u64>,
    pub tags: Vec<String>,
    pub context: ExecutionContext,
    pub signatures: SignatureMap,
}

pub fn load_bundle(version_dir: impl AsRef<Path>) -> Result<LoadedBundle> {
    let dir = version_dir.as_ref();
    let path = dir.join(SAVED_MODEL_FILENAME);
    let bytes = fs::read(&path).map_err(|e| Error::io(&path, e))?;
    let saved_model = pb::SavedModel::decode(bytes.as_slice()).map_err(|e| Error::Decode {
        what: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let meta = saved_model
        .meta_graphs
        .first()
        .ok_or_else(|| Error::InvalidModel(format!("{} has no meta graph", path.display())))?;
    let tags = meta
        .meta_info_def
        .as_ref()
        .map(|info| info.tags.clone())
        .unwrap_or_default();
    let (mut context, signatures) = pb_to_meta_graph(meta)?;

    let variables_dir = dir.join(VARIABLES_DIRECTORY);
    if variables_dir.is_dir() {
        context.variables = read_variables(&variables_dir)?;
    }

    let version = dir
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.parse().ok());
    debug!(
        path = %dir.display(),
        nodes = context.graph.nodes.len(),
        signatures = signatures.len(),
        "loaded bundle"
    );
    Ok(LoadedBundle {
        version,
        tags,
        context,
        signatures,
    })
}

/// Loads the highest version under `model_dir`.
pub fn load_latest(model_dir: impl AsRef<Path>) -> Result<LoadedBundle> {
    let model_dir = model_dir.as_ref();
    let version = latest_version(model_dir)?.ok_or_else(|| {
        Error::InvalidModel(format!("no bundle versions under {}", model_dir.display()))
    })?;
    load_bundle(model_dir.join(version.to_string()))
}

fn read_variables(dir: &Path) -> Result<BTreeMap<String, TensorValue>> {
    let index_path = dir.join(VARIABLES_INDEX_FILENAME);
    let data_path = dir.join(VARIABLES_DATA_FILENAME);
    let index_bytes = fs::read(&index_path).map_err(|e| Error::io(&index_path, e))?;
    let index = VariablesIndex::decode(index_bytes.as_slice()).map_err(|e| Error::Decode {
        what: index_path.display().to_string(),
        reason: e.to_string(),
    })?;
    let data = Bytes::from(fs::read(&data_path).map_err(|e| Error::io(&data_path, e))?);

    let mut variables = BTreeMap::new();
    for entry in &index.entries {
        let corrupt = |reason: String| Error::Decode {
            what: format!("variable {:?}", entry.name),
            reason,
        };
        let dtype = pb_to_dtype(entry.dtype)?
            .ok_or_else(|| corrupt("missing dtype".to_string()))?;
        let dims = entry
            .shape
            .as_ref()
            .and_then(pb_to_shape)
            .and_then(|s| s.concrete())
            .ok_or_else(|| corrupt("shape is not concrete".to_string()))?;
        let start = usize::try_from(entry.offset).map_err(|e| corrupt(e.to_string()))?;
        let len = usize::try_from(entry.size).map_err(|e| corrupt(e.to_string()))?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| corrupt(format!("range {start}+{len} exceeds data file")))?;
        let value = TensorValue::from_bytes(dtype, &dims, data.slice(start..end))?;
        variables.insert(entry.name.clone(), value);
    }
    Ok(variables)
}

/// Reads exported bundles back into an [`ExecutionContext`].
#[derive(Default)]
pub struct BundleFrontend;

impl BundleFrontend {
    pub fn new() -> Self {
        Self
    }
}

impl Frontend for BundleFrontend {
    fn name(&self) -> &'static str {
        "bundle"
    }

    fn load(&self, artifact: &ModelArtifact) -> Result<ExecutionContext> {
        let ModelArtifact::BundleDir(dir) = artifact else {
            return Err(Error::UnsupportedArtifact {
                frontend: self.name().to_string(),
                artifact: artifact.to_string(),
            });
        };
        Ok(load_bundle(dir)?.context)
    }
}
