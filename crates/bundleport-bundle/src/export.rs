use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use bundleport_core::{Error, ExecutionContext, Result, SignatureMap};
use bundleport_proto::saved_model::{self as pb, VariableEntry, VariablesIndex};
use bundleport_proto::{
    SAVED_MODEL_FILENAME, SAVED_MODEL_SCHEMA_VERSION, SERVING_TAG, VARIABLES_DATA_FILENAME,
    VARIABLES_DIRECTORY, VARIABLES_INDEX_FILENAME,
};
use prost::Message;
use tracing::{debug, info, warn};

use crate::codec::{dtype_to_pb, meta_graph_to_pb, shape_to_pb};
use crate::discovery::latest_version;

#[derive(Clone, Debug)]
pub struct ExportOptions {
    /// Tags recorded on the meta graph.
    pub tags: Vec<String>,
    /// Clear write permission on every exported file.
    pub mark_read_only: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            tags: vec![SERVING_TAG.to_string()],
            mark_read_only: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExportedBundle {
    pub path: PathBuf,
    pub version: u64,
    /// Paths relative to `path`.
    pub files: Vec<PathBuf>,
}

/// Writes versioned bundles under one model directory.
///
/// A version directory is either absent or complete: everything is staged in
/// a hidden sibling directory and moved into place with a single rename.
pub struct BundleExporter {
    model_dir: PathBuf,
    options: ExportOptions,
}

impl BundleExporter {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self::with_options(model_dir, ExportOptions::default())
    }

    pub fn with_options(model_dir: impl Into<PathBuf>, options: ExportOptions) -> Self {
        Self {
            model_dir: model_dir.into(),
            options,
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn version_dir(&self, version: u64) -> PathBuf {
        self.model_dir.join(version.to_string())
    }

    pub fn export(
        &self,
        version: u64,
        signatures: &SignatureMap,
        ctx: &ExecutionContext,
    ) -> Result<ExportedBundle> {
        let target = self.version_dir(version);
        self.validate(version, signatures, ctx, &target)?;

        if let Some(latest) = latest_version(&self.model_dir)? {
            if version < latest {
                warn!(
                    version,
                    latest,
                    "exporting below the latest version; serving will keep the latest"
                );
            }
        }

        let meta = meta_graph_to_pb(ctx, signatures, &self.options.tags)?;
        let saved_model = pb::SavedModel {
            saved_model_schema_version: SAVED_MODEL_SCHEMA_VERSION,
            meta_graphs: vec![meta],
        };

        let files = self.commit(version, &target, |staging| {
            let mut files = vec![PathBuf::from(SAVED_MODEL_FILENAME)];
            write_file(
                &staging.join(SAVED_MODEL_FILENAME),
                &saved_model.encode_to_vec(),
            )?;
            if ctx.has_variables() {
                files.extend(write_variables(staging, ctx)?);
            }
            Ok(files)
        })?;

        info!(
            path = %target.display(),
            version,
            signatures = signatures.len(),
            nodes = ctx.graph.nodes.len(),
            "exported bundle"
        );
        Ok(ExportedBundle {
            path: target,
            version,
            files,
        })
    }

    /// Runs `write` against a fresh staging directory, then renames it to
    /// `target`. On any failure the staging directory is removed and `target`
    /// is left as it was.
    fn commit(
        &self,
        version: u64,
        target: &Path,
        write: impl FnOnce(&Path) -> Result<Vec<PathBuf>>,
    ) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.model_dir).map_err(|e| Error::io(&self.model_dir, e))?;
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{version}.tmp-"))
            .tempdir_in(&self.model_dir)
            .map_err(|e| Error::io(&self.model_dir, e))?;
        debug!(staging = %staging.path().display(), "staging bundle");

        let files = write(staging.path())?;
        if self.options.mark_read_only {
            for file in &files {
                mark_read_only(&staging.path().join(file))?;
            }
        }

        // From here on the guard must not delete whatever ends up at `target`.
        let staged = staging.keep();
        if let Err(e) = fs::rename(&staged, target) {
            if let Err(cleanup) = fs::remove_dir_all(&staged) {
                warn!(staging = %staged.display(), error = %cleanup, "could not remove staging dir");
            }
            // rename only replaces an empty directory, so a concurrent export
            // that got there first surfaces here.
            if target.exists() {
                return Err(Error::AlreadyExists(target.to_path_buf()));
            }
            return Err(Error::io(target, e));
        }
        Ok(files)
    }

    fn validate(
        &self,
        version: u64,
        signatures: &SignatureMap,
        ctx: &ExecutionContext,
        target: &Path,
    ) -> Result<()> {
        if version == 0 {
            return Err(Error::config("bundle version must be a positive integer"));
        }
        signatures.validate()?;

        for (key, signature) in signatures.iter() {
            for desc in signature.tensors() {
                let found = ctx.graph.tensor(&desc.name)?;
                if let (Some(want), Some(have)) = (desc.dtype, found.dtype) {
                    if want != have {
                        return Err(Error::config(format!(
                            "signature {key:?}: tensor {:?} is {have} in the graph, not {want}",
                            desc.name
                        )));
                    }
                }
            }
        }

        if target.exists() {
            return Err(Error::AlreadyExists(target.to_path_buf()));
        }
        Ok(())
    }
}

pub fn export_bundle(
    model_dir: impl Into<PathBuf>,
    version: u64,
    signatures: &SignatureMap,
    ctx: &ExecutionContext,
) -> Result<ExportedBundle> {
    BundleExporter::new(model_dir).export(version, signatures, ctx)
}

/// Deletes one version directory. Returns `false` when it did not exist.
pub fn remove_version(model_dir: impl AsRef<Path>, version: u64) -> Result<bool> {
    let dir = model_dir.as_ref().join(version.to_string());
    if !dir.exists() {
        return Ok(false);
    }
    make_writable(&dir)?;
    fs::remove_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    info!(path = %dir.display(), "removed bundle version");
    Ok(true)
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(|e| Error::io(path, e))?;
    file.write_all(bytes).map_err(|e| Error::io(path, e))?;
    file.sync_all().map_err(|e| Error::io(path, e))
}

fn write_variables(root: &Path, ctx: &ExecutionContext) -> Result<Vec<PathBuf>> {
    let dir = root.join(VARIABLES_DIRECTORY);
    fs::create_dir(&dir).map_err(|e| Error::io(&dir, e))?;

    let mut data = Vec::new();
    let mut index = VariablesIndex::default();
    for (name, value) in &ctx.variables {
        index.entries.push(VariableEntry {
            name: name.clone(),
            dtype: dtype_to_pb(value.dtype) as i32,
            shape: Some(shape_to_pb(Some(&value.shape()))),
            offset: data.len() as i64,
            size: value.bytes.len() as i64,
        });
        data.extend_from_slice(&value.bytes);
    }

    write_file(&dir.join(VARIABLES_INDEX_FILENAME), &index.encode_to_vec())?;
    write_file(&dir.join(VARIABLES_DATA_FILENAME), &data)?;
    debug!(count = index.entries.len(), bytes = data.len(), "wrote variables");

    let rel = Path::new(VARIABLES_DIRECTORY);
    Ok(vec![
        rel.join(VARIABLES_INDEX_FILENAME),
        rel.join(VARIABLES_DATA_FILENAME),
    ])
}

fn mark_read_only(path: &Path) -> Result<()> {
    let mut perms = fs::metadata(path)
        .map_err(|e| Error::io(path, e))?
        .permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms).map_err(|e| Error::io(path, e))
}

#[allow(clippy::permissions_set_readonly_false)]
fn make_writable(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path).map_err(|e| Error::io(path, e))?;
    if meta.is_dir() {
        for entry in fs::read_dir(path).map_err(|e| Error::io(path, e))? {
            let entry = entry.map_err(|e| Error::io(path, e))?;
            make_writable(&entry.path())?;
        }
    }
    let mut perms = meta.permissions();
    if perms.readonly() {
        perms.set_readonly(false);
        fs::set_permissions(path, perms).map_err(|e| Error::io(path, e))?;
    }
    Ok(())
}
