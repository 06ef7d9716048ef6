use std::fs;
use std::io;
use std::path::Path;

use bundleport_core::{Error, Result};

/// Version numbers present under `model_dir`, ascending.
///
/// Only directories named by a positive integer count; in-flight export
/// directories (`.{version}.tmp-*`) and stray files are skipped. A missing
/// `model_dir` has no versions.
pub fn list_versions(model_dir: impl AsRef<Path>) -> Result<Vec<u64>> {
    let model_dir = model_dir.as_ref();
    let entries = match fs::read_dir(model_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(model_dir, e)),
    };

    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(model_dir, e))?;
        let is_dir = entry
            .file_type()
            .map_err(|e| Error::io(entry.path(), e))?
            .is_dir();
        if !is_dir {
            continue;
        }
        if let Some(version) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u64>().ok())
            .filter(|v| *v > 0)
        {
            versions.push(version);
        }
    }
    versions.sort_unstable();
    Ok(versions)
}

pub fn latest_version(model_dir: impl AsRef<Path>) -> Result<Option<u64>> {
    Ok(list_versions(model_dir)?.last().copied())
}
