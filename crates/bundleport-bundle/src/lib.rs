//! Versioned serving bundles: atomic export, discovery and reload.

mod codec;
mod discovery;
mod export;
mod load;

pub use discovery::{latest_version, list_versions};
pub use export::{export_bundle, remove_version, BundleExporter, ExportOptions, ExportedBundle};
pub use load::{load_bundle, load_latest, BundleFrontend, LoadedBundle};
