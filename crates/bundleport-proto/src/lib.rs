//! Protocol buffer types for the formats bundleport reads and writes.
//!
//! The messages are checked in rather than generated so the build does not need `protoc`.

pub mod onnx;
pub mod saved_model;

/// File name the serving binary looks for inside a version directory.
pub const SAVED_MODEL_FILENAME: &str = "saved_model.pb";
pub const VARIABLES_DIRECTORY: &str = "variables";
pub const VARIABLES_INDEX_FILENAME: &str = "variables.index";
pub const VARIABLES_DATA_FILENAME: &str = "variables.data-00000-of-00001";
pub const SERVING_TAG: &str = "serve";
pub const SAVED_MODEL_SCHEMA_VERSION: i64 = 1;
