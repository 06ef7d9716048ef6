use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub enum ModelArtifact {
    OnnxPath(PathBuf),
    OnnxBytes(Vec<u8>),
    /// A single exported version directory, `{base}/{model}/{version}`.
    BundleDir(PathBuf),
}

impl fmt::Display for ModelArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelArtifact::OnnxPath(p) => write!(f, "onnx file {}", p.display()),
            ModelArtifact::OnnxBytes(b) => write!(f, "onnx bytes ({} bytes)", b.len()),
            ModelArtifact::BundleDir(p) => write!(f, "bundle dir {}", p.display()),
        }
    }
}
