mod convert;
mod infer;
mod loader;

pub use convert::{convert, supported_ops, ConvertOptions};
pub use loader::{load_model, load_model_from_bytes, tensor_proto, value_info};

use bundleport_core::{Error, ExecutionContext, Frontend, ModelArtifact, Result};

pub struct OnnxFrontend {
    options: ConvertOptions,
}

impl OnnxFrontend {
    pub fn new() -> Self {
        Self::with_options(ConvertOptions::default())
    }

    pub fn with_options(options: ConvertOptions) -> Self {
        Self { options }
    }
}

impl Default for OnnxFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl Frontend for OnnxFrontend {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn load(&self, artifact: &ModelArtifact) -> Result<ExecutionContext> {
        let model = match artifact {
            ModelArtifact::OnnxPath(path) => load_model(path)?,
            ModelArtifact::OnnxBytes(bytes) => load_model_from_bytes(bytes)?,
            other => {
                return Err(Error::UnsupportedArtifact {
                    frontend: self.name().to_string(),
                    artifact: other.to_string(),
                })
            }
        };
        convert(&model, &self.options)
    }
}
