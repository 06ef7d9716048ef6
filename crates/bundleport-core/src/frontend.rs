use crate::{ExecutionContext, ModelArtifact, Result};

/// Turns a serialized model into a native graph held by a fresh context.
pub trait Frontend: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn load(&self, artifact: &ModelArtifact) -> Result<ExecutionContext>;
}
