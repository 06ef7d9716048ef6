pub mod artifact;
pub mod context;
pub mod error;
pub mod frontend;
pub mod graph;
pub mod signature;
pub mod tensor;

pub use artifact::*;
pub use context::*;
pub use error::*;
pub use frontend::*;
pub use graph::*;
pub use signature::*;
pub use tensor::*;
