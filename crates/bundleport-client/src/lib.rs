//! Verification client for a running model server.

mod client;
mod config;
mod error;
mod eval;

pub use client::{ServingClient, StatusReport};
pub use config::ClientConfig;
pub use error::{ClientError, FailureKind, Result};
pub use eval::{argmax, EvaluationReport, FailedRequest, LabeledExample};
