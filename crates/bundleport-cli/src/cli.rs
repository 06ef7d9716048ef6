use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "bundleport", version, about = "ONNX to serving bundle converter")]
pub struct Cli {
    /// Log filter (RUST_LOG syntax)
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Describe an ONNX file or an exported bundle version
    Inspect {
        /// ONNX file or bundle version directory
        path: PathBuf,
    },

    /// Convert an ONNX model into a versioned serving bundle
    Convert(ConvertArgs),

    /// Query model status on a running server
    Status {
        #[command(flatten)]
        server: ServerArgs,

        /// Specific version to query
        #[arg(long)]
        version: Option<u64>,

        /// Query `/metadata` instead of status
        #[arg(long)]
        metadata: bool,
    },

    /// Send a batch of instances for prediction
    Predict {
        #[command(flatten)]
        server: ServerArgs,

        /// JSON file holding an array of instances
        #[arg(long)]
        instances: PathBuf,

        /// Expected width of every instance
        #[arg(long)]
        input_dim: Option<usize>,
    },

    /// Measure accuracy against labeled examples
    Evaluate {
        #[command(flatten)]
        server: ServerArgs,

        /// JSON file holding `[{"instance": [...], "label": n}, ...]`
        #[arg(long)]
        examples: PathBuf,

        /// Fail when accuracy ends up below this value
        #[arg(long)]
        min_accuracy: Option<f64>,
    },
}

#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// Path to the ONNX model
    #[arg(long)]
    pub onnx: PathBuf,

    /// Directory holding one subdirectory per model
    #[arg(long, default_value = "models")]
    pub base_path: PathBuf,

    #[arg(long, default_value = "emnist")]
    pub model_name: String,

    #[arg(long, default_value_t = 1)]
    pub version: u64,

    /// Graph tensor fed by the signatures (defaults to the first graph input)
    #[arg(long)]
    pub input_tensor: Option<String>,

    /// Graph tensor returned by the signatures (defaults to the first graph output)
    #[arg(long)]
    pub output_tensor: Option<String>,

    /// Input key of the `predict_images` signature
    #[arg(long, default_value = "images")]
    pub predict_input_key: String,

    /// Output key of the `predict_images` signature
    #[arg(long, default_value = "scores")]
    pub predict_output_key: String,

    /// Store weights under `variables/` instead of inline constants
    #[arg(long)]
    pub initializers_as_variables: bool,

    /// Remove an existing bundle with the same version first
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Base URL of the model server's REST API
    #[arg(long, env = "BUNDLEPORT_URL", default_value = "http://localhost:8501")]
    pub url: String,

    #[arg(long, env = "BUNDLEPORT_MODEL", default_value = "emnist")]
    pub model: String,

    /// JSON file with timeout_ms / max_retries / backoff_ms
    #[arg(long)]
    pub client_config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn convert_defaults() {
        let cli = Cli::parse_from(["bundleport", "convert", "--onnx", "emnist.onnx"]);
        let Command::Convert(args) = cli.command else {
            panic!("expected convert");
        };
        assert_eq!(args.base_path, PathBuf::from("models"));
        assert_eq!(args.model_name, "emnist");
        assert_eq!(args.version, 1);
        assert_eq!(args.predict_input_key, "images");
        assert!(!args.force);
        assert_eq!(cli.log, "info");
    }
}
