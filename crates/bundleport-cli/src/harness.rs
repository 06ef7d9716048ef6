use std::path::Path;

use anyhow::{bail, Context, Result};
use bundleport_client::{argmax, ClientConfig, LabeledExample, ServingClient};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::cli::ServerArgs;

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn connect(server: &ServerArgs) -> Result<ServingClient> {
    let config = match &server.client_config {
        Some(path) => read_json::<ClientConfig>(path)?,
        None => ClientConfig::default(),
    };
    ServingClient::new(&server.url, config).context("failed to build HTTP client")
}

pub async fn status(server: ServerArgs, version: Option<u64>, metadata: bool) -> Result<()> {
    let client = connect(&server)?;
    let report = if metadata {
        client.metadata(&server.model, version).await?
    } else {
        client.status(&server.model, version).await?
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_success() {
        bail!("server answered {} for model {}", report.status, server.model);
    }
    Ok(())
}

pub async fn predict(server: ServerArgs, instances: &Path, input_dim: Option<usize>) -> Result<()> {
    let client = connect(&server)?;
    let instances: Vec<Vec<f32>> = read_json(instances)?;
    let predictions = match input_dim {
        Some(dim) => client.predict_checked(&server.model, &instances, dim).await?,
        None => client.predict(&server.model, &instances).await?,
    };
    let classes: Vec<Option<usize>> = predictions.iter().map(|row| argmax(row)).collect();
    let out = json!({ "predictions": predictions, "classes": classes });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

pub async fn evaluate(server: ServerArgs, examples: &Path, min_accuracy: Option<f64>) -> Result<()> {
    let client = connect(&server)?;
    let examples: Vec<LabeledExample> = read_json(examples)?;
    let report = client.evaluate(&server.model, &examples).await;

    let out = json!({
        "total": report.total,
        "correct": report.correct,
        "accuracy": report.accuracy(),
        "failures": report.failures,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);

    if let Some(min) = min_accuracy {
        if report.accuracy() < min {
            bail!("accuracy {:.4} is below {min}", report.accuracy());
        }
    }
    Ok(())
}
