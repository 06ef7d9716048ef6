use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ensure, Result};
use axum::body::Bytes;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use bundleport_client::{argmax, ClientConfig, FailureKind, LabeledExample, ServingClient};
use serde_json::{json, Value};

const CLASSES: usize = 62;
const PIXELS: usize = 784;

/// Scores peak at `round(first pixel) % 62`, so tests can pick the label.
fn scores_for(instance: &[f32]) -> Vec<f32> {
    let peak = instance[0].round() as usize % CLASSES;
    (0..CLASSES)
        .map(|i| if i == peak { 0.9 } else { 0.1 / CLASSES as f32 })
        .collect()
}

async fn fake_server(method: Method, uri: Uri, body: Bytes) -> Response {
    let path = uri.path();
    match (method.as_str(), path) {
        ("GET", "/v1/models/emnist") | ("GET", "/v1/models/emnist/versions/1") => {
            Json(json!({
                "model_version_status": [
                    {"version": "1", "state": "AVAILABLE", "status": {"error_code": "OK"}}
                ]
            }))
            .into_response()
        }
        ("POST", "/v1/models/emnist:predict") => {
            let Ok(req) = serde_json::from_slice::<Value>(&body) else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            let rows: Vec<Vec<f32>> =
                serde_json::from_value(req["instances"].clone()).unwrap_or_default();
            if rows.iter().any(|r| r.len() != PIXELS) {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "input must have 784 values"})),
                )
                    .into_response();
            }
            let predictions: Vec<Vec<f32>> = rows.iter().map(|r| scores_for(r)).collect();
            Json(json!({ "predictions": predictions })).into_response()
        }
        ("POST", "/v1/models/slow:predict") => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Json(json!({"predictions": []})).into_response()
        }
        ("POST", "/v1/models/short:predict") => {
            Json(json!({"predictions": [[0.5, 0.5]]})).into_response()
        }
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Servable not found for request: {path}")})),
        )
            .into_response(),
    }
}

async fn spawn_server() -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new().fallback(fake_server);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

fn client(addr: SocketAddr, config: ClientConfig) -> Result<ServingClient> {
    Ok(ServingClient::new(&format!("http://{addr}/"), config)?)
}

fn image(label: usize) -> Vec<f32> {
    let mut pixels = vec![0.0; PIXELS];
    pixels[0] = label as f32;
    pixels
}

#[tokio::test]
async fn predicts_one_row_per_instance() -> Result<()> {
    let addr = spawn_server().await?;
    let client = client(addr, ClientConfig::default())?;

    let instances = vec![image(3), image(17), image(61)];
    let predictions = client.predict_checked("emnist", &instances, PIXELS).await?;

    assert_eq!(predictions.len(), 3);
    for (row, want) in predictions.iter().zip([3, 17, 61]) {
        let got = argmax(row);
        ensure!(got.is_some_and(|c| c < CLASSES), "arg-max out of range: {got:?}");
        assert_eq!(got, Some(want));
    }
    Ok(())
}

#[tokio::test]
async fn missing_model_is_reported_not_raised() -> Result<()> {
    let addr = spawn_server().await?;
    let client = client(addr, ClientConfig::default())?;

    let report = client.status("mnist", None).await?;
    assert_eq!(report.status, 404);
    ensure!(!report.is_success(), "404 reported as success");
    ensure!(report.body["error"].is_string(), "body: {}", report.body);

    let ok = client.status("emnist", Some(1)).await?;
    ensure!(ok.is_success(), "status {}", ok.status);
    assert_eq!(ok.body["model_version_status"][0]["state"], "AVAILABLE");

    let meta = client.metadata("emnist", None).await?;
    assert_eq!(meta.status, 404);
    Ok(())
}

#[tokio::test]
async fn slow_server_is_a_timeout() -> Result<()> {
    let addr = spawn_server().await?;
    let config = ClientConfig {
        timeout_ms: 200,
        max_retries: 0,
        ..Default::default()
    };
    let client = client(addr, config)?;

    let err = client.predict("slow", &[image(1)]).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Timeout);
    Ok(())
}

#[tokio::test]
async fn unreachable_server_is_a_connect_failure() -> Result<()> {
    // Grab a free port, then close it again.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?
    };
    let config = ClientConfig {
        max_retries: 1,
        backoff_ms: 10,
        ..Default::default()
    };
    let client = client(addr, config)?;

    let err = client.status("emnist", None).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Connect);
    Ok(())
}

#[tokio::test]
async fn prediction_count_must_match() -> Result<()> {
    let addr = spawn_server().await?;
    let client = client(addr, ClientConfig::default())?;

    let err = client
        .predict("short", &[image(1), image(2)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Shape);
    Ok(())
}

#[tokio::test]
async fn evaluation_continues_past_failures() -> Result<()> {
    let addr = spawn_server().await?;
    let client = client(addr, ClientConfig::default())?;

    let examples = vec![
        LabeledExample { instance: image(5), label: 5 },
        LabeledExample { instance: vec![0.0; 10], label: 0 },
        LabeledExample { instance: image(9), label: 8 },
        LabeledExample { instance: image(40), label: 40 },
    ];
    let report = client.evaluate("emnist", &examples).await;

    assert_eq!(report.total, 4);
    assert_eq!(report.correct, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].index, 1);
    assert_eq!(report.failures[0].kind, FailureKind::Status(400));
    ensure!((report.accuracy() - 0.5).abs() < 1e-9, "accuracy {}", report.accuracy());
    Ok(())
}
