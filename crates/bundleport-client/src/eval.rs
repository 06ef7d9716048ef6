use std::slice;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{ClientError, FailureKind, ServingClient};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LabeledExample {
    pub instance: Vec<f32>,
    pub label: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailedRequest {
    pub index: usize,
    pub kind: FailureKind,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct EvaluationReport {
    pub total: usize,
    pub correct: usize,
    /// Requests that never produced a score vector. Each also counts as a miss.
    pub failures: Vec<FailedRequest>,
}

impl EvaluationReport {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f64 / self.total as f64
    }
}

/// Index of the largest score; ties go to the lowest index.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &s)| match best {
            Some((_, b)) if s <= b || s.is_nan() => best,
            _ => Some((i, s)),
        })
        .map(|(i, _)| i)
}

impl ServingClient {
    /// Sends one request per example and compares the arg-max of the returned
    /// scores with the label. Failed requests are logged and scored as misses.
    pub async fn evaluate(&self, model: &str, examples: &[LabeledExample]) -> EvaluationReport {
        let mut report = EvaluationReport::default();
        for (index, example) in examples.iter().enumerate() {
            report.total += 1;
            let outcome = self
                .predict(model, slice::from_ref(&example.instance))
                .await
                .and_then(|rows| {
                    rows.first()
                        .and_then(|scores| argmax(scores))
                        .ok_or_else(|| ClientError::Shape("empty score vector".to_string()))
                });
            match outcome {
                Ok(predicted) if predicted == example.label => report.correct += 1,
                Ok(predicted) => {
                    debug!(index, predicted, label = example.label, "misclassified");
                }
                Err(err) => {
                    warn!(index, kind = ?err.kind(), error = %err, "prediction failed");
                    report.failures.push(FailedRequest {
                        index,
                        kind: err.kind(),
                    });
                }
            }
            debug!(
                index,
                accuracy = report.correct as f64 / report.total as f64,
                "running accuracy"
            );
        }
        info!(
            total = report.total,
            correct = report.correct,
            failed = report.failures.len(),
            accuracy = report.accuracy(),
            "evaluation finished"
        );
        report
    }
}
