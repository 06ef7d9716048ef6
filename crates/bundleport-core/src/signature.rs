//! Serving signatures: which tensors a request method reads and writes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result, TensorDescriptor};

/// Signature-map key the serving binary uses when a request names no signature.
pub const DEFAULT_SERVING_SIGNATURE_KEY: &str = "serving_default";

pub const CLASSIFY_INPUTS: &str = "inputs";
pub const CLASSIFY_OUTPUT_CLASSES: &str = "classes";
pub const CLASSIFY_OUTPUT_SCORES: &str = "scores";
pub const REGRESS_INPUTS: &str = "inputs";
pub const REGRESS_OUTPUTS: &str = "outputs";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MethodContract {
    Classify,
    Predict,
    Regress,
}

impl MethodContract {
    /// Protocol identifier written into the bundle.
    pub fn method_name(self) -> &'static str {
        match self {
            MethodContract::Classify => "tensorflow/serving/classify",
            MethodContract::Predict => "tensorflow/serving/predict",
            MethodContract::Regress => "tensorflow/serving/regress",
        }
    }

    pub fn from_method_name(name: &str) -> Result<Self> {
        match name {
            "tensorflow/serving/classify" => Ok(MethodContract::Classify),
            "tensorflow/serving/predict" => Ok(MethodContract::Predict),
            "tensorflow/serving/regress" => Ok(MethodContract::Regress),
            other => Err(Error::config(format!("unknown method name {other:?}"))),
        }
    }
}

impl fmt::Display for MethodContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MethodContract::Classify => "CLASSIFY",
            MethodContract::Predict => "PREDICT",
            MethodContract::Regress => "REGRESS",
        })
    }
}

impl FromStr for MethodContract {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CLASSIFY" => Ok(MethodContract::Classify),
            "PREDICT" => Ok(MethodContract::Predict),
            "REGRESS" => Ok(MethodContract::Regress),
            _ => MethodContract::from_method_name(s),
        }
    }
}

impl PartialEq<&str> for MethodContract {
    fn eq(&self, other: &&str) -> bool {
        self.to_string() == *other
    }
}

/// Which classification output a classify signature exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassifyOutput {
    Scores,
    Classes,
}

impl ClassifyOutput {
    pub fn key(self) -> &'static str {
        match self {
            ClassifyOutput::Scores => CLASSIFY_OUTPUT_SCORES,
            ClassifyOutput::Classes => CLASSIFY_OUTPUT_CLASSES,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    pub method: MethodContract,
    pub inputs: BTreeMap<String, TensorDescriptor>,
    pub outputs: BTreeMap<String, TensorDescriptor>,
}

impl Signature {
    pub fn tensors(&self) -> impl Iterator<Item = &TensorDescriptor> {
        self.inputs.values().chain(self.outputs.values())
    }
}

#[derive(Clone, Debug)]
pub struct SignatureBuilder {
    method: MethodContract,
    inputs: Vec<(String, TensorDescriptor)>,
    outputs: Vec<(String, TensorDescriptor)>,
}

impl SignatureBuilder {
    pub fn new(method: MethodContract) -> Self {
        Self {
            method,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, key: impl Into<String>, desc: TensorDescriptor) -> Self {
        self.inputs.push((key.into(), desc));
        self
    }

    pub fn output(mut self, key: impl Into<String>, desc: TensorDescriptor) -> Self {
        self.outputs.push((key.into(), desc));
        self
    }

    pub fn build(self) -> Result<Signature> {
        let method = self.method;
        if self.inputs.is_empty() {
            return Err(Error::config(format!("{method} signature has no inputs")));
        }
        if self.outputs.is_empty() {
            return Err(Error::config(format!("{method} signature has no outputs")));
        }

        match method {
            MethodContract::Classify => {
                check_keys(method, "input", &self.inputs, &[CLASSIFY_INPUTS])?;
                check_keys(
                    method,
                    "output",
                    &self.outputs,
                    &[CLASSIFY_OUTPUT_CLASSES, CLASSIFY_OUTPUT_SCORES],
                )?;
            }
            MethodContract::Regress => {
                check_keys(method, "input", &self.inputs, &[REGRESS_INPUTS])?;
                check_keys(method, "output", &self.outputs, &[REGRESS_OUTPUTS])?;
            }
            MethodContract::Predict => {
                for (key, _) in self.inputs.iter().chain(&self.outputs) {
                    if key.is_empty() {
                        return Err(Error::config("PREDICT signature keys must be non-empty"));
                    }
                }
            }
        }

        Ok(Signature {
            method,
            inputs: collect_side(method, "input", self.inputs)?,
            outputs: collect_side(method, "output", self.outputs)?,
        })
    }
}

fn check_keys(
    method: MethodContract,
    side: &str,
    entries: &[(String, TensorDescriptor)],
    allowed: &[&str],
) -> Result<()> {
    for (key, _) in entries {
        if !allowed.contains(&key.as_str()) {
            return Err(Error::config(format!(
                "{method} signature {side} key must be one of {allowed:?}, got {key:?}"
            )));
        }
    }
    Ok(())
}

fn collect_side(
    method: MethodContract,
    side: &str,
    entries: Vec<(String, TensorDescriptor)>,
) -> Result<BTreeMap<String, TensorDescriptor>> {
    let mut map = BTreeMap::new();
    for (key, desc) in entries {
        validate_descriptor(&desc)?;
        if map.insert(key.clone(), desc).is_some() {
            return Err(Error::config(format!(
                "{method} signature has duplicate {side} key {key:?}"
            )));
        }
    }
    Ok(map)
}

/// A descriptor can appear in a signature only with a dtype and at least one dimension.
pub fn validate_descriptor(desc: &TensorDescriptor) -> Result<()> {
    if desc.dtype.is_none() {
        return Err(Error::config(format!("tensor {:?} has no dtype", desc.name)));
    }
    match &desc.shape {
        None => Err(Error::config(format!(
            "tensor {:?} has an unknown shape",
            desc.name
        ))),
        Some(shape) if shape.rank() == 0 => Err(Error::config(format!(
            "tensor {:?} has a zero-dimensional shape",
            desc.name
        ))),
        Some(_) => Ok(()),
    }
}

pub fn classification_signature(
    input: &TensorDescriptor,
    output: &TensorDescriptor,
    output_key: ClassifyOutput,
) -> Result<Signature> {
    SignatureBuilder::new(MethodContract::Classify)
        .input(CLASSIFY_INPUTS, input.clone())
        .output(output_key.key(), output.clone())
        .build()
}

pub fn predict_signature<I, O, K>(inputs: I, outputs: O) -> Result<Signature>
where
    I: IntoIterator<Item = (K, TensorDescriptor)>,
    O: IntoIterator<Item = (K, TensorDescriptor)>,
    K: Into<String>,
{
    let mut builder = SignatureBuilder::new(MethodContract::Predict);
    for (key, desc) in inputs {
        builder = builder.input(key, desc);
    }
    for (key, desc) in outputs {
        builder = builder.output(key, desc);
    }
    builder.build()
}

pub fn regression_signature(input: &TensorDescriptor, output: &TensorDescriptor) -> Result<Signature> {
    SignatureBuilder::new(MethodContract::Regress)
        .input(REGRESS_INPUTS, input.clone())
        .output(REGRESS_OUTPUTS, output.clone())
        .build()
}

/// Signatures keyed by name, as stored in a bundle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignatureMap {
    entries: BTreeMap<String, Signature>,
}

impl SignatureMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, signature: Signature) -> Option<Signature> {
        self.entries.insert(key.into(), signature)
    }

    pub fn with(mut self, key: impl Into<String>, signature: Signature) -> Self {
        self.insert(key, signature);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Signature> {
        self.entries.get(key)
    }

    pub fn default_signature(&self) -> Option<&Signature> {
        self.get(DEFAULT_SERVING_SIGNATURE_KEY)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Signature)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_signature().is_none() {
            return Err(Error::config(format!(
                "signature map is missing the {DEFAULT_SERVING_SIGNATURE_KEY:?} key"
            )));
        }
        for (key, sig) in &self.entries {
            if key.is_empty() {
                return Err(Error::config("signature map keys must be non-empty"));
            }
            for desc in sig.tensors() {
                validate_descriptor(desc)?;
            }
        }
        Ok(())
    }
}
