// =============================================================================
// Model runtimes — in-process scorer and external IPC process
// =============================================================================
//
// Both variants honour the same contract: `predict` receives a validated
// feature slice of length `dimension()` and returns class probabilities
// [p0, p1]. Timeouts and cancellation are enforced by the gate, not here; a
// cancelled future must leave the runtime reusable.
// =============================================================================

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Inference backend for the ML gate.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Expected feature-vector length.
    fn dimension(&self) -> usize;

    /// Class probabilities [p0, p1] for one feature vector.
    async fn predict(&self, features: &[f64]) -> Result<Vec<f64>>;
}

// =============================================================================
// NativeRuntime — linear scorer with a sigmoid link, loaded from JSON
// =============================================================================

/// Weight artifact exported by offline training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub dimension: usize,
    pub weights: Vec<f64>,
    pub bias: f64,
}

/// In-process scorer: `p1 = sigmoid(w · x + b)`.
pub struct NativeRuntime {
    artifact: ModelArtifact,
}

impl NativeRuntime {
    /// Load and validate a weight artifact from `path`.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model artifact from {path}"))?;

        let artifact: ModelArtifact = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse model artifact from {path}"))?;

        Self::from_artifact(artifact)
    }

    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self> {
        if artifact.dimension == 0 || artifact.weights.len() != artifact.dimension {
            anyhow::bail!(
                "malformed model artifact: dimension={} weights={}",
                artifact.dimension,
                artifact.weights.len()
            );
        }
        if artifact.weights.iter().any(|w| !w.is_finite()) || !artifact.bias.is_finite() {
            anyhow::bail!("model artifact contains non-finite parameters");
        }

        info!(
            dimension = artifact.dimension,
            "native model runtime loaded"
        );
        Ok(Self { artifact })
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[async_trait]
impl ModelRuntime for NativeRuntime {
    fn name(&self) -> &'static str {
        "native"
    }

    fn dimension(&self) -> usize {
        self.artifact.dimension
    }

    async fn predict(&self, features: &[f64]) -> Result<Vec<f64>> {
        if features.len() != self.artifact.dimension {
            anyhow::bail!(
                "feature length {} does not match model dimension {}",
                features.len(),
                self.artifact.dimension
            );
        }

        let z: f64 = self
            .artifact
            .weights
            .iter()
            .zip(features)
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.artifact.bias;

        let p1 = sigmoid(z);
        debug!(z, p1, "native inference");
        Ok(vec![1.0 - p1, p1])
    }
}

// =============================================================================
// ExternalRuntime — line-delimited JSON over a child process
// =============================================================================

#[derive(Serialize)]
struct IpcRequest<'a> {
    features: &'a [f64],
}

#[derive(Deserialize)]
struct IpcResponse {
    probabilities: Vec<f64>,
}

struct ChildIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    // Held so the process is killed on drop.
    _child: Child,
}

/// IPC runtime speaking one JSON request/response pair per line. Requests are
/// serialised through a single in-flight slot; a slow process shows up as a
/// gate timeout, never as interleaved frames.
pub struct ExternalRuntime {
    dimension: usize,
    io: Mutex<ChildIo>,
}

impl ExternalRuntime {
    /// Spawn `command` (split on whitespace) with piped stdio.
    pub fn spawn(command: &str, dimension: usize) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .context("external runtime command must not be empty")?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn model process '{command}'"))?;

        let stdin = child
            .stdin
            .take()
            .context("model process has no stdin pipe")?;
        let stdout = child
            .stdout
            .take()
            .context("model process has no stdout pipe")?;

        info!(command, dimension, "external model runtime spawned");

        Ok(Self {
            dimension,
            io: Mutex::new(ChildIo {
                stdin,
                stdout: BufReader::new(stdout),
                _child: child,
            }),
        })
    }
}

#[async_trait]
impl ModelRuntime for ExternalRuntime {
    fn name(&self) -> &'static str {
        "external"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn predict(&self, features: &[f64]) -> Result<Vec<f64>> {
        let mut line = serde_json::to_string(&IpcRequest { features })
            .context("failed to serialise inference request")?;
        line.push('\n');

        let mut io = self.io.lock().await;

        io.stdin
            .write_all(line.as_bytes())
            .await
            .context("failed to write to model process")?;
        io.stdin
            .flush()
            .await
            .context("failed to flush model process stdin")?;

        let mut response = String::new();
        let read = io
            .stdout
            .read_line(&mut response)
            .await
            .context("failed to read from model process")?;
        if read == 0 {
            warn!("model process closed its stdout");
            anyhow::bail!("model process terminated");
        }

        let parsed: IpcResponse = serde_json::from_str(response.trim())
            .with_context(|| format!("malformed model response: {}", response.trim()))?;

        Ok(parsed.probabilities)
    }
}
