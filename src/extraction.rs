//! Extraction capability: chunk text plus grounding in, add/update proposal out

use crate::error::{MemoryError, Result};
use crate::proposal::ExtractionProposal;
use crate::types::MemoryNode;
use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    /// Propose graph changes for a transcript chunk.
    ///
    /// Output is untrusted; callers validate every item before applying it.
    async fn extract(&self, chunk_text: &str, grounding: &[MemoryNode])
        -> Result<ExtractionProposal>;
}

/// Runs an external program per chunk.
///
/// The program receives `{"chunk": ..., "grounding": [...]}` on stdin and must
/// print proposal JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
}

impl CommandExtractor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line into program and arguments
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| {
            MemoryError::Configuration("extractor command cannot be empty".into())
        })?;
        Ok(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl Extractor for CommandExtractor {
    fn name(&self) -> &str {
        &self.program
    }

    async fn extract(
        &self,
        chunk_text: &str,
        grounding: &[MemoryNode],
    ) -> Result<ExtractionProposal> {
        let payload = serde_json::to_vec(&json!({
            "chunk": chunk_text,
            "grounding": grounding,
        }))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                MemoryError::Connectivity(format!("failed to start {}: {e}", self.program))
            })?;

        // Feed stdin while stdout is drained so neither pipe can fill up and stall
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&payload).await {
                // The program may answer without reading its input
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        let output = output.map_err(|e| MemoryError::Connectivity(e.to_string()))?;
        fed.map_err(|e| MemoryError::Connectivity(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MemoryError::Connectivity(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let proposal = ExtractionProposal::from_json(&stdout)?;
        debug!(
            extractor = %self.program,
            adds = proposal.nodes_to_add.len(),
            updates = proposal.nodes_to_update.len(),
            "extraction proposal received"
        );
        Ok(proposal)
    }
}
