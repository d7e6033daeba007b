//! Scripted in-process stage tool.

use crate::errors::StageError;
use crate::stages::{InProcessTool, ToolInvocation};
use crate::utils::sha256_hex;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Succeed,
    FailExecution,
    FailTransiently(usize),
}

/// A stage tool that writes one file per output category.
///
/// The written content is derived from the inputs it was given, so the same
/// inputs always produce the same outputs.
#[derive(Debug)]
pub struct ScriptedTool {
    name: String,
    script: Script,
    writes_outputs: bool,
    delay: Option<Duration>,
    invocations: Mutex<usize>,
    last_inputs: Mutex<Vec<String>>,
}

impl ScriptedTool {
    fn scripted(name: impl Into<String>, script: Script) -> Self {
        Self {
            name: name.into(),
            script,
            writes_outputs: true,
            delay: None,
            invocations: Mutex::new(0),
            last_inputs: Mutex::new(Vec::new()),
        }
    }

    /// A tool that always succeeds.
    #[must_use]
    pub fn succeeding(name: impl Into<String>) -> Self {
        Self::scripted(name, Script::Succeed)
    }

    /// A tool whose every attempt exits with a deterministic failure.
    #[must_use]
    pub fn failing_execution(name: impl Into<String>) -> Self {
        Self::scripted(name, Script::FailExecution)
    }

    /// A tool that cannot be started for its first `times` attempts.
    #[must_use]
    pub fn failing_transiently(name: impl Into<String>, times: usize) -> Self {
        Self::scripted(name, Script::FailTransiently(times))
    }

    /// Succeeds without writing any output.
    #[must_use]
    pub fn without_outputs(mut self) -> Self {
        self.writes_outputs = false;
        self
    }

    /// Sleeps before doing anything.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of attempts so far.
    #[must_use]
    pub fn invocations(&self) -> usize {
        *self.invocations.lock()
    }

    /// Input files seen by the last attempt, relative to the input directory.
    #[must_use]
    pub fn last_inputs(&self) -> Vec<String> {
        self.last_inputs.lock().clone()
    }
}

#[async_trait]
impl InProcessTool for ScriptedTool {
    fn fingerprint(&self) -> String {
        format!("scripted:{}", self.name)
    }

    async fn invoke(&self, invocation: &ToolInvocation) -> Result<(), StageError> {
        let attempt = {
            let mut count = self.invocations.lock();
            *count += 1;
            *count
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.script {
            Script::FailExecution => {
                return Err(StageError::execution(
                    invocation.stage,
                    format!("{} exited with status 1", self.name),
                    Some(1),
                ));
            }
            Script::FailTransiently(times) if attempt <= times => {
                return Err(StageError::invocation(
                    invocation.stage,
                    format!("{} unavailable (attempt {attempt})", self.name),
                ));
            }
            _ => {}
        }

        let inputs = list_files(&invocation.input_dir)
            .await
            .map_err(|e| StageError::execution(invocation.stage, e.to_string(), None))?;
        let mut content = format!("{} {}\n", self.name, invocation.stage);
        for relative in &inputs {
            let bytes = tokio::fs::read(invocation.input_dir.join(relative))
                .await
                .map_err(|e| StageError::execution(invocation.stage, e.to_string(), None))?;
            content.push_str(&format!("{relative} {}\n", sha256_hex(&bytes)));
        }
        *self.last_inputs.lock() = inputs;

        if self.writes_outputs {
            for category in &invocation.outputs {
                let dir = invocation.output_path(category);
                let written = match tokio::fs::create_dir_all(&dir).await {
                    Ok(()) => tokio::fs::write(dir.join("circuit.txt"), &content).await,
                    Err(e) => Err(e),
                };
                written.map_err(|e| StageError::execution(invocation.stage, e.to_string(), None))?;
            }
        }
        Ok(())
    }
}

/// Every file under `root`, as sorted `/`-separated relative paths.
async fn list_files(root: &Path) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                let parts: Vec<_> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                files.push(parts.join("/"));
            }
        }
    }
    files.sort();
    Ok(files)
}
