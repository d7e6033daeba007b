//! Stage tools and the capability table resolving a stage name to its tool.

use crate::config::ProcessToolConfig;
use crate::core::{ArtifactCategory, StageName};
use crate::errors::StageError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a tool is given for one attempt.
///
/// The input directory holds only the declared inputs; the tool must write
/// each declared output category to `{output_dir}/{category}/`.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    /// The stage being executed.
    pub stage: StageName,
    /// Owning project.
    pub project_id: String,
    /// Project circuit SDK.
    pub sdk: String,
    /// Execution id.
    pub execution_id: String,
    /// Execution working directory.
    pub exec_dir: PathBuf,
    /// Directory holding `{category}/...` inputs and `source/` when granted.
    pub input_dir: PathBuf,
    /// Directory the tool writes outputs to.
    pub output_dir: PathBuf,
    /// Declared output categories.
    pub outputs: Vec<ArtifactCategory>,
}

impl ToolInvocation {
    /// Directory for one input category.
    #[must_use]
    pub fn input_path(&self, category: &ArtifactCategory) -> PathBuf {
        category_path(&self.input_dir, category)
    }

    /// Directory for one output category.
    #[must_use]
    pub fn output_path(&self, category: &ArtifactCategory) -> PathBuf {
        category_path(&self.output_dir, category)
    }
}

pub(crate) fn category_path(root: &Path, category: &ArtifactCategory) -> PathBuf {
    category
        .as_str()
        .split('/')
        .fold(root.to_path_buf(), |path, segment| path.join(segment))
}

/// A stage tool running inside the hub process.
#[async_trait]
pub trait InProcessTool: Send + Sync + Debug {
    /// Identifies the tool and its version; part of the idempotency key.
    fn fingerprint(&self) -> String;

    /// Runs the tool against the prepared directories.
    async fn invoke(&self, invocation: &ToolInvocation) -> Result<(), StageError>;
}

/// A closure-based in-process tool.
pub struct FnTool<F>
where
    F: Fn(&ToolInvocation) -> Result<(), StageError> + Send + Sync,
{
    fingerprint: String,
    func: F,
}

impl<F> FnTool<F>
where
    F: Fn(&ToolInvocation) -> Result<(), StageError> + Send + Sync,
{
    /// Creates a new closure-based tool.
    pub fn new(fingerprint: impl Into<String>, func: F) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            func,
        }
    }
}

impl<F> Debug for FnTool<F>
where
    F: Fn(&ToolInvocation) -> Result<(), StageError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

#[async_trait]
impl<F> InProcessTool for FnTool<F>
where
    F: Fn(&ToolInvocation) -> Result<(), StageError> + Send + Sync,
{
    fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }

    async fn invoke(&self, invocation: &ToolInvocation) -> Result<(), StageError> {
        (self.func)(invocation)
    }
}

/// An external executable implementing a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTool {
    /// Program to run.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment.
    pub env: HashMap<String, String>,
    /// Optional tool version.
    pub version: Option<String>,
}

impl ProcessTool {
    /// Creates a process tool for `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            version: None,
        }
    }

    /// Adds an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Fingerprint of the command line and version.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        if let Some(version) = &self.version {
            parts.push(format!("@{version}"));
        }
        parts.join(" ")
    }
}

impl From<&ProcessToolConfig> for ProcessTool {
    fn from(config: &ProcessToolConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            version: config.version.clone(),
        }
    }
}

/// The tool bound to one stage.
#[derive(Debug, Clone)]
pub enum StageTool {
    /// External process.
    Process(ProcessTool),
    /// In-process implementation.
    InProcess(Arc<dyn InProcessTool>),
}

impl StageTool {
    /// Fingerprint of the tool.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        match self {
            Self::Process(tool) => format!("process:{}", tool.fingerprint()),
            Self::InProcess(tool) => format!("in-process:{}", tool.fingerprint()),
        }
    }

    /// Runs the tool once.
    pub async fn invoke(&self, invocation: &ToolInvocation) -> Result<(), StageError> {
        match self {
            Self::Process(tool) => super::process::run_process(tool, invocation).await,
            Self::InProcess(tool) => tool.invoke(invocation).await,
        }
    }
}

/// Capability lookup table from stage name to tool.
#[derive(Debug, Clone, Default)]
pub struct ToolTable {
    tools: HashMap<StageName, StageTool>,
}

impl ToolTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table of process tools from configuration.
    #[must_use]
    pub fn from_config(tools: &HashMap<StageName, ProcessToolConfig>) -> Self {
        Self {
            tools: tools
                .iter()
                .map(|(stage, config)| (*stage, StageTool::Process(config.into())))
                .collect(),
        }
    }

    /// Binds `tool` to `stage`, replacing any previous binding.
    pub fn insert(&mut self, stage: StageName, tool: StageTool) {
        self.tools.insert(stage, tool);
    }

    /// Binds an in-process tool.
    #[must_use]
    pub fn with_in_process(mut self, stage: StageName, tool: Arc<dyn InProcessTool>) -> Self {
        self.insert(stage, StageTool::InProcess(tool));
        self
    }

    /// Binds a process tool.
    #[must_use]
    pub fn with_process(mut self, stage: StageName, tool: ProcessTool) -> Self {
        self.insert(stage, StageTool::Process(tool));
        self
    }

    /// Returns the tool for `stage`.
    #[must_use]
    pub fn get(&self, stage: StageName) -> Option<&StageTool> {
        self.tools.get(&stage)
    }

    /// Stages that have a tool.
    #[must_use]
    pub fn stages(&self) -> Vec<StageName> {
        let mut stages: Vec<_> = self.tools.keys().copied().collect();
        stages.sort();
        stages
    }
}
