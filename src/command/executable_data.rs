use std::collections::HashMap;
use std::path::PathBuf;

/// Everything needed to spawn a subordinate process.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutableData {
    pub bin: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl ExecutableData {
    pub fn new(bin: String) -> Self {
        ExecutableData {
            bin,
            args: Vec::default(),
            env: HashMap::default(),
            cwd: None,
        }
    }

    pub fn with_args(self, args: Vec<String>) -> Self {
        Self { args, ..self }
    }

    pub fn with_env(self, env: HashMap<String, String>) -> Self {
        Self { env, ..self }
    }

    pub fn with_cwd(self, cwd: PathBuf) -> Self {
        Self {
            cwd: Some(cwd),
            ..self
        }
    }
}
