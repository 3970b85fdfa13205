use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::parse::{action, parse_params};
use super::{Params, Tool, ToolError};

pub const FILESYSTEM: &str = "filesystem";

const ACTIONS: [&str; 3] = ["read", "write", "delete"];

/// One filesystem operation, selected by the `action` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum FileAction {
    Read {
        path: String,
        #[serde(default = "default_encoding")]
        encoding: String,
    },
    Write {
        path: String,
        content: String,
        #[serde(default = "default_encoding")]
        encoding: String,
    },
    Delete {
        path: String,
    },
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn is_supported_encoding(encoding: &str) -> bool {
    encoding.eq_ignore_ascii_case("utf-8") || encoding.eq_ignore_ascii_case("utf8")
}

impl FileAction {
    pub fn path(&self) -> &str {
        match self {
            FileAction::Read { path, .. } | FileAction::Write { path, .. } | FileAction::Delete { path } => path,
        }
    }

    fn encoding(&self) -> Option<&str> {
        match self {
            FileAction::Read { encoding, .. } | FileAction::Write { encoding, .. } => Some(encoding),
            FileAction::Delete { .. } => None,
        }
    }
}

/// Reads, writes and deletes files.
///
/// Relative paths resolve against the working directory, or against the
/// root given to [`FileSystemTool::with_root`].
#[derive(Debug, Clone, Default)]
pub struct FileSystemTool {
    root: Option<PathBuf>,
}

impl FileSystemTool {
    pub fn new() -> Self {
        Self { root: None }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// Check the discriminator, then the action's own parameter shape.
    pub fn parse(&self, params: &Params) -> Result<FileAction, ToolError> {
        match action(params) {
            Some(a) if ACTIONS.contains(&a) => {}
            Some(a) => return Err(ToolError::UnknownAction(a.to_string())),
            None => return Err(ToolError::invalid(FILESYSTEM, "missing action")),
        }

        let request: FileAction = parse_params(FILESYSTEM, params)?;
        if let Some(encoding) = request.encoding()
            && !is_supported_encoding(encoding)
        {
            return Err(ToolError::invalid(FILESYSTEM, format!("unsupported encoding: {encoding}")));
        }
        Ok(request)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub async fn run(&self, request: FileAction) -> Result<Value, ToolError> {
        let path = self.resolve(request.path());
        match request {
            FileAction::Read { .. } => {
                debug!(path = %path.display(), "read file");
                Ok(Value::String(tokio::fs::read_to_string(&path).await?))
            }
            FileAction::Write { content, .. } => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    tokio::fs::create_dir_all(parent).await?;
                }
                debug!(path = %path.display(), bytes = content.len(), "write file");
                tokio::fs::write(&path, content).await?;
                Ok(Value::Null)
            }
            FileAction::Delete { .. } => {
                debug!(path = %path.display(), "delete file");
                tokio::fs::remove_file(&path).await?;
                Ok(Value::Null)
            }
        }
    }
}

#[async_trait]
impl Tool for FileSystemTool {
    fn name(&self) -> &str {
        FILESYSTEM
    }

    fn description(&self) -> &str {
        "Provides file system operations like reading, writing, and deleting files"
    }

    fn validate(&self, params: &Params) -> bool {
        self.parse(params).is_ok()
    }

    async fn execute(&self, params: &Params) -> Result<Value, ToolError> {
        let request = self.parse(params)?;
        self.run(request).await
    }
}
