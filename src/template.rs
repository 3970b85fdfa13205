//! Stores that hand out workflow definitions by id.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::workflow::WorkflowDefinition;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("workflow template '{0}' not found")]
    NotFound(String),
    #[error("invalid template id '{0}'")]
    InvalidId(String),
    #[error("failed to access template '{id}': {source}")]
    Io {
        id: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse template '{id}': {source}")]
    Parse {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<WorkflowDefinition, TemplateError>;
}

/// Templates held in memory, keyed by definition id.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTemplateStore {
    templates: HashMap<String, WorkflowDefinition>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `definition` under its own id, returning the one it replaced.
    pub fn insert(&mut self, definition: WorkflowDefinition) -> Option<WorkflowDefinition> {
        self.templates.insert(definition.id.clone(), definition)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl FromIterator<WorkflowDefinition> for InMemoryTemplateStore {
    fn from_iter<I: IntoIterator<Item = WorkflowDefinition>>(iter: I) -> Self {
        let mut store = Self::new();
        for definition in iter {
            store.insert(definition);
        }
        store
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn load(&self, id: &str) -> Result<WorkflowDefinition, TemplateError> {
        self.templates
            .get(id)
            .cloned()
            .ok_or_else(|| TemplateError::NotFound(id.to_string()))
    }
}

/// One `<id>.json` file per template in a directory.
#[derive(Debug, Clone)]
pub struct FileTemplateStore {
    dir: PathBuf,
}

impl FileTemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ids are plain file stems: no separators, no parent references, no
    /// control characters.
    fn path_for(&self, id: &str) -> Result<PathBuf, TemplateError> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") || id.chars().any(char::is_control) {
            return Err(TemplateError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    /// Write `definition` as pretty JSON under its id.
    pub async fn save(&self, definition: &WorkflowDefinition) -> Result<PathBuf, TemplateError> {
        let id = &definition.id;
        let path = self.path_for(id)?;
        let json = serde_json::to_string_pretty(definition).map_err(|source| TemplateError::Parse {
            id: id.clone(),
            source,
        })?;

        let io_err = |source| TemplateError::Io { id: id.clone(), source };
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        tokio::fs::write(&path, json).await.map_err(io_err)?;
        debug!(template = %id, path = %path.display(), "saved template");
        Ok(path)
    }
}

#[async_trait]
impl TemplateStore for FileTemplateStore {
    async fn load(&self, id: &str) -> Result<WorkflowDefinition, TemplateError> {
        let path = self.path_for(id)?;
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(TemplateError::NotFound(id.to_string())),
            Err(source) => {
                return Err(TemplateError::Io {
                    id: id.to_string(),
                    source,
                });
            }
        };
        debug!(template = %id, path = %path.display(), "loaded template");
        WorkflowDefinition::from_json(&json).map_err(|source| TemplateError::Parse {
            id: id.to_string(),
            source,
        })
    }
}
