//! The tool contract and the built-in tools.
//!
//! A [`Tool`] is a named capability invoked with a bag of JSON parameters.
//! [`ToolRegistry::execute`] never calls [`Tool::execute`] unless
//! [`Tool::validate`] accepted the same parameters.

pub mod command;
pub mod file;
pub mod http;
pub(crate) mod parse;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

pub use command::{ProcessOutput, ProcessParams, ProcessTool};
pub use file::{FileAction, FileSystemTool};
pub use http::{HttpMethod, NetworkTool, RequestParams};

/// Parameters passed to a tool.
pub type Params = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool '{0}' not found")]
    NotFound(String),
    #[error("invalid parameters for tool '{tool}': {reason}")]
    InvalidParameters { tool: String, reason: String },
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("request timeout after {0}ms")]
    Timeout(u64),
    #[error("HTTP error: status {0}")]
    Http(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ToolError {
    pub fn invalid(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolError::InvalidParameters {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ToolError::Timeout(_))
    }
}

/// A capability unit: a name, a parameter check and an executor.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique key within a registry.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Cheap parameter check run before [`Tool::execute`]. Returns `false`
    /// rather than erroring. Defaults to accepting everything.
    fn validate(&self, _params: &Params) -> bool {
        true
    }

    async fn execute(&self, params: &Params) -> Result<Value, ToolError>;
}

/// Tools keyed by name. Owned by one agent; no internal locking.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `tool`, silently replacing one registered under the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Option<Arc<dyn Tool>> {
        self.register_shared(Arc::new(tool))
    }

    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.name().to_string();
        let previous = self.tools.insert(name.clone(), tool);
        if previous.is_some() {
            debug!(tool = %name, "replaced registered tool");
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Look up `name`, validate, then execute.
    pub async fn execute(&self, name: &str, params: &Params) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        if !tool.validate(params) {
            return Err(ToolError::invalid(name, "rejected by validator"));
        }

        debug!(tool = %name, "executing tool");
        tool.execute(params).await
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("tools", &self.names()).finish()
    }
}

/// Filesystem, network and process tools with default settings.
pub fn default_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(FileSystemTool::new()),
        Arc::new(NetworkTool::new()),
        Arc::new(ProcessTool::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixed {
        name: &'static str,
        value: Value,
        executed: Arc<AtomicBool>,
    }

    impl Fixed {
        fn new(name: &'static str, value: Value) -> Self {
            Self {
                name,
                value,
                executed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl Tool for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "returns a fixed value"
        }
        fn validate(&self, params: &Params) -> bool {
            !params.contains_key("reject")
        }
        async fn execute(&self, _params: &Params) -> Result<Value, ToolError> {
            self.executed.store(true, Ordering::SeqCst);
            Ok(self.value.clone())
        }
    }

    #[tokio::test]
    async fn second_registration_wins() {
        let mut registry = ToolRegistry::new();
        assert!(registry.register(Fixed::new("t", json!(1))).is_none());
        assert!(registry.register(Fixed::new("t", json!(2))).is_some());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.execute("t", &Params::new()).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn missing_tool_is_not_found() {
        let registry = ToolRegistry::new();
        let err = registry.execute("missing", &Params::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(ref n) if n == "missing"));
        assert_eq!(err.to_string(), "tool 'missing' not found");
    }

    #[tokio::test]
    async fn rejected_params_never_execute() {
        let tool = Fixed::new("t", json!(null));
        let executed = Arc::clone(&tool.executed);
        let mut registry = ToolRegistry::new();
        registry.register(tool);

        let mut params = Params::new();
        params.insert("reject".into(), json!(true));
        let err = registry.execute("t", &params).await.unwrap_err();

        assert!(matches!(err, ToolError::InvalidParameters { ref tool, .. } if tool == "t"));
        assert!(!executed.load(Ordering::SeqCst));
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = ToolRegistry::new();
        for tool in default_tools() {
            registry.register_shared(tool);
        }
        assert_eq!(registry.names(), vec!["filesystem", "network", "process"]);
    }

    #[test]
    fn timeout_is_distinguishable() {
        assert!(ToolError::Timeout(5).is_timeout());
        assert!(!ToolError::Network("refused".into()).is_timeout());
        assert_eq!(ToolError::Timeout(5).to_string(), "request timeout after 5ms");
    }
}
