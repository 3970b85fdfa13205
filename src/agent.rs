use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::data::DataBag;
use crate::fsm::{Machine, MachineDefinition, MachineEvent, StateNode, Transition};
use crate::tools::{self, Params, Tool, ToolError, ToolRegistry};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Error type for agent runs and workflow steps, with variants designed
/// around what the caller can do about them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// Bad input or logic error. Don't retry, fix the code.
    #[error("invalid: {0}")]
    Invalid(String),
    /// Transient failure (network, rate limit). Retrying might help.
    #[error("transient: {0}")]
    Transient(String),
    /// The step ran out of time.
    #[error("timeout: {0}")]
    Timeout(String),
    /// The step reported failure explicitly.
    #[error("failed: {0}")]
    Failed(String),
    /// Everything else. Inspect the message for details.
    #[error("{0}")]
    Other(String),
}

impl StepError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        StepError::Invalid(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        StepError::Transient(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        StepError::Timeout(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        StepError::Failed(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        StepError::Other(msg.into())
    }

    /// Everything except [`StepError::Invalid`] may succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StepError::Invalid(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StepError::Timeout(_))
    }
}

impl From<std::io::Error> for StepError {
    fn from(e: std::io::Error) -> Self {
        StepError::Other(e.to_string())
    }
}

impl From<ToolError> for StepError {
    fn from(e: ToolError) -> Self {
        match &e {
            ToolError::NotFound(_) | ToolError::InvalidParameters { .. } | ToolError::UnknownAction(_) => {
                StepError::Invalid(e.to_string())
            }
            ToolError::Timeout(_) => StepError::Timeout(e.to_string()),
            ToolError::Http(status) if *status == 429 || *status >= 500 => StepError::Transient(e.to_string()),
            ToolError::Http(_) | ToolError::Execution(_) => StepError::Failed(e.to_string()),
            ToolError::Network(_) => StepError::Transient(e.to_string()),
            ToolError::Io(_) => StepError::Other(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Identity and configuration
// ---------------------------------------------------------------------------

/// Identity record of an agent. Never changed by the agent itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetadata {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl AgentMetadata {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: "0.1.0".to_string(),
            created: now,
            last_modified: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(skip)]
    pub tools: Vec<Arc<dyn Tool>>,
    #[serde(default)]
    pub initial_context: DataBag,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upper bound for a single attempt of the agent's task, in milliseconds.
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl AgentConfig {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            initial_context: DataBag::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_ms: None,
        }
    }

    /// Parse `{ "initialContext": {..}, "maxRetries": 3, "timeout": 5000 }`.
    /// Tools cannot be expressed in JSON and are added with [`AgentConfig::with_tool`].
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn with_initial_context(mut self, data: DataBag) -> Self {
        self.initial_context = data;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("tools", &self.tools.iter().map(|t| t.name()).collect::<Vec<_>>())
            .field("initial_context", &self.initial_context)
            .field("max_retries", &self.max_retries)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Lifecycle machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Running => "running",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events accepted by the agent lifecycle.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Start,
    /// The run finished; the payload is merged into the data bag.
    Complete(DataBag),
    Error(StepError),
    Retry,
}

impl MachineEvent for AgentEvent {
    fn event_type(&self) -> Cow<'_, str> {
        Cow::Borrowed(match self {
            AgentEvent::Start => "START",
            AgentEvent::Complete(_) => "COMPLETE",
            AgentEvent::Error(_) => "ERROR",
            AgentEvent::Retry => "RETRY",
        })
    }
}

/// Mutable state of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    pub status: AgentStatus,
    pub data: DataBag,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<StepError>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

fn serialize_error<S: serde::Serializer>(error: &Option<StepError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

impl AgentContext {
    fn seeded(data: DataBag) -> Self {
        Self {
            status: AgentStatus::Idle,
            data,
            error: None,
            start_time: None,
            end_time: None,
            retry_count: 0,
        }
    }

    /// `end_time - start_time`, when both are recorded.
    pub fn duration(&self) -> Option<Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).to_std().unwrap_or_default()),
            _ => None,
        }
    }
}

/// Snapshot returned by [`Agent::state`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentState {
    pub value: AgentStatus,
    pub context: AgentContext,
}

/// Outcome of [`Agent::start`].
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    pub success: bool,
    pub data: Option<DataBag>,
    pub error: Option<StepError>,
    pub duration: Option<Duration>,
    pub retries: u32,
}

impl AgentResult {
    fn from_context(status: AgentStatus, context: &AgentContext) -> Self {
        let success = status == AgentStatus::Completed;
        Self {
            success,
            data: success.then(|| context.data.clone()),
            error: if success { None } else { context.error.clone() },
            duration: context.duration(),
            retries: context.retry_count,
        }
    }
}

type LifecycleMachine = Machine<AgentStatus, AgentContext, AgentEvent>;
type LifecycleDefinition = MachineDefinition<AgentStatus, AgentContext, AgentEvent>;

fn lifecycle(id: &str, max_retries: u32) -> LifecycleDefinition {
    MachineDefinition::new(format!("agent:{id}"), AgentStatus::Idle)
        .state(
            AgentStatus::Idle,
            StateNode::new().on("START", Transition::to(AgentStatus::Running)),
        )
        .state(
            AgentStatus::Running,
            StateNode::new()
                .entry(|ctx: &mut AgentContext| {
                    ctx.status = AgentStatus::Running;
                    // A retry keeps the first start so the duration covers every attempt.
                    ctx.start_time.get_or_insert_with(Utc::now);
                    ctx.end_time = None;
                })
                .on(
                    "COMPLETE",
                    Transition::to(AgentStatus::Completed).action(|ctx: &mut AgentContext, ev: &AgentEvent| {
                        if let AgentEvent::Complete(output) = ev {
                            ctx.data.merge(output.clone());
                        }
                    }),
                )
                .on(
                    "ERROR",
                    Transition::to(AgentStatus::Failed).action(|ctx: &mut AgentContext, ev: &AgentEvent| {
                        if let AgentEvent::Error(err) = ev {
                            ctx.error = Some(err.clone());
                        }
                    }),
                ),
        )
        .state(
            AgentStatus::Completed,
            StateNode::final_state().entry(|ctx: &mut AgentContext| {
                ctx.status = AgentStatus::Completed;
                ctx.end_time = Some(Utc::now());
            }),
        )
        .state(
            AgentStatus::Failed,
            StateNode::new()
                .entry(|ctx: &mut AgentContext| {
                    ctx.status = AgentStatus::Failed;
                    ctx.end_time = Some(Utc::now());
                })
                .on(
                    "RETRY",
                    Transition::to(AgentStatus::Running)
                        .guard(move |ctx: &AgentContext, _| ctx.retry_count < max_retries)
                        .action(|ctx: &mut AgentContext, _| {
                            ctx.retry_count += 1;
                            ctx.error = None;
                        }),
                ),
        )
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// What a task sees while the agent is running.
pub struct TaskScope<'a> {
    pub tools: &'a ToolRegistry,
    /// Data accumulated so far. Read-only: the task's output is merged by the
    /// lifecycle when the attempt completes.
    pub data: &'a DataBag,
    /// Zero for the first attempt, incremented by every retry.
    pub attempt: u32,
}

impl TaskScope<'_> {
    pub async fn execute_tool(&self, name: &str, params: Params) -> Result<Value, ToolError> {
        self.tools.execute(name, &params).await
    }
}

/// The work an agent performs in its `running` state.
#[async_trait]
pub trait Task: Send + Sync {
    async fn run(&self, scope: TaskScope<'_>) -> Result<DataBag, StepError>;
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

pub struct Agent {
    metadata: AgentMetadata,
    config: AgentConfig,
    tools: ToolRegistry,
    task: Option<Box<dyn Task>>,
    definition: Arc<LifecycleDefinition>,
    machine: LifecycleMachine,
}

impl Agent {
    pub fn new(config: AgentConfig, metadata: AgentMetadata) -> Self {
        let definition = Arc::new(lifecycle(&metadata.id, config.max_retries));
        let machine = Machine::new(
            Arc::clone(&definition),
            AgentContext::seeded(config.initial_context.clone()),
        );

        let mut tools = ToolRegistry::new();
        for tool in &config.tools {
            tools.register_shared(Arc::clone(tool));
        }

        Self {
            metadata,
            config,
            tools,
            task: None,
            definition,
            machine,
        }
    }

    /// An agent with the filesystem, network and process tools registered.
    pub fn with_default_tools(config: AgentConfig, metadata: AgentMetadata) -> Self {
        let mut agent = Self::new(config, metadata);
        for tool in tools::default_tools() {
            agent.tools.register_shared(tool);
        }
        agent
    }

    pub fn with_task(mut self, task: impl Task + 'static) -> Self {
        self.task = Some(Box::new(task));
        self
    }

    /// Run the lifecycle from a fresh context until it completes, or fails
    /// with no retry left.
    ///
    /// A failed attempt is retried while the retry guard allows it and the
    /// error is retryable. Never returns an error: inspect
    /// [`AgentResult::success`].
    pub async fn start(&mut self) -> AgentResult {
        let mut machine = Machine::new(
            Arc::clone(&self.definition),
            AgentContext::seeded(self.config.initial_context.clone()),
        );
        machine.send(&AgentEvent::Start);
        info!(agent = %self.metadata.id, "agent started");

        loop {
            let attempt = machine.context().retry_count;
            let event = match self.run_attempt(machine.context()).await {
                Ok(output) => AgentEvent::Complete(output),
                Err(err) => {
                    warn!(agent = %self.metadata.id, attempt, error = %err, "attempt failed");
                    AgentEvent::Error(err)
                }
            };
            machine.send(&event);

            if *machine.current() != AgentStatus::Failed {
                break;
            }
            let retryable = machine.context().error.as_ref().is_none_or(StepError::is_retryable);
            if !retryable || !machine.send(&AgentEvent::Retry) {
                break;
            }
            debug!(agent = %self.metadata.id, retry = machine.context().retry_count, "retrying");
        }

        let status = *machine.current();
        let result = AgentResult::from_context(status, machine.context());
        info!(
            agent = %self.metadata.id,
            status = %status,
            retries = result.retries,
            duration_ms = result.duration.map(|d| d.as_millis() as u64),
            "agent finished"
        );
        self.machine = machine;
        result
    }

    async fn run_attempt(&self, context: &AgentContext) -> Result<DataBag, StepError> {
        let Some(task) = &self.task else {
            return Ok(DataBag::new());
        };
        let scope = TaskScope {
            tools: &self.tools,
            data: &context.data,
            attempt: context.retry_count,
        };

        match self.config.timeout() {
            Some(limit) => tokio::time::timeout(limit, task.run(scope))
                .await
                .unwrap_or_else(|_| Err(StepError::timeout(format!("task exceeded {}ms", limit.as_millis())))),
            None => task.run(scope).await,
        }
    }

    /// Drive the lifecycle by hand. Returns `false` when the event was not
    /// accepted in the current state (or its guard rejected it).
    pub fn send(&mut self, event: AgentEvent) -> bool {
        self.machine.send(&event)
    }

    /// Adds `tool`, replacing any tool already registered under its name.
    pub fn register_tool(&mut self, tool: impl Tool + 'static) {
        self.tools.register(tool);
    }

    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) {
        self.tools.register_shared(tool);
    }

    /// Look up `name`, validate `params` against it and execute.
    pub async fn execute_tool(&self, name: &str, params: Params) -> Result<Value, ToolError> {
        self.tools.execute(name, &params).await
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn metadata(&self) -> &AgentMetadata {
        &self.metadata
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> AgentState {
        AgentState {
            value: *self.machine.current(),
            context: self.machine.context().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn meta() -> AgentMetadata {
        AgentMetadata::new("a-1", "tester")
    }

    struct Succeed;

    #[async_trait]
    impl Task for Succeed {
        async fn run(&self, _scope: TaskScope<'_>) -> Result<DataBag, StepError> {
            Ok([("answer", json!(42))].into_iter().collect())
        }
    }

    /// Fails with `error` until `succeed_on` attempts have been made.
    struct Flaky {
        attempts: Arc<AtomicU32>,
        succeed_on: u32,
        error: StepError,
    }

    impl Flaky {
        fn new(succeed_on: u32, error: StepError) -> (Self, Arc<AtomicU32>) {
            let attempts = Arc::new(AtomicU32::new(0));
            let task = Self {
                attempts: Arc::clone(&attempts),
                succeed_on,
                error,
            };
            (task, attempts)
        }
    }

    #[async_trait]
    impl Task for Flaky {
        async fn run(&self, _scope: TaskScope<'_>) -> Result<DataBag, StepError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_on {
                Ok([("attempts", json!(n))].into_iter().collect())
            } else {
                Err(self.error.clone())
            }
        }
    }

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "returns its params"
        }
        fn validate(&self, params: &Params) -> bool {
            params.contains_key("msg")
        }
        async fn execute(&self, params: &Params) -> Result<Value, ToolError> {
            Ok(Value::Object(params.clone()))
        }
    }

    struct UsesEcho;

    #[async_trait]
    impl Task for UsesEcho {
        async fn run(&self, scope: TaskScope<'_>) -> Result<DataBag, StepError> {
            let mut params = Params::new();
            params.insert("msg".into(), scope.data.get("greeting").cloned().unwrap_or_default());
            let echoed = scope.execute_tool("echo", params).await?;
            Ok([("echoed", echoed)].into_iter().collect())
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Task for Sleepy {
        async fn run(&self, _scope: TaskScope<'_>) -> Result<DataBag, StepError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(DataBag::new())
        }
    }

    // --- StepError ---

    #[test]
    fn display_variants() {
        assert_eq!(StepError::invalid("bad input").to_string(), "invalid: bad input");
        assert_eq!(StepError::transient("slow").to_string(), "transient: slow");
        assert_eq!(StepError::timeout("30ms").to_string(), "timeout: 30ms");
        assert_eq!(StepError::failed("nope").to_string(), "failed: nope");
        assert_eq!(StepError::other("something").to_string(), "something");
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let step_err: StepError = io_err.into();
        assert!(matches!(step_err, StepError::Other(msg) if msg.contains("file missing")));
    }

    #[test]
    fn tool_errors_are_classified() {
        assert!(matches!(StepError::from(ToolError::NotFound("x".into())), StepError::Invalid(_)));
        assert!(matches!(StepError::from(ToolError::Timeout(10)), StepError::Timeout(_)));
        assert!(matches!(StepError::from(ToolError::Http(503)), StepError::Transient(_)));
        assert!(matches!(StepError::from(ToolError::Http(404)), StepError::Failed(_)));
        assert!(!StepError::invalid("x").is_retryable());
        assert!(StepError::timeout("x").is_retryable());
    }

    // --- config ---

    #[test]
    fn config_from_json_applies_defaults() {
        let config = AgentConfig::from_json(r#"{"initialContext": {"k": 1}, "timeout": 250}"#).unwrap();
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.initial_context.get("k"), Some(&json!(1)));
        assert!(config.tools.is_empty());
    }

    // --- lifecycle ---

    #[tokio::test]
    async fn fresh_agent_is_idle() {
        let agent = Agent::new(AgentConfig::new(), meta());
        let state = agent.state();
        assert_eq!(state.value, AgentStatus::Idle);
        assert_eq!(state.context.status, AgentStatus::Idle);
        assert_eq!(state.context.duration(), None);
    }

    #[tokio::test]
    async fn successful_run_reports_data_and_duration() {
        let seed: DataBag = [("seed", json!(true))].into_iter().collect();
        let mut agent = Agent::new(AgentConfig::new().with_initial_context(seed), meta()).with_task(Succeed);
        let result = agent.start().await;

        assert!(result.success);
        assert!(result.error.is_none());
        let data = result.data.unwrap();
        assert_eq!(data.get("seed"), Some(&json!(true)));
        assert_eq!(data.get("answer"), Some(&json!(42)));
        assert!(result.duration.is_some());

        let state = agent.state();
        assert_eq!(state.value, AgentStatus::Completed);
        assert!(state.context.start_time.unwrap() <= state.context.end_time.unwrap());
    }

    #[tokio::test]
    async fn agent_without_task_completes_immediately() {
        let mut agent = Agent::new(AgentConfig::new(), meta());
        let result = agent.start().await;
        assert!(result.success);
        assert_eq!(result.data, Some(DataBag::new()));
    }

    #[tokio::test]
    async fn no_retries_leaves_agent_failed() {
        let (task, attempts) = Flaky::new(u32::MAX, StepError::transient("down"));
        let mut agent = Agent::new(AgentConfig::new().with_max_retries(0), meta()).with_task(task);
        let result = agent.start().await;

        assert!(!result.success);
        assert_eq!(result.error, Some(StepError::transient("down")));
        assert!(result.duration.is_some());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(agent.state().value, AgentStatus::Failed);
        assert!(!agent.send(AgentEvent::Retry));
    }

    #[tokio::test]
    async fn retry_succeeds_within_limit() {
        let (task, attempts) = Flaky::new(3, StepError::transient("flaky"));
        let mut agent = Agent::new(AgentConfig::new(), meta()).with_task(task);
        let result = agent.start().await;

        assert!(result.success);
        assert_eq!(result.retries, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(result.data.unwrap().get("attempts"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn exactly_max_retries_are_attempted() {
        let (task, attempts) = Flaky::new(u32::MAX, StepError::failed("always"));
        let mut agent = Agent::new(AgentConfig::new().with_max_retries(2), meta()).with_task(task);
        let result = agent.start().await;

        assert!(!result.success);
        assert_eq!(result.retries, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let before = agent.state();
        assert!(!agent.send(AgentEvent::Retry));
        assert_eq!(agent.state(), before);
    }

    #[tokio::test]
    async fn invalid_errors_are_not_retried() {
        let (task, attempts) = Flaky::new(u32::MAX, StepError::invalid("bad config"));
        let mut agent = Agent::new(AgentConfig::new(), meta()).with_task(task);
        let result = agent.start().await;

        assert!(!result.success);
        assert_eq!(result.retries, 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn manual_retry_is_bounded() {
        let mut agent = Agent::new(AgentConfig::new().with_max_retries(2), meta());
        assert!(!agent.send(AgentEvent::Retry));
        assert!(agent.send(AgentEvent::Start));

        for expected in 1..=2 {
            assert!(agent.send(AgentEvent::Error(StepError::other("boom"))));
            assert!(agent.send(AgentEvent::Retry));
            assert_eq!(agent.state().context.retry_count, expected);
            assert_eq!(agent.state().value, AgentStatus::Running);
        }

        assert!(agent.send(AgentEvent::Error(StepError::other("boom"))));
        assert!(!agent.send(AgentEvent::Retry));
        let state = agent.state();
        assert_eq!(state.value, AgentStatus::Failed);
        assert_eq!(state.context.retry_count, 2);
        assert_eq!(state.context.error, Some(StepError::other("boom")));
    }

    #[tokio::test]
    async fn completed_is_final() {
        let mut agent = Agent::new(AgentConfig::new(), meta());
        agent.send(AgentEvent::Start);
        assert!(agent.send(AgentEvent::Complete(DataBag::new())));
        assert!(!agent.send(AgentEvent::Error(StepError::other("late"))));
        assert_eq!(agent.state().value, AgentStatus::Completed);
    }

    #[tokio::test]
    async fn each_start_uses_a_fresh_context() {
        let (task, _) = Flaky::new(2, StepError::transient("once"));
        let mut agent = Agent::new(AgentConfig::new(), meta()).with_task(task);
        assert_eq!(agent.start().await.retries, 1);
        // Second cycle: the shared attempt counter is past `succeed_on`.
        let second = agent.start().await;
        assert!(second.success);
        assert_eq!(second.retries, 0);
    }

    #[tokio::test]
    async fn task_timeout_fails_the_attempt() {
        let config = AgentConfig::new()
            .with_max_retries(0)
            .with_timeout(Duration::from_millis(20));
        let mut agent = Agent::new(config, meta()).with_task(Sleepy);
        let result = agent.start().await;

        assert!(!result.success);
        assert!(result.error.unwrap().is_timeout());
    }

    // --- tools ---

    #[tokio::test]
    async fn task_can_call_registered_tools() {
        let seed: DataBag = [("greeting", json!("hi"))].into_iter().collect();
        let config = AgentConfig::new().with_initial_context(seed).with_tool(Echo);
        let mut agent = Agent::new(config, meta()).with_task(UsesEcho);
        let result = agent.start().await;

        assert!(result.success);
        assert_eq!(result.data.unwrap().get("echoed"), Some(&json!({"msg": "hi"})));
    }

    #[tokio::test]
    async fn execute_missing_tool_is_not_found() {
        let agent = Agent::new(AgentConfig::new(), meta());
        let err = agent.execute_tool("missing", Params::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn execute_with_rejected_params_is_invalid() {
        let mut agent = Agent::new(AgentConfig::new(), meta());
        agent.register_tool(Echo);
        let err = agent.execute_tool("echo", Params::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters { .. }));
        assert_eq!(agent.state().value, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn default_tools_are_registered() {
        let agent = Agent::with_default_tools(AgentConfig::new(), meta());
        for name in ["filesystem", "network", "process"] {
            assert!(agent.tools().contains(name), "missing {name}");
        }
        assert_eq!(agent.metadata().id, "a-1");
    }
}
