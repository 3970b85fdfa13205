//! An agent that holds a conversation through a pluggable backend.
//!
//! The lifecycle extends the plain agent's: after `START` the backend is
//! initialized with a situation and a set of companions, and the agent
//! alternates between `ready` and the states that wait on the backend
//! (`processing`, `changingSituation`) until it is completed or fails.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::agent::{DEFAULT_MAX_RETRIES, StepError};
use crate::data::DataBag;
use crate::fsm::{Machine, MachineDefinition, MachineEvent, StateNode, Transition};
use crate::tools::{Params, Tool, ToolError, ToolRegistry};

/// One participant the backend should simulate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanionConfig {
    pub id: String,
    pub name: String,
    /// Backend-specific settings, passed through untouched.
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl CompanionConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            settings: Map::new(),
        }
    }
}

/// The conversational engine behind a [`ConversationAgent`].
#[async_trait]
pub trait ConversationBackend: Send {
    async fn initialize(&mut self, situation: &str, companions: &[CompanionConfig]) -> Result<(), StepError>;
    async fn send_message(&mut self, message: &str) -> Result<String, StepError>;
    async fn change_situation(&mut self, situation: &str) -> Result<(), StepError>;
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationConfig {
    pub situation: String,
    #[serde(skip)]
    pub tools: Vec<Arc<dyn Tool>>,
    #[serde(default)]
    pub companions: Vec<CompanionConfig>,
    #[serde(default)]
    pub initial_context: DataBag,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl ConversationConfig {
    pub fn new(situation: impl Into<String>) -> Self {
        Self {
            situation: situation.into(),
            tools: Vec::new(),
            companions: Vec::new(),
            initial_context: DataBag::new(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn with_companion(mut self, companion: CompanionConfig) -> Self {
        self.companions.push(companion);
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
}

impl std::fmt::Debug for ConversationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationConfig")
            .field("situation", &self.situation)
            .field("tools", &self.tools.iter().map(|t| t.name()).collect::<Vec<_>>())
            .field("companions", &self.companions)
            .field("initial_context", &self.initial_context)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConversationStatus {
    Idle,
    Initializing,
    Ready,
    Processing,
    ChangingSituation,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn now(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConversationEvent {
    Start,
    /// The backend is ready in the given situation.
    Initialized(String),
    SendMessage(String),
    Reply(String),
    ChangeSituation(String),
    SituationChanged(String),
    Complete,
    Error(StepError),
    Retry,
}

impl MachineEvent for ConversationEvent {
    fn event_type(&self) -> Cow<'_, str> {
        Cow::Borrowed(match self {
            ConversationEvent::Start => "START",
            ConversationEvent::Initialized(_) => "INITIALIZED",
            ConversationEvent::SendMessage(_) => "SEND_MESSAGE",
            ConversationEvent::Reply(_) => "REPLY",
            ConversationEvent::ChangeSituation(_) => "CHANGE_SITUATION",
            ConversationEvent::SituationChanged(_) => "SITUATION_CHANGED",
            ConversationEvent::Complete => "COMPLETE",
            ConversationEvent::Error(_) => "ERROR",
            ConversationEvent::Retry => "RETRY",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationContext {
    pub status: ConversationStatus,
    pub data: DataBag,
    pub messages: Vec<Message>,
    pub current_situation: Option<String>,
    pub error: Option<StepError>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl ConversationContext {
    fn seeded(data: DataBag) -> Self {
        Self {
            status: ConversationStatus::Idle,
            data,
            messages: Vec::new(),
            current_situation: None,
            error: None,
            start_time: None,
            end_time: None,
            retry_count: 0,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).to_std().unwrap_or_default()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationState {
    pub value: ConversationStatus,
    pub context: ConversationContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationResult {
    pub success: bool,
    pub data: Option<DataBag>,
    pub messages: Vec<Message>,
    pub current_situation: Option<String>,
    pub error: Option<StepError>,
    pub duration: Option<Duration>,
}

type ConversationMachine = Machine<ConversationStatus, ConversationContext, ConversationEvent>;
type ConversationDefinition = MachineDefinition<ConversationStatus, ConversationContext, ConversationEvent>;

fn enter(status: ConversationStatus) -> impl Fn(&mut ConversationContext) + Send + Sync + 'static {
    move |ctx: &mut ConversationContext| ctx.status = status
}

fn fail() -> Transition<ConversationStatus, ConversationContext, ConversationEvent> {
    Transition::to(ConversationStatus::Failed).action(|ctx: &mut ConversationContext, ev: &ConversationEvent| {
        if let ConversationEvent::Error(err) = ev {
            ctx.error = Some(err.clone());
        }
    })
}

fn lifecycle(max_retries: u32) -> ConversationDefinition {
    use ConversationStatus::*;

    MachineDefinition::new("conversation", Idle)
        .state(Idle, StateNode::new().on("START", Transition::to(Initializing)))
        .state(
            Initializing,
            StateNode::new()
                .entry(|ctx: &mut ConversationContext| {
                    ctx.status = Initializing;
                    ctx.start_time.get_or_insert_with(Utc::now);
                    ctx.end_time = None;
                })
                .on(
                    "INITIALIZED",
                    Transition::to(Ready).action(|ctx: &mut ConversationContext, ev: &ConversationEvent| {
                        if let ConversationEvent::Initialized(situation) = ev {
                            ctx.current_situation = Some(situation.clone());
                        }
                    }),
                )
                .on("ERROR", fail()),
        )
        .state(
            Ready,
            StateNode::new()
                .entry(enter(Ready))
                .on(
                    "SEND_MESSAGE",
                    Transition::to(Processing).action(|ctx: &mut ConversationContext, ev: &ConversationEvent| {
                        if let ConversationEvent::SendMessage(text) = ev {
                            ctx.messages.push(Message::now(Role::User, text));
                        }
                    }),
                )
                .on("CHANGE_SITUATION", Transition::to(ChangingSituation))
                .on("COMPLETE", Transition::to(Completed)),
        )
        .state(
            Processing,
            StateNode::new()
                .entry(enter(Processing))
                .on(
                    "REPLY",
                    Transition::to(Ready).action(|ctx: &mut ConversationContext, ev: &ConversationEvent| {
                        if let ConversationEvent::Reply(text) = ev {
                            ctx.messages.push(Message::now(Role::Assistant, text));
                        }
                    }),
                )
                .on("ERROR", fail()),
        )
        .state(
            ChangingSituation,
            StateNode::new()
                .entry(enter(ChangingSituation))
                .on(
                    "SITUATION_CHANGED",
                    Transition::to(Ready).action(|ctx: &mut ConversationContext, ev: &ConversationEvent| {
                        if let ConversationEvent::SituationChanged(situation) = ev {
                            ctx.current_situation = Some(situation.clone());
                        }
                    }),
                )
                .on("ERROR", fail()),
        )
        .state(
            Completed,
            StateNode::final_state().entry(|ctx: &mut ConversationContext| {
                ctx.status = Completed;
                ctx.end_time = Some(Utc::now());
            }),
        )
        .state(
            Failed,
            StateNode::new()
                .entry(|ctx: &mut ConversationContext| {
                    ctx.status = Failed;
                    ctx.end_time = Some(Utc::now());
                })
                .on(
                    "RETRY",
                    Transition::to(Initializing)
                        .guard(move |ctx: &ConversationContext, _| ctx.retry_count < max_retries)
                        .action(|ctx: &mut ConversationContext, _| {
                            ctx.retry_count += 1;
                            ctx.error = None;
                        }),
                ),
        )
}

/// A conversational agent.
///
/// Operations that need the backend only run in the `ready` state; calling
/// them elsewhere returns [`StepError::Invalid`] without touching the
/// backend. A backend failure moves the agent to `failed`, from which
/// [`ConversationAgent::retry`] re-initializes while retries remain.
pub struct ConversationAgent<B> {
    config: ConversationConfig,
    backend: B,
    machine: ConversationMachine,
    tools: ToolRegistry,
}

impl<B: ConversationBackend> ConversationAgent<B> {
    pub fn new(config: ConversationConfig, backend: B) -> Self {
        let definition = Arc::new(lifecycle(config.max_retries));
        let machine = Machine::new(definition, ConversationContext::seeded(config.initial_context.clone()));
        let mut tools = ToolRegistry::new();
        for tool in &config.tools {
            tools.register_shared(Arc::clone(tool));
        }
        Self {
            config,
            backend,
            machine,
            tools,
        }
    }

    /// Initialize the backend. Retryable failures are retried while the
    /// retry limit allows.
    pub async fn start(&mut self) -> Result<(), StepError> {
        if !self.machine.send(&ConversationEvent::Start) {
            return Err(self.not_in("idle"));
        }
        info!(situation = %self.config.situation, companions = self.config.companions.len(), "conversation starting");
        self.initialize().await
    }

    /// Leave `failed` and initialize the backend again.
    pub async fn retry(&mut self) -> Result<(), StepError> {
        if !self.machine.send(&ConversationEvent::Retry) {
            return Err(self
                .machine
                .context()
                .error
                .clone()
                .unwrap_or_else(|| self.not_in("failed")));
        }
        self.initialize().await
    }

    async fn initialize(&mut self) -> Result<(), StepError> {
        loop {
            let attempt = self.machine.context().retry_count;
            match self
                .backend
                .initialize(&self.config.situation, &self.config.companions)
                .await
            {
                Ok(()) => {
                    self.machine
                        .send(&ConversationEvent::Initialized(self.config.situation.clone()));
                    debug!(attempt, "conversation ready");
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, error = %err, "conversation initialization failed");
                    self.machine.send(&ConversationEvent::Error(err.clone()));
                    if !err.is_retryable() || !self.machine.send(&ConversationEvent::Retry) {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Send a user message and wait for the reply. Both end up in the
    /// message history.
    pub async fn send_message(&mut self, message: &str) -> Result<String, StepError> {
        self.require_ready()?;
        self.machine
            .send(&ConversationEvent::SendMessage(message.to_string()));

        match self.backend.send_message(message).await {
            Ok(reply) => {
                self.machine.send(&ConversationEvent::Reply(reply.clone()));
                Ok(reply)
            }
            Err(err) => {
                warn!(error = %err, "message failed");
                self.machine.send(&ConversationEvent::Error(err.clone()));
                Err(err)
            }
        }
    }

    pub async fn change_situation(&mut self, situation: &str) -> Result<(), StepError> {
        self.require_ready()?;
        self.machine
            .send(&ConversationEvent::ChangeSituation(situation.to_string()));

        match self.backend.change_situation(situation).await {
            Ok(()) => {
                self.machine
                    .send(&ConversationEvent::SituationChanged(situation.to_string()));
                debug!(situation, "situation changed");
                Ok(())
            }
            Err(err) => {
                warn!(situation, error = %err, "situation change failed");
                self.machine.send(&ConversationEvent::Error(err.clone()));
                Err(err)
            }
        }
    }

    /// End the conversation. From `ready` this completes it; in any other
    /// state the current outcome is reported as is.
    pub fn finish(&mut self) -> ConversationResult {
        self.machine.send(&ConversationEvent::Complete);

        let ctx = self.machine.context();
        let success = *self.machine.current() == ConversationStatus::Completed;
        info!(status = ?self.machine.current(), messages = ctx.messages.len(), "conversation finished");
        ConversationResult {
            success,
            data: success.then(|| ctx.data.clone()),
            messages: ctx.messages.clone(),
            current_situation: ctx.current_situation.clone(),
            error: if success { None } else { ctx.error.clone() },
            duration: ctx.duration(),
        }
    }

    /// Drive the lifecycle by hand. Returns `false` when the event was not
    /// accepted.
    pub fn send(&mut self, event: ConversationEvent) -> bool {
        self.machine.send(&event)
    }

    pub fn state(&self) -> ConversationState {
        ConversationState {
            value: *self.machine.current(),
            context: self.machine.context().clone(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.machine.context().messages
    }

    pub fn current_situation(&self) -> Option<&str> {
        self.machine.context().current_situation.as_deref()
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register_tool(&mut self, tool: impl Tool + 'static) {
        self.tools.register(tool);
    }

    pub async fn execute_tool(&self, name: &str, params: Params) -> Result<Value, ToolError> {
        self.tools.execute(name, &params).await
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    fn require_ready(&self) -> Result<(), StepError> {
        if *self.machine.current() == ConversationStatus::Ready {
            Ok(())
        } else {
            Err(self.not_in("ready"))
        }
    }

    fn not_in(&self, expected: &str) -> StepError {
        StepError::invalid(format!(
            "conversation is {:?}, expected {expected}",
            self.machine.current()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Scripted {
        init_failures: u32,
        init_calls: u32,
        fatal_init: bool,
        situations: Vec<String>,
    }

    #[async_trait]
    impl ConversationBackend for Scripted {
        async fn initialize(&mut self, situation: &str, companions: &[CompanionConfig]) -> Result<(), StepError> {
            self.init_calls += 1;
            if self.fatal_init {
                return Err(StepError::invalid("bad companion config"));
            }
            if self.init_calls <= self.init_failures {
                return Err(StepError::transient("engine warming up"));
            }
            self.situations.push(format!("{situation}/{}", companions.len()));
            Ok(())
        }

        async fn send_message(&mut self, message: &str) -> Result<String, StepError> {
            if message.contains("explode") {
                return Err(StepError::failed("engine crashed"));
            }
            Ok(format!("echo: {message}"))
        }

        async fn change_situation(&mut self, situation: &str) -> Result<(), StepError> {
            self.situations.push(situation.to_string());
            Ok(())
        }
    }

    fn config() -> ConversationConfig {
        ConversationConfig::new("coffee shop").with_companion(CompanionConfig::new("barista", "Sam"))
    }

    #[tokio::test]
    async fn start_initializes_the_backend() {
        let mut agent = ConversationAgent::new(config(), Scripted::default());
        agent.start().await.unwrap();

        assert_eq!(agent.state().value, ConversationStatus::Ready);
        assert_eq!(agent.current_situation(), Some("coffee shop"));
        assert_eq!(agent.backend().situations, vec!["coffee shop/1".to_string()]);
    }

    #[tokio::test]
    async fn messages_are_recorded_in_order() {
        let mut agent = ConversationAgent::new(config(), Scripted::default());
        agent.start().await.unwrap();

        assert_eq!(agent.send_message("hi").await.unwrap(), "echo: hi");
        let roles: Vec<Role> = agent.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(agent.messages()[1].content, "echo: hi");
        assert_eq!(agent.state().value, ConversationStatus::Ready);
    }

    #[tokio::test]
    async fn situation_changes_are_tracked() {
        let mut agent = ConversationAgent::new(config(), Scripted::default());
        agent.start().await.unwrap();
        agent.change_situation("library").await.unwrap();
        assert_eq!(agent.current_situation(), Some("library"));
    }

    #[tokio::test]
    async fn operations_before_start_are_rejected() {
        let mut agent = ConversationAgent::new(config(), Scripted::default());
        let err = agent.send_message("hi").await.unwrap_err();
        assert!(matches!(err, StepError::Invalid(_)));
        assert!(agent.messages().is_empty());
        assert_eq!(agent.state().value, ConversationStatus::Idle);
    }

    #[tokio::test]
    async fn transient_init_failures_are_retried() {
        let backend = Scripted {
            init_failures: 2,
            ..Scripted::default()
        };
        let mut agent = ConversationAgent::new(config(), backend);
        agent.start().await.unwrap();

        assert_eq!(agent.backend().init_calls, 3);
        assert_eq!(agent.state().context.retry_count, 2);
    }

    #[tokio::test]
    async fn init_retries_are_bounded() {
        let backend = Scripted {
            init_failures: u32::MAX,
            ..Scripted::default()
        };
        let mut agent = ConversationAgent::new(config().with_max_retries(1), backend);
        let err = agent.start().await.unwrap_err();

        assert!(matches!(err, StepError::Transient(_)));
        assert_eq!(agent.backend().init_calls, 2);
        assert_eq!(agent.state().value, ConversationStatus::Failed);
        assert!(agent.retry().await.is_err());
    }

    #[tokio::test]
    async fn invalid_init_failure_is_not_retried() {
        let backend = Scripted {
            fatal_init: true,
            ..Scripted::default()
        };
        let mut agent = ConversationAgent::new(config(), backend);
        assert!(agent.start().await.is_err());
        assert_eq!(agent.backend().init_calls, 1);
    }

    #[tokio::test]
    async fn failed_message_can_be_recovered_with_retry() {
        let mut agent = ConversationAgent::new(config(), Scripted::default());
        agent.start().await.unwrap();

        let err = agent.send_message("explode").await.unwrap_err();
        assert_eq!(err, StepError::failed("engine crashed"));
        assert_eq!(agent.state().value, ConversationStatus::Failed);

        agent.retry().await.unwrap();
        assert_eq!(agent.state().value, ConversationStatus::Ready);
        // The user message that failed stays in the history.
        assert_eq!(agent.messages().len(), 1);
    }

    #[tokio::test]
    async fn finish_from_ready_completes() {
        let seed: DataBag = [("topic", json!("coffee"))].into_iter().collect();
        let mut agent = ConversationAgent::new(config().with_initial_context(seed), Scripted::default());
        agent.start().await.unwrap();
        agent.send_message("latte please").await.unwrap();

        let result = agent.finish();
        assert!(result.success);
        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.current_situation.as_deref(), Some("coffee shop"));
        assert_eq!(result.data.unwrap().get("topic"), Some(&json!("coffee")));
        assert!(result.duration.is_some());
    }

    #[tokio::test]
    async fn finish_after_failure_reports_the_error() {
        let mut agent = ConversationAgent::new(config(), Scripted::default());
        agent.start().await.unwrap();
        let _ = agent.send_message("explode").await;

        let result = agent.finish();
        assert!(!result.success);
        assert_eq!(result.error, Some(StepError::failed("engine crashed")));
        assert!(result.data.is_none());
    }

    #[test]
    fn config_parses_companion_settings() {
        let config = ConversationConfig::from_json(
            r#"{"situation": "bar", "companions": [{"id": "c1", "name": "Ann", "mood": "cheerful"}]}"#,
        )
        .unwrap();
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.companions[0].settings.get("mood"), Some(&json!("cheerful")));
    }

    struct Dice;

    #[async_trait]
    impl Tool for Dice {
        fn name(&self) -> &str {
            "dice"
        }
        fn description(&self) -> &str {
            "rolls a loaded die"
        }
        fn validate(&self, params: &Params) -> bool {
            params.get("sides").is_some_and(Value::is_u64)
        }
        async fn execute(&self, params: &Params) -> Result<Value, ToolError> {
            Ok(params.get("sides").cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn configured_tools_are_callable() {
        let mut agent = ConversationAgent::new(config().with_tool(Dice), Scripted::default());
        assert!(agent.tools().contains("dice"));

        let mut params = Params::new();
        params.insert("sides".into(), json!(6));
        assert_eq!(agent.execute_tool("dice", params).await.unwrap(), json!(6));
        assert!(matches!(
            agent.execute_tool("dice", Params::new()).await,
            Err(ToolError::InvalidParameters { .. })
        ));
        assert!(matches!(
            agent.execute_tool("coin", Params::new()).await,
            Err(ToolError::NotFound(_))
        ));

        agent.register_tool(crate::tools::ProcessTool::new());
        assert_eq!(agent.tools().len(), 2);
    }

    #[test]
    fn status_serializes_camel_case() {
        assert_eq!(
            serde_json::to_value(ConversationStatus::ChangingSituation).unwrap(),
            json!("changingSituation")
        );
    }
}
