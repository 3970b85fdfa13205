use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::agent::StepError;
use crate::data::DataBag;
use crate::fsm::{MachineDefinition, MachineError, MachineEvent, StateNode, Transition};
use crate::template::{TemplateError, TemplateStore};
use crate::tools::{Params, Tool};

/// Name of the state a failed run ends in. Synthesized when a definition
/// does not declare it.
pub const ERROR_STATE: &str = "error";

// ---------------------------------------------------------------------------
// WorkflowError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Invalid(#[from] MachineError),
    #[error("workflow '{workflow}': no operation registered for '{src}'")]
    MissingOperation { workflow: String, src: String },
    #[error("workflow '{workflow}' stalled in state '{state}': nothing to invoke and no event source left")]
    Stalled { workflow: String, state: String },
    #[error("workflow '{workflow}' failed: {error}")]
    Failed { workflow: String, error: StepError },
    #[error(transparent)]
    Template(#[from] TemplateError),
}

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// Which operation a state runs and where to go afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeDescriptor {
    pub src: String,
    pub on_done: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Final,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke: Option<InvokeDescriptor>,
    /// Event name to target state, for manually driven transitions.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub on: BTreeMap<String, String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<StateKind>,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invoke(src: impl Into<String>, on_done: impl Into<String>) -> Self {
        Self {
            invoke: Some(InvokeDescriptor {
                src: src.into(),
                on_done: on_done.into(),
                on_error: None,
            }),
            ..Self::default()
        }
    }

    pub fn final_state() -> Self {
        Self {
            kind: Some(StateKind::Final),
            ..Self::default()
        }
    }

    /// Failure target for the invoked operation. Without one, failures go to
    /// the `error` state.
    pub fn on_error(mut self, target: impl Into<String>) -> Self {
        if let Some(invoke) = &mut self.invoke {
            invoke.on_error = Some(target.into());
        }
        self
    }

    pub fn on(mut self, event: impl Into<String>, target: impl Into<String>) -> Self {
        self.on.insert(event.into(), target.into());
        self
    }

    pub fn is_final(&self) -> bool {
        self.kind == Some(StateKind::Final)
    }
}

/// A declarative state graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub initial: String,
    pub states: BTreeMap<String, WorkflowState>,
    /// Seed for the data bag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<DataBag>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, initial: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            initial: initial.into(),
            states: BTreeMap::new(),
            context: None,
        }
    }

    pub fn state(mut self, name: impl Into<String>, state: WorkflowState) -> Self {
        self.states.insert(name.into(), state);
        self
    }

    pub fn with_context(mut self, context: DataBag) -> Self {
        self.context = Some(context);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Every operation name referenced by an invoking state.
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.states
            .values()
            .filter_map(|s| s.invoke.as_ref())
            .map(|i| i.src.as_str())
    }

    pub(crate) fn invoke_of(&self, state: &str) -> Option<&InvokeDescriptor> {
        self.states.get(state).and_then(|s| s.invoke.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Mutable state of one workflow run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowContext {
    /// Output of each invoked state under the state's name, plus anything
    /// merged by `UPDATE` events.
    pub data: DataBag,
    pub error: Option<StepError>,
}

/// Events a caller can send to a running workflow.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    /// Merge into the data bag without changing state.
    Update(DataBag),
    /// Record the error and go to the `error` state.
    Error(StepError),
    /// A manual transition declared in a state's `on` map.
    Named(String),
}

/// Everything the compiled machine reacts to: caller events plus the
/// outcome of invoked operations.
#[derive(Debug, Clone)]
pub(crate) enum Signal {
    External(WorkflowEvent),
    Done { state: String, output: Value },
    Failed { state: String, error: StepError },
}

fn done_event(state: &str) -> String {
    format!("done.invoke.{state}")
}

fn error_event(state: &str) -> String {
    format!("error.invoke.{state}")
}

impl MachineEvent for Signal {
    fn event_type(&self) -> Cow<'_, str> {
        match self {
            Signal::External(WorkflowEvent::Update(_)) => Cow::Borrowed("UPDATE"),
            Signal::External(WorkflowEvent::Error(_)) => Cow::Borrowed("ERROR"),
            Signal::External(WorkflowEvent::Named(name)) => Cow::Borrowed(name),
            Signal::Done { state, .. } => Cow::Owned(done_event(state)),
            Signal::Failed { state, .. } => Cow::Owned(error_event(state)),
        }
    }
}

pub(crate) type CompiledWorkflow = MachineDefinition<String, WorkflowContext, Signal>;

fn record_error(ctx: &mut WorkflowContext, signal: &Signal) {
    match signal {
        Signal::Failed { error, .. } | Signal::External(WorkflowEvent::Error(error)) => {
            ctx.error = Some(error.clone());
        }
        _ => {}
    }
}

/// Wire each state's invoke and `on` declarations into transitions.
///
/// Nothing runs here. An invoked state gets a `done.invoke.<state>`
/// transition that stores the output under the state's name, and an
/// `error.invoke.<state>` transition that records the error. `UPDATE` and
/// `ERROR` are accepted in every state.
pub(crate) fn compile(definition: &WorkflowDefinition) -> Result<CompiledWorkflow, WorkflowError> {
    let mut machine = MachineDefinition::new(definition.id.clone(), definition.initial.clone());

    for (name, state) in &definition.states {
        let mut node = if state.is_final() {
            StateNode::final_state()
        } else {
            StateNode::new()
        };

        if let Some(invoke) = &state.invoke {
            let key = name.clone();
            node = node.on(
                done_event(name),
                Transition::to(invoke.on_done.clone()).action(move |ctx: &mut WorkflowContext, signal: &Signal| {
                    if let Signal::Done { output, .. } = signal {
                        ctx.data.insert(key.clone(), output.clone());
                    }
                }),
            );

            let failure_target = invoke.on_error.clone().unwrap_or_else(|| ERROR_STATE.to_string());
            node = node.on(error_event(name), Transition::to(failure_target).action(record_error));
        }

        for (event, target) in &state.on {
            node = node.on(event.clone(), Transition::to(target.clone()));
        }
        machine = machine.state(name.clone(), node);
    }

    if !definition.states.contains_key(ERROR_STATE) {
        // The error recorded on the way in is left as is.
        machine = machine.state(ERROR_STATE.to_string(), StateNode::final_state());
    }

    let machine = machine
        .on_any(
            "UPDATE",
            Transition::internal().action(|ctx: &mut WorkflowContext, signal: &Signal| {
                if let Signal::External(WorkflowEvent::Update(data)) = signal {
                    ctx.data.merge(data.clone());
                }
            }),
        )
        .on_any("ERROR", Transition::to(ERROR_STATE.to_string()).action(record_error));

    machine.validate()?;
    Ok(machine)
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// The asynchronous work behind an invoke `src`.
///
/// Receives a snapshot of the context as it was when the state was entered.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn invoke(&self, context: WorkflowContext) -> Result<Value, StepError>;
}

/// Adapts a closure returning a future.
pub struct FnOperation<F>(F);

impl<F> FnOperation<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Operation for FnOperation<F>
where
    F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    async fn invoke(&self, context: WorkflowContext) -> Result<Value, StepError> {
        (self.0)(context).await
    }
}

/// Runs a tool with fixed parameters. Validation failures and tool errors
/// become step failures.
pub struct ToolOperation {
    tool: Arc<dyn Tool>,
    params: Params,
}

impl ToolOperation {
    pub fn new(tool: Arc<dyn Tool>, params: Params) -> Self {
        Self { tool, params }
    }
}

#[async_trait]
impl Operation for ToolOperation {
    async fn invoke(&self, _context: WorkflowContext) -> Result<Value, StepError> {
        if !self.tool.validate(&self.params) {
            return Err(StepError::invalid(format!(
                "invalid parameters for tool '{}'",
                self.tool.name()
            )));
        }
        Ok(self.tool.execute(&self.params).await?)
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A compiled definition plus the operations its states invoke.
///
/// Each call to [`Workflow::start`] (or [`Workflow::run`]) creates a fresh
/// machine instance; runs never share context.
pub struct Workflow {
    pub(crate) definition: WorkflowDefinition,
    pub(crate) compiled: Arc<CompiledWorkflow>,
    operations: HashMap<String, Arc<dyn Operation>>,
    step_timeout: Option<Duration>,
}

impl Workflow {
    pub fn new(definition: WorkflowDefinition) -> Result<Self, WorkflowError> {
        let compiled = compile(&definition)?;
        debug!(workflow = %definition.id, states = definition.states.len(), "compiled workflow");
        Ok(Self {
            definition,
            compiled: Arc::new(compiled),
            operations: HashMap::new(),
            step_timeout: None,
        })
    }

    /// Fetch a definition from a template store.
    pub async fn load_template(store: &dyn TemplateStore, id: &str) -> Result<WorkflowDefinition, TemplateError> {
        store.load(id).await
    }

    /// Build a workflow from a stored template, merging `params` into its
    /// initial context.
    pub async fn from_template(store: &dyn TemplateStore, id: &str, params: DataBag) -> Result<Self, WorkflowError> {
        let mut definition = Self::load_template(store, id).await?;
        definition.context.get_or_insert_with(DataBag::new).merge(params);
        Self::new(definition)
    }

    pub fn with_operation(mut self, src: impl Into<String>, operation: impl Operation + 'static) -> Self {
        self.operations.insert(src.into(), Arc::new(operation));
        self
    }

    pub fn operation<F, Fut>(self, src: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        self.with_operation(src, FnOperation(f))
    }

    pub fn with_tool(self, src: impl Into<String>, tool: Arc<dyn Tool>, params: Params) -> Self {
        self.with_operation(src, ToolOperation::new(tool, params))
    }

    /// Bound every invoked operation. Expiry fails the step with
    /// [`StepError::Timeout`].
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Invoked sources with no registered operation.
    pub fn missing_operations(&self) -> Vec<&str> {
        let mut missing: Vec<&str> = self
            .definition
            .sources()
            .filter(|src| !self.operations.contains_key(*src))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }

    pub(crate) fn step(
        &self,
        src: &str,
        context: WorkflowContext,
    ) -> Result<BoxFuture<'static, Result<Value, StepError>>, WorkflowError> {
        let operation = self
            .operations
            .get(src)
            .cloned()
            .ok_or_else(|| WorkflowError::MissingOperation {
                workflow: self.definition.id.clone(),
                src: src.to_string(),
            })?;

        let invocation = async move { operation.invoke(context).await };
        Ok(match self.step_timeout {
            Some(limit) => Box::pin(async move {
                tokio::time::timeout(limit, invocation)
                    .await
                    .unwrap_or_else(|_| Err(StepError::timeout(format!("step exceeded {}ms", limit.as_millis()))))
            }),
            None => Box::pin(invocation),
        })
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut operations: Vec<&String> = self.operations.keys().collect();
        operations.sort();
        f.debug_struct("Workflow")
            .field("definition", &self.definition)
            .field("operations", &operations)
            .field("step_timeout", &self.step_timeout)
            .finish()
    }
}
