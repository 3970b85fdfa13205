//! State-machine driven agents, declarative workflows and built-in tools.
//!
//! An [`Agent`] runs an optional [`Task`] through an explicit lifecycle
//! (`idle → running → completed | failed`, with bounded retries) and can call
//! the [`tools`] registered with it. A [`Workflow`] compiles a
//! [`WorkflowDefinition`] (states, invoked operations, transitions) into a
//! state machine and runs fresh instances of it, collecting each operation's
//! output in a shared [`DataBag`].
//!
//! # Quick start
//!
//! ```rust
//! use agentplate::{Workflow, WorkflowContext, WorkflowDefinition, WorkflowState};
//! use serde_json::{Value, json};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), agentplate::WorkflowError> {
//! let definition = WorkflowDefinition::new("demo", "fetch")
//!     .state("fetch", WorkflowState::invoke("fetch", "double"))
//!     .state("double", WorkflowState::invoke("double", "done"))
//!     .state("done", WorkflowState::final_state());
//!
//! let wf = Workflow::new(definition)?
//!     .operation("fetch", |_| async { Ok(json!(21)) })
//!     .operation("double", |ctx: WorkflowContext| async move {
//!         let n = ctx.data.get("fetch").and_then(Value::as_i64).unwrap_or_default();
//!         Ok(json!(n * 2))
//!     });
//!
//! let ctx = wf.start().await?;
//! assert_eq!(ctx.data.get("double"), Some(&json!(42)));
//! # Ok(())
//! # }
//! ```

mod agent;
mod conversation;
mod data;
pub mod fsm;
mod runner;
mod template;
pub mod tools;
mod workflow;

pub use agent::{
    Agent, AgentConfig, AgentContext, AgentEvent, AgentMetadata, AgentResult, AgentState, AgentStatus,
    DEFAULT_MAX_RETRIES, StepError, Task, TaskScope,
};
pub use conversation::{
    CompanionConfig, ConversationAgent, ConversationBackend, ConversationConfig, ConversationContext,
    ConversationEvent, ConversationResult, ConversationState, ConversationStatus, Message, Role,
};
pub use data::DataBag;
pub use fsm::{MachineError, TransitionEvent};
pub use runner::{StepEvent, WorkflowHandle, WorkflowRun};
pub use template::{FileTemplateStore, InMemoryTemplateStore, TemplateError, TemplateStore};
pub use workflow::{
    ERROR_STATE, FnOperation, InvokeDescriptor, Operation, StateKind, ToolOperation, Workflow, WorkflowContext,
    WorkflowDefinition, WorkflowError, WorkflowEvent, WorkflowState,
};
