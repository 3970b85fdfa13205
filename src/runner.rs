use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

use crate::agent::StepError;
use crate::data::DataBag;
use crate::fsm::{Machine, TransitionEvent};
use crate::workflow::{ERROR_STATE, Signal, Workflow, WorkflowContext, WorkflowError, WorkflowEvent};

/// Passed to the `on_step` hook when an invoked operation settles.
pub struct StepEvent<'a> {
    pub state: &'a str,
    pub src: &'a str,
    pub result: &'a Result<Value, StepError>,
    pub duration: Duration,
    pub step_number: usize,
}

type StepHook = Box<dyn FnMut(&StepEvent) + Send>;

/// Sends events into a running workflow. Cheap to clone.
///
/// A run with no handle left and nothing to invoke cannot make progress and
/// ends with [`WorkflowError::Stalled`].
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    tx: mpsc::UnboundedSender<WorkflowEvent>,
}

impl WorkflowHandle {
    /// Queue `event`. Returns `false` once the run has finished.
    pub fn send(&self, event: WorkflowEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn update(&self, data: DataBag) -> bool {
        self.send(WorkflowEvent::Update(data))
    }

    pub fn raise(&self, error: StepError) -> bool {
        self.send(WorkflowEvent::Error(error))
    }

    pub fn event(&self, name: impl Into<String>) -> bool {
        self.send(WorkflowEvent::Named(name.into()))
    }
}

/// One instance of a workflow, from its initial state to a final one.
pub struct WorkflowRun<'w> {
    workflow: &'w Workflow,
    machine: Machine<String, WorkflowContext, Signal>,
    inbox: mpsc::UnboundedReceiver<WorkflowEvent>,
    tx: mpsc::UnboundedSender<WorkflowEvent>,
    on_step: Option<StepHook>,
}

impl Workflow {
    /// Create a fresh instance without driving it.
    pub fn run(&self) -> WorkflowRun<'_> {
        let (tx, inbox) = mpsc::unbounded_channel();
        let context = WorkflowContext {
            data: self.definition.context.clone().unwrap_or_default(),
            error: None,
        };
        WorkflowRun {
            workflow: self,
            machine: Machine::new(Arc::clone(&self.compiled), context),
            inbox,
            tx,
            on_step: None,
        }
    }

    /// Run a fresh instance to completion.
    ///
    /// Resolves with the final context when a final state other than `error`
    /// is reached, and with [`WorkflowError::Failed`] carrying the recorded
    /// error when the run ends in `error`.
    pub async fn start(&self) -> Result<WorkflowContext, WorkflowError> {
        self.run().finish().await
    }
}

impl WorkflowRun<'_> {
    pub fn handle(&self) -> WorkflowHandle {
        WorkflowHandle { tx: self.tx.clone() }
    }

    /// Register a callback that fires on every state change.
    pub fn on_transition(mut self, hook: impl FnMut(&TransitionEvent<String>) + Send + 'static) -> Self {
        self.machine.on_transition(hook);
        self
    }

    /// Register a callback that fires each time an invoked operation settles.
    /// Abandoned operations are not reported.
    pub fn on_step(mut self, hook: impl FnMut(&StepEvent) + Send + 'static) -> Self {
        self.on_step = Some(Box::new(hook));
        self
    }

    pub fn state(&self) -> &str {
        self.machine.current()
    }

    pub fn context(&self) -> &WorkflowContext {
        self.machine.context()
    }

    /// Drive the run until it reaches a final state.
    ///
    /// Events already queued are applied, in order, before the current
    /// state's operation is invoked and before its result is taken. An event
    /// that moves the machine out of the state abandons the operation and its
    /// result is never applied.
    pub async fn finish(self) -> Result<WorkflowContext, WorkflowError> {
        let WorkflowRun {
            workflow,
            mut machine,
            mut inbox,
            tx,
            mut on_step,
        } = self;
        drop(tx);

        let id = workflow.id().to_string();
        if let Some(src) = workflow.missing_operations().first() {
            return Err(WorkflowError::MissingOperation {
                workflow: id,
                src: src.to_string(),
            });
        }

        info!(workflow = %id, initial = %machine.current(), "workflow started");
        let mut inbox_open = true;
        let mut step_number = 0usize;

        loop {
            let state = machine.current().clone();

            if state == ERROR_STATE {
                let error = machine
                    .context()
                    .error
                    .clone()
                    .unwrap_or_else(|| StepError::other("workflow entered the error state"));
                warn!(workflow = %id, error = %error, "workflow failed");
                return Err(WorkflowError::Failed { workflow: id, error });
            }
            if machine.is_final() {
                info!(workflow = %id, state = %state, "workflow completed");
                return Ok(machine.into_context());
            }

            let Some(invoke) = workflow.definition.invoke_of(&state) else {
                if !inbox_open {
                    return Err(WorkflowError::Stalled { workflow: id, state });
                }
                match inbox.recv().await {
                    Some(event) => {
                        machine.send(&Signal::External(event));
                    }
                    None => inbox_open = false,
                }
                continue;
            };

            let generation = machine.transitions();
            apply_pending(&mut machine, &mut inbox, &mut inbox_open);
            if machine.transitions() != generation {
                continue;
            }

            step_number += 1;
            let started = Instant::now();
            let mut step = workflow.step(&invoke.src, machine.context().clone())?;
            debug!(workflow = %id, state = %state, src = %invoke.src, step = step_number, "invoking");

            loop {
                tokio::select! {
                    biased;
                    event = inbox.recv(), if inbox_open => match event {
                        Some(event) => {
                            machine.send(&Signal::External(event));
                            if machine.transitions() != generation {
                                debug!(workflow = %id, state = %state, src = %invoke.src, "step abandoned");
                                break;
                            }
                        }
                        None => inbox_open = false,
                    },
                    result = &mut step => {
                        let duration = started.elapsed();
                        if let Some(hook) = &mut on_step {
                            hook(&StepEvent {
                                state: &state,
                                src: &invoke.src,
                                result: &result,
                                duration,
                                step_number,
                            });
                        }
                        let signal = match result {
                            Ok(output) => {
                                debug!(workflow = %id, state = %state, duration_ms = duration.as_millis() as u64, "step done");
                                Signal::Done { state: state.clone(), output }
                            }
                            Err(error) => {
                                warn!(workflow = %id, state = %state, error = %error, "step failed");
                                Signal::Failed { state: state.clone(), error }
                            }
                        };
                        machine.send(&signal);
                        break;
                    }
                }
            }
        }
    }
}

/// Apply every event already queued, stopping early if one changes state.
fn apply_pending(
    machine: &mut Machine<String, WorkflowContext, Signal>,
    inbox: &mut mpsc::UnboundedReceiver<WorkflowEvent>,
    inbox_open: &mut bool,
) {
    let generation = machine.transitions();
    while *inbox_open && machine.transitions() == generation {
        match inbox.try_recv() {
            Ok(event) => {
                machine.send(&Signal::External(event));
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => *inbox_open = false,
        }
    }
}
