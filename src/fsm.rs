//! A small finite state machine.
//!
//! A [`MachineDefinition`] is an immutable table of named states, each with
//! its own transitions keyed by event type, plus transitions accepted in any
//! state. A [`Machine`] is one running instance of a definition: it owns the
//! current state and the context, and processes one event at a time.
//!
//! Processing an event:
//! 1. the current state's transition for the event type is tried, then the
//!    global one; a transition whose guard rejects is skipped,
//! 2. if the transition has a target, the exit actions of the current state
//!    run,
//! 3. the transition's own actions run,
//! 4. the current state becomes the target and its entry actions run.
//!
//! A transition without a target only runs its actions. Final states accept
//! no further events.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use tracing::trace;

/// Anything a machine can receive.
pub trait MachineEvent {
    /// Key used to look the event up in the transition table.
    fn event_type(&self) -> Cow<'_, str>;
}

pub type Guard<C, E> = Arc<dyn Fn(&C, &E) -> bool + Send + Sync>;
pub type Action<C, E> = Arc<dyn Fn(&mut C, &E) + Send + Sync>;
pub type StateAction<C> = Arc<dyn Fn(&mut C) + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MachineError {
    #[error("machine '{machine}': initial state {state} is not declared")]
    UnknownInitial { machine: String, state: String },
    #[error("machine '{machine}': {from} --{event}--> {target}: target is not declared")]
    UnknownTarget {
        machine: String,
        from: String,
        event: String,
        target: String,
    },
}

pub struct Transition<S, C, E> {
    target: Option<S>,
    guard: Option<Guard<C, E>>,
    actions: Vec<Action<C, E>>,
}

impl<S, C, E> Transition<S, C, E> {
    /// Move to `target` when the event fires.
    pub fn to(target: S) -> Self {
        Self {
            target: Some(target),
            guard: None,
            actions: Vec::new(),
        }
    }

    /// Run actions without leaving the current state.
    pub fn internal() -> Self {
        Self {
            target: None,
            guard: None,
            actions: Vec::new(),
        }
    }

    pub fn guard(mut self, guard: impl Fn(&C, &E) -> bool + Send + Sync + 'static) -> Self {
        self.guard = Some(Arc::new(guard));
        self
    }

    pub fn action(mut self, action: impl Fn(&mut C, &E) + Send + Sync + 'static) -> Self {
        self.actions.push(Arc::new(action));
        self
    }

    pub fn target(&self) -> Option<&S> {
        self.target.as_ref()
    }

    fn allows(&self, context: &C, event: &E) -> bool {
        self.guard.as_ref().is_none_or(|g| g(context, event))
    }
}

pub struct StateNode<S, C, E> {
    on: HashMap<String, Transition<S, C, E>>,
    entry: Vec<StateAction<C>>,
    exit: Vec<StateAction<C>>,
    is_final: bool,
}

impl<S, C, E> StateNode<S, C, E> {
    pub fn new() -> Self {
        Self {
            on: HashMap::new(),
            entry: Vec::new(),
            exit: Vec::new(),
            is_final: false,
        }
    }

    pub fn final_state() -> Self {
        Self {
            is_final: true,
            ..Self::new()
        }
    }

    pub fn on(mut self, event: impl Into<String>, transition: Transition<S, C, E>) -> Self {
        self.on.insert(event.into(), transition);
        self
    }

    pub fn entry(mut self, action: impl Fn(&mut C) + Send + Sync + 'static) -> Self {
        self.entry.push(Arc::new(action));
        self
    }

    pub fn exit(mut self, action: impl Fn(&mut C) + Send + Sync + 'static) -> Self {
        self.exit.push(Arc::new(action));
        self
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    pub fn handles(&self, event: &str) -> bool {
        self.on.contains_key(event)
    }
}

impl<S, C, E> Default for StateNode<S, C, E> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MachineDefinition<S, C, E> {
    id: String,
    initial: S,
    states: HashMap<S, StateNode<S, C, E>>,
    global: HashMap<String, Transition<S, C, E>>,
}

impl<S, C, E> MachineDefinition<S, C, E>
where
    S: Clone + Eq + Hash + Debug,
{
    pub fn new(id: impl Into<String>, initial: S) -> Self {
        Self {
            id: id.into(),
            initial,
            states: HashMap::new(),
            global: HashMap::new(),
        }
    }

    pub fn state(mut self, name: S, node: StateNode<S, C, E>) -> Self {
        self.states.insert(name, node);
        self
    }

    /// Register a transition accepted in every state that does not handle
    /// the event itself.
    pub fn on_any(mut self, event: impl Into<String>, transition: Transition<S, C, E>) -> Self {
        self.global.insert(event.into(), transition);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn initial(&self) -> &S {
        &self.initial
    }

    pub fn has_state(&self, state: &S) -> bool {
        self.states.contains_key(state)
    }

    pub fn node(&self, state: &S) -> Option<&StateNode<S, C, E>> {
        self.states.get(state)
    }

    /// Check that the initial state and every transition target is declared.
    pub fn validate(&self) -> Result<(), MachineError> {
        if !self.has_state(&self.initial) {
            return Err(MachineError::UnknownInitial {
                machine: self.id.clone(),
                state: format!("{:?}", self.initial),
            });
        }

        let local = self
            .states
            .iter()
            .flat_map(|(from, node)| node.on.iter().map(move |(ev, t)| (Some(from), ev, t)));
        let global = self.global.iter().map(|(ev, t)| (None, ev, t));

        for (from, event, transition) in local.chain(global) {
            if let Some(target) = &transition.target
                && !self.has_state(target)
            {
                return Err(MachineError::UnknownTarget {
                    machine: self.id.clone(),
                    from: from.map_or_else(|| "*".to_string(), |s| format!("{s:?}")),
                    event: event.clone(),
                    target: format!("{target:?}"),
                });
            }
        }
        Ok(())
    }

    fn select(&self, current: &S, context: &C, event: &E, event_type: &str) -> Option<&Transition<S, C, E>> {
        let local = self
            .states
            .get(current)
            .and_then(|node| node.on.get(event_type))
            .filter(|t| t.allows(context, event));

        local.or_else(|| {
            self.global
                .get(event_type)
                .filter(|t| t.allows(context, event))
        })
    }
}

/// Passed to the transition hook whenever the machine changes state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEvent<S> {
    pub from: S,
    pub to: S,
    pub event: String,
}

type Hook<S> = Box<dyn FnMut(&TransitionEvent<S>) + Send>;

pub struct Machine<S, C, E> {
    definition: Arc<MachineDefinition<S, C, E>>,
    current: S,
    context: C,
    transitions: u64,
    on_transition: Option<Hook<S>>,
}

impl<S, C, E> Machine<S, C, E>
where
    S: Clone + Eq + Hash + Debug,
    E: MachineEvent,
{
    /// Start a new instance in the definition's initial state, running its
    /// entry actions.
    pub fn new(definition: Arc<MachineDefinition<S, C, E>>, mut context: C) -> Self {
        let current = definition.initial.clone();
        if let Some(node) = definition.node(&current) {
            for action in &node.entry {
                action(&mut context);
            }
        }
        Self {
            definition,
            current,
            context,
            transitions: 0,
            on_transition: None,
        }
    }

    pub fn on_transition(&mut self, hook: impl FnMut(&TransitionEvent<S>) + Send + 'static) {
        self.on_transition = Some(Box::new(hook));
    }

    pub fn current(&self) -> &S {
        &self.current
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn into_context(self) -> C {
        self.context
    }

    pub fn definition(&self) -> &MachineDefinition<S, C, E> {
        &self.definition
    }

    /// Number of state changes so far. Self-transitions count.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    pub fn is_final(&self) -> bool {
        self.definition
            .node(&self.current)
            .is_some_and(StateNode::is_final)
    }

    /// Whether `event` would be accepted right now.
    pub fn can(&self, event: &E) -> bool {
        !self.is_final()
            && self
                .definition
                .select(&self.current, &self.context, event, &event.event_type())
                .is_some()
    }

    /// Process one event. Returns `false` when the event was ignored.
    pub fn send(&mut self, event: &E) -> bool {
        let event_type = event.event_type();
        if self.is_final() {
            trace!(machine = %self.definition.id, state = ?self.current, event = %event_type, "final state ignores event");
            return false;
        }

        let definition = Arc::clone(&self.definition);
        let Some(transition) = definition.select(&self.current, &self.context, event, &event_type) else {
            trace!(machine = %definition.id, state = ?self.current, event = %event_type, "event ignored");
            return false;
        };

        let Some(target) = transition.target.clone() else {
            for action in &transition.actions {
                action(&mut self.context, event);
            }
            return true;
        };

        if let Some(node) = definition.node(&self.current) {
            for action in &node.exit {
                action(&mut self.context);
            }
        }
        for action in &transition.actions {
            action(&mut self.context, event);
        }

        let from = std::mem::replace(&mut self.current, target);
        self.transitions += 1;

        if let Some(node) = definition.node(&self.current) {
            for action in &node.entry {
                action(&mut self.context);
            }
        }

        trace!(machine = %definition.id, from = ?from, to = ?self.current, event = %event_type, "transition");
        if let Some(hook) = &mut self.on_transition {
            hook(&TransitionEvent {
                from,
                to: self.current.clone(),
                event: event_type.into_owned(),
            });
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        Green,
        Yellow,
        Red,
        Off,
    }

    enum Ev {
        Next,
        Bump(u32),
        Shutdown,
    }

    impl MachineEvent for Ev {
        fn event_type(&self) -> Cow<'_, str> {
            match self {
                Ev::Next => "NEXT".into(),
                Ev::Bump(_) => "BUMP".into(),
                Ev::Shutdown => "SHUTDOWN".into(),
            }
        }
    }

    #[derive(Default)]
    struct Counter {
        entered: Vec<Light>,
        exited: Vec<Light>,
        bumps: u32,
    }

    fn lights() -> Arc<MachineDefinition<Light, Counter, Ev>> {
        let def = MachineDefinition::new("lights", Light::Green)
            .state(
                Light::Green,
                StateNode::new()
                    .on("NEXT", Transition::to(Light::Yellow))
                    .entry(|c: &mut Counter| c.entered.push(Light::Green))
                    .exit(|c: &mut Counter| c.exited.push(Light::Green)),
            )
            .state(
                Light::Yellow,
                StateNode::new()
                    .on(
                        "NEXT",
                        Transition::to(Light::Red).guard(|c: &Counter, _| c.bumps >= 2),
                    )
                    .entry(|c: &mut Counter| c.entered.push(Light::Yellow)),
            )
            .state(Light::Red, StateNode::new().on("NEXT", Transition::to(Light::Green)))
            .state(Light::Off, StateNode::final_state())
            .on_any(
                "BUMP",
                Transition::internal().action(|c: &mut Counter, e: &Ev| {
                    if let Ev::Bump(n) = e {
                        c.bumps += n;
                    }
                }),
            )
            .on_any("SHUTDOWN", Transition::to(Light::Off));
        Arc::new(def)
    }

    #[test]
    fn runs_initial_entry_actions() {
        let m = Machine::new(lights(), Counter::default());
        assert_eq!(*m.current(), Light::Green);
        assert_eq!(m.context().entered, vec![Light::Green]);
    }

    #[test]
    fn transition_runs_exit_then_entry() {
        let mut m = Machine::new(lights(), Counter::default());
        assert!(m.send(&Ev::Next));
        assert_eq!(*m.current(), Light::Yellow);
        assert_eq!(m.context().exited, vec![Light::Green]);
        assert_eq!(m.context().entered, vec![Light::Green, Light::Yellow]);
        assert_eq!(m.transitions(), 1);
    }

    #[test]
    fn guard_blocks_until_context_allows() {
        let mut m = Machine::new(lights(), Counter::default());
        m.send(&Ev::Next);

        assert!(!m.can(&Ev::Next));
        assert!(!m.send(&Ev::Next));
        assert_eq!(*m.current(), Light::Yellow);

        assert!(m.send(&Ev::Bump(2)));
        assert_eq!(*m.current(), Light::Yellow);
        assert!(m.send(&Ev::Next));
        assert_eq!(*m.current(), Light::Red);
    }

    #[test]
    fn unknown_events_are_ignored() {
        let mut m = Machine::new(lights(), Counter::default());
        m.send(&Ev::Next);
        m.send(&Ev::Bump(5));
        m.send(&Ev::Next);
        // Red has no BUMP of its own but the global one applies.
        assert!(m.send(&Ev::Bump(1)));
        assert_eq!(m.context().bumps, 6);
    }

    #[test]
    fn final_state_accepts_nothing() {
        let mut m = Machine::new(lights(), Counter::default());
        assert!(m.send(&Ev::Shutdown));
        assert!(m.is_final());
        assert!(!m.send(&Ev::Bump(1)));
        assert!(!m.send(&Ev::Next));
        assert_eq!(m.context().bumps, 0);
    }

    #[test]
    fn hook_sees_each_state_change() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut m = Machine::new(lights(), Counter::default());
        m.on_transition(move |t| sink.lock().unwrap().push((t.from, t.to, t.event.clone())));
        m.send(&Ev::Next);
        m.send(&Ev::Bump(3));
        m.send(&Ev::Shutdown);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (Light::Green, Light::Yellow, "NEXT".to_string()),
                (Light::Yellow, Light::Off, "SHUTDOWN".to_string()),
            ]
        );
    }

    #[test]
    fn validate_rejects_undeclared_targets() {
        let def: MachineDefinition<&str, (), Ev> = MachineDefinition::new("m", "a")
            .state("a", StateNode::new().on("NEXT", Transition::to("b")));
        let err = def.validate().unwrap_err();
        assert!(matches!(err, MachineError::UnknownTarget { ref target, .. } if target == "\"b\""));

        let def: MachineDefinition<&str, (), Ev> = MachineDefinition::new("m", "missing");
        assert!(matches!(def.validate(), Err(MachineError::UnknownInitial { .. })));
    }
}
