//! Executing a projection or adapted machine against a stream of events.
//!
//! The executor tracks the current state of one role. Commands are only enabled while the
//! position is [`Position::Idle`]; in a state where the role cannot yet tell which branch of
//! the composition it is on, it waits for one of the resolving event types first.

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::{
    composition::composition_types::{AdaptedMachine, BranchState, BranchStates, Projection},
    machine::LocalMachine,
    types::{Command, EventType, Role, State},
    MachineType,
};

/// An event as observed on the shared log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: EventType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            payload: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Position {
    Idle(State),
    AwaitingBranch {
        state: State,
        candidates: BTreeSet<State>,
        resolving: BTreeSet<EventType>,
    },
    /// No commands and no reactions left.
    Terminated(State),
}

impl Position {
    pub fn state(&self) -> &State {
        match self {
            Position::Idle(state)
            | Position::AwaitingBranch { state, .. }
            | Position::Terminated(state) => state,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Position::Terminated(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("unexpected event of type {event_type} in state {state}")]
    UnexpectedEvent { state: State, event_type: EventType },

    #[error("command {cmd} is not enabled in state {state}")]
    CommandNotEnabled { state: State, cmd: Command },
}

#[derive(Debug, Clone)]
pub struct Executor {
    role: Role,
    commands: BTreeMap<State, BTreeMap<Command, Vec<EventType>>>,
    reactions: BTreeMap<State, BTreeMap<EventType, State>>,
    branch_states: BranchStates,
    position: Position,
}

impl Executor {
    pub fn new(adapted: AdaptedMachine) -> Self {
        Self::from_machine(adapted.role, &adapted.machine, adapted.branch_states)
    }

    pub fn from_projection(projection: Projection) -> Self {
        Self::from_machine(
            projection.role,
            &projection.machine,
            projection.branch_states,
        )
    }

    fn from_machine(role: Role, machine: &MachineType, branch_states: BranchStates) -> Self {
        let states = machine.states();
        let commands = states
            .iter()
            .map(|s| (s.clone(), machine.commands(s)))
            .collect();
        let reactions = states
            .iter()
            .map(|s| (s.clone(), machine.reactions(s)))
            .collect();
        let mut executor = Self {
            role,
            commands,
            reactions,
            branch_states,
            position: Position::Terminated(machine.initial_state()),
        };
        executor.position = executor.position_of(machine.initial_state());
        executor
    }

    fn position_of(&self, state: State) -> Position {
        let no_commands = self.commands.get(&state).map_or(true, BTreeMap::is_empty);
        let no_reactions = self.reactions.get(&state).map_or(true, BTreeMap::is_empty);
        if no_commands && no_reactions {
            return Position::Terminated(state);
        }
        match self.branch_states.get(&state) {
            Some(BranchState::Unresolved {
                candidates,
                resolving_event_types,
            }) => Position::AwaitingBranch {
                candidates: candidates.clone(),
                resolving: resolving_event_types.clone(),
                state,
            },
            _ => Position::Idle(state),
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    /// Commands that may be invoked right now, empty unless the position is idle.
    pub fn enabled_commands(&self) -> BTreeSet<Command> {
        match &self.position {
            Position::Idle(state) => self
                .commands
                .get(state)
                .map(|cmds| cmds.keys().cloned().collect())
                .unwrap_or_default(),
            _ => BTreeSet::new(),
        }
    }

    /// The events to append to the log when invoking `cmd`. The state only changes once those
    /// events are observed through [`Executor::handle_event`].
    pub fn execute(
        &self,
        cmd: &Command,
        payload: serde_json::Value,
    ) -> Result<Vec<Event>, RuntimeError> {
        let not_enabled = || RuntimeError::CommandNotEnabled {
            state: self.position.state().clone(),
            cmd: cmd.clone(),
        };
        let Position::Idle(state) = &self.position else {
            return Err(not_enabled());
        };
        let log_type = self
            .commands
            .get(state)
            .and_then(|cmds| cmds.get(cmd))
            .ok_or_else(not_enabled)?;
        tracing::debug!(role = %self.role, %cmd, %state, "executing command");
        Ok(log_type
            .iter()
            .map(|event_type| Event {
                event_type: event_type.clone(),
                payload: payload.clone(),
            })
            .collect())
    }

    pub fn handle_event(&mut self, event: &Event) -> Result<&Position, RuntimeError> {
        let state = self.position.state().clone();
        let Some(target) = self
            .reactions
            .get(&state)
            .and_then(|r| r.get(&event.event_type))
            .cloned()
        else {
            tracing::warn!(role = %self.role, event_type = %event.event_type, %state, "ignoring unexpected event");
            return Err(RuntimeError::UnexpectedEvent {
                state,
                event_type: event.event_type.clone(),
            });
        };
        tracing::debug!(role = %self.role, event_type = %event.event_type, from = %state, to = %target, "reacting to event");
        self.position = self.position_of(target);
        Ok(&self.position)
    }

    /// Feed events into the executor until the stream ends or the machine terminates.
    /// Unexpected events are skipped.
    pub async fn run<S>(mut self, events: S) -> Position
    where
        S: Stream<Item = Event>,
    {
        futures::pin_mut!(events);
        while !self.position.is_terminated() {
            let Some(event) = events.next().await else {
                break;
            };
            // already logged
            let _ = self.handle_event(&event);
        }
        self.position
    }
}
