use crate::{
    types::{Command, EventType, MachineLabel, State, Transition},
    EdgeId, MachineGraph, MachineType, NodeId,
};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Side {
    Left,
    Right,
}

/// Discrepancies found when comparing a reference machine (left) with a tested one (right).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Error {
    NonDeterministic(Side, EdgeId),
    MissingTransition(Side, NodeId, EdgeId),
}

impl Error {
    fn to_string(&self, left: &MachineGraph, right: &MachineGraph) -> String {
        match self {
            Error::NonDeterministic(side, edge) => {
                let (graph, name) = match side {
                    Side::Left => (left, "projection"),
                    Side::Right => (right, "machine"),
                };
                let state = source_name(graph, *edge);
                match &graph[*edge] {
                    MachineLabel::Execute { cmd, .. } => {
                        format!("non-deterministic command {cmd} in state {state} of the {name}")
                    }
                    MachineLabel::Input { event_type } => format!(
                        "non-deterministic reaction to event type {event_type} in state {state} of the {name}"
                    ),
                }
            }
            // the tested machine lacks a transition found in the reference
            Error::MissingTransition(Side::Right, node, edge) => match &left[*edge] {
                MachineLabel::Execute { cmd, .. } => {
                    format!("missing command {cmd} in state {}", right[*node])
                }
                MachineLabel::Input { event_type } => format!(
                    "missing reaction to event type {event_type} in state {}",
                    right[*node]
                ),
            },
            // the tested machine has a transition the reference lacks
            Error::MissingTransition(Side::Left, _, edge) => {
                let state = source_name(right, *edge);
                match &right[*edge] {
                    MachineLabel::Execute { cmd, .. } => {
                        format!("extra command {cmd} in state {state}")
                    }
                    MachineLabel::Input { event_type } => {
                        format!("extra reaction to event type {event_type} in state {state}")
                    }
                }
            }
        }
    }

    pub fn convert<'a>(
        left: &'a MachineGraph,
        right: &'a MachineGraph,
    ) -> impl Fn(Error) -> String + 'a {
        |err| err.to_string(left, right)
    }
}

fn source_name(graph: &MachineGraph, edge: EdgeId) -> String {
    graph
        .edge_endpoints(edge)
        .map(|(source, _)| graph[source].to_string())
        .unwrap_or_else(|| "[invalid EdgeId]".to_string())
}

/// A hand-written local state machine for one role.
///
/// Commands are self-loops that emit a log of event types, reactions move the machine to
/// another state when an event of the given type is observed.
pub trait LocalMachine {
    fn initial_state(&self) -> State;

    fn states(&self) -> BTreeSet<State>;

    fn commands(&self, state: &State) -> BTreeMap<Command, Vec<EventType>>;

    fn reactions(&self, state: &State) -> BTreeMap<EventType, State>;

    /// Structural problems that make the machine unusable. Empty if none.
    fn validate(&self) -> Vec<String> {
        Vec::new()
    }
}

impl LocalMachine for MachineType {
    fn initial_state(&self) -> State {
        self.initial.clone()
    }

    fn states(&self) -> BTreeSet<State> {
        MachineType::states(self)
    }

    fn commands(&self, state: &State) -> BTreeMap<Command, Vec<EventType>> {
        self.transitions
            .iter()
            .filter(|t| t.source == *state)
            .filter_map(|t| match &t.label {
                MachineLabel::Execute { cmd, log_type } => Some((cmd.clone(), log_type.clone())),
                MachineLabel::Input { .. } => None,
            })
            .collect()
    }

    fn reactions(&self, state: &State) -> BTreeMap<EventType, State> {
        self.transitions
            .iter()
            .filter(|t| t.source == *state)
            .filter_map(|t| match &t.label {
                MachineLabel::Input { event_type } => Some((event_type.clone(), t.target.clone())),
                MachineLabel::Execute { .. } => None,
            })
            .collect()
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut commands: BTreeMap<(State, Command), usize> = BTreeMap::new();
        let mut reactions: BTreeMap<(State, EventType), usize> = BTreeMap::new();

        for t in &self.transitions {
            match &t.label {
                MachineLabel::Execute { cmd, log_type } => {
                    if log_type.is_empty() {
                        errors.push(format!(
                            "log type must not be empty ({})--[{}]-->({})",
                            t.source, t.label, t.target
                        ));
                    }
                    if t.source != t.target {
                        errors.push(format!(
                            "command {cmd} in state {} must not change the state",
                            t.source
                        ));
                    }
                    *commands.entry((t.source.clone(), cmd.clone())).or_default() += 1;
                }
                MachineLabel::Input { event_type } => {
                    *reactions
                        .entry((t.source.clone(), event_type.clone()))
                        .or_default() += 1;
                }
            }
        }

        errors.extend(
            commands
                .into_iter()
                .filter(|(_, n)| *n > 1)
                .map(|((state, cmd), _)| {
                    format!("command {cmd} is offered more than once in state {state}")
                }),
        );
        errors.extend(
            reactions
                .into_iter()
                .filter(|(_, n)| *n > 1)
                .map(|((state, event_type), _)| {
                    format!("state {state} reacts to event type {event_type} more than once")
                }),
        );

        errors
    }
}

/// Build the graph of a machine. The initial state is always present, even without transitions.
pub fn to_graph<M: LocalMachine + ?Sized>(machine: &M) -> (MachineGraph, NodeId) {
    let _span = tracing::info_span!("to_graph").entered();
    let mut graph = MachineGraph::new();
    let mut nodes: BTreeMap<State, NodeId> = BTreeMap::new();

    let initial_state = machine.initial_state();
    let initial = graph.add_node(initial_state.clone());
    nodes.insert(initial_state, initial);

    let states = machine.states();
    for state in &states {
        if !nodes.contains_key(state) {
            nodes.insert(state.clone(), graph.add_node(state.clone()));
        }
    }

    for state in &states {
        let source = nodes[state];
        for (cmd, log_type) in machine.commands(state) {
            graph.add_edge(source, source, MachineLabel::Execute { cmd, log_type });
        }
        for (event_type, target) in machine.reactions(state) {
            let target = *nodes
                .entry(target.clone())
                .or_insert_with(|| graph.add_node(target));
            graph.add_edge(source, target, MachineLabel::Input { event_type });
        }
    }

    (graph, initial)
}

pub fn to_json_machine(graph: &MachineGraph, initial: NodeId) -> MachineType {
    let _span = tracing::info_span!("to_json_machine").entered();
    let transitions: Vec<_> = graph
        .edge_references()
        .map(|e| Transition {
            label: e.weight().clone(),
            source: graph[e.source()].clone(),
            target: graph[e.target()].clone(),
        })
        .collect();

    MachineType {
        initial: graph[initial].clone(),
        transitions,
    }
}
