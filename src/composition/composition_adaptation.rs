use super::{
    composition_machine::{
        combine_projs, compose, paths_from_event_types, project_components, shared_event_types,
    },
    composition_types::{
        get_branching_joining_proto_info, AdaptedMachine, BranchMap, BranchState, BranchStates,
        EventLabel, ProjToMachineStates, ProtoInfo, ProtoLabel, SpecialEventTypes,
    },
};
use crate::{
    machine::{to_graph, to_json_machine, LocalMachine},
    types::{EventType, MachineLabel, Role, State, StateName},
    Error, MachineGraph, NodeId, Result, Subscriptions,
};
use petgraph::{visit::EdgeRef, Direction::Outgoing};
use std::collections::BTreeSet;

// A state of an adapted machine. machine_states points to the state(s) of the
// original machine the composed state contains, None for states of plain projections.
#[derive(Clone, PartialEq, PartialOrd, Ord, Eq, Hash, Debug)]
struct AdaptationNode {
    state: State,
    machine_states: Option<BTreeSet<State>>,
}

impl StateName for AdaptationNode {
    fn state_name(&self) -> &State {
        &self.state
    }
}

type AdaptationGraph = petgraph::Graph<AdaptationNode, MachineLabel>;

fn gen_node(n1: &AdaptationNode, n2: &AdaptationNode) -> AdaptationNode {
    let state = State::from(format!("{} || {}", n1.state_name(), n2.state_name()));
    let machine_states = match (&n1.machine_states, &n2.machine_states) {
        (None, None) => None,
        (Some(ms), None) | (None, Some(ms)) => Some(ms.clone()),
        (Some(ms1), Some(ms2)) => Some(ms1.intersection(ms2).cloned().collect()),
    };
    AdaptationNode {
        state,
        machine_states,
    }
}

fn check_machine<M: LocalMachine + ?Sized>(
    proto_info: &ProtoInfo,
    subs: &Subscriptions,
    role: &Role,
    machine: &M,
    graph: &MachineGraph,
) -> Vec<String> {
    let sub = BTreeSet::new();
    let sub = subs.get(role).unwrap_or(&sub);
    let labels = proto_info.get_labels();
    let event_types = proto_info.get_event_types();

    let mut errors = machine.validate();
    let mut used_event_types = BTreeSet::new();
    for label in graph.edge_weights() {
        match label {
            MachineLabel::Execute { cmd, log_type } => {
                if !labels.iter().any(|(c, _, r)| c == cmd && r == role) {
                    errors.push(format!("command {cmd} does not belong to role {role}"));
                }
                used_event_types.extend(log_type.iter().cloned());
            }
            MachineLabel::Input { event_type } => {
                if !sub.contains(event_type) {
                    errors.push(format!(
                        "role {role} does not subscribe to event type {event_type}"
                    ));
                }
                used_event_types.insert(event_type.clone());
            }
        }
    }
    errors.extend(
        used_event_types
            .difference(&event_types)
            .map(|et| format!("event type {et} does not occur in the composition")),
    );
    errors
}

/// Adapt a machine written against protocol `k` of `proto_info` to the whole composition.
///
/// Precondition: the protocols of `proto_info` are well-formed and interface correctly.
pub fn adapted_machine<M: LocalMachine + ?Sized>(
    proto_info: &ProtoInfo,
    subs: &Subscriptions,
    role: Role,
    machine: &M,
    k: usize,
    track_branches: bool,
) -> Result<AdaptedMachine> {
    let _span = tracing::info_span!("adapted_machine", %role, k).entered();
    if k >= proto_info.protocols.len() {
        return Err(Error::Adaptation(format!(
            "invalid protocol index {k}, the composition has {} protocols",
            proto_info.protocols.len()
        )));
    }

    let (machine_graph, machine_initial) = to_graph(machine);
    let errors = check_machine(proto_info, subs, &role, machine, &machine_graph);
    if !errors.is_empty() {
        return Err(Error::Adaptation(errors.join("; ")));
    }

    let mut projections: Vec<(AdaptationGraph, NodeId)> =
        project_components(proto_info, subs, &role, true)
            .into_iter()
            .map(|(proj, proj_initial)| {
                let proj = proj.map(
                    |_, n| AdaptationNode {
                        state: n.clone(),
                        machine_states: None,
                    },
                    |_, label| label.clone(),
                );
                (proj, proj_initial)
            })
            .collect();
    let Some(kth) = projections.get(k).cloned() else {
        return Err(Error::Adaptation(format!("protocol {k} has no initial state")));
    };

    let adaptation_graph = machine_graph.map(
        |_, n| AdaptationNode {
            state: n.clone(),
            machine_states: Some(BTreeSet::from([n.clone()])),
        },
        |_, label| label.clone(),
    );
    let uncovered = match combine_projs(projections.clone(), gen_node) {
        Some((context, context_initial)) => {
            uncovered_transitions(&machine_graph, machine_initial, &context, context_initial)
        }
        None => Vec::new(),
    };
    let interface = shared_event_types(&adaptation_graph, &kth.0);
    let (machine_and_proj, machine_and_proj_initial) = compose(
        adaptation_graph,
        machine_initial,
        kth.0,
        kth.1,
        interface,
        gen_node,
    );

    let unused = unused_transitions(&machine_graph, &machine_and_proj);
    if !unused.is_empty() || !uncovered.is_empty() {
        return Err(Error::Adaptation(format!(
            "no structure-preserving mapping into protocol {k}: {}",
            unused.into_iter().chain(uncovered).collect::<Vec<_>>().join("; ")
        )));
    }

    let machine_and_proj = machine_and_proj.map(
        |_, n| AdaptationNode {
            state: State::from(format!("({})", n.state_name())),
            ..n.clone()
        },
        |_, label| label.clone(),
    );
    projections[k] = (machine_and_proj, machine_and_proj_initial);

    let Some((adapted, adapted_initial)) = combine_projs(projections, gen_node) else {
        return Err(Error::Adaptation("empty composition".to_string()));
    };

    let proj_to_machine_states: ProjToMachineStates = adapted
        .node_weights()
        .map(|n| {
            (
                n.state.clone(),
                n.machine_states.iter().flatten().cloned().collect(),
            )
        })
        .collect();

    let branch_states = adapted_branch_states(&adapted, machine, track_branches);
    let plain = adapted.map(|_, n| n.state.clone(), |_, label| label.clone());
    let (branches, special_event_types) = if track_branches {
        (
            paths_from_event_types(&plain, proto_info),
            get_branching_joining_proto_info(proto_info),
        )
    } else {
        (BranchMap::new(), SpecialEventTypes::new())
    };

    Ok(AdaptedMachine {
        role,
        protocol_index: k,
        subscription: subs.clone(),
        machine: to_json_machine(&plain, adapted_initial),
        branches,
        special_event_types,
        proj_to_machine_states,
        branch_states,
    })
}

// Transitions of the machine that no state of the product takes.
fn unused_transitions(machine: &MachineGraph, product: &AdaptationGraph) -> Vec<String> {
    let used: BTreeSet<(State, MachineLabel)> = product
        .edge_references()
        .flat_map(|e| {
            product[e.source()]
                .machine_states
                .iter()
                .flatten()
                .map(|s| (s.clone(), e.weight().clone()))
                .collect::<Vec<_>>()
        })
        .collect();

    machine
        .edge_references()
        .filter(|e| !used.contains(&(machine[e.source()].clone(), e.weight().clone())))
        .map(|e| {
            format!(
                "transition ({})--[{}]-->({}) of the machine is never taken",
                machine[e.source()],
                e.weight(),
                machine[e.target()]
            )
        })
        .collect()
}

// Transitions of the combined projections the machine does not follow. In every reachable
// pair of machine state and projection state, the machine must offer each projection label
// whose event type it knows. Labels the other components block are not required.
fn uncovered_transitions(
    machine: &MachineGraph,
    machine_initial: NodeId,
    proj: &AdaptationGraph,
    proj_initial: NodeId,
) -> Vec<String> {
    let event_types = |labels: Vec<&MachineLabel>| -> BTreeSet<EventType> {
        labels.into_iter().map(|l| l.get_event_type()).collect()
    };
    let interface: BTreeSet<EventType> = event_types(machine.edge_weights().collect())
        .intersection(&event_types(proj.edge_weights().collect()))
        .cloned()
        .collect();
    let shared = |label: &MachineLabel| interface.contains(&label.get_event_type());
    let mut missing = BTreeSet::new();
    let mut visited = BTreeSet::from([(machine_initial, proj_initial)]);
    let mut worklist = vec![(machine_initial, proj_initial)];

    while let Some((m, p)) = worklist.pop() {
        let mut successors = Vec::new();
        for e in machine.edges_directed(m, Outgoing) {
            if !shared(e.weight()) {
                successors.push((e.target(), p));
            }
        }
        for e in proj.edges_directed(p, Outgoing) {
            if !shared(e.weight()) {
                successors.push((m, e.target()));
                continue;
            }
            let targets: Vec<NodeId> = machine
                .edges_directed(m, Outgoing)
                .filter(|me| me.weight() == e.weight())
                .map(|me| me.target())
                .collect();
            if targets.is_empty() {
                missing.insert(match e.weight() {
                    MachineLabel::Execute { cmd, .. } => {
                        format!("missing command {cmd} in state {}", machine[m])
                    }
                    MachineLabel::Input { event_type } => format!(
                        "missing reaction to event type {event_type} in state {}",
                        machine[m]
                    ),
                });
            }
            successors.extend(targets.into_iter().map(|t| (t, e.target())));
        }
        for pair in successors {
            if visited.insert(pair) {
                worklist.push(pair);
            }
        }
    }

    missing.into_iter().collect()
}

fn adapted_branch_states<M: LocalMachine + ?Sized>(
    adapted: &AdaptationGraph,
    machine: &M,
    track_branches: bool,
) -> BranchStates {
    adapted
        .node_indices()
        .map(|node| {
            let n = &adapted[node];
            let machine_states = n.machine_states.clone().unwrap_or_default();
            let original = machine_states.first().cloned();
            let branch_state = match (track_branches, original) {
                (false, original) => BranchState::Resolved {
                    state: original.unwrap_or_else(|| n.state.clone()),
                },
                (true, Some(original)) if machine_states.len() == 1 => {
                    let offered: BTreeSet<_> = adapted
                        .edges_directed(node, Outgoing)
                        .filter_map(|e| match e.weight() {
                            MachineLabel::Execute { cmd, .. } => Some(cmd.clone()),
                            MachineLabel::Input { .. } => None,
                        })
                        .collect();
                    if offered.len() < machine.commands(&original).len() {
                        unresolved(adapted, node, machine_states)
                    } else {
                        BranchState::Resolved { state: original }
                    }
                }
                (true, _) => unresolved(adapted, node, machine_states),
            };
            (n.state.clone(), branch_state)
        })
        .collect()
}

fn unresolved(adapted: &AdaptationGraph, node: NodeId, candidates: BTreeSet<State>) -> BranchState {
    let resolving_event_types: BTreeSet<EventType> = adapted
        .edges_directed(node, Outgoing)
        .filter_map(|e| match e.weight() {
            MachineLabel::Input { event_type } => Some(event_type.clone()),
            MachineLabel::Execute { .. } => None,
        })
        .collect();
    tracing::debug!(state = %adapted[node].state, ?resolving_event_types, "branch point");
    BranchState::Unresolved {
        candidates,
        resolving_event_types,
    }
}
