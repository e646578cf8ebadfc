use super::{
    composition_swarm::transitive_closure_succeeding,
    composition_types::{
        get_branching_joining_proto_info, unord_event_pair, BranchMap, BranchState, BranchStates,
        EventLabel, ProtoInfo, UnordEventPair,
    },
};
use crate::{
    machine::{Error, Side},
    types::{Command, EventType, MachineLabel, Role, State, StateName, SwarmLabel},
    Graph, MachineGraph, NodeId, Subscriptions,
};
use itertools::Itertools;
use petgraph::{
    graph::EdgeReference,
    visit::{EdgeFiltered, EdgeRef, IntoEdgeReferences, IntoEdgesDirected, IntoNodeReferences},
    Direction::{Incoming, Outgoing},
};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
};

type ERef<'a> = <&'a Graph as IntoEdgeReferences>::EdgeRef;

/// Project a swarm protocol onto `role`, skipping transitions whose event types the role
/// does not subscribe to.
///
/// The result is deterministic. Every state of the returned machine is classified in the
/// returned [`BranchStates`]: a state covering protocol states with differing outgoing labels
/// is a branch point the role can only resolve by observing one of the differing event types.
pub fn project(
    swarm: &Graph,
    initial: NodeId,
    subs: &Subscriptions,
    role: Role,
    minimize: bool,
) -> (MachineGraph, NodeId, BranchStates) {
    let _span = tracing::info_span!("project", %role).entered();
    let (nfa, nfa_initial) = project_nfa(swarm, initial, subs, &role);
    let (dfa, dfa_initial, subsets) = nfa_to_dfa(&nfa, nfa_initial);

    let (machine, machine_initial, covers) = if minimize {
        minimal_machine(&nfa, &dfa, dfa_initial, &subsets)
    } else {
        (dfa, dfa_initial, subsets)
    };

    let branch_states = branch_states(&nfa, &machine, &covers);
    (machine, machine_initial, branch_states)
}

// One node per protocol state entered by a subscribed transition, plus the initial state.
// Unsubscribed transitions are searched through.
fn project_nfa(
    swarm: &Graph,
    initial: NodeId,
    subs: &Subscriptions,
    role: &Role,
) -> (MachineGraph, NodeId) {
    let _span = tracing::info_span!("project_nfa").entered();
    let mut machine = MachineGraph::new();
    let sub = BTreeSet::new();
    let sub = subs.get(role).unwrap_or(&sub);
    // maps nodes in protocol to nodes in projection
    let mut m_nodes: Vec<NodeId> = vec![NodeId::end(); swarm.node_count()];

    let interested = |edge: ERef| sub.contains(&edge.weight().get_event_type());
    let filtered = EdgeFiltered(swarm, interested);

    let nodes_in_proj: Vec<NodeId> = swarm
        .node_references()
        .filter(|(ni, _)| *ni == initial || filtered.edges_directed(*ni, Incoming).count() > 0)
        .map(|(ni, _)| ni)
        .collect();

    for node in nodes_in_proj.iter() {
        m_nodes[node.index()] = machine.add_node(swarm[*node].state_name().clone());
    }

    let find_interesting_edges = |node: NodeId| -> Vec<EdgeReference<'_, SwarmLabel>> {
        let mut stack: Vec<NodeId> = vec![node];
        let mut visited: BTreeSet<NodeId> = BTreeSet::from([node]);
        let mut interesting_edges: Vec<EdgeReference<'_, SwarmLabel>> = vec![];

        while let Some(n) = stack.pop() {
            for edge in swarm.edges_directed(n, Outgoing) {
                if sub.contains(&edge.weight().get_event_type()) {
                    interesting_edges.push(edge);
                } else if visited.insert(edge.target()) {
                    stack.push(edge.target());
                }
            }
        }

        interesting_edges
    };

    for node in nodes_in_proj {
        for edge in find_interesting_edges(node) {
            if edge.weight().role == *role {
                let execute_label = MachineLabel::Execute {
                    cmd: edge.weight().cmd.clone(),
                    log_type: vec![edge.weight().get_event_type()],
                };
                machine.add_edge(m_nodes[node.index()], m_nodes[node.index()], execute_label);
            }
            let input_label = MachineLabel::Input {
                event_type: edge.weight().get_event_type(),
            };
            machine.add_edge(
                m_nodes[node.index()],
                m_nodes[edge.target().index()],
                input_label,
            );
        }
    }

    (machine, m_nodes[initial.index()])
}

// A singleton keeps the name of its element, larger sets are named "{ a, b }".
fn set_name(graph: &MachineGraph, nodes: &BTreeSet<NodeId>) -> State {
    match nodes.iter().exactly_one() {
        Ok(n) => graph[*n].clone(),
        Err(_) => State::from(format!(
            "{{ {} }}",
            nodes.iter().map(|n| graph[*n].clone()).join(", ")
        )),
    }
}

fn unique_name(taken: &mut BTreeSet<State>, state: State) -> State {
    let mut name = state.to_string();
    while taken.contains(name.as_str()) {
        name.push('\'');
    }
    let state = State::from(name);
    taken.insert(state.clone());
    state
}

// Subset construction, Hopcroft, Motwani and Ullman section 2.3.5.
// Also returns the nfa nodes covered by each dfa node, indexed by dfa node.
fn nfa_to_dfa(nfa: &MachineGraph, i: NodeId) -> (MachineGraph, NodeId, Vec<BTreeSet<NodeId>>) {
    let _span = tracing::info_span!("nfa_to_dfa").entered();
    let mut dfa = MachineGraph::new();
    let mut dfa_nodes: BTreeMap<BTreeSet<NodeId>, NodeId> = BTreeMap::new();
    let mut subsets: Vec<BTreeSet<NodeId>> = Vec::new();
    let mut taken = BTreeSet::new();
    let mut stack: Vec<BTreeSet<NodeId>> = Vec::new();

    // outgoing edges of the sources as a map from labels to target sets
    let outgoing_map = |srcs: &BTreeSet<NodeId>| -> BTreeMap<MachineLabel, BTreeSet<NodeId>> {
        srcs.iter()
            .flat_map(|src| {
                nfa.edges_directed(*src, Outgoing)
                    .map(|e| (e.weight().clone(), e.target()))
            })
            .fold(BTreeMap::new(), |mut m, (label, target)| {
                m.entry(label).or_insert_with(BTreeSet::new).insert(target);
                m
            })
    };

    let start = BTreeSet::from([i]);
    let dfa_initial = dfa.add_node(unique_name(&mut taken, set_name(nfa, &start)));
    dfa_nodes.insert(start.clone(), dfa_initial);
    subsets.push(start.clone());
    stack.push(start);

    while let Some(states) = stack.pop() {
        let src = dfa_nodes[&states];
        for (label, targets) in outgoing_map(&states) {
            let target = match dfa_nodes.get(&targets) {
                Some(target) => *target,
                None => {
                    let target = dfa.add_node(unique_name(&mut taken, set_name(nfa, &targets)));
                    dfa_nodes.insert(targets.clone(), target);
                    subsets.push(targets.clone());
                    stack.push(targets);
                    target
                }
            };
            dfa.add_edge(src, target, label);
        }
    }

    (dfa, dfa_initial, subsets)
}

// Merge equivalent states of a dfa. Blocks are named after the nfa nodes they cover.
// Also returns these covers, indexed by node of the minimal machine.
fn minimal_machine(
    nfa: &MachineGraph,
    graph: &MachineGraph,
    i: NodeId,
    subsets: &[BTreeSet<NodeId>],
) -> (MachineGraph, NodeId, Vec<BTreeSet<NodeId>>) {
    let _span = tracing::info_span!("minimal_machine").entered();
    let partition = partition_refinement(graph);
    let mut minimal = MachineGraph::new();
    let mut node_to_block: BTreeMap<NodeId, NodeId> = BTreeMap::new();
    let mut covers = Vec::new();
    let mut edges = BTreeSet::new();
    let mut taken = BTreeSet::new();

    for block in partition {
        let cover: BTreeSet<NodeId> = block
            .iter()
            .flat_map(|n| subsets[n.index()].iter().copied())
            .collect();
        let block_node = minimal.add_node(unique_name(&mut taken, set_name(nfa, &cover)));
        for n in block {
            node_to_block.insert(n, block_node);
        }
        covers.push(cover);
    }

    for edge in graph.edge_references() {
        let source = node_to_block[&edge.source()];
        let target = node_to_block[&edge.target()];
        if edges.insert((source, edge.weight().clone(), target)) {
            minimal.add_edge(source, target, edge.weight().clone());
        }
    }

    (minimal, node_to_block[&i], covers)
}

fn partition_refinement(graph: &MachineGraph) -> BTreeSet<BTreeSet<NodeId>> {
    let _span = tracing::info_span!("partition_refinement").entered();
    let mut partition_old = BTreeSet::new();
    let (terminal, non_terminal): (BTreeSet<_>, BTreeSet<_>) = graph
        .node_indices()
        .partition(|n| graph.edges_directed(*n, Outgoing).count() == 0);
    let mut partition: BTreeSet<BTreeSet<NodeId>> = [terminal, non_terminal]
        .into_iter()
        .filter(|block| !block.is_empty())
        .collect();

    let pre_labels = |block: &BTreeSet<NodeId>| -> BTreeSet<MachineLabel> {
        block
            .iter()
            .flat_map(|n| {
                graph
                    .edges_directed(*n, Incoming)
                    .map(|e| e.weight().clone())
            })
            .collect()
    };

    while partition.len() != partition_old.len() {
        partition_old = partition.clone();
        for superblock in &partition_old {
            for label in pre_labels(superblock) {
                partition = refine_partition(graph, partition, superblock, &label);
            }
        }
    }

    partition
}

fn refine_partition(
    graph: &MachineGraph,
    partition: BTreeSet<BTreeSet<NodeId>>,
    superblock: &BTreeSet<NodeId>,
    label: &MachineLabel,
) -> BTreeSet<BTreeSet<NodeId>> {
    partition
        .iter()
        .flat_map(|block| refine_block(graph, block, superblock, label))
        .collect()
}

fn refine_block(
    graph: &MachineGraph,
    block: &BTreeSet<NodeId>,
    superblock: &BTreeSet<NodeId>,
    label: &MachineLabel,
) -> BTreeSet<BTreeSet<NodeId>> {
    let predicate = |node: &NodeId| -> bool {
        graph
            .edges_directed(*node, Outgoing)
            .any(|e| *e.weight() == *label && superblock.contains(&e.target()))
    };

    let (with, without): (BTreeSet<_>, BTreeSet<_>) = block.iter().partition(|n| predicate(n));

    BTreeSet::from([with, without])
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect()
}

fn observed_event_types(labels: &BTreeSet<MachineLabel>) -> BTreeSet<EventType> {
    labels
        .iter()
        .filter_map(|label| match label {
            MachineLabel::Input { event_type } => Some(event_type.clone()),
            MachineLabel::Execute { .. } => None,
        })
        .collect()
}

fn branch_states(
    nfa: &MachineGraph,
    machine: &MachineGraph,
    covers: &[BTreeSet<NodeId>],
) -> BranchStates {
    let _span = tracing::info_span!("branch_states").entered();
    machine
        .node_indices()
        .map(|node| {
            let covered = &covers[node.index()];
            let outgoing: BTreeSet<BTreeSet<MachineLabel>> = covered
                .iter()
                .map(|n| {
                    nfa.edges_directed(*n, Outgoing)
                        .map(|e| e.weight().clone())
                        .collect()
                })
                .collect();

            let branch_state = if outgoing.len() > 1 {
                let observed: Vec<BTreeSet<EventType>> =
                    outgoing.iter().map(observed_event_types).collect();
                let all: BTreeSet<EventType> = observed.iter().flatten().cloned().collect();
                let common = observed
                    .iter()
                    .cloned()
                    .reduce(|acc, s| acc.intersection(&s).cloned().collect())
                    .unwrap_or_default();
                let differing: BTreeSet<EventType> = all.difference(&common).cloned().collect();
                tracing::debug!(state = %machine[node], ?differing, "branch point");
                BranchState::Unresolved {
                    candidates: covered.iter().map(|n| nfa[*n].clone()).collect(),
                    resolving_event_types: if differing.is_empty() { all } else { differing },
                }
            } else {
                BranchState::Resolved {
                    state: machine[node].clone(),
                }
            };

            (machine[node].clone(), branch_state)
        })
        .collect()
}

// Project each component protocol of proto_info on its own.
pub(in crate::composition) fn project_components(
    proto_info: &ProtoInfo,
    subs: &Subscriptions,
    role: &Role,
    minimize: bool,
) -> Vec<(MachineGraph, NodeId)> {
    let _span = tracing::info_span!("project_components", %role).entered();
    proto_info
        .protocols
        .iter()
        .filter_map(|p| p.initial.map(|i| (&p.graph, i)))
        .map(|(graph, initial)| {
            let (proj, proj_initial, _) = project(graph, initial, subs, role.clone(), minimize);
            (proj, proj_initial)
        })
        .collect()
}

fn event_types_of<N, E: EventLabel>(g: &petgraph::Graph<N, E>) -> BTreeSet<EventType> {
    g.edge_references()
        .map(|e| e.weight().get_event_type())
        .collect()
}

/// Event types labelling transitions of both graphs.
pub fn shared_event_types<N, E: EventLabel>(
    a: &petgraph::Graph<N, E>,
    b: &petgraph::Graph<N, E>,
) -> BTreeSet<EventType> {
    event_types_of(a)
        .intersection(&event_types_of(b))
        .cloned()
        .collect()
}

// Fold machines left to right. Each step synchronizes on the event types the next machine
// shares with any machine folded before it. The product so far is not enough: an event type
// blocked there has no transition left but must stay blocked.
pub(in crate::composition) fn combine_projs<N, E: EventLabel>(
    projections: Vec<(petgraph::Graph<N, E>, NodeId)>,
    gen_node: fn(&N, &N) -> N,
) -> Option<(petgraph::Graph<N, E>, NodeId)> {
    let _span = tracing::info_span!("combine_projs").entered();
    let mut projections = projections.into_iter();
    let first = projections.next()?;
    let mut folded = event_types_of(&first.0);

    Some(projections.fold(first, |(acc, acc_i), (m, i)| {
        let own = event_types_of(&m);
        let interface = folded.intersection(&own).cloned().collect();
        folded.extend(own);
        compose(acc, acc_i, m, i, interface, gen_node)
    }))
}

fn visit_successors_stop_on_branch(
    proj: &MachineGraph,
    machine_state: NodeId,
    et: &EventType,
    special_events: &BTreeSet<EventType>,
    concurrent_events: &BTreeSet<UnordEventPair>,
) -> BTreeSet<EventType> {
    let mut visited = BTreeSet::new();
    let mut to_visit = Vec::from([machine_state]);
    let mut event_types = BTreeSet::new();
    while let Some(node) = to_visit.pop() {
        visited.insert(node);
        for e in proj.edges_directed(node, Outgoing) {
            if !concurrent_events
                .contains(&unord_event_pair(e.weight().get_event_type(), et.clone()))
            {
                event_types.insert(e.weight().get_event_type());
            }
            if !special_events.contains(&e.weight().get_event_type())
                && !visited.contains(&e.target())
            {
                to_visit.push(e.target());
            }
        }
    }
    event_types
}

/// For each event type observed in `proj`, the event types that may follow it before the
/// next branching or joining event type.
pub fn paths_from_event_types(proj: &MachineGraph, proto_info: &ProtoInfo) -> BranchMap {
    let _span = tracing::info_span!("paths_from_event_types").entered();
    let mut m: BTreeMap<EventType, BTreeSet<EventType>> = BTreeMap::new();
    let special_events = get_branching_joining_proto_info(proto_info);

    // event types ordered by the protocol are not treated as concurrent here
    let after_pairs: BTreeSet<UnordEventPair> =
        transitive_closure_succeeding(proto_info.succeeding_events.clone())
            .into_iter()
            .flat_map(|(e, es)| {
                es.into_iter()
                    .map(move |e2| unord_event_pair(e.clone(), e2))
            })
            .collect();
    let concurrent_events: BTreeSet<UnordEventPair> = proto_info
        .concurrent_events
        .difference(&after_pairs)
        .cloned()
        .collect();

    for edge in proj.edge_references() {
        if let MachineLabel::Input { event_type } = edge.weight() {
            let mut paths_this_edge = visit_successors_stop_on_branch(
                proj,
                edge.target(),
                event_type,
                &special_events,
                &concurrent_events,
            );
            m.entry(event_type.clone())
                .or_default()
                .append(&mut paths_this_edge);
        }
    }

    m.into_iter()
        .map(|(t, after_t)| (t, after_t.into_iter().collect()))
        .collect()
}

/// Product of two machines or protocols, synchronized on the event types in `interface`.
///
/// A transition whose event type is in the interface is taken jointly and only when both
/// sides offer it with the same label. All other transitions interleave.
pub(in crate::composition) fn compose<N, E: EventLabel>(
    m1: petgraph::Graph<N, E>,
    i1: NodeId,
    m2: petgraph::Graph<N, E>,
    i2: NodeId,
    interface: BTreeSet<EventType>,
    gen_node: fn(&N, &N) -> N,
) -> (petgraph::Graph<N, E>, NodeId) {
    let _span = tracing::info_span!("compose").entered();
    let mut machine = petgraph::Graph::<N, E>::new();
    let mut node_map: BTreeMap<(NodeId, NodeId), NodeId> = BTreeMap::new();

    let outgoing_map = |m: &petgraph::Graph<N, E>, src: NodeId| -> BTreeMap<E, NodeId> {
        m.edges_directed(src, Outgoing)
            .map(|e| (e.weight().clone(), e.target()))
            .collect()
    };

    // split outgoing labels into interfacing and non-interfacing ones
    let partitioned = |m: &petgraph::Graph<N, E>, node: NodeId| -> (BTreeSet<E>, Vec<E>) {
        let (interfacing, non_interfacing): (Vec<E>, Vec<E>) = m
            .edges_directed(node, Outgoing)
            .map(|e| e.weight().clone())
            .partition(|e| interface.contains(&e.get_event_type()));
        (interfacing.into_iter().collect(), non_interfacing)
    };

    let outgoing_to_visit = |s1: NodeId, s2: NodeId| -> Vec<E> {
        let (interfacing1, non_interfacing1) = partitioned(&m1, s1);
        let (interfacing2, non_interfacing2) = partitioned(&m2, s2);
        non_interfacing1
            .into_iter()
            .chain(non_interfacing2)
            .chain(interfacing1.intersection(&interfacing2).cloned())
            .collect()
    };

    let combined_initial = machine.add_node(gen_node(&m1[i1], &m2[i2]));
    node_map.insert((i1, i2), combined_initial);
    let mut worklist = vec![(combined_initial, (i1, i2))];

    while let Some((src, (old_src1, old_src2))) = worklist.pop() {
        let map1 = outgoing_map(&m1, old_src1);
        let map2 = outgoing_map(&m2, old_src2);

        for e in outgoing_to_visit(old_src1, old_src2) {
            let (dst1, dst2) = match (map1.get(&e), map2.get(&e)) {
                (Some(e1), Some(e2)) => (*e1, *e2),
                (Some(e1), None) => (*e1, old_src2),
                (None, Some(e2)) => (old_src1, *e2),
                (None, None) => continue,
            };
            match node_map.get(&(dst1, dst2)) {
                Some(dst) => {
                    machine.add_edge(src, *dst, e);
                }
                None => {
                    let new_dst = machine.add_node(gen_node(&m1[dst1], &m2[dst2]));
                    machine.add_edge(src, new_dst, e);
                    node_map.insert((dst1, dst2), new_dst);
                    worklist.push((new_dst, (dst1, dst2)));
                }
            }
        }
    }

    (machine, combined_initial)
}

pub fn gen_state_name<N: StateName + From<String>>(n1: &N, n2: &N) -> N {
    N::from(format!("{} || {}", n1.state_name(), n2.state_name()))
}

#[derive(Debug, Clone, PartialEq, PartialOrd, Eq, Ord)]
enum DeterministicLabel {
    Command(Command),
    Event(EventType),
}

impl From<&MachineLabel> for DeterministicLabel {
    fn from(label: &MachineLabel) -> Self {
        match label {
            MachineLabel::Execute { cmd, .. } => DeterministicLabel::Command(cmd.clone()),
            MachineLabel::Input { event_type } => DeterministicLabel::Event(event_type.clone()),
        }
    }
}

/// error messages are designed assuming that `left` is the reference and `right` the tested
pub fn equivalent(left: &MachineGraph, li: NodeId, right: &MachineGraph, ri: NodeId) -> Vec<Error> {
    use Side::*;

    let _span = tracing::info_span!("equivalent").entered();

    let mut errors = Vec::new();

    // must hold index pairs because node mappings might be m:n
    let mut stack = vec![(li, ri)];
    let mut visited = BTreeSet::new();

    while let Some((li, ri)) = stack.pop() {
        tracing::debug!(left = %left[li], ?li, right = %right[ri], ?ri, to_go = stack.len(), "loop");
        visited.insert((li, ri));
        let mut l_out = BTreeMap::new();
        for edge in left.edges_directed(li, Outgoing) {
            l_out
                .entry(DeterministicLabel::from(edge.weight()))
                .and_modify(|_| errors.push(Error::NonDeterministic(Left, edge.id())))
                .or_insert(edge);
        }
        let mut r_out = BTreeMap::new();
        for edge in right.edges_directed(ri, Outgoing) {
            r_out
                .entry(DeterministicLabel::from(edge.weight()))
                .and_modify(|_| errors.push(Error::NonDeterministic(Right, edge.id())))
                .or_insert(edge);
        }
        // keep note of stack so we can undo additions if !same
        let stack_len = stack.len();

        // iteration must be in order of weights (hence the BTreeMap above)
        let mut same = true;
        let mut l_edges = l_out.into_values().peekable();
        let mut r_edges = r_out.into_values().peekable();
        loop {
            match (l_edges.peek(), r_edges.peek()) {
                (None, None) => break,
                (None, Some(r_edge)) => {
                    tracing::debug!("left missing {}", r_edge.weight());
                    errors.push(Error::MissingTransition(Left, li, r_edge.id()));
                    same = false;
                    r_edges.next();
                }
                (Some(l_edge), None) => {
                    tracing::debug!("right missing {}", l_edge.weight());
                    errors.push(Error::MissingTransition(Right, ri, l_edge.id()));
                    same = false;
                    l_edges.next();
                }
                (Some(l_edge), Some(r_edge)) => match l_edge.weight().cmp(r_edge.weight()) {
                    Ordering::Less => {
                        tracing::debug!("right missing {}", l_edge.weight());
                        errors.push(Error::MissingTransition(Right, ri, l_edge.id()));
                        same = false;
                        l_edges.next();
                    }
                    Ordering::Equal => {
                        tracing::debug!("found match for {}", l_edge.weight());
                        let lt = l_edge.target();
                        let rt = r_edge.target();
                        if !visited.contains(&(lt, rt)) {
                            tracing::debug!(?lt, ?rt, "pushing targets");
                            stack.push((lt, rt));
                        }

                        l_edges.next();
                        r_edges.next();
                    }
                    Ordering::Greater => {
                        tracing::debug!("left missing {}", r_edge.weight());
                        errors.push(Error::MissingTransition(Left, li, r_edge.id()));
                        same = false;
                        r_edges.next();
                    }
                },
            }
        }
        if !same {
            // don't bother visiting subsequent nodes if this one had discrepancies
            tracing::debug!("dumping {} stack elements", stack.len() - stack_len);
            stack.truncate(stack_len);
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        composition::{
            composition_swarm::{explicit_composition, swarms_to_proto_info},
            composition_types::InterfacingProtocols,
        },
        machine::{to_graph, to_json_machine},
        MachineType, MapVec, SwarmProtocolType,
    };
    use tracing_subscriber::{fmt, fmt::format::FmtSpan, EnvFilter};

    fn setup_logger() {
        fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
            .try_init()
            .ok();
    }

    fn proto(json: &str) -> SwarmProtocolType {
        serde_json::from_str::<SwarmProtocolType>(json).unwrap()
    }

    fn machine(json: &str) -> MachineType {
        serde_json::from_str::<MachineType>(json).unwrap()
    }

    fn subs(json: &str) -> Subscriptions {
        serde_json::from_str::<Subscriptions>(json).unwrap()
    }

    fn get_proto1() -> SwarmProtocolType {
        proto(
            r#"{
                "initial": "0",
                "transitions": [
                    { "source": "0", "target": "1", "label": { "cmd": "request", "logType": ["partID"], "role": "T" } },
                    { "source": "1", "target": "2", "label": { "cmd": "get", "logType": ["pos"], "role": "FL" } },
                    { "source": "2", "target": "0", "label": { "cmd": "deliver", "logType": ["part"], "role": "T" } },
                    { "source": "0", "target": "3", "label": { "cmd": "close", "logType": ["time"], "role": "D" } }
                ]
            }"#,
        )
    }
    fn get_proto2() -> SwarmProtocolType {
        proto(
            r#"{
                "initial": "0",
                "transitions": [
                    { "source": "0", "target": "1", "label": { "cmd": "request", "logType": ["partID"], "role": "T" } },
                    { "source": "1", "target": "2", "label": { "cmd": "deliver", "logType": ["part"], "role": "T" } },
                    { "source": "2", "target": "3", "label": { "cmd": "build", "logType": ["car"], "role": "F" } }
                ]
            }"#,
        )
    }
    fn get_subs_composition_1() -> Subscriptions {
        subs(
            r#"{
                "T": ["partID", "part", "pos", "time"],
                "FL": ["partID", "pos", "time"],
                "D": ["partID", "part", "time"],
                "F": ["partID", "part", "car", "time"]
            }"#,
        )
    }
    fn get_whf_door() -> MachineType {
        machine(
            r#"{
                "initial": "0",
                "transitions": [
                    { "label": { "tag": "Execute", "cmd": "close", "logType": ["time"] }, "source": "0", "target": "0" },
                    { "label": { "tag": "Input", "eventType": "time" }, "source": "0", "target": "4" },
                    { "label": { "tag": "Input", "eventType": "partID" }, "source": "0", "target": "1" },
                    { "label": { "tag": "Input", "eventType": "part" }, "source": "1", "target": "2" },
                    { "label": { "tag": "Execute", "cmd": "close", "logType": ["time"] }, "source": "2", "target": "2" },
                    { "label": { "tag": "Input", "eventType": "time" }, "source": "2", "target": "3" }
                ]
            }"#,
        )
    }
    fn get_whf_forklift() -> MachineType {
        machine(
            r#"{
                "initial": "0",
                "transitions": [
                    { "label": { "tag": "Input", "eventType": "time" }, "source": "0", "target": "5" },
                    { "label": { "tag": "Input", "eventType": "partID" }, "source": "0", "target": "1" },
                    { "label": { "tag": "Execute", "cmd": "get", "logType": ["pos"] }, "source": "1", "target": "1" },
                    { "label": { "tag": "Input", "eventType": "pos" }, "source": "1", "target": "2" },
                    { "label": { "tag": "Input", "eventType": "part" }, "source": "2", "target": "3" },
                    { "label": { "tag": "Input", "eventType": "time" }, "source": "3", "target": "4" }
                ]
            }"#,
        )
    }
    fn get_whf_f() -> MachineType {
        machine(
            r#"{
                "initial": "0",
                "transitions": [
                    { "label": { "tag": "Input", "eventType": "time" }, "source": "0", "target": "6" },
                    { "label": { "tag": "Input", "eventType": "partID" }, "source": "0", "target": "1" },
                    { "label": { "tag": "Input", "eventType": "part" }, "source": "1", "target": "2" },
                    { "label": { "tag": "Execute", "cmd": "build", "logType": ["car"] }, "source": "2", "target": "2" },
                    { "label": { "tag": "Input", "eventType": "time" }, "source": "2", "target": "3" },
                    { "label": { "tag": "Input", "eventType": "car" }, "source": "2", "target": "4" },
                    { "label": { "tag": "Execute", "cmd": "build", "logType": ["car"] }, "source": "3", "target": "3" },
                    { "label": { "tag": "Input", "eventType": "time" }, "source": "4", "target": "5" },
                    { "label": { "tag": "Input", "eventType": "car" }, "source": "3", "target": "5" }
                ]
            }"#,
        )
    }

    // e reaches three composed states; only two of them can go on with f
    fn get_branching_protos() -> InterfacingProtocols {
        InterfacingProtocols(vec![
            proto(
                r#"{
                    "initial": "0",
                    "transitions": [
                        { "source": "0", "target": "1", "label": { "cmd": "e", "logType": ["e"], "role": "A" } },
                        { "source": "1", "target": "2", "label": { "cmd": "f", "logType": ["f"], "role": "A" } }
                    ]
                }"#,
            ),
            proto(
                r#"{
                    "initial": "0",
                    "transitions": [
                        { "source": "0", "target": "1", "label": { "cmd": "g", "logType": ["g"], "role": "B" } },
                        { "source": "1", "target": "2", "label": { "cmd": "f", "logType": ["f"], "role": "A" } },
                        { "source": "0", "target": "3", "label": { "cmd": "k", "logType": ["k"], "role": "B" } }
                    ]
                }"#,
            ),
        ])
    }

    fn composed(protos: InterfacingProtocols) -> (Graph, NodeId) {
        explicit_composition(&swarms_to_proto_info(protos)).unwrap()
    }

    fn assert_deterministic(graph: &MachineGraph) {
        for node in graph.node_indices() {
            let labels: Vec<_> = graph
                .edges_directed(node, Outgoing)
                .map(|e| DeterministicLabel::from(e.weight()))
                .collect();
            let unique: BTreeSet<_> = labels.iter().cloned().collect();
            assert_eq!(labels.len(), unique.len(), "state {}", graph[node]);
        }
    }

    fn assert_equivalent(expected: &MachineType, proj: &MachineGraph, proj_initial: NodeId) {
        let (expected, expected_initial) = to_graph(expected);
        let errors = equivalent(&expected, expected_initial, proj, proj_initial);
        assert!(
            errors.is_empty(),
            "{:?}",
            errors.map(Error::convert(&expected, proj))
        );
    }

    mod projection_tests {
        use super::*;

        #[test]
        fn test_projection_1() {
            setup_logger();
            // From Combining Swarm Protocols, example 5.
            let proto = proto(
                r#"{
                    "initial": "0",
                    "transitions": [
                        { "source": "0", "target": "1", "label": { "cmd": "request", "logType": ["tireID"], "role": "C" } },
                        { "source": "1", "target": "2", "label": { "cmd": "retrieve", "logType": ["position"], "role": "W" } },
                        { "source": "2", "target": "3", "label": { "cmd": "receive", "logType": ["tire"], "role": "C" } },
                        { "source": "3", "target": "4", "label": { "cmd": "build", "logType": ["car"], "role": "F" } }
                    ]
                }"#,
            );
            let subs = subs(
                r#"{
                    "C": ["tireID", "position", "tire", "car"],
                    "W": ["tireID", "position", "tire"],
                    "F": ["tireID", "tire", "car"]
                }"#,
            );
            let (g, i) = composed(InterfacingProtocols(vec![proto]));
            let (proj, proj_initial, branch_states) = project(&g, i, &subs, Role::new("F"), false);
            let expected = machine(
                r#"{
                    "initial": "0",
                    "transitions": [
                        { "label": { "tag": "Input", "eventType": "tireID" }, "source": "0", "target": "2" },
                        { "label": { "tag": "Input", "eventType": "tire" }, "source": "2", "target": "3" },
                        { "label": { "tag": "Execute", "cmd": "build", "logType": ["car"] }, "source": "3", "target": "3" },
                        { "label": { "tag": "Input", "eventType": "car" }, "source": "3", "target": "4" }
                    ]
                }"#,
            );
            assert_equivalent(&expected, &proj, proj_initial);
            assert_eq!(proj[proj_initial], State::new("0"));
            let states: BTreeSet<_> = proj.node_weights().cloned().collect();
            assert_eq!(
                states,
                BTreeSet::from(["0", "1", "3", "4"].map(State::new))
            );
            assert!(branch_states.values().all(BranchState::is_resolved));
        }

        #[test]
        fn test_projection_fail_1() {
            setup_logger();
            let (g, i) = composed(InterfacingProtocols(vec![get_proto1(), get_proto2()]));
            let (proj, proj_initial, _) =
                project(&g, i, &get_subs_composition_1(), Role::new("D"), true);

            let mut door = get_whf_door();
            door.transitions.retain(|t| {
                !(t.source == State::new("2") && matches!(t.label, MachineLabel::Execute { .. }))
            });
            let (right, right_initial) = to_graph(&door);
            let errors = equivalent(&proj, proj_initial, &right, right_initial)
                .map(Error::convert(&proj, &right));
            assert_eq!(errors, vec!["missing command close in state 2"]);

            let mut door = get_whf_door();
            door.transitions.push(crate::types::Transition {
                label: MachineLabel::Input {
                    event_type: EventType::new("pos"),
                },
                source: State::new("0"),
                target: State::new("1"),
            });
            let (right, right_initial) = to_graph(&door);
            let errors = equivalent(&proj, proj_initial, &right, right_initial)
                .map(Error::convert(&proj, &right));
            assert_eq!(errors, vec!["extra reaction to event type pos in state 0"]);
        }

        #[test]
        fn test_all_projs_whf() {
            setup_logger();
            let (g, i) = composed(InterfacingProtocols(vec![get_proto1(), get_proto2()]));
            let mut subs = get_subs_composition_1();
            subs.entry(Role::new("FL"))
                .or_default()
                .insert(EventType::new("part"));
            let expected_projs = [
                (Role::new("D"), get_whf_door()),
                (Role::new("FL"), get_whf_forklift()),
                (Role::new("F"), get_whf_f()),
            ];

            for (role, expected) in expected_projs {
                for minimize in [false, true] {
                    let (proj, proj_initial, _) = project(&g, i, &subs, role.clone(), minimize);
                    assert_deterministic(&proj);
                    assert_equivalent(&expected, &proj, proj_initial);
                }
            }
        }

        #[test]
        fn minimized_projection_is_not_larger() {
            setup_logger();
            let (g, i) = composed(InterfacingProtocols(vec![get_proto1(), get_proto2()]));
            let subs = get_subs_composition_1();
            for role in ["T", "FL", "D", "F"].map(Role::new) {
                let (dfa, dfa_initial, _) = project(&g, i, &subs, role.clone(), false);
                let (minimal, minimal_initial, branch_states) =
                    project(&g, i, &subs, role.clone(), true);
                assert!(minimal.node_count() <= dfa.node_count());
                assert!(equivalent(&dfa, dfa_initial, &minimal, minimal_initial).is_empty());
                assert_eq!(branch_states.len(), minimal.node_count());
            }
        }

        #[test]
        fn singleton_states_keep_their_names() {
            setup_logger();
            let (g, i) = composed(InterfacingProtocols(vec![get_proto1(), get_proto2()]));
            let (proj, proj_initial, branch_states) =
                project(&g, i, &get_subs_composition_1(), Role::new("D"), false);
            assert_eq!(proj[proj_initial], State::new("0 || 0"));
            // time after part leads to two composed states at once
            assert!(proj
                .node_weights()
                .any(|s| *s == State::new("{ 3 || 2, 3 || 3 }")));
            assert!(branch_states.values().all(BranchState::is_resolved));

            let (minimal, _, _) =
                project(&g, i, &get_subs_composition_1(), Role::new("D"), true);
            assert!(minimal
                .node_weights()
                .any(|s| *s == State::new("{ 3 || 0, 3 || 2, 3 || 3 }")));
        }

        #[test]
        fn projection_marks_branch_points() {
            setup_logger();
            let (g, i) = composed(get_branching_protos());
            let subs = subs(r#"{ "A": ["e", "f"] }"#);

            for minimize in [false, true] {
                let (proj, proj_initial, branch_states) =
                    project(&g, i, &subs, Role::new("A"), minimize);
                assert_deterministic(&proj);
                assert_eq!(
                    branch_states[&proj[proj_initial]],
                    BranchState::Resolved {
                        state: State::new("0 || 0")
                    }
                );
                let after_e = proj
                    .edges_directed(proj_initial, Outgoing)
                    .find(|e| {
                        *e.weight()
                            == MachineLabel::Input {
                                event_type: EventType::new("e"),
                            }
                    })
                    .unwrap()
                    .target();
                assert_eq!(
                    branch_states[&proj[after_e]],
                    BranchState::Unresolved {
                        candidates: BTreeSet::from(["1 || 0", "1 || 1", "1 || 3"].map(State::new)),
                        resolving_event_types: BTreeSet::from([EventType::new("f")]),
                    }
                );
            }
        }

        #[test]
        fn projection_to_json() {
            let (g, i) = composed(InterfacingProtocols(vec![get_proto2()]));
            let subs = subs(r#"{ "F": ["part", "car"] }"#);
            let (proj, proj_initial, _) = project(&g, i, &subs, Role::new("F"), true);
            let json = to_json_machine(&proj, proj_initial);
            assert_eq!(json.initial, State::new("0"));
            let labels: BTreeSet<String> =
                json.transitions.iter().map(|t| t.label.to_string()).collect();
            assert_eq!(
                labels,
                BTreeSet::from(["build/car", "car?", "part?"].map(String::from))
            );
        }
    }

    mod composition_tests {
        use super::*;

        #[test]
        fn test_compose_zero() {
            setup_logger();
            let left = machine(
                r#"{
                    "initial": "left_0",
                    "transitions": [
                        { "label": { "tag": "Input", "eventType": "a" }, "source": "left_0", "target": "left_1" }
                    ]
                }"#,
            );
            let right = machine(r#"{ "initial": "right_0", "transitions": [] }"#);
            let (left, left_initial) = to_graph(&left);
            let (right, right_initial) = to_graph(&right);
            let interface = shared_event_types(&left, &right);
            assert!(interface.is_empty());
            let (combined, combined_initial) =
                compose(left, left_initial, right, right_initial, interface, gen_state_name);
            assert_eq!(combined[combined_initial], State::new("left_0 || right_0"));
            assert_eq!(combined.node_count(), 2);
            assert_eq!(combined.edge_count(), 1);
        }

        #[test]
        fn interfacing_transitions_need_both_sides() {
            setup_logger();
            let left = machine(
                r#"{
                    "initial": "0",
                    "transitions": [
                        { "label": { "tag": "Input", "eventType": "a" }, "source": "0", "target": "1" },
                        { "label": { "tag": "Input", "eventType": "b" }, "source": "1", "target": "2" }
                    ]
                }"#,
            );
            let right = machine(
                r#"{
                    "initial": "0",
                    "transitions": [
                        { "label": { "tag": "Input", "eventType": "c" }, "source": "0", "target": "1" },
                        { "label": { "tag": "Input", "eventType": "b" }, "source": "1", "target": "2" }
                    ]
                }"#,
            );
            let (left, left_initial) = to_graph(&left);
            let (right, right_initial) = to_graph(&right);
            let interface = shared_event_types(&left, &right);
            assert_eq!(interface, BTreeSet::from([EventType::new("b")]));
            let (combined, combined_initial) =
                compose(left, left_initial, right, right_initial, interface, gen_state_name);
            // a and c interleave, b is taken once both sides are ready
            assert_eq!(combined.node_count(), 5);
            assert_eq!(combined.edge_count(), 5);
            let b_edges: Vec<_> = combined
                .edge_references()
                .filter(|e| e.weight().get_event_type() == EventType::new("b"))
                .map(|e| (combined[e.source()].clone(), combined[e.target()].clone()))
                .collect();
            assert_eq!(
                b_edges,
                vec![(State::new("1 || 1"), State::new("2 || 2"))]
            );
            assert_eq!(combined[combined_initial], State::new("0 || 0"));
        }

        #[test]
        fn combine_projections_of_components() {
            setup_logger();
            let proto_info =
                swarms_to_proto_info(InterfacingProtocols(vec![get_proto1(), get_proto2()]));
            let subs = get_subs_composition_1();
            let (g, i) = explicit_composition(&proto_info).unwrap();
            for role in ["T", "FL", "D", "F"].map(Role::new) {
                let (expanded, expanded_initial, _) = project(&g, i, &subs, role.clone(), true);
                let (combined, combined_initial) = combine_projs(
                    project_components(&proto_info, &subs, &role, true),
                    gen_state_name,
                )
                .unwrap();
                assert!(
                    equivalent(&expanded, expanded_initial, &combined, combined_initial).is_empty(),
                    "role {role}"
                );
            }
            assert!(combine_projs::<State, MachineLabel>(vec![], gen_state_name).is_none());
        }
    }

    mod equivalence_tests {
        use super::*;

        #[test]
        fn non_determinism_is_reported() {
            setup_logger();
            let reference = machine(
                r#"{
                    "initial": "0",
                    "transitions": [
                        { "label": { "tag": "Input", "eventType": "a" }, "source": "0", "target": "1" }
                    ]
                }"#,
            );
            let (left, li) = to_graph(&reference);
            let mut right = MachineGraph::new();
            let ri = right.add_node(State::new("0"));
            let r1 = right.add_node(State::new("1"));
            let r2 = right.add_node(State::new("2"));
            let a = MachineLabel::Input {
                event_type: EventType::new("a"),
            };
            right.add_edge(ri, r1, a.clone());
            right.add_edge(ri, r2, a);
            let errors = equivalent(&left, li, &right, ri).map(Error::convert(&left, &right));
            assert_eq!(
                errors,
                vec!["non-deterministic reaction to event type a in state 0 of the machine"]
            );
        }

        #[test]
        fn renamed_states_are_equivalent() {
            let (g, i) = composed(InterfacingProtocols(vec![get_proto2()]));
            let subs = subs(r#"{ "T": ["partID", "part"] }"#);
            let (proj, proj_initial, _) = project(&g, i, &subs, Role::new("T"), true);
            let renamed = machine(
                r#"{
                    "initial": "start",
                    "transitions": [
                        { "label": { "tag": "Execute", "cmd": "request", "logType": ["partID"] }, "source": "start", "target": "start" },
                        { "label": { "tag": "Input", "eventType": "partID" }, "source": "start", "target": "requested" },
                        { "label": { "tag": "Execute", "cmd": "deliver", "logType": ["part"] }, "source": "requested", "target": "requested" },
                        { "label": { "tag": "Input", "eventType": "part" }, "source": "requested", "target": "done" }
                    ]
                }"#,
            );
            let (right, ri) = to_graph(&renamed);
            assert!(equivalent(&proj, proj_initial, &right, ri).is_empty());
        }
    }

    mod branch_map_tests {
        use super::*;

        #[test]
        fn branches_stop_at_special_event_types() {
            setup_logger();
            let proto_info = swarms_to_proto_info(InterfacingProtocols(vec![get_proto1()]));
            let (g, i) = explicit_composition(&proto_info).unwrap();
            let subs = subs(r#"{ "D": ["partID", "part", "time"] }"#);
            let (proj, _, _) = project(&g, i, &subs, Role::new("D"), true);
            let branches = paths_from_event_types(&proj, &proto_info);
            // partID and time branch at 0, part leads back to the branching state
            assert_eq!(
                branches[&EventType::new("part")],
                vec![EventType::new("partID"), EventType::new("time")]
            );
            assert_eq!(
                branches[&EventType::new("partID")],
                vec![
                    EventType::new("part"),
                    EventType::new("partID"),
                    EventType::new("time")
                ]
            );
            assert!(branches[&EventType::new("time")].is_empty());
        }
    }
}
