use super::composition_machine::{combine_projs, gen_state_name};
use super::composition_types::{
    unord_event_pair, EventLabel, Granularity, InterfacingProtocols, ProtoInfo, ProtoLabel,
    ProtoStruct, RoleEventMap, UnordEventPair,
};
use crate::{
    types::{Command, EventType, Role, State, StateName, SwarmLabel, Transition},
    EdgeId, Graph, MapVec, NodeId, Subscriptions, SwarmProtocolType,
};
use itertools::Itertools;
use petgraph::{
    algo::floyd_warshall,
    graph::EdgeReference,
    visit::{Dfs, DfsPostOrder, EdgeRef, Reversed, Walker},
    Directed,
    Direction::{self, Incoming, Outgoing},
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Error {
    ActiveRoleNotSubscribed(EdgeId),
    LaterActiveRoleNotSubscribed(EdgeId, Role),
    LogTypeEmpty(EdgeId),
    StateUnreachable(NodeId),
    InitialStateDisconnected,
    EventTypeOnDifferentLabels(EventType, Command, Role, Command, Role),
    CommandOnDifferentLabels(Command, EventType, Role, EventType, Role),
    RoleNotSubscribedToBranch(Vec<EventType>, EdgeId, NodeId, Role),
    RoleNotSubscribedToJoin(Vec<EventType>, EdgeId, Role),
    LoopingError(EdgeId, Vec<Role>),
    MoreThanOneEventTypeInCommand(EdgeId),
    EventEmittedMultipleTimes(EventType, Vec<EdgeId>),
    CommandOnMultipleTransitions(Command, Vec<EdgeId>),
    InvalidArg,
}

impl Error {
    fn to_string<N: StateName>(&self, graph: &petgraph::Graph<N, SwarmLabel>) -> String {
        match self {
            Error::ActiveRoleNotSubscribed(edge) => format!(
                "active role does not subscribe to any of its emitted event types in transition {}",
                Edge(graph, *edge)
            ),
            Error::LaterActiveRoleNotSubscribed(edge, role) => format!(
                "subsequently active role {role} does not subscribe to events in transition {}",
                Edge(graph, *edge)
            ),
            Error::LogTypeEmpty(edge) => {
                format!("log type must not be empty {}", Edge(graph, *edge))
            }
            Error::StateUnreachable(node) => format!(
                "state {} is unreachable from initial state",
                &graph[*node].state_name()
            ),
            Error::InitialStateDisconnected => {
                "initial swarm protocol state has no transitions".to_string()
            }
            Error::EventTypeOnDifferentLabels(event_type, command1, role1, command2, role2) => {
                format!("Event type {event_type} appears as {command1}@{role1}<{event_type}> and as {command2}@{role2}<{event_type}>")
            }
            Error::CommandOnDifferentLabels(command, event_type1, role1, event_type2, role2) => {
                format!("Command {command} appears as {command}@{role1}<{event_type1}> and as {command}@{role2}<{event_type2}>")
            }
            Error::RoleNotSubscribedToBranch(event_types, edge, node, role) => {
                let events = event_types.join(", ");
                format!(
                    "role {role} does not subscribe to event types {events} in branching transitions at state {}, but is involved after transition {}",
                    &graph[*node].state_name(),
                    Edge(graph, *edge)
                )
            }
            Error::RoleNotSubscribedToJoin(preceding_events, edge, role) => {
                let events = preceding_events.join(", ");
                format!(
                    "role {role} does not subscribe to event types {events} leading to or in joining event in transition {}",
                    Edge(graph, *edge),
                )
            }
            Error::LoopingError(edge, roles) => {
                format!(
                    "transition {} is part of loop that can not reach a terminal state, but no looping event type in the loop is subscribed to by roles {} involved in the loop",
                    Edge(graph, *edge),
                    roles.join(", ")
                )
            }
            Error::MoreThanOneEventTypeInCommand(edge) => {
                format!(
                    "transition {} emits more than one event type",
                    Edge(graph, *edge)
                )
            }
            Error::EventEmittedMultipleTimes(event_type, edges) => {
                let edges_pretty = edges.iter().map(|edge| Edge(graph, *edge)).join(", ");
                format!("event type {event_type} emitted in more than one transition: {edges_pretty}")
            }
            Error::CommandOnMultipleTransitions(command, edges) => {
                let edges_pretty = edges.iter().map(|edge| Edge(graph, *edge)).join(", ");
                format!("command {command} enabled in more than one transition: {edges_pretty}")
            }
            Error::InvalidArg => "invalid argument".to_string(),
        }
    }

    pub fn convert<N: StateName>(
        graph: &petgraph::Graph<N, SwarmLabel>,
    ) -> impl Fn(Error) -> String + '_ {
        |err| err.to_string(graph)
    }

    /// Errors that make a protocol unusable on its own, regardless of subscriptions.
    fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::LogTypeEmpty(_)
                | Error::StateUnreachable(_)
                | Error::InitialStateDisconnected
                | Error::MoreThanOneEventTypeInCommand(_)
                | Error::EventEmittedMultipleTimes(..)
                | Error::CommandOnMultipleTransitions(..)
                | Error::InvalidArg
        )
    }

    fn is_interface(&self) -> bool {
        matches!(
            self,
            Error::EventTypeOnDifferentLabels(..) | Error::CommandOnDifferentLabels(..)
        )
    }
}

const INVALID_EDGE: &str = "[invalid EdgeId]";

struct Edge<'a, N: StateName>(&'a petgraph::Graph<N, SwarmLabel>, EdgeId);

impl<'a, N: StateName> fmt::Display for Edge<'a, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some((source, target)) = self.0.edge_endpoints(self.1) else {
            return f.write_str(INVALID_EDGE);
        };
        let source = self.0[source].state_name();
        let target = self.0[target].state_name();
        let label = &self.0[self.1];
        write!(f, "({source})--[{label}]-->({target})")
    }
}

// Errors accumulated while processing protocols, each next to the graph its ids refer to.
#[derive(Debug)]
pub struct ErrorReport(pub Vec<(Graph, Vec<Error>)>);

impl ErrorReport {
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|(_, es)| es.is_empty())
    }

    pub fn messages(&self) -> Vec<String> {
        self.0
            .iter()
            .flat_map(|(g, e)| e.clone().map(Error::convert(g)))
            .collect()
    }
}

impl From<ErrorReport> for crate::Error {
    fn from(report: ErrorReport) -> Self {
        let errors = || report.0.iter().flat_map(|(_, es)| es.iter());
        if errors().any(Error::is_structural) {
            crate::Error::MalformedProtocol(report.messages())
        } else if errors().any(Error::is_interface) {
            crate::Error::IncompatibleInterface(report.messages())
        } else {
            crate::Error::NotWellFormed(report.messages())
        }
    }
}

// Retrieve a graph or return early. A missing initial state has already been reported.
macro_rules! get_ith_or_error {
    ($proto_info:expr, $proto_pointer:expr) => {
        match $proto_info.get_ith_proto($proto_pointer) {
            Some(ProtoStruct {
                graph: g,
                initial: Some(i),
                errors: e,
                roles: _,
            }) => (g, i, e),
            Some(ProtoStruct { initial: None, .. }) => return vec![],
            None => return vec![Error::InvalidArg],
        }
    };
}

// Well-formedness check
pub fn check(protos: InterfacingProtocols, subs: &Subscriptions) -> ErrorReport {
    let _span = tracing::info_span!("check").entered();
    let combined_proto_info = swarms_to_proto_info(protos);
    if !combined_proto_info.no_errors() {
        return proto_info_to_error_report(combined_proto_info);
    }

    // The protocols interface and are confusion free. Check the expanded composition,
    // keeping branching and joining information from the components.
    let composition = explicit_composition_proto_info(combined_proto_info);
    let composition_checked = well_formed_proto_info(composition, subs);

    proto_info_to_error_report(composition_checked)
}

// Smallest wf-subscription containing subs, computed on the expanded composition.
pub fn exact_well_formed_sub(
    protos: InterfacingProtocols,
    subs: &Subscriptions,
) -> Result<Subscriptions, ErrorReport> {
    let _span = tracing::info_span!("exact_well_formed_sub").entered();
    let combined_proto_info = swarms_to_proto_info(protos);
    if !combined_proto_info.no_errors() {
        return Err(proto_info_to_error_report(combined_proto_info));
    }

    let composition = explicit_composition_proto_info(combined_proto_info);
    Ok(exact_wf_sub(composition, 0, subs))
}

// Construct wf-subscription compositionally.
// Overapproximates the subscription one would obtain from exact_well_formed_sub().
pub fn overapprox_well_formed_sub(
    protos: InterfacingProtocols,
    subs: &Subscriptions,
    granularity: Granularity,
) -> Result<Subscriptions, ErrorReport> {
    let _span = tracing::info_span!("overapprox_well_formed_sub", ?granularity).entered();
    let mut combined_proto_info = swarms_to_proto_info(protos);
    if !combined_proto_info.no_errors() {
        return Err(proto_info_to_error_report(combined_proto_info));
    }

    Ok(overapprox_wf_sub(&mut combined_proto_info, subs, granularity))
}

// Combine the analysis data of all protocols and add confusion-freeness errors.
// succeeding_events is the union of the components' maps, not its transitive closure.
pub fn swarms_to_proto_info(protos: InterfacingProtocols) -> ProtoInfo {
    let _span = tracing::info_span!("swarms_to_proto_info").entered();
    let combined_proto_info = combine_proto_infos(prepare_proto_infos(protos));
    confusion_free_proto_info(combined_proto_info)
}

// The expanded composition of protos. None if there are no protocols.
pub fn compose_protocols(
    protos: InterfacingProtocols,
) -> Result<Option<(Graph, NodeId)>, ErrorReport> {
    let _span = tracing::info_span!("compose_protocols").entered();
    let combined_proto_info = swarms_to_proto_info(protos);
    if !combined_proto_info.no_errors() {
        return Err(proto_info_to_error_report(combined_proto_info));
    }

    Ok(explicit_composition(&combined_proto_info))
}

fn well_formed_proto_info(proto_info: ProtoInfo, subs: &Subscriptions) -> ProtoInfo {
    let _span = tracing::info_span!("well_formed_proto_info").entered();
    let protocols: Vec<_> = proto_info
        .protocols
        .clone()
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            let errors = [p.errors, well_formed(&proto_info, i, subs)].concat();
            ProtoStruct { errors, ..p }
        })
        .collect();

    ProtoInfo {
        protocols,
        ..proto_info
    }
}

fn confusion_free_proto_info(proto_info: ProtoInfo) -> ProtoInfo {
    let _span = tracing::info_span!("confusion_free_proto_info").entered();
    let protocols: Vec<_> = proto_info
        .protocols
        .clone()
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            let errors = [p.errors, confusion_free(&proto_info, i)].concat();
            ProtoStruct { errors, ..p }
        })
        .collect();

    ProtoInfo {
        protocols,
        ..proto_info
    }
}

// The event types emitted at node that branch together with event_type.
// A single such event type at a node is not a branch: concurrency can hide the others.
fn branching_at_node(
    proto_info: &ProtoInfo,
    graph: &Graph,
    node: NodeId,
    event_type: &EventType,
) -> BTreeSet<EventType> {
    let branching_with_event_type: BTreeSet<_> = proto_info
        .branching_events
        .iter()
        .filter(|set| set.contains(event_type))
        .flatten()
        .cloned()
        .collect();

    let branching_this_node: BTreeSet<_> = graph
        .edges_directed(node, Outgoing)
        .map(|e| e.weight().get_event_type())
        .filter(|t| branching_with_event_type.contains(t))
        .collect();

    if branching_this_node.len() > 1 {
        branching_this_node
    } else {
        BTreeSet::new()
    }
}

// A joining event type together with the concurrent event types immediately before it.
// Empty unless event_type is interfacing and has concurrent predecessors at node.
fn joining_at_node(
    proto_info: &ProtoInfo,
    graph: &Graph,
    node: NodeId,
    event_type: &EventType,
) -> BTreeSet<EventType> {
    if !proto_info.interfacing_events.contains(event_type) {
        return BTreeSet::new();
    }

    event_pairs_from_node(node, graph, Incoming)
        .into_iter()
        .filter(|pair| proto_info.concurrent_events.contains(pair))
        .filter(|pair| {
            pair.iter().all(|e| {
                !proto_info
                    .concurrent_events
                    .contains(&unord_event_pair(e.clone(), event_type.clone()))
            })
        })
        .flat_map(|pair| pair.into_iter().chain([event_type.clone()]))
        .collect()
}

// Event type t together with everything that can follow it.
fn with_succeeding(proto_info: &ProtoInfo, t: &EventType) -> BTreeSet<EventType> {
    [t.clone()]
        .into_iter()
        .chain(
            proto_info
                .succeeding_events
                .get(t)
                .cloned()
                .unwrap_or_default(),
        )
        .collect()
}

/*
 * Check well-formedness of the protocol at index proto_pointer in proto_info w.r.t. subs.
 * A graph prepared without errors has one event type per command and is confusion free,
 * so command and log determinism need no check here.
 */
fn well_formed(proto_info: &ProtoInfo, proto_pointer: usize, subs: &Subscriptions) -> Vec<Error> {
    let _span = tracing::info_span!("well_formed").entered();
    let mut errors = Vec::new();
    let empty = BTreeSet::new();
    let sub = |r: &Role| subs.get(r).unwrap_or(&empty);
    let (graph, initial, _) = get_ith_or_error!(proto_info, proto_pointer);

    for node in Dfs::new(&graph, initial).iter(&graph) {
        for edge in graph.edges_directed(node, Outgoing) {
            let event_type = edge.weight().get_event_type();

            // Causal consistency: the active role subscribes to its own event type.
            if !sub(&edge.weight().role).contains(&event_type) {
                errors.push(Error::ActiveRoleNotSubscribed(edge.id()));
            }

            // Causal consistency: roles enabled right after the transition subscribe to it,
            // unless their event type is concurrent with event_type.
            for successor in active_transitions_not_conc(
                edge.target(),
                &graph,
                &event_type,
                &proto_info.concurrent_events,
            ) {
                if !sub(&successor.role).contains(&event_type) {
                    errors.push(Error::LaterActiveRoleNotSubscribed(
                        edge.id(),
                        successor.role,
                    ));
                }
            }

            let involved_roles = roles_on_path(event_type.clone(), proto_info, subs);

            // Determinacy: branching.
            let branching_this_node = branching_at_node(proto_info, &graph, node, &event_type);
            for r in &involved_roles {
                let missing: Vec<EventType> =
                    branching_this_node.difference(sub(r)).cloned().collect();
                if !missing.is_empty() {
                    errors.push(Error::RoleNotSubscribedToBranch(
                        missing,
                        edge.id(),
                        node,
                        r.clone(),
                    ));
                }
            }

            // Determinacy: joining.
            let join_set = joining_at_node(proto_info, &graph, node, &event_type);
            for r in &involved_roles {
                let missing: Vec<EventType> = join_set.difference(sub(r)).cloned().collect();
                if !missing.is_empty() {
                    errors.push(Error::RoleNotSubscribedToJoin(
                        missing,
                        edge.id(),
                        r.clone(),
                    ));
                }
            }

            // Determinacy: looping.
            if proto_info.infinitely_looping_events.contains(&event_type)
                && !all_roles_sub_to_same(
                    with_succeeding(proto_info, &event_type),
                    &involved_roles,
                    subs,
                )
            {
                errors.push(Error::LoopingError(
                    edge.id(),
                    involved_roles.iter().cloned().collect(),
                ));
            }
        }
    }

    errors
}

// Each event type and each command labels exactly one transition.
fn confusion_free(proto_info: &ProtoInfo, proto_pointer: usize) -> Vec<Error> {
    let _span = tracing::info_span!("confusion_free").entered();
    let (graph, _, _) = get_ith_or_error!(proto_info, proto_pointer);

    let mut event_types: BTreeMap<EventType, Vec<EdgeId>> = BTreeMap::new();
    let mut commands: BTreeMap<Command, Vec<EdgeId>> = BTreeMap::new();

    for edge in graph.edge_references() {
        let weight = edge.weight();
        event_types
            .entry(weight.get_event_type())
            .or_default()
            .push(edge.id());
        commands.entry(weight.cmd.clone()).or_default().push(edge.id());
    }

    let event_type_errors = event_types
        .into_iter()
        .filter(|(_, edge_ids)| edge_ids.len() > 1)
        .map(|(event_type, edge_ids)| Error::EventEmittedMultipleTimes(event_type, edge_ids));
    let command_errors = commands
        .into_iter()
        .filter(|(_, edge_ids)| edge_ids.len() > 1)
        .map(|(command, edge_ids)| Error::CommandOnMultipleTransitions(command, edge_ids));

    event_type_errors.chain(command_errors).collect()
}

// Apply the well-formedness rules to the expanded composition until the subscription is stable.
fn exact_wf_sub(
    proto_info: ProtoInfo,
    proto_pointer: usize,
    subscriptions: &Subscriptions,
) -> Subscriptions {
    let _span = tracing::info_span!("exact_wf_sub").entered();
    let mut subscriptions = subscriptions.clone();
    let (graph, initial) = match proto_info.get_ith_proto(proto_pointer) {
        Some(ProtoStruct {
            graph: g,
            initial: Some(i),
            ..
        }) => (g, i),
        _ => return subscriptions,
    };

    while !exact_wf_sub_step(&proto_info, &graph, initial, &mut subscriptions) {}

    add_looping_event_types(&proto_info, &mut subscriptions);

    subscriptions
}

// One pass over the composition. Returns true if nothing was added.
fn exact_wf_sub_step(
    proto_info: &ProtoInfo,
    graph: &Graph,
    initial: NodeId,
    subscriptions: &mut Subscriptions,
) -> bool {
    let _span = tracing::info_span!("exact_wf_sub_step").entered();
    let mut is_stable = true;

    for node in Dfs::new(graph, initial).iter(graph) {
        for edge in graph.edges_directed(node, Outgoing) {
            let event_type = edge.weight().get_event_type();

            // Causal consistency 1: roles subscribe to the event types they emit
            is_stable = add_to_sub(
                edge.weight().role.clone(),
                BTreeSet::from([event_type.clone()]),
                subscriptions,
            ) && is_stable;

            // Causal consistency 2: roles subscribe to the event types immediately preceding their commands
            for active in active_transitions_not_conc(
                edge.target(),
                graph,
                &event_type,
                &proto_info.concurrent_events,
            ) {
                is_stable = add_to_sub(
                    active.role,
                    BTreeSet::from([event_type.clone()]),
                    subscriptions,
                ) && is_stable;
            }

            let involved_roles = roles_on_path(event_type.clone(), proto_info, subscriptions);

            // Determinacy 1: branching
            let branching_this_node = branching_at_node(proto_info, graph, node, &event_type);
            // Determinacy 2: joining
            let join_set = joining_at_node(proto_info, graph, node, &event_type);
            let events_to_add: BTreeSet<EventType> =
                branching_this_node.into_iter().chain(join_set).collect();
            if events_to_add.is_empty() {
                continue;
            }
            for r in involved_roles {
                is_stable = add_to_sub(r, events_to_add.clone(), subscriptions) && is_stable;
            }
        }
    }

    is_stable
}

// For each event type t that can not reach a terminal state: unless all roles in roles(t, G)
// subscribe to a common event type among t and its successors, add t to all of them.
fn add_looping_event_types(proto_info: &ProtoInfo, subscriptions: &mut Subscriptions) {
    let _span = tracing::info_span!("add_looping_event_types").entered();

    for t in &proto_info.infinitely_looping_events {
        let involved_roles = roles_on_path(t.clone(), proto_info, subscriptions);
        if !all_roles_sub_to_same(with_succeeding(proto_info, t), &involved_roles, subscriptions)
        {
            for r in involved_roles {
                subscriptions.entry(r).or_default().insert(t.clone());
            }
        }
    }
}

// True if some event type in event_types is subscribed to by every role in involved_roles.
fn all_roles_sub_to_same(
    event_types: BTreeSet<EventType>,
    involved_roles: &BTreeSet<Role>,
    subs: &Subscriptions,
) -> bool {
    let empty = BTreeSet::new();
    event_types.into_iter().any(|t| {
        involved_roles
            .iter()
            .all(|r| subs.get(r).unwrap_or(&empty).contains(&t))
    })
}

fn overapprox_wf_sub(
    proto_info: &mut ProtoInfo,
    subscription: &Subscriptions,
    granularity: Granularity,
) -> Subscriptions {
    let _span = tracing::info_span!("overapprox_wf_sub").entered();
    add_composition_loops(proto_info);
    let mut subscription = match granularity {
        Granularity::Fine => finer_overapprox_wf_sub(proto_info, subscription, false),
        Granularity::Medium => finer_overapprox_wf_sub(proto_info, subscription, true),
        Granularity::Coarse => coarse_overapprox_wf_sub(proto_info, subscription),
        Granularity::TwoStep => two_step_overapprox_wf_sub(proto_info, subscription),
    };
    overapprox_add_looping(proto_info, &mut subscription);

    subscription
}

// Two components may order their shared event types differently. The composition then
// loses behaviour, and a loop that terminates in its component may loop forever in the
// composition. Close the succeeding event types and add the ordering and the looping
// event types of the expanded composition.
fn add_composition_loops(proto_info: &mut ProtoInfo) {
    let _span = tracing::info_span!("add_composition_loops").entered();
    proto_info.succeeding_events =
        transitive_closure_succeeding(std::mem::take(&mut proto_info.succeeding_events));
    let Some((composed, initial)) = explicit_composition(proto_info) else {
        return;
    };
    let succeeding_events = after_not_concurrent(&composed, initial, &proto_info.concurrent_events);
    proto_info
        .infinitely_looping_events
        .extend(infinitely_looping_event_types(&composed, &succeeding_events));
    proto_info.succeeding_events = combine_maps(
        std::mem::take(&mut proto_info.succeeding_events),
        succeeding_events,
        None,
    );
}

// Every role involved in a looping event type subscribes to it. Roles that become involved
// this way take part in branches and joins, so repeat until stable.
fn overapprox_add_looping(proto_info: &ProtoInfo, subscription: &mut Subscriptions) {
    let _span = tracing::info_span!("overapprox_add_looping").entered();
    let mut is_stable = false;
    while !is_stable {
        is_stable = true;
        for t in &proto_info.infinitely_looping_events {
            for role in roles_on_path(t.clone(), proto_info, subscription) {
                is_stable =
                    add_to_sub(role, BTreeSet::from([t.clone()]), subscription) && is_stable;
            }
        }
        is_stable = add_joins(proto_info, subscription) & add_branches(proto_info, subscription)
            && is_stable;
    }
}

// Every role gets all branching, joining and interfacing event types, plus its own
// event types and those immediately preceding them.
fn coarse_overapprox_wf_sub(proto_info: &ProtoInfo, subscription: &Subscriptions) -> Subscriptions {
    let _span = tracing::info_span!("coarse_overapprox_wf_sub").entered();
    let events_to_add_to_all: BTreeSet<EventType> = proto_info
        .branching_events
        .iter()
        .flatten()
        .cloned()
        .chain(flatten_joining_map(&proto_info.joining_events))
        .chain(proto_info.interfacing_events.iter().cloned())
        .collect();

    combine_maps(
        subscription.clone(),
        causal_consistency_sub(proto_info),
        Some(events_to_add_to_all),
    )
}

fn finer_overapprox_wf_sub(
    proto_info: &ProtoInfo,
    subscription: &Subscriptions,
    with_all_interfacing: bool,
) -> Subscriptions {
    let _span = tracing::info_span!("finer_overapprox_wf_sub").entered();
    let mut subscription = combine_maps(
        subscription.clone(),
        causal_consistency_sub(proto_info),
        None,
    );

    // 'Medium granularity'
    if with_all_interfacing {
        for sub in subscription.values_mut() {
            sub.extend(proto_info.interfacing_events.iter().cloned());
        }
    }

    finer_approx_add_branches_and_joins(proto_info, &mut subscription);

    subscription
}

fn finer_approx_add_branches_and_joins(proto_info: &ProtoInfo, subscription: &mut Subscriptions) {
    let _span = tracing::info_span!("finer_approx_add_branches_and_joins").entered();
    let mut is_stable = false;

    while !is_stable {
        is_stable = add_joins(proto_info, subscription) & add_branches(proto_info, subscription);
    }
}

// Add branching and joining event types to the roles interested in them.
// Returns true if nothing was added.
fn add_branches(proto_info: &ProtoInfo, subscription: &mut Subscriptions) -> bool {
    let mut is_stable = true;
    for branching_events in &proto_info.branching_events {
        let interested_roles = branching_events
            .iter()
            .flat_map(|e| roles_on_path(e.clone(), proto_info, subscription))
            .collect::<BTreeSet<_>>();
        for role in interested_roles {
            is_stable = add_to_sub(role, branching_events.clone(), subscription) && is_stable;
        }
    }
    is_stable
}

fn add_joins(proto_info: &ProtoInfo, subscription: &mut Subscriptions) -> bool {
    let mut is_stable = true;
    for (joining_event, pre_joining_events) in &proto_info.joining_events {
        let interested_roles = roles_on_path(joining_event.clone(), proto_info, subscription);
        let join_and_prejoin: BTreeSet<EventType> = [joining_event.clone()]
            .into_iter()
            .chain(pre_joining_events.iter().cloned())
            .collect();
        for role in interested_roles {
            is_stable = add_to_sub(role, join_and_prejoin.clone(), subscription) && is_stable;
        }
    }
    is_stable
}

// Causal consistency first, then branches, joins and interfacing event types until stable.
fn two_step_overapprox_wf_sub(
    proto_info: &ProtoInfo,
    subscription: &Subscriptions,
) -> Subscriptions {
    let _span = tracing::info_span!("two_step_overapprox_wf_sub").entered();
    let mut subscription = combine_maps(
        subscription.clone(),
        causal_consistency_sub(proto_info),
        None,
    );

    let mut is_stable = false;
    while !is_stable {
        is_stable = add_branches(proto_info, &mut subscription);
        is_stable = add_joins(proto_info, &mut subscription) && is_stable;

        for interfacing_event in &proto_info.interfacing_events {
            let interested_roles =
                roles_on_path(interfacing_event.clone(), proto_info, &subscription);
            for role in interested_roles {
                is_stable = add_to_sub(
                    role,
                    BTreeSet::from([interfacing_event.clone()]),
                    &mut subscription,
                ) && is_stable;
            }
        }
    }

    subscription
}

// Own event types and the event types immediately preceding them, per role.
fn causal_consistency_sub(proto_info: &ProtoInfo) -> Subscriptions {
    proto_info
        .role_event_map
        .iter()
        .map(|(role, labels)| {
            let events = labels
                .iter()
                .flat_map(|label| {
                    let event_type = label.get_event_type();
                    proto_info
                        .immediately_pre
                        .get(&event_type)
                        .cloned()
                        .unwrap_or_default()
                        .into_iter()
                        .chain([event_type])
                })
                .collect();
            (role.clone(), events)
        })
        .collect()
}

// Add event types to the subscription of role. Returns true if they were all there already.
fn add_to_sub(role: Role, mut event_types: BTreeSet<EventType>, subs: &mut Subscriptions) -> bool {
    if subs
        .get(&role)
        .is_some_and(|sub| event_types.is_subset(sub))
    {
        return true;
    }
    subs.entry(role).or_default().append(&mut event_types);
    false
}

// Maps keyed by event type (command) to the label data they appear with. Labels of a
// confusion free protocol are unique per event type and per command.
fn event_type_map(proto_info: &ProtoInfo) -> BTreeMap<EventType, (Command, Role)> {
    proto_info
        .get_labels()
        .into_iter()
        .map(|(c, t, r)| (t, (c, r)))
        .collect()
}

fn command_map(proto_info: &ProtoInfo) -> BTreeMap<Command, (EventType, Role)> {
    proto_info
        .get_labels()
        .into_iter()
        .map(|(c, t, r)| (c, (t, r)))
        .collect()
}

// For any c@R<t> in proto_info1 and c'@R'<t> in proto_info2: c = c' and R = R'
fn cross_protocol_event_type_errors(proto_info1: &ProtoInfo, proto_info2: &ProtoInfo) -> Vec<Error> {
    let event_type_map1 = event_type_map(proto_info1);
    let event_type_map2 = event_type_map(proto_info2);

    event_type_map1
        .iter()
        .filter_map(|(t, (c1, r1))| match event_type_map2.get(t) {
            Some((c2, r2)) if c1 != c2 || r1 != r2 => Some(Error::EventTypeOnDifferentLabels(
                t.clone(),
                c1.clone(),
                r1.clone(),
                c2.clone(),
                r2.clone(),
            )),
            _ => None,
        })
        .collect()
}

// For any c@R<t> in proto_info1 and c@R'<t'> in proto_info2: t = t' and R = R'
fn cross_protocol_command_errors(proto_info1: &ProtoInfo, proto_info2: &ProtoInfo) -> Vec<Error> {
    let command_map1 = command_map(proto_info1);
    let command_map2 = command_map(proto_info2);

    command_map1
        .iter()
        .filter_map(|(c, (t1, r1))| match command_map2.get(c) {
            Some((t2, r2)) if t1 != t2 || r1 != r2 => Some(Error::CommandOnDifferentLabels(
                c.clone(),
                t1.clone(),
                r1.clone(),
                t2.clone(),
                r2.clone(),
            )),
            _ => None,
        })
        .collect()
}

// Event types and commands shared by two protocols must carry the same labels in both.
fn check_interface(proto_info1: &ProtoInfo, proto_info2: &ProtoInfo) -> Vec<Error> {
    [
        cross_protocol_event_type_errors(proto_info1, proto_info2),
        cross_protocol_command_errors(proto_info1, proto_info2),
    ]
    .concat()
}

// Two protocols interface on the event types occurring in both.
#[inline]
fn get_interfacing_event_types(
    proto_info1: &ProtoInfo,
    proto_info2: &ProtoInfo,
) -> BTreeSet<EventType> {
    proto_info1
        .get_event_types()
        .intersection(&proto_info2.get_event_types())
        .cloned()
        .collect()
}

// Map from joining event types to the concurrent event types immediately preceding them.
#[inline]
fn joining_event_types_map(proto_info: &ProtoInfo) -> BTreeMap<EventType, BTreeSet<EventType>> {
    let pre_joins = |e: &EventType| -> BTreeSet<EventType> {
        let pre = proto_info
            .immediately_pre
            .get(e)
            .cloned()
            .unwrap_or_default();
        pre.iter()
            .cartesian_product(&pre)
            .filter(|(e1, e2)| {
                e1 != e2
                    && proto_info
                        .concurrent_events
                        .contains(&unord_event_pair((*e1).clone(), (*e2).clone()))
            })
            .flat_map(|(e1, e2)| [e1.clone(), e2.clone()])
            .collect()
    };

    proto_info
        .interfacing_events
        .iter()
        .map(|e| (e.clone(), pre_joins(e)))
        .filter(|(_, pre)| !pre.is_empty())
        .collect()
}

fn flatten_joining_map(
    joining_event_types: &BTreeMap<EventType, BTreeSet<EventType>>,
) -> BTreeSet<EventType> {
    joining_event_types
        .iter()
        .flat_map(|(join, pre)| pre.iter().cloned().chain([join.clone()]))
        .collect()
}

// Combine the fields of two proto infos.
// Neither the transitive closure of succeeding events nor the joining event types are computed here.
fn combine_two_proto_infos(proto_info1: ProtoInfo, proto_info2: ProtoInfo) -> ProtoInfo {
    let _span = tracing::info_span!("combine_two_proto_infos").entered();
    let interface_errors = check_interface(&proto_info1, &proto_info2);
    let interfacing_event_types = get_interfacing_event_types(&proto_info1, &proto_info2);
    let concurrent_events =
        get_concurrent_events(&proto_info1, &proto_info2, &interfacing_event_types);

    let protocols = [proto_info1.protocols, proto_info2.protocols].concat();
    let role_event_map = combine_maps(proto_info1.role_event_map, proto_info2.role_event_map, None);
    let branching_events = [proto_info1.branching_events, proto_info2.branching_events].concat();
    let immediately_pre =
        combine_maps(proto_info1.immediately_pre, proto_info2.immediately_pre, None);
    let succeeding_events = combine_maps(
        proto_info1.succeeding_events,
        proto_info2.succeeding_events,
        None,
    );
    let interfacing_events = proto_info1
        .interfacing_events
        .into_iter()
        .chain(proto_info2.interfacing_events)
        .chain(interfacing_event_types)
        .collect();
    let infinitely_looping_events = proto_info1
        .infinitely_looping_events
        .into_iter()
        .chain(proto_info2.infinitely_looping_events)
        .collect();

    ProtoInfo::new(
        protocols,
        role_event_map,
        concurrent_events,
        branching_events,
        BTreeMap::new(),
        immediately_pre,
        succeeding_events,
        interfacing_events,
        infinitely_looping_events,
        [
            proto_info1.interface_errors,
            proto_info2.interface_errors,
            interface_errors,
        ]
        .concat(),
    )
}

fn combine_proto_infos(protos: Vec<ProtoInfo>) -> ProtoInfo {
    let _span = tracing::info_span!("combine_proto_infos").entered();
    let mut protos = protos.into_iter();
    let Some(first) = protos.next() else {
        return ProtoInfo::new_only_proto(vec![]);
    };

    let mut combined = protos.fold(first, combine_two_proto_infos);
    combined.joining_events = joining_event_types_map(&combined);
    combined
}

// The labels leaving node whose event types are not concurrent with event_type.
fn active_transitions_not_conc(
    node: NodeId,
    graph: &Graph,
    event_type: &EventType,
    concurrent_events: &BTreeSet<UnordEventPair>,
) -> Vec<SwarmLabel> {
    graph
        .edges_directed(node, Outgoing)
        .map(|e| e.weight().clone())
        .filter(|e| {
            !concurrent_events.contains(&unord_event_pair(event_type.clone(), e.get_event_type()))
        })
        .collect()
}

// The roles involved after event_type: those subscribing to event_type or to
// anything that can be emitted after it.
fn roles_on_path(
    event_type: EventType,
    proto_info: &ProtoInfo,
    subs: &Subscriptions,
) -> BTreeSet<Role> {
    let succeeding_events = with_succeeding(proto_info, &event_type);
    subs.iter()
        .filter(|(_, events)| !events.is_disjoint(&succeeding_events))
        .map(|(r, _)| r.clone())
        .collect()
}

// Map each event type t to the event types that can be emitted after t
// without being concurrent with it.
fn after_not_concurrent(
    graph: &Graph,
    initial: NodeId,
    concurrent_events: &BTreeSet<UnordEventPair>,
) -> BTreeMap<EventType, BTreeSet<EventType>> {
    let _span = tracing::info_span!("after_not_concurrent").entered();
    let mut succ_map: BTreeMap<EventType, BTreeSet<EventType>> = BTreeMap::new();
    while !after_not_concurrent_step(graph, initial, concurrent_events, &mut succ_map) {}

    succ_map
}

// For each transition with event type t add the non-concurrent event types enabled
// right after it, together with what is already known to follow those.
fn after_not_concurrent_step(
    graph: &Graph,
    initial: NodeId,
    concurrent_events: &BTreeSet<UnordEventPair>,
    succ_map: &mut BTreeMap<EventType, BTreeSet<EventType>>,
) -> bool {
    let mut is_stable = true;
    let mut walk = DfsPostOrder::new(graph, initial);
    while let Some(node) = walk.next(graph) {
        for edge in graph.edges_directed(node, Outgoing) {
            let event_type = edge.weight().get_event_type();
            let active_in_successor: Vec<EventType> =
                active_transitions_not_conc(edge.target(), graph, &event_type, concurrent_events)
                    .into_iter()
                    .map(|label| label.get_event_type())
                    .collect();

            let mut succ_events: BTreeSet<EventType> = active_in_successor
                .iter()
                .flat_map(|e| succ_map.get(e).cloned().unwrap_or_default())
                .chain(active_in_successor.iter().cloned())
                .collect();

            let known = succ_map.entry(event_type).or_default();
            if !succ_events.is_subset(known) {
                known.append(&mut succ_events);
                is_stable = false;
            }
        }
    }
    is_stable
}

pub fn transitive_closure_succeeding(
    succ_map: BTreeMap<EventType, BTreeSet<EventType>>,
) -> BTreeMap<EventType, BTreeSet<EventType>> {
    let _span = tracing::info_span!("transitive_closure_succeeding").entered();
    let mut graph: petgraph::Graph<EventType, (), Directed> = petgraph::Graph::new();
    let mut node_map = BTreeMap::new();
    for (event, succeeding) in &succ_map {
        let source = *node_map
            .entry(event.clone())
            .or_insert_with(|| graph.add_node(event.clone()));
        for succ in succeeding {
            let target = *node_map
                .entry(succ.clone())
                .or_insert_with(|| graph.add_node(succ.clone()));
            graph.add_edge(source, target, ());
        }
    }

    let transitive_closure: Vec<_> = floyd_warshall(&graph, |_| 1)
        .unwrap_or_else(|_| HashMap::new())
        .into_iter()
        .filter(|(_, v)| *v != i32::MAX && *v != 0)
        .map(|(related_pair, _)| related_pair)
        .collect();

    let mut succ_map_new: BTreeMap<EventType, BTreeSet<EventType>> = BTreeMap::new();
    for (i1, i2) in transitive_closure {
        succ_map_new
            .entry(graph[i1].clone())
            .or_default()
            .insert(graph[i2].clone());
    }

    // floyd_warshall relates every node to itself at distance 0; loops are restored from succ_map
    combine_maps(succ_map, succ_map_new, None)
}

fn prepare_proto_infos(protos: InterfacingProtocols) -> Vec<ProtoInfo> {
    let _span = tracing::info_span!("prepare_proto_infos").entered();
    protos.0.iter().map(prepare_proto_info).collect()
}

// Precondition: proto does not contain concurrency.
fn prepare_proto_info(proto: &SwarmProtocolType) -> ProtoInfo {
    let _span = tracing::info_span!("prepare_proto_info").entered();
    let mut role_event_map: RoleEventMap = BTreeMap::new();
    let mut branching_events = Vec::new();
    let mut immediately_pre_map: BTreeMap<EventType, BTreeSet<EventType>> = BTreeMap::new();
    let (graph, initial, errors) = swarm_to_graph(proto);
    let initial = match initial {
        Some(initial) if errors.is_empty() => initial,
        _ => {
            return ProtoInfo::new_only_proto(vec![ProtoStruct::new(
                graph,
                initial,
                errors,
                BTreeSet::new(),
            )])
        }
    };

    // Without concurrency, the branching event types at a node are all its outgoing event
    // types if there is more than one and they lead to more than one distinct target.
    // The event types immediately preceding an edge are all those entering its source.
    let mut walk = Dfs::new(&graph, initial);
    while let Some(node_id) = walk.next(&graph) {
        let outgoing_labels: Vec<_> = graph
            .edges_directed(node_id, Outgoing)
            .map(|edge| edge.weight())
            .collect();
        let incoming_event_types: BTreeSet<EventType> = graph
            .edges_directed(node_id, Incoming)
            .map(|edge| edge.weight().get_event_type())
            .collect();

        if outgoing_labels.len() > 1 && direct_successors(&graph, node_id).len() > 1 {
            branching_events.push(
                outgoing_labels
                    .iter()
                    .map(|label| label.get_event_type())
                    .collect(),
            );
        }

        for label in outgoing_labels {
            role_event_map
                .entry(label.role.clone())
                .or_default()
                .insert(label.clone());
            immediately_pre_map
                .entry(label.get_event_type())
                .or_default()
                .extend(incoming_event_types.iter().cloned());
        }
    }

    let succeeding_events = after_not_concurrent(&graph, initial, &BTreeSet::new());
    let infinitely_looping_events = infinitely_looping_event_types(&graph, &succeeding_events);

    ProtoInfo::new(
        vec![ProtoStruct::new(
            graph,
            Some(initial),
            errors,
            role_event_map.keys().cloned().collect(),
        )],
        role_event_map,
        BTreeSet::new(),
        branching_events,
        BTreeMap::new(),
        immediately_pre_map,
        succeeding_events,
        BTreeSet::new(),
        infinitely_looping_events,
        vec![],
    )
}

fn direct_successors(graph: &Graph, node: NodeId) -> BTreeSet<NodeId> {
    graph
        .edges_directed(node, Outgoing)
        .map(|e| e.target())
        .collect()
}

// Turn a protocol into a graph and check the structural requirements every further analysis relies on.
fn swarm_to_graph(proto: &SwarmProtocolType) -> (Graph, Option<NodeId>, Vec<Error>) {
    let _span = tracing::info_span!("swarm_to_graph").entered();
    let mut graph = Graph::new();
    let mut errors = vec![];
    let mut nodes = BTreeMap::new();

    for t in &proto.transitions {
        let source = *nodes
            .entry(t.source.clone())
            .or_insert_with(|| graph.add_node(t.source.clone()));
        let target = *nodes
            .entry(t.target.clone())
            .or_insert_with(|| graph.add_node(t.target.clone()));
        let edge = graph.add_edge(source, target, t.label.clone());
        match t.label.log_type.len() {
            0 => errors.push(Error::LogTypeEmpty(edge)),
            1 => (),
            _ => errors.push(Error::MoreThanOneEventTypeInCommand(edge)),
        }
    }

    let initial = if let Some(idx) = nodes.get(&proto.initial) {
        errors.append(&mut all_nodes_reachable(&graph, *idx));
        Some(*idx)
    } else {
        errors.push(Error::InitialStateDisconnected);
        None
    };
    (graph, initial, errors)
}

pub fn proto_info_to_error_report(proto_info: ProtoInfo) -> ErrorReport {
    ErrorReport(
        proto_info
            .protocols
            .into_iter()
            .map(|p| (p.graph, p.errors))
            .chain([(Graph::new(), proto_info.interface_errors)])
            .collect(),
    )
}

fn all_nodes_reachable(graph: &Graph, initial: NodeId) -> Vec<Error> {
    let visited = Dfs::new(graph, initial).iter(graph).collect::<BTreeSet<_>>();

    graph
        .node_indices()
        .filter(|node| !visited.contains(node))
        .map(Error::StateUnreachable)
        .collect()
}

fn nodes_not_reaching_terminal(graph: &Graph) -> Vec<NodeId> {
    let _span = tracing::info_span!("nodes_not_reaching_terminal").entered();
    // Walk backwards from every terminal node.
    let reversed = Reversed(graph);
    let can_reach_terminal_nodes: BTreeSet<_> = graph
        .node_indices()
        .filter(|node| graph.edges_directed(*node, Outgoing).next().is_none())
        .flat_map(|terminal| Dfs::new(reversed, terminal).iter(reversed))
        .collect();

    graph
        .node_indices()
        .filter(|node| !can_reach_terminal_nodes.contains(node))
        .collect()
}

// Event types on a loop that never reaches a terminal state.
fn infinitely_looping_event_types(
    graph: &Graph,
    succ_map: &BTreeMap<EventType, BTreeSet<EventType>>,
) -> BTreeSet<EventType> {
    let _span = tracing::info_span!("infinitely_looping_event_types").entered();
    nodes_not_reaching_terminal(graph)
        .into_iter()
        .flat_map(|n| {
            graph
                .edges_directed(n, Outgoing)
                .map(|e| e.weight().get_event_type())
                .filter(|t| succ_map.get(t).is_some_and(|after| after.contains(t)))
        })
        .collect()
}

// All pairs of event types entering (leaving) a node
fn event_pairs_from_node(node: NodeId, graph: &Graph, direction: Direction) -> Vec<UnordEventPair> {
    graph
        .edges_directed(node, direction)
        .map(|e| e.weight().get_event_type())
        .combinations(2)
        .map(|pair| pair.into_iter().collect())
        .collect()
}

// Union of two maps with sets as values. extra is added to the value of every key.
fn combine_maps<K: Ord + Clone, V: Ord + Clone>(
    map1: BTreeMap<K, BTreeSet<V>>,
    map2: BTreeMap<K, BTreeSet<V>>,
    extra: Option<BTreeSet<V>>,
) -> BTreeMap<K, BTreeSet<V>> {
    let extra = extra.unwrap_or_default();
    let mut combined = map1;
    for (k, mut v) in map2 {
        combined.entry(k).or_default().append(&mut v);
    }
    for v in combined.values_mut() {
        v.extend(extra.iter().cloned());
    }
    combined
}

// Overapproximate concurrency: non-interfacing event types of different protocols are concurrent.
// Pre: interface has been checked.
fn get_concurrent_events(
    proto_info1: &ProtoInfo,
    proto_info2: &ProtoInfo,
    interfacing_event_types: &BTreeSet<EventType>,
) -> BTreeSet<UnordEventPair> {
    let _span = tracing::info_span!("get_concurrent_events").entered();
    let events_proto1: BTreeSet<EventType> = proto_info1
        .get_event_types()
        .difference(interfacing_event_types)
        .cloned()
        .collect();
    let events_proto2: BTreeSet<EventType> = proto_info2
        .get_event_types()
        .difference(interfacing_event_types)
        .cloned()
        .collect();

    proto_info1
        .concurrent_events
        .iter()
        .chain(&proto_info2.concurrent_events)
        .cloned()
        .chain(
            events_proto1
                .into_iter()
                .cartesian_product(&events_proto2)
                .map(|(a, b)| unord_event_pair(a, b.clone())),
        )
        .collect()
}

// Replace the protocols of proto_info by their expanded composition and recompute the
// information that depends on the expanded graph.
fn explicit_composition_proto_info(proto_info: ProtoInfo) -> ProtoInfo {
    let _span = tracing::info_span!("explicit_composition_proto_info").entered();
    let Some((composed, composed_initial)) = explicit_composition(&proto_info) else {
        return proto_info;
    };
    let succeeding_events =
        after_not_concurrent(&composed, composed_initial, &proto_info.concurrent_events);
    let infinitely_looping_events = infinitely_looping_event_types(&composed, &succeeding_events);
    let roles = composed.get_roles();
    ProtoInfo {
        protocols: vec![ProtoStruct::new(
            composed,
            Some(composed_initial),
            vec![],
            roles,
        )],
        succeeding_events,
        infinitely_looping_events,
        ..proto_info
    }
}

// Fold the protocols left to right into their product, synchronizing on shared event types.
// Precondition: the protocols are well-formed and interface correctly.
pub(in crate::composition) fn explicit_composition(
    proto_info: &ProtoInfo,
) -> Option<(Graph, NodeId)> {
    let _span = tracing::info_span!("explicit_composition").entered();
    let protocols = proto_info
        .protocols
        .iter()
        .filter_map(|p| p.initial.map(|i| (p.graph.clone(), i)))
        .collect();

    combine_projs(protocols, gen_state_name)
}

pub fn to_swarm_json(graph: &Graph, initial: NodeId) -> SwarmProtocolType {
    let _span = tracing::info_span!("to_swarm_json").entered();
    let transition = |eref: EdgeReference<'_, SwarmLabel>| Transition {
        label: eref.weight().clone(),
        source: graph[eref.source()].state_name().clone(),
        target: graph[eref.target()].state_name().clone(),
    };

    SwarmProtocolType {
        initial: State::clone(graph[initial].state_name()),
        transitions: graph.edge_references().map(transition).collect(),
    }
}
