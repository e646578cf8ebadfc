use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tsify::{declare, Tsify};

use crate::{
    composition::composition_swarm::Error,
    types::{Command, EventType, MachineLabel, Role, State, SwarmLabel},
    Graph, MachineType, Subscriptions,
};

use super::{NodeId, SwarmProtocolType};

pub type RoleEventMap = BTreeMap<Role, BTreeSet<SwarmLabel>>;

pub type UnordEventPair = BTreeSet<EventType>;

pub fn unord_event_pair(a: EventType, b: EventType) -> UnordEventPair {
    BTreeSet::from([a, b])
}

#[derive(Debug, Clone)]
pub struct ProtoStruct {
    pub graph: Graph,
    pub initial: Option<NodeId>,
    pub errors: Vec<Error>,
    pub roles: BTreeSet<Role>,
}

impl ProtoStruct {
    pub fn new(
        graph: Graph,
        initial: Option<NodeId>,
        errors: Vec<Error>,
        roles: BTreeSet<Role>,
    ) -> Self {
        Self {
            graph,
            initial,
            errors,
            roles,
        }
    }

    pub fn no_errors(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Everything the well-formedness check and the subscription synthesis need to know about
/// a (possibly composed) protocol, computed without building the explicit composition.
#[derive(Debug, Clone)]
pub struct ProtoInfo {
    pub protocols: Vec<ProtoStruct>,
    pub role_event_map: RoleEventMap,
    pub concurrent_events: BTreeSet<UnordEventPair>,
    pub branching_events: Vec<BTreeSet<EventType>>,
    pub joining_events: BTreeMap<EventType, BTreeSet<EventType>>,
    pub immediately_pre: BTreeMap<EventType, BTreeSet<EventType>>,
    pub succeeding_events: BTreeMap<EventType, BTreeSet<EventType>>,
    pub interfacing_events: BTreeSet<EventType>,
    // event types that can not lead to a terminal state
    pub infinitely_looping_events: BTreeSet<EventType>,
    pub interface_errors: Vec<Error>,
}

impl ProtoInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        protocols: Vec<ProtoStruct>,
        role_event_map: RoleEventMap,
        concurrent_events: BTreeSet<UnordEventPair>,
        branching_events: Vec<BTreeSet<EventType>>,
        joining_events: BTreeMap<EventType, BTreeSet<EventType>>,
        immediately_pre: BTreeMap<EventType, BTreeSet<EventType>>,
        succeeding_events: BTreeMap<EventType, BTreeSet<EventType>>,
        interfacing_events: BTreeSet<EventType>,
        infinitely_looping_events: BTreeSet<EventType>,
        interface_errors: Vec<Error>,
    ) -> Self {
        Self {
            protocols,
            role_event_map,
            concurrent_events,
            branching_events,
            joining_events,
            immediately_pre,
            succeeding_events,
            interfacing_events,
            infinitely_looping_events,
            interface_errors,
        }
    }

    pub fn new_only_proto(protocols: Vec<ProtoStruct>) -> Self {
        Self {
            protocols,
            role_event_map: BTreeMap::new(),
            concurrent_events: BTreeSet::new(),
            branching_events: Vec::new(),
            joining_events: BTreeMap::new(),
            immediately_pre: BTreeMap::new(),
            succeeding_events: BTreeMap::new(),
            interfacing_events: BTreeSet::new(),
            infinitely_looping_events: BTreeSet::new(),
            interface_errors: Vec::new(),
        }
    }

    pub fn get_ith_proto(&self, i: usize) -> Option<ProtoStruct> {
        self.protocols.get(i).cloned()
    }

    pub fn no_errors(&self) -> bool {
        self.protocols.iter().all(|p| p.no_errors()) && self.interface_errors.is_empty()
    }
}

pub fn get_branching_joining_proto_info(proto_info: &ProtoInfo) -> BTreeSet<EventType> {
    proto_info
        .branching_events
        .iter()
        .flatten()
        .cloned()
        .chain(proto_info.joining_events.keys().cloned())
        .collect()
}

#[derive(Tsify, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct InterfacingProtocols(pub Vec<SwarmProtocolType>);

/// How coarsely the overapproximated subscription is computed.
///
/// `Fine`, `Medium` and `Coarse` add increasingly more event types to the subscription in
/// one pass. `TwoStep` adds branching and joining event types first and then runs the exact
/// fixpoint on top of that.
#[derive(Tsify, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub enum Granularity {
    Fine,
    Medium,
    Coarse,
    #[default]
    TwoStep,
}

#[declare]
pub type BranchMap = BTreeMap<EventType, Vec<EventType>>;
#[declare]
pub type SpecialEventTypes = BTreeSet<EventType>;
#[declare]
pub type ProjToMachineStates = BTreeMap<State, Vec<State>>;
#[declare]
pub type BranchStates = BTreeMap<State, BranchState>;

/// Whether a state of a projection or adapted machine is known to correspond to a single
/// state of the role's own machine.
#[derive(Tsify, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[serde(tag = "tag")]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub enum BranchState {
    Resolved {
        state: State,
    },
    #[serde(rename_all = "camelCase")]
    Unresolved {
        candidates: BTreeSet<State>,
        resolving_event_types: BTreeSet<EventType>,
    },
}

impl BranchState {
    pub fn is_resolved(&self) -> bool {
        matches!(self, BranchState::Resolved { .. })
    }
}

#[derive(Tsify, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct Projection {
    pub role: Role,
    pub machine: MachineType,
    pub branches: BranchMap,
    pub special_event_types: SpecialEventTypes,
    pub branch_states: BranchStates,
}

/// A role's machine adjusted to run as part of a composition.
#[derive(Tsify, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct AdaptedMachine {
    pub role: Role,
    pub protocol_index: usize,
    pub subscription: Subscriptions,
    pub machine: MachineType,
    pub branches: BranchMap,
    pub special_event_types: SpecialEventTypes,
    pub proj_to_machine_states: ProjToMachineStates,
    pub branch_states: BranchStates,
}

/* Used when combining machines and protocols */
pub trait EventLabel: Clone + Ord {
    fn get_event_type(&self) -> EventType;
}

impl EventLabel for SwarmLabel {
    fn get_event_type(&self) -> EventType {
        self.log_type
            .first()
            .cloned()
            .unwrap_or_else(|| EventType::new(""))
    }
}

impl EventLabel for MachineLabel {
    fn get_event_type(&self) -> EventType {
        match self {
            Self::Execute { log_type, .. } => log_type
                .first()
                .cloned()
                .unwrap_or_else(|| EventType::new("")),
            Self::Input { event_type } => event_type.clone(),
        }
    }
}

pub trait ProtoLabel {
    fn get_labels(&self) -> BTreeSet<(Command, EventType, Role)>;
    fn get_roles(&self) -> BTreeSet<Role>;
    fn get_event_types(&self) -> BTreeSet<EventType>;
}

impl ProtoLabel for Graph {
    fn get_labels(&self) -> BTreeSet<(Command, EventType, Role)> {
        self.edge_references()
            .map(|e| {
                (
                    e.weight().cmd.clone(),
                    e.weight().get_event_type(),
                    e.weight().role.clone(),
                )
            })
            .collect()
    }

    fn get_roles(&self) -> BTreeSet<Role> {
        self.get_labels()
            .into_iter()
            .map(|(_, _, role)| role)
            .collect()
    }

    fn get_event_types(&self) -> BTreeSet<EventType> {
        self.get_labels()
            .into_iter()
            .map(|(_, event_type, _)| event_type)
            .collect()
    }
}

impl ProtoLabel for ProtoInfo {
    fn get_labels(&self) -> BTreeSet<(Command, EventType, Role)> {
        self.role_event_map
            .values()
            .flat_map(|role_info| {
                role_info
                    .iter()
                    .map(|sl| (sl.cmd.clone(), sl.get_event_type(), sl.role.clone()))
            })
            .collect()
    }

    fn get_roles(&self) -> BTreeSet<Role> {
        self.role_event_map.keys().cloned().collect()
    }

    fn get_event_types(&self) -> BTreeSet<EventType> {
        self.get_labels()
            .into_iter()
            .map(|(_, event_type, _)| event_type)
            .collect()
    }
}
