use petgraph::visit::GraphBase;
use std::collections::{BTreeMap, BTreeSet};
use tsify::declare;

pub mod artifact;
pub mod composition;
mod error;
pub mod machine;
pub mod runtime;
pub mod types;
pub mod wasm;

pub use error::{Error, Result};
use types::{EventType, MachineLabel, ProtocolType, Role, State, SwarmLabel};

#[declare]
pub type Subscriptions = BTreeMap<Role, BTreeSet<EventType>>;
#[declare]
pub type SwarmProtocolType = ProtocolType<SwarmLabel>;
#[declare]
pub type MachineType = ProtocolType<MachineLabel>;

pub type Graph = petgraph::Graph<State, SwarmLabel>;
pub type MachineGraph = petgraph::Graph<State, MachineLabel>;
pub type NodeId = <petgraph::Graph<(), ()> as GraphBase>::NodeId;
pub type EdgeId = <petgraph::Graph<(), ()> as GraphBase>::EdgeId;

pub(crate) trait MapVec<T> {
    fn map<U>(self, f: impl Fn(T) -> U) -> Vec<U>;
}
impl<T> MapVec<T> for Vec<T> {
    fn map<U>(self, f: impl Fn(T) -> U) -> Vec<U> {
        self.into_iter().map(f).collect()
    }
}
