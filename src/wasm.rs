use wasm_bindgen::prelude::*;

use crate::{
    composition::{
        self,
        composition_types::{AdaptedMachine, Granularity, InterfacingProtocols, Projection},
    },
    types::{CheckResult, DataResult, Role},
    MachineType, Subscriptions, SwarmProtocolType,
};

macro_rules! deserialize_subs {
    ($subs:expr, $err_exp:expr) => {
        match serde_json::from_str::<Subscriptions>(&$subs) {
            Ok(p) => p,
            Err(e) => return $err_exp(e),
        }
    };
}

fn parse_error(e: serde_json::Error) -> Vec<String> {
    vec![format!("parsing subscriptions: {}", e)]
}

#[wasm_bindgen]
pub fn check_composed_swarm(protos: InterfacingProtocols, subs: String) -> CheckResult {
    let subs = deserialize_subs!(subs, |e| CheckResult::ERROR {
        errors: parse_error(e)
    });
    composition::check_composed_swarm(protos, &subs).into()
}

#[wasm_bindgen]
pub fn exact_well_formed_sub(
    protos: InterfacingProtocols,
    subs: String,
) -> DataResult<Subscriptions> {
    let subs = deserialize_subs!(subs, |e| DataResult::ERROR {
        errors: parse_error(e)
    });
    composition::exact_well_formed_sub(protos, &subs).into()
}

#[wasm_bindgen]
pub fn overapproximated_well_formed_sub(
    protos: InterfacingProtocols,
    subs: String,
    granularity: Granularity,
) -> DataResult<Subscriptions> {
    let subs = deserialize_subs!(subs, |e| DataResult::ERROR {
        errors: parse_error(e)
    });
    composition::overapproximated_well_formed_sub(protos, &subs, granularity).into()
}

#[wasm_bindgen]
pub fn compose_protocols(protos: InterfacingProtocols) -> DataResult<SwarmProtocolType> {
    composition::compose_protocols(protos).into()
}

#[wasm_bindgen]
pub fn project(
    protos: InterfacingProtocols,
    subs: String,
    role: Role,
    minimize: bool,
) -> DataResult<Projection> {
    let subs = deserialize_subs!(subs, |e| DataResult::ERROR {
        errors: parse_error(e)
    });
    composition::project(protos, &subs, role, minimize).into()
}

#[wasm_bindgen]
pub fn check_composed_projection(
    protos: InterfacingProtocols,
    subs: String,
    role: Role,
    machine: MachineType,
) -> CheckResult {
    let subs = deserialize_subs!(subs, |e| CheckResult::ERROR {
        errors: parse_error(e)
    });
    composition::check_composed_projection(protos, &subs, role, &machine).into()
}

#[wasm_bindgen]
pub fn adapt_machine(
    role: Role,
    protos: InterfacingProtocols,
    k: usize,
    subs: String,
    machine: MachineType,
    track_branches: bool,
) -> DataResult<AdaptedMachine> {
    let subs = deserialize_subs!(subs, |e| DataResult::ERROR {
        errors: parse_error(e)
    });
    composition::adapt_machine(role, protos, k, &subs, &machine, track_branches).into()
}
