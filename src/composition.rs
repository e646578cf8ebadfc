use composition_machine::{equivalent, paths_from_event_types};
use composition_swarm::{explicit_composition, proto_info_to_error_report, swarms_to_proto_info};
use composition_types::{
    get_branching_joining_proto_info, AdaptedMachine, Granularity, InterfacingProtocols,
    Projection, ProtoInfo,
};

use crate::{
    machine::{self, to_graph, to_json_machine, LocalMachine},
    types::Role,
    Error, Graph, MapVec, NodeId, Result, Subscriptions, SwarmProtocolType,
};

mod composition_adaptation;
mod composition_machine;
mod composition_swarm;
pub mod composition_types;

fn checked_proto_info(protos: InterfacingProtocols) -> Result<ProtoInfo> {
    let proto_info = swarms_to_proto_info(protos);
    if !proto_info.no_errors() {
        return Err(proto_info_to_error_report(proto_info).into());
    }
    Ok(proto_info)
}

fn composed(proto_info: &ProtoInfo) -> Result<(Graph, NodeId)> {
    explicit_composition(proto_info)
        .ok_or_else(|| Error::MalformedProtocol(vec!["no protocols to compose".to_string()]))
}

/// Check that `subs` is a well-formed subscription for the composition of `protos`.
pub fn check_composed_swarm(protos: InterfacingProtocols, subs: &Subscriptions) -> Result<()> {
    let error_report = composition_swarm::check(protos, subs);
    if error_report.is_empty() {
        Ok(())
    } else {
        Err(error_report.into())
    }
}

/// The smallest well-formed subscription containing `subs`.
pub fn exact_well_formed_sub(
    protos: InterfacingProtocols,
    subs: &Subscriptions,
) -> Result<Subscriptions> {
    let subscription = composition_swarm::exact_well_formed_sub(protos.clone(), subs)?;
    check_composed_swarm(protos, &subscription)?;
    Ok(subscription)
}

/// A well-formed subscription containing the exact one, computed per component protocol.
/// The expanded composition is only consulted for loops it can no longer leave.
pub fn overapproximated_well_formed_sub(
    protos: InterfacingProtocols,
    subs: &Subscriptions,
    granularity: Granularity,
) -> Result<Subscriptions> {
    Ok(composition_swarm::overapprox_well_formed_sub(
        protos,
        subs,
        granularity,
    )?)
}

pub fn compose_protocols(protos: InterfacingProtocols) -> Result<SwarmProtocolType> {
    match composition_swarm::compose_protocols(protos)? {
        Some((graph, initial)) => Ok(composition_swarm::to_swarm_json(&graph, initial)),
        None => Err(Error::MalformedProtocol(vec![
            "no protocols to compose".to_string(),
        ])),
    }
}

/// Project the composition of `protos` onto `role`.
pub fn project(
    protos: InterfacingProtocols,
    subs: &Subscriptions,
    role: Role,
    minimize: bool,
) -> Result<Projection> {
    let _span = tracing::info_span!("project_composition", %role).entered();
    let proto_info = checked_proto_info(protos)?;
    let (graph, initial) = composed(&proto_info)?;
    let (proj, proj_initial, branch_states) =
        composition_machine::project(&graph, initial, subs, role.clone(), minimize);

    Ok(Projection {
        role,
        machine: to_json_machine(&proj, proj_initial),
        branches: paths_from_event_types(&proj, &proto_info),
        special_event_types: get_branching_joining_proto_info(&proto_info),
        branch_states,
    })
}

/// Check `machine` against the minimized projection of the composition onto `role`.
pub fn check_composed_projection<M: LocalMachine + ?Sized>(
    protos: InterfacingProtocols,
    subs: &Subscriptions,
    role: Role,
    machine: &M,
) -> Result<()> {
    let _span = tracing::info_span!("check_composed_projection", %role).entered();
    let proto_info = checked_proto_info(protos)?;
    let errors = machine.validate();
    if !errors.is_empty() {
        return Err(Error::NonConformant(errors));
    }

    let (graph, initial) = composed(&proto_info)?;
    let (proj, proj_initial, _) = composition_machine::project(&graph, initial, subs, role, true);
    let (m, m_initial) = to_graph(machine);
    let errors =
        equivalent(&proj, proj_initial, &m, m_initial).map(machine::Error::convert(&proj, &m));

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::NonConformant(errors))
    }
}

/// Adapt `machine`, written for `role` in protocol `k` of `protos`, to the whole composition.
pub fn adapt_machine<M: LocalMachine + ?Sized>(
    role: Role,
    protos: InterfacingProtocols,
    k: usize,
    subs: &Subscriptions,
    machine: &M,
    track_branches: bool,
) -> Result<AdaptedMachine> {
    let proto_info = checked_proto_info(protos)?;
    composition_adaptation::adapted_machine(&proto_info, subs, role, machine, k, track_branches)
}
