//! Small reference networks, in per unit on a 100 MVA base.

use crate::basic::error::Result;
use crate::basic::network::{
    DiscretePhaseControl, LfBranch, LfBus, LfGenerator, LfNetwork, LfStaticVarCompensator, PhaseControlMode,
    PhaseControlUnit, PiModel,
};

fn slack_bus(id: &str) -> LfBus {
    LfBus::new(id).with_slack().with_generator(
        LfGenerator::new(format!("{}-gen", id), 0.0)
            .with_p_limit(0.0, 5.0)
            .with_voltage_regulation(),
    )
}

fn add_line(network: &mut LfNetwork, id: &str, bus1: usize, bus2: usize, r: f64, x: f64) -> usize {
    network.add_branch(LfBranch::new(id, bus1, bus2, PiModel::line(r, x)))
}

/// Slack at 1 p.u. feeding a 100 MW load through a lossless `x = 0.1` line.
///
/// The load bus voltage has a closed form: `v = cos(δ)` and `φ = -δ` with
/// `δ = asin(0.2) / 2`.
pub fn two_bus_network() -> Result<LfNetwork> {
    let mut network = LfNetwork::new(0);
    let slack = network.add_bus(slack_bus("b0"));
    let load = network.add_bus(LfBus::new("b1").with_load(1.0, 0.0));
    add_line(&mut network, "l01", slack, load, 0.0, 0.1);
    network.set_voltage_control(slack, &[slack], 1.0)?;
    Ok(network)
}

/// Meshed three bus network with a generator bus whose reactive range is
/// too narrow to hold its 1.05 p.u. target.
pub fn three_bus_pv_network() -> Result<LfNetwork> {
    let mut network = LfNetwork::new(0);
    let slack = network.add_bus(slack_bus("b0"));
    let pv = network.add_bus(
        LfBus::new("b1").with_generator(
            LfGenerator::new("g1", 0.5)
                .with_q_limit(-0.2, 0.2)
                .with_voltage_regulation(),
        ),
    );
    let load = network.add_bus(LfBus::new("b2").with_load(1.0, 0.5));
    add_line(&mut network, "l01", slack, pv, 0.01, 0.1);
    add_line(&mut network, "l12", pv, load, 0.01, 0.1);
    add_line(&mut network, "l02", slack, load, 0.01, 0.1);
    network.set_voltage_control(slack, &[slack], 1.0)?;
    network.set_voltage_control(pv, &[pv], 1.05)?;
    Ok(network)
}

/// Phase shifting transformer in parallel with a line, asked to carry 70 MW
/// of a 100 MW transfer.
pub fn phase_shifter_network() -> Result<LfNetwork> {
    let mut network = LfNetwork::new(0);
    let slack = network.add_bus(slack_bus("b0"));
    let load = network.add_bus(LfBus::new("b1").with_load(1.0, 0.2));
    add_line(&mut network, "l01", slack, load, 0.0, 0.1);
    let mut ps = LfBranch::new("ps01", slack, load, PiModel::line(0.0, 0.1));
    ps.phase_control = Some(DiscretePhaseControl {
        mode: PhaseControlMode::Controller,
        unit: PhaseControlUnit::Mw,
        target_value: 0.7,
        alpha_taps: (-10..=10).map(|i| i as f64 * 0.02).collect(),
    });
    network.add_branch(ps);
    network.set_voltage_control(slack, &[slack], 1.0)?;
    Ok(network)
}

/// Two parallel tap changers holding the voltage of their low voltage bus.
pub fn transformer_voltage_control_network() -> Result<LfNetwork> {
    let mut network = LfNetwork::new(0);
    let slack = network.add_bus(slack_bus("b0"));
    let hv = network.add_bus(LfBus::new("b1"));
    let lv = network.add_bus(LfBus::new("b2").with_load(0.6, 0.2));
    add_line(&mut network, "l01", slack, hv, 0.01, 0.1);
    let t1 = add_line(&mut network, "t12a", hv, lv, 0.0, 0.2);
    let t2 = add_line(&mut network, "t12b", hv, lv, 0.0, 0.2);
    let ratio_taps = [0.95, 0.9625, 0.975, 0.9875, 1.0, 1.0125, 1.025, 1.0375, 1.05];
    network.set_voltage_control(slack, &[slack], 1.0)?;
    network.set_transformer_voltage_control(lv, &[t1, t2], 1.0, &ratio_taps)?;
    Ok(network)
}

/// Two generator buses sharing the remote control of a load bus voltage.
/// The first one has twice the reactive range of the second.
pub fn shared_voltage_control_network() -> Result<LfNetwork> {
    let mut network = LfNetwork::new(0);
    let slack = network.add_bus(slack_bus("b0"));
    let g1 = network.add_bus(
        LfBus::new("b1").with_generator(LfGenerator::new("g1", 0.3).with_q_limit(-1.0, 1.0).with_voltage_regulation()),
    );
    let g2 = network.add_bus(
        LfBus::new("b2").with_generator(LfGenerator::new("g2", 0.3).with_q_limit(-0.5, 0.5).with_voltage_regulation()),
    );
    let load = network.add_bus(LfBus::new("b3").with_load(1.0, 0.4));
    add_line(&mut network, "l03", slack, load, 0.01, 0.1);
    add_line(&mut network, "l13", g1, load, 0.01, 0.05);
    add_line(&mut network, "l23", g2, load, 0.01, 0.05);
    add_line(&mut network, "l01", slack, g1, 0.01, 0.1);
    network.set_voltage_control(slack, &[slack], 1.0)?;
    network.set_voltage_control(load, &[g1, g2], 1.02)?;
    Ok(network)
}

/// Load bus holding its voltage with a static var compensator whose output
/// follows a 0.01 p.u. slope.
pub fn svc_network() -> Result<LfNetwork> {
    let mut network = LfNetwork::new(0);
    let slack = network.add_bus(slack_bus("b0"));
    let svc = network.add_bus(LfBus::new("b1").with_load(0.5, 0.3).with_static_var_compensator(
        LfStaticVarCompensator {
            id: "svc1".to_owned(),
            slope: 0.01,
            voltage_regulator_on: true,
        },
    ));
    add_line(&mut network, "l01", slack, svc, 0.01, 0.1);
    network.set_voltage_control(slack, &[slack], 1.0)?;
    network.set_voltage_control(svc, &[svc], 1.0)?;
    Ok(network)
}

/// A load bus tied to its neighbour through a zero impedance branch.
pub fn zero_impedance_network() -> Result<LfNetwork> {
    let mut network = LfNetwork::new(0);
    let slack = network.add_bus(slack_bus("b0"));
    let b1 = network.add_bus(LfBus::new("b1"));
    let b2 = network.add_bus(LfBus::new("b2").with_load(0.8, 0.2));
    add_line(&mut network, "l01", slack, b1, 0.01, 0.1);
    add_line(&mut network, "z12", b1, b2, 0.0, 0.0);
    network.set_voltage_control(slack, &[slack], 1.0)?;
    Ok(network)
}
