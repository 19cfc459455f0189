//! Builds the AC equation system of a network.
//!
//! Every bus gets an active and a reactive balance equation. The slack bus
//! fixes its angle instead of its active balance, and voltage controlled
//! buses fix their voltage instead of the reactive balance of their
//! controllers. Branch, phase and transformer controls add their own
//! equations, created inactive when they only come into play after an
//! outer loop decision.

use tracing::debug;

use super::parameters::AcEquationSystemCreationParameters;
use super::terms::{
    BranchSide, ClosedBranchCurrentMagnitudeTerm, ClosedBranchFlowTerm, FlowKind, OpenBranchFlowTerm,
    ShuntReactiveTerm, StaticVarCompensatorVoltageTerm,
};
use crate::basic::equations::{
    DistributionData, EquationData, EquationKey, EquationSystem, EquationTerm, EquationType, ScaledTerm,
    VariableSet, VariableTargetTerm, VariableType,
};
use crate::basic::error::{LoadFlowError, Result};
use crate::basic::network::{LfBranch, LfBus, LfNetwork, PhaseControlUnit, Subject};

struct Builder<'a> {
    network: &'a LfNetwork,
    variable_set: &'a mut VariableSet,
    parameters: &'a AcEquationSystemCreationParameters,
    system: EquationSystem,
    /// Branch numbers connected to each bus.
    adjacency: Vec<Vec<usize>>,
}

/// Creates the equations and terms for `network`, registering the variables
/// in `variable_set`.
pub fn create_ac_equation_system(
    network: &LfNetwork,
    variable_set: &mut VariableSet,
    parameters: &AcEquationSystemCreationParameters,
) -> Result<EquationSystem> {
    let mut adjacency = vec![Vec::new(); network.buses().len()];
    for branch in network.branches().iter().filter(|b| !b.disabled) {
        let (bus1, bus2) = connected_buses(network, branch);
        for bus in [bus1, bus2].into_iter().flatten() {
            adjacency[bus].push(branch.num);
        }
    }
    let mut builder = Builder {
        network,
        variable_set,
        parameters,
        system: EquationSystem::with_term_index(),
        adjacency,
    };
    builder.create_bus_equations()?;
    builder.create_branch_equations()?;
    builder.create_voltage_control_equations()?;
    builder.create_transformer_voltage_control_equations()?;
    debug!(
        network = network.num,
        equations = builder.system.equations().count(),
        variables = builder.variable_set.len(),
        "AC equation system created"
    );
    Ok(builder.system)
}

fn connected_buses(network: &LfNetwork, branch: &LfBranch) -> (Option<usize>, Option<usize>) {
    let enabled = |bus: Option<usize>| {
        bus.filter(|&b| network.bus(b).map(|bus| !bus.disabled).unwrap_or(false))
    };
    (enabled(branch.bus1), enabled(branch.bus2))
}

impl Builder<'_> {
    fn deriv_a1(&self, branch: &LfBranch) -> bool {
        self.parameters.phase_control && branch.is_phase_controlled()
    }

    fn deriv_r1(&self, branch: &LfBranch) -> bool {
        self.parameters.transformer_voltage_control && branch.is_voltage_controller()
    }

    fn add_target_term(&mut self, key: EquationKey, num: usize, ty: VariableType, subject: Subject) -> Result<()> {
        let variable = self.variable_set.get_or_create(num, ty);
        self.system.add_term(key, VariableTargetTerm::new(subject, variable))?;
        Ok(())
    }

    fn create_bus_equations(&mut self) -> Result<()> {
        let network = self.network;
        for bus in network.buses().iter().filter(|b| !b.disabled) {
            let p = self.system.create_equation(bus.num, EquationType::BusP);
            let q = self.system.create_equation(bus.num, EquationType::BusQ);
            if bus.slack {
                let phi = self.system.create_equation(bus.num, EquationType::BusPhi);
                self.add_target_term(phi, bus.num, VariableType::BusPhi, Subject::bus(bus.num))?;
                self.system.set_equation_active(p, false)?;
            }
            if bus.shunt_b != 0.0 {
                let term = ShuntReactiveTerm::new(bus, self.variable_set);
                self.system.add_term(q, term)?;
            }
            if bus.voltage_controller_enabled {
                let controlled = bus.controlled_bus.unwrap_or(bus.num);
                if controlled != bus.num && !self.parameters.voltage_remote_control {
                    return Err(LoadFlowError::Configuration(format!(
                        "bus '{}' controls the voltage of bus {} but remote voltage control is disabled",
                        bus.id, controlled
                    )));
                }
                self.system.set_equation_active(q, false)?;
            }
        }
        Ok(())
    }

    fn create_branch_equations(&mut self) -> Result<()> {
        let network = self.network;
        for branch in network.branches().iter().filter(|b| !b.disabled) {
            match connected_buses(network, branch) {
                (Some(bus1), Some(bus2)) if branch.pi_model.is_zero_impedance() => {
                    self.create_zero_impedance_equations(branch, bus1, bus2)?;
                }
                (Some(bus1), Some(bus2)) => self.create_closed_branch_equations(branch, bus1, bus2)?,
                (Some(bus1), None) => {
                    for (kind, ty) in [(FlowKind::Active, EquationType::BusP), (FlowKind::Reactive, EquationType::BusQ)] {
                        let term = OpenBranchFlowTerm::new(branch, bus1, BranchSide::Two, kind, self.variable_set);
                        let key = self.system.create_equation(bus1, ty);
                        self.system.add_term(key, term)?;
                    }
                }
                (None, Some(bus2)) => {
                    for (kind, ty) in [(FlowKind::Active, EquationType::BusP), (FlowKind::Reactive, EquationType::BusQ)] {
                        let term = OpenBranchFlowTerm::new(branch, bus2, BranchSide::One, kind, self.variable_set);
                        let key = self.system.create_equation(bus2, ty);
                        self.system.add_term(key, term)?;
                    }
                }
                (None, None) => {}
            }
        }
        Ok(())
    }

    /// A zero impedance branch carries its flows through dummy variables and
    /// ties the voltages of both ends.
    fn create_zero_impedance_equations(&mut self, branch: &LfBranch, bus1: usize, bus2: usize) -> Result<()> {
        let subject = Subject::branch(branch.num);
        for (var_ty, eq_ty) in [(VariableType::DummyP, EquationType::BusP), (VariableType::DummyQ, EquationType::BusQ)] {
            let dummy = self.variable_set.get_or_create(branch.num, var_ty);
            let key1 = self.system.create_equation(bus1, eq_ty);
            self.system.add_term(key1, VariableTargetTerm::new(subject, dummy))?;
            let key2 = self.system.create_equation(bus2, eq_ty);
            self.system
                .add_term(key2, ScaledTerm::minus(Box::new(VariableTargetTerm::new(subject, dummy))))?;
        }
        for (var_ty, eq_ty) in [(VariableType::BusV, EquationType::ZeroV), (VariableType::BusPhi, EquationType::ZeroPhi)] {
            let key = self.system.create_equation(branch.num, eq_ty);
            let x1 = self.variable_set.get_or_create(bus1, var_ty);
            let x2 = self.variable_set.get_or_create(bus2, var_ty);
            self.system.add_term(key, VariableTargetTerm::new(subject, x1))?;
            self.system
                .add_term(key, ScaledTerm::minus(Box::new(VariableTargetTerm::new(subject, x2))))?;
        }
        Ok(())
    }

    fn create_closed_branch_equations(&mut self, branch: &LfBranch, bus1: usize, bus2: usize) -> Result<()> {
        let deriv_a1 = self.deriv_a1(branch);
        let deriv_r1 = self.deriv_r1(branch);
        for (side, bus) in [(BranchSide::One, bus1), (BranchSide::Two, bus2)] {
            for (kind, ty) in [(FlowKind::Active, EquationType::BusP), (FlowKind::Reactive, EquationType::BusQ)] {
                let term = ClosedBranchFlowTerm::new(branch, bus1, bus2, side, kind, self.variable_set, deriv_a1, deriv_r1);
                let key = self.system.create_equation(bus, ty);
                self.system.add_term(key, term)?;
            }
        }

        let subject = Subject::branch(branch.num);
        if deriv_a1 {
            let a1 = self.system.create_equation(branch.num, EquationType::BranchAlpha1);
            self.add_target_term(a1, branch.num, VariableType::BranchAlpha1, subject)?;
            self.system.set_equation_active(a1, false)?;

            let control = branch.phase_control.as_ref().ok_or_else(|| {
                LoadFlowError::Structural(format!("branch '{}' is not phase controlled", branch.id))
            })?;
            match control.unit {
                PhaseControlUnit::Mw => {
                    let key = self.system.create_equation(branch.num, EquationType::BranchP);
                    let term = ClosedBranchFlowTerm::new(
                        branch,
                        bus1,
                        bus2,
                        BranchSide::One,
                        FlowKind::Active,
                        self.variable_set,
                        deriv_a1,
                        deriv_r1,
                    );
                    self.system.add_term(key, term)?;
                }
                PhaseControlUnit::A => {
                    let key = self.system.create_equation(branch.num, EquationType::BranchI);
                    let term = ClosedBranchCurrentMagnitudeTerm::new(branch, bus1, bus2, self.variable_set, deriv_a1, deriv_r1);
                    self.system.add_term(key, term)?;
                }
            }
        }
        if deriv_r1 {
            let r1 = self.system.create_equation(branch.num, EquationType::BranchRho1);
            self.add_target_term(r1, branch.num, VariableType::BranchRho1, subject)?;
            self.system.set_equation_active(r1, false)?;
        }
        Ok(())
    }

    /// Fresh reactive flow terms leaving `bus`, for equations that need the
    /// reactive balance of a bus on their own.
    fn reactive_flow_terms(&mut self, bus: &LfBus) -> Vec<Box<dyn EquationTerm>> {
        let network = self.network;
        let mut terms: Vec<Box<dyn EquationTerm>> = Vec::new();
        for &num in &self.adjacency[bus.num] {
            let branch = &network.branches()[num];
            let deriv_a1 = self.deriv_a1(branch);
            let deriv_r1 = self.deriv_r1(branch);
            match connected_buses(network, branch) {
                (Some(bus1), Some(bus2)) if branch.pi_model.is_zero_impedance() => {
                    let dummy = self.variable_set.get_or_create(num, VariableType::DummyQ);
                    let term = VariableTargetTerm::new(Subject::branch(num), dummy);
                    if bus1 == bus.num {
                        terms.push(Box::new(term.clone()));
                    }
                    if bus2 == bus.num {
                        terms.push(Box::new(ScaledTerm::minus(Box::new(term))));
                    }
                }
                (Some(bus1), Some(bus2)) => {
                    for (side, side_bus) in [(BranchSide::One, bus1), (BranchSide::Two, bus2)] {
                        if side_bus == bus.num {
                            terms.push(Box::new(ClosedBranchFlowTerm::new(
                                branch,
                                bus1,
                                bus2,
                                side,
                                FlowKind::Reactive,
                                self.variable_set,
                                deriv_a1,
                                deriv_r1,
                            )));
                        }
                    }
                }
                (Some(bus1), None) => terms.push(Box::new(OpenBranchFlowTerm::new(
                    branch,
                    bus1,
                    BranchSide::Two,
                    FlowKind::Reactive,
                    self.variable_set,
                ))),
                (None, Some(bus2)) => terms.push(Box::new(OpenBranchFlowTerm::new(
                    branch,
                    bus2,
                    BranchSide::One,
                    FlowKind::Reactive,
                    self.variable_set,
                ))),
                (None, None) => {}
            }
        }
        if bus.shunt_b != 0.0 {
            terms.push(Box::new(ShuntReactiveTerm::new(bus, self.variable_set)));
        }
        terms
    }

    fn create_voltage_control_equations(&mut self) -> Result<()> {
        let network = self.network;
        for bus in network.buses().iter().filter(|b| !b.disabled) {
            let Some(control) = &bus.voltage_control else {
                continue;
            };
            let mut controllers = Vec::new();
            for &num in &control.controllers {
                let controller = network.bus(num)?;
                if controller.voltage_controller_enabled && !controller.disabled {
                    controllers.push(controller);
                }
            }
            if controllers.is_empty() {
                continue;
            }
            if bus.is_transformer_voltage_controlled() && self.parameters.transformer_voltage_control {
                return Err(LoadFlowError::Configuration(format!(
                    "bus '{}' is voltage controlled by both generators and transformers",
                    bus.id
                )));
            }

            let v = self.system.create_equation(bus.num, EquationType::BusV);
            if self.parameters.use_bus_pvlq && !bus.static_var_compensators.is_empty() {
                let reactive_terms = self.reactive_flow_terms(bus);
                let term = StaticVarCompensatorVoltageTerm::new(bus, reactive_terms, self.variable_set)?;
                self.system.add_term(v, term)?;
            } else {
                self.add_target_term(v, bus.num, VariableType::BusV, Subject::bus(bus.num))?;
            }

            if controllers.len() > 1 {
                self.create_reactive_power_distribution_equations(&controllers)?;
            }
        }
        Ok(())
    }

    /// Controllers of a shared voltage control produce reactive power in
    /// proportion to their reactive range: one `ZeroQ` equation per
    /// controller after the first.
    fn create_reactive_power_distribution_equations(&mut self, controllers: &[&LfBus]) -> Result<()> {
        let first = controllers[0];
        let range = |bus: &LfBus| {
            let k = bus.max_q() - bus.min_q();
            (k.is_finite() && k > 0.0).then_some(k)
        };
        for &controller in &controllers[1..] {
            let c = match (range(first), range(controller)) {
                (Some(k_first), Some(k)) => k_first / k,
                _ => 1.0,
            };
            let key = self.system.create_equation(controller.num, EquationType::ZeroQ);
            for term in self.reactive_flow_terms(controller) {
                self.system.add_boxed_term(key, Box::new(ScaledTerm::new(term, c)))?;
            }
            for term in self.reactive_flow_terms(first) {
                self.system.add_boxed_term(key, Box::new(ScaledTerm::minus(term)))?;
            }
            self.system.set_equation_data(
                key,
                EquationData::Distribution(DistributionData {
                    first_controller_element_num: first.num,
                    c,
                }),
            )?;
        }
        Ok(())
    }

    fn create_transformer_voltage_control_equations(&mut self) -> Result<()> {
        if !self.parameters.transformer_voltage_control {
            return Ok(());
        }
        let network = self.network;
        for bus in network.buses().iter().filter(|b| !b.disabled) {
            let Some(control) = &bus.discrete_voltage_control else {
                continue;
            };
            let mut controllers = Vec::new();
            for &num in &control.controllers {
                let branch = network.branch(num)?;
                if self.deriv_r1(branch) && !branch.disabled {
                    controllers.push(num);
                }
            }
            let Some((&first, others)) = controllers.split_first() else {
                continue;
            };
            let v = self.system.create_equation(bus.num, EquationType::BusV);
            self.add_target_term(v, bus.num, VariableType::BusV, Subject::bus(bus.num))?;
            for &other in others {
                let subject = Subject::branch(other);
                let key = self.system.create_equation(other, EquationType::ZeroRho1);
                let r1 = self.variable_set.get_or_create(other, VariableType::BranchRho1);
                let r1_first = self.variable_set.get_or_create(first, VariableType::BranchRho1);
                self.system.add_term(key, VariableTargetTerm::new(subject, r1))?;
                self.system
                    .add_term(key, ScaledTerm::minus(Box::new(VariableTargetTerm::new(subject, r1_first))))?;
                self.system.set_equation_data(
                    key,
                    EquationData::Distribution(DistributionData {
                        first_controller_element_num: first,
                        c: 1.0,
                    }),
                )?;
            }
        }
        Ok(())
    }
}
