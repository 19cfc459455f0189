use std::collections::BTreeMap;

use tracing::{debug, info, trace};

use super::{OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::basic::equations::{EquationKey, EquationSystem, EquationType};
use crate::basic::error::Result;
use crate::basic::network::{BASE_MVA, LfBus, LfNetwork};

const DEFAULT_MAX_PQ_PV_SWITCH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReactiveLimitType {
    MinQ,
    MaxQ,
}

/// A controller bus held at one of its reactive limits.
#[derive(Debug, Clone, Copy)]
struct PqBus {
    limit_type: ReactiveLimitType,
    /// Reactive generation target before the switch.
    generation_target_q: f64,
}

/// Enforces the reactive limits of voltage controlling generators.
///
/// # Behavior:
/// - A controller bus whose reactive output leaves `[min_q, max_q]` stops
///   controlling voltage: its reactive balance equation comes back with the
///   violated limit as generation target, and the voltage equation of the
///   controlled bus is switched off.
/// - A bus switched this way goes back to voltage control once the voltage
///   of the controlled bus is on the feasible side of its target again, at
///   most `max_pq_pv_switch` times.
///
/// # Notes:
/// - The slack bus, controllers sharing a voltage control and buses without
///   a voltage regulating generator are not checked.
/// - Relies on `calculated_q`, refreshed by the engine after each converged run.
#[derive(Debug, Clone)]
pub struct ReactiveLimitsOuterLoop {
    max_pq_pv_switch: usize,
    pq_buses: BTreeMap<usize, PqBus>,
}

impl Default for ReactiveLimitsOuterLoop {
    fn default() -> Self {
        Self {
            max_pq_pv_switch: DEFAULT_MAX_PQ_PV_SWITCH,
            pq_buses: BTreeMap::new(),
        }
    }
}

fn controlled_bus(bus: &LfBus) -> usize {
    bus.controlled_bus.unwrap_or(bus.num)
}

fn is_shared_controller(network: &LfNetwork, bus: &LfBus) -> Result<bool> {
    let controlled = network.bus(controlled_bus(bus))?;
    Ok(controlled
        .voltage_control
        .as_ref()
        .is_some_and(|control| control.controllers.len() > 1))
}

/// Reactive power produced by the voltage regulating units of `bus`.
fn regulating_q(bus: &LfBus) -> f64 {
    bus.calculated_q + bus.load_target_q - bus.generation_target_q
}

fn switch_equations(system: &mut EquationSystem, bus: &LfBus, voltage_control: bool) -> Result<()> {
    system.set_equation_active(EquationKey::new(controlled_bus(bus), EquationType::BusV), voltage_control)?;
    system.set_equation_active(EquationKey::new(bus.num, EquationType::BusQ), !voltage_control)?;
    Ok(())
}

impl ReactiveLimitsOuterLoop {
    pub fn with_max_pq_pv_switch(mut self, max_pq_pv_switch: usize) -> Self {
        self.max_pq_pv_switch = max_pq_pv_switch;
        self
    }

    fn switch_pv_pq(&mut self, context: &mut OuterLoopContext<'_>) -> Result<bool> {
        let mut violations = Vec::new();
        for bus in context.network.buses() {
            if !bus.voltage_controller_enabled
                || bus.slack
                || bus.disabled
                || bus.calculated_q.is_nan()
                || !bus.has_voltage_regulating_generator()
            {
                continue;
            }
            if is_shared_controller(context.network, bus)? {
                continue;
            }
            let q = regulating_q(bus);
            if q < bus.min_q() {
                violations.push((bus.num, ReactiveLimitType::MinQ, bus.min_q()));
            } else if q > bus.max_q() {
                violations.push((bus.num, ReactiveLimitType::MaxQ, bus.max_q()));
            }
        }

        for &(num, limit_type, limit) in &violations {
            let bus = context.network.bus_mut(num)?;
            trace!(
                "bus '{}' reactive power {} MVar is out of its limits, switch to {:?}",
                bus.id,
                regulating_q(bus) * BASE_MVA,
                limit_type
            );
            self.pq_buses.insert(
                num,
                PqBus {
                    limit_type,
                    generation_target_q: bus.generation_target_q,
                },
            );
            bus.voltage_controller_enabled = false;
            bus.generation_target_q += limit;
            switch_equations(context.equation_system, bus, false)?;
        }
        if !violations.is_empty() {
            info!("{} buses switched PV -> PQ", violations.len());
        }
        Ok(!violations.is_empty())
    }

    fn switch_pq_pv(&mut self, context: &mut OuterLoopContext<'_>) -> Result<bool> {
        let mut recovered = Vec::new();
        for (&num, pq_bus) in &self.pq_buses {
            let bus = context.network.bus(num)?;
            if bus.voltage_controller_enabled {
                continue;
            }
            let controlled = context.network.bus(controlled_bus(bus))?;
            let Some(control) = &controlled.voltage_control else {
                continue;
            };
            let feasible = match pq_bus.limit_type {
                ReactiveLimitType::MaxQ => controlled.v > control.target_value,
                ReactiveLimitType::MinQ => controlled.v < control.target_value,
            };
            if !feasible {
                continue;
            }
            if bus.pq_pv_switch_count >= self.max_pq_pv_switch {
                debug!(
                    "bus '{}' cannot switch back to PV, {} switches already done",
                    bus.id, bus.pq_pv_switch_count
                );
                continue;
            }
            recovered.push(num);
        }

        for &num in &recovered {
            let Some(pq_bus) = self.pq_buses.remove(&num) else {
                continue;
            };
            let bus = context.network.bus_mut(num)?;
            trace!("bus '{}' voltage is back on the {:?} side, switch to PV", bus.id, pq_bus.limit_type);
            bus.voltage_controller_enabled = true;
            bus.generation_target_q = pq_bus.generation_target_q;
            bus.pq_pv_switch_count += 1;
            // unknown until the next converged run
            bus.calculated_q = f64::NAN;
            switch_equations(context.equation_system, bus, true)?;
        }
        if !recovered.is_empty() {
            info!("{} buses switched PQ -> PV", recovered.len());
        }
        Ok(!recovered.is_empty())
    }
}

impl OuterLoop for ReactiveLimitsOuterLoop {
    fn type_name(&self) -> &'static str {
        "Reactive limits"
    }

    fn check(&mut self, context: &mut OuterLoopContext<'_>) -> Result<OuterLoopStatus> {
        let recovered = self.switch_pq_pv(context)?;
        let switched = self.switch_pv_pq(context)?;
        if recovered || switched {
            Ok(OuterLoopStatus::Unstable)
        } else {
            Ok(OuterLoopStatus::Stable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::ac::create_ac_equation_system;
    use crate::basic::ac::nr::{NewtonRaphsonResult, NewtonRaphsonStatus};
    use crate::basic::ac::parameters::AcEquationSystemCreationParameters;
    use crate::basic::equations::VariableSet;
    use crate::basic::network::{LfBranch, LfGenerator, PiModel};

    fn network() -> LfNetwork {
        let mut network = LfNetwork::new(0);
        network.add_bus(
            LfBus::new("slack")
                .with_slack()
                .with_generator(LfGenerator::new("g0", 0.0).with_voltage_regulation()),
        );
        network.add_bus(
            LfBus::new("pv")
                .with_load(0.5, 0.3)
                .with_generator(LfGenerator::new("g1", 0.2).with_q_limit(-0.1, 0.1).with_voltage_regulation()),
        );
        network.add_branch(LfBranch::new("l", 0, 1, PiModel::line(0.0, 0.1)));
        network.set_voltage_control(0, &[0], 1.0).unwrap();
        network.set_voltage_control(1, &[1], 1.02).unwrap();
        network
    }

    fn check(
        outer_loop: &mut ReactiveLimitsOuterLoop,
        network: &mut LfNetwork,
        system: &mut EquationSystem,
        variable_set: &VariableSet,
    ) -> OuterLoopStatus {
        let last_nr_result = NewtonRaphsonResult {
            status: NewtonRaphsonStatus::Converged,
            iteration: 4,
            slack_bus_active_power_mismatch: 0.0,
        };
        let mut context = OuterLoopContext {
            iteration: 0,
            network,
            equation_system: system,
            variable_set,
            last_nr_result: &last_nr_result,
        };
        outer_loop.check(&mut context).unwrap()
    }

    fn is_active(system: &EquationSystem, num: usize, ty: EquationType) -> bool {
        system.equation(EquationKey::new(num, ty)).unwrap().is_active()
    }

    #[test]
    fn test_switch_to_max_q_and_back() {
        let mut network = network();
        let mut variable_set = VariableSet::new();
        let mut system =
            create_ac_equation_system(&network, &mut variable_set, &AcEquationSystemCreationParameters::default())
                .unwrap();
        let mut outer_loop = ReactiveLimitsOuterLoop::default();
        assert!(is_active(&system, 1, EquationType::BusV));
        assert!(!is_active(&system, 1, EquationType::BusQ));

        // generators produce 0.5 = 0.2 + 0.3, above the 0.1 limit
        network.buses_mut()[1].calculated_q = 0.2;
        let status = check(&mut outer_loop, &mut network, &mut system, &variable_set);
        assert_eq!(status, OuterLoopStatus::Unstable);
        assert!(!is_active(&system, 1, EquationType::BusV));
        assert!(is_active(&system, 1, EquationType::BusQ));
        let bus = &network.buses()[1];
        assert!(!bus.voltage_controller_enabled);
        assert_eq!(bus.generation_target_q, 0.1);

        // voltage still below target: nothing to do
        network.buses_mut()[1].v = 1.01;
        let status = check(&mut outer_loop, &mut network, &mut system, &variable_set);
        assert_eq!(status, OuterLoopStatus::Stable);

        network.buses_mut()[1].v = 1.03;
        let status = check(&mut outer_loop, &mut network, &mut system, &variable_set);
        assert_eq!(status, OuterLoopStatus::Unstable);
        assert!(is_active(&system, 1, EquationType::BusV));
        assert!(!is_active(&system, 1, EquationType::BusQ));
        let bus = &network.buses()[1];
        assert!(bus.voltage_controller_enabled);
        assert_eq!(bus.generation_target_q, 0.0);
        assert_eq!(bus.pq_pv_switch_count, 1);
    }

    #[test]
    fn test_pq_pv_switch_limit() {
        let mut network = network();
        let mut variable_set = VariableSet::new();
        let mut system =
            create_ac_equation_system(&network, &mut variable_set, &AcEquationSystemCreationParameters::default())
                .unwrap();
        let mut outer_loop = ReactiveLimitsOuterLoop::default().with_max_pq_pv_switch(0);

        network.buses_mut()[1].calculated_q = -0.5;
        let status = check(&mut outer_loop, &mut network, &mut system, &variable_set);
        assert_eq!(status, OuterLoopStatus::Unstable);
        assert_eq!(network.buses()[1].generation_target_q, -0.1);

        network.buses_mut()[1].v = 1.0;
        let status = check(&mut outer_loop, &mut network, &mut system, &variable_set);
        assert_eq!(status, OuterLoopStatus::Stable);
        assert!(!network.buses()[1].voltage_controller_enabled);
    }

    #[test]
    fn test_slack_bus_is_ignored() {
        let mut network = network();
        let mut variable_set = VariableSet::new();
        let mut system =
            create_ac_equation_system(&network, &mut variable_set, &AcEquationSystemCreationParameters::default())
                .unwrap();
        network.buses_mut()[0].calculated_q = 10.0;
        network.buses_mut()[1].calculated_q = -0.3;
        let mut outer_loop = ReactiveLimitsOuterLoop::default();
        let status = check(&mut outer_loop, &mut network, &mut system, &variable_set);
        assert_eq!(status, OuterLoopStatus::Stable);
        assert!(network.buses()[0].voltage_controller_enabled);
    }
}
