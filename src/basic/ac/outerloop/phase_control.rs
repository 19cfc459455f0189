use tracing::{debug, info};

use super::{OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::basic::equations::{EquationKey, EquationType};
use crate::basic::error::Result;
use crate::basic::network::{PhaseControlMode, PhaseControlUnit, nearest_tap};

/// Freezes phase shifters after the first solve.
///
/// The first run moves `a1` continuously to meet the flow target. The loop
/// then rounds `a1` to the closest tap and fixes it, so the flow follows.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhaseControlOuterLoop;

impl OuterLoop for PhaseControlOuterLoop {
    fn type_name(&self) -> &'static str {
        "Phase control"
    }

    fn check(&mut self, context: &mut OuterLoopContext<'_>) -> Result<OuterLoopStatus> {
        if context.iteration > 0 {
            return Ok(OuterLoopStatus::Stable);
        }
        let mut frozen = 0;
        for branch in context.network.branches_mut() {
            let Some(control) = branch.phase_control.as_mut() else {
                continue;
            };
            if control.mode != PhaseControlMode::Controller
                || !context.equation_system.has_equation(branch.num, EquationType::BranchAlpha1)
            {
                continue;
            }
            let a1 = nearest_tap(&control.alpha_taps, branch.pi_model.a1);
            debug!("round a1 of branch '{}': {} -> {}", branch.id, branch.pi_model.a1, a1);
            branch.pi_model.a1 = a1;
            control.mode = PhaseControlMode::Off;

            let flow = match control.unit {
                PhaseControlUnit::Mw => EquationType::BranchP,
                PhaseControlUnit::A => EquationType::BranchI,
            };
            context.equation_system.set_equation_active(EquationKey::new(branch.num, flow), false)?;
            context
                .equation_system
                .set_equation_active(EquationKey::new(branch.num, EquationType::BranchAlpha1), true)?;
            frozen += 1;
        }
        if frozen == 0 {
            return Ok(OuterLoopStatus::Stable);
        }
        info!("{} phase shifters switched to fixed tap", frozen);
        Ok(OuterLoopStatus::Unstable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::ac::create_ac_equation_system;
    use crate::basic::ac::nr::{NewtonRaphsonResult, NewtonRaphsonStatus};
    use crate::basic::ac::parameters::AcEquationSystemCreationParameters;
    use crate::basic::equations::{EquationSystem, VariableSet};
    use crate::basic::network::LfNetwork;
    use crate::testcases::phase_shifter_network;

    fn check(network: &mut LfNetwork, system: &mut EquationSystem, iteration: usize) -> OuterLoopStatus {
        let variable_set = VariableSet::new();
        let last_nr_result = NewtonRaphsonResult {
            status: NewtonRaphsonStatus::Converged,
            iteration: 5,
            slack_bus_active_power_mismatch: 0.0,
        };
        let mut context = OuterLoopContext {
            iteration,
            network,
            equation_system: system,
            variable_set: &variable_set,
            last_nr_result: &last_nr_result,
        };
        PhaseControlOuterLoop.check(&mut context).unwrap()
    }

    #[test]
    fn test_round_to_tap_on_first_iteration() {
        let mut network = phase_shifter_network().unwrap();
        let parameters = AcEquationSystemCreationParameters {
            phase_control: true,
            ..Default::default()
        };
        let mut variable_set = VariableSet::new();
        let mut system = create_ac_equation_system(&network, &mut variable_set, &parameters).unwrap();
        let ps = network.branches().iter().position(|b| b.phase_control.is_some()).unwrap();
        network.branch_mut(ps).unwrap().pi_model.a1 = 0.031;

        assert_eq!(check(&mut network, &mut system, 1), OuterLoopStatus::Stable);
        assert_eq!(check(&mut network, &mut system, 0), OuterLoopStatus::Unstable);

        let branch = network.branch(ps).unwrap();
        let taps = &branch.phase_control.as_ref().unwrap().alpha_taps;
        assert!(taps.contains(&branch.pi_model.a1));
        assert!(!system.equation(EquationKey::new(ps, EquationType::BranchP)).unwrap().is_active());
        assert!(system.equation(EquationKey::new(ps, EquationType::BranchAlpha1)).unwrap().is_active());

        // nothing left to freeze
        assert_eq!(check(&mut network, &mut system, 0), OuterLoopStatus::Stable);
    }
}
