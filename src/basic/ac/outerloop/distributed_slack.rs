use tracing::{error, info};

use super::{OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::basic::error::{LoadFlowError, Result};
use crate::basic::network::BASE_MVA;
use crate::basic::network::distribution::{ActivePowerDistribution, BalanceType, P_RESIDUE_EPS};

/// Spreads the active power the slack bus injects beyond its target over
/// generators or loads, until the residue is negligible.
pub struct DistributedSlackOuterLoop {
    distribution: ActivePowerDistribution,
    throws_on_failure: bool,
}

impl DistributedSlackOuterLoop {
    pub fn new(balance_type: BalanceType, load_power_factor_constant: bool, throws_on_failure: bool) -> Self {
        Self {
            distribution: ActivePowerDistribution::new(balance_type, load_power_factor_constant),
            throws_on_failure,
        }
    }
}

impl OuterLoop for DistributedSlackOuterLoop {
    fn type_name(&self) -> &'static str {
        "Slack distribution"
    }

    fn check(&mut self, context: &mut OuterLoopContext<'_>) -> Result<OuterLoopStatus> {
        let mismatch = context.last_nr_result.slack_bus_active_power_mismatch;
        if mismatch.abs() <= P_RESIDUE_EPS {
            return Ok(OuterLoopStatus::Stable);
        }
        let result = self.distribution.run(context.network, mismatch);
        let remaining = result.remaining_mismatch;
        if remaining.abs() > P_RESIDUE_EPS {
            if self.throws_on_failure {
                return Err(LoadFlowError::SlackDistributionFailure {
                    remaining: remaining * BASE_MVA,
                });
            }
            error!(
                "failed to distribute slack bus active power mismatch, {} MW remains",
                remaining * BASE_MVA
            );
            if remaining == mismatch {
                // nothing moved, solving again would give the same state
                return Ok(OuterLoopStatus::Stable);
            }
        } else {
            info!(
                "slack bus active power ({} MW) distributed in {} iterations",
                mismatch * BASE_MVA,
                result.iteration
            );
        }
        Ok(OuterLoopStatus::Unstable)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::basic::ac::nr::{NewtonRaphsonResult, NewtonRaphsonStatus};
    use crate::basic::equations::{EquationSystem, VariableSet};
    use crate::basic::network::{LfBus, LfGenerator, LfNetwork};

    fn two_bus(max_p: f64) -> LfNetwork {
        let mut network = LfNetwork::new(0);
        network.add_bus(LfBus::new("slack").with_slack());
        network.add_bus(LfBus::new("g").with_generator(LfGenerator::new("g", 0.5).with_p_limit(0.0, max_p)));
        network
    }

    fn check(outer_loop: &mut DistributedSlackOuterLoop, network: &mut LfNetwork, mismatch: f64) -> Result<OuterLoopStatus> {
        let mut system = EquationSystem::new();
        let variable_set = VariableSet::new();
        let last_nr_result = NewtonRaphsonResult {
            status: NewtonRaphsonStatus::Converged,
            iteration: 3,
            slack_bus_active_power_mismatch: mismatch,
        };
        let mut context = OuterLoopContext {
            iteration: 0,
            network,
            equation_system: &mut system,
            variable_set: &variable_set,
            last_nr_result: &last_nr_result,
        };
        outer_loop.check(&mut context)
    }

    #[test]
    fn test_balanced_is_stable() {
        let mut network = two_bus(2.0);
        let mut outer_loop = DistributedSlackOuterLoop::new(BalanceType::ProportionalToGenerationPMax, false, true);
        assert_eq!(check(&mut outer_loop, &mut network, 1e-7).unwrap(), OuterLoopStatus::Stable);
        assert_eq!(network.buses()[1].generators[0].target_p, 0.5);
    }

    #[test]
    fn test_mismatch_moves_to_generators() {
        let mut network = two_bus(2.0);
        let mut outer_loop = DistributedSlackOuterLoop::new(BalanceType::ProportionalToGenerationPMax, false, true);
        assert_eq!(check(&mut outer_loop, &mut network, 0.3).unwrap(), OuterLoopStatus::Unstable);
        assert_abs_diff_eq!(network.buses()[1].generators[0].target_p, 0.8, epsilon = 1e-12);
    }

    #[test]
    fn test_failure() {
        let mut network = two_bus(0.6);
        let mut outer_loop = DistributedSlackOuterLoop::new(BalanceType::ProportionalToGenerationPMax, false, true);
        match check(&mut outer_loop, &mut network, 0.3) {
            Err(LoadFlowError::SlackDistributionFailure { remaining }) => assert_abs_diff_eq!(remaining, 20.0, epsilon = 1e-6),
            other => panic!("unexpected outcome {:?}", other),
        }

        // without throwing, the partial distribution still asks for a new run
        let mut network = two_bus(0.6);
        let mut outer_loop = DistributedSlackOuterLoop::new(BalanceType::ProportionalToGenerationPMax, false, false);
        assert_eq!(check(&mut outer_loop, &mut network, 0.3).unwrap(), OuterLoopStatus::Unstable);
        assert_eq!(check(&mut outer_loop, &mut network, 0.2).unwrap(), OuterLoopStatus::Stable);
    }
}
