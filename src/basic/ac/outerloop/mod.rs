//! Discrete controls checked between Newton-Raphson runs.
//!
//! An outer loop looks at a converged state and decides whether some control
//! has to change. Changes go through the activation methods of the equation
//! system (or through network targets), and a loop that made any returns
//! [`OuterLoopStatus::Unstable`] so the engine solves again.

mod distributed_slack;
mod phase_control;
mod reactive_limits;
mod transformer_voltage_control;

pub use distributed_slack::DistributedSlackOuterLoop;
pub use phase_control::PhaseControlOuterLoop;
pub use reactive_limits::ReactiveLimitsOuterLoop;
pub use transformer_voltage_control::TransformerVoltageControlOuterLoop;

use serde::{Deserialize, Serialize};

use super::nr::NewtonRaphsonResult;
use super::parameters::AcLoadFlowParameters;
use crate::basic::equations::{EquationSystem, VariableSet};
use crate::basic::error::Result;
use crate::basic::network::LfNetwork;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OuterLoopStatus {
    Stable,
    Unstable,
}

/// What an outer loop may look at and change during a check.
pub struct OuterLoopContext<'a> {
    /// Iterations already done by this loop type.
    pub iteration: usize,
    pub network: &'a mut LfNetwork,
    pub equation_system: &'a mut EquationSystem,
    pub variable_set: &'a VariableSet,
    pub last_nr_result: &'a NewtonRaphsonResult,
}

pub trait OuterLoop {
    /// Identifies the loop type. Iterations are counted per type.
    fn type_name(&self) -> &'static str;

    fn check(&mut self, context: &mut OuterLoopContext<'_>) -> Result<OuterLoopStatus>;

    /// Cap on the iterations of this loop type, overriding the engine one.
    fn max_iterations(&self) -> Option<usize> {
        None
    }
}

/// The outer loops enabled by `parameters`, innermost first.
pub fn default_outer_loops(parameters: &AcLoadFlowParameters) -> Vec<Box<dyn OuterLoop>> {
    let mut outer_loops: Vec<Box<dyn OuterLoop>> = Vec::new();
    if parameters.distributed_slack {
        outer_loops.push(Box::new(DistributedSlackOuterLoop::new(
            parameters.balance_type,
            parameters.load_power_factor_constant,
            parameters.throws_on_slack_distribution_failure,
        )));
    }
    if parameters.equation_system.phase_control {
        outer_loops.push(Box::new(PhaseControlOuterLoop));
    }
    if parameters.reactive_limits {
        let mut reactive_limits = ReactiveLimitsOuterLoop::default();
        if let Some(max_switch) = parameters.max_pq_pv_switch {
            reactive_limits = reactive_limits.with_max_pq_pv_switch(max_switch);
        }
        outer_loops.push(Box::new(reactive_limits));
    }
    if parameters.equation_system.transformer_voltage_control {
        outer_loops.push(Box::new(TransformerVoltageControlOuterLoop));
    }
    outer_loops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_outer_loops() {
        let names = |parameters: &AcLoadFlowParameters| -> Vec<&'static str> {
            default_outer_loops(parameters).iter().map(|l| l.type_name()).collect()
        };
        let mut parameters = AcLoadFlowParameters::default();
        assert_eq!(names(&parameters), vec!["Slack distribution", "Reactive limits"]);

        parameters.distributed_slack = false;
        parameters.equation_system.phase_control = true;
        parameters.equation_system.transformer_voltage_control = true;
        assert_eq!(
            names(&parameters),
            vec!["Phase control", "Reactive limits", "Transformer voltage control"]
        );
    }
}
