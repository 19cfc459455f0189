use tracing::{debug, info};

use super::{OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::basic::equations::{EquationKey, EquationType};
use crate::basic::error::Result;
use crate::basic::network::nearest_tap;

/// Freezes tap changers after the first solve: `r1` is rounded to the
/// closest ratio tap and the voltage equation of the controlled bus is
/// replaced by fixed ratios.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransformerVoltageControlOuterLoop;

impl OuterLoop for TransformerVoltageControlOuterLoop {
    fn type_name(&self) -> &'static str {
        "Transformer voltage control"
    }

    fn check(&mut self, context: &mut OuterLoopContext<'_>) -> Result<OuterLoopStatus> {
        if context.iteration > 0 {
            return Ok(OuterLoopStatus::Stable);
        }
        let mut controlled_buses = Vec::new();
        for branch in context.network.branches_mut() {
            let Some(control) = branch.voltage_control.as_mut() else {
                continue;
            };
            if !control.enabled || !context.equation_system.has_equation(branch.num, EquationType::BranchRho1) {
                continue;
            }
            let r1 = nearest_tap(&control.ratio_taps, branch.pi_model.r1);
            debug!("round r1 of branch '{}': {} -> {}", branch.id, branch.pi_model.r1, r1);
            branch.pi_model.r1 = r1;
            control.enabled = false;
            if !controlled_buses.contains(&control.controlled_bus) {
                controlled_buses.push(control.controlled_bus);
            }

            let system = &mut *context.equation_system;
            system.set_equation_active(EquationKey::new(branch.num, EquationType::BranchRho1), true)?;
            if system.has_equation(branch.num, EquationType::ZeroRho1) {
                system.set_equation_active(EquationKey::new(branch.num, EquationType::ZeroRho1), false)?;
            }
        }
        if controlled_buses.is_empty() {
            return Ok(OuterLoopStatus::Stable);
        }
        for &bus in &controlled_buses {
            context
                .equation_system
                .set_equation_active(EquationKey::new(bus, EquationType::BusV), false)?;
        }
        info!("{} transformer voltage controls switched to fixed ratio", controlled_buses.len());
        Ok(OuterLoopStatus::Unstable)
    }
}
