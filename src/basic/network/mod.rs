//! Load flow view of a network: buses and branches in per unit, numbered by
//! their position.

mod branch;
mod bus;
pub mod distribution;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::basic::error::{LoadFlowError, Result};
pub use branch::*;
pub use bus::*;

/// Base power used to express the per unit quantities, in MVA.
pub const BASE_MVA: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Bus,
    Branch,
}

/// Network element an equation or a term belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub element_type: ElementType,
    pub num: usize,
}

impl Subject {
    pub fn bus(num: usize) -> Self {
        Self {
            element_type: ElementType::Bus,
            num,
        }
    }

    pub fn branch(num: usize) -> Self {
        Self {
            element_type: ElementType::Branch,
            num,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.element_type {
            ElementType::Bus => write!(f, "bus {}", self.num),
            ElementType::Branch => write!(f, "branch {}", self.num),
        }
    }
}

/// One synchronous component of a grid.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LfNetwork {
    pub num: usize,
    buses: Vec<LfBus>,
    branches: Vec<LfBranch>,
}

impl LfNetwork {
    pub fn new(num: usize) -> Self {
        Self {
            num,
            buses: Vec::new(),
            branches: Vec::new(),
        }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let mut network: LfNetwork = serde_json::from_str(json)?;
        for (num, bus) in network.buses.iter_mut().enumerate() {
            bus.num = num;
        }
        for (num, branch) in network.branches.iter_mut().enumerate() {
            branch.num = num;
        }
        Ok(network)
    }

    /// Adds a bus and returns its number.
    pub fn add_bus(&mut self, mut bus: LfBus) -> usize {
        let num = self.buses.len();
        bus.num = num;
        self.buses.push(bus);
        num
    }

    /// Adds a branch and returns its number.
    pub fn add_branch(&mut self, mut branch: LfBranch) -> usize {
        let num = self.branches.len();
        branch.num = num;
        self.branches.push(branch);
        num
    }

    pub fn buses(&self) -> &[LfBus] {
        &self.buses
    }

    pub fn buses_mut(&mut self) -> &mut [LfBus] {
        &mut self.buses
    }

    pub fn branches(&self) -> &[LfBranch] {
        &self.branches
    }

    pub fn branches_mut(&mut self) -> &mut [LfBranch] {
        &mut self.branches
    }

    pub fn bus(&self, num: usize) -> Result<&LfBus> {
        self.buses
            .get(num)
            .ok_or_else(|| LoadFlowError::Structural(format!("bus {} not found", num)))
    }

    pub fn bus_mut(&mut self, num: usize) -> Result<&mut LfBus> {
        self.buses
            .get_mut(num)
            .ok_or_else(|| LoadFlowError::Structural(format!("bus {} not found", num)))
    }

    pub fn branch(&self, num: usize) -> Result<&LfBranch> {
        self.branches
            .get(num)
            .ok_or_else(|| LoadFlowError::Structural(format!("branch {} not found", num)))
    }

    pub fn branch_mut(&mut self, num: usize) -> Result<&mut LfBranch> {
        self.branches
            .get_mut(num)
            .ok_or_else(|| LoadFlowError::Structural(format!("branch {} not found", num)))
    }

    pub fn slack_bus(&self) -> Result<&LfBus> {
        self.buses
            .iter()
            .find(|b| b.slack)
            .ok_or_else(|| LoadFlowError::Structural(format!("network {} has no slack bus", self.num)))
    }

    /// Links controller buses to the bus they regulate and enables them.
    pub fn set_voltage_control(&mut self, controlled: usize, controllers: &[usize], target_v: f64) -> Result<()> {
        for &controller in controllers {
            let bus = self.bus_mut(controller)?;
            bus.controlled_bus = Some(controlled);
            bus.voltage_controller_enabled = true;
        }
        self.bus_mut(controlled)?.voltage_control = Some(VoltageControl {
            target_value: target_v,
            controllers: controllers.to_vec(),
        });
        Ok(())
    }

    /// Links transformer branches to the bus they regulate.
    pub fn set_transformer_voltage_control(
        &mut self,
        controlled: usize,
        controllers: &[usize],
        target_v: f64,
        ratio_taps: &[f64],
    ) -> Result<()> {
        self.bus(controlled)?;
        for &controller in controllers {
            self.branch_mut(controller)?.voltage_control = Some(TransformerVoltageControl {
                controlled_bus: controlled,
                ratio_taps: ratio_taps.to_vec(),
                enabled: true,
            });
        }
        self.bus_mut(controlled)?.discrete_voltage_control = Some(DiscreteVoltageControl {
            target_value: target_v,
            controllers: controllers.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbering_and_lookup() {
        let mut network = LfNetwork::new(0);
        let a = network.add_bus(LfBus::new("a").with_slack());
        let b = network.add_bus(LfBus::new("b"));
        let l = network.add_branch(LfBranch::new("l", a, b, PiModel::line(0.01, 0.1)));
        assert_eq!((a, b, l), (0, 1, 0));
        assert_eq!(network.bus(b).unwrap().id, "b");
        assert_eq!(network.slack_bus().unwrap().num, 0);
        assert!(matches!(network.bus(7), Err(LoadFlowError::Structural(_))));
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "num": 3,
            "buses": [
                {"id": "a", "slack": true},
                {"id": "b", "load_target_p": 0.5, "load_count": 1}
            ],
            "branches": [
                {"id": "l", "bus1": 0, "bus2": 1, "pi_model": {"r": 0.0, "x": 0.1}}
            ]
        }"#;
        let network = LfNetwork::from_json(json).unwrap();
        assert_eq!(network.num, 3);
        assert_eq!(network.buses()[1].num, 1);
        assert_eq!(network.buses()[1].v, 1.0);
        assert_eq!(network.branches()[0].pi_model.r1, 1.0);
    }
}
