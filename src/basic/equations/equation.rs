use std::fmt;

use serde::{Deserialize, Serialize};

use super::term::TermId;
use crate::basic::error::{LoadFlowError, Result};
use crate::basic::network::{ElementType, LfNetwork, PhaseControlUnit, Subject};

/// Kind of equation. Declaration order is the tie-breaker of the equation
/// index after the element number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EquationType {
    BusP,
    BusQ,
    BusV,
    BusPhi,
    BranchP,
    BranchI,
    BranchAlpha1,
    BranchRho1,
    ZeroQ,
    ZeroV,
    ZeroPhi,
    ZeroRho1,
}

impl EquationType {
    pub fn symbol(&self) -> &'static str {
        match self {
            EquationType::BusP => "p",
            EquationType::BusQ => "q",
            EquationType::BusV => "v",
            EquationType::BusPhi => "\u{3c6}",
            EquationType::BranchP => "t",
            EquationType::BranchI => "i",
            EquationType::BranchAlpha1 => "a",
            EquationType::BranchRho1 => "r",
            EquationType::ZeroQ => "z_q",
            EquationType::ZeroV => "z_v",
            EquationType::ZeroPhi => "z_\u{3c6}",
            EquationType::ZeroRho1 => "z_\u{3c1}",
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            EquationType::BusP
            | EquationType::BusQ
            | EquationType::BusV
            | EquationType::BusPhi
            | EquationType::ZeroQ => ElementType::Bus,
            _ => ElementType::Branch,
        }
    }
}

/// Identity of an equation: element number and equation type.
///
/// Sorting keys sorts equations by element number, then by type, which is
/// the column order of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EquationKey {
    pub num: usize,
    pub ty: EquationType,
}

impl EquationKey {
    pub fn new(num: usize, ty: EquationType) -> Self {
        Self { num, ty }
    }

    pub fn subject(&self) -> Subject {
        Subject {
            element_type: self.ty.element_type(),
            num: self.num,
        }
    }
}

impl fmt::Display for EquationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.ty.symbol(), self.num)
    }
}

/// When an equation's terms are refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EquationUpdateType {
    /// Solved by Newton-Raphson, updated at every iteration.
    #[default]
    Default,
    /// Not solved, only evaluated once Newton-Raphson has converged.
    AfterNr,
}

/// Data shared between the controllers of a distributed control.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistributionData {
    /// Element number of the first controller of the group.
    pub first_controller_element_num: usize,
    /// Participation ratio of this controller relative to the first one.
    pub c: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EquationData {
    Distribution(DistributionData),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquationEventType {
    Created,
    Removed,
    Activated,
    Deactivated,
    UpdateTypeChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquationTermEventType {
    Added,
    Activated,
    Deactivated,
}

/// One scalar equation of the system.
///
/// Equations are owned by their [`EquationSystem`](super::EquationSystem);
/// everything that changes the structure goes through the system so that
/// listeners and the index stay in sync.
#[derive(Debug, Clone)]
pub struct Equation {
    key: EquationKey,
    column: Option<usize>,
    active: bool,
    update_type: EquationUpdateType,
    terms: Vec<TermId>,
    data: Option<EquationData>,
}

impl Equation {
    pub(crate) fn new(key: EquationKey) -> Self {
        Self {
            key,
            column: None,
            active: true,
            update_type: EquationUpdateType::Default,
            terms: Vec::new(),
            data: None,
        }
    }

    pub fn key(&self) -> EquationKey {
        self.key
    }

    pub fn num(&self) -> usize {
        self.key.num
    }

    pub fn ty(&self) -> EquationType {
        self.key.ty
    }

    /// Column in the last built index, `None` when not indexed.
    pub fn column(&self) -> Option<usize> {
        self.column
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn update_type(&self) -> EquationUpdateType {
        self.update_type
    }

    pub fn terms(&self) -> &[TermId] {
        &self.terms
    }

    pub fn data(&self) -> Option<&EquationData> {
        self.data.as_ref()
    }

    pub(crate) fn set_column(&mut self, column: Option<usize>) {
        self.column = column;
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub(crate) fn set_update_type(&mut self, update_type: EquationUpdateType) {
        self.update_type = update_type;
    }

    pub(crate) fn set_data(&mut self, data: Option<EquationData>) {
        self.data = data;
    }

    pub(crate) fn push_term(&mut self, term: TermId) {
        self.terms.push(term);
    }

    fn distribution_data(&self) -> Result<&DistributionData> {
        match &self.data {
            Some(EquationData::Distribution(data)) => Ok(data),
            None => Err(LoadFlowError::Structural(format!(
                "equation {} has no distribution data",
                self.key
            ))),
        }
    }

    /// Target value read from the network, before the constant parts of the
    /// terms are subtracted.
    pub(crate) fn network_target(&self, network: &LfNetwork) -> Result<f64> {
        let num = self.key.num;
        match self.key.ty {
            EquationType::BusP => Ok(network.bus(num)?.target_p()),
            EquationType::BusQ => Ok(network.bus(num)?.target_q()),
            EquationType::BusV => bus_target_v(network, num),
            EquationType::BusPhi => Ok(0.0),
            EquationType::BranchP => branch_phase_control_target(network, num, PhaseControlUnit::Mw),
            EquationType::BranchI => branch_phase_control_target(network, num, PhaseControlUnit::A),
            EquationType::BranchAlpha1 => Ok(network.branch(num)?.pi_model.a1),
            EquationType::BranchRho1 => Ok(network.branch(num)?.pi_model.r1),
            EquationType::ZeroQ => {
                let data = self.distribution_data()?;
                let controller = network.bus(num)?;
                let first = network.bus(data.first_controller_element_num)?;
                Ok(data.c * (controller.generation_target_q - controller.load_target_q)
                    - (first.generation_target_q - first.load_target_q))
            }
            EquationType::ZeroV => Ok(0.0),
            EquationType::ZeroPhi => Ok(-network.branch(num)?.pi_model.a1),
            EquationType::ZeroRho1 => {
                let data = self.distribution_data()?;
                Ok(network.branch(num)?.pi_model.r1
                    - network.branch(data.first_controller_element_num)?.pi_model.r1)
            }
        }
    }
}

fn bus_target_v(network: &LfNetwork, num: usize) -> Result<f64> {
    let bus = network.bus(num)?;
    if let Some(control) = &bus.discrete_voltage_control {
        return Ok(control.target_value);
    }
    let control = bus.voltage_control.as_ref().ok_or_else(|| {
        LoadFlowError::Structural(format!("bus '{}' has no voltage target", bus.id))
    })?;
    let mut enabled = false;
    for &controller in &control.controllers {
        enabled |= network.bus(controller)?.voltage_controller_enabled;
    }
    if !enabled {
        return Err(LoadFlowError::Structural(format!(
            "none of the controller buses of bus '{}' has voltage control on",
            bus.id
        )));
    }
    Ok(control.target_value)
}

fn branch_phase_control_target(network: &LfNetwork, num: usize, unit: PhaseControlUnit) -> Result<f64> {
    let branch = network.branch(num)?;
    match &branch.phase_control {
        Some(control) if control.unit == unit => Ok(control.target_value),
        Some(_) => Err(LoadFlowError::Structural(format!(
            "phase control of branch '{}' is not in {:?}",
            branch.id, unit
        ))),
        None => Err(LoadFlowError::Structural(format!(
            "branch '{}' is not phase controlled",
            branch.id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering() {
        let mut keys = vec![
            EquationKey::new(1, EquationType::BusP),
            EquationKey::new(0, EquationType::BusQ),
            EquationKey::new(0, EquationType::BusP),
            EquationKey::new(0, EquationType::BranchP),
        ];
        keys.sort();
        let names: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        assert_eq!(names, vec!["p0", "q0", "t0", "p1"]);
    }

    #[test]
    fn test_missing_distribution_data() {
        let eq = Equation::new(EquationKey::new(0, EquationType::ZeroQ));
        let network = LfNetwork::new(0);
        assert!(matches!(
            eq.network_target(&network),
            Err(LoadFlowError::Structural(_))
        ));
    }
}
