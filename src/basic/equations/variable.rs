use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::initializer::VoltageInitializer;
use crate::basic::error::{LoadFlowError, Result};
use crate::basic::network::{ElementType, LfNetwork};

/// Kind of unknown carried by a [`Variable`].
///
/// The declaration order is the sort order of the variable index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VariableType {
    BusV,
    BusPhi,
    BranchAlpha1,
    BranchRho1,
    /// Active flow through a zero impedance branch.
    DummyP,
    /// Reactive flow through a zero impedance branch.
    DummyQ,
}

impl VariableType {
    pub fn symbol(&self) -> &'static str {
        match self {
            VariableType::BusV => "v",
            VariableType::BusPhi => "\u{3c6}",
            VariableType::BranchAlpha1 => "\u{3b1}",
            VariableType::BranchRho1 => "\u{3c1}",
            VariableType::DummyP => "dummy_p",
            VariableType::DummyQ => "dummy_q",
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            VariableType::BusV | VariableType::BusPhi => ElementType::Bus,
            _ => ElementType::Branch,
        }
    }
}

/// An unknown of the system, identified by its type and the number of the
/// network element it belongs to.
///
/// Two variables are the same unknown exactly when they compare equal, so a
/// `Variable` can be copied freely between terms. Ordering is by type first,
/// then by element number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Variable {
    ty: VariableType,
    num: usize,
}

impl Variable {
    pub fn new(num: usize, ty: VariableType) -> Self {
        Self { ty, num }
    }

    pub fn num(&self) -> usize {
        self.num
    }

    pub fn ty(&self) -> VariableType {
        self.ty
    }

    /// Initial value of the variable, taken from the network or, for bus
    /// voltages, from the voltage initializer.
    pub(crate) fn init_state(
        &self,
        initializer: &dyn VoltageInitializer,
        network: &LfNetwork,
    ) -> Result<f64> {
        Ok(match self.ty {
            VariableType::BusV => initializer.magnitude(network.bus(self.num)?),
            VariableType::BusPhi => initializer.angle(network.bus(self.num)?),
            VariableType::BranchAlpha1 => network.branch(self.num)?.pi_model.a1,
            VariableType::BranchRho1 => network.branch(self.num)?.pi_model.r1,
            VariableType::DummyP | VariableType::DummyQ => 0.0,
        })
    }

    /// Writes a solved value back to the network element.
    pub(crate) fn update_state(&self, network: &mut LfNetwork, value: f64) -> Result<()> {
        match self.ty {
            VariableType::BusV => network.bus_mut(self.num)?.v = value,
            VariableType::BusPhi => network.bus_mut(self.num)?.angle = value,
            VariableType::BranchAlpha1 => network.branch_mut(self.num)?.pi_model.a1 = value,
            VariableType::BranchRho1 => network.branch_mut(self.num)?.pi_model.r1 = value,
            VariableType::DummyP | VariableType::DummyQ => {}
        }
        Ok(())
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.ty.symbol(), self.num)
    }
}

/// Registry of the variables created for one equation system.
///
/// `get_or_create` always hands back the same key for a given
/// `(num, type)` pair.
#[derive(Debug, Default, Clone)]
pub struct VariableSet {
    variables: BTreeSet<Variable>,
}

impl VariableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, num: usize, ty: VariableType) -> Variable {
        let variable = Variable::new(num, ty);
        self.variables.insert(variable);
        variable
    }

    pub fn get(&self, num: usize, ty: VariableType) -> Option<Variable> {
        self.variables.get(&Variable::new(num, ty)).copied()
    }

    /// Like [`VariableSet::get`] but fails when the variable was never
    /// created.
    pub fn require(&self, num: usize, ty: VariableType) -> Result<Variable> {
        self.get(num, ty).ok_or_else(|| {
            LoadFlowError::Structural(format!("variable {} was never created", Variable::new(num, ty)))
        })
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter()
    }
}
