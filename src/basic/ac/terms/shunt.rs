use crate::basic::equations::{EquationTerm, StateView, Variable, VariableSet, VariableType};
use crate::basic::error::{LoadFlowError, Result};
use crate::basic::network::{LfBus, Subject};

/// Reactive power drawn by the fixed shunt of a bus, `q = -b·v²`.
#[derive(Debug, Clone)]
pub struct ShuntReactiveTerm {
    bus_num: usize,
    b: f64,
    variables: [Variable; 1],
    v: f64,
}

impl ShuntReactiveTerm {
    pub fn new(bus: &LfBus, variable_set: &mut VariableSet) -> Self {
        Self {
            bus_num: bus.num,
            b: bus.shunt_b,
            variables: [variable_set.get_or_create(bus.num, VariableType::BusV)],
            v: f64::NAN,
        }
    }
}

impl EquationTerm for ShuntReactiveTerm {
    fn name(&self) -> &'static str {
        "ac_q_shunt"
    }

    fn subject(&self) -> Subject {
        Subject::bus(self.bus_num)
    }

    fn variables(&self) -> &[Variable] {
        &self.variables
    }

    fn update(&mut self, x: &StateView<'_>) {
        self.v = x.get(self.variables[0]);
    }

    fn eval(&self) -> f64 {
        -self.b * self.v * self.v
    }

    fn der(&self, variable: Variable) -> Result<f64> {
        if variable == self.variables[0] {
            Ok(-2.0 * self.b * self.v)
        } else {
            Err(LoadFlowError::undeclared_variable(self.name(), variable))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_capacitor_produces_reactive_power() {
        let bus = LfBus::new("b").with_shunt(0.2);
        let mut variable_set = VariableSet::new();
        let mut term = ShuntReactiveTerm::new(&bus, &mut variable_set);
        let rows = HashMap::from([(term.variables()[0], 0)]);
        term.update(&StateView::new(&[1.1], &rows));
        assert!((term.eval() + 0.242).abs() < 1e-12);
        assert!((term.der(term.variables()[0]).unwrap() + 0.44).abs() < 1e-12);
    }
}
