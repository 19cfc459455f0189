use crate::basic::equations::{EquationTerm, StateView, Variable, VariableSet, VariableType};
use crate::basic::error::{LoadFlowError, Result};
use crate::basic::network::{LfBus, Subject};

/// Voltage of a bus regulated by static var compensators with a slope:
/// `v + λ·q_svc`, where `q_svc` is the reactive power the compensators
/// inject and `λ = 1 / Σ(1 / slope_i)` the combined slope.
///
/// `q_svc` is the flow leaving the bus plus its load, minus its fixed
/// generation.
#[derive(Debug)]
pub struct StaticVarCompensatorVoltageTerm {
    bus_num: usize,
    v: Variable,
    variables: Vec<Variable>,
    reactive_terms: Vec<Box<dyn EquationTerm>>,
    slope: f64,
    constant_q: f64,
    v_value: f64,
}

impl StaticVarCompensatorVoltageTerm {
    /// `reactive_terms` are the flows leaving the bus (branches and shunts),
    /// owned by this term.
    pub fn new(
        bus: &LfBus,
        reactive_terms: Vec<Box<dyn EquationTerm>>,
        variable_set: &mut VariableSet,
    ) -> Result<Self> {
        if bus.static_var_compensators.is_empty() {
            return Err(LoadFlowError::Configuration(format!(
                "bus '{}' has no static var compensator",
                bus.id
            )));
        }
        if bus.has_voltage_regulating_generator() {
            return Err(LoadFlowError::Configuration(format!(
                "bus '{}' has both a voltage regulating generator and a static var compensator with slope",
                bus.id
            )));
        }
        let mut inverse_sum = 0.0;
        for svc in &bus.static_var_compensators {
            if !svc.voltage_regulator_on {
                return Err(LoadFlowError::Configuration(format!(
                    "static var compensator '{}' does not regulate voltage",
                    svc.id
                )));
            }
            if svc.slope == 0.0 {
                return Err(LoadFlowError::Configuration(format!(
                    "static var compensator '{}' has a zero slope",
                    svc.id
                )));
            }
            inverse_sum += 1.0 / svc.slope;
        }
        if inverse_sum == 0.0 {
            return Err(LoadFlowError::Configuration(format!(
                "slopes of the static var compensators of bus '{}' cancel out",
                bus.id
            )));
        }

        let v = variable_set.get_or_create(bus.num, VariableType::BusV);
        let ph = variable_set.get_or_create(bus.num, VariableType::BusPhi);
        let mut variables = vec![v, ph];
        for term in &reactive_terms {
            for variable in term.variables() {
                if !variables.contains(variable) {
                    variables.push(*variable);
                }
            }
        }
        Ok(Self {
            bus_num: bus.num,
            v,
            variables,
            reactive_terms,
            slope: 1.0 / inverse_sum,
            constant_q: bus.load_target_q - bus.generation_target_q,
            v_value: f64::NAN,
        })
    }

    pub fn slope(&self) -> f64 {
        self.slope
    }

    fn flows_q(&self) -> f64 {
        self.reactive_terms.iter().map(|t| t.eval()).sum()
    }
}

impl EquationTerm for StaticVarCompensatorVoltageTerm {
    fn name(&self) -> &'static str {
        "ac_v_svc_slope"
    }

    fn subject(&self) -> Subject {
        Subject::bus(self.bus_num)
    }

    fn variables(&self) -> &[Variable] {
        &self.variables
    }

    fn update(&mut self, x: &StateView<'_>) {
        self.v_value = x.get(self.v);
        for term in self.reactive_terms.iter_mut() {
            term.update(x);
        }
    }

    fn eval(&self) -> f64 {
        self.v_value + self.slope * (self.flows_q() + self.constant_q)
    }

    fn der(&self, variable: Variable) -> Result<f64> {
        if !self.variables.contains(&variable) {
            return Err(LoadFlowError::undeclared_variable(self.name(), variable));
        }
        let mut dq = 0.0;
        for term in &self.reactive_terms {
            if term.variables().contains(&variable) {
                dq += term.der(variable)?;
            }
        }
        let dv = if variable == self.v { 1.0 } else { 0.0 };
        Ok(dv + self.slope * dq)
    }

}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::basic::ac::terms::ShuntReactiveTerm;
    use crate::basic::network::{LfGenerator, LfStaticVarCompensator};

    fn svc(id: &str, slope: f64) -> LfStaticVarCompensator {
        LfStaticVarCompensator {
            id: id.to_string(),
            slope,
            voltage_regulator_on: true,
        }
    }

    #[test]
    fn test_combined_slope() {
        let bus = LfBus::new("b")
            .with_shunt(0.1)
            .with_load(0.0, 0.3)
            .with_static_var_compensator(svc("s1", 0.02))
            .with_static_var_compensator(svc("s2", 0.02));
        let mut variable_set = VariableSet::new();
        let shunt: Box<dyn EquationTerm> = Box::new(ShuntReactiveTerm::new(&bus, &mut variable_set));
        let mut term = StaticVarCompensatorVoltageTerm::new(&bus, vec![shunt], &mut variable_set).unwrap();
        assert!((term.slope() - 0.01).abs() < 1e-15);
        assert!(!term.has_rhs());

        let v = variable_set.get(0, VariableType::BusV).unwrap();
        let ph = variable_set.get(0, VariableType::BusPhi).unwrap();
        let rows = HashMap::from([(v, 0), (ph, 1)]);
        term.update(&StateView::new(&[1.0, 0.0], &rows));
        // shunt draws -0.1, load takes 0.3
        assert!((term.eval() - (1.0 + 0.002)).abs() < 1e-12);
        assert!((term.der(v).unwrap() - (1.0 - 0.002)).abs() < 1e-12);
        assert_eq!(term.der(ph).unwrap(), 0.0);
    }

    #[test]
    fn test_configuration_errors() {
        let mut variable_set = VariableSet::new();
        let empty = LfBus::new("b");
        assert!(matches!(
            StaticVarCompensatorVoltageTerm::new(&empty, vec![], &mut variable_set),
            Err(LoadFlowError::Configuration(_))
        ));

        let zero_slope = LfBus::new("b").with_static_var_compensator(svc("s", 0.0));
        assert!(matches!(
            StaticVarCompensatorVoltageTerm::new(&zero_slope, vec![], &mut variable_set),
            Err(LoadFlowError::Configuration(_))
        ));

        let with_generator = LfBus::new("b")
            .with_static_var_compensator(svc("s", 0.01))
            .with_generator(LfGenerator::new("g", 0.0).with_voltage_regulation());
        assert!(matches!(
            StaticVarCompensatorVoltageTerm::new(&with_generator, vec![], &mut variable_set),
            Err(LoadFlowError::Configuration(_))
        ));
    }
}
