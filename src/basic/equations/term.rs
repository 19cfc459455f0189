use std::collections::HashMap;
use std::fmt;

use super::variable::Variable;
use crate::basic::error::{LoadFlowError, Result};
use crate::basic::network::Subject;

/// Handle of a term registered in an [`EquationSystem`](super::EquationSystem).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TermId(pub(crate) usize);

impl TermId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Read-only view of the state vector through the current variable index.
///
/// A variable that is not part of the index reads as `NaN`.
#[derive(Clone, Copy)]
pub struct StateView<'a> {
    x: &'a [f64],
    rows: &'a HashMap<Variable, usize>,
}

impl<'a> StateView<'a> {
    pub(crate) fn new(x: &'a [f64], rows: &'a HashMap<Variable, usize>) -> Self {
        Self { x, rows }
    }

    pub fn get(&self, variable: Variable) -> f64 {
        self.rows
            .get(&variable)
            .and_then(|&row| self.x.get(row))
            .copied()
            .unwrap_or(f64::NAN)
    }

    pub fn contains(&self, variable: Variable) -> bool {
        self.rows.contains_key(&variable)
    }
}

/// A differentiable contribution to an equation.
///
/// `update` caches whatever `eval` and `der` need from the current state.
/// `der` must fail with a structural error for any variable that is not in
/// `variables()`.
pub trait EquationTerm: fmt::Debug {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Network element the term is attached to.
    fn subject(&self) -> Subject;

    fn variables(&self) -> &[Variable];

    fn update(&mut self, x: &StateView<'_>);

    fn eval(&self) -> f64;

    fn der(&self, variable: Variable) -> Result<f64>;

    /// Whether the term carries a constant part moved to the target side.
    fn has_rhs(&self) -> bool {
        false
    }

    fn rhs(&self) -> f64 {
        0.0
    }

    fn write(&self, f: &mut dyn fmt::Write) -> fmt::Result {
        write!(f, "{}(", self.name())?;
        for (i, v) in self.variables().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

/// Term equal to a single variable, used by every "target" equation.
#[derive(Debug, Clone)]
pub struct VariableTargetTerm {
    subject: Subject,
    variables: [Variable; 1],
    value: f64,
}

impl VariableTargetTerm {
    pub fn new(subject: Subject, variable: Variable) -> Self {
        Self {
            subject,
            variables: [variable],
            value: f64::NAN,
        }
    }
}

impl EquationTerm for VariableTargetTerm {
    fn name(&self) -> &'static str {
        "variable_target"
    }

    fn subject(&self) -> Subject {
        self.subject
    }

    fn variables(&self) -> &[Variable] {
        &self.variables
    }

    fn update(&mut self, x: &StateView<'_>) {
        self.value = x.get(self.variables[0]);
    }

    fn eval(&self) -> f64 {
        self.value
    }

    fn der(&self, variable: Variable) -> Result<f64> {
        if variable == self.variables[0] {
            Ok(1.0)
        } else {
            Err(LoadFlowError::undeclared_variable(self.name(), variable))
        }
    }

    fn write(&self, f: &mut dyn fmt::Write) -> fmt::Result {
        write!(f, "{}", self.variables[0])
    }
}

/// Another term multiplied by a constant.
#[derive(Debug)]
pub struct ScaledTerm {
    inner: Box<dyn EquationTerm>,
    coefficient: f64,
}

impl ScaledTerm {
    pub fn new(inner: Box<dyn EquationTerm>, coefficient: f64) -> Self {
        Self { inner, coefficient }
    }

    pub fn minus(inner: Box<dyn EquationTerm>) -> Self {
        Self::new(inner, -1.0)
    }
}

impl EquationTerm for ScaledTerm {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn subject(&self) -> Subject {
        self.inner.subject()
    }

    fn variables(&self) -> &[Variable] {
        self.inner.variables()
    }

    fn update(&mut self, x: &StateView<'_>) {
        self.inner.update(x);
    }

    fn eval(&self) -> f64 {
        self.coefficient * self.inner.eval()
    }

    fn der(&self, variable: Variable) -> Result<f64> {
        Ok(self.coefficient * self.inner.der(variable)?)
    }

    fn has_rhs(&self) -> bool {
        self.inner.has_rhs()
    }

    fn rhs(&self) -> f64 {
        self.coefficient * self.inner.rhs()
    }

    fn write(&self, f: &mut dyn fmt::Write) -> fmt::Result {
        if self.coefficient == -1.0 {
            write!(f, "-")?;
        } else {
            write!(f, "{} * ", self.coefficient)?;
        }
        self.inner.write(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::equations::VariableType;

    #[test]
    fn test_target_term_reads_state() {
        let v = Variable::new(0, VariableType::BusV);
        let phi = Variable::new(0, VariableType::BusPhi);
        let rows = HashMap::from([(v, 1)]);
        let x = [0.3, 1.02];
        let mut term = VariableTargetTerm::new(Subject::bus(0), v);
        term.update(&StateView::new(&x, &rows));
        assert_eq!(term.eval(), 1.02);
        assert_eq!(term.der(v).unwrap(), 1.0);
        assert!(matches!(term.der(phi), Err(LoadFlowError::Structural(_))));
    }

    #[test]
    fn test_unindexed_variable_reads_nan() {
        let rows = HashMap::new();
        let view = StateView::new(&[], &rows);
        assert!(view.get(Variable::new(0, VariableType::BusV)).is_nan());
    }

    #[test]
    fn test_scaled_term() {
        let v = Variable::new(2, VariableType::BusV);
        let rows = HashMap::from([(v, 0)]);
        let mut term = ScaledTerm::minus(Box::new(VariableTargetTerm::new(Subject::bus(2), v)));
        term.update(&StateView::new(&[0.9], &rows));
        assert_eq!(term.eval(), -0.9);
        assert_eq!(term.der(v).unwrap(), -1.0);
        let mut s = String::new();
        term.write(&mut s).unwrap();
        assert_eq!(s, "-v2");
    }
}
