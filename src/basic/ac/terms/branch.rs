//! Branch flow terms of the pi model.
//!
//! With `theta1 = ksi - a1 + ph2 - ph1` and `theta2 = ksi + a1 - ph2 + ph1`:
//!
//! ```text
//! p1 = r1²·v1²·(g1 + y·sin(ksi)) - y·r1·v1·v2·sin(theta1)
//! q1 = r1²·v1²·(-b1 + y·cos(ksi)) - y·r1·v1·v2·cos(theta1)
//! p2 = v2²·(g2 + y·sin(ksi)) - y·r1·v1·v2·sin(theta2)
//! q2 = v2²·(-b2 + y·cos(ksi)) - y·r1·v1·v2·cos(theta2)
//! ```

use crate::basic::equations::{EquationTerm, StateView, Variable, VariableSet, VariableType};
use crate::basic::error::{LoadFlowError, Result};
use crate::basic::network::{LfBranch, Subject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchSide {
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Active,
    Reactive,
}

#[derive(Debug, Clone, Copy)]
struct BranchConstants {
    y: f64,
    ksi: f64,
    sin_ksi: f64,
    cos_ksi: f64,
    g1: f64,
    b1: f64,
    g2: f64,
    b2: f64,
}

impl BranchConstants {
    fn new(branch: &LfBranch) -> Self {
        let pi = &branch.pi_model;
        let ksi = pi.ksi();
        Self {
            y: pi.y(),
            ksi,
            sin_ksi: ksi.sin(),
            cos_ksi: ksi.cos(),
            g1: pi.g1,
            b1: pi.b1,
            g2: pi.g2,
            b2: pi.b2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Derivatives {
    v1: f64,
    v2: f64,
    ph1: f64,
    ph2: f64,
    a1: f64,
    r1: f64,
}

/// Active or reactive flow at one side of a branch connected on both sides.
#[derive(Debug, Clone)]
pub struct ClosedBranchFlowTerm {
    branch_num: usize,
    side: BranchSide,
    kind: FlowKind,
    v1: Variable,
    v2: Variable,
    ph1: Variable,
    ph2: Variable,
    a1_var: Option<Variable>,
    r1_var: Option<Variable>,
    variables: Vec<Variable>,
    c: BranchConstants,
    fixed_a1: f64,
    fixed_r1: f64,
    v1_value: f64,
    value: f64,
    der: Derivatives,
}

impl ClosedBranchFlowTerm {
    /// `deriv_a1` and `deriv_r1` turn the transformer phase and ratio into
    /// unknowns instead of constants.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        branch: &LfBranch,
        bus1: usize,
        bus2: usize,
        side: BranchSide,
        kind: FlowKind,
        variable_set: &mut VariableSet,
        deriv_a1: bool,
        deriv_r1: bool,
    ) -> Self {
        let v1 = variable_set.get_or_create(bus1, VariableType::BusV);
        let v2 = variable_set.get_or_create(bus2, VariableType::BusV);
        let ph1 = variable_set.get_or_create(bus1, VariableType::BusPhi);
        let ph2 = variable_set.get_or_create(bus2, VariableType::BusPhi);
        let a1_var = deriv_a1.then(|| variable_set.get_or_create(branch.num, VariableType::BranchAlpha1));
        let r1_var = deriv_r1.then(|| variable_set.get_or_create(branch.num, VariableType::BranchRho1));
        let mut variables = vec![v1, v2, ph1, ph2];
        variables.extend(a1_var);
        variables.extend(r1_var);
        Self {
            branch_num: branch.num,
            side,
            kind,
            v1,
            v2,
            ph1,
            ph2,
            a1_var,
            r1_var,
            variables,
            c: BranchConstants::new(branch),
            fixed_a1: branch.pi_model.a1,
            fixed_r1: branch.pi_model.r1,
            v1_value: f64::NAN,
            value: f64::NAN,
            der: Derivatives::default(),
        }
    }

    pub fn side(&self) -> BranchSide {
        self.side
    }

    pub fn kind(&self) -> FlowKind {
        self.kind
    }

    fn compute(&mut self, v1: f64, v2: f64, ph1: f64, ph2: f64, a1: f64, r1: f64) {
        self.v1_value = v1;
        let c = self.c;
        let y = c.y;
        match (self.side, self.kind) {
            (BranchSide::One, FlowKind::Active) => {
                let theta = c.ksi - a1 + ph2 - ph1;
                let (sin_t, cos_t) = theta.sin_cos();
                self.value = r1 * v1 * (r1 * v1 * (c.g1 + y * c.sin_ksi) - y * v2 * sin_t);
                let dph1 = y * r1 * v1 * v2 * cos_t;
                self.der = Derivatives {
                    v1: r1 * (2.0 * r1 * v1 * (c.g1 + y * c.sin_ksi) - y * v2 * sin_t),
                    v2: -y * r1 * v1 * sin_t,
                    ph1: dph1,
                    ph2: -dph1,
                    a1: dph1,
                    r1: v1 * (2.0 * r1 * v1 * (c.g1 + y * c.sin_ksi) - y * v2 * sin_t),
                };
            }
            (BranchSide::One, FlowKind::Reactive) => {
                let theta = c.ksi - a1 + ph2 - ph1;
                let (sin_t, cos_t) = theta.sin_cos();
                self.value = r1 * v1 * (r1 * v1 * (-c.b1 + y * c.cos_ksi) - y * v2 * cos_t);
                let dph1 = -y * r1 * v1 * v2 * sin_t;
                self.der = Derivatives {
                    v1: r1 * (2.0 * r1 * v1 * (-c.b1 + y * c.cos_ksi) - y * v2 * cos_t),
                    v2: -y * r1 * v1 * cos_t,
                    ph1: dph1,
                    ph2: -dph1,
                    a1: dph1,
                    r1: v1 * (2.0 * r1 * v1 * (-c.b1 + y * c.cos_ksi) - y * v2 * cos_t),
                };
            }
            (BranchSide::Two, FlowKind::Active) => {
                let theta = c.ksi + a1 - ph2 + ph1;
                let (sin_t, cos_t) = theta.sin_cos();
                self.value = v2 * (v2 * (c.g2 + y * c.sin_ksi) - y * r1 * v1 * sin_t);
                let dph1 = -y * r1 * v1 * v2 * cos_t;
                self.der = Derivatives {
                    v1: -y * r1 * v2 * sin_t,
                    v2: 2.0 * v2 * (c.g2 + y * c.sin_ksi) - y * r1 * v1 * sin_t,
                    ph1: dph1,
                    ph2: -dph1,
                    a1: dph1,
                    r1: -y * v1 * v2 * sin_t,
                };
            }
            (BranchSide::Two, FlowKind::Reactive) => {
                let theta = c.ksi + a1 - ph2 + ph1;
                let (sin_t, cos_t) = theta.sin_cos();
                self.value = v2 * (v2 * (-c.b2 + y * c.cos_ksi) - y * r1 * v1 * cos_t);
                let dph1 = y * r1 * v1 * v2 * sin_t;
                self.der = Derivatives {
                    v1: -y * r1 * v2 * cos_t,
                    v2: 2.0 * v2 * (-c.b2 + y * c.cos_ksi) - y * r1 * v1 * cos_t,
                    ph1: dph1,
                    ph2: -dph1,
                    a1: dph1,
                    r1: -y * v1 * v2 * cos_t,
                };
            }
        }
    }
}

impl EquationTerm for ClosedBranchFlowTerm {
    fn name(&self) -> &'static str {
        match (self.side, self.kind) {
            (BranchSide::One, FlowKind::Active) => "ac_p_closed_1",
            (BranchSide::One, FlowKind::Reactive) => "ac_q_closed_1",
            (BranchSide::Two, FlowKind::Active) => "ac_p_closed_2",
            (BranchSide::Two, FlowKind::Reactive) => "ac_q_closed_2",
        }
    }

    fn subject(&self) -> Subject {
        Subject::branch(self.branch_num)
    }

    fn variables(&self) -> &[Variable] {
        &self.variables
    }

    fn update(&mut self, x: &StateView<'_>) {
        let a1 = self.a1_var.map_or(self.fixed_a1, |v| x.get(v));
        let r1 = self.r1_var.map_or(self.fixed_r1, |v| x.get(v));
        self.compute(
            x.get(self.v1),
            x.get(self.v2),
            x.get(self.ph1),
            x.get(self.ph2),
            a1,
            r1,
        );
    }

    fn eval(&self) -> f64 {
        self.value
    }

    fn der(&self, variable: Variable) -> Result<f64> {
        if variable == self.v1 {
            Ok(self.der.v1)
        } else if variable == self.v2 {
            Ok(self.der.v2)
        } else if variable == self.ph1 {
            Ok(self.der.ph1)
        } else if variable == self.ph2 {
            Ok(self.der.ph2)
        } else if Some(variable) == self.a1_var {
            Ok(self.der.a1)
        } else if Some(variable) == self.r1_var {
            Ok(self.der.r1)
        } else {
            Err(LoadFlowError::undeclared_variable(self.name(), variable))
        }
    }
}

/// Flow at the connected side of a branch whose other side is open.
#[derive(Debug, Clone)]
pub struct OpenBranchFlowTerm {
    branch_num: usize,
    /// Side that is open.
    open_side: BranchSide,
    kind: FlowKind,
    variables: [Variable; 1],
    coefficient: f64,
    v: f64,
}

impl OpenBranchFlowTerm {
    pub fn new(
        branch: &LfBranch,
        bus: usize,
        open_side: BranchSide,
        kind: FlowKind,
        variable_set: &mut VariableSet,
    ) -> Self {
        let c = BranchConstants::new(branch);
        let r1 = branch.pi_model.r1;
        let y = c.y;
        let coefficient = match open_side {
            BranchSide::Two => {
                let shunt = (c.g2 + y * c.sin_ksi).powi(2) + (-c.b2 + y * c.cos_ksi).powi(2);
                let s2 = c.b2 * c.b2 + c.g2 * c.g2;
                match kind {
                    FlowKind::Active => {
                        r1 * r1 * (c.g1 + y * y * c.g2 / shunt + s2 * y * c.sin_ksi / shunt)
                    }
                    FlowKind::Reactive => {
                        -r1 * r1 * (c.b1 + y * y * c.b2 / shunt - s2 * y * c.cos_ksi / shunt)
                    }
                }
            }
            BranchSide::One => {
                let shunt = (c.g1 + y * c.sin_ksi).powi(2) + (-c.b1 + y * c.cos_ksi).powi(2);
                let s1 = c.b1 * c.b1 + c.g1 * c.g1;
                match kind {
                    FlowKind::Active => c.g2 + y * y * c.g1 / shunt + s1 * y * c.sin_ksi / shunt,
                    FlowKind::Reactive => -(c.b2 + y * y * c.b1 / shunt - s1 * y * c.cos_ksi / shunt),
                }
            }
        };
        Self {
            branch_num: branch.num,
            open_side,
            kind,
            variables: [variable_set.get_or_create(bus, VariableType::BusV)],
            coefficient,
            v: f64::NAN,
        }
    }
}

impl EquationTerm for OpenBranchFlowTerm {
    fn name(&self) -> &'static str {
        match (self.open_side, self.kind) {
            (BranchSide::Two, FlowKind::Active) => "ac_p_open_2",
            (BranchSide::Two, FlowKind::Reactive) => "ac_q_open_2",
            (BranchSide::One, FlowKind::Active) => "ac_p_open_1",
            (BranchSide::One, FlowKind::Reactive) => "ac_q_open_1",
        }
    }

    fn subject(&self) -> Subject {
        Subject::branch(self.branch_num)
    }

    fn variables(&self) -> &[Variable] {
        &self.variables
    }

    fn update(&mut self, x: &StateView<'_>) {
        self.v = x.get(self.variables[0]);
    }

    fn eval(&self) -> f64 {
        self.coefficient * self.v * self.v
    }

    fn der(&self, variable: Variable) -> Result<f64> {
        if variable == self.variables[0] {
            Ok(2.0 * self.coefficient * self.v)
        } else {
            Err(LoadFlowError::undeclared_variable(self.name(), variable))
        }
    }
}

/// Current magnitude at side 1, `sqrt(p1² + q1²) / v1`.
#[derive(Debug, Clone)]
pub struct ClosedBranchCurrentMagnitudeTerm {
    p: ClosedBranchFlowTerm,
    q: ClosedBranchFlowTerm,
}

impl ClosedBranchCurrentMagnitudeTerm {
    pub fn new(
        branch: &LfBranch,
        bus1: usize,
        bus2: usize,
        variable_set: &mut VariableSet,
        deriv_a1: bool,
        deriv_r1: bool,
    ) -> Self {
        let mut flow = |kind| {
            ClosedBranchFlowTerm::new(
                branch,
                bus1,
                bus2,
                BranchSide::One,
                kind,
                variable_set,
                deriv_a1,
                deriv_r1,
            )
        };
        let p = flow(FlowKind::Active);
        let q = flow(FlowKind::Reactive);
        Self { p, q }
    }

    fn apparent_power(&self) -> f64 {
        self.p.eval().hypot(self.q.eval())
    }
}

impl EquationTerm for ClosedBranchCurrentMagnitudeTerm {
    fn name(&self) -> &'static str {
        "ac_i_closed_1"
    }

    fn subject(&self) -> Subject {
        self.p.subject()
    }

    fn variables(&self) -> &[Variable] {
        self.p.variables()
    }

    fn update(&mut self, x: &StateView<'_>) {
        self.p.update(x);
        self.q.update(x);
    }

    fn eval(&self) -> f64 {
        self.apparent_power() / self.p.v1_value
    }

    fn der(&self, variable: Variable) -> Result<f64> {
        let dp = self.p.der(variable)?;
        let dq = self.q.der(variable)?;
        let s = self.apparent_power();
        let v = self.p.v1_value;
        if s == 0.0 {
            return Ok(0.0);
        }
        let mut d = (self.p.eval() * dp + self.q.eval() * dq) / (s * v);
        if variable == self.p.v1 {
            d -= s / (v * v);
        }
        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::basic::network::PiModel;

    fn transformer() -> LfBranch {
        let mut pi = PiModel::line(0.02, 0.15);
        pi.g1 = 0.001;
        pi.b1 = 0.02;
        pi.g2 = 0.002;
        pi.b2 = 0.015;
        pi.r1 = 1.02;
        pi.a1 = 0.05;
        LfBranch::new("t", 0, 1, pi)
    }

    /// Compares analytic derivatives with central differences.
    fn check_derivatives(term: &mut dyn EquationTerm, x0: &[f64], rows: &HashMap<Variable, usize>) {
        let h = 1e-6;
        term.update(&StateView::new(x0, rows));
        for &variable in term.variables().to_vec().iter() {
            let analytic = term.der(variable).unwrap();
            let row = rows[&variable];
            let mut xp = x0.to_vec();
            xp[row] += h;
            term.update(&StateView::new(&xp, rows));
            let fp = term.eval();
            let mut xm = x0.to_vec();
            xm[row] -= h;
            term.update(&StateView::new(&xm, rows));
            let fm = term.eval();
            assert_abs_diff_eq!(analytic, (fp - fm) / (2.0 * h), epsilon = 1e-6);
            term.update(&StateView::new(x0, rows));
        }
    }

    #[test]
    fn test_closed_branch_derivatives() {
        let branch = transformer();
        let mut variable_set = VariableSet::new();
        for side in [BranchSide::One, BranchSide::Two] {
            for kind in [FlowKind::Active, FlowKind::Reactive] {
                let mut term = ClosedBranchFlowTerm::new(&branch, 0, 1, side, kind, &mut variable_set, true, true);
                let rows: HashMap<Variable, usize> =
                    term.variables().iter().enumerate().map(|(i, v)| (*v, i)).collect();
                // v1, v2, ph1, ph2, a1, r1
                let x0 = [1.01, 0.97, 0.0, -0.08, 0.05, 1.02];
                check_derivatives(&mut term, &x0, &rows);
            }
        }
        let mut term = ClosedBranchCurrentMagnitudeTerm::new(&branch, 0, 1, &mut variable_set, true, false);
        let rows: HashMap<Variable, usize> =
            term.variables().iter().enumerate().map(|(i, v)| (*v, i)).collect();
        check_derivatives(&mut term, &[1.01, 0.97, 0.0, -0.08, 0.05], &rows);
    }

    #[test]
    fn test_lossless_line_flows() {
        let branch = LfBranch::new("l", 0, 1, PiModel::line(0.0, 0.1));
        let mut variable_set = VariableSet::new();
        let mut p1 = ClosedBranchFlowTerm::new(&branch, 0, 1, BranchSide::One, FlowKind::Active, &mut variable_set, false, false);
        let mut p2 = ClosedBranchFlowTerm::new(&branch, 0, 1, BranchSide::Two, FlowKind::Active, &mut variable_set, false, false);
        let rows: HashMap<Variable, usize> =
            p1.variables().iter().enumerate().map(|(i, v)| (*v, i)).collect();
        let x = [1.0, 1.0, 0.0, -0.1];
        p1.update(&StateView::new(&x, &rows));
        p2.update(&StateView::new(&x, &rows));
        // p1 = y * sin(ph1 - ph2), no losses
        assert_abs_diff_eq!(p1.eval(), 10.0 * 0.1f64.sin(), epsilon = 1e-12);
        assert_abs_diff_eq!(p1.eval() + p2.eval(), 0.0, epsilon = 1e-12);
        assert!(matches!(
            p1.der(variable_set.get_or_create(5, VariableType::BusV)),
            Err(LoadFlowError::Structural(_))
        ));
    }

    #[test]
    fn test_open_branch_charging() {
        let mut pi = PiModel::line(0.0, 0.1);
        pi.b1 = 0.05;
        pi.b2 = 0.05;
        let branch = LfBranch::new("l", 0, 1, pi);
        let mut variable_set = VariableSet::new();
        let mut q1 = OpenBranchFlowTerm::new(&branch, 0, BranchSide::Two, FlowKind::Reactive, &mut variable_set);
        let rows: HashMap<Variable, usize> = HashMap::from([(q1.variables()[0], 0)]);
        q1.update(&StateView::new(&[1.0], &rows));
        // both shunts are seen through the series reactance, a net production
        assert!(q1.eval() < 0.0);
        check_derivatives(&mut q1, &[1.03], &rows);
    }
}
