//! Tabular display of load flow results.

use std::fmt;

use tabled::{Table, Tabled, settings::Style};

use crate::basic::network::{BASE_MVA, LfBranch, LfNetwork};

/// A wrapper around a float that limits the number of decimal places when printed.
#[derive(Clone, Copy, PartialEq, PartialOrd)]
pub(crate) struct FloatWrapper {
    pub(crate) value: f64,
    pub(crate) precision: usize,
}

impl FloatWrapper {
    pub fn new(value: f64, precision: usize) -> Self {
        FloatWrapper { value, precision }
    }
}

impl Default for FloatWrapper {
    fn default() -> Self {
        Self {
            value: Default::default(),
            precision: 3,
        }
    }
}

impl fmt::Display for FloatWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1$}", self.value, self.precision)
    }
}

impl fmt::Debug for FloatWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1$}", self.value, self.precision)
    }
}

/// Table row for display Bus results.
#[derive(Debug, Tabled)]
#[allow(non_snake_case)]
pub(crate) struct BusResTable {
    pub(crate) Bus: String,
    pub(crate) Vm: FloatWrapper,
    pub(crate) Va: FloatWrapper,
    pub(crate) P_mw: FloatWrapper,
    pub(crate) Q_mvar: FloatWrapper,
}

/// Table row for display branch flows, in MW and MVar on both sides.
#[derive(Debug, Tabled)]
pub(crate) struct BranchResTable {
    pub(crate) branch: String,
    pub(crate) from: String,
    pub(crate) to: String,
    pub(crate) p_from_mw: FloatWrapper,
    pub(crate) q_from_mvar: FloatWrapper,
    pub(crate) p_to_mw: FloatWrapper,
    pub(crate) q_to_mvar: FloatWrapper,
    pub(crate) pl_mw: FloatWrapper,
}

/// Power flows `(p1, q1, p2, q2)` of a closed branch at the current bus voltages, in p.u.
///
/// Zero impedance branches carry no computable flow and give `NaN`.
pub fn branch_flows(network: &LfNetwork, branch: &LfBranch) -> Option<(f64, f64, f64, f64)> {
    let (Some(bus1), Some(bus2)) = (branch.bus1, branch.bus2) else {
        return None;
    };
    let (bus1, bus2) = (network.buses().get(bus1)?, network.buses().get(bus2)?);
    let pi = &branch.pi_model;
    if pi.is_zero_impedance() {
        return Some((f64::NAN, f64::NAN, f64::NAN, f64::NAN));
    }
    let (y, ksi) = (pi.y(), pi.ksi());
    let (v1, v2) = (bus1.v, bus2.v);
    let theta1 = ksi - pi.a1 + bus2.angle - bus1.angle;
    let theta2 = ksi + pi.a1 - bus2.angle + bus1.angle;
    let w1 = pi.r1 * pi.r1 * v1 * v1;
    let w2 = v2 * v2;
    let yv = y * pi.r1 * v1 * v2;
    Some((
        w1 * (pi.g1 + y * ksi.sin()) - yv * theta1.sin(),
        w1 * (-pi.b1 + y * ksi.cos()) - yv * theta1.cos(),
        w2 * (pi.g2 + y * ksi.sin()) - yv * theta2.sin(),
        w2 * (-pi.b2 + y * ksi.cos()) - yv * theta2.cos(),
    ))
}

fn bus_rows(network: &LfNetwork) -> Vec<BusResTable> {
    let mut injections = vec![(0.0, 0.0); network.buses().len()];
    for branch in network.branches().iter().filter(|b| !b.disabled) {
        let Some((p1, q1, p2, q2)) = branch_flows(network, branch) else {
            continue;
        };
        if let Some(bus1) = branch.bus1 {
            injections[bus1].0 += p1;
            injections[bus1].1 += q1;
        }
        if let Some(bus2) = branch.bus2 {
            injections[bus2].0 += p2;
            injections[bus2].1 += q2;
        }
    }
    network
        .buses()
        .iter()
        .zip(injections)
        .map(|(bus, (p, q))| BusResTable {
            Bus: bus.id.clone(),
            Vm: FloatWrapper::new(bus.v, 4),
            Va: FloatWrapper::new(bus.angle.to_degrees(), 3),
            P_mw: FloatWrapper::new(p * BASE_MVA, 3),
            Q_mvar: FloatWrapper::new((q - bus.shunt_b * bus.v * bus.v) * BASE_MVA, 3),
        })
        .collect()
}

fn branch_rows(network: &LfNetwork) -> Vec<BranchResTable> {
    let bus_id = |num: Option<usize>| {
        num.and_then(|n| network.buses().get(n))
            .map_or_else(|| "-".to_owned(), |b| b.id.clone())
    };
    network
        .branches()
        .iter()
        .filter(|b| !b.disabled)
        .filter_map(|branch| {
            let (p1, q1, p2, q2) = branch_flows(network, branch)?;
            Some(BranchResTable {
                branch: branch.id.clone(),
                from: bus_id(branch.bus1),
                to: bus_id(branch.bus2),
                p_from_mw: FloatWrapper::new(p1 * BASE_MVA, 3),
                q_from_mvar: FloatWrapper::new(q1 * BASE_MVA, 3),
                p_to_mw: FloatWrapper::new(p2 * BASE_MVA, 3),
                q_to_mvar: FloatWrapper::new(q2 * BASE_MVA, 3),
                pl_mw: FloatWrapper::new((p1 + p2) * BASE_MVA, 3),
            })
        })
        .collect()
}

/// Bus voltages and net injections of `network` as a text table.
pub fn format_bus_results(network: &LfNetwork) -> String {
    Table::new(bus_rows(network)).with(Style::markdown()).to_string()
}

/// Branch flows of `network` as a text table.
pub fn format_branch_results(network: &LfNetwork) -> String {
    Table::new(branch_rows(network)).with(Style::markdown()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::ac::{AcLoadFlowEngine, AcLoadFlowParameters};
    use crate::testcases::two_bus_network;
    use approx::assert_relative_eq;

    #[test]
    fn test_lossless_line_balance() {
        let network = two_bus_network().unwrap();
        let mut engine: AcLoadFlowEngine = AcLoadFlowEngine::new(network, AcLoadFlowParameters::default()).unwrap();
        let result = engine.run().unwrap();
        assert!(result.is_ok());

        let rows = bus_rows(engine.network());
        assert_relative_eq!(rows[1].P_mw.value, -100.0, epsilon = 1e-4);
        assert_relative_eq!(rows[0].P_mw.value, 100.0, epsilon = 1e-4);
        let branches = branch_rows(engine.network());
        assert_eq!(branches.len(), 1);
        assert_relative_eq!(branches[0].pl_mw.value, 0.0, epsilon = 1e-6);

        let table = format_bus_results(engine.network());
        assert!(table.contains("Vm"));
        assert!(table.contains("b1"));
        println!("{}", table);
        println!("{}", format_branch_results(engine.network()));
    }

    #[test]
    fn test_float_precision() {
        assert_eq!(FloatWrapper::new(1.23456, 2).to_string(), "1.23");
        assert_eq!(format!("{:?}", FloatWrapper::default()), "0.000");
    }
}
