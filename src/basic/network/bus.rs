//! Buses and what is connected to them. All quantities are per unit.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// A closed interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limit<T> {
    /// Minimum value.
    pub min: T,
    /// Maximum value.
    pub max: T,
}

impl Limit<f64> {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn unbounded() -> Self {
        Self::new(f64::NEG_INFINITY, f64::INFINITY)
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }
}

impl Default for Limit<f64> {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// A generating unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LfGenerator {
    pub id: String,
    pub target_p: f64,
    /// Reactive setpoint, only used when the unit does not regulate voltage.
    #[serde(default)]
    pub target_q: f64,
    #[serde(default)]
    pub p_limit: Limit<f64>,
    #[serde(default)]
    pub q_limit: Limit<f64>,
    #[serde(default)]
    pub voltage_regulator_on: bool,
    /// Takes part in slack distribution.
    #[serde(default = "default_true")]
    pub participating: bool,
}

fn default_true() -> bool {
    true
}

impl LfGenerator {
    pub fn new(id: impl Into<String>, target_p: f64) -> Self {
        Self {
            id: id.into(),
            target_p,
            target_q: 0.0,
            p_limit: Limit::new(0.0, f64::INFINITY),
            q_limit: Limit::unbounded(),
            voltage_regulator_on: false,
            participating: true,
        }
    }

    pub fn with_p_limit(mut self, min: f64, max: f64) -> Self {
        self.p_limit = Limit::new(min, max);
        self
    }

    pub fn with_q_limit(mut self, min: f64, max: f64) -> Self {
        self.q_limit = Limit::new(min, max);
        self
    }

    pub fn with_voltage_regulation(mut self) -> Self {
        self.voltage_regulator_on = true;
        self
    }
}

/// A static var compensator with a voltage/reactive power slope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LfStaticVarCompensator {
    pub id: String,
    pub slope: f64,
    #[serde(default = "default_true")]
    pub voltage_regulator_on: bool,
}

/// Voltage target of a bus held by one or more generator buses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltageControl {
    pub target_value: f64,
    /// Controller bus numbers, the first one leads the group.
    pub controllers: Vec<usize>,
}

/// Voltage target of a bus held by transformer tap changers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscreteVoltageControl {
    pub target_value: f64,
    /// Controller branch numbers, the first one leads the group.
    pub controllers: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LfBus {
    pub id: String,
    /// Position in [`LfNetwork`](super::LfNetwork), assigned when added.
    #[serde(default)]
    pub num: usize,
    #[serde(default)]
    pub slack: bool,
    /// Nominal voltage in kV.
    #[serde(default = "default_v")]
    pub nominal_v: f64,
    #[serde(default = "default_v")]
    pub v: f64,
    #[serde(default)]
    pub angle: f64,
    #[serde(default)]
    pub generators: Vec<LfGenerator>,
    /// Reactive generation not used for voltage regulation.
    #[serde(default)]
    pub generation_target_q: f64,
    #[serde(default)]
    pub load_target_p: f64,
    #[serde(default)]
    pub load_target_q: f64,
    /// Part of `load_target_p` that does not follow the load scaling.
    #[serde(default)]
    pub fixed_load_target_p: f64,
    #[serde(default)]
    pub load_count: usize,
    #[serde(default)]
    pub shunt_b: f64,
    #[serde(default)]
    pub static_var_compensators: Vec<LfStaticVarCompensator>,
    /// Set on the controlled bus.
    #[serde(default)]
    pub voltage_control: Option<VoltageControl>,
    /// Set on a controller bus.
    #[serde(default)]
    pub controlled_bus: Option<usize>,
    #[serde(default)]
    pub voltage_controller_enabled: bool,
    #[serde(default)]
    pub discrete_voltage_control: Option<DiscreteVoltageControl>,
    /// Reactive power injected by the controllers, evaluated after each
    /// converged run. `NaN` on buses without voltage control.
    #[serde(default = "default_nan")]
    pub calculated_q: f64,
    /// Times the bus went back from fixed reactive power to voltage control.
    #[serde(default)]
    pub pq_pv_switch_count: usize,
    #[serde(default)]
    pub fictitious: bool,
    #[serde(default)]
    pub disabled: bool,
}

fn default_v() -> f64 {
    1.0
}

fn default_nan() -> f64 {
    f64::NAN
}

impl LfBus {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            num: 0,
            slack: false,
            nominal_v: 1.0,
            v: 1.0,
            angle: 0.0,
            generators: Vec::new(),
            generation_target_q: 0.0,
            load_target_p: 0.0,
            load_target_q: 0.0,
            fixed_load_target_p: 0.0,
            load_count: 0,
            shunt_b: 0.0,
            static_var_compensators: Vec::new(),
            voltage_control: None,
            controlled_bus: None,
            voltage_controller_enabled: false,
            discrete_voltage_control: None,
            calculated_q: f64::NAN,
            pq_pv_switch_count: 0,
            fictitious: false,
            disabled: false,
        }
    }

    pub fn with_slack(mut self) -> Self {
        self.slack = true;
        self
    }

    pub fn with_load(mut self, p: f64, q: f64) -> Self {
        self.load_target_p += p;
        self.load_target_q += q;
        self.load_count += 1;
        self
    }

    /// Adds a generator. Non regulating units contribute their reactive
    /// setpoint to `generation_target_q`.
    pub fn with_generator(mut self, generator: LfGenerator) -> Self {
        if !generator.voltage_regulator_on {
            self.generation_target_q += generator.target_q;
        }
        self.generators.push(generator);
        self
    }

    pub fn with_shunt(mut self, b: f64) -> Self {
        self.shunt_b += b;
        self
    }

    pub fn with_static_var_compensator(mut self, svc: LfStaticVarCompensator) -> Self {
        self.static_var_compensators.push(svc);
        self
    }

    pub fn generation_target_p(&self) -> f64 {
        self.generators.iter().map(|g| g.target_p).sum()
    }

    pub fn target_p(&self) -> f64 {
        self.generation_target_p() - self.load_target_p
    }

    pub fn target_q(&self) -> f64 {
        self.generation_target_q - self.load_target_q
    }

    /// Sum of the minimum reactive limits of the voltage regulating units.
    pub fn min_q(&self) -> f64 {
        self.regulating_generators().map(|g| g.q_limit.min).sum()
    }

    pub fn max_q(&self) -> f64 {
        self.regulating_generators().map(|g| g.q_limit.max).sum()
    }

    fn regulating_generators(&self) -> impl Iterator<Item = &LfGenerator> {
        self.generators.iter().filter(|g| g.voltage_regulator_on)
    }

    pub fn has_voltage_regulating_generator(&self) -> bool {
        self.regulating_generators().next().is_some()
    }

    /// Whether the bus voltage is held by generators or compensators.
    pub fn is_voltage_controlled(&self) -> bool {
        self.voltage_control.is_some()
    }

    pub fn is_transformer_voltage_controlled(&self) -> bool {
        self.discrete_voltage_control.is_some()
    }

    /// Load part that follows a proportional scaling.
    pub fn variable_load_target_p(&self) -> f64 {
        self.load_target_p - self.fixed_load_target_p
    }

    pub fn voltage(&self) -> Complex64 {
        Complex64::from_polar(self.v, self.angle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_targets() {
        let bus = LfBus::new("b")
            .with_load(0.5, 0.2)
            .with_generator(
                LfGenerator::new("g1", 1.2)
                    .with_q_limit(-0.3, 0.4)
                    .with_voltage_regulation(),
            )
            .with_generator(LfGenerator {
                target_q: 0.1,
                ..LfGenerator::new("g2", 0.3)
            });
        assert!((bus.target_p() - 1.0).abs() < 1e-12);
        assert!((bus.target_q() + 0.1).abs() < 1e-12);
        assert_eq!(bus.min_q(), -0.3);
        assert_eq!(bus.max_q(), 0.4);
        assert!(bus.has_voltage_regulating_generator());
    }

    #[test]
    fn test_limit_clamp() {
        let limit = Limit::new(-1.0, 2.0);
        assert_eq!(limit.clamp(3.0), 2.0);
        assert_eq!(limit.clamp(-4.0), -1.0);
        assert_eq!(limit.clamp(0.5), 0.5);
    }
}
