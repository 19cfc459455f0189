use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Impedance below which a branch is treated as a zero impedance link.
pub const LOW_IMPEDANCE_THRESHOLD: f64 = 1e-8;

/// Pi model of a branch with an ideal transformer on side 1.
///
/// `r1` is the ratio and `a1` the phase shift (radians) of the transformer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PiModel {
    pub r: f64,
    pub x: f64,
    #[serde(default)]
    pub g1: f64,
    #[serde(default)]
    pub b1: f64,
    #[serde(default)]
    pub g2: f64,
    #[serde(default)]
    pub b2: f64,
    #[serde(default = "default_ratio")]
    pub r1: f64,
    #[serde(default)]
    pub a1: f64,
}

fn default_ratio() -> f64 {
    1.0
}

impl PiModel {
    pub fn line(r: f64, x: f64) -> Self {
        Self {
            r,
            x,
            g1: 0.0,
            b1: 0.0,
            g2: 0.0,
            b2: 0.0,
            r1: 1.0,
            a1: 0.0,
        }
    }

    pub fn impedance(&self) -> Complex64 {
        Complex64::new(self.r, self.x)
    }

    /// Series admittance magnitude.
    pub fn y(&self) -> f64 {
        1.0 / self.impedance().norm()
    }

    pub fn ksi(&self) -> f64 {
        self.r.atan2(self.x)
    }

    pub fn is_zero_impedance(&self) -> bool {
        self.impedance().norm() < LOW_IMPEDANCE_THRESHOLD
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseControlMode {
    Off,
    Controller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseControlUnit {
    /// Active power flow on side 1.
    Mw,
    /// Current magnitude on side 1.
    A,
}

/// Phase shifter holding a flow target by moving `a1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscretePhaseControl {
    pub mode: PhaseControlMode,
    pub unit: PhaseControlUnit,
    pub target_value: f64,
    /// Available phase shifts, in radians.
    pub alpha_taps: Vec<f64>,
}

/// Tap changer holding the voltage of a remote bus by moving `r1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerVoltageControl {
    pub controlled_bus: usize,
    pub ratio_taps: Vec<f64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LfBranch {
    pub id: String,
    #[serde(default)]
    pub num: usize,
    /// `None` when side 1 is open.
    pub bus1: Option<usize>,
    /// `None` when side 2 is open.
    pub bus2: Option<usize>,
    pub pi_model: PiModel,
    #[serde(default)]
    pub phase_control: Option<DiscretePhaseControl>,
    #[serde(default)]
    pub voltage_control: Option<TransformerVoltageControl>,
    #[serde(default)]
    pub disabled: bool,
}

impl LfBranch {
    pub fn new(id: impl Into<String>, bus1: usize, bus2: usize, pi_model: PiModel) -> Self {
        Self {
            id: id.into(),
            num: 0,
            bus1: Some(bus1),
            bus2: Some(bus2),
            pi_model,
            phase_control: None,
            voltage_control: None,
            disabled: false,
        }
    }

    pub fn is_phase_controlled(&self) -> bool {
        self.phase_control
            .as_ref()
            .is_some_and(|pc| pc.mode != PhaseControlMode::Off)
    }

    pub fn is_voltage_controller(&self) -> bool {
        self.voltage_control.as_ref().is_some_and(|vc| vc.enabled)
    }
}

/// Closest value of `taps` to `value`, `value` itself when there are no taps.
pub fn nearest_tap(taps: &[f64], value: f64) -> f64 {
    taps.iter()
        .copied()
        .min_by(|a, b| (a - value).abs().total_cmp(&(b - value).abs()))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pi_model_constants() {
        let pi = PiModel::line(0.0, 0.1);
        assert!((pi.y() - 10.0).abs() < 1e-12);
        assert_eq!(pi.ksi(), 0.0);
        assert!(!pi.is_zero_impedance());
        assert!(PiModel::line(0.0, 0.0).is_zero_impedance());
    }

    #[test]
    fn test_nearest_tap() {
        let taps = [0.9, 0.95, 1.0, 1.05];
        assert_eq!(nearest_tap(&taps, 0.97), 0.95);
        assert_eq!(nearest_tap(&taps, 1.2), 1.05);
        assert_eq!(nearest_tap(&[], 0.3), 0.3);
    }
}
