use serde::{Deserialize, Serialize};

use super::nr::NewtonRaphsonParameters;
use crate::basic::equations::VoltageInitMode;
use crate::basic::network::distribution::BalanceType;

/// Which controls are modeled when building the AC equation system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcEquationSystemCreationParameters {
    /// Generators may hold the voltage of another bus.
    pub voltage_remote_control: bool,
    /// Phase shifters hold their flow target during the first solve.
    pub phase_control: bool,
    /// Tap changers hold their voltage target during the first solve.
    pub transformer_voltage_control: bool,
    /// Static var compensators with a slope use the `v + λ·q` formulation.
    pub use_bus_pvlq: bool,
}

impl Default for AcEquationSystemCreationParameters {
    fn default() -> Self {
        Self {
            voltage_remote_control: true,
            phase_control: false,
            transformer_voltage_control: false,
            use_bus_pvlq: false,
        }
    }
}

/// Everything an AC load flow run can be configured with.
///
/// Missing fields take their default value when read from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcLoadFlowParameters {
    pub newton_raphson: NewtonRaphsonParameters,
    pub equation_system: AcEquationSystemCreationParameters,
    pub voltage_init_mode: VoltageInitMode,
    pub distributed_slack: bool,
    pub balance_type: BalanceType,
    pub load_power_factor_constant: bool,
    pub throws_on_slack_distribution_failure: bool,
    pub reactive_limits: bool,
    /// Cap applied to every outer loop, unless the loop sets its own.
    pub max_outer_loop_iterations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pq_pv_switch: Option<usize>,
}

impl Default for AcLoadFlowParameters {
    fn default() -> Self {
        Self {
            newton_raphson: NewtonRaphsonParameters::default(),
            equation_system: AcEquationSystemCreationParameters::default(),
            voltage_init_mode: VoltageInitMode::FlatStart,
            distributed_slack: true,
            balance_type: BalanceType::ProportionalToGenerationPMax,
            load_power_factor_constant: false,
            throws_on_slack_distribution_failure: false,
            reactive_limits: true,
            max_outer_loop_iterations: 20,
            max_pq_pv_switch: None,
        }
    }
}

impl AcLoadFlowParameters {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json() {
        let json = r#"{
            "newton_raphson": {"max_iteration": 10},
            "distributed_slack": false,
            "voltage_init_mode": {"mode": "uniform_values", "magnitude": 1.02, "angle": 0.0}
        }"#;
        let parameters = AcLoadFlowParameters::from_json(json).unwrap();
        assert_eq!(parameters.newton_raphson.max_iteration, 10);
        assert_eq!(parameters.newton_raphson.tolerance, 1e-8);
        assert!(!parameters.distributed_slack);
        assert!(parameters.reactive_limits);
        assert_eq!(
            parameters.voltage_init_mode,
            VoltageInitMode::UniformValues {
                magnitude: 1.02,
                angle: 0.0
            }
        );
        assert!(parameters.equation_system.voltage_remote_control);
    }

    #[test]
    fn test_json_round_trip_keeps_defaults() {
        let parameters = AcLoadFlowParameters::default();
        let json = parameters.to_json().unwrap();
        assert!(!json.contains("max_pq_pv_switch"));
        assert_eq!(AcLoadFlowParameters::from_json(&json).unwrap(), parameters);
    }
}
