use serde::{Deserialize, Serialize};

use crate::basic::network::{LfBus, LfNetwork};

/// Provides the starting bus voltages of a Newton-Raphson run.
pub trait VoltageInitializer {
    fn prepare(&mut self, _network: &LfNetwork) {}

    fn magnitude(&self, bus: &LfBus) -> f64;

    fn angle(&self, bus: &LfBus) -> f64;
}

/// Same magnitude and angle on every bus. The default is the flat start
/// `1.0 p.u. / 0 rad`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformValueVoltageInitializer {
    pub magnitude: f64,
    pub angle: f64,
}

impl Default for UniformValueVoltageInitializer {
    fn default() -> Self {
        Self {
            magnitude: 1.0,
            angle: 0.0,
        }
    }
}

impl VoltageInitializer for UniformValueVoltageInitializer {
    fn magnitude(&self, _bus: &LfBus) -> f64 {
        self.magnitude
    }

    fn angle(&self, _bus: &LfBus) -> f64 {
        self.angle
    }
}

/// Starts from the voltages currently stored in the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreviousValueVoltageInitializer;

impl VoltageInitializer for PreviousValueVoltageInitializer {
    fn magnitude(&self, bus: &LfBus) -> f64 {
        bus.v
    }

    fn angle(&self, bus: &LfBus) -> f64 {
        bus.angle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum VoltageInitMode {
    #[default]
    FlatStart,
    UniformValues {
        magnitude: f64,
        angle: f64,
    },
    PreviousValues,
}

impl VoltageInitMode {
    pub fn initializer(&self) -> Box<dyn VoltageInitializer> {
        match *self {
            VoltageInitMode::FlatStart => Box::new(UniformValueVoltageInitializer::default()),
            VoltageInitMode::UniformValues { magnitude, angle } => {
                Box::new(UniformValueVoltageInitializer { magnitude, angle })
            }
            VoltageInitMode::PreviousValues => Box::new(PreviousValueVoltageInitializer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initializers() {
        let mut bus = LfBus::new("b");
        bus.v = 1.04;
        bus.angle = -0.2;
        let flat = VoltageInitMode::FlatStart.initializer();
        assert_eq!((flat.magnitude(&bus), flat.angle(&bus)), (1.0, 0.0));
        let previous = VoltageInitMode::PreviousValues.initializer();
        assert_eq!((previous.magnitude(&bus), previous.angle(&bus)), (1.04, -0.2));
        let uniform = VoltageInitMode::UniformValues {
            magnitude: 0.9,
            angle: 0.1,
        }
        .initializer();
        assert_eq!((uniform.magnitude(&bus), uniform.angle(&bus)), (0.9, 0.1));
    }
}
