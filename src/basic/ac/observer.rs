//! Hooks into the stages of an AC load flow run.
//!
//! Observers only look: nothing they do can change the outcome of a run.

use nalgebra::DVector;
use nalgebra_sparse::CscMatrix;
use tracing::{debug, trace};

use crate::basic::equations::EquationSystem;
use crate::basic::network::LfNetwork;

/// Number of mismatches reported by [`AcLoadFlowLogger`] at each iteration.
const LARGEST_MISMATCH_COUNT: usize = 5;

/// Callbacks fired by the engine and the Newton-Raphson solver. Every method
/// has an empty default body.
#[allow(unused_variables)]
pub trait AcLoadFlowObserver {
    fn before_equation_system_creation(&mut self) {}

    fn after_equation_system_creation(&mut self, system: &EquationSystem) {}

    fn before_voltage_initializer_preparation(&mut self) {}

    fn after_voltage_initializer_preparation(&mut self) {}

    fn begin_iteration(&mut self, iteration: usize) {}

    fn before_jacobian_build(&mut self, iteration: usize) {}

    fn after_jacobian_build(&mut self, matrix: &CscMatrix<f64>, iteration: usize) {}

    fn before_lu_solve(&mut self, iteration: usize) {}

    fn after_lu_solve(&mut self, iteration: usize) {}

    fn before_state_update(&mut self, iteration: usize) {}

    fn after_state_update(&mut self, x: &DVector<f64>, iteration: usize) {}

    fn before_equation_vector_update(&mut self, iteration: usize) {}

    fn after_equation_vector_update(&mut self, system: &EquationSystem, iteration: usize) {}

    fn before_stopping_criteria_evaluation(&mut self, mismatch: &DVector<f64>, system: &EquationSystem, iteration: usize) {}

    fn after_stopping_criteria_evaluation(&mut self, norm: f64, iteration: usize) {}

    fn end_iteration(&mut self, iteration: usize) {}

    fn before_pv_buses_reactive_power_update(&mut self) {}

    fn after_pv_buses_reactive_power_update(&mut self, network: &LfNetwork) {}

    fn before_outer_loop_status_check(&mut self, outer_loop_iteration: usize, outer_loop_type: &str) {}

    fn after_outer_loop_status_check(&mut self, outer_loop_iteration: usize, outer_loop_type: &str, stable: bool) {}

    fn before_outer_loop_body(&mut self, outer_loop_iteration: usize, outer_loop_type: &str) {}

    fn after_outer_loop_body(&mut self, outer_loop_iteration: usize, outer_loop_type: &str) {}

    fn before_load_flow(&mut self, network: &LfNetwork) {}

    fn after_load_flow(&mut self, network: &LfNetwork) {}
}

/// Observer that ignores every event.
impl AcLoadFlowObserver for () {}

/// Logs the progress of a run through `tracing`.
#[derive(Debug, Default)]
pub struct AcLoadFlowLogger;

impl AcLoadFlowObserver for AcLoadFlowLogger {
    fn after_equation_system_creation(&mut self, system: &EquationSystem) {
        debug!(equations = system.equations().count(), "equation system created");
    }

    fn begin_iteration(&mut self, iteration: usize) {
        trace!("start iteration {}", iteration);
    }

    fn after_jacobian_build(&mut self, matrix: &CscMatrix<f64>, iteration: usize) {
        trace!(nnz = matrix.nnz(), "Jacobian ready at iteration {}", iteration);
    }

    fn before_stopping_criteria_evaluation(&mut self, mismatch: &DVector<f64>, system: &EquationSystem, iteration: usize) {
        if !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }
        if let Ok(largest) = system.find_largest_mismatches(mismatch.as_slice(), LARGEST_MISMATCH_COUNT) {
            for (equation, value) in largest {
                trace!("mismatch for {} at iteration {}: {:e}", equation, iteration, value);
            }
        }
    }

    fn after_stopping_criteria_evaluation(&mut self, norm: f64, iteration: usize) {
        debug!("|f(x)| = {:e} at iteration {}", norm, iteration);
    }

    fn after_outer_loop_status_check(&mut self, outer_loop_iteration: usize, outer_loop_type: &str, stable: bool) {
        debug!(
            "outer loop '{}' iteration {}: {}",
            outer_loop_type,
            outer_loop_iteration,
            if stable { "stable" } else { "unstable" }
        );
    }
}

/// Forwards every event to a list of observers, in order.
#[derive(Default)]
pub struct MultipleAcLoadFlowObserver {
    observers: Vec<Box<dyn AcLoadFlowObserver>>,
}

impl MultipleAcLoadFlowObserver {
    pub fn new(observers: Vec<Box<dyn AcLoadFlowObserver>>) -> Self {
        Self { observers }
    }

    pub fn push(&mut self, observer: Box<dyn AcLoadFlowObserver>) {
        self.observers.push(observer);
    }
}

macro_rules! forward {
    ($($name:ident($($arg:ident: $ty:ty),*);)*) => {
        $(
            fn $name(&mut self, $($arg: $ty),*) {
                for observer in self.observers.iter_mut() {
                    observer.$name($($arg),*);
                }
            }
        )*
    };
}

impl AcLoadFlowObserver for MultipleAcLoadFlowObserver {
    forward! {
        before_equation_system_creation();
        after_equation_system_creation(system: &EquationSystem);
        before_voltage_initializer_preparation();
        after_voltage_initializer_preparation();
        begin_iteration(iteration: usize);
        before_jacobian_build(iteration: usize);
        after_jacobian_build(matrix: &CscMatrix<f64>, iteration: usize);
        before_lu_solve(iteration: usize);
        after_lu_solve(iteration: usize);
        before_state_update(iteration: usize);
        after_state_update(x: &DVector<f64>, iteration: usize);
        before_equation_vector_update(iteration: usize);
        after_equation_vector_update(system: &EquationSystem, iteration: usize);
        before_stopping_criteria_evaluation(mismatch: &DVector<f64>, system: &EquationSystem, iteration: usize);
        after_stopping_criteria_evaluation(norm: f64, iteration: usize);
        end_iteration(iteration: usize);
        before_pv_buses_reactive_power_update();
        after_pv_buses_reactive_power_update(network: &LfNetwork);
        before_outer_loop_status_check(outer_loop_iteration: usize, outer_loop_type: &str);
        after_outer_loop_status_check(outer_loop_iteration: usize, outer_loop_type: &str, stable: bool);
        before_outer_loop_body(outer_loop_iteration: usize, outer_loop_type: &str);
        after_outer_loop_body(outer_loop_iteration: usize, outer_loop_type: &str);
        before_load_flow(network: &LfNetwork);
        after_load_flow(network: &LfNetwork);
    }
}
