//! Newton-Raphson on the indexed equation system.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::observer::AcLoadFlowObserver;
use crate::basic::equations::{
    EquationKey, EquationSystem, EquationType, EquationUpdateType, JacobianMatrixCache,
    PreviousValueVoltageInitializer, VariableType, VoltageInitializer,
};
use crate::basic::error::Result;
use crate::basic::network::LfNetwork;
use crate::basic::solver::Solve;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NewtonRaphsonStatus {
    Converged,
    MaxIterationReached,
    /// The linear solve failed or produced non finite values.
    SolverFailed,
    /// Converged to bus voltages outside of the realistic range.
    UnrealisticState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonRaphsonParameters {
    /// Iteration cap of one run.
    pub max_iteration: usize,
    /// Euclidean norm of the mismatch vector below which a run converges.
    pub tolerance: f64,
    pub min_realistic_voltage: f64,
    pub max_realistic_voltage: f64,
}

impl Default for NewtonRaphsonParameters {
    fn default() -> Self {
        Self {
            max_iteration: 30,
            tolerance: 1e-8,
            min_realistic_voltage: 0.5,
            max_realistic_voltage: 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NewtonRaphsonResult {
    pub status: NewtonRaphsonStatus,
    /// Iterations done so far by this solver, across all its runs.
    pub iteration: usize,
    /// Active power the slack bus injects beyond its target.
    pub slack_bus_active_power_mismatch: f64,
}

pub struct StoppingCriteriaResult {
    pub stop: bool,
    pub norm: f64,
}

pub trait StoppingCriteria {
    fn test(&self, mismatch: &DVector<f64>) -> StoppingCriteriaResult;
}

/// Stops once the 2-norm of the mismatch drops under a tolerance.
#[derive(Debug, Clone, Copy)]
pub struct DefaultStoppingCriteria {
    pub tolerance: f64,
}

impl StoppingCriteria for DefaultStoppingCriteria {
    fn test(&self, mismatch: &DVector<f64>) -> StoppingCriteriaResult {
        let norm = mismatch.norm();
        StoppingCriteriaResult {
            stop: norm < self.tolerance,
            norm,
        }
    }
}

/// State shared by successive runs on the same system: the iteration count
/// keeps growing, and every run after the first starts from the voltages
/// stored in the network.
pub struct NewtonRaphson {
    parameters: NewtonRaphsonParameters,
    stopping_criteria: Box<dyn StoppingCriteria>,
    iteration: usize,
    runs: usize,
}

impl NewtonRaphson {
    pub fn new(parameters: NewtonRaphsonParameters) -> Self {
        let stopping_criteria = Box::new(DefaultStoppingCriteria {
            tolerance: parameters.tolerance,
        });
        Self {
            parameters,
            stopping_criteria,
            iteration: 0,
            runs: 0,
        }
    }

    pub fn with_stopping_criteria(mut self, stopping_criteria: Box<dyn StoppingCriteria>) -> Self {
        self.stopping_criteria = stopping_criteria;
        self
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// One Newton-Raphson run, up to `max_iteration` iterations.
    ///
    /// Targets are recomputed from the network at the start, so outer loop
    /// changes are picked up. On convergence the solution is written back to
    /// the network and the after-NR equations are refreshed.
    pub fn run<S: Solve + Default>(
        &mut self,
        network: &mut LfNetwork,
        system: &mut EquationSystem,
        jacobian: &mut JacobianMatrixCache<S>,
        initializer: &mut dyn VoltageInitializer,
        observer: &mut dyn AcLoadFlowObserver,
    ) -> Result<NewtonRaphsonResult> {
        self.runs += 1;
        if self.runs == 1 {
            self.solve(network, system, jacobian, initializer, observer)
        } else {
            self.solve(network, system, jacobian, &mut PreviousValueVoltageInitializer, observer)
        }
    }

    fn solve<S: Solve + Default>(
        &mut self,
        network: &mut LfNetwork,
        system: &mut EquationSystem,
        jacobian: &mut JacobianMatrixCache<S>,
        initializer: &mut dyn VoltageInitializer,
        observer: &mut dyn AcLoadFlowObserver,
    ) -> Result<NewtonRaphsonResult> {
        observer.before_voltage_initializer_preparation();
        initializer.prepare(network);
        observer.after_voltage_initializer_preparation();

        let mut x = system.create_state_vector(network, &*initializer)?;
        system.update_equations(x.as_slice(), EquationUpdateType::Default)?;
        let targets = system.create_target_vector(network)?;
        let mut fx = system.create_equation_vector()?;
        fx -= &targets;

        let mut status = None;
        let mut run_iteration = 0;
        while status.is_none() {
            if run_iteration >= self.parameters.max_iteration {
                status = Some(NewtonRaphsonStatus::MaxIterationReached);
                break;
            }
            status = self.run_iteration(system, jacobian, observer, &mut x, &mut fx, &targets)?;
            run_iteration += 1;
        }
        let mut status = status.unwrap_or(NewtonRaphsonStatus::MaxIterationReached);

        if status == NewtonRaphsonStatus::Converged {
            if self.is_state_unrealistic(system, &x)? {
                status = NewtonRaphsonStatus::UnrealisticState;
            } else {
                system.update_network(x.as_slice(), network)?;
                system.update_equations(x.as_slice(), EquationUpdateType::AfterNr)?;
            }
        }
        if status != NewtonRaphsonStatus::Converged {
            warn!("Newton-Raphson of network {} ended with status {:?}", network.num, status);
        }

        let slack_bus_active_power_mismatch = slack_bus_active_power_mismatch(network, system)?;
        debug!(
            "Newton-Raphson of network {} done after {} iterations: {:?}",
            network.num, run_iteration, status
        );
        Ok(NewtonRaphsonResult {
            status,
            iteration: self.iteration,
            slack_bus_active_power_mismatch,
        })
    }

    fn run_iteration<S: Solve + Default>(
        &mut self,
        system: &mut EquationSystem,
        jacobian: &mut JacobianMatrixCache<S>,
        observer: &mut dyn AcLoadFlowObserver,
        x: &mut DVector<f64>,
        fx: &mut DVector<f64>,
        targets: &DVector<f64>,
    ) -> Result<Option<NewtonRaphsonStatus>> {
        let iteration = self.iteration;
        observer.begin_iteration(iteration);

        observer.before_jacobian_build(iteration);
        let j = jacobian.get(system)?;
        observer.after_jacobian_build(j.matrix(), iteration);

        // J dx = f(x) - target
        let mut dx = fx.clone();
        observer.before_lu_solve(iteration);
        let solved = j.solve(dx.as_mut_slice());
        observer.after_lu_solve(iteration);
        self.iteration += 1;
        if let Err(e) = solved {
            warn!("linear solve failed at iteration {}: {}", iteration, e);
            observer.end_iteration(iteration);
            return Ok(Some(NewtonRaphsonStatus::SolverFailed));
        }
        if dx.iter().any(|v| !v.is_finite()) {
            warn!("non finite state update at iteration {}", iteration);
            observer.end_iteration(iteration);
            return Ok(Some(NewtonRaphsonStatus::SolverFailed));
        }

        observer.before_state_update(iteration);
        *x -= &dx;
        system.update_equations(x.as_slice(), EquationUpdateType::Default)?;
        observer.after_state_update(x, iteration);

        observer.before_equation_vector_update(iteration);
        system.update_equation_vector(fx.as_mut_slice())?;
        *fx -= targets;
        observer.after_equation_vector_update(system, iteration);

        observer.before_stopping_criteria_evaluation(fx, system, iteration);
        let test = self.stopping_criteria.test(fx);
        observer.after_stopping_criteria_evaluation(test.norm, iteration);

        observer.end_iteration(iteration);
        if !test.norm.is_finite() {
            return Ok(Some(NewtonRaphsonStatus::SolverFailed));
        }
        Ok(test.stop.then_some(NewtonRaphsonStatus::Converged))
    }

    fn is_state_unrealistic(&self, system: &mut EquationSystem, x: &DVector<f64>) -> Result<bool> {
        let index = system.index()?;
        let mut unrealistic = false;
        for (row, variable) in index.variables().iter().enumerate() {
            if variable.ty() != VariableType::BusV {
                continue;
            }
            let v = x[row];
            if v < self.parameters.min_realistic_voltage || v > self.parameters.max_realistic_voltage {
                debug!("bus {} has an unrealistic voltage magnitude: {}", variable.num(), v);
                unrealistic = true;
            }
        }
        Ok(unrealistic)
    }
}

/// `eval(slack P equation) - slack target P`. The slack balance equation is
/// inactive but its terms are still updated with the state.
fn slack_bus_active_power_mismatch(network: &LfNetwork, system: &EquationSystem) -> Result<f64> {
    let slack = network.slack_bus()?;
    let key = EquationKey::new(slack.num, EquationType::BusP);
    Ok(system.eval_equation(key)? - slack.target_p())
}
