//! Runs the AC load flow of one network: a first Newton-Raphson solve, then
//! the outer loops until none of them changes anything.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use super::equation_system::create_ac_equation_system;
use super::nr::{NewtonRaphson, NewtonRaphsonResult, NewtonRaphsonStatus};
use super::observer::{AcLoadFlowLogger, AcLoadFlowObserver};
use super::outerloop::{OuterLoop, OuterLoopContext, OuterLoopStatus, default_outer_loops};
use super::parameters::AcLoadFlowParameters;
use crate::basic::equations::{
    EquationKey, EquationSystem, EquationType, JacobianMatrixCache, VariableSet, VoltageInitializer,
};
use crate::basic::error::Result;
use crate::basic::network::LfNetwork;
use crate::basic::solver::{DefaultSolver, Solve};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AcLoadFlowResult {
    pub network_num: usize,
    /// Outer loop iterations of every type, plus one for the initial solve.
    pub outer_loop_iterations: usize,
    pub newton_raphson_iterations: usize,
    pub status: NewtonRaphsonStatus,
    pub slack_bus_active_power_mismatch: f64,
}

impl AcLoadFlowResult {
    pub fn is_ok(&self) -> bool {
        self.status == NewtonRaphsonStatus::Converged
    }
}

impl fmt::Display for AcLoadFlowResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AcLoadFlowResult(network={}, outerLoopIterations={}, newtonRaphsonIterations={}, status={:?}, slackBusActivePowerMismatch={:e})",
            self.network_num,
            self.outer_loop_iterations,
            self.newton_raphson_iterations,
            self.status,
            self.slack_bus_active_power_mismatch
        )
    }
}

/// Owns everything a load flow run mutates: the network, its equation
/// system and the Jacobian cache. Engines of different networks share
/// nothing and can run on separate threads.
pub struct AcLoadFlowEngine<S: Solve + Default = DefaultSolver> {
    network: LfNetwork,
    parameters: AcLoadFlowParameters,
    variable_set: VariableSet,
    equation_system: EquationSystem,
    jacobian: JacobianMatrixCache<S>,
    outer_loops: Vec<Box<dyn OuterLoop>>,
    observer: Box<dyn AcLoadFlowObserver>,
    voltage_initializer: Box<dyn VoltageInitializer>,
}

impl AcLoadFlowEngine<DefaultSolver> {
    pub fn new(network: LfNetwork, parameters: AcLoadFlowParameters) -> Result<Self> {
        Self::with_observer(network, parameters, Box::new(AcLoadFlowLogger))
    }
}

impl<S: Solve + Default> AcLoadFlowEngine<S> {
    /// Builds the equation system of `network`. The observer sees the
    /// creation, so it is given here rather than set afterwards.
    pub fn with_observer(
        network: LfNetwork,
        parameters: AcLoadFlowParameters,
        mut observer: Box<dyn AcLoadFlowObserver>,
    ) -> Result<Self> {
        observer.before_equation_system_creation();
        let mut variable_set = VariableSet::new();
        let mut equation_system = create_ac_equation_system(&network, &mut variable_set, &parameters.equation_system)?;
        let jacobian = JacobianMatrixCache::new(&mut equation_system);
        observer.after_equation_system_creation(&equation_system);

        Ok(Self {
            outer_loops: default_outer_loops(&parameters),
            voltage_initializer: parameters.voltage_init_mode.initializer(),
            network,
            parameters,
            variable_set,
            equation_system,
            jacobian,
            observer,
        })
    }

    /// Replaces the outer loops derived from the parameters. They run in
    /// order, innermost first.
    pub fn with_outer_loops(mut self, outer_loops: Vec<Box<dyn OuterLoop>>) -> Self {
        self.outer_loops = outer_loops;
        self
    }

    pub fn with_voltage_initializer(mut self, voltage_initializer: Box<dyn VoltageInitializer>) -> Self {
        self.voltage_initializer = voltage_initializer;
        self
    }

    pub fn network(&self) -> &LfNetwork {
        &self.network
    }

    pub fn into_network(self) -> LfNetwork {
        self.network
    }

    pub fn parameters(&self) -> &AcLoadFlowParameters {
        &self.parameters
    }

    pub fn variable_set(&self) -> &VariableSet {
        &self.variable_set
    }

    pub fn equation_system(&self) -> &EquationSystem {
        &self.equation_system
    }

    pub fn jacobian(&self) -> &JacobianMatrixCache<S> {
        &self.jacobian
    }

    /// Frees the Jacobian and unsubscribes it from the equation system.
    /// Done at the end of every [`run`](Self::run); calling it again is a
    /// no-op.
    pub fn release(&mut self) {
        self.jacobian.release(&mut self.equation_system);
    }

    pub fn run(&mut self) -> Result<AcLoadFlowResult> {
        info!("start AC load flow on network {}", self.network.num);
        self.observer.before_load_flow(&self.network);
        let result = self.run_outer_loops();
        self.release();
        let result = result?;
        self.observer.after_load_flow(&self.network);
        info!("AC load flow complete on network {} ({})", self.network.num, result);
        Ok(result)
    }

    fn run_outer_loops(&mut self) -> Result<AcLoadFlowResult> {
        let mut newton_raphson = NewtonRaphson::new(self.parameters.newton_raphson.clone());
        let mut iterations_by_type: BTreeMap<&'static str, usize> = BTreeMap::new();

        let mut last_nr_result = self.run_newton_raphson(&mut newton_raphson)?;
        if last_nr_result.status == NewtonRaphsonStatus::Converged {
            self.update_pv_buses_reactive_power()?;
            // passes stop once they need no more Newton-Raphson iterations
            loop {
                let old_iteration = last_nr_result.iteration;
                for index in 0..self.outer_loops.len() {
                    last_nr_result =
                        self.run_outer_loop(index, &mut newton_raphson, &mut iterations_by_type, last_nr_result)?;
                    if last_nr_result.status != NewtonRaphsonStatus::Converged {
                        break;
                    }
                }
                if last_nr_result.iteration <= old_iteration
                    || last_nr_result.status != NewtonRaphsonStatus::Converged
                {
                    break;
                }
            }
        }

        Ok(AcLoadFlowResult {
            network_num: self.network.num,
            outer_loop_iterations: iterations_by_type.values().sum::<usize>() + 1,
            newton_raphson_iterations: last_nr_result.iteration,
            status: last_nr_result.status,
            slack_bus_active_power_mismatch: last_nr_result.slack_bus_active_power_mismatch,
        })
    }

    /// Checks one outer loop and solves again until it is stable, its cap is
    /// reached or a solve fails.
    fn run_outer_loop(
        &mut self,
        index: usize,
        newton_raphson: &mut NewtonRaphson,
        iterations_by_type: &mut BTreeMap<&'static str, usize>,
        mut last_nr_result: NewtonRaphsonResult,
    ) -> Result<NewtonRaphsonResult> {
        let type_name = self.outer_loops[index].type_name();
        let max_iterations = self.outer_loops[index]
            .max_iterations()
            .unwrap_or(self.parameters.max_outer_loop_iterations);
        loop {
            let iteration = *iterations_by_type.entry(type_name).or_default();
            if iteration >= max_iterations {
                warn!(
                    "outer loop '{}' reached its maximum of {} iterations, considered stable",
                    type_name, max_iterations
                );
                return Ok(last_nr_result);
            }

            self.observer.before_outer_loop_status_check(iteration, type_name);
            let mut context = OuterLoopContext {
                iteration,
                network: &mut self.network,
                equation_system: &mut self.equation_system,
                variable_set: &self.variable_set,
                last_nr_result: &last_nr_result,
            };
            let status = self.outer_loops[index].check(&mut context)?;
            self.observer
                .after_outer_loop_status_check(iteration, type_name, status == OuterLoopStatus::Stable);
            if status == OuterLoopStatus::Stable {
                return Ok(last_nr_result);
            }

            self.observer.before_outer_loop_body(iteration, type_name);
            last_nr_result = self.run_newton_raphson(newton_raphson)?;
            if last_nr_result.status != NewtonRaphsonStatus::Converged {
                return Ok(last_nr_result);
            }
            self.observer.after_outer_loop_body(iteration, type_name);

            self.update_pv_buses_reactive_power()?;
            *iterations_by_type.entry(type_name).or_default() += 1;
        }
    }

    fn run_newton_raphson(&mut self, newton_raphson: &mut NewtonRaphson) -> Result<NewtonRaphsonResult> {
        newton_raphson.run(
            &mut self.network,
            &mut self.equation_system,
            &mut self.jacobian,
            self.voltage_initializer.as_mut(),
            self.observer.as_mut(),
        )
    }

    /// Stores on every voltage controller bus the reactive power it
    /// injects, as evaluated by its reactive balance equation.
    fn update_pv_buses_reactive_power(&mut self) -> Result<()> {
        self.observer.before_pv_buses_reactive_power_update();
        for bus in self.network.buses_mut() {
            bus.calculated_q = if bus.voltage_controller_enabled && !bus.disabled {
                self.equation_system
                    .eval_equation(EquationKey::new(bus.num, EquationType::BusQ))?
            } else {
                f64::NAN
            };
        }
        self.observer.after_pv_buses_reactive_power_update(&self.network);
        Ok(())
    }
}

/// Runs every network with its own engine and returns the updated networks
/// with their results.
pub fn run_ac_load_flows(
    networks: Vec<LfNetwork>,
    parameters: &AcLoadFlowParameters,
) -> Result<Vec<(LfNetwork, AcLoadFlowResult)>> {
    networks
        .into_iter()
        .map(|network| {
            let mut engine = AcLoadFlowEngine::new(network, parameters.clone())?;
            let result = engine.run()?;
            Ok((engine.into_network(), result))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::basic::ac::observer::MultipleAcLoadFlowObserver;
    use crate::testcases::*;

    #[derive(Default)]
    struct FailingSolver;

    impl Solve for FailingSolver {
        #[allow(non_snake_case)]
        fn solve(&mut self, _Ap: &[usize], _Ai: &[usize], _Ax: &[f64], _b: &mut [f64], _n: usize) -> std::result::Result<(), &'static str> {
            Err("singular matrix")
        }

        fn reset(&mut self) {}
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Calls {
        creations: usize,
        load_flows: usize,
        begin_iterations: usize,
        end_iterations: usize,
        jacobian_builds: usize,
        status_checks: usize,
        outer_loop_bodies: usize,
        pv_updates: usize,
    }

    struct Recorder(Rc<RefCell<Calls>>);

    impl AcLoadFlowObserver for Recorder {
        fn after_equation_system_creation(&mut self, _system: &EquationSystem) {
            self.0.borrow_mut().creations += 1;
        }

        fn before_load_flow(&mut self, _network: &LfNetwork) {
            self.0.borrow_mut().load_flows += 1;
        }

        fn begin_iteration(&mut self, _iteration: usize) {
            self.0.borrow_mut().begin_iterations += 1;
        }

        fn end_iteration(&mut self, _iteration: usize) {
            self.0.borrow_mut().end_iterations += 1;
        }

        fn after_jacobian_build(&mut self, _matrix: &nalgebra_sparse::CscMatrix<f64>, _iteration: usize) {
            self.0.borrow_mut().jacobian_builds += 1;
        }

        fn after_outer_loop_status_check(&mut self, _iteration: usize, _type: &str, _stable: bool) {
            self.0.borrow_mut().status_checks += 1;
        }

        fn after_outer_loop_body(&mut self, _iteration: usize, _type: &str) {
            self.0.borrow_mut().outer_loop_bodies += 1;
        }

        fn after_pv_buses_reactive_power_update(&mut self, _network: &LfNetwork) {
            self.0.borrow_mut().pv_updates += 1;
        }
    }

    /// Keeps the mismatch norm of every iteration.
    struct NormRecorder(Rc<RefCell<Vec<f64>>>);

    impl AcLoadFlowObserver for NormRecorder {
        fn after_stopping_criteria_evaluation(&mut self, norm: f64, _iteration: usize) {
            self.0.borrow_mut().push(norm);
        }
    }

    /// Asks for a new solve every time it is checked.
    struct AlwaysUnstable(usize);

    impl OuterLoop for AlwaysUnstable {
        fn type_name(&self) -> &'static str {
            "Always unstable"
        }

        fn check(&mut self, _context: &mut OuterLoopContext<'_>) -> Result<OuterLoopStatus> {
            Ok(OuterLoopStatus::Unstable)
        }

        fn max_iterations(&self) -> Option<usize> {
            Some(self.0)
        }
    }

    fn run(network: LfNetwork, parameters: AcLoadFlowParameters) -> (AcLoadFlowResult, LfNetwork) {
        let mut engine = AcLoadFlowEngine::new(network, parameters).unwrap();
        let result = engine.run().unwrap();
        (result, engine.into_network())
    }

    #[test]
    fn test_two_bus_closed_form() {
        let norms = Rc::new(RefCell::new(Vec::new()));
        let mut engine: AcLoadFlowEngine = AcLoadFlowEngine::with_observer(
            two_bus_network().unwrap(),
            AcLoadFlowParameters::default(),
            Box::new(NormRecorder(norms.clone())),
        )
        .unwrap();
        let result = engine.run().unwrap();
        let network = engine.into_network();
        assert!(result.is_ok());
        let last_norm = *norms.borrow().last().unwrap();
        assert!(last_norm < 1e-7);
        assert!(norms.borrow()[0] > last_norm);
        assert!(result.newton_raphson_iterations <= 15);
        assert!(result.slack_bus_active_power_mismatch.abs() < 1e-7);
        // the slack distribution moved the load to the slack generator
        assert_eq!(result.outer_loop_iterations, 2);

        let delta = 0.2f64.asin() / 2.0;
        let bus = &network.buses()[1];
        assert_abs_diff_eq!(bus.v, delta.cos(), epsilon = 1e-6);
        assert_abs_diff_eq!(bus.angle, -delta, epsilon = 1e-6);
        assert_abs_diff_eq!(network.buses()[0].generators[0].target_p, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_without_slack_distribution() {
        let parameters = AcLoadFlowParameters {
            distributed_slack: false,
            ..Default::default()
        };
        let (result, _) = run(two_bus_network().unwrap(), parameters);
        assert!(result.is_ok());
        assert_eq!(result.outer_loop_iterations, 1);
        assert_abs_diff_eq!(result.slack_bus_active_power_mismatch, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_deterministic() {
        let (first, first_network) = run(three_bus_pv_network().unwrap(), AcLoadFlowParameters::default());
        let (second, second_network) = run(three_bus_pv_network().unwrap(), AcLoadFlowParameters::default());
        assert_eq!(first, second);
        for (a, b) in first_network.buses().iter().zip(second_network.buses()) {
            assert_eq!(a.v, b.v);
            assert_eq!(a.angle, b.angle);
        }
    }

    #[test]
    fn test_reactive_limit_switch() {
        let (result, network) = run(three_bus_pv_network().unwrap(), AcLoadFlowParameters::default());
        assert!(result.is_ok());
        assert!(result.outer_loop_iterations >= 2);
        let bus = &network.buses()[1];
        assert!(!bus.voltage_controller_enabled);
        assert_eq!(bus.generation_target_q, 0.2);
        assert!(bus.v < 1.05);
    }

    #[test]
    fn test_reactive_limits_off_holds_voltage() {
        let parameters = AcLoadFlowParameters {
            reactive_limits: false,
            ..Default::default()
        };
        let (result, network) = run(three_bus_pv_network().unwrap(), parameters);
        assert!(result.is_ok());
        assert_abs_diff_eq!(network.buses()[1].v, 1.05, epsilon = 1e-8);
        assert!(network.buses()[1].calculated_q > 0.2);
    }

    #[test]
    fn test_max_iteration_reached() {
        let mut parameters = AcLoadFlowParameters::default();
        parameters.newton_raphson.max_iteration = 1;
        let (result, network) = run(two_bus_network().unwrap(), parameters);
        assert_eq!(result.status, NewtonRaphsonStatus::MaxIterationReached);
        assert_eq!(result.newton_raphson_iterations, 1);
        assert_eq!(result.outer_loop_iterations, 1);
        // nothing written back
        assert_eq!(network.buses()[1].v, 1.0);
    }

    #[test]
    fn test_unrealistic_state() {
        let mut parameters = AcLoadFlowParameters::default();
        parameters.newton_raphson.min_realistic_voltage = 0.999;
        let (result, network) = run(two_bus_network().unwrap(), parameters);
        assert_eq!(result.status, NewtonRaphsonStatus::UnrealisticState);
        assert_eq!(network.buses()[1].v, 1.0);
    }

    #[test]
    fn test_solver_failure_ends_the_run() {
        let mut engine = AcLoadFlowEngine::<FailingSolver>::with_observer(
            two_bus_network().unwrap(),
            AcLoadFlowParameters::default(),
            Box::new(()),
        )
        .unwrap();
        let result = engine.run().unwrap();
        assert_eq!(result.status, NewtonRaphsonStatus::SolverFailed);
        assert_eq!(result.newton_raphson_iterations, 1);
        assert_eq!(result.outer_loop_iterations, 1);
        assert!(!engine.jacobian().is_subscribed());
    }

    #[test]
    fn test_release_twice() {
        let mut engine = AcLoadFlowEngine::new(two_bus_network().unwrap(), AcLoadFlowParameters::default()).unwrap();
        assert_eq!(engine.equation_system().listener_count(), 1);
        engine.run().unwrap();
        assert_eq!(engine.equation_system().listener_count(), 0);
        engine.release();
        engine.release();
        assert!(!engine.jacobian().is_subscribed());

        // a released engine can run again
        let result = engine.run().unwrap();
        assert!(result.is_ok());
        assert_eq!(engine.equation_system().listener_count(), 0);
    }

    #[test]
    fn test_outer_loop_cap() {
        let parameters = AcLoadFlowParameters {
            distributed_slack: false,
            reactive_limits: false,
            ..Default::default()
        };
        let mut engine = AcLoadFlowEngine::new(two_bus_network().unwrap(), parameters)
            .unwrap()
            .with_outer_loops(vec![Box::new(AlwaysUnstable(3))]);
        let result = engine.run().unwrap();
        assert!(result.is_ok());
        assert_eq!(result.outer_loop_iterations, 4);
    }

    #[test]
    fn test_observer_sees_every_stage() {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let observer = MultipleAcLoadFlowObserver::new(vec![Box::new(Recorder(calls.clone())), Box::new(AcLoadFlowLogger)]);
        let mut engine = AcLoadFlowEngine::<DefaultSolver>::with_observer(
            two_bus_network().unwrap(),
            AcLoadFlowParameters::default(),
            Box::new(observer),
        )
        .unwrap();
        let result = engine.run().unwrap();

        let calls = calls.borrow();
        assert_eq!(calls.creations, 1);
        assert_eq!(calls.load_flows, 1);
        assert_eq!(calls.begin_iterations, result.newton_raphson_iterations);
        assert_eq!(calls.end_iterations, result.newton_raphson_iterations);
        assert_eq!(calls.jacobian_builds, result.newton_raphson_iterations);
        assert_eq!(calls.outer_loop_bodies, result.outer_loop_iterations - 1);
        assert_eq!(calls.pv_updates, result.outer_loop_iterations);
        assert!(calls.status_checks >= calls.outer_loop_bodies);
    }

    #[test]
    fn test_phase_shifter() {
        let mut parameters = AcLoadFlowParameters::default();
        parameters.equation_system.phase_control = true;
        let mut engine = AcLoadFlowEngine::new(phase_shifter_network().unwrap(), parameters).unwrap();
        let result = engine.run().unwrap();
        assert!(result.is_ok());

        let branch = &engine.network().branches()[1];
        let control = branch.phase_control.as_ref().unwrap();
        assert!(control.alpha_taps.contains(&branch.pi_model.a1));
        assert_ne!(branch.pi_model.a1, 0.0);
        let alpha = engine
            .equation_system()
            .equation(EquationKey::new(1, EquationType::BranchAlpha1))
            .unwrap();
        assert!(alpha.is_active());
    }

    #[test]
    fn test_transformer_voltage_control() {
        let mut parameters = AcLoadFlowParameters::default();
        parameters.equation_system.transformer_voltage_control = true;
        let (result, network) = run(transformer_voltage_control_network().unwrap(), parameters);
        assert!(result.is_ok());
        let (t1, t2) = (&network.branches()[1], &network.branches()[2]);
        assert_eq!(t1.pi_model.r1, t2.pi_model.r1);
        assert!(t1.voltage_control.as_ref().unwrap().ratio_taps.contains(&t1.pi_model.r1));
        assert!(t1.pi_model.r1 > 1.0);
        assert_abs_diff_eq!(network.buses()[2].v, 1.0, epsilon = 0.02);
    }

    #[test]
    fn test_shared_voltage_control() {
        let (result, network) = run(shared_voltage_control_network().unwrap(), AcLoadFlowParameters::default());
        assert!(result.is_ok());
        let buses = network.buses();
        assert_abs_diff_eq!(buses[3].v, 1.02, epsilon = 1e-6);
        // reactive output in proportion to the reactive ranges
        assert_abs_diff_eq!(buses[1].calculated_q, 2.0 * buses[2].calculated_q, epsilon = 1e-6);
    }

    #[test]
    fn test_svc_slope() {
        let mut parameters = AcLoadFlowParameters::default();
        parameters.equation_system.use_bus_pvlq = true;
        let (result, network) = run(svc_network().unwrap(), parameters);
        assert!(result.is_ok());
        let bus = &network.buses()[1];
        let q_svc = bus.calculated_q + bus.load_target_q;
        assert!(q_svc > 0.0);
        assert_abs_diff_eq!(bus.v, 1.0 - 0.01 * q_svc, epsilon = 1e-6);

        let (_, network) = run(svc_network().unwrap(), AcLoadFlowParameters::default());
        assert_abs_diff_eq!(network.buses()[1].v, 1.0, epsilon = 1e-8);
    }

    #[test]
    fn test_zero_impedance_branch() {
        let (result, network) = run(zero_impedance_network().unwrap(), AcLoadFlowParameters::default());
        assert!(result.is_ok());
        let buses = network.buses();
        assert_abs_diff_eq!(buses[1].v, buses[2].v, epsilon = 1e-8);
        assert_abs_diff_eq!(buses[1].angle, buses[2].angle, epsilon = 1e-8);
        assert!(buses[2].v < 1.0);
    }

    #[test]
    fn test_run_ac_load_flows() {
        let networks = vec![two_bus_network().unwrap(), zero_impedance_network().unwrap()];
        let results = run_ac_load_flows(networks, &AcLoadFlowParameters::default()).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, result)| result.is_ok()));
        let json = serde_json::to_string(&results[0].1).unwrap();
        assert!(json.contains("\"status\":\"Converged\""));
    }
}
