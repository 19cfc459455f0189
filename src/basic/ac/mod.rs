//! AC load flow: equation system factory, Newton-Raphson solver, outer loops
//! and the engine running them.

mod engine;
mod equation_system;
pub mod nr;
pub mod observer;
pub mod outerloop;
pub mod parameters;
pub mod terms;

pub use engine::{AcLoadFlowEngine, AcLoadFlowResult, run_ac_load_flows};
pub use equation_system::create_ac_equation_system;
pub use nr::{NewtonRaphson, NewtonRaphsonParameters, NewtonRaphsonResult, NewtonRaphsonStatus};
pub use observer::{AcLoadFlowLogger, AcLoadFlowObserver, MultipleAcLoadFlowObserver};
pub use outerloop::{OuterLoop, OuterLoopContext, OuterLoopStatus};
pub use parameters::{AcEquationSystemCreationParameters, AcLoadFlowParameters};
