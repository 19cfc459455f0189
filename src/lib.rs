pub mod basic;
pub mod testcases;
pub mod prelude {
    use crate::basic;
    pub use basic::ac::*;
    pub use basic::equations::*;
    pub use basic::error::{LoadFlowError, Result};
    pub use basic::network::*;
    pub use basic::post_processing::{format_branch_results, format_bus_results};
    pub use basic::solver::{DefaultSolver, Solve};
}
