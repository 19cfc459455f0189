//! Generic equation system: variables, equations, terms, the dense index
//! over them and the Jacobian built from it.

mod equation;
mod initializer;
mod jacobian;
mod system;
mod term;
mod variable;

pub use equation::*;
pub use initializer::*;
pub use jacobian::*;
pub use system::*;
pub use term::*;
pub use variable::*;
