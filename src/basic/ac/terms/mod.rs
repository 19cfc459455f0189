//! AC power flow terms.

mod branch;
mod shunt;
mod svc;

pub use branch::*;
pub use shunt::*;
pub use svc::*;
