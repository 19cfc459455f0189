use thiserror::Error;

use super::equations::{EquationKey, TermId, Variable};

/// Errors raised by the load flow core.
///
/// Only contract violations end up here. A Newton-Raphson run that does not
/// converge is reported through [`NewtonRaphsonStatus`](crate::basic::ac::NewtonRaphsonStatus)
/// instead.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LoadFlowError {
    /// An equation or variable type was used where it has no meaning, or a
    /// derivative was requested for a variable the term does not declare.
    #[error("structural error: {0}")]
    Structural(String),

    /// An active equation ended up with zero active terms.
    #[error("equation {0} is active but all of its terms are inactive")]
    Consistency(EquationKey),

    /// Invalid control configuration, detected while building terms.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A caller-provided buffer does not match the current index size.
    #[error("bad vector length: expected {expected}, got {actual}")]
    BadVectorLength { expected: usize, actual: usize },

    #[error("unknown equation {0}")]
    UnknownEquation(EquationKey),

    #[error("unknown equation term {0:?}")]
    UnknownTerm(TermId),

    #[error("failed to distribute slack bus active power mismatch, {remaining} MW remaining")]
    SlackDistributionFailure { remaining: f64 },
}

impl LoadFlowError {
    pub(crate) fn undeclared_variable(term: &str, variable: Variable) -> Self {
        LoadFlowError::Structural(format!("term '{}' does not depend on {}", term, variable))
    }
}

pub type Result<T> = std::result::Result<T, LoadFlowError>;
