#[cfg(feature = "faer")]
mod faer;
#[cfg(feature = "faer")]
pub use faer::*;

#[cfg(feature = "rsparse")]
mod rsparse;
#[cfg(feature = "rsparse")]
pub use rsparse::*;

#[cfg(feature = "faer")]
pub type DefaultSolver = FaerSolver;

#[cfg(all(not(feature = "faer"), feature = "rsparse"))]
pub type DefaultSolver = RSparseSolver;

#[allow(non_snake_case)]
/// A trait for solving sparse linear systems stored in compressed sparse
/// column form.
///
/// Implementations may keep a symbolic factorization between calls as long
/// as the sparsity pattern does not change. Callers signal a pattern change
/// through [`Solve::reset`].
pub trait Solve {
    /// Solves `A x = b` in place.
    ///
    /// # Parameters
    ///
    /// * `Ap` - Column pointers of the matrix.
    /// * `Ai` - Row indices of the matrix.
    /// * `Ax` - Non-zero values of the matrix.
    /// * `b` - Right-hand side vector, overwritten with the solution.
    /// * `n` - Dimension of the system.
    ///
    /// # Returns
    ///
    /// A result indicating success or failure.
    fn solve(
        &mut self,
        Ap: &[usize],
        Ai: &[usize],
        Ax: &[f64],
        b: &mut [f64],
        n: usize,
    ) -> Result<(), &'static str>;

    /// Drops any cached factorization.
    fn reset(&mut self);
}
