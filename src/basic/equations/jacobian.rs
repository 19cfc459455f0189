use std::cell::Cell;
use std::rc::Rc;

use nalgebra_sparse::CscMatrix;
use tracing::debug;

use super::equation::{EquationEventType, EquationKey, EquationTermEventType};
use super::system::{EquationSystem, EquationSystemListener, ListenerId};
use super::term::TermId;
use crate::basic::error::{LoadFlowError, Result};
use crate::basic::solver::{DefaultSolver, Solve};

/// Terms contributing to one non-zero of the matrix, aligned with the CSC
/// value array.
#[derive(Debug, Clone)]
struct JacobianElement {
    terms: Vec<TermId>,
}

/// Jacobian of the indexed equations together with its factorization state.
///
/// Matrix rows are equations and matrix columns are variables, so
/// `J[eq][var] = ∂f_eq / ∂x_var`. The index numbers equations by "column" and
/// variables by "row", which here become the CSC row indices and the CSC
/// columns respectively.
pub struct JacobianMatrix<S: Solve = DefaultSolver> {
    matrix: CscMatrix<f64>,
    elements: Vec<JacobianElement>,
    solver: S,
}

impl<S: Solve + Default> JacobianMatrix<S> {
    /// Builds the sparsity pattern from the current index and fills in the
    /// derivative values.
    pub fn create(system: &mut EquationSystem) -> Result<Self> {
        let index = system.index()?;
        let n_rows = index.equation_count();
        let n_cols = index.variable_count();

        // (CSC column = variable, CSC row = equation, terms)
        let mut entries = Vec::new();
        for (eq, equation) in index.equations().iter().enumerate() {
            for (variable, terms) in &equation.terms_by_variable {
                let var = index.row(*variable).ok_or_else(|| {
                    LoadFlowError::Structural(format!("variable {} is not indexed", variable))
                })?;
                entries.push((var, eq, terms.clone()));
            }
        }
        entries.sort_by_key(|(var, eq, _)| (*var, *eq));

        let mut col_offsets = vec![0usize; n_cols + 1];
        let mut row_indices = Vec::with_capacity(entries.len());
        let mut elements = Vec::with_capacity(entries.len());
        for (var, eq, terms) in entries {
            col_offsets[var + 1] += 1;
            row_indices.push(eq);
            elements.push(JacobianElement { terms });
        }
        for c in 0..n_cols {
            col_offsets[c + 1] += col_offsets[c];
        }
        let values = vec![0.0; elements.len()];
        let matrix = CscMatrix::try_from_csc_data(n_rows, n_cols, col_offsets, row_indices, values)
            .map_err(|e| LoadFlowError::Structural(format!("invalid Jacobian pattern: {}", e)))?;

        let mut jacobian = Self {
            matrix,
            elements,
            solver: S::default(),
        };
        jacobian.update(system)?;
        debug!(
            rows = n_rows,
            cols = n_cols,
            nnz = jacobian.matrix.nnz(),
            "Jacobian matrix built"
        );
        Ok(jacobian)
    }
}

impl<S: Solve> JacobianMatrix<S> {
    /// Refreshes the values in place, keeping the pattern and the symbolic
    /// factorization.
    pub fn update(&mut self, system: &EquationSystem) -> Result<()> {
        let index = system.current_index()?;
        let variables = index.variables();
        let col_offsets = self.matrix.col_offsets().to_vec();
        let values = self.matrix.values_mut();
        // one CSC column per variable
        for (var, window) in col_offsets.windows(2).enumerate() {
            let variable = variables[var];
            for k in window[0]..window[1] {
                let mut value = 0.0;
                for &id in &self.elements[k].terms {
                    value += system.term(id)?.der(variable)?;
                }
                values[k] = value;
            }
        }
        Ok(())
    }

    pub fn matrix(&self) -> &CscMatrix<f64> {
        &self.matrix
    }

    /// Solves `J x = b` in place.
    pub fn solve(&mut self, b: &mut [f64]) -> std::result::Result<(), &'static str> {
        if self.matrix.nrows() != self.matrix.ncols() {
            return Err("Jacobian matrix is not square");
        }
        let n = self.matrix.nrows();
        let (ap, ai, ax) = self.matrix.csc_data();
        self.solver.solve(ap, ai, ax, b, n)
    }

    /// Drops the cached factorization.
    pub fn clean_lu(&mut self) {
        self.solver.reset();
    }
}

struct JacobianInvalidation(Rc<Cell<bool>>);

impl EquationSystemListener for JacobianInvalidation {
    fn on_equation_change(&mut self, _equation: EquationKey, _event: EquationEventType) {
        self.0.set(true);
    }

    fn on_equation_term_change(&mut self, _term: TermId, _event: EquationTermEventType) {
        self.0.set(true);
    }
}

/// Keeps one [`JacobianMatrix`] alive across Newton-Raphson iterations and
/// rebuilds it only after a structural change of the equation system.
///
/// The cache subscribes to the system when created, and again on the first
/// `get` after a `release`.
pub struct JacobianMatrixCache<S: Solve + Default = DefaultSolver> {
    matrix: Option<JacobianMatrix<S>>,
    invalidated: Rc<Cell<bool>>,
    listener: Option<ListenerId>,
    build_count: usize,
}

impl<S: Solve + Default> JacobianMatrixCache<S> {
    pub fn new(system: &mut EquationSystem) -> Self {
        let mut cache = Self {
            matrix: None,
            invalidated: Rc::new(Cell::new(false)),
            listener: None,
            build_count: 0,
        };
        cache.subscribe(system);
        cache
    }

    fn subscribe(&mut self, system: &mut EquationSystem) {
        if self.listener.is_none() {
            let listener = JacobianInvalidation(self.invalidated.clone());
            self.listener = Some(system.add_listener(Box::new(listener)));
        }
    }

    /// Returns an up to date matrix: rebuilt after a structural change,
    /// values refreshed otherwise.
    pub fn get(&mut self, system: &mut EquationSystem) -> Result<&mut JacobianMatrix<S>> {
        self.subscribe(system);
        if self.invalidated.replace(false) {
            if let Some(mut stale) = self.matrix.take() {
                stale.clean_lu();
            }
        }
        let matrix = match self.matrix.take() {
            Some(mut matrix) => {
                // the index is still valid since no structural event was seen
                system.index()?;
                matrix.update(system)?;
                matrix
            }
            None => {
                self.build_count += 1;
                JacobianMatrix::create(system)?
            }
        };
        Ok(self.matrix.insert(matrix))
    }

    /// Number of times the matrix pattern has been built.
    pub fn build_count(&self) -> usize {
        self.build_count
    }

    pub fn is_subscribed(&self) -> bool {
        self.listener.is_some()
    }

    /// Unsubscribes from the system and frees the factorization. Calling it
    /// again is a no-op.
    pub fn release(&mut self, system: &mut EquationSystem) {
        if let Some(id) = self.listener.take() {
            system.remove_listener(id);
        }
        if let Some(mut matrix) = self.matrix.take() {
            matrix.clean_lu();
        }
        self.invalidated.set(false);
    }
}
