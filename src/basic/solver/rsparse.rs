use rsparse::{
    self,
    data::{self, Numeric, Symb},
    lsolve, lu, sqr, usolve,
};

use super::Solve;

/// LU solver backed by `rsparse`, reusing the symbolic analysis until reset.
#[derive(Default)]
pub struct RSparseSolver {
    x: Vec<f64>,
    symbolic: Option<Symb>,
}

#[allow(non_snake_case)]
impl Solve for RSparseSolver {
    fn solve(
        &mut self,
        Ap: &[usize],
        Ai: &[usize],
        Ax: &[f64],
        b: &mut [f64],
        n: usize,
    ) -> Result<(), &'static str> {
        if Ap.len() != n + 1 || b.len() != n {
            return Err("matrix and right-hand side dimensions disagree");
        }
        let p: Vec<isize> = Ap.iter().map(|&v| v as isize).collect();
        let a = data::Sprs {
            m: n,
            n,
            i: Ai.to_vec(),
            p,
            x: Ax.to_vec(),
            nzmax: Ax.len(),
        };
        if self.x.len() != n {
            self.symbolic = None;
            self.x = vec![0.0; n];
        }
        let s = self.symbolic.get_or_insert_with(|| sqr(&a, 1, false));
        let num = lu(&a, s, 1e-6).map_err(|_| "LU factorization failed")?;
        let x = &mut self.x[..];
        ipvec(&num.pinv, b, x); // x = P*b
        lsolve(&num.l, x); // x = L\x
        usolve(&num.u, x); // x = U\x
        ipvec(&s.q, x, b); // b = Q*x
        if b.iter().any(|v| !v.is_finite()) {
            return Err("singular matrix");
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.symbolic = None;
    }
}

fn ipvec_identity<T: Numeric<T>>(b: &[T], x: &mut [T]) {
    x.copy_from_slice(b);
}

fn ipvec_perm<T: Numeric<T>>(p: &[isize], b: &[T], x: &mut [T]) {
    for k in 0..b.len() {
        x[p[k] as usize] = b[k];
    }
}

fn ipvec<T: Numeric<T>>(p: &Option<Vec<isize>>, b: &[T], x: &mut [T]) {
    match p {
        Some(pvec) => ipvec_perm(pvec, b, x),
        None => ipvec_identity(b, x),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_small_system() {
        // [4 1; 2 3] x = [1; 2]
        let ap = [0, 2, 4];
        let ai = [0, 1, 0, 1];
        let ax = [4.0, 2.0, 1.0, 3.0];
        let mut b = [1.0, 2.0];
        let mut solver = RSparseSolver::default();
        solver.solve(&ap, &ai, &ax, &mut b, 2).unwrap();
        assert!((b[0] - 0.1).abs() < 1e-12);
        assert!((b[1] - 0.6).abs() < 1e-12);

        // symbolic analysis is reused for a second numeric factorization
        let ax = [2.0, 0.0, 0.0, 4.0];
        let mut b = [1.0, 2.0];
        solver.solve(&ap, &ai, &ax, &mut b, 2).unwrap();
        assert!((b[0] - 0.5).abs() < 1e-12);
        assert!((b[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut solver = RSparseSolver::default();
        let mut b = [1.0];
        assert!(solver.solve(&[0, 1, 2], &[0, 1], &[1.0, 1.0], &mut b, 2).is_err());
    }
}
