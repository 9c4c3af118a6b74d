//! Dense linear solvers for the reduced (Schur) bundle-adjustment system.
//!
//! # Theory
//!
//! With pose variables `x` and per-pixel structure `z`, the normal equations
//! have the arrow shape
//!
//! ```text
//! | H   E | |dx|   |v|
//! | Eᵀ  C | |dz| = |w|      C diagonal
//! ```
//!
//! Eliminating `z` with `Q = C⁻¹` gives the reduced system
//!
//! ```text
//! (H - E Q Eᵀ) dx = v - E Q w
//! dz = Q (w - Eᵀ dx)
//! ```
//!
//! The reduced matrix is factored with Cholesky when it is expected to be
//! positive definite and with LU otherwise. A factorization whose solution is
//! not finite falls through to the next solver and finally to a zero step.

use nalgebra::{DMatrix, DVector};
use tracing::warn;

use super::sparse::{BlockVector, StructureCoupling};

/// Which factorization to attempt first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverKind {
    Cholesky,
    Lu,
}

/// Which path produced the step that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Cholesky,
    Lu,
    /// No factorization gave a finite result; the step was discarded.
    ZeroUpdate,
}

impl SolveStatus {
    /// True when the preferred solver did not produce the step.
    pub fn is_fallback(&self, preferred: LinearSolverKind) -> bool {
        !matches!(
            (self, preferred),
            (SolveStatus::Cholesky, LinearSolverKind::Cholesky) | (SolveStatus::Lu, LinearSolverKind::Lu)
        )
    }
}

/// Levenberg-Marquardt damping of the diagonal: `H ← H + (ep + lm·H)·I`.
pub fn apply_damping(h: &mut DMatrix<f64>, ep: f64, lm: f64) {
    let n = h.nrows().min(h.ncols());
    for k in 0..n {
        h[(k, k)] += ep + lm * h[(k, k)];
    }
}

fn all_finite(x: &DVector<f64>) -> bool {
    x.iter().all(|v| v.is_finite())
}

/// Solve `a x = b` with a single factorization. `None` on failure or non-finite output.
pub fn solve(a: &DMatrix<f64>, b: &DVector<f64>, kind: LinearSolverKind) -> Option<DVector<f64>> {
    let x = match kind {
        LinearSolverKind::Cholesky => a.clone().cholesky()?.solve(b),
        LinearSolverKind::Lu => a.clone().lu().solve(b)?,
    };
    all_finite(&x).then_some(x)
}

/// Solve `a x = b`, falling back Cholesky → LU → zero step.
pub fn solve_with_fallback(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
    preferred: LinearSolverKind,
) -> (DVector<f64>, SolveStatus) {
    if preferred == LinearSolverKind::Cholesky {
        if let Some(x) = solve(a, b, LinearSolverKind::Cholesky) {
            return (x, SolveStatus::Cholesky);
        }
        warn!(dim = a.nrows(), "Cholesky factorization failed, falling back to LU");
    }

    if let Some(x) = solve(a, b, LinearSolverKind::Lu) {
        return (x, SolveStatus::Lu);
    }
    warn!(dim = a.nrows(), "LU factorization failed, applying zero update");
    (DVector::zeros(b.len()), SolveStatus::ZeroUpdate)
}

/// Result of a Schur-complement solve.
#[derive(Debug, Clone)]
pub struct SchurSolution {
    pub dx: DVector<f64>,
    pub dz: DVector<f64>,
    pub status: SolveStatus,
}

/// Solve the arrow system by eliminating the diagonal block `c`.
///
/// `h` is damped here with `(ep, lm)`; `c` must already carry its own damping.
/// `E` stays in column blocks: each structure node only updates the pose
/// blocks it couples to, `S -= E_a Q_k E_bᵀ`. A discarded pose step still
/// back-substitutes `dz = Q w`.
#[allow(clippy::too_many_arguments)]
pub fn schur_solve(
    mut h: DMatrix<f64>,
    e: &StructureCoupling,
    c: &BlockVector,
    v: &DVector<f64>,
    w: &BlockVector,
    ep: f64,
    lm: f64,
    kind: LinearSolverKind,
) -> SchurSolution {
    apply_damping(&mut h, ep, lm);
    let mut y = v.clone();
    let mut q = Vec::with_capacity(e.num_nodes());

    for k in 0..e.num_nodes() {
        let q_k = c.block(k).map(|x| 1.0 / x);
        let column = e.column(k);
        let scaled: Vec<DMatrix<f64>> = column
            .iter()
            .map(|(_, block)| {
                let mut eq = block.clone();
                for (j, mut col) in eq.column_iter_mut().enumerate() {
                    col *= q_k[j];
                }
                eq
            })
            .collect();

        for ((a, _), eq_a) in column.iter().zip(&scaled) {
            for (b, e_b) in column {
                let mut target = h.view_mut((*a, *b), (eq_a.nrows(), e_b.nrows()));
                target -= eq_a * e_b.transpose();
            }
            let mut y_a = y.rows_mut(*a, eq_a.nrows());
            y_a -= eq_a * w.block(k);
        }
        q.push(q_k);
    }

    let (dx, status) = solve_with_fallback(&h, &y, kind);

    let hw = e.block_dim();
    let mut dz = DVector::zeros(e.num_nodes() * hw);
    for (k, q_k) in q.iter().enumerate() {
        let mut rhs = w.block(k).clone();
        for (a, block) in e.column(k) {
            rhs -= block.transpose() * dx.rows(*a, block.nrows());
        }
        dz.rows_mut(k * hw, hw).copy_from(&rhs.component_mul(q_k));
    }
    SchurSolution { dx, dz, status }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_damping_scales_diagonal() {
        let mut h = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 2.0]);
        apply_damping(&mut h, 0.1, 0.5);
        assert_relative_eq!(h[(0, 0)], 4.0 + 0.1 + 2.0);
        assert_relative_eq!(h[(1, 1)], 2.0 + 0.1 + 1.0);
        assert_relative_eq!(h[(0, 1)], 1.0);
    }

    #[test]
    fn test_cholesky_on_spd_system() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let b = DVector::from_vec(vec![1.0, 2.0]);
        let (x, status) = solve_with_fallback(&a, &b, LinearSolverKind::Cholesky);
        assert_eq!(status, SolveStatus::Cholesky);
        assert_relative_eq!(&a * x, b, epsilon = 1e-12);
    }

    #[test]
    fn test_indefinite_system_falls_back_to_lu() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let b = DVector::from_vec(vec![3.0, 3.0]);
        let (x, status) = solve_with_fallback(&a, &b, LinearSolverKind::Cholesky);
        assert_eq!(status, SolveStatus::Lu);
        assert!(status.is_fallback(LinearSolverKind::Cholesky));
        assert_relative_eq!(x, DVector::from_vec(vec![1.0, 1.0]), epsilon = 1e-12);
    }

    #[test]
    fn test_singular_system_gives_zero_update() {
        let a = DMatrix::zeros(3, 3);
        let b = DVector::from_vec(vec![1.0, 0.0, -1.0]);
        let (x, status) = solve_with_fallback(&a, &b, LinearSolverKind::Cholesky);
        assert_eq!(status, SolveStatus::ZeroUpdate);
        assert!(x.iter().all(|v| *v == 0.0));
    }

    /// Solve `[[H, E], [Eᵀ, diag(C)]]` directly.
    fn full_solve(
        h: &DMatrix<f64>,
        e: &DMatrix<f64>,
        c: &DVector<f64>,
        v: &DVector<f64>,
        w: &DVector<f64>,
    ) -> DVector<f64> {
        let (np, nz) = e.shape();
        let mut full = DMatrix::zeros(np + nz, np + nz);
        full.view_mut((0, 0), (np, np)).copy_from(h);
        full.view_mut((0, np), (np, nz)).copy_from(e);
        full.view_mut((np, 0), (nz, np)).copy_from(&e.transpose());
        for k in 0..nz {
            full[(np + k, np + k)] = c[k];
        }
        let rhs = DVector::from_iterator(np + nz, v.iter().chain(w.iter()).copied());
        full.lu().solve(&rhs).unwrap()
    }

    #[test]
    fn test_schur_matches_full_solve() {
        let h = DMatrix::from_row_slice(2, 2, &[5.0, 1.0, 1.0, 4.0]);
        let e = DMatrix::from_row_slice(2, 3, &[1.0, 0.5, 0.0, 0.0, 1.0, 0.3]);
        let c = DVector::from_vec(vec![2.0, 3.0, 1.5]);
        let v = DVector::from_vec(vec![1.0, -1.0]);
        let w = DVector::from_vec(vec![0.5, 0.2, -0.4]);

        let mut coupling = StructureCoupling::new(2, 1, 3);
        coupling.add(0, 0, e.clone()).unwrap();
        let sol = schur_solve(
            h.clone(),
            &coupling,
            &BlockVector::from_dense(&c, 3),
            &v,
            &BlockVector::from_dense(&w, 3),
            0.0,
            0.0,
            LinearSolverKind::Cholesky,
        );
        let reference = full_solve(&h, &e, &c, &v, &w);

        assert_eq!(sol.status, SolveStatus::Cholesky);
        assert_relative_eq!(sol.dx, reference.rows(0, 2).into_owned(), epsilon = 1e-10);
        assert_relative_eq!(sol.dz, reference.rows(2, 3).into_owned(), epsilon = 1e-10);
    }

    #[test]
    fn test_block_schur_handles_sparse_multi_node_coupling() {
        // Three 2-dof poses, three structure nodes of two pixels. Node 0 couples
        // to poses 0 and 1, node 1 only to pose 2, node 2 to nothing; node 1 also
        // carries an overlapping 1-row block on pose 2.
        let mut coupling = StructureCoupling::new(6, 3, 2);
        coupling.add(0, 0, DMatrix::from_row_slice(2, 2, &[1.0, 0.2, -0.3, 0.5])).unwrap();
        coupling.add(2, 0, DMatrix::from_row_slice(2, 2, &[0.4, 0.0, 0.1, 0.7])).unwrap();
        coupling.add(4, 1, DMatrix::from_row_slice(2, 2, &[0.6, -0.2, 0.3, 0.9])).unwrap();
        coupling.add(5, 1, DMatrix::from_row_slice(1, 2, &[0.25, 0.5])).unwrap();

        let mut h = DMatrix::identity(6, 6) * 6.0;
        h[(0, 3)] = 0.5;
        h[(3, 0)] = 0.5;
        h[(2, 5)] = -0.4;
        h[(5, 2)] = -0.4;
        let c = DVector::from_vec(vec![2.0, 1.5, 3.0, 2.5, 1.0, 4.0]);
        let v = DVector::from_vec(vec![1.0, -0.5, 0.3, 0.0, 0.8, -1.2]);
        let w = DVector::from_vec(vec![0.5, 0.2, -0.4, 0.1, 0.7, -0.3]);

        let sol = schur_solve(
            h.clone(),
            &coupling,
            &BlockVector::from_dense(&c, 2),
            &v,
            &BlockVector::from_dense(&w, 2),
            0.0,
            0.0,
            LinearSolverKind::Cholesky,
        );
        let reference = full_solve(&h, &coupling.to_dense(), &c, &v, &w);

        assert_eq!(sol.status, SolveStatus::Cholesky);
        assert_relative_eq!(sol.dx, reference.rows(0, 6).into_owned(), epsilon = 1e-10);
        assert_relative_eq!(sol.dz, reference.rows(6, 6).into_owned(), epsilon = 1e-10);
        // An uncoupled node reduces to dz = w / c.
        assert_relative_eq!(sol.dz[4], 0.7 / 1.0, epsilon = 1e-12);
        assert_relative_eq!(sol.dz[5], -0.3 / 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_update_still_back_substitutes_structure() {
        let mut coupling = StructureCoupling::new(1, 1, 2);
        coupling.add(0, 0, DMatrix::from_row_slice(1, 2, &[1.0, 1.0])).unwrap();
        let c = BlockVector::from_dense(&DVector::from_vec(vec![2.0, 4.0]), 2);
        let w = BlockVector::from_dense(&DVector::from_vec(vec![1.0, 2.0]), 2);

        // H - E Q Eᵀ = 0.75 - 0.75, singular.
        let h = DMatrix::from_element(1, 1, 0.75);
        let sol = schur_solve(h, &coupling, &c, &DVector::from_vec(vec![0.0]), &w, 0.0, 0.0, LinearSolverKind::Cholesky);

        assert_eq!(sol.status, SolveStatus::ZeroUpdate);
        assert_relative_eq!(sol.dz, DVector::from_vec(vec![0.5, 0.5]), epsilon = 1e-12);
    }
}
