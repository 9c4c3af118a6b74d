//! Windowed dense bundle adjustment over keyframe poses and disparity maps.
//!
//! # Theory
//!
//! For an edge `(i, j)` every pixel `p` of frame `i` is reprojected into
//! frame `j` and compared to the predicted correspondence:
//!
//! ```text
//! r_ij(p) = target_ij(p) - π(G_j G_i⁻¹ π⁻¹(p, d_i(p)))
//! E = Σ_ij Σ_p w_ij(p) ‖r_ij(p)‖²
//! ```
//!
//! Each iteration linearizes all edges, folds the blocks into the arrow
//! system (poses × per-pixel disparities), eliminates the structure with the
//! Schur complement and retracts the poses on the manifold.
//!
//! The prior variants additionally fit a per-frame affine model to an
//! external disparity prior:
//!
//! ```text
//! r2_k(p) = d_k(p) - (s_k · prior_k(p) + o_k)
//! E += α Σ_k Σ_p r2_k(p)²
//! ```
//!
//! Frames before `max(t0, 1)` never receive a pose update.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::geometry::LieGroup;

use super::hessian::{edge_cost, linearize_edge, weighted_residuals, EdgeSystem};
use super::linear::{apply_damping, schur_solve, solve_with_fallback, LinearSolverKind, SolveStatus};
use super::problem::{BaError, BaReport, BaState, EdgeSet, Window};
use super::projection::project_edge;
use super::sparse::{scatter_add_mat, scatter_add_vec, BlockVector, StructureCoupling};

/// Disparities are clamped to this floor after every iteration.
pub const MIN_DISPARITY: f64 = 0.001;

/// Small floor added to the structure diagonal.
pub const STRUCTURE_EPSILON: f64 = 1e-7;

/// Which variables an iteration optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaVariant {
    /// Poses only, dense solve without structure.
    MotionOnly,
    /// Disparities only, poses held fixed.
    StructureOnly,
    /// Poses and disparities.
    Joint,
    /// Poses, disparities and the per-frame prior scale/shift.
    ///
    /// Translation and prior scale are not jointly observable; this variant
    /// can drift and is not used by the backend.
    PriorJoint,
    /// Disparities and prior scale/shift over the full window, poses fixed.
    PriorStructureOnly,
}

impl BaVariant {
    /// Prior weight each variant is tuned for.
    pub fn default_alpha(&self) -> f64 {
        match self {
            BaVariant::PriorJoint => 0.001,
            _ => 0.05,
        }
    }

    pub fn optimizes_poses(&self) -> bool {
        matches!(self, BaVariant::MotionOnly | BaVariant::Joint | BaVariant::PriorJoint)
    }

    pub fn optimizes_structure(&self) -> bool {
        !matches!(self, BaVariant::MotionOnly)
    }

    /// Whether the per-frame scale/shift are part of the system.
    pub fn optimizes_prior_affine(&self) -> bool {
        matches!(self, BaVariant::PriorJoint | BaVariant::PriorStructureOnly)
    }
}

/// Iteration count and damping of a bundle-adjustment call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaParams {
    pub iters: usize,
    /// Relative Levenberg-Marquardt damping of the pose diagonal.
    pub lm: f64,
    /// Absolute damping of the pose diagonal.
    pub ep: f64,
    /// Weight of the disparity prior term.
    pub alpha: f64,
}

impl Default for BaParams {
    fn default() -> Self {
        Self {
            iters: 4,
            lm: 1e-4,
            ep: 0.1,
            alpha: 0.05,
        }
    }
}

impl BaParams {
    pub fn for_variant(variant: BaVariant) -> Self {
        Self {
            alpha: variant.default_alpha(),
            ..Self::default()
        }
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Run `params.iters` iterations of `variant` on the window and update
/// `state` in place.
///
/// Only poses in `[max(t0, 1), t1)` are moved. Disparities of every frame
/// that is the source of an edge may change and all disparities end above
/// [`MIN_DISPARITY`].
pub fn bundle_adjustment<G: LieGroup>(
    state: &mut BaState<G>,
    edges: &EdgeSet,
    window: Window,
    variant: BaVariant,
    params: &BaParams,
) -> Result<BaReport, BaError> {
    validate(state, edges, window, variant)?;

    let initial_cost = residual_cost(state, edges);
    let preferred = match variant {
        BaVariant::PriorJoint => LinearSolverKind::Lu,
        _ => LinearSolverKind::Cholesky,
    };

    let mut fallbacks = 0;
    let mut last_status = None;
    for _ in 0..params.iters {
        let status = match variant {
            BaVariant::MotionOnly => motion_only_step(state, edges, window, params)?,
            BaVariant::StructureOnly => joint_step(state, edges, window, params, true)?,
            BaVariant::Joint => joint_step(state, edges, window, params, false)?,
            BaVariant::PriorJoint => prior_joint_step(state, edges, window, params)?,
            BaVariant::PriorStructureOnly => prior_structure_step(state, edges, window, params)?,
        };
        clamp_disparities(state);

        if status.is_some_and(|s| s.is_fallback(preferred)) {
            fallbacks += 1;
        }
        last_status = status;
    }

    let final_cost = residual_cost(state, edges);
    debug!(
        ?variant,
        edges = edges.len(),
        t0 = window.t0,
        t1 = window.t1,
        initial_cost,
        final_cost,
        fallbacks,
        "bundle adjustment finished"
    );

    Ok(BaReport {
        iterations: params.iters,
        initial_cost,
        final_cost,
        fallbacks,
        last_status,
    })
}

/// Total weighted squared reprojection error of the edge set.
pub fn residual_cost<G: LieGroup>(state: &BaState<G>, edges: &EdgeSet) -> f64 {
    (0..edges.len())
        .map(|e| {
            let (i, j) = (edges.ii[e], edges.jj[e]);
            let proj = project_edge(
                &state.poses[i],
                &state.poses[j],
                &state.disparities[i],
                &state.intrinsics[i],
                &state.intrinsics[j],
                state.shape,
                false,
            );
            let (r, w) = weighted_residuals(&edges.targets[e], &edges.weights[e], &proj);
            edge_cost(&r, &w)
        })
        .sum()
}

fn validate<G: LieGroup>(
    state: &BaState<G>,
    edges: &EdgeSet,
    window: Window,
    variant: BaVariant,
) -> Result<(), BaError> {
    if window.t0 >= window.t1 {
        return Err(BaError::EmptyWindow {
            t0: window.t0,
            t1: window.t1,
        });
    }
    if window.t1 > state.len() {
        return Err(BaError::WindowOutOfRange {
            t1: window.t1,
            len: state.len(),
        });
    }
    state.validate()?;
    edges.validate(state.shape, window.t1)?;

    if variant.optimizes_prior_affine() {
        let nodes = match variant {
            BaVariant::PriorStructureOnly => expanded_nodes(edges, window),
            _ => unique_sources(edges).0,
        };
        if let Some(&frame) = nodes.iter().find(|&&k| state.priors[k].is_none()) {
            return Err(BaError::MissingPrior { frame });
        }
    }
    Ok(())
}

fn clamp_disparities<G: LieGroup>(state: &mut BaState<G>) {
    for disp in &mut state.disparities {
        disp.apply(|d| *d = d.max(MIN_DISPARITY));
    }
}

// ============================================================================
// Shared assembly
// ============================================================================

/// Sorted unique source frames of the edges and each edge's node index.
fn unique_sources(edges: &EdgeSet) -> (Vec<usize>, Vec<usize>) {
    let mut kx = edges.ii.clone();
    kx.sort_unstable();
    kx.dedup();
    let lookup: BTreeMap<usize, usize> = kx.iter().enumerate().map(|(n, &k)| (k, n)).collect();
    let kk = edges.ii.iter().map(|i| lookup[i]).collect();
    (kx, kk)
}

/// Sorted union of `[t0, t1)` and the edge source frames.
fn expanded_nodes(edges: &EdgeSet, window: Window) -> Vec<usize> {
    let mut nodes: Vec<usize> = (window.t0..window.t1).chain(edges.ii.iter().copied()).collect();
    nodes.sort_unstable();
    nodes.dedup();
    nodes
}

/// Normal equations of one iteration: dense pose blocks, block-sparse coupling.
struct Assembly {
    /// Reduced pose Hessian, `M·DIM` square.
    h: DMatrix<f64>,
    v: DVector<f64>,
    /// Structure node → frame index.
    kx: Vec<usize>,
    /// Pose-structure coupling, one column of pose blocks per structure node.
    e: StructureCoupling,
    /// Structure diagonal, `N` blocks of `HW`.
    c: BlockVector,
    w: BlockVector,
}

fn assemble<G: LieGroup>(
    state: &BaState<G>,
    edges: &EdgeSet,
    window: Window,
    with_structure: bool,
) -> Result<Assembly, BaError> {
    let dim = G::DIM;
    let hw = state.shape.num_pixels();
    let fixedp = window.fixed_prefix() as i64;
    let m = window.num_free_poses();

    let systems: Vec<EdgeSystem> = (0..edges.len())
        .map(|e| {
            let (i, j) = (edges.ii[e], edges.jj[e]);
            let proj = project_edge(
                &state.poses[i],
                &state.poses[j],
                &state.disparities[i],
                &state.intrinsics[i],
                &state.intrinsics[j],
                state.shape,
                true,
            );
            linearize_edge(&edges.targets[e], &edges.weights[e], &proj, with_structure)
        })
        .collect();

    // Shift by the gauge offset; fixed frames become negative and are dropped.
    let ii: Vec<i64> = edges.ii.iter().map(|&i| i as i64 - fixedp).collect();
    let jj: Vec<i64> = edges.jj.iter().map(|&j| j as i64 - fixedp).collect();

    let mut h_blocks = Vec::with_capacity(4 * systems.len());
    h_blocks.extend(systems.iter().map(|s| s.hii.clone()));
    h_blocks.extend(systems.iter().map(|s| s.hij.clone()));
    h_blocks.extend(systems.iter().map(|s| s.hji.clone()));
    h_blocks.extend(systems.iter().map(|s| s.hjj.clone()));
    let h_rows = [ii.as_slice(), ii.as_slice(), jj.as_slice(), jj.as_slice()].concat();
    let h_cols = [ii.as_slice(), jj.as_slice(), ii.as_slice(), jj.as_slice()].concat();
    let h = scatter_add_mat(&h_blocks, &h_rows, &h_cols, m, m, (dim, dim))?.to_dense();

    let mut v_blocks = Vec::with_capacity(2 * systems.len());
    v_blocks.extend(systems.iter().map(|s| s.vi.clone()));
    v_blocks.extend(systems.iter().map(|s| s.vj.clone()));
    let v_rows = [ii.as_slice(), jj.as_slice()].concat();
    let v = scatter_add_vec(&v_blocks, &v_rows, m, dim)?.to_dense();

    if !with_structure {
        return Ok(Assembly {
            h,
            v,
            kx: Vec::new(),
            e: StructureCoupling::new(m * dim, 0, hw),
            c: BlockVector::zeros(0, hw),
            w: BlockVector::zeros(0, hw),
        });
    }

    let (kx, kk) = unique_sources(edges);
    let n = kx.len();
    let kk: Vec<i64> = kk.into_iter().map(|k| k as i64).collect();

    let mut e_blocks = Vec::with_capacity(2 * systems.len());
    e_blocks.extend(systems.iter().map(|s| s.ei.clone()));
    e_blocks.extend(systems.iter().map(|s| s.ej.clone()));
    let e_cols = [kk.as_slice(), kk.as_slice()].concat();
    let e = StructureCoupling::from_block_sparse(&scatter_add_mat(&e_blocks, &v_rows, &e_cols, m, n, (dim, hw))?);

    let c_blocks: Vec<DVector<f64>> = systems.iter().map(|s| s.c.clone()).collect();
    let w_blocks: Vec<DVector<f64>> = systems.iter().map(|s| s.w.clone()).collect();
    let c = scatter_add_vec(&c_blocks, &kk, n, hw)?;
    let w = scatter_add_vec(&w_blocks, &kk, n, hw)?;

    Ok(Assembly { h, v, kx, e, c, w })
}

fn apply_pose_update<G: LieGroup>(state: &mut BaState<G>, window: Window, dx: &DVector<f64>) {
    let dim = G::DIM;
    let fixedp = window.fixed_prefix();
    for k in 0..window.num_free_poses() {
        let delta: Vec<f64> = dx.rows(k * dim, dim).iter().copied().collect();
        let pose = &mut state.poses[fixedp + k];
        *pose = pose.retract(&delta);
    }
}

fn apply_structure_update<G: LieGroup>(state: &mut BaState<G>, nodes: &[usize], dz: &DVector<f64>) {
    let hw = state.shape.num_pixels();
    for (n, &k) in nodes.iter().enumerate() {
        state.disparities[k] += dz.rows(n * hw, hw);
    }
}

/// Add eta and the masked sensor prior to the structure system.
///
/// Frames without a prior get `C += eta + ε`. Frames with one get
/// `C += α m + (1 - m) eta + ε` and `w -= m α (d - prior)`, `m = prior > 0`.
fn damp_structure<G: LieGroup>(state: &BaState<G>, kx: &[usize], c: &mut BlockVector, w: &mut BlockVector, alpha: f64) {
    for (n, &k) in kx.iter().enumerate() {
        let eta = &state.damping[k];
        match &state.priors[k] {
            Some(prior) => {
                let disp = &state.disparities[k];
                let c_n = c.block_mut(n);
                for p in 0..prior.len() {
                    let mask = if prior[p] > 0.0 { 1.0 } else { 0.0 };
                    c_n[p] += alpha * mask + (1.0 - mask) * eta[p] + STRUCTURE_EPSILON;
                }
                let w_n = w.block_mut(n);
                for p in 0..prior.len() {
                    if prior[p] > 0.0 {
                        w_n[p] -= alpha * (disp[p] - prior[p]);
                    }
                }
            }
            None => {
                let c_n = c.block_mut(n);
                for p in 0..eta.len() {
                    c_n[p] += eta[p] + STRUCTURE_EPSILON;
                }
            }
        }
    }
}

// ============================================================================
// Variant steps
// ============================================================================

fn motion_only_step<G: LieGroup>(
    state: &mut BaState<G>,
    edges: &EdgeSet,
    window: Window,
    params: &BaParams,
) -> Result<Option<SolveStatus>, BaError> {
    if window.num_free_poses() == 0 {
        return Ok(None);
    }
    let Assembly { mut h, v, .. } = assemble(state, edges, window, false)?;
    apply_damping(&mut h, params.ep, params.lm);
    let (dx, status) = solve_with_fallback(&h, &v, LinearSolverKind::Cholesky);
    apply_pose_update(state, window, &dx);
    Ok(Some(status))
}

fn joint_step<G: LieGroup>(
    state: &mut BaState<G>,
    edges: &EdgeSet,
    window: Window,
    params: &BaParams,
    structure_only: bool,
) -> Result<Option<SolveStatus>, BaError> {
    let Assembly {
        h,
        v,
        kx,
        e,
        mut c,
        mut w,
    } = assemble(state, edges, window, true)?;
    damp_structure(state, &kx, &mut c, &mut w, params.alpha);

    if structure_only || window.num_free_poses() == 0 {
        let dz = w.to_dense().component_div(&c.to_dense());
        apply_structure_update(state, &kx, &dz);
        return Ok(None);
    }

    let sol = schur_solve(h, &e, &c, &v, &w, params.ep, params.lm, LinearSolverKind::Cholesky);
    apply_pose_update(state, window, &sol.dx);
    apply_structure_update(state, &kx, &sol.dz);
    Ok(Some(sol.status))
}

/// Scale/shift blocks of the prior term for a set of structure nodes.
///
/// Nodes with `observed[n] == false` contribute no prior Jacobian.
struct AffinePrior {
    /// `2N` rows of coupling `[F; K]` of scale and shift with structure.
    coupling: StructureCoupling,
    /// `2N` square `[[D, L], [L, G]]`, diagonal blocks.
    hessian: DMatrix<f64>,
    /// `[vs; vo]`.
    rhs: DVector<f64>,
}

/// Build the affine prior blocks and fold `C += α + eta + ε`,
/// `w -= α r2` into the structure system.
fn affine_prior<G: LieGroup>(
    state: &BaState<G>,
    nodes: &[usize],
    observed: &[bool],
    c: &mut BlockVector,
    w: &mut BlockVector,
    alpha: f64,
) -> Result<AffinePrior, BaError> {
    let n = nodes.len();
    let hw = state.shape.num_pixels();
    let mut coupling = StructureCoupling::new(2 * n, n, hw);
    let mut hessian = DMatrix::zeros(2 * n, 2 * n);
    let mut rhs = DVector::zeros(2 * n);

    for (node, &k) in nodes.iter().enumerate() {
        let prior = state.priors[k]
            .as_ref()
            .ok_or(BaError::MissingPrior { frame: k })?;
        let disp = &state.disparities[k];
        let eta = &state.damping[k];
        let (scale, shift) = (state.scales[k], state.shifts[k]);

        let c_n = c.block_mut(node);
        for p in 0..hw {
            c_n[p] += alpha + eta[p] + STRUCTURE_EPSILON;
        }
        if !observed[node] {
            continue;
        }

        let (mut d_ss, mut d_sl, mut v_s, mut v_o) = (0.0, 0.0, 0.0, 0.0);
        let mut f = DMatrix::zeros(1, hw);
        let w_n = w.block_mut(node);
        for p in 0..hw {
            let r2 = disp[p] - (scale * prior[p] + shift);
            let js = -prior[p];
            w_n[p] -= alpha * r2;
            f[(0, p)] = alpha * js;
            d_ss += js * js;
            d_sl += -js;
            v_s += js * r2;
            v_o -= r2;
        }
        coupling.add(node, node, f)?;
        coupling.add(n + node, node, DMatrix::from_element(1, hw, -alpha))?;
        hessian[(node, node)] = alpha * d_ss;
        hessian[(n + node, n + node)] = alpha * hw as f64;
        hessian[(node, n + node)] = alpha * d_sl;
        hessian[(n + node, node)] = alpha * d_sl;
        rhs[node] = -alpha * v_s;
        rhs[n + node] = -alpha * v_o;
    }

    Ok(AffinePrior {
        coupling,
        hessian,
        rhs,
    })
}

fn apply_affine_update<G: LieGroup>(state: &mut BaState<G>, nodes: &[usize], ds: &DVector<f64>) {
    let n = nodes.len();
    for (node, &k) in nodes.iter().enumerate() {
        state.scales[k] += ds[node];
        state.shifts[k] += ds[n + node];
    }
}

fn prior_joint_step<G: LieGroup>(
    state: &mut BaState<G>,
    edges: &EdgeSet,
    window: Window,
    params: &BaParams,
) -> Result<Option<SolveStatus>, BaError> {
    let Assembly {
        h,
        v,
        kx,
        e,
        mut c,
        mut w,
    } = assemble(state, edges, window, true)?;
    let observed = vec![true; kx.len()];
    let prior = affine_prior(state, &kx, &observed, &mut c, &mut w, params.alpha)?;

    // H_aug = [[H, 0], [0, prior]], E_aug = [E; F; K]
    let np = h.nrows();
    let na = prior.hessian.nrows();
    let mut h_aug = DMatrix::zeros(np + na, np + na);
    h_aug.view_mut((0, 0), (np, np)).copy_from(&h);
    h_aug.view_mut((np, np), (na, na)).copy_from(&prior.hessian);

    let e_aug = e.vstack(prior.coupling)?;
    let v_aug = DVector::from_iterator(np + na, v.iter().chain(prior.rhs.iter()).copied());

    let sol = schur_solve(
        h_aug,
        &e_aug,
        &c,
        &v_aug,
        &w,
        params.ep,
        params.lm,
        LinearSolverKind::Lu,
    );

    apply_pose_update(state, window, &sol.dx.rows(0, np).into_owned());
    apply_affine_update(state, &kx, &sol.dx.rows(np, na).into_owned());
    apply_structure_update(state, &kx, &sol.dz);
    Ok(Some(sol.status))
}

fn prior_structure_step<G: LieGroup>(
    state: &mut BaState<G>,
    edges: &EdgeSet,
    window: Window,
    params: &BaParams,
) -> Result<Option<SolveStatus>, BaError> {
    let hw = state.shape.num_pixels();
    let Assembly { kx, c, w, .. } = assemble(state, edges, window, true)?;

    // Zero-pad the structure system onto the expanded node set.
    let nodes = expanded_nodes(edges, window);
    let mut c_exp = BlockVector::zeros(nodes.len(), hw);
    let mut w_exp = BlockVector::zeros(nodes.len(), hw);
    let mut observed = vec![false; nodes.len()];
    for (src, k) in kx.iter().enumerate() {
        if let Ok(dst) = nodes.binary_search(k) {
            *c_exp.block_mut(dst) += c.block(src);
            *w_exp.block_mut(dst) += w.block(src);
            observed[dst] = true;
        }
    }

    let prior = affine_prior(state, &nodes, &observed, &mut c_exp, &mut w_exp, params.alpha)?;
    let sol = schur_solve(
        prior.hessian,
        &prior.coupling,
        &c_exp,
        &prior.rhs,
        &w_exp,
        params.ep,
        params.lm,
        LinearSolverKind::Cholesky,
    );

    apply_affine_update(state, &nodes, &sol.dx);
    apply_structure_update(state, &nodes, &sol.dz);
    Ok(Some(sol.status))
}
