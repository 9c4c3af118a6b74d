//! Per-edge linearization: residuals, robust weights and normal-equation blocks.

use nalgebra::{DMatrix, DVector, Vector2};

use super::projection::EdgeProjection;

/// Pixels whose residual norm reaches this value are ignored.
pub const OUTLIER_THRESHOLD: f64 = 250.0;

/// Scale applied to the confidence weights before use.
pub const WEIGHT_SCALE: f64 = 0.001;

/// Stacked residual `target - coords` and effective weights, both `2HW`.
pub fn weighted_residuals(
    target: &[Vector2<f64>],
    weight: &[Vector2<f64>],
    projection: &EdgeProjection,
) -> (DVector<f64>, DVector<f64>) {
    let hw = projection.coords.len();
    let mut r = DVector::zeros(2 * hw);
    let mut w = DVector::zeros(2 * hw);

    for p in 0..hw {
        let res = target[p] - projection.coords[p];
        r[2 * p] = res.x;
        r[2 * p + 1] = res.y;
        if projection.valid[p] && res.norm() < OUTLIER_THRESHOLD {
            w[2 * p] = WEIGHT_SCALE * weight[p].x;
            w[2 * p + 1] = WEIGHT_SCALE * weight[p].y;
        }
    }
    (r, w)
}

/// Weighted squared residual of one edge.
pub fn edge_cost(r: &DVector<f64>, w: &DVector<f64>) -> f64 {
    r.iter().zip(w.iter()).map(|(r, w)| w * r * r).sum()
}

/// Normal-equation contributions of a single edge `(i, j)`.
#[derive(Debug, Clone)]
pub struct EdgeSystem {
    pub hii: DMatrix<f64>,
    pub hij: DMatrix<f64>,
    pub hji: DMatrix<f64>,
    pub hjj: DMatrix<f64>,
    pub vi: DVector<f64>,
    pub vj: DVector<f64>,
    /// `DIM × HW` coupling of pose `i` with the structure of frame `i`.
    pub ei: DMatrix<f64>,
    /// `DIM × HW` coupling of pose `j` with the structure of frame `i`.
    pub ej: DMatrix<f64>,
    /// Per-pixel structure diagonal.
    pub c: DVector<f64>,
    /// Per-pixel structure right-hand side.
    pub w: DVector<f64>,
    pub cost: f64,
}

/// Build `JᵀWJ` and `JᵀWr` blocks for one edge.
///
/// Structure blocks (`ei`, `ej`, `c`, `w`) are left empty when
/// `with_structure` is false.
pub fn linearize_edge(
    target: &[Vector2<f64>],
    weight: &[Vector2<f64>],
    projection: &EdgeProjection,
    with_structure: bool,
) -> EdgeSystem {
    let (r, wv) = weighted_residuals(target, weight, projection);
    let cost = edge_cost(&r, &wv);

    let scale_rows = |j: &DMatrix<f64>| {
        let mut out = j.clone();
        for (k, mut row) in out.row_iter_mut().enumerate() {
            row *= wv[k];
        }
        out
    };
    let wji = scale_rows(&projection.ji);
    let wjj = scale_rows(&projection.jj);

    let hii = projection.ji.transpose() * &wji;
    let hij = wji.transpose() * &projection.jj;
    let hji = hij.transpose();
    let hjj = projection.jj.transpose() * &wjj;
    let vi = wji.transpose() * &r;
    let vj = wjj.transpose() * &r;

    let dim = projection.ji.ncols();
    let hw = projection.coords.len();
    let (mut ei, mut ej, mut c, mut w) = if with_structure {
        (
            DMatrix::zeros(dim, hw),
            DMatrix::zeros(dim, hw),
            DVector::zeros(hw),
            DVector::zeros(hw),
        )
    } else {
        (DMatrix::zeros(dim, 0), DMatrix::zeros(dim, 0), DVector::zeros(0), DVector::zeros(0))
    };

    if with_structure {
        for p in 0..hw {
            for k in [2 * p, 2 * p + 1] {
                let jz = projection.jz[k];
                if wv[k] == 0.0 || jz == 0.0 {
                    continue;
                }
                let wjz = wv[k] * jz;
                for d in 0..dim {
                    ei[(d, p)] += projection.ji[(k, d)] * wjz;
                    ej[(d, p)] += projection.jj[(k, d)] * wjz;
                }
                c[p] += wjz * jz;
                w[p] += wjz * r[k];
            }
        }
    }

    EdgeSystem {
        hii,
        hij,
        hji,
        hjj,
        vi,
        vj,
        ei,
        ej,
        c,
        w,
        cost,
    }
}
