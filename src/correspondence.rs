//! Sources of dense correspondence fields for the optimizer.
//!
//! A correspondence source predicts, for every pixel of keyframe `i`, where
//! it lands in keyframe `j` together with a per-channel confidence. The
//! optimizer only consumes the resulting [`EdgeSet`].

use crate::geometry::LieGroup;
use crate::optimizer::{BaState, EdgeSet};

/// Produces the edge set for a list of keyframe pairs.
pub trait CorrespondenceSource<G: LieGroup>: Send {
    /// `frame_ids[k]` is the input frame keyframe `k` was created from.
    fn correspondences(
        &mut self,
        frame_ids: &[usize],
        state: &BaState<G>,
        pairs: &[(usize, usize)],
    ) -> anyhow::Result<EdgeSet>;
}

/// Bidirectional pairs `(i, j)` with `i != j`, both in `[t0, t1)` and at
/// most `radius` apart.
pub fn proximity_edges(t0: usize, t1: usize, radius: usize) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for i in t0..t1 {
        let lo = i.saturating_sub(radius).max(t0);
        let hi = (i + radius + 1).min(t1);
        for j in lo..hi {
            if i != j {
                pairs.push((i, j));
            }
        }
    }
    pairs
}
