//! Dense point-cloud map fused from the keyframe store.
//!
//! Every keyframe contributes the world points of a strided subset of its
//! pixels. Frames are fused in arrival order while tracking runs; the final
//! passes re-fuse everything from the refined poses and disparities.

use std::sync::Arc;

use anyhow::Result;
use nalgebra::{Vector3, Vector4};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::MappingConfig;
use crate::geometry::{ImageShape, Intrinsics, LieGroup};
use crate::optimizer::MIN_DISPARITY;
use crate::store::KeyframeStore;

use super::Mapper;

/// World points of one keyframe.
#[derive(Debug, Clone, PartialEq)]
pub struct MapFrame {
    pub keyframe: usize,
    pub points: Vec<Vector3<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DenseMap {
    /// Indexed by keyframe.
    pub frames: Vec<MapFrame>,
}

impl DenseMap {
    pub fn num_points(&self) -> usize {
        self.frames.iter().map(|f| f.points.len()).sum()
    }

    pub fn points(&self) -> impl Iterator<Item = &Vector3<f64>> {
        self.frames.iter().flat_map(|f| f.points.iter())
    }

    fn insert(&mut self, frame: MapFrame) {
        match self.frames.get_mut(frame.keyframe) {
            Some(slot) => *slot = frame,
            None => {
                // Keyframes are fused in order, so this only ever appends.
                debug_assert_eq!(frame.keyframe, self.frames.len());
                self.frames.push(frame);
            }
        }
    }
}

/// World points of the strided pixels of one keyframe.
///
/// Pixels at the disparity floor carry no depth information and are skipped.
pub fn keyframe_points<G: LieGroup>(
    pose: &G,
    disparity: &nalgebra::DVector<f64>,
    intrinsics: &Intrinsics,
    shape: ImageShape,
    stride: usize,
) -> Vec<Vector3<f64>> {
    let cam_to_world = pose.inverse();
    let mut points = Vec::new();
    for v in (0..shape.height).step_by(stride) {
        for u in (0..shape.width).step_by(stride) {
            let d = disparity[v * shape.width + u];
            if d <= MIN_DISPARITY {
                continue;
            }
            let x: Vector4<f64> = cam_to_world.act(&intrinsics.back_project(u as f64, v as f64, d));
            points.push(x.xyz() / x.w);
        }
    }
    points
}

pub struct PointCloudMapper {
    config: MappingConfig,
    map: Arc<RwLock<DenseMap>>,
    /// Next keyframe to fuse for the first time.
    cursor: usize,
    /// Completed final re-fusion passes.
    refinement_rounds: usize,
}

impl PointCloudMapper {
    pub fn new(config: &MappingConfig) -> Self {
        Self {
            config: config.clone(),
            map: Arc::new(RwLock::new(DenseMap::default())),
            cursor: 0,
            refinement_rounds: 0,
        }
    }

    fn fuse<G: LieGroup>(&self, store: &KeyframeStore<G>, from: usize, to: usize) -> usize {
        let stride = self.config.stride.max(1);
        let frames: Vec<MapFrame> = store.read(|counter, state| {
            (from..to.min(counter))
                .map(|k| MapFrame {
                    keyframe: k,
                    points: keyframe_points(
                        &state.poses[k],
                        &state.disparities[k],
                        &state.intrinsics[k],
                        state.shape,
                        stride,
                    ),
                })
                .collect()
        });
        let fused = frames.len();
        let mut map = self.map.write();
        for frame in frames {
            map.insert(frame);
        }
        fused
    }
}

impl<G: LieGroup> Mapper<G> for PointCloudMapper {
    type Map = DenseMap;

    fn step(&mut self, store: &KeyframeStore<G>, final_pass: bool) -> Result<bool> {
        let counter = store.counter();
        if self.cursor < counter {
            let to = (self.cursor + self.config.batch.max(1)).min(counter);
            let fused = self.fuse(store, self.cursor, to);
            self.cursor += fused;
            debug!(fused, cursor = self.cursor, "mapping fused keyframes");
            return Ok(false);
        }
        if !final_pass {
            return Ok(false);
        }

        // Every keyframe is fused; re-fuse from the refined state.
        if self.refinement_rounds < self.config.refinement_iters {
            self.fuse(store, 0, counter);
            self.refinement_rounds += 1;
            info!(
                round = self.refinement_rounds,
                of = self.config.refinement_iters,
                "mapping refinement pass"
            );
            return Ok(self.refinement_rounds >= self.config.refinement_iters);
        }
        Ok(true)
    }

    fn shared_map(&self) -> Arc<RwLock<DenseMap>> {
        self.map.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::store::KeyframeData;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    fn store_with(n: usize, shape: ImageShape) -> KeyframeStore<SE3> {
        let store = KeyframeStore::new(16, shape);
        for k in 0..n {
            store
                .append(KeyframeData {
                    frame_id: k,
                    timestamp: 0.0,
                    pose: SE3::from_translation(Vector3::new(-(k as f64), 0.0, 0.0)),
                    disparity: DVector::from_element(shape.num_pixels(), 0.5),
                    intrinsics: Intrinsics::new(2.0, 2.0, 1.0, 1.0),
                    damping: DVector::zeros(shape.num_pixels()),
                    prior: None,
                })
                .unwrap();
        }
        store
    }

    #[test]
    fn test_keyframe_points_in_world_frame() {
        let shape = ImageShape::new(3, 3);
        let k = Intrinsics::new(2.0, 2.0, 1.0, 1.0);
        let mut disp = DVector::from_element(9, 0.5);
        disp[0] = MIN_DISPARITY;
        // World-to-camera shifts by -1 in x, so the camera sits at x = 1.
        let pose = SE3::from_translation(Vector3::new(-1.0, 0.0, 0.0));

        let points = keyframe_points(&pose, &disp, &k, shape, 2);
        // Strided pixels (0,0), (2,0), (0,2), (2,2); the first is at the floor.
        assert_eq!(points.len(), 3);
        // Pixel (2, 0): x̄ = 0.5, ȳ = -0.5, depth 2.
        assert_relative_eq!(points[0], Vector3::new(2.0, -1.0, 2.0), epsilon = 1e-12);
    }

    #[test]
    fn test_mapper_fuses_in_batches_then_finishes() {
        let shape = ImageShape::new(2, 2);
        let store = store_with(5, shape);
        let config = MappingConfig {
            batch: 2,
            stride: 1,
            ..MappingConfig::default()
        };
        let mut mapper = PointCloudMapper::new(&config);

        assert!(!Mapper::<SE3>::step(&mut mapper, &store, false).unwrap());
        assert_eq!(Mapper::<SE3>::shared_map(&mapper).read().frames.len(), 2);
        // Final passes still drain remaining keyframes first.
        assert!(!Mapper::<SE3>::step(&mut mapper, &store, true).unwrap());
        assert!(!Mapper::<SE3>::step(&mut mapper, &store, true).unwrap());
        assert!(Mapper::<SE3>::step(&mut mapper, &store, true).unwrap());

        let map = Mapper::<SE3>::shared_map(&mapper);
        assert_eq!(map.read().frames.len(), 5);
        assert_eq!(map.read().num_points(), 20);
    }

    #[test]
    fn test_refinement_passes_use_updated_poses() {
        let shape = ImageShape::new(1, 1);
        let store = store_with(2, shape);
        let config = MappingConfig {
            batch: 8,
            stride: 1,
            refinement_iters: 2,
            ..MappingConfig::default()
        };
        let mut mapper = PointCloudMapper::new(&config);
        assert!(!Mapper::<SE3>::step(&mut mapper, &store, false).unwrap());

        let mut state = store.snapshot(None).state;
        state.poses[1] = SE3::from_translation(Vector3::new(-3.0, 0.0, 0.0));
        store.write_back(&state, 0).unwrap();

        assert!(!Mapper::<SE3>::step(&mut mapper, &store, true).unwrap());
        assert!(Mapper::<SE3>::step(&mut mapper, &store, true).unwrap());
        let map = Mapper::<SE3>::shared_map(&mapper);
        let x = map.read().frames[1].points[0].x;
        assert_relative_eq!(x, 3.0 + (0.0 - 1.0) / 2.0 * 2.0, epsilon = 1e-12);
    }
}
