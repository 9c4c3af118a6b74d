//! Shared keyframe store.
//!
//! Holds the optimization state of every keyframe written so far behind a
//! single lock. The front end appends at `counter`; bundle adjustment
//! writes back in place for indices `< t1 <= counter` only, so the two never
//! touch the same index.

use nalgebra::DVector;
use parking_lot::Mutex;
use thiserror::Error;

use crate::geometry::{ImageShape, Intrinsics, LieGroup};
use crate::optimizer::BaState;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("keyframe store is full ({capacity} keyframes)")]
    Full { capacity: usize },
    #[error("{what} has {actual} pixels, store expects {expected}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("write-back range ends at {t1} beyond the {counter} valid keyframes")]
    BeyondCounter { t1: usize, counter: usize },
}

/// Everything the front end supplies for a new keyframe.
#[derive(Debug, Clone)]
pub struct KeyframeData<G: LieGroup> {
    /// Index of the input frame this keyframe was created from.
    pub frame_id: usize,
    pub timestamp: f64,
    pub pose: G,
    pub disparity: DVector<f64>,
    pub intrinsics: Intrinsics,
    pub damping: DVector<f64>,
    pub prior: Option<DVector<f64>>,
}

/// Consistent copy of the valid prefix.
#[derive(Debug, Clone)]
pub struct StoreSnapshot<G: LieGroup> {
    pub counter: usize,
    pub frame_ids: Vec<usize>,
    pub timestamps: Vec<f64>,
    pub state: BaState<G>,
}

struct StoreInner<G: LieGroup> {
    frame_ids: Vec<usize>,
    timestamps: Vec<f64>,
    state: BaState<G>,
}

pub struct KeyframeStore<G: LieGroup> {
    capacity: usize,
    shape: ImageShape,
    inner: Mutex<StoreInner<G>>,
}

impl<G: LieGroup> KeyframeStore<G> {
    pub fn new(capacity: usize, shape: ImageShape) -> Self {
        Self {
            capacity,
            shape,
            inner: Mutex::new(StoreInner {
                frame_ids: Vec::with_capacity(capacity),
                timestamps: Vec::with_capacity(capacity),
                state: BaState::new(shape),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    /// Number of valid keyframes.
    pub fn counter(&self) -> usize {
        self.inner.lock().state.len()
    }

    /// Append a keyframe at `counter` and return its index.
    pub fn append(&self, keyframe: KeyframeData<G>) -> Result<usize, StoreError> {
        let hw = self.shape.num_pixels();
        let fields = [
            ("disparity", Some(keyframe.disparity.len())),
            ("damping", Some(keyframe.damping.len())),
            ("prior", keyframe.prior.as_ref().map(|p| p.len())),
        ];
        for (what, len) in fields {
            if let Some(actual) = len.filter(|&n| n != hw) {
                return Err(StoreError::ShapeMismatch {
                    what,
                    expected: hw,
                    actual,
                });
            }
        }

        let mut inner = self.inner.lock();
        let index = inner.state.len();
        if index >= self.capacity {
            return Err(StoreError::Full {
                capacity: self.capacity,
            });
        }
        inner.frame_ids.push(keyframe.frame_id);
        inner.timestamps.push(keyframe.timestamp);
        inner.state.push_frame(
            keyframe.pose,
            keyframe.disparity,
            keyframe.intrinsics,
            keyframe.damping,
            keyframe.prior,
        );
        Ok(index)
    }

    /// Copy the first `min(t1, counter)` keyframes under the lock.
    pub fn snapshot(&self, t1: Option<usize>) -> StoreSnapshot<G> {
        let inner = self.inner.lock();
        let counter = inner.state.len();
        let n = t1.map_or(counter, |t1| t1.min(counter));
        let state = &inner.state;
        StoreSnapshot {
            counter,
            frame_ids: inner.frame_ids[..n].to_vec(),
            timestamps: inner.timestamps[..n].to_vec(),
            state: BaState {
                shape: state.shape,
                poses: state.poses[..n].to_vec(),
                disparities: state.disparities[..n].to_vec(),
                intrinsics: state.intrinsics[..n].to_vec(),
                damping: state.damping[..n].to_vec(),
                priors: state.priors[..n].to_vec(),
                scales: state.scales[..n].to_vec(),
                shifts: state.shifts[..n].to_vec(),
            },
        }
    }

    /// Run `f` with the counter and the state while holding the lock.
    pub fn read<R>(&self, f: impl FnOnce(usize, &BaState<G>) -> R) -> R {
        let inner = self.inner.lock();
        f(inner.state.len(), &inner.state)
    }

    /// Write optimized poses, disparities, scales and shifts of `[from, t1)`
    /// back, where `t1 = state.len()`.
    pub fn write_back(&self, state: &BaState<G>, from: usize) -> Result<(), StoreError> {
        self.write_back_settled(state, from, 0).map(|_| ())
    }

    /// Like [`write_back`](Self::write_back), but skips the newest `reserved`
    /// keyframes: the range ends at `min(t1, counter - reserved)` with the
    /// counter read under the lock. Returns the end of the written range.
    pub fn write_back_settled(&self, state: &BaState<G>, from: usize, reserved: usize) -> Result<usize, StoreError> {
        let t1 = state.len();
        let mut inner = self.inner.lock();
        let counter = inner.state.len();
        if t1 > counter {
            return Err(StoreError::BeyondCounter { t1, counter });
        }
        let end = t1.min(counter.saturating_sub(reserved));
        let dst = &mut inner.state;
        for k in from..end {
            dst.poses[k] = state.poses[k].clone();
            dst.disparities[k].copy_from(&state.disparities[k]);
            dst.scales[k] = state.scales[k];
            dst.shifts[k] = state.shifts[k];
        }
        Ok(end.max(from))
    }

    /// Poses of all valid keyframes.
    pub fn poses(&self) -> Vec<G> {
        self.inner.lock().state.poses.clone()
    }

    /// Input frame ids of all valid keyframes.
    pub fn frame_ids(&self) -> Vec<usize> {
        self.inner.lock().frame_ids.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use std::sync::Arc;
    use std::thread;

    fn keyframe(shape: ImageShape, frame_id: usize) -> KeyframeData<SE3> {
        let hw = shape.num_pixels();
        KeyframeData {
            frame_id,
            timestamp: frame_id as f64 * 0.1,
            pose: SE3::from_translation(Vector3::new(frame_id as f64, 0.0, 0.0)),
            disparity: DVector::from_element(hw, 0.5),
            intrinsics: Intrinsics::new(2.0, 2.0, 1.0, 1.0),
            damping: DVector::from_element(hw, 1e-6),
            prior: None,
        }
    }

    #[test]
    fn test_append_grows_counter() {
        let shape = ImageShape::new(2, 3);
        let store = KeyframeStore::new(4, shape);
        assert_eq!(store.append(keyframe(shape, 10)).unwrap(), 0);
        assert_eq!(store.append(keyframe(shape, 12)).unwrap(), 1);
        assert_eq!(store.counter(), 2);
        assert_eq!(store.frame_ids(), vec![10, 12]);
    }

    #[test]
    fn test_append_rejects_full_store_and_bad_shapes() {
        let shape = ImageShape::new(2, 3);
        let store = KeyframeStore::new(1, shape);

        let mut bad = keyframe(shape, 0);
        bad.prior = Some(DVector::zeros(5));
        assert_eq!(
            store.append(bad).unwrap_err(),
            StoreError::ShapeMismatch {
                what: "prior",
                expected: 6,
                actual: 5
            }
        );

        store.append(keyframe(shape, 0)).unwrap();
        assert_eq!(store.append(keyframe(shape, 1)).unwrap_err(), StoreError::Full { capacity: 1 });
    }

    #[test]
    fn test_snapshot_is_clamped_to_counter() {
        let shape = ImageShape::new(1, 2);
        let store = KeyframeStore::new(8, shape);
        for k in 0..3 {
            store.append(keyframe(shape, k)).unwrap();
        }
        let snap = store.snapshot(Some(10));
        assert_eq!(snap.counter, 3);
        assert_eq!(snap.state.len(), 3);
        assert_eq!(store.snapshot(Some(2)).state.len(), 2);
        assert!(snap.state.validate().is_ok());
    }

    #[test]
    fn test_write_back_only_touches_range() {
        let shape = ImageShape::new(1, 2);
        let store = KeyframeStore::new(8, shape);
        for k in 0..3 {
            store.append(keyframe(shape, k)).unwrap();
        }
        let mut snap = store.snapshot(None);
        for k in 0..3 {
            snap.state.disparities[k].fill(2.0);
            snap.state.scales[k] = 3.0;
        }
        store.write_back(&snap.state, 1).unwrap();

        store.read(|counter, state| {
            assert_eq!(counter, 3);
            assert_relative_eq!(state.disparities[0][0], 0.5);
            assert_relative_eq!(state.disparities[2][1], 2.0);
            assert_relative_eq!(state.scales[0], 1.0);
            assert_relative_eq!(state.scales[1], 3.0);
        });
    }

    #[test]
    fn test_settled_write_back_skips_newest_keyframes() {
        let shape = ImageShape::new(1, 2);
        let store = KeyframeStore::new(8, shape);
        for k in 0..4 {
            store.append(keyframe(shape, k)).unwrap();
        }
        let mut snap = store.snapshot(None);
        for d in &mut snap.state.disparities {
            d.fill(2.0);
        }
        // Two more keyframes arrive while the copy is optimized.
        store.append(keyframe(shape, 4)).unwrap();
        store.append(keyframe(shape, 5)).unwrap();

        // counter 6, 3 reserved: only [1, 3) is written.
        assert_eq!(store.write_back_settled(&snap.state, 1, 3).unwrap(), 3);
        store.read(|_, state| {
            assert_relative_eq!(state.disparities[0][0], 0.5);
            assert_relative_eq!(state.disparities[2][0], 2.0);
            assert_relative_eq!(state.disparities[3][0], 0.5);
        });

        // Nothing is settled yet.
        assert_eq!(store.write_back_settled(&snap.state, 1, 6).unwrap(), 1);
    }

    #[test]
    fn test_write_back_beyond_counter_fails() {
        let shape = ImageShape::new(1, 2);
        let store = KeyframeStore::new(8, shape);
        store.append(keyframe(shape, 0)).unwrap();
        let mut state = store.snapshot(None).state;
        let extra = keyframe(shape, 1);
        state.push_frame(extra.pose, extra.disparity, extra.intrinsics, extra.damping, None);
        assert_eq!(
            store.write_back(&state, 0).unwrap_err(),
            StoreError::BeyondCounter { t1: 2, counter: 1 }
        );
    }

    #[test]
    fn test_concurrent_appends_and_write_backs() {
        let shape = ImageShape::new(2, 2);
        let store = Arc::new(KeyframeStore::new(64, shape));
        store.append(keyframe(shape, 0)).unwrap();

        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for k in 1..32 {
                    store.append(keyframe(shape, k)).unwrap();
                }
            })
        };
        for _ in 0..32 {
            let mut snap = store.snapshot(None);
            for d in &mut snap.state.disparities {
                d.fill(0.25);
            }
            store.write_back(&snap.state, 0).unwrap();
        }
        writer.join().unwrap();

        assert_eq!(store.counter(), 32);
        store.read(|_, state| assert!(state.validate().is_ok()));
    }
}
