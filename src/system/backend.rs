//! Windowed global optimization and its memory safeguard.
//!
//! Each cycle follows three phases:
//! 1. Snapshot the window prefix from the store (brief lock)
//! 2. Fetch correspondences and run bundle adjustment on the copy (no lock)
//! 3. Write the optimized range back (brief lock)
//!
//! The tracking front end keeps appending and refining its own window while
//! phase 2 runs. Windowed cycles therefore only write back keyframes the front
//! end can no longer touch, below `counter - (frontend.window + frontend.edge_radius)`
//! at write time. The final refinement runs after tracking and writes everything.

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, Mode, SlamConfig};
use crate::correspondence::{proximity_edges, CorrespondenceSource};
use crate::geometry::LieGroup;
use crate::optimizer::{bundle_adjustment, BaParams, BaReport, BaVariant, Window};
use crate::store::KeyframeStore;

use super::memory::MemoryProbe;

/// Variants run one after the other on every correspondence refresh.
pub fn variant_plan(config: &SlamConfig) -> Vec<BaVariant> {
    if config.mode == Mode::Prgbd && config.store.optimize_scales {
        vec![BaVariant::Joint, BaVariant::PriorStructureOnly]
    } else {
        vec![BaVariant::Joint]
    }
}

pub struct Backend<G: LieGroup> {
    config: BackendConfig,
    plan: Vec<BaVariant>,
    source: Box<dyn CorrespondenceSource<G>>,
    /// Newest keyframes owned by the front end.
    reserved: usize,
    cycles: usize,
}

impl<G: LieGroup> Backend<G> {
    pub fn new(config: &SlamConfig, source: Box<dyn CorrespondenceSource<G>>) -> Self {
        Self {
            config: config.backend.clone(),
            plan: variant_plan(config),
            source,
            reserved: config.frontend.window + config.frontend.edge_radius,
            cycles: 0,
        }
    }

    pub fn plan(&self) -> &[BaVariant] {
        &self.plan
    }

    pub fn do_refinement(&self) -> bool {
        self.config.do_refinement
    }

    /// Number of completed windowed cycles.
    pub fn cycles(&self) -> usize {
        self.cycles
    }

    fn params(&self, variant: BaVariant) -> BaParams {
        BaParams {
            iters: self.config.iters,
            lm: self.config.lm,
            ep: self.config.ep,
            alpha: self.config.alpha.unwrap_or_else(|| variant.default_alpha()),
        }
    }

    /// Optimize the most recent `window` keyframes.
    ///
    /// Returns `None` while fewer than two keyframes exist.
    pub fn optimize_window(&mut self, store: &KeyframeStore<G>) -> Result<Option<BaReport>> {
        let t1 = store.counter();
        if t1 < 2 {
            return Ok(None);
        }
        let t0 = t1.saturating_sub(self.config.window);
        let report = self.optimize(store, t0, t1, self.config.steps, self.reserved)?;
        self.cycles += 1;
        Ok(report)
    }

    /// Optimize every keyframe written so far.
    pub fn refine(&mut self, store: &KeyframeStore<G>, steps: usize) -> Result<Option<BaReport>> {
        let t_end = store.counter();
        info!("Optimize full map: [0, {}]", t_end);
        if t_end < 2 {
            return Ok(None);
        }
        self.optimize(store, 0, t_end, steps, 0)
    }

    fn optimize(
        &mut self,
        store: &KeyframeStore<G>,
        t0: usize,
        t1: usize,
        steps: usize,
        reserved: usize,
    ) -> Result<Option<BaReport>> {
        // Phase 1: snapshot
        let snapshot = store.snapshot(Some(t1));
        let mut state = snapshot.state;
        let window = Window::new(t0, t1);
        // Edges reach back into the fixed prefix to anchor the window.
        let anchor = t0.saturating_sub(self.config.edge_radius);
        let pairs = proximity_edges(anchor, t1, self.config.edge_radius);

        // Phase 2: solve
        let mut last = None;
        for _ in 0..steps {
            let edges = self
                .source
                .correspondences(&snapshot.frame_ids, &state, &pairs)
                .context("correspondence source failed")?;
            for &variant in &self.plan {
                let report = bundle_adjustment(&mut state, &edges, window, variant, &self.params(variant))
                    .with_context(|| format!("{:?} bundle adjustment on [{}, {}) failed", variant, t0, t1))?;
                last = Some(report);
            }
        }

        // Phase 3: apply
        let written = store.write_back_settled(&state, anchor, reserved)?;

        if let Some(report) = &last {
            debug!(
                t0,
                t1,
                written,
                steps,
                initial_cost = report.initial_cost,
                final_cost = report.final_cost,
                "backend window optimized"
            );
        }
        Ok(last)
    }
}

/// Backend lifecycle under memory pressure.
pub enum BackendState<B> {
    Active(B),
    /// Torn down; no state survives.
    Suspended,
}

impl<B> BackendState<B> {
    pub fn is_active(&self) -> bool {
        matches!(self, BackendState::Active(_))
    }

    pub fn as_mut(&mut self) -> Option<&mut B> {
        match self {
            BackendState::Active(backend) => Some(backend),
            BackendState::Suspended => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeguardAction {
    Keep,
    TearDown,
    Reinstantiate,
    StaySuspended,
}

/// Hysteresis on memory utilization: tear down above `max_ram`, rebuild at
/// or below `min_ram`.
pub struct RamSafeguard {
    max_ram: f64,
    min_ram: f64,
    probe: Box<dyn MemoryProbe>,
}

impl RamSafeguard {
    pub fn new(max_ram: f64, min_ram: f64, probe: Box<dyn MemoryProbe>) -> Self {
        Self { max_ram, min_ram, probe }
    }

    pub fn decide(&self, used: f64, active: bool) -> SafeguardAction {
        match active {
            true if used > self.max_ram => SafeguardAction::TearDown,
            true => SafeguardAction::Keep,
            false if used <= self.min_ram => SafeguardAction::Reinstantiate,
            false => SafeguardAction::StaySuspended,
        }
    }

    /// Sample memory and transition `state`. `make` builds a fresh backend.
    ///
    /// A failed reading keeps the current state.
    pub fn apply<B>(&mut self, state: &mut BackendState<B>, make: impl FnOnce() -> B) -> SafeguardAction {
        let used = match self.probe.used_fraction() {
            Ok(used) => used,
            Err(e) => {
                warn!("Could not sample memory usage: {:#}", e);
                return if state.is_active() {
                    SafeguardAction::Keep
                } else {
                    SafeguardAction::StaySuspended
                };
            }
        };

        let action = self.decide(used, state.is_active());
        match action {
            SafeguardAction::TearDown => {
                warn!(used, "Deleting backend due to high memory usage [{:.1} %]", used * 100.0);
                if let Some(free) = self.probe.free_gib() {
                    warn!("Got only {:.2} GB left", free);
                }
                *state = BackendState::Suspended;
            }
            SafeguardAction::Reinstantiate => {
                info!(used, "Reinstantiating backend");
                *state = BackendState::Active(make());
            }
            SafeguardAction::Keep | SafeguardAction::StaySuspended => {}
        }
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{ImageShape, Intrinsics, SE3};
    use crate::io::synthetic::{perturb_poses, SyntheticConfig, SyntheticSequence};
    use crate::io::GroundTruthCorrespondence;
    use crate::store::KeyframeData;
    use crate::system::memory::ScriptedMemoryProbe;
    use approx::assert_relative_eq;
    use nalgebra::DVector;
    use std::sync::Arc;

    fn safeguard(readings: &[f64]) -> RamSafeguard {
        RamSafeguard::new(0.9, 0.5, Box::new(ScriptedMemoryProbe::new(readings.iter().copied())))
    }

    #[test]
    fn test_safeguard_hysteresis() {
        let mut guard = safeguard(&[0.5, 0.95, 0.7, 0.6, 0.5, 0.8]);
        let mut state = BackendState::Active(0u32);
        let mut builds = 0;
        let mut make = || {
            builds += 1;
            builds
        };

        assert_eq!(guard.apply(&mut state, &mut make), SafeguardAction::Keep);
        assert_eq!(guard.apply(&mut state, &mut make), SafeguardAction::TearDown);
        assert!(!state.is_active());
        assert_eq!(guard.apply(&mut state, &mut make), SafeguardAction::StaySuspended);
        assert_eq!(guard.apply(&mut state, &mut make), SafeguardAction::StaySuspended);
        assert_eq!(guard.apply(&mut state, &mut make), SafeguardAction::Reinstantiate);
        assert!(matches!(state, BackendState::Active(1)));
        // 0.8 is below the high-water mark.
        assert_eq!(guard.apply(&mut state, &mut make), SafeguardAction::Keep);
    }

    #[test]
    fn test_safeguard_thresholds_are_strict_and_inclusive() {
        let guard = safeguard(&[]);
        assert_eq!(guard.decide(0.9, true), SafeguardAction::Keep);
        assert_eq!(guard.decide(0.9001, true), SafeguardAction::TearDown);
        assert_eq!(guard.decide(0.5, false), SafeguardAction::Reinstantiate);
        assert_eq!(guard.decide(0.5001, false), SafeguardAction::StaySuspended);
    }

    #[test]
    fn test_variant_plan_by_mode() {
        let mut config = SlamConfig::default();
        assert_eq!(variant_plan(&config), vec![BaVariant::Joint]);
        config.mode = Mode::Prgbd;
        assert_eq!(variant_plan(&config), vec![BaVariant::Joint]);
        config.store.optimize_scales = true;
        assert_eq!(variant_plan(&config), vec![BaVariant::Joint, BaVariant::PriorStructureOnly]);
    }

    fn filled_store(seq: &SyntheticSequence, poses: &[SE3]) -> KeyframeStore<SE3> {
        let hw = seq.shape.num_pixels();
        let store = KeyframeStore::new(16, seq.shape);
        for k in 0..seq.len() {
            store
                .append(KeyframeData {
                    frame_id: k,
                    timestamp: seq.timestamps[k],
                    pose: poses[k].clone(),
                    disparity: seq.disparities[k].clone(),
                    intrinsics: seq.intrinsics,
                    damping: DVector::from_element(hw, 1e-6),
                    prior: None,
                })
                .unwrap();
        }
        store
    }

    #[test]
    fn test_window_and_refinement_reduce_cost() {
        let config = SyntheticConfig {
            num_frames: 5,
            ..SyntheticConfig::default()
        };
        let seq = Arc::new(
            SyntheticSequence::generate(&config, ImageShape::new(8, 10), Intrinsics::new(8.0, 8.0, 4.5, 3.5)).unwrap(),
        );
        let mut poses = seq.poses.clone();
        perturb_poses(&mut poses, 0.005, 4);
        let store = filled_store(&seq, &poses);

        let mut slam_config = SlamConfig::default();
        slam_config.backend.window = 3;
        slam_config.backend.edge_radius = 1;
        let source = GroundTruthCorrespondence::new(seq.clone(), 10.0);
        let mut backend = Backend::<SE3>::new(&slam_config, Box::new(source));

        let report = backend.optimize_window(&store).unwrap().unwrap();
        assert!(report.final_cost < report.initial_cost);
        assert_eq!(backend.cycles(), 1);
        // Outside the window [2, 5).
        let after = store.poses();
        assert_eq!(after[0], poses[0]);
        assert_eq!(after[1], poses[1]);

        let refined = backend.refine(&store, 2).unwrap().unwrap();
        assert!(refined.final_cost <= refined.initial_cost);
        assert_eq!(store.poses()[0], poses[0]);
    }

    #[test]
    fn test_single_keyframe_is_skipped() {
        let seq = Arc::new(
            SyntheticSequence::generate(
                &SyntheticConfig {
                    num_frames: 1,
                    ..SyntheticConfig::default()
                },
                ImageShape::new(2, 2),
                Intrinsics::new(2.0, 2.0, 0.5, 0.5),
            )
            .unwrap(),
        );
        let store = filled_store(&seq, &seq.poses);
        let mut backend = Backend::<SE3>::new(&SlamConfig::default(), Box::new(GroundTruthCorrespondence::new(seq, 1.0)));
        assert!(backend.optimize_window(&store).unwrap().is_none());
        assert!(backend.refine(&store, 6).unwrap().is_none());
    }

    /// Refines the front end's tail of the store on the first request, the
    /// way tracking would while a backend cycle is solving.
    struct ConcurrentRefinement {
        inner: GroundTruthCorrespondence,
        store: Arc<KeyframeStore<SE3>>,
        tail: usize,
        done: bool,
    }

    impl CorrespondenceSource<SE3> for ConcurrentRefinement {
        fn correspondences(
            &mut self,
            frame_ids: &[usize],
            state: &crate::optimizer::BaState<SE3>,
            pairs: &[(usize, usize)],
        ) -> anyhow::Result<crate::optimizer::EdgeSet> {
            if !self.done {
                let mut snap = self.store.snapshot(None);
                let counter = snap.counter;
                for k in counter - self.tail..counter {
                    snap.state.disparities[k].fill(0.77);
                }
                self.store.write_back(&snap.state, counter - self.tail)?;
                self.done = true;
            }
            self.inner.correspondences(frame_ids, state, pairs)
        }
    }

    #[test]
    fn test_window_write_back_keeps_front_end_refinements() {
        let config = SyntheticConfig {
            num_frames: 8,
            ..SyntheticConfig::default()
        };
        let seq = Arc::new(
            SyntheticSequence::generate(&config, ImageShape::new(8, 10), Intrinsics::new(8.0, 8.0, 4.5, 3.5)).unwrap(),
        );
        let mut poses = seq.poses.clone();
        perturb_poses(&mut poses, 0.005, 8);
        let store = Arc::new(filled_store(&seq, &poses));

        let mut slam_config = SlamConfig::default();
        slam_config.backend.window = 6;
        slam_config.backend.edge_radius = 1;
        slam_config.frontend.window = 2;
        slam_config.frontend.edge_radius = 1;
        let source = ConcurrentRefinement {
            inner: GroundTruthCorrespondence::new(seq.clone(), 10.0),
            store: store.clone(),
            tail: 3,
            done: false,
        };
        let mut backend = Backend::<SE3>::new(&slam_config, Box::new(source));

        backend.optimize_window(&store).unwrap().unwrap();

        let hw = seq.shape.num_pixels();
        store.read(|_, state| {
            for k in 5..8 {
                assert_relative_eq!(state.disparities[k], DVector::from_element(hw, 0.77));
            }
        });
        // Settled keyframes inside the window [2, 8) still receive the result.
        let after = store.poses();
        assert_eq!(after[1], poses[1]);
        assert_ne!(after[3], poses[3]);
    }
}
