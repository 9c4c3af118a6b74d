//! SLAM System - top-level orchestration.
//!
//! `SlamSystem` owns the shared keyframe store and runs the six workers:
//! stream display, tracking, backend, visualization, mapping and mapping GUI.
//! Every worker is spawned regardless of configuration; disabled workers
//! skip their loops but still take part in the lifecycle protocol.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, unbounded};
use tracing::{error, info, warn};

use crate::config::SlamConfig;
use crate::geometry::{tangent_distance, LieGroup};
use crate::mapping::{DenseMap, Mapper};
use crate::store::KeyframeStore;
use crate::tracking::FrontEnd;
use crate::viz::Visualizer;

use super::memory::MemoryProbe;
use super::messages::InputFrame;
use super::shared_state::{wait_until, SharedState};
use super::workers::{self, BackendFactory, MapPayload};

/// Number of workers spawned by [`SlamSystem::run`].
pub const NUM_WORKERS: usize = 6;

/// Pluggable implementations of each stage.
pub struct Stages<G: LieGroup> {
    pub frontend: Box<dyn FrontEnd<G>>,
    /// Builds a fresh backend; called again after a memory teardown.
    pub backend: BackendFactory<G>,
    pub mapper: Box<dyn Mapper<G, Map = DenseMap>>,
    pub visualizer: Box<dyn Visualizer<G>>,
    pub memory: Box<dyn MemoryProbe>,
}

/// Final state of a run.
#[derive(Debug, Clone)]
pub struct RunSummary<G: LieGroup> {
    pub poses: Vec<G>,
    pub frame_ids: Vec<usize>,
    pub timestamps: Vec<f64>,
    /// Deep copy of the final map, when mapping ran and succeeded.
    pub map: Option<DenseMap>,
}

impl<G: LieGroup> RunSummary<G> {
    pub fn num_keyframes(&self) -> usize {
        self.poses.len()
    }

    /// RMS tangent distance between keyframe poses and the ground-truth
    /// poses of their input frames. No alignment is applied.
    pub fn trajectory_error(&self, ground_truth: &[G]) -> Option<f64> {
        if self.poses.is_empty() {
            return None;
        }
        let mut sum = 0.0;
        for (pose, &frame_id) in self.poses.iter().zip(&self.frame_ids) {
            let reference = ground_truth.get(frame_id)?;
            sum += tangent_distance(pose, reference).powi(2);
        }
        Some((sum / self.poses.len() as f64).sqrt())
    }
}

pub struct SlamSystem<G: LieGroup> {
    config: SlamConfig,
    shared: Arc<SharedState<G>>,
}

impl<G: LieGroup> SlamSystem<G> {
    /// Validate the configuration and allocate the keyframe store.
    pub fn new(config: SlamConfig) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let store = KeyframeStore::new(config.store.buffer, config.store.shape());
        let shared = SharedState::new(store, NUM_WORKERS);
        Ok(Self { config, shared })
    }

    pub fn config(&self) -> &SlamConfig {
        &self.config
    }

    /// Shared state, for observers running alongside the workers.
    pub fn shared_state(&self) -> &Arc<SharedState<G>> {
        &self.shared
    }

    /// Process `stream` to completion and return the final state.
    ///
    /// Blocks until every worker has finished, then joins them in spawn order.
    pub fn run<I>(self, stream: I, stages: Stages<G>) -> Result<RunSummary<G>>
    where
        I: IntoIterator<Item = InputFrame>,
        I::IntoIter: Send + 'static,
    {
        let config = self.config;
        let shared = self.shared;
        let Stages {
            frontend,
            backend,
            mapper,
            visualizer,
            memory,
        } = stages;

        let (input_tx, input_rx) = unbounded::<InputFrame>();
        let (gui_tx, gui_rx) = unbounded::<DenseMap>();
        let (mapping_tx, mapping_rx) = bounded::<MapPayload>(1);
        let gui_tx = config.mapping_gui_enabled().then_some(gui_tx);
        let stream = stream.into_iter();

        let mut handles = Vec::with_capacity(NUM_WORKERS);
        {
            let shared = shared.clone();
            let run = config.show_stream;
            handles.push(spawn("show_stream", move || workers::show_stream(shared, input_rx, run))?);
        }
        {
            let shared = shared.clone();
            let config = config.clone();
            handles.push(spawn("tracking", move || {
                workers::tracking(shared, config, stream, frontend, input_tx)
            })?);
        }
        {
            let shared = shared.clone();
            let config = config.clone();
            handles.push(spawn("backend", move || workers::backend(shared, config, backend, memory))?);
        }
        {
            let shared = shared.clone();
            let run = config.run_visualization;
            handles.push(spawn("visualizing", move || workers::visualizing(shared, visualizer, run))?);
        }
        {
            let shared = shared.clone();
            let run = config.run_mapping;
            handles.push(spawn("gaussian_mapping", move || {
                workers::gaussian_mapping(shared, mapper, mapping_tx, gui_tx, run)
            })?);
        }
        {
            let shared = shared.clone();
            let run = config.mapping_gui_enabled();
            handles.push(spawn("mapping_gui", move || workers::mapping_gui(shared, gui_rx, run))?);
        }

        let map = if config.run_mapping {
            // A closed queue means the mapping worker died before sending.
            let received = mapping_rx.recv().ok().flatten();
            let map = received.as_ref().map(|shared_map| shared_map.read().clone());
            drop(received);
            shared.lifecycle.set_received_mapping();
            match &map {
                Some(map) => info!(frames = map.frames.len(), points = map.num_points(), "Received final map"),
                None => warn!("Mapping finished without a map"),
            }
            map
        } else {
            None
        };

        wait_until(|| shared.lifecycle.all_finished());
        shared.request_shutdown();
        let mut panicked = Vec::new();
        for (name, handle) in handles {
            match handle.join() {
                Ok(()) => info!("Terminated worker {}", name),
                Err(_) => {
                    error!("Worker {} panicked", name);
                    panicked.push(name);
                }
            }
        }
        if !panicked.is_empty() {
            bail!("workers panicked: {}", panicked.join(", "));
        }

        let snapshot = shared.store.snapshot(None);
        let summary = RunSummary {
            poses: snapshot.state.poses,
            frame_ids: snapshot.frame_ids,
            timestamps: snapshot.timestamps,
            map,
        };
        if config.evaluate {
            info!(keyframes = summary.num_keyframes(), "Run finished, ready for evaluation");
        }
        Ok(summary)
    }
}

fn spawn(name: &str, body: impl FnOnce() + Send + 'static) -> Result<(String, JoinHandle<()>)> {
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .with_context(|| format!("failed to spawn worker {}", name))?;
    Ok((name.to_string(), handle))
}
