//! Worker bodies, one per stage.
//!
//! Every worker registers itself in `all_triggered`, waits for the others to
//! start, runs its loop while its stage is enabled, and always finishes its
//! lifecycle bookkeeping so that dependent workers and the orchestrator can
//! make progress. A failing stage logs the error and requests shutdown.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::config::SlamConfig;
use crate::geometry::LieGroup;
use crate::mapping::{DenseMap, Mapper};
use crate::tracking::FrontEnd;
use crate::viz::{MappingGui, StreamDisplay, Visualizer};

use super::backend::{Backend, BackendState, RamSafeguard};
use super::memory::MemoryProbe;
use super::messages::InputFrame;
use super::shared_state::{wait_until, SharedState, Stage};

/// Final map hand-off; `None` when mapping failed.
pub type MapPayload = Option<Arc<RwLock<DenseMap>>>;

pub type BackendFactory<G> = Box<dyn Fn() -> Backend<G> + Send>;

pub fn show_stream<G: LieGroup>(shared: Arc<SharedState<G>>, input: Receiver<InputFrame>, run: bool) {
    info!("Stream display started");
    let mut worker = shared.worker(None);
    worker.trigger_and_wait();
    let mut stream_display = StreamDisplay::new();

    while shared.lifecycle.upstream_finished() < 2 && run {
        stream_display.drain(&input);
        thread::yield_now();
    }

    worker.finish();
    info!(shown = stream_display.shown(), "Stream display done");
}

pub fn tracking<G: LieGroup, I>(
    shared: Arc<SharedState<G>>,
    config: SlamConfig,
    stream: I,
    mut frontend: Box<dyn FrontEnd<G>>,
    input: Sender<InputFrame>,
) where
    I: Iterator<Item = InputFrame>,
{
    info!("Frontend tracking started");
    let mut worker = shared.worker(Some(Stage::Tracking));
    worker.trigger_and_wait();

    let mut processed = 0;
    for mut frame in stream {
        if !shared.is_running() {
            break;
        }
        if !config.mode.uses_depth() {
            frame.depth = None;
        }
        if frame.index < config.t_start {
            continue;
        }
        if config.t_stop.is_some_and(|t_stop| frame.index > t_stop) {
            break;
        }
        if config.show_stream && input.send(frame.clone()).is_err() {
            warn!("Stream display queue closed");
        }
        if let Err(e) = frontend.process(frame, &shared.store) {
            error!("Tracking failed: {:#}", e);
            shared.request_shutdown();
            break;
        }
        processed += 1;
    }
    drop(frontend);

    worker.mark();
    worker.finish();
    info!(processed, keyframes = shared.store.counter(), "Frontend tracking done");
}

pub fn backend<G: LieGroup>(
    shared: Arc<SharedState<G>>,
    config: SlamConfig,
    factory: BackendFactory<G>,
    probe: Box<dyn MemoryProbe>,
) {
    info!("Backend started");
    let mut worker = shared.worker(Some(Stage::Backend));
    worker.trigger_and_wait();

    let run = config.run_backend;
    let delay = Duration::from_millis(config.sleep_delay_ms);
    let mut safeguard = RamSafeguard::new(config.max_ram_usage, config.min_ram_usage, probe);
    let mut state = if run {
        BackendState::Active(factory())
    } else {
        BackendState::Suspended
    };

    while shared.lifecycle.count(Stage::Tracking) < 1 && run && shared.is_running() {
        safeguard.apply(&mut state, &factory);
        match state.as_mut() {
            Some(backend) => {
                if let Err(e) = backend.optimize_window(&shared.store) {
                    error!("Backend failed: {:#}", e);
                    shared.request_shutdown();
                    break;
                }
                thread::sleep(delay);
            }
            None => thread::yield_now(),
        }
    }

    // Final full-range refinement after tracking finished.
    if run && shared.is_running() {
        if let Some(backend) = state.as_mut().filter(|b| b.do_refinement()) {
            let counter = shared.store.counter();
            info!(keyframes = counter, passes = config.backend.refinement_passes, "Backend refinement");
            for pass in 0..config.backend.refinement_passes {
                match backend.refine(&shared.store, config.backend.refinement_steps) {
                    Ok(Some(report)) => info!(pass, final_cost = report.final_cost, "Refinement pass done"),
                    Ok(None) => {}
                    Err(e) => {
                        error!("Refinement failed: {:#}", e);
                        break;
                    }
                }
            }
        }
    }
    drop(state);

    worker.mark();
    worker.finish();
    info!("Backend done");
}

pub fn visualizing<G: LieGroup>(shared: Arc<SharedState<G>>, mut visualizer: Box<dyn Visualizer<G>>, run: bool) {
    info!("Visualization started");
    let mut worker = shared.worker(Some(Stage::Visualizing));
    worker.trigger_and_wait();

    let mut finished = false;
    while shared.lifecycle.upstream_finished() < 2 && run && !finished {
        finished = visualizer.update(&shared.store).unwrap_or_else(|e| {
            warn!("Visualizer stopped: {:#}", e);
            true
        });
        thread::yield_now();
    }

    worker.mark();
    worker.finish();
    info!("Visualization done");
}

/// Publish the map to the GUI whenever it gained keyframes.
struct GuiPublisher {
    queue: Option<Sender<DenseMap>>,
    published_frames: usize,
}

impl GuiPublisher {
    fn publish(&mut self, map: &RwLock<DenseMap>, force: bool) {
        let Some(queue) = &self.queue else {
            return;
        };
        let map = map.read();
        if force || map.frames.len() != self.published_frames {
            self.published_frames = map.frames.len();
            if queue.send(map.clone()).is_err() {
                warn!("Mapping GUI queue closed");
                self.queue = None;
            }
        }
    }
}

pub fn gaussian_mapping<G: LieGroup>(
    shared: Arc<SharedState<G>>,
    mut mapper: Box<dyn Mapper<G, Map = DenseMap>>,
    mapping_queue: Sender<MapPayload>,
    gui_queue: Option<Sender<DenseMap>>,
    run: bool,
) {
    info!("Mapping started");
    let mut worker = shared.worker(Some(Stage::GaussianMapping));
    worker.trigger_and_wait();

    let map = mapper.shared_map();
    let mut gui = GuiPublisher {
        queue: gui_queue,
        published_frames: 0,
    };
    let mut failed = false;

    while shared.lifecycle.upstream_finished() < 2 && run && shared.is_running() {
        if let Err(e) = mapper.step(&shared.store, false) {
            error!("Mapping failed: {:#}", e);
            shared.request_shutdown();
            failed = true;
            break;
        }
        gui.publish(&map, false);
        thread::yield_now();
    }

    // Final passes until the mapper reports completion.
    let mut finished = failed;
    while !finished && run {
        finished = match mapper.step(&shared.store, true) {
            Ok(done) => done,
            Err(e) => {
                error!("Final mapping pass failed: {:#}", e);
                failed = true;
                true
            }
        };
    }

    if run {
        gui.publish(&map, true);
        let payload = (!failed).then(|| map.clone());
        if mapping_queue.send(payload).is_err() {
            warn!("Mapping queue closed before the final map was sent");
        } else {
            wait_until(|| shared.lifecycle.has_received_mapping());
        }
    }
    drop(gui);

    worker.mark();
    wait_until(|| shared.lifecycle.count(Stage::MappingVisualizing) >= 1);
    worker.finish();
    info!("Mapping done");
}

pub fn mapping_gui<G: LieGroup>(shared: Arc<SharedState<G>>, queue: Receiver<DenseMap>, run: bool) {
    info!("Mapping GUI started");
    let mut worker = shared.worker(Some(Stage::MappingVisualizing));
    worker.trigger_and_wait();
    let mut gui = MappingGui::new();

    while shared.lifecycle.upstream_finished() < 2 && run {
        gui.drain(&queue);
        thread::yield_now();
    }

    // Nothing new is queued once mapping finished.
    wait_until(|| shared.lifecycle.count(Stage::GaussianMapping) >= 1);
    if run {
        gui.drain(&queue);
    }

    worker.mark();
    worker.finish();
    info!(updates = gui.updates(), "Mapping GUI done");
}
