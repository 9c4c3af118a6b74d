use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use dense_vslam::config::SlamConfig;
use dense_vslam::geometry::SE3;
use dense_vslam::init_logger;
use dense_vslam::io::{GroundTruthCorrespondence, SyntheticConfig, SyntheticSequence};
use dense_vslam::mapping::PointCloudMapper;
use dense_vslam::system::{Backend, SlamSystem, Stages, SystemMemoryProbe};
use dense_vslam::tracking::DenseFrontEnd;
use dense_vslam::viz::TrajectoryLogger;

/// Confidence assigned to every synthetic correspondence.
const CORRESPONDENCE_CONFIDENCE: f64 = 10.0;

fn main() -> Result<()> {
    init_logger();

    let config = match std::env::args().nth(1) {
        Some(path) => SlamConfig::from_file(&path).with_context(|| format!("failed to load config {}", path))?,
        None => SlamConfig {
            sleep_delay_ms: 50,
            evaluate: true,
            ..SlamConfig::default()
        },
    };
    info!(mode = %config.mode, "Loaded configuration");

    let sequence = Arc::new(SyntheticSequence::generate(
        &SyntheticConfig::default(),
        config.store.shape(),
        config.intrinsics,
    )?);
    info!(frames = sequence.len(), "Generated synthetic sequence");

    let source = {
        let sequence = sequence.clone();
        move || Box::new(GroundTruthCorrespondence::new(sequence.clone(), CORRESPONDENCE_CONFIDENCE))
    };
    let stages = Stages::<SE3> {
        frontend: Box::new(DenseFrontEnd::new(&config, source())),
        backend: {
            let config = config.clone();
            let source = source.clone();
            Box::new(move || Backend::new(&config, source()))
        },
        mapper: Box::new(PointCloudMapper::new(&config.mapping)),
        visualizer: Box::new(TrajectoryLogger::new()),
        memory: Box::new(SystemMemoryProbe),
    };

    let evaluate = config.evaluate;
    let frames: Vec<_> = sequence.frames().collect();
    let system = SlamSystem::new(config)?;
    let summary = system.run(frames, stages)?;

    println!("Keyframes: {}", summary.num_keyframes());
    if let Some(map) = &summary.map {
        println!("Map: {} frames, {} points", map.frames.len(), map.num_points());
    }
    if evaluate {
        match summary.trajectory_error(&sequence.poses) {
            Some(rmse) => println!("Trajectory RMSE (tangent distance): {:.6}", rmse),
            None => println!("Trajectory could not be evaluated"),
        }
    }
    Ok(())
}
