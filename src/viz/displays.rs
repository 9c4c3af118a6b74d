//! Queue-driven displays: the raw input stream and the mapping GUI.

use crossbeam_channel::Receiver;
use tracing::debug;

use crate::mapping::DenseMap;
use crate::system::messages::InputFrame;

/// Shows raw input frames forwarded by tracking.
#[derive(Debug, Default)]
pub struct StreamDisplay {
    shown: usize,
}

impl StreamDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show every queued frame. Returns how many were shown.
    pub fn drain(&mut self, queue: &Receiver<InputFrame>) -> usize {
        let mut n = 0;
        while let Ok(frame) = queue.try_recv() {
            let valid_depth = frame
                .depth
                .as_ref()
                .map_or(0, |d| d.iter().filter(|z| **z > 0.0).count());
            debug!(index = frame.index, timestamp = frame.timestamp, valid_depth, "input frame");
            n += 1;
        }
        self.shown += n;
        n
    }

    pub fn shown(&self) -> usize {
        self.shown
    }
}

/// Displays map updates published by the mapping stage.
#[derive(Debug, Default)]
pub struct MappingGui {
    latest: Option<DenseMap>,
    updates: usize,
}

impl MappingGui {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued map update, keeping the newest.
    pub fn drain(&mut self, queue: &Receiver<DenseMap>) -> usize {
        let mut n = 0;
        while let Ok(map) = queue.try_recv() {
            debug!(frames = map.frames.len(), points = map.num_points(), "map update");
            self.latest = Some(map);
            n += 1;
        }
        self.updates += n;
        n
    }

    pub fn latest(&self) -> Option<&DenseMap> {
        self.latest.as_ref()
    }

    pub fn updates(&self) -> usize {
        self.updates
    }
}
