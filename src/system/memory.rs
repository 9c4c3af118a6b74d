//! Memory utilization sampling for the backend safeguard.

use std::collections::VecDeque;
use std::fs;

use anyhow::{bail, Context, Result};

/// Source of the used-memory fraction in `[0, 1]`.
pub trait MemoryProbe: Send {
    fn used_fraction(&mut self) -> Result<f64>;

    /// Free memory in GiB, for reporting only.
    fn free_gib(&mut self) -> Option<f64> {
        None
    }
}

/// Reads `/proc/meminfo`.
#[derive(Debug, Default)]
pub struct SystemMemoryProbe;

const MEMINFO_PATH: &str = "/proc/meminfo";

/// `(MemTotal, MemAvailable)` in kB.
pub fn parse_meminfo(text: &str) -> Result<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let slot = match key {
            "MemTotal:" => &mut total,
            "MemAvailable:" => &mut available,
            _ => continue,
        };
        *slot = Some(
            value
                .parse::<u64>()
                .with_context(|| format!("invalid meminfo value for {}", key))?,
        );
    }
    match (total, available) {
        (Some(0), _) => bail!("MemTotal is zero"),
        (Some(t), Some(a)) => Ok((t, a.min(t))),
        _ => bail!("meminfo lacks MemTotal or MemAvailable"),
    }
}

impl SystemMemoryProbe {
    fn read(&self) -> Result<(u64, u64)> {
        let text = fs::read_to_string(MEMINFO_PATH).with_context(|| format!("failed to read {}", MEMINFO_PATH))?;
        parse_meminfo(&text)
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn used_fraction(&mut self) -> Result<f64> {
        let (total, available) = self.read()?;
        Ok(1.0 - available as f64 / total as f64)
    }

    fn free_gib(&mut self) -> Option<f64> {
        self.read()
            .ok()
            .map(|(_, available)| available as f64 / (1024.0 * 1024.0))
    }
}

/// Replays a fixed sequence of readings, repeating the last one.
#[derive(Debug, Clone)]
pub struct ScriptedMemoryProbe {
    readings: VecDeque<f64>,
    last: f64,
}

impl ScriptedMemoryProbe {
    pub fn new(readings: impl IntoIterator<Item = f64>) -> Self {
        Self {
            readings: readings.into_iter().collect(),
            last: 0.0,
        }
    }

    /// Always reports `fraction`.
    pub fn constant(fraction: f64) -> Self {
        Self {
            readings: VecDeque::new(),
            last: fraction,
        }
    }
}

impl MemoryProbe for ScriptedMemoryProbe {
    fn used_fraction(&mut self) -> Result<f64> {
        if let Some(next) = self.readings.pop_front() {
            self.last = next;
        }
        Ok(self.last)
    }
}
