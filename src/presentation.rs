//! Updates produced for whatever renders the flight.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AltitudeZoneState {
    Good,
    Bad,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScreenUpdate {
    PeriodNumber(u32),
    Distance(u16),
    Altitude(u16),
    /// An altitude controller became active or inactive.
    AltitudeControls(bool),
    AltitudeZone {
        controller: usize,
        zone: u32,
        state: AltitudeZoneState,
    },
    Manual(bool),
}

/// Consumer of presentation updates. The core only writes to it.
pub trait Presentation: Send + Sync {
    fn update(&self, update: ScreenUpdate);
}

/// Emits every update as a JSON log line.
#[derive(Debug, Default)]
pub struct LogPresentation;

impl Presentation for LogPresentation {
    fn update(&self, update: ScreenUpdate) {
        match serde_json::to_string(&update) {
            Ok(json) => info!(target: "screen", "{}", json),
            Err(_) => info!(target: "screen", "{:?}", update),
        }
    }
}

/// Keeps updates in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingPresentation {
    updates: Mutex<Vec<ScreenUpdate>>,
}

impl RecordingPresentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<ScreenUpdate> {
        self.updates.lock().clone()
    }
}

impl Presentation for RecordingPresentation {
    fn update(&self, update: ScreenUpdate) {
        self.updates.lock().push(update);
    }
}
