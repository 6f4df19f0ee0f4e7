//! Power/clock-management backend interface.
//!
//! Clock and QoS control is an external collaborator; the runtime routes the
//! DPM commands through this trait. The default backend acknowledges updates
//! and rejects reads; the in-memory backend backs tests and the CLI.

use crate::error::{Error, Result};
use crate::sync::lock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// One clock-rate update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSetting {
    pub device_id: u32,
    pub frequency_hz: u64,
}

/// One bandwidth/QoS request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosRequest {
    pub device_id: u32,
    pub frequency_hz: u64,
}

/// Backend consuming DPM commands.
pub trait DpmBackend: Send + Sync {
    fn update_clocks(&self, settings: &[ClockSetting]) -> Result<()>;

    fn update_qos(&self, requests: &[QosRequest]) -> Result<()>;

    fn clock_hz(&self, device_id: u32) -> Result<u64>;
}

/// Backend that acknowledges updates and supports no reads.
pub struct NoopDpm;

impl DpmBackend for NoopDpm {
    fn update_clocks(&self, settings: &[ClockSetting]) -> Result<()> {
        debug!(count = settings.len(), "dpm clock update acknowledged");
        Ok(())
    }

    fn update_qos(&self, requests: &[QosRequest]) -> Result<()> {
        debug!(count = requests.len(), "dpm qos update acknowledged");
        Ok(())
    }

    fn clock_hz(&self, _device_id: u32) -> Result<u64> {
        Err(Error::NotSupported)
    }
}

/// In-memory backend remembering the last clock setting per device.
#[derive(Default)]
pub struct MemoryDpm {
    clocks: Mutex<HashMap<u32, u64>>,
}

impl MemoryDpm {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DpmBackend for MemoryDpm {
    fn update_clocks(&self, settings: &[ClockSetting]) -> Result<()> {
        let mut clocks = lock(&self.clocks);
        for setting in settings {
            clocks.insert(setting.device_id, setting.frequency_hz);
        }
        Ok(())
    }

    fn update_qos(&self, requests: &[QosRequest]) -> Result<()> {
        debug!(count = requests.len(), "dpm qos update recorded");
        Ok(())
    }

    fn clock_hz(&self, device_id: u32) -> Result<u64> {
        lock(&self.clocks)
            .get(&device_id)
            .copied()
            .ok_or(Error::NotFound)
    }
}
