//! Common CLI setup: the demo rig hosting an in-process runtime.

use crate::error::CliError;
use regmux::config::RuntimeConfig;
use regmux::device::{DeviceConfig, DeviceKind, NullDeviceOps, TestRegisterIo};
use regmux::dpm::MemoryDpm;
use regmux::runtime::Runtime;
use std::sync::Arc;

/// An in-process runtime with a small fleet of in-memory devices:
/// two I²C sensors sharing one bus, one MMIO block, and a DPM device.
pub struct DemoRig {
    pub runtime: Runtime,
    pub sensors: Vec<u32>,
    pub mmio: u32,
    pub dpm: u32,
}

pub const DEMO_BUS_ID: i32 = 0;

impl DemoRig {
    pub fn build() -> Result<Self, CliError> {
        let runtime = Runtime::new(RuntimeConfig::default()).with_dpm(Arc::new(MemoryDpm::new()));

        runtime.register_device(
            DeviceConfig::new(1, "sensor0", DeviceKind::I2c).with_bus(DEMO_BUS_ID),
            Some(Arc::new(TestRegisterIo::new())),
            Arc::new(NullDeviceOps),
        )?;
        runtime.register_device(
            DeviceConfig::new(2, "sensor1", DeviceKind::I2c).with_bus(DEMO_BUS_ID),
            Some(Arc::new(TestRegisterIo::new())),
            Arc::new(NullDeviceOps),
        )?;
        runtime.register_device(
            DeviceConfig::new(3, "isp0", DeviceKind::Mmio),
            Some(Arc::new(TestRegisterIo::new())),
            Arc::new(NullDeviceOps),
        )?;
        runtime.register_device(
            DeviceConfig::new(4, "dpm0", DeviceKind::Dpm),
            None,
            Arc::new(NullDeviceOps),
        )?;

        Ok(Self {
            runtime,
            sensors: vec![1, 2],
            mmio: 3,
            dpm: 4,
        })
    }

    pub fn device_ids(&self) -> Vec<u32> {
        vec![self.sensors[0], self.sensors[1], self.mmio, self.dpm]
    }
}
