use serde::{Deserialize, Serialize};

use super::{Device, DeviceConfig, DeviceId, WorkerMode};
use crate::{Result, TensorError};

/// Shape of a device mesh and the settings every device in it shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub rows: usize,
    pub cols: usize,
    pub device: DeviceConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            rows: 1,
            cols: 1,
            device: DeviceConfig::default(),
        }
    }
}

impl MeshConfig {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            ..Self::default()
        }
    }

    pub fn num_devices(&self) -> usize {
        self.rows * self.cols
    }
}

/// A `rows x cols` grid of open devices, numbered row-major from 0.
#[derive(Debug)]
pub struct DeviceMesh {
    config: MeshConfig,
    devices: Vec<Device>,
}

impl DeviceMesh {
    pub fn open(config: MeshConfig) -> Result<Self> {
        if config.num_devices() == 0 {
            return Err(TensorError::ShapeError(format!(
                "mesh {}x{} has no devices",
                config.rows, config.cols
            )));
        }
        let devices = (0..config.num_devices())
            .map(|i| Device::open(DeviceId(i as u32), config.device.clone()))
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(
            "opened {}x{} device mesh ({:?} workers)",
            config.rows,
            config.cols,
            config.device.worker_mode
        );
        Ok(Self { config, devices })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.config.rows, self.config.cols)
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// Devices in id order.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, row: usize, col: usize) -> Option<&Device> {
        if row >= self.config.rows || col >= self.config.cols {
            return None;
        }
        self.devices.get(row * self.config.cols + col)
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id() == id)
    }

    pub fn set_worker_mode(&self, mode: WorkerMode) {
        for device in &self.devices {
            device.set_worker_mode(mode);
        }
    }

    /// Drain every device queue.
    pub fn drain(&self) -> Result<()> {
        for device in &self.devices {
            device.drain()?;
        }
        Ok(())
    }

    pub fn close(&self) {
        for device in &self.devices {
            device.close();
        }
    }
}

impl Drop for DeviceMesh {
    fn drop(&mut self) {
        self.close();
    }
}
