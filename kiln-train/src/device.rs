//! Device placement: pick input/output devices and wrap the network.
//!
//! Accelerator problems are never fatal here. Any probe or placement failure
//! is logged and the network ends up on the CPU.

use crate::backend::{Backend, PlacementFailure};
use crate::error::{DeviceError, Result};
use crate::network::Network;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a network or batch lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    Accelerator(usize),
}

impl Device {
    pub fn is_accelerator(self) -> bool {
        matches!(self, Device::Accelerator(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accelerator(id) => write!(f, "accel:{id}"),
        }
    }
}

/// Result of placement resolution.
pub struct Placement {
    pub use_accelerator: bool,
    pub input_device: Device,
    pub output_device: Device,
    pub network: Box<dyn Network>,
}

impl fmt::Debug for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Placement")
            .field("use_accelerator", &self.use_accelerator)
            .field("input_device", &self.input_device)
            .field("output_device", &self.output_device)
            .field("devices", &self.network.devices())
            .finish()
    }
}

/// Resolve devices for `network` given the requested accelerator ids.
///
/// - no ids, or the probe finds nothing usable: CPU for input and output.
/// - one id: the network moves to it; input and output are that device.
/// - several ids: input is the first id, the network is wrapped in the
///   backend's data-parallel construct and outputs are gathered on
///   [`Backend::output_device`].
///
/// Only a failure to place on the CPU itself is returned as an error.
pub fn resolve_placement(
    backend: &dyn Backend,
    network: Box<dyn Network>,
    requested_ids: &[usize],
) -> Result<Placement> {
    let mut ids: Vec<usize> = Vec::with_capacity(requested_ids.len());
    for &id in requested_ids {
        if ids.contains(&id) {
            tracing::warn!(id, "Accelerator id requested twice; ignoring duplicate");
        } else {
            ids.push(id);
        }
    }

    if ids.is_empty() {
        tracing::debug!("No accelerator ids requested; using CPU");
        return place_on_cpu(backend, network);
    }

    let available = match backend.probe_accelerators() {
        Ok(0) => {
            tracing::warn!(
                backend = backend.id(),
                ?ids,
                "No accelerator available; falling back to CPU"
            );
            return place_on_cpu(backend, network);
        }
        Ok(n) => n,
        Err(error) => {
            tracing::warn!(
                backend = backend.id(),
                %error,
                "Accelerator probe failed; falling back to CPU"
            );
            return place_on_cpu(backend, network);
        }
    };

    if let Some(&id) = ids.iter().find(|&&id| id >= available) {
        let error = DeviceError::NotPresent { id, available };
        tracing::warn!(%error, "Requested accelerator unusable; falling back to CPU");
        return place_on_cpu(backend, network);
    }

    let input_device = Device::Accelerator(ids[0]);
    let placed = if ids.len() == 1 {
        backend
            .place(network, input_device)
            .map(|network| (network, input_device))
    } else {
        let devices: Vec<Device> = ids.iter().map(|&id| Device::Accelerator(id)).collect();
        let output_device = backend.output_device(&ids);
        backend
            .wrap_for_multi_device(network, &devices, output_device)
            .map(|network| (network, output_device))
    };

    match placed {
        Ok((network, output_device)) => {
            tracing::info!(
                backend = backend.id(),
                input = %input_device,
                output = %output_device,
                replicas = ids.len(),
                "Placed network on accelerators"
            );
            Ok(Placement {
                use_accelerator: true,
                input_device,
                output_device,
                network,
            })
        }
        Err(PlacementFailure { network, error }) => {
            tracing::warn!(%error, "Accelerator placement failed; falling back to CPU");
            place_on_cpu(backend, network)
        }
    }
}

fn place_on_cpu(backend: &dyn Backend, network: Box<dyn Network>) -> Result<Placement> {
    let network = backend
        .place(network, Device::Cpu)
        .map_err(|failure| failure.error)?;
    Ok(Placement {
        use_accelerator: false,
        input_device: Device::Cpu,
        output_device: Device::Cpu,
        network,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_display() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Accelerator(3).to_string(), "accel:3");
        assert!(Device::Accelerator(0).is_accelerator());
        assert!(!Device::default().is_accelerator());
    }

    #[test]
    fn test_device_serde() {
        let json = serde_json::to_string(&Device::Accelerator(1)).unwrap();
        assert_eq!(json, r#"{"accelerator":1}"#);
        let back: Device = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Device::Accelerator(1));
    }
}
