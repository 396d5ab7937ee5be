//! Subcommand implementations.

pub mod capture;
pub mod config;
pub mod info;

use std::sync::Arc;

use nvcap_capture_engine::{ContextHandle, OpenOptions};
use nvcap_common::config::NvcapConfig;
use nvcap_device_core::DeviceFactory;
use nvcap_device_sim::SimDevices;

use crate::DeviceArgs;

/// Open a context on the simulated devices described by `device`.
pub(crate) fn open_context(
    config: &NvcapConfig,
    device: &DeviceArgs,
) -> anyhow::Result<(SimDevices, ContextHandle)> {
    let devices = SimDevices::with_screen(device.sim_width, device.sim_height);
    let factory: Arc<dyn DeviceFactory> = Arc::new(devices.clone());

    let mut options = OpenOptions::from_config(config);
    if let Some(display) = &device.display {
        options = options.with_display(display.clone());
    }
    // Frames go to the output file explicitly; the config dump would duplicate them.
    options.dump_path = None;

    let handle = ContextHandle::open(factory, options)?;
    Ok((devices, handle))
}
