//! Accelerator discovery.

use std::process::Command;

pub const AVAILABLE_DEVICES_ENV: &str = "EMBER_AVAILABLE_DEVICES";

/// Reports how many accelerators this host can give to a launch.
pub trait DeviceProbe: Send + Sync {
    fn available_devices(&self) -> usize;
}

/// A probe that always answers the same count.
#[derive(Debug, Clone, Copy)]
pub struct FixedDeviceProbe(pub usize);

impl DeviceProbe for FixedDeviceProbe {
    fn available_devices(&self) -> usize {
        self.0
    }
}

/// Probes, in order: `EMBER_AVAILABLE_DEVICES`, `CUDA_VISIBLE_DEVICES`, `nvidia-smi -L`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDeviceProbe;

impl DeviceProbe for SystemDeviceProbe {
    fn available_devices(&self) -> usize {
        if let Ok(raw) = std::env::var(AVAILABLE_DEVICES_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(n) => return n,
                Err(_) => tracing::warn!(value = %raw, "ignoring unparseable {AVAILABLE_DEVICES_ENV}"),
            }
        }
        if let Ok(raw) = std::env::var("CUDA_VISIBLE_DEVICES") {
            return count_visible_devices(&raw);
        }
        match nvidia_smi_device_count() {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("nvidia-smi unavailable: {e}");
                0
            }
        }
    }
}

/// Count ids in a `CUDA_VISIBLE_DEVICES` value. `-1` hides every device.
#[must_use]
pub fn count_visible_devices(raw: &str) -> usize {
    raw.split(',')
        .map(str::trim)
        .take_while(|id| !id.is_empty() && !id.starts_with('-'))
        .count()
}

fn nvidia_smi_device_count() -> anyhow::Result<usize> {
    let output = Command::new("nvidia-smi").arg("-L").output()?;
    if !output.status.success() {
        anyhow::bail!("nvidia-smi exited with {}", output.status);
    }
    let stdout = String::from_utf8(output.stdout)?;
    Ok(stdout.lines().filter(|l| l.trim_start().starts_with("GPU ")).count())
}
