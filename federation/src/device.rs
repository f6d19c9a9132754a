use std::{env, fmt, num::NonZeroUsize};

use log::{info, warn};

use crate::{FederationErr, Result};

/// Where the numeric work of tasks is meant to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Device {
    #[default]
    Cpu,
    Accelerator(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(index) => write!(f, "cuda:{index}"),
        }
    }
}

/// Device selection for the current process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    device: Device,
    threads: Option<NonZeroUsize>,
}

impl DeviceConfig {
    /// Creates a new `DeviceConfig`.
    ///
    /// # Arguments
    /// * `device` - The requested device.
    /// * `threads` - The size of the numeric thread pool, `None` for the library default.
    pub fn new(device: Device, threads: Option<NonZeroUsize>) -> Self {
        Self { device, threads }
    }

    /// Reads the device selection from `FL_DEVICE`, `FL_NUM_THREADS` and `CUDA_VISIBLE_DEVICES`.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Same as `from_env` but reading variables through `var`.
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let device = match var("FL_DEVICE") {
            Some(device) => parse_device(&device)?,
            None => match var("CUDA_VISIBLE_DEVICES") {
                Some(visible) if !visible.trim().is_empty() && visible.trim() != "-1" => {
                    Device::Accelerator(0)
                }
                _ => Device::Cpu,
            },
        };

        let threads = match var("FL_NUM_THREADS") {
            Some(threads) => {
                let threads: usize = threads.trim().parse().map_err(|e| {
                    FederationErr::Device(format!("invalid FL_NUM_THREADS '{threads}': {e}"))
                })?;
                NonZeroUsize::new(threads)
            }
            None => None,
        };

        Ok(Self { device, threads })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn threads(&self) -> Option<NonZeroUsize> {
        self.threads
    }

    /// Builds the global thread pool used by every numeric kernel.
    ///
    /// Must be called once, before any training happens.
    ///
    /// # Returns
    /// The device tasks will effectively run on, or an error if the pool was already built.
    pub fn apply(&self) -> Result<Device> {
        let mut builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads) = self.threads {
            builder = builder.num_threads(threads.get());
        }

        builder
            .build_global()
            .map_err(|e| FederationErr::Device(e.to_string()))?;

        let effective = match self.device {
            Device::Cpu => Device::Cpu,
            requested @ Device::Accelerator(_) => {
                warn!(requested:% = requested; "no accelerator backend available, falling back to cpu");
                Device::Cpu
            }
        };

        info!(device:% = effective, threads = rayon::current_num_threads(); "configured device");
        Ok(effective)
    }
}

fn parse_device(raw: &str) -> Result<Device> {
    let lowered = raw.trim().to_ascii_lowercase();
    let (kind, index) = match lowered.split_once(':') {
        Some((kind, index)) => (kind, Some(index)),
        None => (lowered.as_str(), None),
    };

    match (kind, index) {
        ("cpu", None) => Ok(Device::Cpu),
        ("cuda" | "gpu", None) => Ok(Device::Accelerator(0)),
        ("cuda" | "gpu", Some(index)) => index
            .parse()
            .map(Device::Accelerator)
            .map_err(|e| FederationErr::Device(format!("invalid device index in '{raw}': {e}"))),
        _ => Err(FederationErr::Device(format!("unknown device '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<DeviceConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DeviceConfig::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_to_cpu() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, DeviceConfig::default());
    }

    #[test]
    fn explicit_device_wins_over_visible_devices() {
        let config = from_pairs(&[("FL_DEVICE", "CPU"), ("CUDA_VISIBLE_DEVICES", "0,1")]).unwrap();
        assert_eq!(config.device(), Device::Cpu);

        let config = from_pairs(&[("FL_DEVICE", "cuda:1")]).unwrap();
        assert_eq!(config.device(), Device::Accelerator(1));

        let config = from_pairs(&[("FL_DEVICE", "gpu")]).unwrap();
        assert_eq!(config.device(), Device::Accelerator(0));
    }

    #[test]
    fn visible_devices_select_an_accelerator() {
        let config = from_pairs(&[("CUDA_VISIBLE_DEVICES", "2")]).unwrap();
        assert_eq!(config.device(), Device::Accelerator(0));

        let config = from_pairs(&[("CUDA_VISIBLE_DEVICES", "-1")]).unwrap();
        assert_eq!(config.device(), Device::Cpu);
    }

    #[test]
    fn thread_count_is_parsed() {
        let config = from_pairs(&[("FL_NUM_THREADS", "3")]).unwrap();
        assert_eq!(config.threads(), NonZeroUsize::new(3));

        let config = from_pairs(&[("FL_NUM_THREADS", "0")]).unwrap();
        assert_eq!(config.threads(), None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            from_pairs(&[("FL_DEVICE", "tpu")]),
            Err(FederationErr::Device(_))
        ));
        assert!(from_pairs(&[("FL_DEVICE", "cuda:x")]).is_err());
        assert!(from_pairs(&[("FL_NUM_THREADS", "many")]).is_err());
    }

    #[test]
    fn pool_is_configured_once() {
        let config = DeviceConfig::new(Device::Accelerator(0), NonZeroUsize::new(2));

        // Another test may already have touched the global pool, only the second call is certain.
        if let Ok(device) = config.apply() {
            assert_eq!(device, Device::Cpu);
        }

        assert!(matches!(config.apply(), Err(FederationErr::Device(_))));
    }
}
