//! Compute devices attached to the host.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Index of a device in the configured device list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {}", self.0)
    }
}

/// Kind of compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Accelerator,
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceKind::Cpu),
            "gpu" => Ok(DeviceKind::Gpu),
            "acc" | "accelerator" => Ok(DeviceKind::Accelerator),
            other => Err(format!("unknown device kind '{}'", other)),
        }
    }
}

/// One entry of the device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub kind: DeviceKind,
    pub platform: usize,
}

impl DeviceSpec {
    /// Device of `kind` on platform `platform`.
    pub fn new(kind: DeviceKind, platform: usize) -> Self {
        Self { kind, platform }
    }
}

/// Parses `kind[@platform]`, e.g. `gpu@1`.
impl FromStr for DeviceSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (kind, platform) = match s.split_once('@') {
            Some((k, p)) => {
                let platform = p
                    .trim()
                    .parse::<usize>()
                    .map_err(|e| format!("bad platform index '{}': {}", p, e))?;
                (k, platform)
            }
            None => (s, 0),
        };
        Ok(DeviceSpec::new(kind.parse()?, platform))
    }
}

/// How devices map onto driver contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlatformGrouping {
    /// Every device gets its own context.
    #[default]
    PerDevice,
    /// Devices of the same platform share one context.
    PerPlatform,
}

impl FromStr for PlatformGrouping {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "device" | "per-device" => Ok(PlatformGrouping::PerDevice),
            "platform" | "per-platform" => Ok(PlatformGrouping::PerPlatform),
            other => Err(format!("unknown platform grouping '{}'", other)),
        }
    }
}

/// The fixed device list for a run, with resolved context indices.
#[derive(Debug, Clone)]
pub struct DeviceSet {
    specs: Vec<DeviceSpec>,
    contexts: Vec<usize>,
}

impl DeviceSet {
    /// Assign context indices to `specs` under `grouping`.
    pub fn new(specs: Vec<DeviceSpec>, grouping: PlatformGrouping) -> Self {
        let contexts = match grouping {
            PlatformGrouping::PerDevice => (0..specs.len()).collect(),
            PlatformGrouping::PerPlatform => {
                let mut platforms: Vec<usize> = Vec::new();
                specs
                    .iter()
                    .map(|spec| match platforms.iter().position(|&p| p == spec.platform) {
                        Some(ctx) => ctx,
                        None => {
                            platforms.push(spec.platform);
                            platforms.len() - 1
                        }
                    })
                    .collect()
            }
        };
        Self { specs, contexts }
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// True when no device is configured.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Ids of every device in order.
    pub fn ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        (0..self.specs.len()).map(DeviceId)
    }

    /// Description of `id`.
    pub fn spec(&self, id: DeviceId) -> Option<&DeviceSpec> {
        self.specs.get(id.0)
    }

    /// Driver context the device belongs to.
    pub fn context_of(&self, id: DeviceId) -> Option<usize> {
        self.contexts.get(id.0).copied()
    }

    /// Number of distinct contexts.
    pub fn context_count(&self) -> usize {
        self.contexts.iter().max().map_or(0, |m| m + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spec() {
        let spec: DeviceSpec = "gpu@2".parse().unwrap();
        assert_eq!(spec, DeviceSpec::new(DeviceKind::Gpu, 2));
        let spec: DeviceSpec = "cpu".parse().unwrap();
        assert_eq!(spec.platform, 0);
        assert!("fpga".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn test_platform_grouping() {
        let specs = vec![
            DeviceSpec::new(DeviceKind::Cpu, 0),
            DeviceSpec::new(DeviceKind::Gpu, 1),
            DeviceSpec::new(DeviceKind::Gpu, 1),
        ];
        let per_device = DeviceSet::new(specs.clone(), PlatformGrouping::PerDevice);
        assert_eq!(per_device.context_count(), 3);

        let per_platform = DeviceSet::new(specs, PlatformGrouping::PerPlatform);
        assert_eq!(per_platform.context_count(), 2);
        assert_eq!(per_platform.context_of(DeviceId(2)), Some(1));
    }
}
