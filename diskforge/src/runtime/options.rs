//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Loop device slots available to concurrent jobs.
pub const DEFAULT_LOOP_CAPACITY: usize = 4;

/// Per-stage deadline. Generous because the kernel install stage runs
/// apt-get inside a chroot.
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 600;

/// How long `ExhaustPolicy::Wait` queues for a loop slot.
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 30;

/// Mount attempts before the mounting stage gives up. Partition device
/// nodes can lag the `losetup -P` scan.
pub const DEFAULT_MOUNT_RETRY_LIMIT: u32 = 3;

/// Stage-1 boot code shipped by syslinux on Debian-family hosts.
pub const DEFAULT_MBR_BIN_PATH: &str = "/usr/lib/syslinux/mbr.bin";

/// Behavior when every loop device slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExhaustPolicy {
    /// Queue for a slot, failing with `ResourceExhausted` once the timeout
    /// elapses.
    Wait { timeout_secs: u64 },
    /// Fail with `ResourceExhausted` immediately.
    FailFast,
}

impl Default for ExhaustPolicy {
    fn default() -> Self {
        ExhaustPolicy::Wait {
            timeout_secs: DEFAULT_WAIT_TIMEOUT_SECS,
        }
    }
}

/// Converter-wide settings. Per-job knobs live on `ConvertRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Root of the runtime state: images/, staging/, mounts/, logs/.
    pub home_dir: PathBuf,
    pub loop_capacity: usize,
    pub exhaust_policy: ExhaustPolicy,
    pub stage_timeout_secs: u64,
    pub mount_retry_limit: u32,
    /// Stage-1 MBR blob written into sector 0 of finished images.
    pub mbr_bin_path: PathBuf,
}

impl RuntimeOptions {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            loop_capacity: DEFAULT_LOOP_CAPACITY,
            exhaust_policy: ExhaustPolicy::default(),
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            mount_retry_limit: DEFAULT_MOUNT_RETRY_LIMIT,
            mbr_bin_path: PathBuf::from(DEFAULT_MBR_BIN_PATH),
        }
    }
}

fn default_home_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DISKFORGE_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".diskforge"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/diskforge"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = RuntimeOptions::default();
        assert_eq!(opts.loop_capacity, DEFAULT_LOOP_CAPACITY);
        assert_eq!(opts.stage_timeout(), Duration::from_secs(600));
        assert_eq!(
            opts.exhaust_policy,
            ExhaustPolicy::Wait {
                timeout_secs: DEFAULT_WAIT_TIMEOUT_SECS
            }
        );
        assert_eq!(opts.mount_retry_limit, 3);
    }
}
