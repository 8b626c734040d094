use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::config::{RqdConfig, CORE_POINTS_PER_CORE};

/// Host facts that do not change within a process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticHostInfo {
    pub hostname: String,
    pub os: String,
    /// Seconds since epoch.
    pub boot_time: u64,
    /// Logical cores in hundredths (after `OVERRIDE_CORES`).
    pub total_cores: u32,
    /// Physical sockets (after `OVERRIDE_PROCS`).
    pub num_procs: u32,
    /// `logical_cores / physical_cores`, at least 1.
    pub hyperthread_multiplier: u32,
    /// Kilobytes (after `OVERRIDE_MEMORY`).
    pub total_mem_kb: u64,
    pub total_swap_kb: u64,
}

/// Facts refreshed on every status report.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HostSample {
    pub free_mem_kb: u64,
    pub free_swap_kb: u64,
    pub total_mcp_kb: u64,
    pub free_mcp_kb: u64,
    /// One-minute load x100, divided by the hyper-thread multiplier, plus
    /// the configured modifier.
    pub load: u32,
    pub total_gpu_kb: u64,
    pub free_gpu_kb: u64,
}

/// Read-only facade over the OS. The only component allowed to touch
/// sysinfo, statvfs, or the GPU tool directly.
pub struct HostProbe {
    config: Arc<RqdConfig>,
    info: StaticHostInfo,
    scratch: PathBuf,
    sys: Mutex<System>,
    last: Mutex<HostSample>,
}

impl HostProbe {
    pub fn new(config: Arc<RqdConfig>) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let logical = sys.cpus().len().max(1) as u32;
        let physical = sys
            .physical_core_count()
            .unwrap_or(logical as usize)
            .max(1) as u32;
        let multiplier = (logical / physical).max(1);

        let total_cores = config
            .override_cores
            .map(|c| c * CORE_POINTS_PER_CORE)
            .unwrap_or(logical * CORE_POINTS_PER_CORE);
        let num_procs = config
            .override_procs
            .unwrap_or_else(|| socket_count().unwrap_or(1));
        let total_mem_kb = config
            .override_memory_kb
            .unwrap_or(sys.total_memory() / 1024);

        let info = StaticHostInfo {
            hostname: resolve_hostname(&config),
            os: std::env::consts::OS.to_string(),
            boot_time: System::boot_time(),
            total_cores,
            num_procs,
            hyperthread_multiplier: multiplier,
            total_mem_kb,
            total_swap_kb: sys.total_swap() / 1024,
        };

        Self {
            config,
            info,
            scratch: crate::config::default_temp_path(),
            sys: Mutex::new(sys),
            last: Mutex::new(HostSample::default()),
        }
    }

    /// Static facts, memoised at construction.
    pub fn static_info(&self) -> &StaticHostInfo {
        &self.info
    }

    /// Scratch root used for per-frame temp directories.
    pub fn scratch_path(&self) -> &PathBuf {
        &self.scratch
    }

    /// Most recent sample without touching the OS. Zeroed until the first
    /// `sample()` call completes.
    pub fn last_sample(&self) -> HostSample {
        *self.last.lock().unwrap()
    }

    /// Take a fresh sample. Individual sources that fail fall back to the
    /// last good value; this never errors out to the caller.
    pub async fn sample(&self) -> HostSample {
        let mut out = *self.last.lock().unwrap();

        {
            let mut sys = self.sys.lock().unwrap();
            sys.refresh_memory();
            out.free_mem_kb = sys.available_memory() / 1024;
            out.free_swap_kb = sys.free_swap() / 1024;
        }

        let load = System::load_average().one;
        let normalised =
            (load * 100.0) as i64 / i64::from(self.info.hyperthread_multiplier);
        out.load = (normalised + i64::from(self.config.load_modifier)).max(0) as u32;

        match scratch_space_kb(&self.scratch) {
            Some((total, free)) => {
                out.total_mcp_kb = total;
                out.free_mcp_kb = free;
            }
            None => {
                tracing::warn!(path = %self.scratch.display(), "Scratch disk probe failed, keeping last sample");
            }
        }

        if self.config.gpu {
            let (total, free) = sample_gpu_kb().await;
            out.total_gpu_kb = total;
            out.free_gpu_kb = free;
        }

        *self.last.lock().unwrap() = out;
        out
    }
}

fn resolve_hostname(config: &RqdConfig) -> String {
    if let Some(name) = &config.override_hostname {
        return name.clone();
    }
    let name = System::host_name().unwrap_or_else(|| "localhost".to_string());
    if config.use_ip_as_hostname || config.use_ipv6_as_hostname {
        let want_v6 = config.use_ipv6_as_hostname;
        if let Ok(addrs) = (name.as_str(), 0u16).to_socket_addrs() {
            for addr in addrs {
                if addr.is_ipv6() == want_v6 {
                    return addr.ip().to_string();
                }
            }
        }
        tracing::warn!(host = %name, "Could not resolve host address, using hostname");
    }
    name
}

/// Distinct "physical id" values in /proc/cpuinfo.
fn socket_count() -> Option<u32> {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    let mut ids = std::collections::HashSet::new();
    for line in cpuinfo.lines() {
        if let Some(rest) = line.strip_prefix("physical id") {
            if let Some(id) = rest.split(':').nth(1) {
                ids.insert(id.trim().to_string());
            }
        }
    }
    if ids.is_empty() {
        None
    } else {
        Some(ids.len() as u32)
    }
}

fn scratch_space_kb(path: &PathBuf) -> Option<(u64, u64)> {
    let vfs = nix::sys::statvfs::statvfs(path).ok()?;
    let frag = vfs.fragment_size() as u64;
    let total = vfs.blocks() as u64 * frag / 1024;
    let free = vfs.blocks_available() as u64 * frag / 1024;
    Some((total, free))
}

/// Sum of (total, free) memory across GPUs, in kilobytes. Any failure
/// reports zero; a host without the tool simply has no GPU to expose.
async fn sample_gpu_kb() -> (u64, u64) {
    let output = tokio::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.total,memory.free",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .await;
    let output = match output {
        Ok(out) if out.status.success() => out,
        _ => return (0, 0),
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let mut total = 0u64;
    let mut free = 0u64;
    for line in text.lines() {
        let mut parts = line.split(',').map(str::trim);
        let (Some(t), Some(f)) = (parts.next(), parts.next()) else {
            continue;
        };
        // nvidia-smi reports MiB with nounits.
        total += t.parse::<u64>().unwrap_or(0) * 1024;
        free += f.parse::<u64>().unwrap_or(0) * 1024;
    }
    (total, free)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<RqdConfig> {
        Arc::new(RqdConfig::default())
    }

    #[test]
    fn static_info_is_populated() {
        let probe = HostProbe::new(test_config());
        let info = probe.static_info();
        assert!(!info.hostname.is_empty());
        assert!(info.total_cores >= CORE_POINTS_PER_CORE);
        assert!(info.hyperthread_multiplier >= 1);
        assert!(info.num_procs >= 1);
    }

    #[test]
    fn override_cores_clamps_total() {
        let cfg = RqdConfig {
            override_cores: Some(2),
            override_memory_kb: Some(4_000_000),
            ..RqdConfig::default()
        };
        let probe = HostProbe::new(Arc::new(cfg));
        assert_eq!(probe.static_info().total_cores, 200);
        assert_eq!(probe.static_info().total_mem_kb, 4_000_000);
    }

    #[test]
    fn override_hostname_wins() {
        let cfg = RqdConfig {
            override_hostname: Some("render0001".to_string()),
            ..RqdConfig::default()
        };
        let probe = HostProbe::new(Arc::new(cfg));
        assert_eq!(probe.static_info().hostname, "render0001");
    }

    #[tokio::test]
    async fn sample_never_fails() {
        let probe = HostProbe::new(test_config());
        let s = probe.sample().await;
        // Memory numbers come from sysinfo and must be present on any host
        // the test suite runs on.
        assert!(s.free_mem_kb > 0);
        // GPU probing is off by default.
        assert_eq!(s.total_gpu_kb, 0);
    }
}
