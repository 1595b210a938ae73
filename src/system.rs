//! Host resource inventory.
//!
//! A [`System`] is a read-only snapshot of the CPU core groups and GPUs
//! available for sharding, together with the process environment at the
//! time of detection. Stages partition this inventory; nothing mutates it
//! after a run starts.
//!
//! # Detection
//!
//! | Resource | Source | Fallback |
//! |----------|--------|----------|
//! | CPU groups | `/sys/devices/system/cpu/cpu*/topology/thread_siblings_list`, limited to the affinity mask | one group per allowed logical CPU |
//! | GPUs | `nvidia-smi --query-gpu=index,memory.total` | no GPUs |

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::process::Stdio;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SystemConfig;

/// A group of logical CPU ids that share a physical core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CpuGroup {
    /// Logical CPU ids, ascending.
    pub ids: Vec<u32>,
}

/// A GPU device visible to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuInfo {
    /// Device index.
    pub id: u32,
    /// Total framebuffer memory, in MiB.
    pub total_mb: u64,
}

/// Snapshot of the host resources available for sharding.
#[derive(Debug, Clone)]
pub struct System {
    /// CPU core groups, ordered by their lowest id.
    pub cpus: Vec<CpuGroup>,
    /// GPUs, ordered by index.
    pub gpus: Vec<GpuInfo>,
    /// Process environment at detection time.
    pub env: BTreeMap<String, String>,
}

impl System {
    /// Detects the host inventory, then applies any synthetic overrides.
    pub async fn detect(overrides: &SystemConfig) -> Self {
        let cpus = match overrides.cpus {
            Some(n) => synthetic_cpus(n),
            None => detect_cpus(),
        };
        let gpus = match overrides.gpus {
            Some(n) => synthetic_gpus(n, overrides.gpu_memory_mb.unwrap_or(u64::MAX)),
            None => detect_gpus().await,
        };

        debug!("Detected {} CPU groups and {} GPUs", cpus.len(), gpus.len());

        Self {
            cpus,
            gpus,
            env: std::env::vars().collect(),
        }
    }

    /// Builds an inventory of `cpus` single-id CPU groups and `gpus` GPUs
    /// with an empty environment.
    ///
    /// # Example
    ///
    /// ```
    /// use shardrun::system::System;
    ///
    /// let system = System::synthetic(6, 2);
    /// assert_eq!(system.cpus[5].ids, vec![5]);
    /// assert_eq!(system.gpus[1].id, 1);
    /// ```
    pub fn synthetic(cpus: usize, gpus: usize) -> Self {
        Self {
            cpus: synthetic_cpus(cpus),
            gpus: synthetic_gpus(gpus, u64::MAX),
            env: BTreeMap::new(),
        }
    }

    /// The CPU groups as partitioner input.
    pub fn cpu_groups(&self) -> Vec<Vec<u32>> {
        self.cpus.iter().map(|c| c.ids.clone()).collect()
    }

    /// The GPUs as partitioner input, one single-id group per device.
    pub fn gpu_groups(&self) -> Vec<Vec<u32>> {
        self.gpus.iter().map(|g| vec![g.id]).collect()
    }
}

fn synthetic_cpus(n: usize) -> Vec<CpuGroup> {
    (0..n as u32).map(|id| CpuGroup { ids: vec![id] }).collect()
}

fn synthetic_gpus(n: usize, total_mb: u64) -> Vec<GpuInfo> {
    (0..n as u32).map(|id| GpuInfo { id, total_mb }).collect()
}

fn detect_cpus() -> Vec<CpuGroup> {
    let allowed = allowed_cpus();
    match read_sibling_groups(Path::new("/sys/devices/system/cpu"), allowed.as_ref()) {
        Ok(groups) if !groups.is_empty() => groups,
        Ok(_) => fallback_cpus(allowed),
        Err(e) => {
            debug!("CPU topology unavailable ({}), using logical CPUs", e);
            fallback_cpus(allowed)
        }
    }
}

/// One group per usable logical CPU when the topology cannot be read.
fn fallback_cpus(allowed: Option<BTreeSet<u32>>) -> Vec<CpuGroup> {
    match allowed {
        Some(ids) if !ids.is_empty() => ids
            .into_iter()
            .map(|id| CpuGroup { ids: vec![id] })
            .collect(),
        _ => synthetic_cpus(num_cpus::get().max(1)),
    }
}

/// CPUs this process may run on, from its affinity mask. Reflects both
/// `taskset` and container cpusets.
#[cfg(target_os = "linux")]
fn allowed_cpus() -> Option<BTreeSet<u32>> {
    // SAFETY: sched_getaffinity writes at most size_of::<cpu_set_t>() bytes
    // into the zeroed set, and CPU_ISSET only reads it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            warn!(
                "sched_getaffinity failed ({}); using every online CPU",
                std::io::Error::last_os_error()
            );
            return None;
        }
        Some(
            (0..libc::CPU_SETSIZE as usize)
                .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
                .map(|cpu| cpu as u32)
                .collect(),
        )
    }
}

#[cfg(not(target_os = "linux"))]
fn allowed_cpus() -> Option<BTreeSet<u32>> {
    None
}

/// Reads hyperthread sibling groups from a sysfs cpu directory.
///
/// With an `allowed` set, ids outside it are dropped and groups left empty
/// disappear.
pub fn read_sibling_groups(
    root: &Path,
    allowed: Option<&BTreeSet<u32>>,
) -> std::io::Result<Vec<CpuGroup>> {
    let mut groups = BTreeSet::new();

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(index) = name.strip_prefix("cpu") else {
            continue;
        };
        if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }

        let siblings = entry.path().join("topology/thread_siblings_list");
        let Ok(content) = std::fs::read_to_string(&siblings) else {
            // Offline CPUs have no topology directory.
            continue;
        };
        match parse_cpu_list(content.trim()) {
            Some(mut ids) if !ids.is_empty() => {
                if let Some(allowed) = allowed {
                    ids.retain(|id| allowed.contains(id));
                }
                if !ids.is_empty() {
                    groups.insert(CpuGroup { ids });
                }
            }
            _ => warn!("Ignoring malformed {}", siblings.display()),
        }
    }

    Ok(groups.into_iter().collect())
}

/// Parses a kernel cpu list such as `0-3,8,10-11` into sorted ids.
pub fn parse_cpu_list(list: &str) -> Option<Vec<u32>> {
    let mut ids = BTreeSet::new();

    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().ok()?;
                let hi: u32 = hi.trim().parse().ok()?;
                if lo > hi {
                    return None;
                }
                ids.extend(lo..=hi);
            }
            None => {
                ids.insert(part.parse().ok()?);
            }
        }
    }

    Some(ids.into_iter().collect())
}

async fn detect_gpus() -> Vec<GpuInfo> {
    let output = tokio::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            parse_gpu_query(&String::from_utf8_lossy(&out.stdout))
        }
        Ok(out) => {
            warn!("nvidia-smi exited with {}; assuming no GPUs", out.status);
            Vec::new()
        }
        Err(e) => {
            debug!("nvidia-smi not available ({}); assuming no GPUs", e);
            Vec::new()
        }
    }
}

/// Parses `index, memory.total` CSV rows from `nvidia-smi`.
fn parse_gpu_query(output: &str) -> Vec<GpuInfo> {
    let mut gpus: Vec<GpuInfo> = output
        .lines()
        .filter_map(|line| {
            let (id, mem) = line.split_once(',')?;
            Some(GpuInfo {
                id: id.trim().parse().ok()?,
                total_mb: mem.trim().parse().ok()?,
            })
        })
        .collect();
    gpus.sort_by_key(|g| g.id);
    gpus
}
