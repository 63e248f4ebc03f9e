// Copyright 2024 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The seam between `NodeAgent` and local resource sampling (SPEC_FULL.md
//! §4.7/§6). The shipped implementation is `sysinfo`-backed and reports an
//! empty GPU list; full GPU telemetry is out of scope (§1) and left as a
//! second implementation a deployment can swap in, grounded on
//! `examples/other_examples/28ded16a_ananis25-materialize__src-orchestrator-process-src-lib.rs.rs`'s
//! use of `sysinfo` for process/host sampling.

use std::collections::BTreeMap;

use sysinfo::{Disks, System};

#[derive(Debug, Clone, Default)]
pub struct CpuSnapshot {
    pub logical_cores: u32,
    pub total_percent: f64,
    pub per_core_percent: BTreeMap<u32, f64>,
}

#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MountSnapshot {
    pub mount_point: String,
    pub fs_type: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct GpuSnapshot {
    pub index: u32,
    pub name: String,
    pub mem_total_bytes: u64,
    pub util_percent: f64,
    pub mem_util_percent: f64,
    pub mem_used_bytes: u64,
    pub mem_free_bytes: u64,
    pub temperature_c: f64,
    pub power_w: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceSnapshot {
    pub cpu: CpuSnapshot,
    pub memory: MemorySnapshot,
    pub mounts: Vec<MountSnapshot>,
    pub gpus: Vec<GpuSnapshot>,
}

/// External collaborator seam (SPEC_FULL.md §6): `NodeAgent` depends on this
/// trait, never on `sysinfo` directly, so a GPU-aware sampler can be swapped
/// in without touching the agent.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceSnapshot;
}

pub struct SysinfoResourceSampler {
    system: parking_lot::Mutex<System>,
}

impl SysinfoResourceSampler {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        Self { system: parking_lot::Mutex::new(system) }
    }
}

impl Default for SysinfoResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoResourceSampler {
    fn sample(&self) -> ResourceSnapshot {
        let mut system = self.system.lock();
        system.refresh_cpu_all();
        system.refresh_memory();

        let cpus = system.cpus();
        let logical_cores = cpus.len() as u32;
        let per_core_percent: BTreeMap<u32, f64> = cpus
            .iter()
            .enumerate()
            .map(|(i, cpu)| (i as u32, cpu.cpu_usage() as f64))
            .collect();
        let total_percent = if per_core_percent.is_empty() {
            0.0
        } else {
            per_core_percent.values().sum::<f64>() / per_core_percent.len() as f64
        };

        let memory = MemorySnapshot {
            total_bytes: system.total_memory(),
            used_bytes: system.used_memory(),
            available_bytes: system.available_memory(),
            free_bytes: system.free_memory(),
        };

        let disks = Disks::new_with_refreshed_list();
        let mounts = disks
            .iter()
            .map(|d| {
                let total = d.total_space();
                let available = d.available_space();
                MountSnapshot {
                    mount_point: d.mount_point().to_string_lossy().into_owned(),
                    fs_type: d.file_system().to_string_lossy().into_owned(),
                    total_bytes: total,
                    used_bytes: total.saturating_sub(available),
                    available_bytes: available,
                }
            })
            .collect();

        ResourceSnapshot {
            cpu: CpuSnapshot { logical_cores, total_percent, per_core_percent },
            memory,
            mounts,
            gpus: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysinfo_sampler_reports_no_gpus() {
        let sampler = SysinfoResourceSampler::new();
        let snap = sampler.sample();
        assert!(snap.gpus.is_empty());
        assert!(snap.cpu.logical_cores >= 1);
    }
}
