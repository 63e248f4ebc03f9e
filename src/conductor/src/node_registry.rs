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

//! Tracks connected nodes: static (hello-time) and dynamic (heartbeat) resource
//! views, merged on read. One coarse lock, grounded on `ClusterManager` in
//! `src/meta/src/manager/cluster.rs`; merge semantics grounded on
//! `original_source/src/symphony/conductor/node_registry.py`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::{RegistryError, RegistryResult};

#[derive(Debug, Clone, Default)]
pub struct StaticCpu {
    pub logical_cores: u32,
    pub max_millicores_total: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StaticMemory {
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct StaticMount {
    pub mount_point: String,
    pub fs_type: String,
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct StaticGpu {
    pub index: u32,
    pub name: String,
    pub mem_total_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct NodeStatic {
    pub cpu: StaticCpu,
    pub memory: StaticMemory,
    pub mounts: Vec<StaticMount>,
    pub gpus: Vec<StaticGpu>,
}

#[derive(Debug, Clone, Default)]
pub struct DynamicCpu {
    pub total_percent: f64,
    pub per_core_used_percent: Vec<(u32, f64)>,
}

#[derive(Debug, Clone, Default)]
pub struct DynamicMemory {
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
    pub free_bytes: u64,
    pub buffers_bytes: u64,
    pub cached_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct DynamicMount {
    pub mount_point: String,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone)]
pub struct DynamicGpu {
    pub index: u32,
    pub util_percent: f64,
    pub mem_util_percent: f64,
    pub mem_used_bytes: u64,
    pub mem_free_bytes: u64,
    pub temperature_c: f64,
    pub power_w: f64,
}

#[derive(Debug, Clone, Default)]
pub struct NodeDynamic {
    pub timestamp_unix_ms: u64,
    pub total_capacities_used: HashMap<String, u64>,
    pub cpu: DynamicCpu,
    pub memory: DynamicMemory,
    pub mounts: Vec<DynamicMount>,
    pub gpus: Vec<DynamicGpu>,
}

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: String,
    pub groups: Vec<String>,
    pub capacities_total: HashMap<String, u64>,
    pub static_: Option<NodeStatic>,
    pub dynamic: Option<NodeDynamic>,
    pub conda_envs: BTreeSet<String>,
    pub last_heartbeat: Instant,
}

impl NodeRecord {
    pub fn is_stale(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > ttl
    }
}

/// Merged static+dynamic view returned by [`NodeRegistry::combined_snapshot`].
///
/// `cpu` and `memory` are kept as separate un-merged `{static, dynamic}`
/// sub-objects (SPEC_FULL.md §3); only `gpus`/`storage_mounts` are field-merged
/// by key, dynamic winning on collision.
#[derive(Debug, Clone)]
pub struct CombinedNode {
    pub node_id: String,
    pub groups: Vec<String>,
    pub capacities_total: HashMap<String, u64>,
    pub cpu_static: Option<StaticCpu>,
    pub cpu_dynamic: Option<DynamicCpu>,
    pub memory_static: Option<StaticMemory>,
    pub memory_dynamic: Option<DynamicMemory>,
    pub storage_mounts: Vec<CombinedMount>,
    pub gpus: Vec<CombinedGpu>,
    pub conda_envs: BTreeSet<String>,
    pub last_heartbeat: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct CombinedMount {
    pub mount_point: String,
    pub fs_type: Option<String>,
    pub total_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
    pub available_bytes: Option<u64>,
    pub used_percent: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct CombinedGpu {
    pub index: u32,
    pub name: Option<String>,
    pub mem_total_bytes: Option<u64>,
    pub util_percent: Option<f64>,
    pub mem_util_percent: Option<f64>,
    pub mem_used_bytes: Option<u64>,
    pub mem_free_bytes: Option<u64>,
    pub temperature_c: Option<f64>,
    pub power_w: Option<f64>,
}

fn merge_gpu(static_gpus: &[StaticGpu], dynamic_gpus: &[DynamicGpu]) -> Vec<CombinedGpu> {
    let mut by_index: BTreeMap<u32, CombinedGpu> = BTreeMap::new();
    for g in static_gpus {
        by_index.insert(
            g.index,
            CombinedGpu {
                index: g.index,
                name: Some(g.name.clone()),
                mem_total_bytes: Some(g.mem_total_bytes),
                ..Default::default()
            },
        );
    }
    for g in dynamic_gpus {
        let entry = by_index.entry(g.index).or_insert_with(|| CombinedGpu {
            index: g.index,
            ..Default::default()
        });
        entry.util_percent = Some(g.util_percent);
        entry.mem_util_percent = Some(g.mem_util_percent);
        entry.mem_used_bytes = Some(g.mem_used_bytes);
        entry.mem_free_bytes = Some(g.mem_free_bytes);
        entry.temperature_c = Some(g.temperature_c);
        entry.power_w = Some(g.power_w);
    }
    by_index.into_values().collect()
}

fn merge_mounts(static_mounts: &[StaticMount], dynamic_mounts: &[DynamicMount]) -> Vec<CombinedMount> {
    let mut by_point: BTreeMap<String, CombinedMount> = BTreeMap::new();
    for m in static_mounts {
        by_point.insert(
            m.mount_point.clone(),
            CombinedMount {
                mount_point: m.mount_point.clone(),
                fs_type: Some(m.fs_type.clone()),
                total_bytes: Some(m.total_bytes),
                ..Default::default()
            },
        );
    }
    for m in dynamic_mounts {
        let entry = by_point
            .entry(m.mount_point.clone())
            .or_insert_with(|| CombinedMount {
                mount_point: m.mount_point.clone(),
                ..Default::default()
            });
        entry.used_bytes = Some(m.used_bytes);
        entry.available_bytes = Some(m.available_bytes);
        entry.used_percent = Some(m.used_percent);
    }
    by_point.into_values().collect()
}

#[derive(Default)]
struct Core {
    nodes: HashMap<String, NodeRecord>,
}

pub struct NodeRegistry {
    core: RwLock<Core>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            core: RwLock::new(Core::default()),
        }
    }

    pub fn node_hello(
        &self,
        node_id: String,
        groups: Vec<String>,
        capacities_total: HashMap<String, u64>,
        static_: NodeStatic,
    ) -> RegistryResult<()> {
        let mut core = self.core.write();
        if core.nodes.contains_key(&node_id) {
            return Err(RegistryError::AlreadyRegistered(node_id));
        }
        core.nodes.insert(
            node_id.clone(),
            NodeRecord {
                node_id,
                groups,
                capacities_total,
                static_: Some(static_),
                dynamic: None,
                conda_envs: BTreeSet::new(),
                last_heartbeat: Instant::now(),
            },
        );
        Ok(())
    }

    /// Creates-if-absent so a heartbeat that races ahead of hello does not drop
    /// on the floor (SPEC_FULL.md §4.2).
    pub fn heartbeat(&self, node_id: String, dynamic: NodeDynamic) {
        let mut core = self.core.write();
        let record = core.nodes.entry(node_id.clone()).or_insert_with(|| NodeRecord {
            node_id,
            groups: Vec::new(),
            capacities_total: HashMap::new(),
            static_: None,
            dynamic: None,
            conda_envs: BTreeSet::new(),
            last_heartbeat: Instant::now(),
        });
        record.dynamic = Some(dynamic);
        record.last_heartbeat = Instant::now();
    }

    pub fn update_conda_envs(&self, node_id: &str, names: BTreeSet<String>) {
        let mut core = self.core.write();
        if let Some(record) = core.nodes.get_mut(node_id) {
            record.conda_envs = names;
        }
    }

    pub fn combined_snapshot(&self) -> Vec<CombinedNode> {
        let core = self.core.read();
        core.nodes
            .values()
            .map(|r| {
                let static_gpus = r.static_.as_ref().map(|s| s.gpus.as_slice()).unwrap_or(&[]);
                let static_mounts = r.static_.as_ref().map(|s| s.mounts.as_slice()).unwrap_or(&[]);
                let dynamic_gpus = r.dynamic.as_ref().map(|d| d.gpus.as_slice()).unwrap_or(&[]);
                let dynamic_mounts = r.dynamic.as_ref().map(|d| d.mounts.as_slice()).unwrap_or(&[]);
                CombinedNode {
                    node_id: r.node_id.clone(),
                    groups: r.groups.clone(),
                    capacities_total: r.capacities_total.clone(),
                    cpu_static: r.static_.as_ref().map(|s| s.cpu.clone()),
                    cpu_dynamic: r.dynamic.as_ref().map(|d| d.cpu.clone()),
                    memory_static: r.static_.as_ref().map(|s| s.memory.clone()),
                    memory_dynamic: r.dynamic.as_ref().map(|d| d.memory.clone()),
                    storage_mounts: merge_mounts(static_mounts, dynamic_mounts),
                    gpus: merge_gpu(static_gpus, dynamic_gpus),
                    conda_envs: r.conda_envs.clone(),
                    last_heartbeat: r.last_heartbeat,
                }
            })
            .collect()
    }

    /// Raw records, used internally by the scheduler which needs
    /// `capacities_total`/`total_capacities_used` directly rather than the
    /// presentation-oriented combined view.
    pub fn snapshot_records(&self) -> Vec<NodeRecord> {
        self.core.read().nodes.values().cloned().collect()
    }

    pub fn delete_node(&self, node_id: &str) {
        self.core.write().nodes.remove(node_id);
    }

    pub fn stale_node_ids(&self, ttl: Duration) -> Vec<String> {
        let now = Instant::now();
        self.core
            .read()
            .nodes
            .values()
            .filter(|r| r.is_stale(ttl, now))
            .map(|r| r.node_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_with_gpu(index: u32) -> NodeStatic {
        NodeStatic {
            cpu: StaticCpu {
                logical_cores: 8,
                max_millicores_total: 8000,
            },
            memory: StaticMemory {
                total_bytes: 1 << 34,
            },
            mounts: vec![],
            gpus: vec![StaticGpu {
                index,
                name: "A100".into(),
                mem_total_bytes: 1 << 36,
            }],
        }
    }

    #[test]
    fn hello_then_duplicate_is_rejected() {
        let registry = NodeRegistry::new();
        registry
            .node_hello("n1".into(), vec![], HashMap::from([("gpu".into(), 2)]), static_with_gpu(0))
            .unwrap();
        let err = registry
            .node_hello("n1".into(), vec![], HashMap::new(), NodeStatic::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(id) if id == "n1"));
        assert_eq!(registry.snapshot_records().len(), 1);
    }

    #[test]
    fn heartbeat_before_hello_creates_record() {
        let registry = NodeRegistry::new();
        registry.heartbeat(
            "n2".into(),
            NodeDynamic {
                timestamp_unix_ms: 1,
                ..Default::default()
            },
        );
        let records = registry.snapshot_records();
        assert_eq!(records.len(), 1);
        assert!(records[0].static_.is_none());
    }

    #[test]
    fn combined_snapshot_merges_gpu_by_index_dynamic_wins() {
        let registry = NodeRegistry::new();
        registry
            .node_hello("n1".into(), vec![], HashMap::new(), static_with_gpu(3))
            .unwrap();
        registry.heartbeat(
            "n1".into(),
            NodeDynamic {
                timestamp_unix_ms: 2,
                gpus: vec![DynamicGpu {
                    index: 3,
                    util_percent: 55.0,
                    mem_util_percent: 10.0,
                    mem_used_bytes: 100,
                    mem_free_bytes: 200,
                    temperature_c: 70.0,
                    power_w: 250.0,
                }],
                ..Default::default()
            },
        );
        let snap = registry.combined_snapshot();
        assert_eq!(snap.len(), 1);
        let gpu = &snap[0].gpus[0];
        assert_eq!(gpu.index, 3);
        assert_eq!(gpu.name.as_deref(), Some("A100"));
        assert_eq!(gpu.util_percent, Some(55.0));
    }

    #[test]
    fn cpu_and_memory_stay_unmerged() {
        let registry = NodeRegistry::new();
        registry
            .node_hello("n1".into(), vec![], HashMap::new(), static_with_gpu(0))
            .unwrap();
        let snap = registry.combined_snapshot();
        assert!(snap[0].cpu_static.is_some());
        assert!(snap[0].cpu_dynamic.is_none());
    }

    #[test]
    fn stale_node_detected_after_ttl() {
        let registry = NodeRegistry::new();
        registry
            .node_hello("n1".into(), vec![], HashMap::new(), NodeStatic::default())
            .unwrap();
        assert!(registry.stale_node_ids(Duration::from_secs(0)).contains(&"n1".to_string()));
        assert!(registry.stale_node_ids(Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn delete_node_removes_unconditionally() {
        let registry = NodeRegistry::new();
        registry
            .node_hello("n1".into(), vec![], HashMap::new(), NodeStatic::default())
            .unwrap();
        registry.delete_node("n1");
        assert!(registry.snapshot_records().is_empty());
    }
}
