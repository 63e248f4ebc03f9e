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

//! Conversions between the wire types generated by `symphony-proto` and the
//! domain types the registries operate on.

use std::collections::HashMap;

use symphony_proto::v1 as pb;

use crate::assignment_registry::DeploymentStatus;
use crate::node_registry::{
    DynamicCpu, DynamicGpu, DynamicMemory, DynamicMount, NodeDynamic, NodeStatic, StaticCpu,
    StaticGpu, StaticMemory, StaticMount,
};

pub fn capacities_to_map(entries: &[pb::CapacityEntry]) -> HashMap<String, u64> {
    entries.iter().map(|e| (e.capacity_id.clone(), e.amount)).collect()
}

pub fn hello_to_static(hello: &pb::NodeHello) -> NodeStatic {
    let cpu = hello
        .cpu
        .as_ref()
        .map(|c| StaticCpu {
            logical_cores: c.logical_cores,
            max_millicores_total: c.max_millicores_total,
        })
        .unwrap_or_default();
    let memory = hello
        .memory
        .as_ref()
        .map(|m| StaticMemory { total_bytes: m.total_bytes })
        .unwrap_or_default();
    let mounts = hello
        .storage_mounts
        .iter()
        .map(|m| StaticMount {
            mount_point: m.mount_point.clone(),
            fs_type: m.fs_type.clone(),
            total_bytes: m.total_bytes,
        })
        .collect();
    let gpus = hello
        .gpus
        .iter()
        .map(|g| StaticGpu {
            index: g.index,
            name: g.name.clone(),
            mem_total_bytes: g.mem_total_bytes,
        })
        .collect();
    NodeStatic { cpu, memory, mounts, gpus }
}

pub fn heartbeat_to_dynamic(hb: &pb::Heartbeat) -> NodeDynamic {
    let cpu = hb
        .cpu
        .as_ref()
        .map(|c| DynamicCpu {
            total_percent: c.total_percent,
            per_core_used_percent: c.per_core.iter().map(|p| (p.core_id, p.used_percent)).collect(),
        })
        .unwrap_or_default();
    let memory = hb
        .memory
        .as_ref()
        .map(|m| DynamicMemory {
            used_bytes: m.used_bytes,
            available_bytes: m.available_bytes,
            used_percent: m.used_percent,
            free_bytes: m.free_bytes,
            buffers_bytes: m.buffers_bytes,
            cached_bytes: m.cached_bytes,
        })
        .unwrap_or_default();
    let mounts = hb
        .storage_mounts
        .iter()
        .map(|m| DynamicMount {
            mount_point: m.mount_point.clone(),
            used_bytes: m.used_bytes,
            available_bytes: m.available_bytes,
            used_percent: m.used_percent,
        })
        .collect();
    let gpus = hb
        .gpus
        .iter()
        .map(|g| DynamicGpu {
            index: g.index,
            util_percent: g.util_percent,
            mem_util_percent: g.mem_util_percent,
            mem_used_bytes: g.mem_used_bytes,
            mem_free_bytes: g.mem_free_bytes,
            temperature_c: g.temperature_c,
            power_w: g.power_w,
        })
        .collect();
    NodeDynamic {
        timestamp_unix_ms: hb.timestamp_unix_ms,
        total_capacities_used: capacities_to_map(&hb.total_capacities_used),
        cpu,
        memory,
        mounts,
        gpus,
    }
}

pub fn status_to_domain(ds: &pb::DeploymentStatus) -> DeploymentStatus {
    DeploymentStatus {
        exec_id: ds.exec_id.clone(),
        desired_state: ds.desired_state.clone(),
        status: ds.status.clone(),
        pid: ds.pid,
        started_at_ms: ds.started_at_ms,
        restart_policy: ds.restart_policy.clone(),
        max_restarts: ds.max_restarts,
        restart_window_sec: ds.restart_window_sec,
    }
}
