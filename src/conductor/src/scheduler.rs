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

//! Periodic loop: evicts stale nodes, assigns unassigned deployments to a
//! capacity-eligible node. Grounded on `ClusterManager::start_heartbeat_checker`
//! in `src/meta/src/manager/cluster.rs` for the sub-task/shutdown shape, and on
//! `original_source/src/symphony/conductor/scheduler.py` for the sweep-then-
//! assign ordering and capacity-matching logic.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::assignment_registry::AssignmentRegistry;
use crate::deployment_store::{DeploymentRecord, DeploymentStore};
use crate::node_registry::NodeRegistry;
use crate::service::ConductorService;

pub struct SchedulerConfig {
    pub check_interval: Duration,
    pub ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            ttl: Duration::from_secs(60),
        }
    }
}

pub struct Scheduler {
    node_registry: Arc<NodeRegistry>,
    assignment_registry: Arc<AssignmentRegistry>,
    deployment_store: Arc<dyn DeploymentStore>,
    service: Arc<ConductorService>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        node_registry: Arc<NodeRegistry>,
        assignment_registry: Arc<AssignmentRegistry>,
        deployment_store: Arc<dyn DeploymentStore>,
        service: Arc<ConductorService>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_registry,
            assignment_registry,
            deployment_store,
            service,
            config,
        })
    }

    /// Spawns the loop task; returns the join handle and a one-shot shutdown
    /// signal, mirroring the teacher's `(JoinHandle<()>, Sender<()>)` sub-task
    /// composition pattern (`src/meta/src/rpc/server.rs`).
    pub fn start(self: Arc<Self>) -> (JoinHandle<()>, oneshot::Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.check_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = &mut shutdown_rx => {
                        tracing::info!("scheduler stopped");
                        return;
                    }
                }
                self.sweep_once();
                self.assign_deployments();
            }
        });
        (handle, shutdown_tx)
    }

    /// Staleness sweep (SPEC_FULL.md §4.5): for every node whose
    /// `now - last_heartbeat > TTL`, ask the service to disconnect it; if no
    /// active stream exists, delete the record directly.
    fn sweep_once(&self) {
        for node_id in self.node_registry.stale_node_ids(self.config.ttl) {
            tracing::warn!(node_id, "removing stale node");
            if !self.service.disconnect_node(&node_id, "node heartbeat stale; closing connection") {
                self.node_registry.delete_node(&node_id);
            }
        }
    }

    fn assign_deployments(&self) {
        let all = self.deployment_store.list_all();
        let unassigned: Vec<DeploymentRecord> = all
            .into_iter()
            .filter(|d| self.assignment_registry.get_node(&d.id).is_none())
            .collect();
        if unassigned.is_empty() {
            return;
        }

        let nodes = self.node_registry.snapshot_records();
        if nodes.is_empty() {
            tracing::warn!("no nodes connected; skipping assignment pass for this tick");
            return;
        }

        let mut rng = rand::thread_rng();
        for deployment in &unassigned {
            let capacity_requests = extract_capacity_requests(deployment);

            let chosen = if capacity_requests.is_empty() {
                nodes.choose(&mut rng).map(|n| n.node_id.clone())
            } else {
                let eligible: Vec<String> = nodes
                    .iter()
                    .filter(|n| node_has_capacity(n, &capacity_requests))
                    .map(|n| n.node_id.clone())
                    .collect();
                if eligible.is_empty() {
                    tracing::warn!(
                        deployment_id = deployment.id,
                        ?capacity_requests,
                        "cannot assign node for deployment: no eligible nodes"
                    );
                    continue;
                }
                eligible.choose(&mut rng).cloned()
            };

            let Some(node_id) = chosen else { continue };
            tracing::info!(node_id, deployment_id = deployment.id, "sending deployment request");
            self.push_spec_update(&node_id, deployment);
        }
    }

    fn push_spec_update(&self, node_id: &str, deployment: &DeploymentRecord) {
        match serde_json::to_string(deployment) {
            Ok(json) => self.service.push_deployment_req(node_id, json),
            Err(e) => tracing::error!(deployment_id = deployment.id, error = %e, "failed to serialize deployment record"),
        }
    }

    /// Called by the (out-of-scope) HTTP surface when a deployment's spec
    /// changes; bypasses the scheduler and pushes straight to the
    /// already-assigned node (SPEC_FULL.md §4.5).
    pub fn push_spec_update_to_assigned_node(&self, deployment: &DeploymentRecord) {
        if let Some(node_id) = self.assignment_registry.get_node(&deployment.id) {
            self.push_spec_update(&node_id, deployment);
        }
    }

    /// Presentation helper used by HTTP listing (SPEC_FULL.md §4.5).
    pub fn assignment_reason(&self, deployment: &DeploymentRecord) -> &'static str {
        let nodes = self.node_registry.snapshot_records();
        if nodes.is_empty() {
            return "No Node";
        }
        if let Some(env_name) = deployment
            .specification
            .pointer("/spec/config/env_name")
            .and_then(|v| v.as_str())
        {
            let combined = self.node_registry.combined_snapshot();
            if !combined.iter().any(|n| n.conda_envs.contains(env_name)) {
                return "No Env";
            }
        }
        let capacity_requests = extract_capacity_requests(deployment);
        if !capacity_requests.is_empty() && !nodes.iter().any(|n| node_has_capacity(n, &capacity_requests)) {
            return "No Capacity";
        }
        "Pending"
    }
}

fn extract_capacity_requests(deployment: &DeploymentRecord) -> std::collections::HashMap<String, u64> {
    deployment
        .specification
        .pointer("/spec/capacity_requests")
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_u64().map(|n| (k.clone(), n)))
                .collect()
        })
        .unwrap_or_default()
}

fn node_has_capacity(node: &crate::node_registry::NodeRecord, request: &std::collections::HashMap<String, u64>) -> bool {
    let used = node
        .dynamic
        .as_ref()
        .map(|d| &d.total_capacities_used)
        .cloned()
        .unwrap_or_default();
    request.iter().all(|(cap_id, amount)| {
        let total = node.capacities_total.get(cap_id).copied().unwrap_or(0);
        let used = used.get(cap_id).copied().unwrap_or(0);
        total.saturating_sub(used) >= *amount
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::deployment_store::{DeploymentKind, DesiredState, InMemoryDeploymentStore};
    use crate::node_registry::{NodeDynamic, NodeStatic};

    fn deployment(id: &str, capacity_requests: serde_json::Value) -> DeploymentRecord {
        DeploymentRecord {
            id: id.to_string(),
            name: id.to_string(),
            kind: DeploymentKind::Exec,
            desired_state: DesiredState::Running,
            specification: json!({ "spec": { "capacity_requests": capacity_requests, "config": { "command": ["true"] } } }),
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn capacity_aware_assignment_picks_only_eligible_node() {
        let node_registry = Arc::new(NodeRegistry::new());
        node_registry
            .node_hello(
                "n1".into(),
                vec![],
                HashMap::from([("gpu".into(), 2)]),
                NodeStatic::default(),
            )
            .unwrap();
        node_registry.heartbeat(
            "n1".into(),
            NodeDynamic {
                total_capacities_used: HashMap::from([("gpu".into(), 1)]),
                ..Default::default()
            },
        );
        node_registry
            .node_hello(
                "n2".into(),
                vec![],
                HashMap::from([("gpu".into(), 4)]),
                NodeStatic::default(),
            )
            .unwrap();
        node_registry.heartbeat("n2".into(), NodeDynamic::default());

        let assignment_registry = Arc::new(AssignmentRegistry::new());
        let store = Arc::new(InMemoryDeploymentStore::new());
        store.upsert(deployment("d1", json!({"gpu": 2})));
        let deployment_store: Arc<dyn DeploymentStore> = store;
        let conductor_service =
            ConductorService::new(node_registry.clone(), assignment_registry.clone(), deployment_store.clone());

        let scheduler = Scheduler::new(
            node_registry,
            assignment_registry.clone(),
            deployment_store,
            conductor_service,
            SchedulerConfig::default(),
        );
        scheduler.assign_deployments();

        // n2 is the only node with 2 free GPUs; n1 only has 1 free.
        // No live stream exists so send_message only logs, but the scheduler
        // itself never assigns via AssignmentRegistry (that happens once the
        // node reports status) — this test instead checks the eligibility
        // filter directly reaches the expected conclusion.
        let nodes = scheduler.node_registry.snapshot_records();
        let eligible: Vec<_> = nodes
            .iter()
            .filter(|n| node_has_capacity(n, &HashMap::from([("gpu".to_string(), 2u64)])))
            .map(|n| n.node_id.clone())
            .collect();
        assert_eq!(eligible, vec!["n2".to_string()]);
    }

    #[test]
    fn assignment_reason_no_node() {
        let node_registry = Arc::new(NodeRegistry::new());
        let assignment_registry = Arc::new(AssignmentRegistry::new());
        let store: Arc<dyn DeploymentStore> = Arc::new(InMemoryDeploymentStore::new());
        let conductor_service = ConductorService::new(node_registry.clone(), assignment_registry.clone(), store.clone());
        let scheduler = Scheduler::new(
            node_registry,
            assignment_registry,
            store,
            conductor_service,
            SchedulerConfig::default(),
        );
        let d = deployment("d1", json!({}));
        assert_eq!(scheduler.assignment_reason(&d), "No Node");
    }
}
