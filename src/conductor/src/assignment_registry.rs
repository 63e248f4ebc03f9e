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

//! Maps deployment -> node and node -> set-of-deployments (SPEC_FULL.md §4.3).
//! Grounded on `original_source/src/symphony/conductor/deployment_assignment_registry.py`.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;

#[derive(Debug, Clone)]
pub struct DeploymentStatus {
    pub exec_id: String,
    pub desired_state: String,
    pub status: String,
    pub pid: i32,
    pub started_at_ms: u64,
    pub restart_policy: String,
    pub max_restarts: u32,
    pub restart_window_sec: u32,
}

#[derive(Default)]
struct Core {
    /// exec_id -> (node_id, last_status)
    assignments: HashMap<String, (String, DeploymentStatus)>,
    /// node_id -> set of exec_id
    by_node: HashMap<String, BTreeSet<String>>,
}

#[derive(Default)]
pub struct AssignmentRegistry {
    core: RwLock<Core>,
}

impl AssignmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, node_id: String, status: DeploymentStatus) {
        let mut core = self.core.write();
        let exec_id = status.exec_id.clone();
        if let Some((prev_node, _)) = core.assignments.get(&exec_id) {
            if *prev_node != node_id {
                if let Some(set) = core.by_node.get_mut(prev_node) {
                    set.remove(&exec_id);
                }
            }
        }
        core.by_node.entry(node_id.clone()).or_default().insert(exec_id.clone());
        core.assignments.insert(exec_id, (node_id, status));
    }

    pub fn remove_deployment(&self, exec_id: &str) {
        let mut core = self.core.write();
        if let Some((node_id, _)) = core.assignments.remove(exec_id) {
            if let Some(set) = core.by_node.get_mut(&node_id) {
                set.remove(exec_id);
            }
        }
    }

    pub fn get_node(&self, exec_id: &str) -> Option<String> {
        self.core.read().assignments.get(exec_id).map(|(n, _)| n.clone())
    }

    /// Ascending order of `exec_id` (SPEC_FULL.md §4.3).
    pub fn get_deployments(&self, node_id: &str) -> Vec<String> {
        self.core
            .read()
            .by_node
            .get(node_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_status(&self, exec_id: &str) -> Option<DeploymentStatus> {
        self.core.read().assignments.get(exec_id).map(|(_, s)| s.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(exec_id: &str) -> DeploymentStatus {
        DeploymentStatus {
            exec_id: exec_id.into(),
            desired_state: "RUNNING".into(),
            status: "RUNNING".into(),
            pid: 123,
            started_at_ms: 0,
            restart_policy: "always".into(),
            max_restarts: 10,
            restart_window_sec: 300,
        }
    }

    #[test]
    fn update_then_lookup() {
        let reg = AssignmentRegistry::new();
        reg.update("n1".into(), status("e1"));
        assert_eq!(reg.get_node("e1"), Some("n1".to_string()));
        assert_eq!(reg.get_deployments("n1"), vec!["e1".to_string()]);
    }

    #[test]
    fn reassign_to_new_node_clears_old_inverse_entry() {
        let reg = AssignmentRegistry::new();
        reg.update("n1".into(), status("e1"));
        reg.update("n2".into(), status("e1"));
        assert_eq!(reg.get_node("e1"), Some("n2".to_string()));
        assert!(reg.get_deployments("n1").is_empty());
        assert_eq!(reg.get_deployments("n2"), vec!["e1".to_string()]);
    }

    #[test]
    fn remove_deployment_clears_both_maps() {
        let reg = AssignmentRegistry::new();
        reg.update("n1".into(), status("e1"));
        reg.remove_deployment("e1");
        assert_eq!(reg.get_node("e1"), None);
        assert!(reg.get_deployments("n1").is_empty());
    }

    #[test]
    fn get_deployments_sorted_ascending() {
        let reg = AssignmentRegistry::new();
        reg.update("n1".into(), status("e3"));
        reg.update("n1".into(), status("e1"));
        reg.update("n1".into(), status("e2"));
        assert_eq!(
            reg.get_deployments("n1"),
            vec!["e1".to_string(), "e2".to_string(), "e3".to_string()]
        );
    }
}
