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

//! The durable deployment store is an external collaborator (SPEC_FULL.md §1,
//! §6): the core only ever reads it. This module defines the narrow read seam
//! (`DeploymentStore`) and an in-memory test double; a real SQL-backed
//! implementation lives outside the core.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeploymentKind {
    Exec,
    Docker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DesiredState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub name: String,
    pub kind: DeploymentKind,
    pub desired_state: DesiredState,
    pub specification: serde_json::Value,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

pub trait DeploymentStore: Send + Sync {
    fn list_all(&self) -> Vec<DeploymentRecord>;
}

#[derive(Default)]
pub struct InMemoryDeploymentStore {
    records: RwLock<HashMap<String, DeploymentRecord>>,
}

impl InMemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: DeploymentRecord) {
        self.records.write().insert(record.id.clone(), record);
    }

    pub fn remove(&self, id: &str) {
        self.records.write().remove(id);
    }
}

impl DeploymentStore for InMemoryDeploymentStore {
    fn list_all(&self) -> Vec<DeploymentRecord> {
        self.records.read().values().cloned().collect()
    }
}
