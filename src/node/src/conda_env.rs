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

//! Named-environment provisioning (SPEC_FULL.md §4.8), grounded on
//! `original_source/src/symphony/node/conda_env.py`'s shell-invocation idiom.
//! The force-recreate sentinel and failed-fingerprint caching are this port's
//! additions (no counterpart in the original), named there too.

use std::collections::HashMap;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::process::Command;

use crate::error::{CondaError, CondaResult};

/// Leading line in a custom script that forces a rebuild even when the named
/// environment already exists (SPEC_FULL.md §4.8).
pub const FORCE_RECREATE_SENTINEL: &str = "__SYMPHONY_FORCE_RECREATE__";

#[derive(Debug, Clone)]
pub struct CondaEnvSpec {
    pub name: String,
    pub python_version: String,
    pub packages: Vec<String>,
    pub custom_script: Option<String>,
}

#[derive(Serialize)]
struct Fingerprint<'a> {
    python_version: &'a str,
    packages: &'a [String],
    custom_script: Option<&'a str>,
}

fn fingerprint_of(spec: &CondaEnvSpec) -> String {
    let fp = Fingerprint {
        python_version: &spec.python_version,
        packages: &spec.packages,
        custom_script: spec.custom_script.as_deref(),
    };
    let json = serde_json::to_vec(&fp).expect("fingerprint fields are always serializable");
    let digest = Sha256::digest(&json);
    hex::encode(digest)
}

pub struct CondaEnvManager {
    conda_bin: String,
    lock: tokio::sync::Mutex<()>,
    failed_fingerprints: parking_lot::Mutex<HashMap<String, String>>,
}

impl CondaEnvManager {
    pub fn new() -> Self {
        let conda_bin = std::env::var("CONDA_PATH").unwrap_or_else(|_| "conda".to_string());
        Self {
            conda_bin,
            lock: tokio::sync::Mutex::new(()),
            failed_fingerprints: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub async fn list_env_names(&self) -> CondaResult<Vec<String>> {
        let output = self.run_shell(&format!("{} env list --json", self.conda_bin)).await?;
        let Some(stdout) = output else { return Ok(Vec::new()) };
        let parsed: serde_json::Value = serde_json::from_str(&stdout).map_err(CondaError::MalformedOutput)?;
        let mut names: Vec<String> = parsed
            .get("envs")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|p| p.as_str())
            .filter_map(|p| std::path::Path::new(p).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Creates every missing environment in `specs`, skipping ones that
    /// already exist (unless force-recreate is requested) and ones whose
    /// fingerprint matches a previously failed attempt. Returns the sorted
    /// set of environment names present afterward.
    pub async fn ensure_envs(&self, specs: Vec<CondaEnvSpec>) -> CondaResult<Vec<String>> {
        let _guard = self.lock.lock().await;
        let mut current: std::collections::BTreeSet<String> = self.list_env_names().await?.into_iter().collect();

        for spec in specs {
            if spec.name.is_empty() {
                continue;
            }
            let force_recreate = spec
                .custom_script
                .as_deref()
                .map(|s| s.lines().next() == Some(FORCE_RECREATE_SENTINEL))
                .unwrap_or(false);

            if current.contains(&spec.name) && !force_recreate {
                continue;
            }
            if spec.python_version.is_empty() {
                tracing::warn!(env = %spec.name, "skipping conda env: missing python_version");
                continue;
            }

            let fp = fingerprint_of(&spec);
            {
                let failed = self.failed_fingerprints.lock();
                if failed.get(&spec.name) == Some(&fp) {
                    tracing::debug!(env = %spec.name, "skipping env creation: same spec failed previously");
                    continue;
                }
            }

            match self.create_env(&spec).await {
                Ok(()) => {
                    current.insert(spec.name.clone());
                    self.failed_fingerprints.lock().remove(&spec.name);
                }
                Err(e) => {
                    tracing::warn!(env = %spec.name, error = %e, "conda env creation failed");
                    let _ = self.remove_env(&spec.name).await;
                    self.failed_fingerprints.lock().insert(spec.name.clone(), fp);
                }
            }
        }

        Ok(current.into_iter().collect())
    }

    async fn create_env(&self, spec: &CondaEnvSpec) -> CondaResult<()> {
        let quoted_name = shell_words::quote(&spec.name);
        let quoted_python = shell_words::quote(&format!("python={}", spec.python_version));
        let quoted_packages: Vec<String> = spec.packages.iter().map(|p| shell_words::quote(p).into_owned()).collect();
        let mut cmd = format!("{} create -y -n {} {}", self.conda_bin, quoted_name, quoted_python);
        if !quoted_packages.is_empty() {
            cmd.push(' ');
            cmd.push_str(&quoted_packages.join(" "));
        }
        tracing::info!(env = %spec.name, python_version = %spec.python_version, "creating conda env");
        self.run_shell(&cmd).await?;

        if let Some(script) = &spec.custom_script {
            let body: String = script
                .lines()
                .filter(|l| *l != FORCE_RECREATE_SENTINEL)
                .collect::<Vec<_>>()
                .join("\n");
            if !body.trim().is_empty() {
                let activate = format!("{} run -n {} bash -lc {}", self.conda_bin, quoted_name, shell_words::quote(&body));
                self.run_shell(&activate).await?;
            }
        }
        Ok(())
    }

    async fn remove_env(&self, name: &str) -> CondaResult<()> {
        let quoted = shell_words::quote(name);
        self.run_shell(&format!("{} env remove -y -n {}", self.conda_bin, quoted)).await.map(|_| ())
    }

    async fn run_shell(&self, cmd: &str) -> CondaResult<Option<String>> {
        let output = Command::new("bash").arg("-lc").arg(cmd).output().await.map_err(CondaError::Spawn)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(CondaError::CommandFailed(format!("{cmd}: {stderr}")));
        }
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            Ok(None)
        } else {
            Ok(Some(stdout))
        }
    }
}

impl Default for CondaEnvManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_stable_for_same_spec() {
        let a = CondaEnvSpec {
            name: "x".into(),
            python_version: "3.11".into(),
            packages: vec!["numpy".into()],
            custom_script: None,
        };
        let b = CondaEnvSpec {
            name: "y".into(),
            python_version: "3.11".into(),
            packages: vec!["numpy".into()],
            custom_script: None,
        };
        assert_eq!(fingerprint_of(&a), fingerprint_of(&b));
    }

    #[test]
    fn force_recreate_sentinel_detected() {
        let script = format!("{FORCE_RECREATE_SENTINEL}\necho hi");
        assert_eq!(script.lines().next(), Some(FORCE_RECREATE_SENTINEL));
    }
}
