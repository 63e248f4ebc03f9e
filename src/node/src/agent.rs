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

//! The node's client half of `Connect` (SPEC_FULL.md §4.7), grounded on
//! `original_source/src/symphony/node/agent.py`'s `NodeAgent`: the outbound
//! message ordering (one `hello`, one `conda_env_report`, then an
//! interleaved heartbeat/status/logs loop) and the never-give-up reconnect
//! loop both follow it directly. Inbound dispatch is a straight port of its
//! `_handle_incoming` branches onto the generated `oneof`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use symphony_proto::v1::conductor_to_node::Payload as InboundPayload;
use symphony_proto::v1::node_to_conductor::Payload as OutboundPayload;
use symphony_proto::v1::symphony_control_client::SymphonyControlClient;
use symphony_proto::v1::{
    CapacityEntry, CondaEnvReport, ConductorToNode, DeploymentLogs, DeploymentStatusList, DynamicCpu, DynamicGpu,
    DynamicMemory, DynamicStorageMount, Heartbeat, LogEntry, NodeHello, NodeToConductor, PerCoreUsage, StaticCpu,
    StaticGpu, StaticMemory, StaticStorageMount,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};

use symphony_common::config::{KeepaliveArgs, TlsArgs};

use crate::conda_env::{CondaEnvManager, CondaEnvSpec};
use crate::error::{AgentError, AgentResult};
use crate::resource_sampler::{ResourceSampler, ResourceSnapshot};
use crate::runner_exec::RunnerExec;

#[derive(Debug, Clone)]
pub struct NodeAgentConfig {
    pub node_id: String,
    pub conductor_addr: String,
    pub groups: Vec<String>,
    pub capacities_total: HashMap<String, u64>,
    pub heartbeat_sec: u64,
    pub tls: TlsArgs,
    pub keepalive: KeepaliveArgs,
}

#[derive(Debug, Clone, Default)]
struct LogSubscription {
    since_ms: u64,
    tail: Option<u32>,
    streams: Vec<String>,
}

/// Drives the node's half of the control stream: connects, authors the
/// outbound stream, dispatches inbound messages, and reconnects with
/// exponential backoff on any transport failure. Never gives up; only
/// `cancel` stops it (SPEC_FULL.md §4.7/§8).
pub struct NodeAgent {
    config: NodeAgentConfig,
    runner: Arc<RunnerExec>,
    conda: Arc<CondaEnvManager>,
    sampler: Arc<dyn ResourceSampler>,
    subscriptions: parking_lot::Mutex<HashMap<String, LogSubscription>>,
}

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_FACTOR: u32 = 2;
const BACKOFF_MAX: Duration = Duration::from_secs(30);

impl NodeAgent {
    pub fn new(
        config: NodeAgentConfig,
        runner: Arc<RunnerExec>,
        conda: Arc<CondaEnvManager>,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Arc<Self> {
        Arc::new(Self { config, runner, conda, sampler, subscriptions: parking_lot::Mutex::new(HashMap::new()) })
    }

    /// Runs until `cancel` fires, reconnecting forever across transport
    /// failures with jittered exponential backoff.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.connect_once(&cancel).await {
                Ok(()) => {
                    tracing::info!(node_id = %self.config.node_id, "control stream closed cleanly");
                    attempt = 0;
                }
                Err(e) => {
                    tracing::warn!(node_id = %self.config.node_id, error = %e, attempt, "control stream error, reconnecting");
                    attempt = attempt.saturating_add(1);
                }
            }
            if cancel.is_cancelled() {
                return;
            }
            let delay = backoff_delay(attempt);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect_once(self: &Arc<Self>, cancel: &CancellationToken) -> AgentResult<()> {
        let channel = self.build_channel().await?;
        let mut client = SymphonyControlClient::new(channel);

        let (tx, rx) = mpsc::channel::<NodeToConductor>(128);
        tx.send(self.build_hello())
            .await
            .map_err(|_| AgentError::Other(anyhow::anyhow!("outbound channel closed before hello")))?;
        tx.send(self.build_conda_report().await)
            .await
            .map_err(|_| AgentError::Other(anyhow::anyhow!("outbound channel closed before conda report")))?;

        let hb_agent = self.clone();
        let hb_tx = tx.clone();
        let hb_cancel = cancel.clone();
        let heartbeat_task = tokio::spawn(async move { hb_agent.heartbeat_loop(hb_tx, hb_cancel).await });

        let outbound = ReceiverStream::new(rx);
        let response = client.connect(outbound).await?;
        let mut inbound = response.into_inner();

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                msg = inbound.message() => match msg {
                    Ok(Some(msg)) => self.handle_inbound(msg, &tx).await,
                    Ok(None) => break Ok(()),
                    Err(status) => break Err(AgentError::Transport(status)),
                }
            }
        };

        heartbeat_task.abort();
        result
    }

    async fn build_channel(&self) -> AgentResult<Channel> {
        let endpoint = Endpoint::from_shared(self.config.conductor_addr.clone())
            .map_err(AgentError::Connect)?
            .http2_keep_alive_interval(Duration::from_secs(self.config.keepalive.probe_secs))
            .keep_alive_timeout(Duration::from_secs(self.config.keepalive.timeout_secs));

        let endpoint = if let Some(tls) = self.config.tls.load_pem().map_err(AgentError::Other)? {
            let identity = Identity::from_pem(tls.cert, tls.key);
            let tls_config = ClientTlsConfig::new().identity(identity).ca_certificate(Certificate::from_pem(tls.ca_cert));
            endpoint.tls_config(tls_config).map_err(AgentError::Connect)?
        } else {
            endpoint
        };

        endpoint.connect().await.map_err(AgentError::Connect)
    }

    fn build_hello(&self) -> NodeToConductor {
        let snapshot = self.sampler.sample();
        let capacities_total = self
            .config
            .capacities_total
            .iter()
            .map(|(k, v)| CapacityEntry { capacity_id: k.clone(), amount: *v })
            .collect();
        let hello = NodeHello {
            node_id: self.config.node_id.clone(),
            groups: self.config.groups.clone(),
            capacities_total,
            cpu: Some(StaticCpu {
                logical_cores: snapshot.cpu.logical_cores,
                max_millicores_total: snapshot.cpu.logical_cores as u64 * 1000,
            }),
            memory: Some(StaticMemory { total_bytes: snapshot.memory.total_bytes }),
            storage_mounts: snapshot
                .mounts
                .iter()
                .map(|m| StaticStorageMount {
                    mount_point: m.mount_point.clone(),
                    fs_type: m.fs_type.clone(),
                    total_bytes: m.total_bytes,
                })
                .collect(),
            gpus: Vec::new(),
        };
        NodeToConductor { payload: Some(OutboundPayload::Hello(hello)) }
    }

    async fn build_conda_report(&self) -> NodeToConductor {
        let env_names = self.conda.list_env_names().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to list conda envs for report");
            Vec::new()
        });
        NodeToConductor { payload: Some(OutboundPayload::CondaEnvReport(CondaEnvReport { env_names })) }
    }

    fn build_heartbeat(&self, snapshot: &ResourceSnapshot, total_capacities_used: HashMap<String, u64>) -> NodeToConductor {
        let heartbeat = Heartbeat {
            node_id: self.config.node_id.clone(),
            timestamp_unix_ms: now_ms(),
            total_capacities_used: total_capacities_used.into_iter().map(|(k, v)| CapacityEntry { capacity_id: k, amount: v }).collect(),
            cpu: Some(DynamicCpu {
                total_percent: snapshot.cpu.total_percent,
                per_core: snapshot
                    .cpu
                    .per_core_percent
                    .iter()
                    .map(|(core, pct)| PerCoreUsage { core_id: *core, used_percent: *pct })
                    .collect(),
            }),
            memory: Some(DynamicMemory {
                used_bytes: snapshot.memory.used_bytes,
                available_bytes: snapshot.memory.available_bytes,
                used_percent: if snapshot.memory.total_bytes == 0 {
                    0.0
                } else {
                    snapshot.memory.used_bytes as f64 / snapshot.memory.total_bytes as f64 * 100.0
                },
                free_bytes: snapshot.memory.free_bytes,
                buffers_bytes: 0,
                cached_bytes: 0,
            }),
            storage_mounts: snapshot
                .mounts
                .iter()
                .map(|m| DynamicStorageMount {
                    mount_point: m.mount_point.clone(),
                    used_bytes: m.used_bytes,
                    available_bytes: m.available_bytes,
                    used_percent: if m.total_bytes == 0 { 0.0 } else { m.used_bytes as f64 / m.total_bytes as f64 * 100.0 },
                })
                .collect(),
            gpus: snapshot
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
                .collect(),
        };
        NodeToConductor { payload: Some(OutboundPayload::Heartbeat(heartbeat)) }
    }

    async fn heartbeat_loop(self: Arc<Self>, tx: mpsc::Sender<NodeToConductor>, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.heartbeat_sec.max(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }

            let snapshot = self.sampler.sample();
            let total_used = self.runner.total_capacities_used().await;
            if tx.send(self.build_heartbeat(&snapshot, total_used)).await.is_err() {
                return;
            }

            let statuses = self.runner.build_status_report().await;
            let status_msg = NodeToConductor {
                payload: Some(OutboundPayload::DeploymentStatusList(DeploymentStatusList {
                    statuses: statuses
                        .into_iter()
                        .map(|s| symphony_proto::v1::DeploymentStatus {
                            exec_id: s.exec_id,
                            desired_state: s.desired_state,
                            status: s.status,
                            pid: s.pid,
                            started_at_ms: s.started_at_ms,
                            restart_policy: s.restart_policy,
                            max_restarts: s.max_restarts,
                            restart_window_sec: s.restart_window_sec,
                        })
                        .collect(),
                })),
            };
            if tx.send(status_msg).await.is_err() {
                return;
            }

            let subs: Vec<(String, LogSubscription)> = self.subscriptions.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            for (exec_id, sub) in subs {
                let entries = self
                    .runner
                    .logs(&exec_id, Some(sub.since_ms), sub.tail.map(|t| t as usize), if sub.streams.is_empty() { None } else { Some(&sub.streams) })
                    .await
                    .unwrap_or_default();
                if entries.is_empty() {
                    continue;
                }
                let max_ts = entries.iter().map(|(ts, _, _)| *ts).max().unwrap_or(sub.since_ms);
                if let Some(entry) = self.subscriptions.lock().get_mut(&exec_id) {
                    entry.since_ms = max_ts + 1;
                }
                let msg = NodeToConductor {
                    payload: Some(OutboundPayload::DeploymentLogs(DeploymentLogs {
                        deployment_id: exec_id,
                        entries: entries.into_iter().map(|(ts, stream, line)| LogEntry { timestamp_unix_ms: ts, stream, line }).collect(),
                    })),
                };
                if tx.send(msg).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn handle_inbound(&self, msg: ConductorToNode, tx: &mpsc::Sender<NodeToConductor>) {
        match msg.payload {
            Some(InboundPayload::Ack(ack)) => {
                tracing::debug!(node_id = %self.config.node_id, message = %ack.message, "ack from conductor");
            }
            Some(InboundPayload::DeploymentReq(req)) => {
                if let Err(e) = self.handle_deployment_req(&req.specification).await {
                    tracing::warn!(error = %e, "failed to apply deployment_req");
                }
            }
            Some(InboundPayload::DeploymentUpdate(update)) => {
                if let Some(symphony_proto::v1::deployment_update::Field::Status(status)) = update.field {
                    let result = if status.eq_ignore_ascii_case("RUNNING") {
                        self.runner.start(&update.deployment_id).await
                    } else {
                        self.runner.stop(&update.deployment_id).await
                    };
                    if let Err(e) = result {
                        tracing::warn!(deployment_id = %update.deployment_id, error = %e, "failed to apply deployment_update");
                    }
                }
            }
            Some(InboundPayload::DeploymentLogsRequest(req)) => {
                let mut subs = self.subscriptions.lock();
                if req.enable {
                    subs.insert(
                        req.deployment_id,
                        LogSubscription { since_ms: req.since_ms, tail: Some(req.tail), streams: req.streams },
                    );
                } else {
                    subs.remove(&req.deployment_id);
                }
            }
            Some(InboundPayload::CondaEnvEnsure(ensure)) => {
                let specs = ensure
                    .envs
                    .into_iter()
                    .map(|e| CondaEnvSpec { name: e.name, python_version: e.python_version, packages: e.packages, custom_script: None })
                    .collect();
                match self.conda.ensure_envs(specs).await {
                    Ok(env_names) => {
                        let _ = tx.send(NodeToConductor { payload: Some(OutboundPayload::CondaEnvReport(CondaEnvReport { env_names })) }).await;
                    }
                    Err(e) => tracing::warn!(error = %e, "conda_env_ensure failed"),
                }
            }
            None => {}
        }
    }

    async fn handle_deployment_req(&self, specification_json: &str) -> AgentResult<()> {
        let record: serde_json::Value = serde_json::from_str(specification_json)
            .map_err(|e| AgentError::MalformedDeploymentReq(e.to_string()))?;
        let exec_id = record
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::MalformedDeploymentReq("missing 'id'".to_string()))?
            .to_string();
        let spec = record
            .pointer("/specification/spec")
            .cloned()
            .ok_or_else(|| AgentError::MalformedDeploymentReq("missing 'specification.spec'".to_string()))?;
        let desired_running = record.get("desired_state").and_then(|v| v.as_str()).map(|s| s.eq_ignore_ascii_case("RUNNING")).unwrap_or(true);

        self.runner.add_exec(&exec_id, &spec).await?;
        if desired_running {
            self.runner.start(&exec_id).await?;
        } else {
            self.runner.stop(&exec_id).await?;
        }
        Ok(())
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// `min(base * factor^attempt, max)`, jittered by +/-20% (SPEC_FULL.md §4.7).
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_FACTOR.saturating_pow(attempt.min(8));
    let raw = BACKOFF_BASE.saturating_mul(exp).min(BACKOFF_MAX);
    let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
    let millis = raw.as_millis() as f64 * (1.0 + jitter_frac);
    Duration::from_millis(millis.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let d0 = backoff_delay(0);
        assert!(d0.as_millis() <= (BACKOFF_BASE.as_millis() as f64 * 1.2) as u128);
        let d_big = backoff_delay(20);
        assert!(d_big <= BACKOFF_MAX.mul_f64(1.21));
    }
}
