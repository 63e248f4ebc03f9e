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

//! Owns the per-connection context and the outbound queue; demultiplexes
//! inbound messages into the registries. Grounded on `ControlStreamManager` in
//! `src/meta/src/barrier/rpc.rs` (per-node stream handle + outbound queue) and
//! `original_source/src/symphony/conductor/service.py` (dispatch + teardown
//! sequence).

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use symphony_proto::v1 as pb;
use symphony_proto::v1::conductor_to_node::Payload as ToNodePayload;
use symphony_proto::v1::node_to_conductor::Payload as FromNodePayload;
use tokio::sync::Notify;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

use crate::assignment_registry::AssignmentRegistry;
use crate::convert;
use crate::deployment_store::DeploymentStore;
use crate::error::{ConductorError, RegistryError};
use crate::node_registry::NodeRegistry;

/// Bounded outbound envelope queue, drained by a dedicated writer task.
/// Overflow policy (SPEC_FULL.md §4.4/§9): drop the oldest non-critical
/// envelope to make room; `deployment_req` is never dropped, even if that
/// means exceeding `capacity` by one.
struct OutboundQueue {
    inner: Mutex<VecDeque<pb::ConductorToNode>>,
    notify: Notify,
    capacity: usize,
}

fn is_critical(envelope: &pb::ConductorToNode) -> bool {
    matches!(envelope.payload, Some(ToNodePayload::DeploymentReq(_)))
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, envelope: pb::ConductorToNode) {
        let mut guard = self.inner.lock();
        if guard.len() >= self.capacity {
            if let Some(pos) = guard.iter().position(|e| !is_critical(e)) {
                guard.remove(pos);
            } else if !is_critical(&envelope) {
                tracing::warn!("outbound queue full of critical envelopes, dropping new envelope");
                return;
            }
        }
        guard.push_back(envelope);
        drop(guard);
        self.notify.notify_one();
    }

    async fn pop(&self) -> pb::ConductorToNode {
        loop {
            if let Some(e) = self.inner.lock().pop_front() {
                return e;
            }
            self.notify.notified().await;
        }
    }
}

/// Per-subscriber log queue (capacity 200, SPEC_FULL.md §4.4). Always evicts
/// the oldest entry on overflow; there is no "critical" concept here.
struct LogQueue {
    inner: Mutex<VecDeque<pb::DeploymentLogs>>,
    notify: Notify,
    capacity: usize,
}

impl LogQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Returns `false` on the "secondary failure" case (capacity exhausted
    /// even after eviction), signalling the caller to mark this subscriber
    /// stale and remove it.
    fn push(&self, entry: pb::DeploymentLogs) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let mut guard = self.inner.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(entry);
        drop(guard);
        self.notify.notify_one();
        true
    }

    pub async fn recv(&self) -> pb::DeploymentLogs {
        loop {
            if let Some(e) = self.inner.lock().pop_front() {
                return e;
            }
            self.notify.notified().await;
        }
    }
}

/// Handle returned by [`ConductorService::subscribe`]; the HTTP log-tailing
/// surface (out of scope) polls `recv` and calls `unsubscribe` on drop.
pub struct LogSubscription {
    pub subscriber_id: u64,
    queue: Arc<LogQueue>,
}

impl LogSubscription {
    pub async fn recv(&self) -> pb::DeploymentLogs {
        self.queue.recv().await
    }
}

struct NodeStream {
    queue: Arc<OutboundQueue>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Core {
    streams: HashMap<String, NodeStream>,
    /// exec_id -> subscriber_id -> queue
    log_subscribers: HashMap<String, HashMap<u64, Arc<LogQueue>>>,
}

pub struct ConductorService {
    node_registry: Arc<NodeRegistry>,
    assignment_registry: Arc<AssignmentRegistry>,
    deployment_store: Arc<dyn DeploymentStore>,
    core: Mutex<Core>,
    next_subscriber_id: AtomicU64,
}

impl ConductorService {
    pub fn new(
        node_registry: Arc<NodeRegistry>,
        assignment_registry: Arc<AssignmentRegistry>,
        deployment_store: Arc<dyn DeploymentStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_registry,
            assignment_registry,
            deployment_store,
            core: Mutex::new(Core::default()),
            next_subscriber_id: AtomicU64::new(1),
        })
    }

    /// Non-blocking enqueue; logs a warning if the node's queue is unknown.
    pub fn send_message(&self, node_id: &str, envelope: pb::ConductorToNode) {
        let queue = self.core.lock().streams.get(node_id).map(|s| s.queue.clone());
        match queue {
            Some(q) => q.push(envelope),
            None => tracing::warn!(node_id, "send_message: no outbound queue for node"),
        }
    }

    pub fn send_deployment_change(&self, node_id: &str, exec_id: &str, desired_state: &str) {
        self.send_message(
            node_id,
            pb::ConductorToNode {
                payload: Some(ToNodePayload::DeploymentUpdate(pb::DeploymentUpdate {
                    deployment_id: exec_id.to_string(),
                    field: Some(pb::deployment_update::Field::Status(desired_state.to_string())),
                })),
            },
        );
    }

    pub fn push_deployment_req(&self, node_id: &str, specification_json: String) {
        self.send_message(
            node_id,
            pb::ConductorToNode {
                payload: Some(ToNodePayload::DeploymentReq(pb::DeploymentReq {
                    specification: specification_json,
                })),
            },
        );
    }

    /// Used by the staleness sweeper; returns `true` if an active stream was
    /// found and cancelled, `false` if the caller should delete the node
    /// record directly (no live stream to abort).
    pub fn disconnect_node(&self, node_id: &str, reason: &str) -> bool {
        let stream = self.core.lock().streams.remove(node_id);
        match stream {
            Some(s) => {
                tracing::warn!(node_id, reason, "disconnecting node");
                s.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn subscribe(
        &self,
        node_id: &str,
        exec_id: &str,
        since_ms: u64,
        tail: u32,
        streams: Vec<String>,
    ) -> LogSubscription {
        let queue = Arc::new(LogQueue::new(200));
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let became_nonempty = {
            let mut core = self.core.lock();
            let set = core.log_subscribers.entry(exec_id.to_string()).or_default();
            let was_empty = set.is_empty();
            set.insert(subscriber_id, queue.clone());
            was_empty
        };
        if became_nonempty {
            self.send_message(
                node_id,
                pb::ConductorToNode {
                    payload: Some(ToNodePayload::DeploymentLogsRequest(pb::DeploymentLogsRequest {
                        deployment_id: exec_id.to_string(),
                        enable: true,
                        since_ms,
                        tail,
                        streams,
                    })),
                },
            );
        }
        LogSubscription { subscriber_id, queue }
    }

    pub fn unsubscribe(&self, node_id: &str, exec_id: &str, subscriber_id: u64) {
        let became_empty = {
            let mut core = self.core.lock();
            if let Some(set) = core.log_subscribers.get_mut(exec_id) {
                set.remove(&subscriber_id);
                set.is_empty()
            } else {
                false
            }
        };
        if became_empty {
            self.send_message(
                node_id,
                pb::ConductorToNode {
                    payload: Some(ToNodePayload::DeploymentLogsRequest(pb::DeploymentLogsRequest {
                        deployment_id: exec_id.to_string(),
                        enable: false,
                        since_ms: 0,
                        tail: 0,
                        streams: vec![],
                    })),
                },
            );
        }
    }

    fn publish_logs(&self, entries: pb::DeploymentLogs) {
        let exec_id = entries.deployment_id.clone();
        let mut stale = Vec::new();
        {
            let core = self.core.lock();
            if let Some(set) = core.log_subscribers.get(&exec_id) {
                for (id, q) in set.iter() {
                    if !q.push(entries.clone()) {
                        stale.push(*id);
                    }
                }
            }
        }
        if !stale.is_empty() {
            let mut core = self.core.lock();
            if let Some(set) = core.log_subscribers.get_mut(&exec_id) {
                for id in stale {
                    set.remove(&id);
                }
            }
        }
    }

    fn required_conda_envs(&self) -> BTreeSet<String> {
        self.deployment_store
            .list_all()
            .into_iter()
            .filter_map(|d| {
                d.specification
                    .pointer("/spec/config/env_name")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            })
            .collect()
    }

    /// Dispatches one inbound envelope (SPEC_FULL.md §4.4 step 4). The
    /// Conductor never aborts on a single bad envelope; it logs and continues.
    fn dispatch_inbound(&self, node_id: &str, msg: pb::NodeToConductor) {
        match msg.payload {
            Some(FromNodePayload::Heartbeat(hb)) => {
                self.node_registry.heartbeat(node_id.to_string(), convert::heartbeat_to_dynamic(&hb));
            }
            Some(FromNodePayload::DeploymentStatusList(list)) => {
                for status in &list.statuses {
                    self.assignment_registry
                        .update(node_id.to_string(), convert::status_to_domain(status));
                }
            }
            Some(FromNodePayload::DeploymentLogs(logs)) => {
                self.publish_logs(logs);
            }
            Some(FromNodePayload::CondaEnvReport(report)) => {
                let names: BTreeSet<String> = report.env_names.into_iter().collect();
                self.node_registry.update_conda_envs(node_id, names.clone());
                let required = self.required_conda_envs();
                let missing: Vec<String> = required.difference(&names).cloned().collect();
                if !missing.is_empty() {
                    self.send_message(
                        node_id,
                        pb::ConductorToNode {
                            payload: Some(ToNodePayload::CondaEnvEnsure(pb::CondaEnvEnsure {
                                envs: missing
                                    .into_iter()
                                    .map(|name| pb::CondaEnvSpec {
                                        name,
                                        python_version: String::new(),
                                        packages: vec![],
                                    })
                                    .collect(),
                            })),
                        },
                    );
                }
            }
            Some(FromNodePayload::Hello(_)) => {
                tracing::warn!(node_id, "ignoring duplicate hello on an established stream");
            }
            None => tracing::warn!(node_id, "ignoring empty envelope"),
        }
    }

    /// Stream termination teardown (SPEC_FULL.md §4.4 step 5 / Open Question
    /// #3): cancel the consumer task, remove the outbound queue, delete the
    /// node record, release every assignment, and reap that node's log
    /// subscriber sets so nothing waits on a queue that will never fill again.
    fn teardown(&self, node_id: &str) {
        let exec_ids = self.assignment_registry.get_deployments(node_id);
        {
            let mut core = self.core.lock();
            core.streams.remove(node_id);
            for exec_id in &exec_ids {
                core.log_subscribers.remove(exec_id);
            }
        }
        self.node_registry.delete_node(node_id);
        for exec_id in &exec_ids {
            self.assignment_registry.remove_deployment(exec_id);
        }
        tracing::info!(node_id, released = exec_ids.len(), "node disconnected");
    }
}

pub type ConnectStream = Pin<Box<dyn Stream<Item = Result<pb::ConductorToNode, Status>> + Send>>;

pub struct ConductorGrpc {
    service: Arc<ConductorService>,
}

impl ConductorGrpc {
    pub fn new(service: Arc<ConductorService>) -> Self {
        Self { service }
    }
}

#[tonic::async_trait]
impl pb::SymphonyControl for ConductorGrpc {
    type ConnectStream = ConnectStream;

    async fn connect(
        &self,
        request: Request<Streaming<pb::NodeToConductor>>,
    ) -> Result<Response<Self::ConnectStream>, Status> {
        let mut inbound = request.into_inner();

        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("stream closed before hello"))?;
        let hello = match first.payload {
            Some(FromNodePayload::Hello(hello)) => hello,
            _ => {
                return Err(ConductorError::ProtocolViolation(
                    "first message on a new stream must be hello".into(),
                )
                .into())
            }
        };

        let node_id = hello.node_id.clone();
        let static_ = convert::hello_to_static(&hello);
        let capacities_total = convert::capacities_to_map(&hello.capacities_total);
        self.service
            .node_registry
            .node_hello(node_id.clone(), hello.groups.clone(), capacities_total, static_)
            .map_err(|e| match e {
                RegistryError::AlreadyRegistered(id) => ConductorError::Registry(RegistryError::AlreadyRegistered(id)),
                other => ConductorError::Registry(other),
            })?;

        let queue = Arc::new(OutboundQueue::new(256));
        let cancel = CancellationToken::new();
        {
            let mut core = self.service.core.lock();
            core.streams.insert(
                node_id.clone(),
                NodeStream {
                    queue: queue.clone(),
                    cancel: cancel.clone(),
                },
            );
        }
        queue.push(pb::ConductorToNode {
            payload: Some(ToNodePayload::Ack(pb::Ack {
                message: format!("hello {node_id}"),
            })),
        });

        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    env = queue.pop() => {
                        if tx.send(Ok(env)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let service = self.service.clone();
        let reader_node_id = node_id.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    msg = inbound.message() => {
                        match msg {
                            Ok(Some(envelope)) => service.dispatch_inbound(&reader_node_id, envelope),
                            Ok(None) => break,
                            Err(status) => {
                                tracing::warn!(node_id = %reader_node_id, %status, "inbound stream error");
                                break;
                            }
                        }
                    }
                }
            }
            service.teardown(&reader_node_id);
        });

        let out_stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(out_stream)))
    }
}
