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

//! Composition root: builds the owned registries and services and wires them
//! together, then serves until a shutdown signal arrives. Grounded on
//! `rpc_serve`/`rpc_serve_with_store` in `src/meta/src/rpc/server.rs` — the
//! `sub_tasks: Vec<(JoinHandle<()>, oneshot::Sender<()>)>` shutdown pattern in
//! particular. Per SPEC_FULL.md §9, NodeRegistry/AssignmentRegistry/the
//! deployment store handle are constructor-injected `Arc`s owned here, never
//! process-wide singletons.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use symphony_common::config::{KeepaliveArgs, TlsArgs};
use symphony_proto::v1::symphony_control_server::SymphonyControlServer;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};

use crate::assignment_registry::AssignmentRegistry;
use crate::deployment_store::{DeploymentStore, InMemoryDeploymentStore};
use crate::node_registry::NodeRegistry;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::service::{ConductorGrpc, ConductorService};

#[derive(Parser, Debug, Clone)]
#[command(name = "conductor", about = "Symphony conductor: assigns deployments to nodes and relays their control streams")]
pub struct ConductorOpts {
    #[arg(long, env = "SYMPHONY_CONDUCTOR_LISTEN_ADDR", default_value = "0.0.0.0:7800")]
    pub listen_addr: SocketAddr,

    #[arg(long, env = "SYMPHONY_SCHEDULER_CHECK_INTERVAL_SECS", default_value_t = 5)]
    pub scheduler_check_interval_secs: u64,

    #[arg(long, env = "SYMPHONY_SCHEDULER_TTL_SECS", default_value_t = 60)]
    pub scheduler_ttl_secs: u64,

    #[command(flatten)]
    pub tls: TlsArgs,

    #[command(flatten)]
    pub keepalive: KeepaliveArgs,
}

/// Bundles the composition root's owned pieces for tests that want to drive
/// the scheduler/registries directly without standing up a socket.
pub struct ConductorHandles {
    pub node_registry: Arc<NodeRegistry>,
    pub assignment_registry: Arc<AssignmentRegistry>,
    pub deployment_store: Arc<dyn DeploymentStore>,
    pub service: Arc<ConductorService>,
    pub scheduler: Arc<Scheduler>,
}

pub fn build(deployment_store: Arc<dyn DeploymentStore>, opts: &ConductorOpts) -> ConductorHandles {
    let node_registry = Arc::new(NodeRegistry::new());
    let assignment_registry = Arc::new(AssignmentRegistry::new());
    let service = ConductorService::new(node_registry.clone(), assignment_registry.clone(), deployment_store.clone());
    let scheduler = Scheduler::new(
        node_registry.clone(),
        assignment_registry.clone(),
        deployment_store.clone(),
        service.clone(),
        SchedulerConfig {
            check_interval: Duration::from_secs(opts.scheduler_check_interval_secs),
            ttl: Duration::from_secs(opts.scheduler_ttl_secs),
        },
    );
    ConductorHandles {
        node_registry,
        assignment_registry,
        deployment_store,
        service,
        scheduler,
    }
}

pub async fn conductor_serve(opts: ConductorOpts) -> anyhow::Result<()> {
    let deployment_store: Arc<dyn DeploymentStore> = Arc::new(InMemoryDeploymentStore::new());
    let handles = build(deployment_store, &opts);

    let mut sub_tasks: Vec<(JoinHandle<()>, oneshot::Sender<()>)> = Vec::new();
    sub_tasks.push(handles.scheduler.clone().start());

    let grpc = ConductorGrpc::new(handles.service.clone());

    let mut server = Server::builder();
    if let Some(tls) = opts.tls.load_pem()? {
        let identity = Identity::from_pem(tls.cert, tls.key);
        let tls_config = ServerTlsConfig::new()
            .identity(identity)
            .client_ca_root(Certificate::from_pem(tls.ca_cert))
            .client_auth_optional(false);
        server = server.tls_config(tls_config)?;
        tracing::info!("mTLS enabled for conductor listener");
    } else {
        tracing::warn!("no TLS material configured; serving plaintext (development only)");
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let serve_addr = opts.listen_addr;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server
            .http2_keepalive_interval(Some(Duration::from_secs(opts.keepalive.probe_secs)))
            .http2_keepalive_timeout(Some(Duration::from_secs(opts.keepalive.timeout_secs)))
            .add_service(SymphonyControlServer::new(grpc))
            .serve_with_shutdown(serve_addr, async {
                let _ = shutdown_rx.await;
            })
            .await
        {
            tracing::error!(error = %e, "conductor gRPC server exited with error");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = server_handle.await;
    for (handle, tx) in sub_tasks {
        let _ = tx.send(());
        let _ = handle.await;
    }
    Ok(())
}
