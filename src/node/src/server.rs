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

//! Composition root for the node binary (SPEC_FULL.md §4.7/§9), mirroring
//! `conductor::server`'s bootstrap shape: build the owned collaborators,
//! spawn the agent as a supervised sub-task, and block until a shutdown
//! signal arrives.

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use symphony_common::config::{KeepaliveArgs, TlsArgs};
use tokio_util::sync::CancellationToken;

use crate::agent::{NodeAgent, NodeAgentConfig};
use crate::conda_env::CondaEnvManager;
use crate::resource_sampler::{ResourceSampler, SysinfoResourceSampler};
use crate::runner_exec::RunnerExec;

#[derive(Parser, Debug, Clone)]
#[command(name = "node", about = "Symphony node: supervises deployments assigned by the conductor")]
pub struct NodeOpts {
    #[arg(long, env = "SYMPHONY_NODE_ID")]
    pub node_id: String,

    #[arg(long, env = "SYMPHONY_CONDUCTOR_ADDR", default_value = "http://127.0.0.1:7800")]
    pub conductor_addr: String,

    /// Comma-separated scheduling groups this node belongs to.
    #[arg(long, env = "SYMPHONY_NODE_GROUPS", value_delimiter = ',', default_value = "")]
    pub groups: Vec<String>,

    /// Comma-separated `capacity_id=amount` pairs, e.g. `gpu=2,cpu_slots=8`.
    #[arg(long, env = "SYMPHONY_NODE_CAPACITIES", default_value = "")]
    pub capacities_total: String,

    #[arg(long, env = "SYMPHONY_HEARTBEAT_SECS", default_value_t = 3)]
    pub heartbeat_secs: u64,

    #[command(flatten)]
    pub tls: TlsArgs,

    #[command(flatten)]
    pub keepalive: KeepaliveArgs,
}

fn parse_capacities(raw: &str) -> HashMap<String, u64> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            v.trim().parse::<u64>().ok().map(|v| (k.to_string(), v))
        })
        .collect()
}

pub struct NodeHandles {
    pub runner: Arc<RunnerExec>,
    pub conda: Arc<CondaEnvManager>,
    pub sampler: Arc<dyn ResourceSampler>,
    pub agent: Arc<NodeAgent>,
}

pub fn build(opts: &NodeOpts) -> NodeHandles {
    let conda = Arc::new(CondaEnvManager::new());
    let runner = Arc::new(RunnerExec::new());
    let sampler: Arc<dyn ResourceSampler> = Arc::new(SysinfoResourceSampler::new());

    let groups = opts.groups.iter().filter(|g| !g.is_empty()).cloned().collect();
    let agent_config = NodeAgentConfig {
        node_id: opts.node_id.clone(),
        conductor_addr: opts.conductor_addr.clone(),
        groups,
        capacities_total: parse_capacities(&opts.capacities_total),
        heartbeat_sec: opts.heartbeat_secs,
        tls: opts.tls.clone(),
        keepalive: opts.keepalive.clone(),
    };
    let agent = NodeAgent::new(agent_config, runner.clone(), conda.clone(), sampler.clone());

    NodeHandles { runner, conda, sampler, agent }
}

pub async fn node_serve(opts: NodeOpts) -> anyhow::Result<()> {
    let handles = build(&opts);
    let cancel = CancellationToken::new();

    let agent = handles.agent.clone();
    let agent_cancel = cancel.clone();
    let agent_handle = tokio::spawn(async move { agent.run(agent_cancel).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(node_id = %opts.node_id, "received ctrl-c, shutting down");
        }
    }

    cancel.cancel();
    let _ = agent_handle.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_capacity_pairs() {
        let caps = parse_capacities("gpu=2,cpu_slots=8");
        assert_eq!(caps.get("gpu"), Some(&2));
        assert_eq!(caps.get("cpu_slots"), Some(&8));
    }

    #[test]
    fn ignores_malformed_capacity_pairs() {
        let caps = parse_capacities("gpu=2,garbage,=5,cpu=");
        assert_eq!(caps.len(), 1);
    }
}
