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

//! Per-component typed errors (SPEC_FULL.md §7), templated on
//! `src/meta/src/backup_restore/error.rs`'s enum-per-component shape.

use thiserror::Error;

pub type CronResult<T> = Result<T, CronError>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CronError {
    #[error("cron expression must have exactly 5 fields, got {0}")]
    WrongFieldCount(usize),

    #[error("invalid field {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("no matching time found within the scan horizon")]
    HorizonExceeded,
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("unknown exec_id: {0}")]
    NotFound(String),

    #[error("invalid spec for {exec_id}: {reason}")]
    InvalidSpec { exec_id: String, reason: String },

    #[error("failed to spawn child process for {exec_id}: {source}")]
    Spawn { exec_id: String, source: std::io::Error },

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CondaResult<T> = Result<T, CondaError>;

#[derive(Error, Debug)]
pub enum CondaError {
    #[error("conda command failed: {0}")]
    CommandFailed(String),

    #[error("failed to invoke conda binary: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to parse conda env list output: {0}")]
    MalformedOutput(#[source] serde_json::Error),
}

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(#[from] tonic::Status),

    #[error("transport connect error: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("malformed deployment_req payload: {0}")]
    MalformedDeploymentReq(String),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
