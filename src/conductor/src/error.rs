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

use thiserror::Error;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("node {0} already registered")]
    AlreadyRegistered(String),

    #[error("node {0} not found")]
    NotFound(String),
}

pub type ConductorResult<T> = Result<T, ConductorError>;

#[derive(Error, Debug)]
pub enum ConductorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Converted at the gRPC service-method boundary only (SPEC_FULL.md §7); callers
/// above that boundary keep matching on `ConductorError`'s variants directly.
impl From<ConductorError> for tonic::Status {
    fn from(e: ConductorError) -> Self {
        match e {
            ConductorError::Registry(RegistryError::AlreadyRegistered(id)) => {
                tonic::Status::already_exists(format!("node {id} already registered"))
            }
            ConductorError::Registry(RegistryError::NotFound(id)) => {
                tonic::Status::not_found(format!("node {id} not found"))
            }
            ConductorError::ProtocolViolation(msg) => tonic::Status::failed_precondition(msg),
            ConductorError::MalformedEnvelope(msg) => tonic::Status::invalid_argument(msg),
            ConductorError::Other(e) => tonic::Status::internal(e.to_string()),
        }
    }
}
