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

//! Generated wire types for the `symphony.v1` protocol, plus the service
//! client/server stubs `tonic-build` emits alongside them. See
//! `proto/protocol.proto` for the source definitions.

pub mod v1 {
    tonic::include_proto!("symphony.v1");
}

pub use v1::symphony_control_client::SymphonyControlClient;
pub use v1::symphony_control_server::{SymphonyControl, SymphonyControlServer};
pub use v1::*;
