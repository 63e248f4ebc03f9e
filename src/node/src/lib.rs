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

//! The Symphony node agent: supervises deployments assigned by the
//! conductor and streams their status/logs back over `Connect`.

pub mod agent;
pub mod conda_env;
pub mod cron;
pub mod error;
pub mod repo_fetch;
pub mod resource_sampler;
pub mod runner_exec;
pub mod server;
