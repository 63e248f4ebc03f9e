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

use clap::Parser;
use symphony_conductor::server::{conductor_serve, ConductorOpts};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = ConductorOpts::parse();
    symphony_common::logging::init_logger("conductor");
    conductor_serve(opts).await
}
