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

//! Logging bootstrap, in the shape of `src/utils/runtime/src/lib.rs`'s
//! `init_risingwave_logger`: one function, called once, early in `main`,
//! before any other component is constructed.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `tracing` subscriber. `component` is attached as the
/// process-level target prefix so Conductor and Node logs are distinguishable
/// when aggregated.
pub fn init_logger(component: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stdout()));

    let subscriber = tracing_subscriber::registry().with(env_filter).with(fmt_layer);

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install global tracing subscriber: {e}");
    }

    tracing::info!(component, "logging initialized");
}
