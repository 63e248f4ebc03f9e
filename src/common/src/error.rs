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

/// Single-line, cause-chain-flattened rendering for `tracing::error!` call sites.
///
/// Re-exported from `thiserror-ext` so every component crate renders errors the
/// same way instead of falling back to `{:?}`'s multi-line `Debug` dump.
pub use thiserror_ext::AsReport;

pub type CoreResult<T> = Result<T, CoreError>;

/// Catch-all error for boundary glue (CLI parsing, config loading) that doesn't
/// belong to any single component. Component crates define their own typed
/// errors (`RegistryError`, `SupervisorError`, ...) rather than routing through
/// this type; see `SPEC_FULL.md` §7.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use thiserror_ext::AsReport;

    use super::*;

    #[test]
    fn as_report_flattens_cause_chain() {
        let err = CoreError::Other(anyhow::anyhow!("root cause").context("loading config"));
        let rendered = err.as_report().to_string();
        assert!(rendered.contains("root cause"));
    }
}
