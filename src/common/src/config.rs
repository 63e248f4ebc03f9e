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

//! `clap`-derived configuration shared by both binaries, following the
//! CLI-flag-with-env-fallback pattern the node binaries already use (e.g.
//! `ComputeNodeOpts` in `src/compute/src/server.rs`): required values are
//! flags with `env` fallbacks, optional tuning knobs default in code.

use std::path::PathBuf;

use clap::Args;

/// mTLS material. When all three paths are absent the transport falls back to
/// plaintext (§4.1) — a deliberate, logged relaxation for local development
/// and tests, never the production default.
#[derive(Args, Debug, Clone, Default)]
pub struct TlsArgs {
    /// PEM-encoded CA certificate both sides trust.
    #[arg(long, env = "SYMPHONY_TLS_CA_CERT")]
    pub ca_cert: Option<PathBuf>,

    /// PEM-encoded leaf certificate for this process's own identity.
    #[arg(long, env = "SYMPHONY_TLS_CERT")]
    pub cert: Option<PathBuf>,

    /// PEM-encoded private key for `cert`.
    #[arg(long, env = "SYMPHONY_TLS_KEY")]
    pub key: Option<PathBuf>,
}

impl TlsArgs {
    pub fn is_configured(&self) -> bool {
        self.ca_cert.is_some() && self.cert.is_some() && self.key.is_some()
    }

    /// Load the three PEM files. Callers hand the bytes to `tonic`'s
    /// `Certificate`/`Identity` constructors; `symphony-common` stays
    /// independent of the transport crate.
    pub fn load_pem(&self) -> anyhow::Result<Option<LoadedTls>> {
        if !self.is_configured() {
            return Ok(None);
        }
        let ca_cert = std::fs::read(self.ca_cert.as_ref().unwrap())?;
        let cert = std::fs::read(self.cert.as_ref().unwrap())?;
        let key = std::fs::read(self.key.as_ref().unwrap())?;
        Ok(Some(LoadedTls { ca_cert, cert, key }))
    }
}

pub struct LoadedTls {
    pub ca_cert: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

/// Keepalive timers mandated by §4.1: probe ~20s, timeout ~5s.
#[derive(Args, Debug, Clone)]
pub struct KeepaliveArgs {
    #[arg(long, env = "SYMPHONY_KEEPALIVE_PROBE_SECS", default_value_t = 20)]
    pub probe_secs: u64,

    #[arg(long, env = "SYMPHONY_KEEPALIVE_TIMEOUT_SECS", default_value_t = 5)]
    pub timeout_secs: u64,
}

impl Default for KeepaliveArgs {
    fn default() -> Self {
        Self {
            probe_secs: 20,
            timeout_secs: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_args_require_all_three_paths() {
        let mut args = TlsArgs::default();
        assert!(!args.is_configured());
        args.ca_cert = Some(PathBuf::from("ca.pem"));
        args.cert = Some(PathBuf::from("cert.pem"));
        assert!(!args.is_configured());
        args.key = Some(PathBuf::from("key.pem"));
        assert!(args.is_configured());
    }

    #[test]
    fn unconfigured_tls_args_load_pem_returns_none() {
        let args = TlsArgs::default();
        assert!(args.load_pem().unwrap().is_none());
    }
}
