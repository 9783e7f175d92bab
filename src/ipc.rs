//! Daemon <-> agent channel.
//!
//! The daemon listens on a well-known loopback endpoint for a single agent
//! check-in. The agent listens on its own ephemeral loopback endpoint and runs
//! user scripts on request, authenticating the daemon with the bearer token it
//! handed over at check-in.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{debug, error, info, warn};

use crate::process;
use crate::settings::Settings;

pub const PROTOCOL_VERSION: &str = "1";
const MAX_REQUEST_BYTES: usize = 64 * 1024;
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
pub const CHECK_IN_WAKE_INTERVAL: Duration = Duration::from_secs(600);
pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const CHECK_IN_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInRequest {
    pub protocol_version: String,
    pub endpoint: String,
    pub uid: u32,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInResponse {
    pub accepted: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl CheckInResponse {
    fn accepted() -> Self {
        Self {
            accepted: true,
            message: None,
        }
    }

    fn refused(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub protocol_version: String,
    pub script: PathBuf,
    pub wait: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub ok: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<RemoteError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl ExecuteResponse {
    pub fn ok(exit_code: i32) -> Self {
        Self {
            ok: true,
            exit_code: Some(exit_code),
            error: None,
        }
    }

    pub fn err(code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            exit_code: None,
            error: Some(RemoteError {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub alive: bool,
    pub protocol_version: String,
    pub uid: u32,
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("no agent session is bound")]
    NoSession,
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("unexpected HTTP status {0}")]
    BadStatus(u16),
    #[error("invalid reply: {0}")]
    InvalidReply(String),
    #[error("{code}: {message}")]
    Remote { code: String, message: String },
    #[error("check-in refused: {0}")]
    Refused(String),
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),
}

/// The checked-in agent as seen by the daemon.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub endpoint: String,
    pub uid: u32,
    token: String,
}

/// Daemon-side handle to the (at most one) checked-in agent.
#[derive(Debug)]
pub struct AgentConnector {
    session: Mutex<Option<AgentSession>>,
    checked_in: Condvar,
    client: Client,
    launchctl: PathBuf,
    agent_label: String,
}

impl AgentConnector {
    pub fn new(launchctl: PathBuf, agent_label: impl Into<String>) -> Result<Self> {
        // Script calls block until the user script exits, however long that is.
        // No idle pooling: a restarted agent must never see a stale connection.
        let client = Client::builder()
            .timeout(None::<Duration>)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(0)
            .build()
            .context("failed to build agent client")?;
        Ok(Self {
            session: Mutex::new(None),
            checked_in: Condvar::new(),
            client,
            launchctl,
            agent_label: agent_label.into(),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            settings.launchctl_path.clone(),
            settings.launch_agent_identifier.clone(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, Option<AgentSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self) -> Option<AgentSession> {
        self.lock().clone()
    }

    /// Bind the first valid check-in. Later check-ins are refused and leave the
    /// bound session untouched.
    pub fn check_in(&self, req: &CheckInRequest) -> CheckInResponse {
        if req.protocol_version != PROTOCOL_VERSION {
            warn!(
                uid = req.uid,
                version = %req.protocol_version,
                "refusing check-in with unsupported protocol version"
            );
            return CheckInResponse::refused(format!(
                "unsupported protocol_version '{}' (expected '{}')",
                req.protocol_version, PROTOCOL_VERSION
            ));
        }
        if !is_loopback_endpoint(&req.endpoint) {
            warn!(uid = req.uid, endpoint = %req.endpoint, "refusing check-in from non-loopback endpoint");
            return CheckInResponse::refused("agent endpoint must be a loopback http URL");
        }
        if req.token.trim().is_empty() {
            return CheckInResponse::refused("missing agent token");
        }

        let mut guard = self.lock();
        if let Some(existing) = guard.as_ref() {
            warn!(
                uid = req.uid,
                bound_uid = existing.uid,
                "refusing check-in: an agent session is already bound"
            );
            return CheckInResponse::refused("an agent session is already bound");
        }
        *guard = Some(AgentSession {
            endpoint: req.endpoint.trim_end_matches('/').to_string(),
            uid: req.uid,
            token: req.token.clone(),
        });
        drop(guard);
        self.checked_in.notify_all();
        info!(uid = req.uid, endpoint = %req.endpoint, "agent checked in");
        CheckInResponse::accepted()
    }

    /// Block until an agent has checked in, waking every `wake` to log progress.
    pub fn wait_for_check_in(&self, timeout: Duration, wake: Duration) -> Result<AgentSession, IpcError> {
        info!("waiting for agent check-in");
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        loop {
            if let Some(session) = guard.as_ref() {
                return Ok(session.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                error!(?timeout, "agent did not check in");
                return Err(IpcError::Timeout(timeout, "agent check-in"));
            }
            let (next, res) = self
                .checked_in
                .wait_timeout(guard, wake.min(deadline - now))
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
            if res.timed_out() && guard.is_none() {
                info!("still waiting for agent check-in");
            }
        }
    }

    /// Whether the bound agent answers its health endpoint.
    pub fn agent_is_alive(&self) -> bool {
        let Some(session) = self.session() else {
            return false;
        };
        let url = format!("{}/v1/health", session.endpoint);
        let response = match self
            .client
            .get(url)
            .bearer_auth(&session.token)
            .timeout(HEALTH_TIMEOUT)
            .send()
        {
            Ok(r) => r,
            Err(err) => {
                debug!("agent health check failed: {err}");
                return false;
            }
        };
        if response.status() != StatusCode::OK {
            debug!(status = %response.status(), "agent health check rejected");
            return false;
        }
        response
            .json::<HealthResponse>()
            .map(|h| h.alive)
            .unwrap_or(false)
    }

    /// Poll [`Self::agent_is_alive`] every `poll` until it succeeds or
    /// `timeout` elapses.
    pub fn wait_until_alive(&self, poll: Duration, timeout: Duration) -> Result<(), IpcError> {
        let deadline = Instant::now() + timeout;
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            if self.agent_is_alive() {
                info!(attempt, "agent is alive");
                return Ok(());
            }
            if attempt % 10 == 0 {
                info!(attempt, "agent not answering yet");
            }
            if Instant::now() + poll > deadline {
                error!(?timeout, "agent never became reachable");
                return Err(IpcError::Timeout(timeout, "agent liveness"));
            }
            thread::sleep(poll);
        }
    }

    /// Wait for check-in and then for liveness, both bounded by one `timeout`.
    pub fn wait_for_agent(
        &self,
        timeout: Duration,
        wake: Duration,
        poll: Duration,
    ) -> Result<AgentSession, IpcError> {
        let deadline = Instant::now() + timeout;
        let session = self.wait_for_check_in(timeout, wake)?;
        self.wait_until_alive(poll, deadline.saturating_duration_since(Instant::now()))?;
        Ok(session)
    }

    /// Run `script` in the user session and return its exit code.
    pub fn run_user_script(&self, script: &Path, wait: bool) -> Result<i32, IpcError> {
        let session = self.session().ok_or(IpcError::NoSession)?;
        let url = format!("{}/v1/execute", session.endpoint);
        let req = ExecuteRequest {
            protocol_version: PROTOCOL_VERSION.to_string(),
            script: script.to_path_buf(),
            wait,
        };
        let response = self
            .client
            .post(url)
            .bearer_auth(&session.token)
            .json(&req)
            .send()
            .map_err(|err| IpcError::Unreachable(err.to_string()))?;
        if response.status() != StatusCode::OK {
            return Err(IpcError::BadStatus(response.status().as_u16()));
        }
        let parsed: ExecuteResponse = response
            .json()
            .map_err(|err| IpcError::InvalidReply(err.to_string()))?;
        if parsed.ok {
            parsed
                .exit_code
                .ok_or_else(|| IpcError::InvalidReply("missing exit_code on ok response".to_string()))
        } else {
            let err = parsed.error.unwrap_or(RemoteError {
                code: "REMOTE_EXECUTION_ERROR".to_string(),
                message: "user script execution failed".to_string(),
            });
            Err(IpcError::Remote {
                code: err.code,
                message: err.message,
            })
        }
    }

    /// Ask the service manager to remove the agent's per-user registration.
    pub fn bootout_agent(&self) -> Result<()> {
        let session = self
            .session()
            .ok_or_else(|| anyhow!("no agent session to boot out"))?;
        let target = format!("gui/{}/{}", session.uid, self.agent_label);
        info!(%target, "booting out agent");
        let out = process::run(&self.launchctl, ["bootout", target.as_str()], true)?;
        if !out.success() {
            return Err(anyhow!(
                "launchctl bootout {target} exited with {}: {}",
                out.exit_code,
                out.stderr.trim()
            ));
        }
        Ok(())
    }
}

/// A running tiny_http server loop.
pub struct ServerHandle {
    server: Arc<Server>,
    addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn shutdown(mut self) {
        self.server.unblock();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!(addr = %self.addr, "server thread panicked");
            }
        }
    }

    /// Block until the server loop ends.
    pub fn join(mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!(addr = %self.addr, "server thread panicked");
            }
        }
    }
}

fn bind(addr: &str) -> Result<(Arc<Server>, SocketAddr)> {
    let server = Server::http(addr).map_err(|err| anyhow!("failed to bind {addr}: {err}"))?;
    let local = server
        .server_addr()
        .to_ip()
        .ok_or_else(|| anyhow!("server bound to {addr} has no IP address"))?;
    Ok((Arc::new(server), local))
}

/// The daemon's well-known check-in endpoint.
pub struct DaemonServer {
    server: Arc<Server>,
    addr: SocketAddr,
    connector: Arc<AgentConnector>,
}

impl DaemonServer {
    pub fn bind(addr: &str, connector: Arc<AgentConnector>) -> Result<Self> {
        let (server, addr) = bind(addr)?;
        info!(%addr, "daemon check-in endpoint listening");
        Ok(Self {
            server,
            addr,
            connector,
        })
    }

    pub fn spawn(self) -> ServerHandle {
        let server = Arc::clone(&self.server);
        let connector = self.connector;
        let thread = thread::spawn(move || {
            for request in server.incoming_requests() {
                handle_daemon_request(request, &connector);
            }
        });
        ServerHandle {
            server: self.server,
            addr: self.addr,
            thread: Some(thread),
        }
    }
}

fn handle_daemon_request(mut request: Request, connector: &AgentConnector) {
    if !from_loopback(&request) {
        respond(request, Response::empty(403));
        return;
    }
    let method = request.method().clone();
    let url = request.url().to_string();
    match (method, url.as_str()) {
        (Method::Post, "/v1/checkin") => {
            let body = match read_body(&mut request) {
                Ok(body) => body,
                Err(code) => {
                    respond(request, Response::empty(code));
                    return;
                }
            };
            let reply = match serde_json::from_slice::<CheckInRequest>(&body) {
                Ok(req) => connector.check_in(&req),
                Err(err) => CheckInResponse::refused(format!("invalid check-in request: {err}")),
            };
            respond_json(request, 200, &reply);
        }
        _ => respond(request, Response::empty(404)),
    }
}

/// The agent's private endpoint.
pub struct AgentServer {
    server: Arc<Server>,
    addr: SocketAddr,
    token: String,
    uid: u32,
}

impl AgentServer {
    pub fn bind(addr: &str, uid: u32) -> Result<Self> {
        let (server, addr) = bind(addr)?;
        let mut secret = [0_u8; 32];
        OsRng.fill_bytes(&mut secret);
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(secret);
        Ok(Self {
            server,
            addr,
            token,
            uid,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn spawn(self) -> ServerHandle {
        let server = Arc::clone(&self.server);
        let token: Arc<str> = Arc::from(self.token.as_str());
        let uid = self.uid;
        let thread = thread::spawn(move || {
            for request in server.incoming_requests() {
                let token = Arc::clone(&token);
                // One thread per request so grouped user scripts run side by side.
                thread::spawn(move || handle_agent_request(request, &token, uid));
            }
        });
        ServerHandle {
            server: self.server,
            addr: self.addr,
            thread: Some(thread),
        }
    }
}

fn handle_agent_request(mut request: Request, token: &str, uid: u32) {
    if !from_loopback(&request) {
        respond(request, Response::empty(403));
        return;
    }
    if bearer_token(&request) != Some(token) {
        respond(request, Response::empty(401));
        return;
    }
    let method = request.method().clone();
    let url = request.url().to_string();
    match (method, url.as_str()) {
        (Method::Get, "/v1/health") => {
            let reply = HealthResponse {
                alive: true,
                protocol_version: PROTOCOL_VERSION.to_string(),
                uid,
            };
            respond_json(request, 200, &reply);
        }
        (Method::Post, "/v1/execute") => {
            let body = match read_body(&mut request) {
                Ok(body) => body,
                Err(code) => {
                    respond(request, Response::empty(code));
                    return;
                }
            };
            let reply = match serde_json::from_slice::<ExecuteRequest>(&body) {
                Ok(req) => execute_script(&req),
                Err(err) => ExecuteResponse::err(
                    "REMOTE_INVALID_JSON",
                    format!("invalid execute request: {err}"),
                ),
            };
            respond_json(request, 200, &reply);
        }
        _ => respond(request, Response::empty(404)),
    }
}

fn execute_script(req: &ExecuteRequest) -> ExecuteResponse {
    if req.protocol_version != PROTOCOL_VERSION {
        return ExecuteResponse::err(
            "REMOTE_SCHEMA_VIOLATION",
            format!(
                "unsupported protocol_version '{}' (expected '{}')",
                req.protocol_version, PROTOCOL_VERSION
            ),
        );
    }
    info!(script = %req.script.display(), wait = req.wait, "running user script");
    match process::run(&req.script, std::iter::empty::<&str>(), req.wait) {
        Ok(out) => {
            if !out.stdout.trim().is_empty() {
                debug!(script = %req.script.display(), "stdout: {}", out.stdout.trim());
            }
            if !out.success() {
                warn!(
                    script = %req.script.display(),
                    code = out.exit_code,
                    "user script failed: {}",
                    out.stderr.trim()
                );
            }
            ExecuteResponse::ok(out.exit_code)
        }
        Err(err) => ExecuteResponse::err("REMOTE_EXECUTION_ERROR", format!("{err:#}")),
    }
}

/// Agent-side check-in retry policy.
#[derive(Debug, Clone)]
pub struct CheckInOptions {
    pub daemon_endpoint: String,
    pub retry_interval: Duration,
    pub max_attempts: Option<u64>,
}

impl CheckInOptions {
    pub fn new(daemon_endpoint: impl Into<String>) -> Self {
        Self {
            daemon_endpoint: daemon_endpoint.into(),
            retry_interval: CHECK_IN_RETRY_INTERVAL,
            max_attempts: None,
        }
    }
}

/// Register `agent_endpoint` with the daemon, retrying until the daemon
/// answers. A refusal is final.
pub fn check_in_with_daemon(
    opts: &CheckInOptions,
    agent_endpoint: &str,
    uid: u32,
    token: &str,
) -> Result<(), IpcError> {
    let client = Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|err| IpcError::Unreachable(err.to_string()))?;
    let url = format!("{}/v1/checkin", http_base(&opts.daemon_endpoint));
    let req = CheckInRequest {
        protocol_version: PROTOCOL_VERSION.to_string(),
        endpoint: agent_endpoint.to_string(),
        uid,
        token: token.to_string(),
    };

    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let failure = match client.post(&url).json(&req).send() {
            Ok(response) if response.status() == StatusCode::OK => {
                let reply: CheckInResponse = response
                    .json()
                    .map_err(|err| IpcError::InvalidReply(err.to_string()))?;
                if reply.accepted {
                    info!(attempt, "checked in with daemon");
                    return Ok(());
                }
                let message = reply.message.unwrap_or_else(|| "no reason given".to_string());
                error!("daemon refused check-in: {message}");
                return Err(IpcError::Refused(message));
            }
            Ok(response) => IpcError::BadStatus(response.status().as_u16()),
            Err(err) => IpcError::Unreachable(err.to_string()),
        };
        if attempt == 1 || attempt % 10 == 0 {
            warn!(attempt, "daemon not reachable yet: {failure}");
        }
        if opts.max_attempts.is_some_and(|max| attempt >= max) {
            return Err(failure);
        }
        thread::sleep(opts.retry_interval);
    }
}

pub fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

/// `host:port` or a full URL, normalized to an `http://` base without a trailing slash.
pub fn http_base(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

fn is_loopback_endpoint(endpoint: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(endpoint) else {
        return false;
    };
    if url.scheme() != "http" {
        return false;
    }
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false),
        None => false,
    }
}

fn from_loopback(request: &Request) -> bool {
    request
        .remote_addr()
        .map(|addr| addr.ip().is_loopback())
        .unwrap_or(false)
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv("Authorization"))
        .and_then(|h| h.value.as_str().strip_prefix("Bearer "))
}

fn read_body(request: &mut Request) -> std::result::Result<Vec<u8>, u16> {
    let mut body: Vec<u8> = Vec::new();
    if let Err(err) = request
        .as_reader()
        .take((MAX_REQUEST_BYTES + 1) as u64)
        .read_to_end(&mut body)
    {
        warn!("failed to read request body: {err}");
        return Err(400);
    }
    if body.len() > MAX_REQUEST_BYTES {
        return Err(413);
    }
    Ok(body)
}

fn respond_json<T: Serialize>(request: Request, code: u16, body: &T) {
    match serde_json::to_vec(body) {
        Ok(bytes) => respond(request, json_response(code, bytes)),
        Err(err) => {
            error!("failed to encode response: {err}");
            respond(request, Response::empty(500));
        }
    }
}

fn respond<R: Read>(request: Request, response: Response<R>) {
    if let Err(err) = request.respond(response) {
        debug!("failed to send response: {err}");
    }
}

fn json_response(code: u16, body: Vec<u8>) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut response = Response::from_data(body).with_status_code(code);
    if let Ok(header) = Header::from_bytes("Content-Type", "application/json") {
        response = response.with_header(header);
    }
    response
}
