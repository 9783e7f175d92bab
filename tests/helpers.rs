#![allow(dead_code)]

use std::collections::HashMap;
use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use ias::ipc::AgentConnector;
use ias::item::ItemContext;
use ias::limiter::ConcurrencyLimiter;
use ias::manifest::ItemSpec;
use ias::settings::Settings;
use sha2::{Digest, Sha256};
use tiny_http::{Header, Response, Server};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
static DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn env_lock() -> MutexGuard<'static, ()> {
    match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(g) => g,
        // If a previous test panicked while holding the lock, recover so subsequent
        // tests can still run (these tests serialize env var changes).
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// RAII guard for test-only env var mutation, serialized with a global lock.
#[must_use]
pub struct EnvVarGuard {
    key: String,
    old: Option<OsString>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvVarGuard {
    pub fn set<K: Into<String>, V: AsRef<OsStr>>(key: K, value: V) -> Self {
        let key = key.into();
        let lock = env_lock();
        let old = env::var_os(&key);
        unsafe {
            env::set_var(&key, value);
        }
        Self {
            key,
            old,
            _lock: lock,
        }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        unsafe {
            match &self.old {
                Some(v) => env::set_var(&self.key, v),
                None => env::remove_var(&self.key),
            }
        }
    }
}

/// Fresh, empty directory under the system temp dir.
pub fn unique_test_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let n = DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = env::temp_dir().join(format!(
        "ias-{prefix}-{}-{nanos}-{n}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Write an executable `/bin/sh` script.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }
    path
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn mode_of(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).unwrap().permissions().mode() & 0o777
}

/// Settings pointing every external tool at harmless mocks inside `dir`:
/// pkgutil reports no receipt, installer records its arguments.
pub fn test_settings(dir: &Path) -> Settings {
    let pkgutil = write_script(dir, "mock-pkgutil", "exit 1");
    let installer = write_script(
        dir,
        "mock-installer",
        &format!("echo \"$@\" >> {}\nexit 0", dir.join("installer.log").display()),
    );
    Settings {
        manifest_url: None,
        install_path: dir.join("install"),
        maximum_redownloads: 3,
        installer_path: installer,
        pkgutil_path: pkgutil,
        launchctl_path: PathBuf::from("/bin/true"),
        daemon_endpoint: "127.0.0.1:0".to_string(),
        wait_for_agent_timeout: Duration::from_secs(10),
        ..Settings::default()
    }
}

pub fn context(settings: Settings) -> ItemContext {
    let limiter = ConcurrencyLimiter::new(
        settings.min_download_concurrency,
        settings.max_download_concurrency,
    )
    .unwrap();
    let agent = Arc::new(AgentConnector::from_settings(&settings).unwrap());
    ItemContext::new(Arc::new(settings), limiter, agent).unwrap()
}

pub fn spec(value: serde_json::Value) -> ItemSpec {
    serde_json::from_value(value).expect("valid item spec")
}

#[derive(Default)]
struct FixtureState {
    files: HashMap<String, Vec<u8>>,
    hits: HashMap<String, usize>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Static file server for download tests. Counts hits per path and the peak
/// number of concurrent requests.
pub struct FixtureServer {
    base: String,
    state: Arc<Mutex<FixtureState>>,
    server: Arc<Server>,
    thread: Option<JoinHandle<()>>,
}

impl FixtureServer {
    pub fn start(files: &[(&str, &[u8])]) -> Self {
        Self::start_with(files, Duration::ZERO, None)
    }

    pub fn start_with(
        files: &[(&str, &[u8])],
        delay: Duration,
        basic_auth: Option<(&str, &str)>,
    ) -> Self {
        let server = Arc::new(Server::http("127.0.0.1:0").expect("bind fixture server"));
        let addr = server.server_addr().to_ip().expect("ip listener");
        let state = Arc::new(Mutex::new(FixtureState {
            files: files
                .iter()
                .map(|(p, b)| (p.to_string(), b.to_vec()))
                .collect(),
            ..FixtureState::default()
        }));
        let expected_auth = basic_auth.map(|(u, p)| {
            format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(format!("{u}:{p}"))
            )
        });

        let thread = {
            let server = Arc::clone(&server);
            let state = Arc::clone(&state);
            thread::spawn(move || {
                for request in server.incoming_requests() {
                    let state = Arc::clone(&state);
                    let expected_auth = expected_auth.clone();
                    thread::spawn(move || {
                        let path = request.url().to_string();
                        let body = {
                            let mut s = state.lock().unwrap();
                            *s.hits.entry(path.clone()).or_insert(0) += 1;
                            s.in_flight += 1;
                            s.max_in_flight = s.max_in_flight.max(s.in_flight);
                            s.files.get(&path).cloned()
                        };
                        thread::sleep(delay);
                        let authorized = match &expected_auth {
                            None => true,
                            Some(expected) => request
                                .headers()
                                .iter()
                                .any(|h| h.field.equiv("Authorization") && h.value.as_str() == expected),
                        };
                        state.lock().unwrap().in_flight -= 1;
                        let result = if !authorized {
                            request.respond(Response::empty(401))
                        } else {
                            match body {
                                Some(bytes) => {
                                    let header =
                                        Header::from_bytes("Content-Type", "application/octet-stream")
                                            .unwrap();
                                    request.respond(Response::from_data(bytes).with_header(header))
                                }
                                None => request.respond(Response::empty(404)),
                            }
                        };
                        let _ = result;
                    });
                }
            })
        };

        Self {
            base: format!("http://{addr}"),
            state,
            server,
            thread: Some(thread),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .hits
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }
}

impl Drop for FixtureServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}
