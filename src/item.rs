use std::cmp::Ordering;
use std::ffi::OsStr;
use std::fmt;
use std::fs::{self, File, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::ipc::AgentConnector;
use crate::limiter::{ConcurrencyLimiter, DownloadPermit};
use crate::manifest::{FailPolicy, ItemKind, ItemSpec};
use crate::process;
use crate::receipt;
use crate::settings::{HashCheckPolicy, Settings};

const HASH_BUFFER_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Initialized,
    Downloading,
    Downloaded,
    FailedDownload,
    Executing,
    Finished,
    Failed,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::FailedDownload | Self::Finished | Self::Failed)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialized => "initialized",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::FailedDownload => "failed-download",
            Self::Executing => "executing",
            Self::Finished => "finished",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Kind-specific data and behavior of a deploy item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemVariant {
    ControlManifest,
    Package {
        package_id: Option<String>,
        version: Option<String>,
        force_reinstall: bool,
    },
    RootScript,
    UserScript,
}

impl ItemVariant {
    fn from_spec(spec: &ItemSpec) -> Option<Self> {
        match spec.kind {
            ItemKind::Package => Some(Self::Package {
                package_id: spec.packageid.clone(),
                version: spec.version.clone(),
                force_reinstall: spec.pkg_required,
            }),
            ItemKind::RootScript => Some(Self::RootScript),
            ItemKind::UserScript => Some(Self::UserScript),
            ItemKind::Unknown => None,
        }
    }

    /// Mode applied to the file after a successful transfer.
    pub fn file_permissions(&self) -> u32 {
        match self {
            Self::ControlManifest | Self::Package { .. } => 0o600,
            Self::RootScript => 0o700,
            // the agent runs these as the console user
            Self::UserScript => 0o755,
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Self::ControlManifest => "load the control manifest",
            Self::Package { .. } => "install package",
            Self::RootScript => "run root script",
            Self::UserScript => "delegate user script to the agent",
        }
    }
}

impl fmt::Display for ItemVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ControlManifest => "manifest",
            Self::Package { .. } => "package",
            Self::RootScript => "rootscript",
            Self::UserScript => "userscript",
        };
        f.write_str(name)
    }
}

/// Shared collaborators every item needs.
#[derive(Clone)]
pub struct ItemContext {
    pub settings: Arc<Settings>,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub agent: Arc<AgentConnector>,
    http: Client,
}

impl ItemContext {
    pub fn new(
        settings: Arc<Settings>,
        limiter: Arc<ConcurrencyLimiter>,
        agent: Arc<AgentConnector>,
    ) -> Result<Self> {
        // Packages can be large; only the connect phase is bounded.
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .build()
            .context("failed to build download client")?;
        Ok(Self {
            settings,
            limiter,
            agent,
            http,
        })
    }
}

#[derive(Debug)]
struct Progress {
    state: ItemState,
    download_done: bool,
    redownloads_left: u32,
    attempts: u32,
    exit_code: Option<i32>,
}

enum Verdict {
    Accept,
    Retry,
}

/// One unit of work: download, verify, execute.
pub struct DeployItem {
    name: String,
    file: PathBuf,
    url: Option<String>,
    hash: Option<String>,
    fail_policy: FailPolicy,
    parallel_group: Option<String>,
    donotwait: bool,
    variant: ItemVariant,
    ctx: ItemContext,
    progress: Mutex<Progress>,
    download_signal: Condvar,
}

impl fmt::Debug for DeployItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeployItem")
            .field("name", &self.name)
            .field("variant", &self.variant)
            .field("state", &self.state())
            .finish()
    }
}

impl DeployItem {
    /// Build an item from a manifest entry. Entries of unknown type yield `None`.
    pub fn from_spec(spec: &ItemSpec, ctx: &ItemContext) -> Option<Arc<Self>> {
        let variant = ItemVariant::from_spec(spec)?;
        Some(Self::build(
            spec.name.clone(),
            spec.file.clone(),
            spec.url.clone().filter(|u| !u.trim().is_empty()),
            spec.hash.clone(),
            spec.fail_policy,
            spec.group().map(str::to_string),
            spec.donotwait,
            variant,
            ctx,
        ))
    }

    /// The control manifest fetch. Never hash-checked; failure is fatal.
    pub fn control_manifest(url: &str, file: PathBuf, ctx: &ItemContext) -> Arc<Self> {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "manifest".to_string());
        Self::build(
            name,
            file,
            Some(url.to_string()),
            None,
            FailPolicy::FailureIsNotAnOption,
            None,
            false,
            ItemVariant::ControlManifest,
            ctx,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        name: String,
        file: PathBuf,
        url: Option<String>,
        hash: Option<String>,
        fail_policy: FailPolicy,
        parallel_group: Option<String>,
        donotwait: bool,
        variant: ItemVariant,
        ctx: &ItemContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            file,
            url,
            hash,
            fail_policy,
            parallel_group,
            donotwait,
            variant,
            ctx: ctx.clone(),
            progress: Mutex::new(Progress {
                state: ItemState::Initialized,
                download_done: false,
                redownloads_left: ctx.settings.maximum_redownloads,
                attempts: 0,
                exit_code: None,
            }),
            download_signal: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn variant(&self) -> &ItemVariant {
        &self.variant
    }

    pub fn fail_policy(&self) -> FailPolicy {
        self.fail_policy
    }

    pub fn parallel_group(&self) -> Option<&str> {
        self.parallel_group.as_deref()
    }

    pub fn file_permissions(&self) -> u32 {
        self.variant.file_permissions()
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ItemState {
        self.lock().state
    }

    /// Exit code of the executed action, `None` if nothing ran.
    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    /// Number of network transfers started for this item.
    pub fn download_attempts(&self) -> u32 {
        self.lock().attempts
    }

    fn set_state(&self, state: ItemState) {
        let mut p = self.lock();
        debug!(item = %self.name, from = %p.state, to = %state, "state change");
        p.state = state;
    }

    fn finish_download(&self, state: ItemState) {
        let mut p = self.lock();
        p.state = state;
        p.download_done = true;
        drop(p);
        self.download_signal.notify_all();
        match state {
            ItemState::Downloaded => info!(item = %self.name, "download complete"),
            _ => error!(item = %self.name, "download failed"),
        }
    }

    /// Returns false once the redownload budget is spent.
    fn consume_redownload(&self) -> bool {
        let mut p = self.lock();
        if p.redownloads_left == 0 {
            return false;
        }
        p.redownloads_left -= 1;
        debug!(item = %self.name, left = p.redownloads_left, "retrying download");
        true
    }

    /// Start getting the file in place. Blocks only while waiting for a
    /// download slot; the transfer itself runs on its own thread.
    pub fn download_if_needed(self: &Arc<Self>) {
        let Some(url) = self.url.clone() else {
            if self.file.exists() {
                info!(item = %self.name, "no url; using local file");
                self.finish_download(ItemState::Downloaded);
            } else {
                error!(item = %self.name, file = %self.file.display(), "no url and no local file");
                self.finish_download(ItemState::FailedDownload);
            }
            return;
        };

        if self.file.exists() {
            info!(item = %self.name, "file already present; verifying");
            match self.verify() {
                Verdict::Accept => {
                    self.finish_download(ItemState::Downloaded);
                    return;
                }
                Verdict::Retry => {
                    if !self.consume_redownload() {
                        self.finish_download(ItemState::FailedDownload);
                        return;
                    }
                    self.remove_file();
                }
            }
        }

        let permit = self.ctx.limiter.acquire();
        self.set_state(ItemState::Downloading);
        let item = Arc::clone(self);
        thread::spawn(move || item.download_loop(&url, permit));
    }

    fn download_loop(&self, url: &str, mut permit: DownloadPermit) {
        loop {
            let attempt = {
                let mut p = self.lock();
                p.attempts += 1;
                p.attempts
            };
            info!(item = %self.name, attempt, %url, "downloading");
            let fetched = self.transfer(url);
            drop(permit);

            let verdict = match fetched {
                Ok(()) => self.verify(),
                Err(err) => {
                    warn!(item = %self.name, attempt, "transfer failed: {err:#}");
                    Verdict::Retry
                }
            };
            match verdict {
                Verdict::Accept => {
                    self.finish_download(ItemState::Downloaded);
                    return;
                }
                Verdict::Retry => {
                    if !self.consume_redownload() {
                        self.finish_download(ItemState::FailedDownload);
                        return;
                    }
                    self.remove_file();
                    permit = self.ctx.limiter.acquire();
                }
            }
        }
    }

    fn transfer(&self, url: &str) -> Result<()> {
        let mut request = self.ctx.http.get(url);
        if let Some(auth) = &self.ctx.settings.http_auth {
            request = request.basic_auth(&auth.user, Some(&auth.password));
        }
        let mut response = request
            .send()
            .with_context(|| format!("request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("{url} answered HTTP {status}"));
        }

        let parent = match self.file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create '{}'", parent.display()))?;
        let mut tmp = NamedTempFile::new_in(parent)
            .with_context(|| format!("failed to create temp file in '{}'", parent.display()))?;
        let bytes = response
            .copy_to(&mut tmp)
            .with_context(|| format!("failed to read body of {url}"))?;
        fs::set_permissions(
            tmp.path(),
            Permissions::from_mode(self.variant.file_permissions()),
        )
        .context("failed to set file permissions")?;
        tmp.persist(&self.file)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to move download into '{}'", self.file.display()))?;
        debug!(item = %self.name, bytes, "transfer complete");
        Ok(())
    }

    fn remove_file(&self) {
        if let Err(err) = fs::remove_file(&self.file) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(item = %self.name, "failed to remove '{}': {err}", self.file.display());
            }
        }
    }

    fn verify(&self) -> Verdict {
        if matches!(self.variant, ItemVariant::ControlManifest) {
            return Verdict::Accept;
        }
        let policy = self.ctx.settings.hash_check_policy;
        if policy == HashCheckPolicy::Ignore {
            debug!(item = %self.name, "hash check disabled");
            return Verdict::Accept;
        }

        let Some(expected) = self.hash.as_deref().map(str::trim).filter(|h| !h.is_empty()) else {
            return if policy == HashCheckPolicy::Strict {
                warn!(item = %self.name, "no hash in manifest; rejected by strict policy");
                Verdict::Retry
            } else {
                warn!(item = %self.name, "no hash in manifest; accepting");
                Verdict::Accept
            };
        };

        let matches = match sha256_file(&self.file) {
            Ok(actual) => {
                let ok = actual.eq_ignore_ascii_case(expected);
                if !ok {
                    warn!(item = %self.name, %expected, %actual, "hash mismatch");
                }
                ok
            }
            Err(err) => {
                warn!(item = %self.name, "failed to hash file: {err:#}");
                false
            }
        };
        if matches {
            debug!(item = %self.name, "hash verified");
            Verdict::Accept
        } else if policy == HashCheckPolicy::Strict {
            Verdict::Retry
        } else {
            warn!(item = %self.name, "accepting despite hash problem (warning policy)");
            Verdict::Accept
        }
    }

    /// Block until `download_if_needed` has reached a verdict.
    pub fn wait_for_download(&self) -> ItemState {
        let mut p = self.lock();
        while !p.download_done {
            p = self
                .download_signal
                .wait(p)
                .unwrap_or_else(PoisonError::into_inner);
        }
        p.state
    }

    /// Wait for the download and run the item. Returns the terminal state.
    pub fn execute(&self) -> ItemState {
        let state = self.wait_for_download();
        if state != ItemState::Downloaded {
            warn!(item = %self.name, %state, "skipping execution");
            return state;
        }
        self.set_state(ItemState::Executing);

        let outcome = if self.ctx.settings.dry_run {
            info!(item = %self.name, "dry run: would {}", self.variant.action());
            Ok(0)
        } else {
            info!(item = %self.name, kind = %self.variant, "executing");
            self.run_action()
        };

        let code = match outcome {
            Ok(code) => Some(code),
            Err(err) => {
                error!(item = %self.name, "execution error: {err:#}");
                None
            }
        };
        let state = if code == Some(0) {
            ItemState::Finished
        } else {
            ItemState::Failed
        };
        {
            let mut p = self.lock();
            p.exit_code = code;
            p.state = state;
        }
        match code {
            Some(0) => info!(item = %self.name, "finished"),
            Some(code) => error!(item = %self.name, code, "failed"),
            None => error!(item = %self.name, "failed"),
        }
        state
    }

    fn run_action(&self) -> Result<i32> {
        match &self.variant {
            ItemVariant::ControlManifest => Ok(0),
            ItemVariant::Package {
                package_id,
                version,
                force_reinstall,
            } => self.install_package(package_id.as_deref(), version.as_deref(), *force_reinstall),
            ItemVariant::RootScript => {
                let out = process::run(&self.file, std::iter::empty::<&str>(), !self.donotwait)?;
                log_output(&self.name, &out);
                Ok(out.exit_code)
            }
            ItemVariant::UserScript => self
                .ctx
                .agent
                .run_user_script(&self.file, !self.donotwait)
                .with_context(|| format!("user script '{}' was not run", self.name)),
        }
    }

    fn install_package(
        &self,
        package_id: Option<&str>,
        version: Option<&str>,
        force_reinstall: bool,
    ) -> Result<i32> {
        let settings = &self.ctx.settings;
        if force_reinstall {
            info!(item = %self.name, "package marked required; installing regardless of receipt");
        } else if let (Some(id), Some(wanted)) = (package_id, version) {
            match receipt::installed_version(&settings.pkgutil_path, id) {
                Ok(Some(installed)) if receipt::compare_versions(&installed, wanted) != Ordering::Less => {
                    info!(item = %self.name, %installed, %wanted, "receipt satisfies manifest version; skipping install");
                    return Ok(0);
                }
                Ok(Some(installed)) => {
                    info!(item = %self.name, %installed, %wanted, "installed version is older");
                }
                Ok(None) => info!(item = %self.name, package_id = id, "no receipt"),
                Err(err) => warn!(item = %self.name, "receipt lookup failed, installing: {err:#}"),
            }
        } else {
            debug!(item = %self.name, "no packageid/version; skipping receipt check");
        }

        let args = [
            OsStr::new("-verboseR"),
            OsStr::new("-pkg"),
            self.file.as_os_str(),
            OsStr::new("-target"),
            OsStr::new("/"),
        ];
        let out = process::run(&settings.installer_path, args, !self.donotwait)?;
        log_output(&self.name, &out);
        Ok(out.exit_code)
    }
}

fn log_output(name: &str, out: &process::ProcessOutput) {
    if !out.stdout.trim().is_empty() {
        debug!(item = %name, "stdout: {}", out.stdout.trim());
    }
    if !out.success() && !out.stderr.trim().is_empty() {
        warn!(item = %name, code = out.exit_code, "stderr: {}", out.stderr.trim());
    }
}

/// Lowercase hex SHA-256 of a file, streamed.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open '{}'", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0_u8; HASH_BUFFER_BYTES];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissions_per_kind() {
        assert_eq!(ItemVariant::ControlManifest.file_permissions(), 0o600);
        assert_eq!(ItemVariant::RootScript.file_permissions(), 0o700);
        assert_eq!(ItemVariant::UserScript.file_permissions(), 0o755);
        let pkg = ItemVariant::Package {
            package_id: None,
            version: None,
            force_reinstall: false,
        };
        assert_eq!(pkg.file_permissions(), 0o600);
    }

    #[test]
    fn terminal_states() {
        assert!(ItemState::FailedDownload.is_terminal());
        assert!(ItemState::Finished.is_terminal());
        assert!(ItemState::Failed.is_terminal());
        assert!(!ItemState::Downloaded.is_terminal());
        assert!(!ItemState::Executing.is_terminal());
    }

    #[test]
    fn sha256_of_known_bytes() {
        let dir = std::env::temp_dir().join(format!("ias-hash-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("abc.txt");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let _ = fs::remove_dir_all(dir);
    }
}
