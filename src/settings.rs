use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const DEFAULT_INSTALL_PATH: &str = "/Library/installapplications";
pub const DEFAULT_IDENTIFIER: &str = "com.ias";
pub const DEFAULT_DAEMON_IDENTIFIER: &str = "com.ias.iasd";
pub const DEFAULT_AGENT_IDENTIFIER: &str = "com.ias.iasagent";
pub const DEFAULT_DAEMON_ENDPOINT: &str = "127.0.0.1:54631";
pub const DEFAULT_DEPNOTIFY_CONTROL_FILE: &str = "/var/tmp/depnotify.log";
pub const DEFAULT_WAIT_FOR_AGENT_SECS: u64 = 86_400;

/// How downloaded assets are checked against the manifest `hash` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum HashCheckPolicy {
    Ignore,
    Warning,
    #[default]
    Strict,
}

impl FromStr for HashCheckPolicy {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "warning" => Ok(Self::Warning),
            "strict" => Ok(Self::Strict),
            other => Err(anyhow!(
                "unknown HashCheckPolicy '{other}' (expected Ignore, Warning or Strict)"
            )),
        }
    }
}

impl TryFrom<String> for HashCheckPolicy {
    type Error = anyhow::Error;

    fn try_from(raw: String) -> Result<Self> {
        raw.parse()
    }
}

impl fmt::Display for HashCheckPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ignore => "Ignore",
            Self::Warning => "Warning",
            Self::Strict => "Strict",
        };
        f.write_str(name)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("user", &"<redacted>")
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepNotifySettings {
    pub enabled: bool,
    pub control_file: PathBuf,
    pub determinate: bool,
}

impl Default for DepNotifySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            control_file: PathBuf::from(DEFAULT_DEPNOTIFY_CONTROL_FILE),
            determinate: true,
        }
    }
}

/// Effective daemon configuration after defaults, file and environment are merged.
#[derive(Debug, Clone)]
pub struct Settings {
    pub manifest_url: Option<String>,
    pub hash_check_policy: HashCheckPolicy,
    pub install_path: PathBuf,
    pub identifier: String,
    pub launch_daemon_identifier: String,
    pub launch_agent_identifier: String,
    pub min_download_concurrency: usize,
    pub max_download_concurrency: usize,
    pub maximum_redownloads: u32,
    pub skip_json_validation: bool,
    pub wait_for_agent_timeout: Duration,
    pub dry_run: bool,
    pub http_auth: Option<BasicAuth>,
    pub daemon_endpoint: String,
    pub manifest_public_key: Option<String>,
    pub depnotify: DepNotifySettings,
    pub installer_path: PathBuf,
    pub pkgutil_path: PathBuf,
    pub launchctl_path: PathBuf,
    pub unload_agent_on_exit: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            manifest_url: None,
            hash_check_policy: HashCheckPolicy::Strict,
            install_path: PathBuf::from(DEFAULT_INSTALL_PATH),
            identifier: DEFAULT_IDENTIFIER.to_string(),
            launch_daemon_identifier: DEFAULT_DAEMON_IDENTIFIER.to_string(),
            launch_agent_identifier: DEFAULT_AGENT_IDENTIFIER.to_string(),
            min_download_concurrency: 1,
            max_download_concurrency: 4,
            maximum_redownloads: 3,
            skip_json_validation: false,
            wait_for_agent_timeout: Duration::from_secs(DEFAULT_WAIT_FOR_AGENT_SECS),
            dry_run: false,
            http_auth: None,
            daemon_endpoint: DEFAULT_DAEMON_ENDPOINT.to_string(),
            manifest_public_key: None,
            depnotify: DepNotifySettings::default(),
            installer_path: PathBuf::from("/usr/sbin/installer"),
            pkgutil_path: PathBuf::from("/usr/sbin/pkgutil"),
            launchctl_path: PathBuf::from("/bin/launchctl"),
            unload_agent_on_exit: false,
        }
    }
}

/// On-disk YAML shape. Keys keep the historical PascalCase preference names.
#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(rename = "JSONURL")]
    json_url: Option<String>,
    #[serde(rename = "HashCheckPolicy")]
    hash_check_policy: Option<HashCheckPolicy>,
    #[serde(rename = "InstallPath")]
    install_path: Option<PathBuf>,
    #[serde(rename = "Identifier")]
    identifier: Option<String>,
    #[serde(rename = "LaunchDaemonIdentifier")]
    launch_daemon_identifier: Option<String>,
    #[serde(rename = "LaunchAgentIdentifier")]
    launch_agent_identifier: Option<String>,
    #[serde(rename = "MinDownloadConcurrency")]
    min_download_concurrency: Option<usize>,
    #[serde(rename = "MaxDownloadConcurrency")]
    max_download_concurrency: Option<usize>,
    #[serde(rename = "MaximumRedownloads")]
    maximum_redownloads: Option<u32>,
    #[serde(rename = "SkipJSONValidation")]
    skip_json_validation: Option<bool>,
    #[serde(rename = "WaitForAgentTimeout")]
    wait_for_agent_timeout: Option<u64>,
    #[serde(rename = "DryRun")]
    dry_run: Option<bool>,
    #[serde(rename = "HTTPAuthUser")]
    http_auth_user: Option<String>,
    #[serde(rename = "HTTPAuthPassword")]
    http_auth_password: Option<String>,
    #[serde(rename = "DaemonEndpoint")]
    daemon_endpoint: Option<String>,
    #[serde(rename = "ManifestPublicKey")]
    manifest_public_key: Option<String>,
    #[serde(rename = "DEPNotifyEnable")]
    depnotify_enable: Option<bool>,
    #[serde(rename = "DEPNotifyControlFile")]
    depnotify_control_file: Option<PathBuf>,
    #[serde(rename = "DEPNotifyDeterminate")]
    depnotify_determinate: Option<bool>,
    #[serde(rename = "InstallerPath")]
    installer_path: Option<PathBuf>,
    #[serde(rename = "PkgutilPath")]
    pkgutil_path: Option<PathBuf>,
    #[serde(rename = "LaunchctlPath")]
    launchctl_path: Option<PathBuf>,
    #[serde(rename = "UnloadAgentOnExit")]
    unload_agent_on_exit: Option<bool>,
}

impl Settings {
    /// Load settings: built-in defaults, then the YAML file (if it exists), then
    /// `IAS_*` environment overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut settings = Self::default();
        if let Some(path) = config_path {
            if path.exists() {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config '{}'", path.display()))?;
                settings
                    .merge_yaml(&raw)
                    .with_context(|| format!("failed to parse config '{}'", path.display()))?;
            }
        }
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Overlay values present in a YAML document.
    pub fn merge_yaml(&mut self, raw: &str) -> Result<()> {
        if raw.trim().is_empty() {
            return Ok(());
        }
        let file: SettingsFile = serde_yaml::from_str(raw)?;
        self.merge_file(file);
        Ok(())
    }

    fn merge_file(&mut self, file: SettingsFile) {
        if let Some(v) = file.json_url {
            self.manifest_url = Some(v);
        }
        if let Some(v) = file.hash_check_policy {
            self.hash_check_policy = v;
        }
        if let Some(v) = file.install_path {
            self.install_path = v;
        }
        if let Some(v) = file.identifier {
            self.identifier = v;
        }
        if let Some(v) = file.launch_daemon_identifier {
            self.launch_daemon_identifier = v;
        }
        if let Some(v) = file.launch_agent_identifier {
            self.launch_agent_identifier = v;
        }
        if let Some(v) = file.min_download_concurrency {
            self.min_download_concurrency = v;
        }
        if let Some(v) = file.max_download_concurrency {
            self.max_download_concurrency = v;
        }
        if let Some(v) = file.maximum_redownloads {
            self.maximum_redownloads = v;
        }
        if let Some(v) = file.skip_json_validation {
            self.skip_json_validation = v;
        }
        if let Some(v) = file.wait_for_agent_timeout {
            self.wait_for_agent_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.dry_run {
            self.dry_run = v;
        }
        self.set_auth(file.http_auth_user, file.http_auth_password);
        if let Some(v) = file.daemon_endpoint {
            self.daemon_endpoint = v;
        }
        if let Some(v) = file.manifest_public_key {
            self.manifest_public_key = Some(v);
        }
        if let Some(v) = file.depnotify_enable {
            self.depnotify.enabled = v;
        }
        if let Some(v) = file.depnotify_control_file {
            self.depnotify.control_file = v;
        }
        if let Some(v) = file.depnotify_determinate {
            self.depnotify.determinate = v;
        }
        if let Some(v) = file.installer_path {
            self.installer_path = v;
        }
        if let Some(v) = file.pkgutil_path {
            self.pkgutil_path = v;
        }
        if let Some(v) = file.launchctl_path {
            self.launchctl_path = v;
        }
        if let Some(v) = file.unload_agent_on_exit {
            self.unload_agent_on_exit = v;
        }
    }

    /// Apply `IAS_*` overrides. `lookup` is `std::env::var` in production and a
    /// map in tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("IAS_JSONURL") {
            self.manifest_url = Some(v);
        }
        if let Some(v) = lookup("IAS_HASH_CHECK_POLICY") {
            self.hash_check_policy = v.parse()?;
        }
        if let Some(v) = lookup("IAS_INSTALL_PATH") {
            self.install_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("IAS_LAUNCH_AGENT_IDENTIFIER") {
            self.launch_agent_identifier = v;
        }
        if let Some(v) = lookup("IAS_MIN_DOWNLOAD_CONCURRENCY") {
            self.min_download_concurrency = parse_env("IAS_MIN_DOWNLOAD_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("IAS_MAX_DOWNLOAD_CONCURRENCY") {
            self.max_download_concurrency = parse_env("IAS_MAX_DOWNLOAD_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("IAS_MAXIMUM_REDOWNLOADS") {
            self.maximum_redownloads = parse_env("IAS_MAXIMUM_REDOWNLOADS", &v)?;
        }
        if let Some(v) = lookup("IAS_SKIP_JSON_VALIDATION") {
            self.skip_json_validation = parse_bool("IAS_SKIP_JSON_VALIDATION", &v)?;
        }
        if let Some(v) = lookup("IAS_WAIT_FOR_AGENT_TIMEOUT") {
            let secs: u64 = parse_env("IAS_WAIT_FOR_AGENT_TIMEOUT", &v)?;
            self.wait_for_agent_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = lookup("IAS_DRY_RUN") {
            self.dry_run = parse_bool("IAS_DRY_RUN", &v)?;
        }
        self.set_auth(lookup("IAS_HTTP_AUTH_USER"), lookup("IAS_HTTP_AUTH_PASSWORD"));
        if let Some(v) = lookup("IAS_DAEMON_ENDPOINT") {
            self.daemon_endpoint = v;
        }
        if let Some(v) = lookup("IAS_MANIFEST_PUBLIC_KEY") {
            self.manifest_public_key = Some(v);
        }
        if let Some(v) = lookup("IAS_DEPNOTIFY_ENABLE") {
            self.depnotify.enabled = parse_bool("IAS_DEPNOTIFY_ENABLE", &v)?;
        }
        Ok(())
    }

    // A lone user or password keeps whatever the other layer provided.
    fn set_auth(&mut self, user: Option<String>, password: Option<String>) {
        if user.is_none() && password.is_none() {
            return;
        }
        let current = self.http_auth.take().unwrap_or(BasicAuth {
            user: String::new(),
            password: String::new(),
        });
        self.http_auth = Some(BasicAuth {
            user: user.unwrap_or(current.user),
            password: password.unwrap_or(current.password),
        });
    }

    pub fn validate(&self) -> Result<()> {
        match self.manifest_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {}
            _ => return Err(anyhow!("JSONURL is required")),
        }
        if self.min_download_concurrency == 0 {
            return Err(anyhow!("MinDownloadConcurrency must be >= 1"));
        }
        if self.max_download_concurrency < self.min_download_concurrency {
            return Err(anyhow!(
                "MaxDownloadConcurrency ({}) must be >= MinDownloadConcurrency ({})",
                self.max_download_concurrency,
                self.min_download_concurrency
            ));
        }
        Ok(())
    }

    pub fn userscripts_path(&self) -> PathBuf {
        self.install_path.join("userscripts")
    }

    /// One-line summary for the startup log. Credentials are never included.
    pub fn summary(&self) -> String {
        format!(
            "manifest_url={} hash_check_policy={} install_path={} concurrency={}..{} redownloads={} dry_run={} auth={} signed_manifest={}",
            self.manifest_url.as_deref().unwrap_or("<unset>"),
            self.hash_check_policy,
            self.install_path.display(),
            self.min_download_concurrency,
            self.max_download_concurrency,
            self.maximum_redownloads,
            self.dry_run,
            if self.http_auth.is_some() { "<redacted>" } else { "none" },
            self.manifest_public_key.is_some(),
        )
    }
}

fn parse_env<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err| anyhow!("invalid value '{raw}' for {key}: {err}"))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(anyhow!("invalid boolean '{raw}' for {key}")),
    }
}
