use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Package,
    RootScript,
    UserScript,
    #[default]
    Unknown,
}

impl ItemKind {
    fn from_manifest(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "package" => Self::Package,
            "rootscript" => Self::RootScript,
            "userscript" => Self::UserScript,
            _ => Self::Unknown,
        }
    }
}

impl<'de> Deserialize<'de> for ItemKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(Self::from_manifest).unwrap_or_default())
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Package => "package",
            Self::RootScript => "rootscript",
            Self::UserScript => "userscript",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Per-item tolerance for failure. Unrecognized values fall back to
/// `FailableExecution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    Failable,
    #[default]
    FailableExecution,
    FailureIsNotAnOption,
}

impl FailPolicy {
    fn from_manifest(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "failable" => Self::Failable,
            "failure_is_not_an_option" => Self::FailureIsNotAnOption,
            _ => Self::FailableExecution,
        }
    }

    pub fn tolerates_download_failure(self) -> bool {
        matches!(self, Self::Failable)
    }

    pub fn tolerates_execution_failure(self) -> bool {
        matches!(self, Self::Failable | Self::FailableExecution)
    }
}

impl<'de> Deserialize<'de> for FailPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(Self::from_manifest).unwrap_or_default())
    }
}

impl fmt::Display for FailPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Failable => "failable",
            Self::FailableExecution => "failable_execution",
            Self::FailureIsNotAnOption => "failure_is_not_an_option",
        };
        f.write_str(name)
    }
}

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSpec {
    pub name: String,
    pub file: PathBuf,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: ItemKind,
    #[serde(default)]
    pub packageid: Option<String>,
    #[serde(default)]
    pub pkg_required: bool,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub fail_policy: FailPolicy,
    #[serde(default)]
    pub donotwait: bool,
    #[serde(default)]
    pub version: Option<String>,
}

impl ItemSpec {
    /// Empty tags are treated as untagged.
    pub fn group(&self) -> Option<&str> {
        self.parallel_group
            .as_deref()
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSpec {
    pub alg: String,
    pub key_id: String,
    #[serde(default)]
    pub public_key_b64: Option<String>,
    pub sig_b64: String,
}

/// The control manifest: three optional ordered item lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight: Option<Vec<ItemSpec>>,
    #[serde(
        default,
        alias = "setup-assistant",
        skip_serializing_if = "Option::is_none"
    )]
    pub setupassistant: Option<Vec<ItemSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userland: Option<Vec<ItemSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureSpec>,
}

impl Manifest {
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).context("failed to parse control manifest JSON")
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw = fs::read(path)
            .with_context(|| format!("failed to read manifest '{}'", path.display()))?;
        Self::from_slice(&raw).with_context(|| format!("invalid manifest '{}'", path.display()))
    }

    pub fn items(&self, phase: PhaseKind) -> &[ItemSpec] {
        let list = match phase {
            PhaseKind::Preflight => &self.preflight,
            PhaseKind::SetupAssistant => &self.setupassistant,
            PhaseKind::Userland => &self.userland,
        };
        list.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseKind {
    Preflight,
    SetupAssistant,
    Userland,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 3] = [Self::Preflight, Self::SetupAssistant, Self::Userland];

    /// Item kinds a phase is allowed to run.
    pub fn accepts(self, kind: ItemKind) -> bool {
        match self {
            Self::Preflight => matches!(kind, ItemKind::RootScript),
            Self::SetupAssistant => matches!(kind, ItemKind::Package | ItemKind::RootScript),
            Self::Userland => matches!(
                kind,
                ItemKind::Package | ItemKind::RootScript | ItemKind::UserScript
            ),
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Preflight => "preflight",
            Self::SetupAssistant => "setupassistant",
            Self::Userland => "userland",
        };
        f.write_str(name)
    }
}
