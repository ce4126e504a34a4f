use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
};

use crate::{
    core::config::ServerConfig,
    error::{ErrorKind, ProvisionError},
    LEGACY_VERSION,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Linux,
    Windows,
    Unknown,
}

/// Package managers in the order they are probed for
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Yay,
    Paru,
    Pacman,
    Apt,
    Dnf,
    Winget,
    Choco,
    Unknown,
}

impl PackageManager {
    pub const CANDIDATES: [PackageManager; 7] = [
        Self::Yay,
        Self::Paru,
        Self::Pacman,
        Self::Apt,
        Self::Dnf,
        Self::Winget,
        Self::Choco,
    ];

    /// Name of the executable on `PATH`
    pub fn command(&self) -> &'static str {
        match self {
            Self::Yay => "yay",
            Self::Paru => "paru",
            Self::Pacman => "pacman",
            Self::Apt => "apt",
            Self::Dnf => "dnf",
            Self::Winget => "winget",
            Self::Choco => "choco",
            Self::Unknown => "unknown",
        }
    }
}

/// What the host looks like. Computed once per run and never mutated.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PlatformProfile {
    pub os_family: OsFamily,
    pub distribution_id: Option<String>,
    pub architecture: String,
    /// Never empty, holds `[Unknown]` when nothing was found
    pub package_managers: Vec<PackageManager>,
}

impl PlatformProfile {
    pub fn has_manager(&self, pm: PackageManager) -> bool {
        self.package_managers.contains(&pm)
    }

    pub fn is_linux(&self) -> bool {
        self.os_family == OsFamily::Linux
    }

    pub fn is_windows(&self) -> bool {
        self.os_family == OsFamily::Windows
    }
}

impl Display for PlatformProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let managers = self
            .package_managers
            .iter()
            .map(|pm| pm.command())
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(f, "OS: {:?}", self.os_family)?;
        writeln!(f, "Architecture: {}", self.architecture)?;
        if let Some(distro) = &self.distribution_id {
            writeln!(f, "Distribution: {distro}")?;
        }
        write!(f, "Package Managers: {managers}")
    }
}

/// Where the server goes and which fetch tool drives it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallTarget {
    pub root_directory: PathBuf,
    pub fetch_tool_path: PathBuf,
}

impl InstallTarget {
    pub fn new(root_directory: impl Into<PathBuf>, fetch_tool_path: impl Into<PathBuf>) -> Self {
        Self {
            root_directory: root_directory.into(),
            fetch_tool_path: fetch_tool_path.into(),
        }
    }

    pub fn layout(&self) -> ServerLayout {
        ServerLayout::new(&self.root_directory)
    }
}

/// Fixed directory layout of an installed server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLayout {
    root: PathBuf,
}

impl ServerLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn game_dir(&self) -> PathBuf {
        self.root.join("csgo")
    }

    pub fn addons_dir(&self) -> PathBuf {
        self.game_dir().join("addons")
    }

    pub fn metamod_dir(&self) -> PathBuf {
        self.addons_dir().join("metamod")
    }

    pub fn sourcemod_dir(&self) -> PathBuf {
        self.addons_dir().join("sourcemod")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.sourcemod_dir().join("plugins")
    }

    pub fn cfg_dir(&self) -> PathBuf {
        self.game_dir().join("cfg")
    }

    pub fn steam_inf(&self) -> PathBuf {
        self.game_dir().join("steam.inf")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    /// The dedicated server executable for the given platform
    pub fn entry_point(&self, os: OsFamily) -> PathBuf {
        match os {
            OsFamily::Windows => self.root.join("srcds.exe"),
            _ => self.root.join("srcds_run"),
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detect,
    FetchTool,
    InstallDirectory,
    Authenticate,
    ServerPayload,
    BaseLoader,
    ScriptingLayer,
    Plugin,
    Config,
    VersionDescriptor,
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Detect => "system detection",
            Self::FetchTool => "SteamCMD installation",
            Self::InstallDirectory => "install directory configuration",
            Self::Authenticate => "Steam login",
            Self::ServerPayload => "server download",
            Self::BaseLoader => "Metamod:Source installation",
            Self::ScriptingLayer => "SourceMod installation",
            Self::Plugin => "plugin installation",
            Self::Config => "server.cfg generation",
            Self::VersionDescriptor => "steam.inf patch",
        };
        f.write_str(name)
    }
}

/// Outcome of one stage. Stages never return `Err` to their caller, they
/// report through this instead.
#[derive(Debug)]
pub struct StageResult {
    pub stage: Stage,
    pub succeeded: bool,
    pub skipped: bool,
    pub error: Option<ProvisionError>,
}

impl StageResult {
    pub fn success(stage: Stage) -> Self {
        Self {
            stage,
            succeeded: true,
            skipped: false,
            error: None,
        }
    }

    pub fn skipped(stage: Stage) -> Self {
        Self {
            stage,
            succeeded: true,
            skipped: true,
            error: None,
        }
    }

    pub fn failure(stage: Stage, error: ProvisionError) -> Self {
        Self {
            stage,
            succeeded: false,
            skipped: false,
            error: Some(error),
        }
    }

    pub fn from_result(stage: Stage, res: Result<(), ProvisionError>) -> Self {
        match res {
            Ok(()) => Self::success(stage),
            Err(e) => Self::failure(stage, e),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(ProvisionError::kind)
    }

    /// One line naming the stage and, on failure, the cause
    pub fn summary(&self) -> String {
        match (&self.error, self.skipped) {
            (Some(e), _) => format!("{} failed: {e}", self.stage),
            (None, true) => format!("{} skipped", self.stage),
            (None, false) => format!("{} succeeded", self.stage),
        }
    }
}

#[derive(Serialize)]
pub(crate) struct StageReport {
    stage: Stage,
    succeeded: bool,
    skipped: bool,
    error_kind: Option<ErrorKind>,
    error: Option<String>,
}

impl From<&StageResult> for StageReport {
    fn from(value: &StageResult) -> Self {
        Self {
            stage: value.stage,
            succeeded: value.succeeded,
            skipped: value.skipped,
            error_kind: value.error_kind(),
            error: value.error.as_ref().map(ToString::to_string),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    /// Only used for the first session on a machine
    #[serde(default)]
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Login {
    #[serde(flatten)]
    pub credentials: Credentials,
    #[serde(default)]
    pub first_session: bool,
}

/// Stages the caller already knows to be done
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct SkipStages {
    pub fetch_tool: bool,
    pub server: bool,
    pub mod_loaders: bool,
    pub config: bool,
}

fn default_true() -> bool {
    true
}

fn default_version() -> String {
    LEGACY_VERSION.to_string()
}

/// Description of a provisioning run, usually read from a JSON5 file
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub install_dir: PathBuf,
    #[serde(default)]
    pub fetch_tool_dir: Option<PathBuf>,
    pub login: Login,
    #[serde(default = "default_true")]
    pub validate: bool,
    #[serde(default)]
    pub force_mod_loaders: bool,
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub server_config: ServerConfig,
    #[serde(default = "default_version")]
    pub legacy_version: String,
    #[serde(default)]
    pub skip: SkipStages,
}

impl Environment {
    pub fn from_json5(raw: &str) -> Result<Self, ProvisionError> {
        Ok(json5::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProvisionError> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_json5(&raw)
    }
}
