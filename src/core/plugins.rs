use std::{
    ffi::OsStr,
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use lazy_static::lazy_static;
use regex::Regex;
use tempfile::TempDir;
use tracing::trace;

use crate::{
    api::{self, HttpTransport, SharedTransport},
    core::{
        archive::{self, ArchiveFormat},
        utils,
    },
    error::{PathContext, ProvisionError},
    log::{Sink, SinkExt},
    model::{ServerLayout, Stage, StageResult},
};

const CLONE_TIMEOUT: Duration = Duration::from_secs(60);
const DISABLED_SUFFIX: &str = ".disabled";

lazy_static! {
    static ref REMOTE_PATTERNS: [Regex; 3] = [
        Regex::new(r"^https?://github\.com/[\w-]+/[\w.-]+/?").expect("https pattern"),
        Regex::new(r"^git@github\.com:[\w-]+/[\w.-]+\.git").expect("ssh pattern"),
        Regex::new(r"^github\.com/[\w-]+/[\w.-]+").expect("bare pattern"),
    ];
}

/// Where a plugin comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    /// Normalized clone URL
    Remote(String),
    /// Direct link to a `.smx` file or a `.zip` holding an `addons/` tree
    Download(String),
    Local(PathBuf),
}

impl PluginSource {
    /// GitHub references become [`PluginSource::Remote`], other `http(s)`
    /// links to a `.smx` or `.zip` become [`PluginSource::Download`], and
    /// anything else is taken as a local directory
    pub fn classify(raw: &str) -> Self {
        let raw = raw.trim();
        if REMOTE_PATTERNS.iter().any(|re| re.is_match(raw)) {
            Self::Remote(normalize_remote(raw))
        } else if is_direct_download(raw) {
            Self::Download(raw.to_string())
        } else {
            Self::Local(utils::expand_home(raw))
        }
    }

    /// Short name for log output
    pub fn name(&self) -> String {
        match self {
            Self::Remote(url) => url.rsplit('/').next().unwrap_or(url.as_str()).to_string(),
            Self::Download(url) => url_file_name(url).to_string(),
            Self::Local(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        }
    }
}

impl Display for PluginSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(url) | Self::Download(url) => write!(f, "{url}"),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

pub fn normalize_remote(raw: &str) -> String {
    let url = raw.trim().trim_end_matches('/');
    let url = url.strip_suffix(".git").unwrap_or(url);
    if ["http://", "https://", "git@"]
        .iter()
        .any(|p| url.starts_with(p))
    {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

/// Last path segment of `url`, without query or fragment
fn url_file_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

fn is_direct_download(raw: &str) -> bool {
    let name = url_file_name(raw);
    (raw.starts_with("http://") || raw.starts_with("https://"))
        && (name.ends_with(".smx") || name.ends_with(".zip"))
}

fn plugin_file_name(name: &str) -> String {
    if name.ends_with(".smx") {
        name.to_string()
    } else {
        format!("{name}.smx")
    }
}

/// Installs and manages SourceMod plugins in one server tree
pub struct PluginAcquirer {
    layout: ServerLayout,
    git: PathBuf,
    transport: SharedTransport,
    staging_root: Option<PathBuf>,
    timeout: Duration,
    sink: Sink,
}

impl PluginAcquirer {
    pub fn new(root: impl AsRef<Path>, sink: Sink) -> Self {
        Self {
            layout: ServerLayout::new(root),
            git: PathBuf::from("git"),
            transport: HttpTransport::shared(),
            staging_root: None,
            timeout: CLONE_TIMEOUT,
            sink,
        }
    }

    pub fn with_git(mut self, git: impl Into<PathBuf>) -> Self {
        self.git = git.into();
        self
    }

    pub fn with_transport(mut self, transport: SharedTransport) -> Self {
        self.transport = transport;
        self
    }

    /// Parent directory for staging, the system temp dir by default
    pub fn with_staging_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Classify `raw` and install it
    pub fn install(&self, raw: &str) -> StageResult {
        self.acquire(&PluginSource::classify(raw))
    }

    /// Download a `.smx` into the plugins directory, or a `.zip` whose
    /// `addons/` tree is merged like a cloned plugin
    pub fn install_from_url(&self, url: &str) -> StageResult {
        self.acquire(&PluginSource::Download(url.trim().to_string()))
    }

    pub fn acquire(&self, source: &PluginSource) -> StageResult {
        self.sink.section(format!("Installing plugin {}", source.name()));
        let res = self.try_acquire(source);
        if let Err(e) = &res {
            self.sink.error(format!("Failed to install plugin: {e}"));
        }
        StageResult::from_result(Stage::Plugin, res)
    }

    /// Removed on drop, whichever way the caller returns
    fn staging(&self) -> Result<TempDir, ProvisionError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("plugin-");
        match &self.staging_root {
            Some(root) => builder.tempdir_in(root).at(root),
            None => Ok(builder.tempdir()?),
        }
    }

    fn try_acquire(&self, source: &PluginSource) -> Result<(), ProvisionError> {
        let sourcemod = self.layout.sourcemod_dir();
        if !sourcemod.is_dir() {
            return Err(ProvisionError::precondition(
                "SourceMod is not installed, install it before adding plugins",
            ));
        }

        match source {
            PluginSource::Remote(url) => {
                let staging = self.staging()?;
                let tree = staging.path().join("repo");

                self.sink.info(format!("Cloning {url}..."));
                let mut cmd = Command::new(&self.git);
                cmd.args(["clone", "--depth", "1", url]).arg(&tree);
                utils::run_with_timeout(&mut cmd, "git", self.timeout)?;
                self.sink.success("Clone complete");

                self.merge(&tree, &source.name())
            }
            PluginSource::Download(url) => self.download(url),
            PluginSource::Local(path) => {
                if !path.is_dir() {
                    return Err(ProvisionError::precondition(format!(
                        "Plugin directory not found: {}",
                        path.display()
                    )));
                }
                self.merge(path, &source.name())
            }
        }
    }

    fn download(&self, url: &str) -> Result<(), ProvisionError> {
        let name = url_file_name(url);
        // a bare segment only, so the download cannot land outside staging
        if Path::new(name).file_name() != Some(OsStr::new(name)) {
            return Err(ProvisionError::precondition(format!(
                "No plugin file name in {url}"
            )));
        }

        let staging = self.staging()?;
        let path = staging.path().join(name);
        self.sink.info(format!("Downloading plugin: {name}"));
        let file = api::download_file(&*self.transport, url, &path)?;
        self.sink.success(format!("Downloaded: {name}"));

        if name.ends_with(".zip") {
            self.sink.info("Extracting plugin archive...");
            let unpacked = staging.path().join("unpacked");
            archive::extract(file, ArchiveFormat::Zip, &unpacked)?;
            return self.merge(&unpacked, name);
        }

        let plugins = self.layout.plugins_dir();
        fs::create_dir_all(&plugins).at(&plugins)?;
        let dest = plugins.join(plugin_file_name(name));
        utils::copy_file(&path, &dest)?;
        self.sink
            .success(format!("Plugin installed: {}", dest.display()));
        Ok(())
    }

    fn merge(&self, tree: &Path, name: &str) -> Result<(), ProvisionError> {
        let addons = tree.join("addons");
        if !addons.is_dir() {
            return Err(ProvisionError::StructuralValidation(format!(
                "Plugin {name} is missing its 'addons' folder"
            )));
        }

        self.sink.info(format!("Installing plugin from {name}"));
        let merged = utils::merge_tree(&addons, &self.layout.addons_dir(), &[])?;
        for rel in &merged.copied {
            trace!("Copied {}", rel.display());
            self.sink.debug(format!("Copied: {}", rel.display()));
        }
        for rel in &merged.skipped_links {
            self.sink
                .warning(format!("Skipped symlink in plugin: addons/{}", rel.display()));
        }
        self.sink.success(format!(
            "Plugin installed from {name} ({} files)",
            merged.copied.len()
        ));
        Ok(())
    }

    /// Enabled plugin file names, sorted
    pub fn list_installed(&self) -> Result<Vec<String>, ProvisionError> {
        let dir = self.layout.plugins_dir();
        if !dir.is_dir() {
            return Ok(vec![]);
        }

        let mut plugins = vec![];
        for entry in dir.read_dir().at(&dir)? {
            let entry = entry.at(&dir)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".smx") && entry.path().is_file() {
                plugins.push(name);
            }
        }
        plugins.sort();
        Ok(plugins)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), ProvisionError> {
        if !from.is_file() {
            return Err(ProvisionError::precondition(format!(
                "Plugin not found: {}",
                from.display()
            )));
        }
        fs::rename(from, to).at(from)
    }

    /// Rename `name` to `name.smx.disabled` so SourceMod skips it
    pub fn disable(&self, name: &str) -> Result<(), ProvisionError> {
        let file = plugin_file_name(name);
        let dir = self.layout.plugins_dir();
        self.rename(&dir.join(&file), &dir.join(format!("{file}{DISABLED_SUFFIX}")))?;
        self.sink.success(format!("Disabled plugin: {file}"));
        Ok(())
    }

    pub fn enable(&self, name: &str) -> Result<(), ProvisionError> {
        let file = plugin_file_name(name);
        let dir = self.layout.plugins_dir();
        self.rename(&dir.join(format!("{file}{DISABLED_SUFFIX}")), &dir.join(&file))?;
        self.sink.success(format!("Enabled plugin: {file}"));
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<(), ProvisionError> {
        let file = plugin_file_name(name);
        let path = self.layout.plugins_dir().join(&file);
        if !path.is_file() {
            return Err(ProvisionError::precondition(format!(
                "Plugin not found: {file}"
            )));
        }
        fs::remove_file(&path).at(&path)?;
        self.sink.success(format!("Removed plugin: {file}"));
        Ok(())
    }
}
