use std::{
    fs,
    path::{Path, PathBuf},
};

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{PathContext, ProvisionError},
    log::{Sink, SinkExt},
    model::{OsFamily, ServerLayout, Stage, StageResult},
};

const SERVER_CFG_TEMPLATE: &str = include_str!("templates/server.cfg");

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{(hostname|sv_password|rcon_password|tickrate)\}").expect("placeholder pattern");
}

/// Keys in `steam.inf` that pin the protocol version
const VERSION_KEYS: [&str; 2] = ["ClientVersion", "ServerVersion"];

/// Values substituted into the generated `server.cfg`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub hostname: String,
    pub rcon_password: String,
    /// Empty for a public server
    pub sv_password: String,
    pub tickrate: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "VileHvH Server".into(),
            rcon_password: "change_me".into(),
            sv_password: String::new(),
            tickrate: 128,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if !matches!(self.tickrate, 64 | 128) {
            return Err(ProvisionError::precondition(format!(
                "tickrate must be 64 or 128, got {}",
                self.tickrate
            )));
        }
        // each value sits inside one quoted cvar line
        for (field, value) in [
            ("hostname", &self.hostname),
            ("sv_password", &self.sv_password),
            ("rcon_password", &self.rcon_password),
        ] {
            if value.contains(['"', '\n', '\r']) {
                return Err(ProvisionError::precondition(format!(
                    "{field} must not contain quotes or line breaks"
                )));
            }
        }
        Ok(())
    }

    /// Fill the template in one pass, so substituted values are never
    /// scanned for placeholders themselves
    pub fn render(&self) -> String {
        PLACEHOLDER
            .replace_all(SERVER_CFG_TEMPLATE, |caps: &Captures| match &caps[1] {
                "hostname" => self.hostname.clone(),
                "sv_password" => self.sv_password.clone(),
                "rcon_password" => self.rcon_password.clone(),
                _ => self.tickrate.to_string(),
            })
            .into_owned()
    }
}

/// Command line for starting the server in insecure deathmatch mode
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LaunchOptions {
    pub map: String,
    pub tickrate: u32,
    pub max_players: u32,
    pub port: u16,
    /// Game Server Login Token
    pub gslt: Option<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            map: "de_mirage".into(),
            tickrate: 128,
            max_players: 10,
            port: 27015,
            gslt: None,
        }
    }
}

impl LaunchOptions {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-game".to_string(),
            "csgo".into(),
            "-console".into(),
            "-usercon".into(),
            "-insecure".into(),
            "-tickrate".into(),
            self.tickrate.to_string(),
            "-port".into(),
            self.port.to_string(),
            "-maxplayers_override".into(),
            self.max_players.to_string(),
            "+game_type".into(),
            "1".into(),
            "+game_mode".into(),
            "2".into(),
            "+map".into(),
            self.map.clone(),
        ];
        if let Some(token) = self.gslt.as_deref().filter(|t| !t.is_empty()) {
            args.push("+sv_setsteamaccount".into());
            args.push(token.to_string());
        }
        args
    }

    pub fn render(&self, entry_point: &Path) -> String {
        let mut out = entry_point.display().to_string();
        for arg in self.args() {
            out.push(' ');
            out.push_str(&arg);
        }
        out
    }
}

/// Rewrite `key=value` lines for every key in `keys`, appending the ones
/// that are missing. Untouched lines keep their exact bytes.
pub fn patch_key_values(raw: &str, keys: &[&str], value: &str) -> (String, Vec<String>) {
    let newline = if raw.contains("\r\n") { "\r\n" } else { "\n" };
    let mut found = vec![false; keys.len()];
    let mut out = String::with_capacity(raw.len() + 64);

    for line in raw.split_inclusive('\n') {
        let body = line.trim_end_matches(['\r', '\n']);
        let ending = &line[body.len()..];
        let hit = keys
            .iter()
            .position(|k| body.strip_prefix(*k).is_some_and(|rest| rest.starts_with('=')));
        match hit {
            Some(i) => {
                debug!("Rewriting {} (was {})", keys[i], body);
                found[i] = true;
                out.push_str(keys[i]);
                out.push('=');
                out.push_str(value);
                out.push_str(ending);
            }
            None => out.push_str(line),
        }
    }

    let mut appended = vec![];
    for (key, _) in keys.iter().zip(&found).filter(|(_, f)| !**f) {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push_str(newline);
        }
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push_str(newline);
        appended.push(key.to_string());
    }
    (out, appended)
}

fn backup_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.backup", path.display()))
}

/// Writes `server.cfg` and patches `steam.inf`, keeping a backup of the
/// previous content each time
pub struct ConfigMutator {
    layout: ServerLayout,
    sink: Sink,
}

impl ConfigMutator {
    pub fn new(root: impl AsRef<Path>, sink: Sink) -> Self {
        Self {
            layout: ServerLayout::new(root),
            sink,
        }
    }

    pub fn server_cfg(&self) -> PathBuf {
        self.layout.cfg_dir().join("server.cfg")
    }

    fn backup(&self, path: &Path) -> Result<PathBuf, ProvisionError> {
        let backup = backup_path(path);
        fs::copy(path, &backup).at(&backup)?;
        Ok(backup)
    }

    /// Replace `server.cfg` with `document`
    pub fn write_config(&self, document: &str) -> StageResult {
        let res = self.try_write_config(document);
        if let Err(e) = &res {
            self.sink.error(format!("Failed to create config: {e}"));
        }
        StageResult::from_result(Stage::Config, res)
    }

    fn try_write_config(&self, document: &str) -> Result<(), ProvisionError> {
        let cfg_dir = self.layout.cfg_dir();
        fs::create_dir_all(&cfg_dir).at(&cfg_dir)?;

        let path = self.server_cfg();
        if path.exists() {
            let backup = self.backup(&path)?;
            self.sink.info(format!(
                "Backed up existing config to: {}",
                backup.display()
            ));
        }
        fs::write(&path, document).at(&path)?;
        self.sink
            .success(format!("Server config written: {}", path.display()));
        Ok(())
    }

    /// Render `config` and write it as `server.cfg`
    pub fn write_server_config(&self, config: &ServerConfig) -> StageResult {
        self.sink.section("Creating HvH server configuration");
        if let Err(e) = config.validate() {
            self.sink.error(format!("Invalid server config: {e}"));
            return StageResult::failure(Stage::Config, e);
        }
        self.write_config(&config.render())
    }

    /// Pin both version keys in `steam.inf` to `target`
    pub fn patch_version_descriptor(&self, target: &str) -> StageResult {
        self.sink
            .info(format!("Setting CS:GO Legacy version {target} in steam.inf"));
        let res = self.try_patch(target);
        if let Err(e) = &res {
            self.sink.error(format!("Failed to modify steam.inf: {e}"));
        }
        StageResult::from_result(Stage::VersionDescriptor, res)
    }

    fn try_patch(&self, target: &str) -> Result<(), ProvisionError> {
        let path = self.layout.steam_inf();
        if !path.is_file() {
            return Err(ProvisionError::precondition(format!(
                "steam.inf not found: {}",
                path.display()
            )));
        }

        let raw = fs::read_to_string(&path).at(&path)?;
        let backup = self.backup(&path)?;
        self.sink
            .debug(format!("Backed up steam.inf to: {}", backup.display()));

        let (patched, appended) = patch_key_values(&raw, &VERSION_KEYS, target);
        for key in appended {
            self.sink
                .warning(format!("{key} not found, appended it"));
        }
        fs::write(&path, patched).at(&path)?;

        self.sink.success("steam.inf configured for CS:GO Legacy");
        for key in VERSION_KEYS {
            self.sink.info(format!("  {key}: {target}"));
        }
        Ok(())
    }

    /// Store the Game Server Login Token at `csgo/gslt.txt`
    pub fn save_gslt(&self, token: &str) -> Result<PathBuf, ProvisionError> {
        let game_dir = self.layout.game_dir();
        fs::create_dir_all(&game_dir).at(&game_dir)?;
        let path = game_dir.join("gslt.txt");
        fs::write(&path, token).at(&path)?;
        self.sink
            .success(format!("GSLT saved to: {}", path.display()));
        Ok(path)
    }

    /// Launch command for the installed entry point
    pub fn launch_command(&self, options: &LaunchOptions, os: OsFamily) -> String {
        options.render(&self.layout.entry_point(os))
    }
}
