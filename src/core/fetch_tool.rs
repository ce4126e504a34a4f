use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use tracing::debug;

use crate::{
    api::{self, HttpTransport, SharedTransport},
    core::{
        archive::{self, ArchiveFormat},
        utils,
    },
    error::{PathContext, ProvisionError},
    log::{Sink, SinkExt},
    model::{OsFamily, PackageManager, PlatformProfile, Stage, StageResult},
};

/// How SteamCMD gets onto the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// AUR helper, falling back to a manual `makepkg` build
    Aur,
    /// The distribution's `steamcmd` package
    Apt,
    /// Official Linux tarball unpacked into the tool directory
    Generic,
    /// Official zip unpacked into the tool directory
    Windows,
    Unsupported,
}

impl Strategy {
    pub fn select(profile: &PlatformProfile) -> Self {
        match profile.os_family {
            OsFamily::Windows => Self::Windows,
            OsFamily::Unknown => Self::Unsupported,
            OsFamily::Linux => match profile.distribution_id.as_deref() {
                Some("arch" | "manjaro" | "endeavouros") => Self::Aur,
                Some("ubuntu" | "debian" | "linuxmint" | "pop") => Self::Apt,
                // the fedora family has no native package either
                _ => Self::Generic,
            },
        }
    }
}

impl Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Aur => "AUR",
            Self::Apt => "apt",
            Self::Generic => "generic Linux",
            Self::Windows => "Windows",
            Self::Unsupported => "unsupported",
        })
    }
}

pub struct FetchToolInstaller {
    profile: PlatformProfile,
    tool_dir: PathBuf,
    system_paths: Vec<PathBuf>,
    transport: SharedTransport,
    sink: Sink,
}

impl FetchToolInstaller {
    pub fn new(profile: &PlatformProfile, sink: Sink) -> Self {
        let (tool_dir, system_paths) = match profile.os_family {
            OsFamily::Windows => (PathBuf::from("C:/steamcmd"), vec![]),
            _ => (
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("steamcmd"),
                vec![
                    PathBuf::from("/usr/games/steamcmd"),
                    PathBuf::from("/usr/bin/steamcmd"),
                ],
            ),
        };

        Self {
            profile: profile.clone(),
            tool_dir,
            system_paths,
            transport: HttpTransport::shared(),
            sink,
        }
    }

    pub fn with_tool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tool_dir = dir.into();
        self
    }

    /// Locations a package-manager install may have put the binary
    pub fn with_system_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.system_paths = paths;
        self
    }

    pub fn with_transport(mut self, transport: SharedTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn tool_dir(&self) -> &Path {
        &self.tool_dir
    }

    fn executable_name(&self) -> &'static str {
        match self.profile.os_family {
            OsFamily::Windows => "steamcmd.exe",
            _ => "steamcmd.sh",
        }
    }

    pub fn expected_path(&self) -> PathBuf {
        self.tool_dir.join(self.executable_name())
    }

    /// First executable SteamCMD found, probing the binary itself
    pub fn locate(&self) -> Option<PathBuf> {
        std::iter::once(self.expected_path())
            .chain(self.system_paths.iter().cloned())
            .find(|p| utils::is_executable(p))
    }

    pub fn is_installed(&self) -> bool {
        self.locate().is_some()
    }

    /// Path SteamCMD is, or will be, at
    pub fn tool_path(&self) -> PathBuf {
        self.locate().unwrap_or_else(|| self.expected_path())
    }

    pub fn ensure_installed(&self) -> StageResult {
        self.sink.section("Installing SteamCMD");

        if let Some(path) = self.locate() {
            self.sink
                .success(format!("SteamCMD is already installed at {}", path.display()));
            return StageResult::skipped(Stage::FetchTool);
        }

        let strategy = Strategy::select(&self.profile);
        self.sink
            .info(format!("Installing SteamCMD using the {strategy} method"));
        match self.install(strategy) {
            Ok(path) => {
                self.sink
                    .success(format!("SteamCMD installed at {}", path.display()));
                StageResult::success(Stage::FetchTool)
            }
            Err(e) => {
                self.sink.error(format!("Failed to install SteamCMD: {e}"));
                StageResult::failure(Stage::FetchTool, e)
            }
        }
    }

    fn install(&self, strategy: Strategy) -> Result<PathBuf, ProvisionError> {
        let path = match strategy {
            Strategy::Aur => self.install_aur()?,
            Strategy::Apt => self.install_apt()?,
            Strategy::Generic => {
                self.install_archive(api::STEAMCMD_LINUX_URL, ArchiveFormat::TarGz)?
            }
            Strategy::Windows => {
                self.install_archive(api::STEAMCMD_WINDOWS_URL, ArchiveFormat::Zip)?
            }
            Strategy::Unsupported => {
                return Err(ProvisionError::precondition(format!(
                    "Unsupported operating system: {:?}",
                    self.profile.os_family
                )))
            }
        };

        if utils::is_executable(&path) {
            Ok(path)
        } else {
            Err(ProvisionError::StructuralValidation(format!(
                "{} is not an executable file",
                path.display()
            )))
        }
    }

    fn system_install(&self) -> Result<PathBuf, ProvisionError> {
        self.system_paths
            .iter()
            .find(|p| utils::is_executable(p))
            .cloned()
            .ok_or_else(|| {
                ProvisionError::StructuralValidation(
                    "steamcmd package installed but no executable was found".into(),
                )
            })
    }

    fn install_aur(&self) -> Result<PathBuf, ProvisionError> {
        let helper = [PackageManager::Yay, PackageManager::Paru]
            .into_iter()
            .find(|pm| self.profile.has_manager(*pm));

        if let Some(helper) = helper {
            let name = helper.command();
            self.sink.info(format!("Using AUR helper: {name}"));
            match utils::run_interactive(
                Command::new(name).args(["-S", "--noconfirm", "steamcmd"]),
                name,
            ) {
                Ok(()) => return self.system_install(),
                Err(e) => self.sink.error(format!("Failed to install via {name}: {e}")),
            }
        }

        self.sink.info("Building SteamCMD from the AUR");
        if let Err(e) = utils::run_interactive(
            Command::new("sudo").args(["pacman", "-S", "--needed", "--noconfirm", "base-devel"]),
            "pacman",
        ) {
            self.sink
                .warning(format!("Could not ensure base-devel is installed: {e}"));
        }

        let build = tempfile::Builder::new()
            .prefix("steamcmd-aur-")
            .tempdir()?;
        utils::run_captured(
            Command::new("git")
                .args(["clone", api::STEAMCMD_AUR_URL])
                .arg(build.path()),
            "git",
        )?;
        utils::run_interactive(
            Command::new("makepkg")
                .args(["-si", "--noconfirm"])
                .current_dir(build.path()),
            "makepkg",
        )?;

        self.system_install()
    }

    fn install_apt(&self) -> Result<PathBuf, ProvisionError> {
        self.sink.info("Enabling i386 architecture...");
        utils::run_interactive(
            Command::new("sudo").args(["dpkg", "--add-architecture", "i386"]),
            "dpkg",
        )?;

        if self.profile.distribution_id.as_deref() == Some("ubuntu") {
            self.sink.info("Enabling multiverse repository...");
            if let Err(e) = utils::run_interactive(
                Command::new("sudo").args(["add-apt-repository", "-y", "multiverse"]),
                "add-apt-repository",
            ) {
                self.sink
                    .warning(format!("Could not enable multiverse repository: {e}"));
            }
        }

        utils::run_interactive(Command::new("sudo").args(["apt", "update"]), "apt")?;
        utils::run_interactive(
            Command::new("sudo").args(["apt", "install", "-y", "steamcmd"]),
            "apt",
        )?;

        self.system_install()
    }

    /// Unpack next to the final location and move the executable in last, so
    /// a half-finished run never looks installed
    fn install_archive(&self, url: &str, format: ArchiveFormat) -> Result<PathBuf, ProvisionError> {
        fs::create_dir_all(&self.tool_dir).at(&self.tool_dir)?;
        let staging = tempfile::Builder::new()
            .prefix(".steamcmd-")
            .tempdir_in(&self.tool_dir)
            .at(&self.tool_dir)?;

        let archive_path = staging
            .path()
            .join(format!("steamcmd.{}", format.extension()));
        self.sink.info(format!("Downloading SteamCMD from {url}..."));
        let file = api::download_file(&*self.transport, url, &archive_path)?;
        self.sink.success("Download complete");

        self.sink.info("Extracting SteamCMD...");
        let unpacked = staging.path().join("unpacked");
        archive::extract(file, format, &unpacked)?;

        let exe = Path::new(self.executable_name());
        let staged_exe = unpacked.join(exe);
        if !staged_exe.is_file() {
            return Err(ProvisionError::StructuralValidation(format!(
                "archive from {url} does not contain {}",
                exe.display()
            )));
        }
        utils::set_executable(&staged_exe)?;
        utils::commit_staged(&unpacked, &self.tool_dir, &[exe])?;
        debug!("SteamCMD unpacked into {}", self.tool_dir.display());

        Ok(self.expected_path())
    }

    /// Start SteamCMD once so it can finish bootstrapping itself
    pub fn run_initial_update(&self) -> StageResult {
        self.sink.info("Running initial SteamCMD update...");
        let Some(path) = self.locate() else {
            return StageResult::failure(
                Stage::FetchTool,
                ProvisionError::precondition("SteamCMD is not installed"),
            );
        };

        let mut cmd = Command::new(&path);
        cmd.arg("+quit");
        let sink = self.sink.clone();
        let res = utils::run_streaming(&mut cmd, "steamcmd", |line| sink.debug(line));
        match &res {
            Ok(()) => self.sink.success("SteamCMD initial update complete"),
            Err(e) => self.sink.error(format!("Failed to run initial update: {e}")),
        }
        StageResult::from_result(Stage::FetchTool, res)
    }
}

#[cfg(test)]
mod test {
    use std::{fs, path::Path, sync::Arc, time::SystemTime};

    use super::{FetchToolInstaller, Strategy};
    use crate::{
        api::{self, mock::MemoryTransport},
        core::{archive::fixture, utils},
        error::ErrorKind,
        log::MemorySink,
        model::{OsFamily, PackageManager, PlatformProfile},
    };

    fn profile(os: OsFamily, distro: Option<&str>) -> PlatformProfile {
        PlatformProfile {
            os_family: os,
            distribution_id: distro.map(str::to_string),
            architecture: "x86_64".into(),
            package_managers: vec![PackageManager::Unknown],
        }
    }

    fn snapshot(dir: &Path) -> Vec<(String, SystemTime)> {
        let mut out = vec![];
        for entry in fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let meta = entry.metadata().unwrap();
            out.push((
                entry.file_name().to_string_lossy().into_owned(),
                meta.modified().unwrap(),
            ));
            if meta.is_dir() {
                out.extend(snapshot(&entry.path()));
            }
        }
        out.sort();
        out
    }

    #[test]
    fn unrecognised_linux_uses_generic() {
        for distro in [None, Some("gentoo"), Some("nixos"), Some("unknown"), Some("fedora")] {
            assert_eq!(
                Strategy::select(&profile(OsFamily::Linux, distro)),
                Strategy::Generic,
                "{distro:?}"
            );
        }
    }

    #[test]
    fn known_distros_use_packages() {
        for distro in ["arch", "manjaro", "endeavouros"] {
            assert_eq!(
                Strategy::select(&profile(OsFamily::Linux, Some(distro))),
                Strategy::Aur
            );
        }
        for distro in ["ubuntu", "debian", "linuxmint", "pop"] {
            assert_eq!(
                Strategy::select(&profile(OsFamily::Linux, Some(distro))),
                Strategy::Apt
            );
        }
        assert_eq!(
            Strategy::select(&profile(OsFamily::Windows, None)),
            Strategy::Windows
        );
        assert_eq!(
            Strategy::select(&profile(OsFamily::Unknown, None)),
            Strategy::Unsupported
        );
    }

    #[test]
    fn generic_install_then_skip() {
        let dir = tempfile::tempdir().unwrap();
        let body = fixture::tar_gz(&[
            ("steamcmd.sh", "#!/bin/sh\nexit 0\n", 0o644),
            ("linux32/steamcmd", "elf", 0o755),
        ]);
        let transport = Arc::new(MemoryTransport::default().with(api::STEAMCMD_LINUX_URL, body));
        let installer = FetchToolInstaller::new(
            &profile(OsFamily::Linux, Some("gentoo")),
            MemorySink::shared(),
        )
        .with_tool_dir(dir.path())
        .with_system_paths(vec![])
        .with_transport(transport.clone());

        assert!(!installer.is_installed());
        let first = installer.ensure_installed();
        assert!(first.succeeded, "{}", first.summary());
        assert!(!first.skipped);
        assert!(utils::is_executable(dir.path().join("steamcmd.sh")));
        assert!(dir.path().join("linux32/steamcmd").is_file());
        assert_eq!(installer.tool_path(), dir.path().join("steamcmd.sh"));

        let before = snapshot(dir.path());
        let second = installer.ensure_installed();
        assert!(second.succeeded);
        assert!(second.skipped);
        assert_eq!(snapshot(dir.path()), before);
        assert_eq!(transport.requested().len(), 1);
    }

    #[test]
    fn windows_install_from_zip() {
        let dir = tempfile::tempdir().unwrap();
        let body = fixture::zip(&[("steamcmd.exe", "MZ")]);
        let transport = Arc::new(MemoryTransport::default().with(api::STEAMCMD_WINDOWS_URL, body));
        let installer =
            FetchToolInstaller::new(&profile(OsFamily::Windows, None), MemorySink::shared())
                .with_tool_dir(dir.path())
                .with_transport(transport);

        let res = installer.ensure_installed();
        assert!(res.succeeded, "{}", res.summary());
        assert_eq!(installer.tool_path(), dir.path().join("steamcmd.exe"));
    }

    #[test]
    fn download_failure_leaves_nothing_installed() {
        let dir = tempfile::tempdir().unwrap();
        let installer = FetchToolInstaller::new(
            &profile(OsFamily::Linux, None),
            MemorySink::shared(),
        )
        .with_tool_dir(dir.path())
        .with_system_paths(vec![])
        .with_transport(Arc::new(MemoryTransport::default()));

        let res = installer.ensure_installed();
        assert!(!res.succeeded);
        assert_eq!(res.error_kind(), Some(ErrorKind::NetworkFailure));
        assert!(!installer.is_installed());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn archive_without_binary_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let body = fixture::tar_gz(&[("README", "nothing here", 0o644)]);
        let installer = FetchToolInstaller::new(
            &profile(OsFamily::Linux, None),
            MemorySink::shared(),
        )
        .with_tool_dir(dir.path())
        .with_system_paths(vec![])
        .with_transport(Arc::new(
            MemoryTransport::default().with(api::STEAMCMD_LINUX_URL, body),
        ));

        let res = installer.ensure_installed();
        assert_eq!(
            res.error_kind(),
            Some(ErrorKind::StructuralValidationFailure)
        );
        assert!(!installer.is_installed());
    }

    #[test]
    fn directory_alone_is_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("steamcmd.sh")).unwrap();
        let installer = FetchToolInstaller::new(
            &profile(OsFamily::Linux, None),
            MemorySink::shared(),
        )
        .with_tool_dir(dir.path())
        .with_system_paths(vec![]);
        assert!(!installer.is_installed());
    }

    #[test]
    fn unsupported_os_fails() {
        let dir = tempfile::tempdir().unwrap();
        let installer =
            FetchToolInstaller::new(&profile(OsFamily::Unknown, None), MemorySink::shared())
                .with_tool_dir(dir.path())
                .with_system_paths(vec![]);
        let res = installer.ensure_installed();
        assert_eq!(res.error_kind(), Some(ErrorKind::PreconditionNotMet));
    }
}
