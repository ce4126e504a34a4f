use std::{
    fmt::{self, Display},
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
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
    model::{PlatformProfile, ServerLayout, Stage, StageResult},
};

/// The two loader layers, in install order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModLoader {
    Metamod,
    SourceMod,
}

impl ModLoader {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Metamod => Stage::BaseLoader,
            Self::SourceMod => Stage::ScriptingLayer,
        }
    }

    pub fn url(&self, format: ArchiveFormat) -> &'static str {
        match (self, format) {
            (Self::Metamod, ArchiveFormat::TarGz) => api::METAMOD_LINUX_URL,
            (Self::Metamod, ArchiveFormat::Zip) => api::METAMOD_WINDOWS_URL,
            (Self::SourceMod, ArchiveFormat::TarGz) => api::SOURCEMOD_LINUX_URL,
            (Self::SourceMod, ArchiveFormat::Zip) => api::SOURCEMOD_WINDOWS_URL,
        }
    }

    /// Paths, relative to the game directory, that must all be present for
    /// the layer to count as installed. They are committed in this order.
    pub fn markers(&self) -> &'static [&'static str] {
        match self {
            Self::Metamod => &["addons/metamod", "addons/metamod.vdf"],
            Self::SourceMod => &["addons/sourcemod"],
        }
    }
}

impl Display for ModLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Metamod => "Metamod:Source",
            Self::SourceMod => "SourceMod",
        })
    }
}

pub struct ModLoaderInstaller {
    profile: PlatformProfile,
    layout: ServerLayout,
    transport: SharedTransport,
    sink: Sink,
}

impl ModLoaderInstaller {
    pub fn new(profile: &PlatformProfile, root: impl AsRef<Path>, sink: Sink) -> Self {
        Self {
            profile: profile.clone(),
            layout: ServerLayout::new(root),
            transport: HttpTransport::shared(),
            sink,
        }
    }

    pub fn with_transport(mut self, transport: SharedTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn is_installed(&self, loader: ModLoader) -> bool {
        let game_dir = self.layout.game_dir();
        loader.markers().iter().all(|m| game_dir.join(m).exists())
    }

    pub fn is_metamod_installed(&self) -> bool {
        self.is_installed(ModLoader::Metamod)
    }

    pub fn is_sourcemod_installed(&self) -> bool {
        self.is_installed(ModLoader::SourceMod)
    }

    pub fn install_metamod(&self, force: bool) -> StageResult {
        self.install(ModLoader::Metamod, force)
    }

    pub fn install_sourcemod(&self, force: bool) -> StageResult {
        self.install(ModLoader::SourceMod, force)
    }

    /// Install both layers in order, stopping at the first failure
    pub fn install_all(&self, force: bool) -> Vec<StageResult> {
        self.sink.section("Installing Metamod:Source and SourceMod");
        let mut results = vec![];
        for loader in [ModLoader::Metamod, ModLoader::SourceMod] {
            let res = self.install(loader, force);
            let failed = !res.succeeded;
            results.push(res);
            if failed {
                return results;
            }
        }
        self.sink
            .success("Metamod:Source and SourceMod installation complete!");
        results
    }

    pub fn install(&self, loader: ModLoader, force: bool) -> StageResult {
        self.sink.section(format!("Installing {loader}"));
        match self.try_install(loader, force) {
            Ok(true) => StageResult::success(loader.stage()),
            Ok(false) => StageResult::skipped(loader.stage()),
            Err(e) => {
                self.sink.error(format!("Failed to install {loader}: {e}"));
                StageResult::failure(loader.stage(), e)
            }
        }
    }

    /// Returns `false` when nothing had to be done
    fn try_install(&self, loader: ModLoader, force: bool) -> Result<bool, ProvisionError> {
        let game_dir = self.layout.game_dir();
        if !game_dir.is_dir() {
            return Err(ProvisionError::precondition(format!(
                "CS:GO server directory not found: {}",
                game_dir.display()
            )));
        }
        if loader == ModLoader::SourceMod && !self.is_metamod_installed() {
            return Err(ProvisionError::precondition(
                "Metamod:Source must be installed before SourceMod",
            ));
        }
        if self.is_installed(loader) && !force {
            self.sink.info(format!("{loader} is already installed"));
            return Ok(false);
        }

        // staging lives next to its destination so the final moves are renames
        let staging = tempfile::Builder::new()
            .prefix(".modloader-")
            .tempdir_in(&game_dir)
            .at(&game_dir)?;

        let format = ArchiveFormat::for_os(self.profile.os_family);
        let url = loader.url(format);
        self.sink
            .info(format!("Downloading {loader} from {url}..."));
        let archive_path = staging
            .path()
            .join(format!("archive.{}", format.extension()));
        let file = api::download_file(&*self.transport, url, &archive_path)?;
        self.sink.success("Download complete");

        self.sink.info(format!("Extracting {loader}..."));
        let unpacked = staging.path().join("unpacked");
        archive::extract(file, format, &unpacked)?;

        let markers = loader.markers().iter().map(Path::new).collect::<Vec<_>>();
        if let Some(missing) = markers.iter().find(|m| !unpacked.join(m).exists()) {
            return Err(ProvisionError::StructuralValidation(format!(
                "{loader} archive is missing {}",
                missing.display()
            )));
        }
        if loader == ModLoader::Metamod {
            self.unlink_architecture()?;
        }
        utils::commit_staged(&unpacked, &game_dir, &markers)?;

        if !self.is_installed(loader) {
            return Err(ProvisionError::StructuralValidation(format!(
                "{loader} installation verification failed"
            )));
        }
        self.sink
            .success(format!("{loader} installation verified"));

        if loader == ModLoader::Metamod && self.profile.is_linux() {
            self.fix_architecture();
        }
        Ok(true)
    }

    /// CS:GO Legacy loads 32-bit Metamod. Point `linux64` at `linux32` when
    /// the archive ships both; otherwise leave things alone.
    pub fn fix_architecture(&self) {
        let bin = self.layout.metamod_dir().join("bin");
        let linux64 = bin.join("linux64");
        let linux32 = bin.join("linux32");

        let is_real_dir = fs::symlink_metadata(&linux64)
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_real_dir {
            debug!("No real linux64 directory under {}", bin.display());
            return;
        }
        if !linux32.is_dir() {
            self.sink.warning(
                "Metamod ships no linux32 binaries, leaving linux64 in place",
            );
            return;
        }

        self.sink
            .info("Fixing Metamod architecture (32-bit required)...");
        match replace_with_link(&linux64) {
            Ok(()) => self
                .sink
                .success("Metamod configured to use 32-bit binaries"),
            Err(e) => self
                .sink
                .warning(format!("Could not fix Metamod architecture: {e}")),
        }
    }

    /// Drop the `linux64 -> linux32` link left by [`Self::fix_architecture`]
    /// so a reinstall never writes 64-bit files into `linux32`
    fn unlink_architecture(&self) -> Result<(), ProvisionError> {
        let linux64 = self.layout.metamod_dir().join("bin").join("linux64");
        if fs::read_link(&linux64).is_ok_and(|t| t.as_path() == Path::new("linux32")) {
            debug!("Removing architecture link {}", linux64.display());
            fs::remove_file(&linux64).at(&linux64)?;
        }
        Ok(())
    }

    pub fn admins_file(&self) -> PathBuf {
        self.layout
            .sourcemod_dir()
            .join("configs")
            .join("admins_simple.ini")
    }

    /// Append an entry to SourceMod's `admins_simple.ini`. `flags` of `"z"`
    /// grants root.
    pub fn add_admin(&self, steam_id: &str, name: &str, flags: &str) -> Result<(), ProvisionError> {
        if !self.is_sourcemod_installed() {
            return Err(ProvisionError::precondition(
                "SourceMod must be installed first",
            ));
        }
        let path = self.admins_file();
        if !path.is_file() {
            return Err(ProvisionError::precondition(format!(
                "admins_simple.ini not found: {}",
                path.display()
            )));
        }

        let mut file = OpenOptions::new().append(true).open(&path).at(&path)?;
        writeln!(file, "\"{steam_id}\" \"{flags}\" // {name}").at(&path)?;
        self.sink.success(format!(
            "Added admin: {name} ({steam_id}) with flags '{flags}'"
        ));
        Ok(())
    }
}

#[cfg(unix)]
fn replace_with_link(linux64: &Path) -> Result<(), ProvisionError> {
    fs::remove_dir_all(linux64).at(linux64)?;
    std::os::unix::fs::symlink("linux32", linux64).at(linux64)
}

#[cfg(not(unix))]
fn replace_with_link(linux64: &Path) -> Result<(), ProvisionError> {
    Err(ProvisionError::precondition(format!(
        "cannot link {} on this platform",
        linux64.display()
    )))
}

#[cfg(test)]
mod test {
    use std::{fs, sync::Arc};

    use super::{ModLoader, ModLoaderInstaller};
    use crate::{
        api::{self, mock::MemoryTransport},
        core::archive::fixture,
        error::ErrorKind,
        log::{Level, MemorySink},
        model::{OsFamily, PackageManager, PlatformProfile},
    };

    fn linux() -> PlatformProfile {
        PlatformProfile {
            os_family: OsFamily::Linux,
            distribution_id: Some("debian".into()),
            architecture: "x86_64".into(),
            package_managers: vec![PackageManager::Apt],
        }
    }

    fn metamod_archive(linux32: bool) -> Vec<u8> {
        let mut entries: Vec<(&str, &str, u32)> = vec![
            ("addons/metamod.vdf", "\"Plugin\" { \"file\" \"../csgo/addons/metamod/bin/server\" }", 0o644),
            ("addons/metamod/bin/linux64/server.so", "elf64", 0o755),
        ];
        if linux32 {
            entries.push(("addons/metamod/bin/linux32/server.so", "elf32", 0o755));
        }
        fixture::tar_gz(&entries)
    }

    fn sourcemod_archive() -> Vec<u8> {
        fixture::tar_gz(&[
            ("addons/sourcemod/plugins/admin-flatfile.smx", "smx", 0o644),
            ("addons/sourcemod/configs/admins_simple.ini", "// admins\n", 0o644),
            ("addons/metamod/sourcemod.vdf", "vdf", 0o644),
            ("cfg/sourcemod/sourcemod.cfg", "cfg", 0o644),
        ])
    }

    fn transport(linux32: bool) -> Arc<MemoryTransport> {
        Arc::new(
            MemoryTransport::default()
                .with(api::METAMOD_LINUX_URL, metamod_archive(linux32))
                .with(api::SOURCEMOD_LINUX_URL, sourcemod_archive()),
        )
    }

    #[test]
    fn needs_game_directory() {
        let root = tempfile::tempdir().unwrap();
        let installer = ModLoaderInstaller::new(&linux(), root.path(), MemorySink::shared())
            .with_transport(transport(true));
        let res = installer.install_metamod(false);
        assert_eq!(res.error_kind(), Some(ErrorKind::PreconditionNotMet));
    }

    #[test]
    fn sourcemod_needs_metamod() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("csgo")).unwrap();
        let transport = transport(true);
        let installer = ModLoaderInstaller::new(&linux(), root.path(), MemorySink::shared())
            .with_transport(transport.clone());

        let res = installer.install_sourcemod(false);
        assert_eq!(res.error_kind(), Some(ErrorKind::PreconditionNotMet));
        assert!(transport.requested().is_empty());
    }

    #[test]
    fn install_all_links_linux64() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("csgo")).unwrap();
        let installer = ModLoaderInstaller::new(&linux(), root.path(), MemorySink::shared())
            .with_transport(transport(true));

        let results = installer.install_all(false);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.succeeded && !r.skipped));
        assert!(installer.is_metamod_installed());
        assert!(installer.is_sourcemod_installed());

        let bin = root.path().join("csgo/addons/metamod/bin");
        let linux64 = fs::symlink_metadata(bin.join("linux64")).unwrap();
        assert!(linux64.file_type().is_symlink());
        assert_eq!(
            fs::read_to_string(bin.join("linux64/server.so")).unwrap(),
            "elf32"
        );
        assert!(root.path().join("csgo/cfg/sourcemod/sourcemod.cfg").is_file());

        // nothing left over from staging
        let leftovers = fs::read_dir(root.path().join("csgo"))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(".modloader-")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn missing_linux32_warns_and_keeps_linux64() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("csgo")).unwrap();
        let sink = MemorySink::shared();
        let installer = ModLoaderInstaller::new(&linux(), root.path(), sink.clone())
            .with_transport(transport(false));

        let results = installer.install_all(false);
        assert!(results.iter().all(|r| r.succeeded));

        let linux64 = root.path().join("csgo/addons/metamod/bin/linux64");
        let meta = fs::symlink_metadata(&linux64).unwrap();
        assert!(meta.is_dir());
        assert_eq!(
            fs::read_to_string(linux64.join("server.so")).unwrap(),
            "elf64"
        );
        assert!(sink
            .messages(Level::Warning)
            .iter()
            .any(|m| m.contains("linux32")));
    }

    #[test]
    fn second_run_is_skipped_unless_forced() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("csgo")).unwrap();
        let transport = transport(true);
        let installer = ModLoaderInstaller::new(&linux(), root.path(), MemorySink::shared())
            .with_transport(transport.clone());

        assert!(installer.install_all(false).iter().all(|r| r.succeeded));
        assert!(installer.install_all(false).iter().all(|r| r.skipped));
        assert_eq!(transport.requested().len(), 2);

        let forced = installer.install_all(true);
        assert!(forced.iter().all(|r| r.succeeded && !r.skipped));
        assert_eq!(transport.requested().len(), 4);

        // reinstalling must not write 64-bit files through the link
        let bin = root.path().join("csgo/addons/metamod/bin");
        assert_eq!(
            fs::read_to_string(bin.join("linux32/server.so")).unwrap(),
            "elf32"
        );
        assert!(fs::symlink_metadata(bin.join("linux64"))
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[test]
    fn failed_download_stays_uninstalled() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("csgo")).unwrap();
        let installer = ModLoaderInstaller::new(&linux(), root.path(), MemorySink::shared())
            .with_transport(Arc::new(MemoryTransport::default()));

        let results = installer.install_all(false);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error_kind(), Some(ErrorKind::NetworkFailure));
        assert!(!installer.is_metamod_installed());
        assert_eq!(fs::read_dir(root.path().join("csgo")).unwrap().count(), 0);
    }

    #[test]
    fn archive_without_markers_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("csgo")).unwrap();
        let body = fixture::tar_gz(&[("README.txt", "wrong archive", 0o644)]);
        let installer = ModLoaderInstaller::new(&linux(), root.path(), MemorySink::shared())
            .with_transport(Arc::new(
                MemoryTransport::default().with(api::METAMOD_LINUX_URL, body),
            ));

        let res = installer.install(ModLoader::Metamod, false);
        assert_eq!(
            res.error_kind(),
            Some(ErrorKind::StructuralValidationFailure)
        );
        assert!(!root.path().join("csgo/README.txt").exists());
    }

    #[test]
    fn partial_metamod_reads_as_not_installed() {
        let root = tempfile::tempdir().unwrap();
        let metamod = root.path().join("csgo/addons/metamod/bin/linux64");
        fs::create_dir_all(&metamod).unwrap();
        let installer = ModLoaderInstaller::new(&linux(), root.path(), MemorySink::shared())
            .with_transport(transport(true));
        assert!(!installer.is_metamod_installed());

        let res = installer.install_metamod(false);
        assert!(res.succeeded && !res.skipped, "{}", res.summary());
        assert!(root.path().join("csgo/addons/metamod.vdf").is_file());
        assert!(installer.is_metamod_installed());
    }

    #[test]
    fn archive_missing_vdf_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("csgo")).unwrap();
        let body = fixture::tar_gz(&[("addons/metamod/bin/linux64/server.so", "elf64", 0o755)]);
        let installer = ModLoaderInstaller::new(&linux(), root.path(), MemorySink::shared())
            .with_transport(Arc::new(
                MemoryTransport::default().with(api::METAMOD_LINUX_URL, body),
            ));

        let res = installer.install_metamod(false);
        assert_eq!(
            res.error_kind(),
            Some(ErrorKind::StructuralValidationFailure)
        );
        assert!(!root.path().join("csgo/addons").exists());
    }

    #[test]
    fn add_admin_appends_line() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("csgo")).unwrap();
        let installer = ModLoaderInstaller::new(&linux(), root.path(), MemorySink::shared())
            .with_transport(transport(true));
        assert!(installer
            .add_admin("STEAM_0:1:1", "Owner", "z")
            .is_err());

        assert!(installer.install_all(false).iter().all(|r| r.succeeded));
        installer.add_admin("STEAM_0:1:1", "Owner", "z").unwrap();

        let raw = fs::read_to_string(installer.admins_file()).unwrap();
        assert_eq!(raw, "// admins\n\"STEAM_0:1:1\" \"z\" // Owner\n");
    }
}
