use std::{
    fs,
    path::Path,
    process::Command,
};

use tracing::debug;

use crate::{
    core::utils,
    error::{PathContext, ProvisionError},
    log::{Sink, SinkExt},
    model::{Credentials, InstallTarget, PlatformProfile, ServerLayout, Stage, StageResult},
};

/// Bundled runtime libraries that shadow the system ones on Linux
const BUNDLED_LIBS: [&str; 2] = ["libgcc_s.so.1", "libstdc++.so.6"];

/// What a line of SteamCMD output means to us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Progress,
    Success,
    Other,
}

pub fn classify_line(line: &str) -> LineKind {
    if line.contains("Update state") || line.to_lowercase().contains("progress:") {
        LineKind::Progress
    } else if line.contains("Success!") {
        LineKind::Success
    } else {
        LineKind::Other
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Session {
    Unconfigured,
    Configured,
    /// SteamCMD has bound the install directory to this login
    Authenticated { username: String },
}

/// Drives SteamCMD to place the dedicated server under the target root.
///
/// Calls must follow the order configure → authenticate → install; each
/// operation checks that its predecessor ran.
pub struct ServerInstaller {
    profile: PlatformProfile,
    target: InstallTarget,
    session: Session,
    sink: Sink,
}

impl ServerInstaller {
    pub fn new(profile: &PlatformProfile, target: InstallTarget, sink: Sink) -> Self {
        Self {
            profile: profile.clone(),
            target,
            session: Session::Unconfigured,
            sink,
        }
    }

    pub fn target(&self) -> &InstallTarget {
        &self.target
    }

    pub fn layout(&self) -> ServerLayout {
        self.target.layout()
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.session, Session::Authenticated { .. })
    }

    /// Cheap, read-only check for the server entry point
    pub fn is_installed(&self) -> bool {
        self.layout().entry_point(self.profile.os_family).is_file()
    }

    fn check_tool(&self) -> Result<(), ProvisionError> {
        if utils::is_executable(&self.target.fetch_tool_path) {
            Ok(())
        } else {
            Err(ProvisionError::precondition(format!(
                "SteamCMD executable not found at {}",
                self.target.fetch_tool_path.display()
            )))
        }
    }

    fn steamcmd(&self) -> Command {
        let mut cmd = Command::new(&self.target.fetch_tool_path);
        cmd.arg("+force_install_dir").arg(&self.target.root_directory);
        cmd
    }

    fn report(&self, stage: Stage, res: Result<(), ProvisionError>) -> StageResult {
        if let Err(e) = &res {
            self.sink.error(format!("{stage} failed: {e}"));
        }
        StageResult::from_result(stage, res)
    }

    /// Bind SteamCMD to `root`. Must happen before the first login.
    pub fn configure_install_directory(&mut self, root: impl AsRef<Path>) -> StageResult {
        let res = self.try_configure(root.as_ref());
        self.report(Stage::InstallDirectory, res)
    }

    fn try_configure(&mut self, root: &Path) -> Result<(), ProvisionError> {
        if self.is_authenticated() {
            if root == self.target.root_directory {
                debug!("Install directory unchanged after login");
                return Ok(());
            }
            return Err(ProvisionError::precondition(format!(
                "install directory cannot be changed to {} after login; it is bound to {}",
                root.display(),
                self.target.root_directory.display()
            )));
        }

        self.check_tool()?;
        self.sink
            .info(format!("Server will be installed to: {}", root.display()));
        fs::create_dir_all(root).at(root)?;
        // fails when the directory is not writable
        tempfile::tempfile_in(root).at(root)?;

        self.target.root_directory = root.to_path_buf();
        self.sink
            .info("Configuring installation directory (must be done before login)...");
        let mut cmd = self.steamcmd();
        cmd.arg("+quit");
        let sink = self.sink.clone();
        utils::run_streaming(&mut cmd, "steamcmd", |line| sink.debug(line))?;

        self.session = Session::Configured;
        self.sink.success(format!(
            "Installation directory configured: {}",
            root.display()
        ));
        Ok(())
    }

    /// Log in to Steam. A first session needs the password and may prompt for
    /// a Steam Guard code on the terminal; later sessions reuse the cached
    /// login and never pass a secret.
    pub fn authenticate(&mut self, credentials: &Credentials, is_first_session: bool) -> StageResult {
        self.sink
            .section(format!("Logging in to Steam as '{}'", credentials.username));
        let res = self.try_authenticate(credentials, is_first_session);
        self.report(Stage::Authenticate, res)
    }

    fn try_authenticate(
        &mut self,
        credentials: &Credentials,
        is_first_session: bool,
    ) -> Result<(), ProvisionError> {
        if self.session == Session::Unconfigured {
            return Err(ProvisionError::precondition(
                "install directory must be configured before login",
            ));
        }
        self.check_tool()?;

        let mut cmd = self.steamcmd();
        if is_first_session {
            let Some(password) = credentials.password.as_deref().filter(|p| !p.is_empty()) else {
                return Err(ProvisionError::precondition(
                    "password is required for first login",
                ));
            };
            self.sink
                .warning("First-time login requires a Steam Guard code");
            self.sink.warning(
                "After entering the code, type 'quit' to cache the credentials for future logins",
            );
            cmd.arg("+login").arg(&credentials.username).arg(password);
            utils::run_interactive(&mut cmd, "steamcmd")?;
            self.sink
                .success("First-time login successful! Credentials cached");
        } else {
            self.sink.info("Using cached credentials...");
            cmd.arg("+login").arg(&credentials.username).arg("+quit");
            let sink = self.sink.clone();
            utils::run_streaming(&mut cmd, "steamcmd", |line| sink.debug(line))?;
            self.sink.success("Login successful (cached credentials)");
        }

        self.session = Session::Authenticated {
            username: credentials.username.clone(),
        };
        Ok(())
    }

    /// Download or update `payload_id`. `validate` re-checks every file,
    /// which is much slower.
    pub fn install_or_update(&mut self, payload_id: &str, validate: bool) -> StageResult {
        self.sink.section("Installing/Updating server");
        let res = self.try_install(payload_id, validate);
        self.report(Stage::ServerPayload, res)
    }

    fn try_install(&self, payload_id: &str, validate: bool) -> Result<(), ProvisionError> {
        let Session::Authenticated { username } = &self.session else {
            return Err(ProvisionError::precondition(
                "must be logged in before downloading the server",
            ));
        };
        self.check_tool()?;

        self.sink
            .info(format!("Downloading app {payload_id}..."));
        if validate {
            self.sink.info("Validation enabled - this may take longer");
        }

        let mut cmd = self.steamcmd();
        cmd.arg("+login")
            .arg(username)
            .arg("+app_update")
            .arg(payload_id);
        if validate {
            cmd.arg("validate");
        }
        cmd.arg("+quit");

        let sink = self.sink.clone();
        utils::run_streaming(&mut cmd, "steamcmd", |line| match classify_line(line) {
            LineKind::Progress => sink.info(line),
            LineKind::Success => sink.success(line),
            LineKind::Other => sink.debug(line),
        })?;

        let entry = self.layout().entry_point(self.profile.os_family);
        if !entry.is_file() {
            return Err(ProvisionError::StructuralValidation(format!(
                "SteamCMD finished but {} is missing",
                entry.display()
            )));
        }
        self.sink.success("Server installation complete!");

        if self.profile.is_linux() {
            self.fix_bundled_libraries();
        }
        Ok(())
    }

    /// Rename the bundled runtime libraries so the system ones are used.
    /// Missing libraries are fine. Returns how many were renamed.
    pub fn fix_bundled_libraries(&self) -> usize {
        let bin_dir = self.layout().bin_dir();
        if !bin_dir.exists() {
            self.sink.debug("bin directory not found, skipping library fix");
            return 0;
        }

        let mut fixed = 0;
        for lib in BUNDLED_LIBS {
            let path = bin_dir.join(lib);
            if !path.exists() {
                self.sink.debug(format!("{lib} not found, no fix needed"));
                continue;
            }
            let backup = bin_dir.join(format!("{lib}.bak"));
            match fs::rename(&path, &backup) {
                Ok(()) => {
                    self.sink.debug(format!("Renamed {lib} -> {lib}.bak"));
                    fixed += 1;
                }
                Err(e) => self.sink.warning(format!("Could not rename {lib}: {e}")),
            }
        }

        if fixed > 0 {
            self.sink
                .success(format!("Fixed {fixed} bundled library conflict(s)"));
        }
        fixed
    }
}

#[cfg(test)]
mod test {
    use super::{classify_line, LineKind};

    #[test]
    fn classify_steamcmd_output() {
        assert_eq!(
            classify_line(" Update state (0x61) downloading, progress: 12.04 (1 / 2)"),
            LineKind::Progress
        );
        assert_eq!(
            classify_line("Success! App '740' fully installed."),
            LineKind::Success
        );
        assert_eq!(classify_line("Loading Steam API...OK"), LineKind::Other);
    }

    #[cfg(unix)]
    mod process {
        use std::fs;

        use crate::{
            error::ErrorKind,
            log::MemorySink,
            model::{Credentials, InstallTarget, OsFamily},
            test::{fake_steamcmd, linux_profile, script},
            ServerInstaller,
        };

        fn installer(tool_dir: &std::path::Path, root: &std::path::Path) -> ServerInstaller {
            ServerInstaller::new(
                &linux_profile(),
                InstallTarget::new(root, fake_steamcmd(tool_dir)),
                MemorySink::shared(),
            )
        }

        #[test]
        fn missing_tool_is_precondition() {
            let dir = tempfile::tempdir().unwrap();
            let mut server = ServerInstaller::new(
                &linux_profile(),
                InstallTarget::new(dir.path().join("srv"), dir.path().join("nope.sh")),
                MemorySink::shared(),
            );
            let res = server.configure_install_directory(dir.path().join("srv"));
            assert_eq!(res.error_kind(), Some(ErrorKind::PreconditionNotMet));
        }

        #[test]
        fn login_requires_configured_directory() {
            let tools = tempfile::tempdir().unwrap();
            let root = tempfile::tempdir().unwrap();
            let mut server = installer(tools.path(), root.path());
            let res = server.authenticate(&Credentials::new("gaben", None), false);
            assert_eq!(res.error_kind(), Some(ErrorKind::PreconditionNotMet));
            assert!(!server.is_authenticated());
        }

        #[test]
        fn first_login_needs_password() {
            let tools = tempfile::tempdir().unwrap();
            let root = tempfile::tempdir().unwrap();
            let mut server = installer(tools.path(), root.path());
            assert!(server.configure_install_directory(root.path()).succeeded);

            let res = server.authenticate(&Credentials::new("gaben", None), true);
            assert_eq!(res.error_kind(), Some(ErrorKind::PreconditionNotMet));
        }

        #[test]
        fn cached_login_passes_no_secret() {
            let tools = tempfile::tempdir().unwrap();
            let root = tempfile::tempdir().unwrap();
            let mut server = installer(tools.path(), root.path());
            assert!(server.configure_install_directory(root.path()).succeeded);

            let creds = Credentials::new("gaben", Some("hunter2".to_string()));
            let res = server.authenticate(&creds, false);
            assert!(res.succeeded, "{}", res.summary());

            let calls = fs::read_to_string(tools.path().join("calls.log")).unwrap();
            assert!(calls.contains("+login gaben +quit"));
            assert!(!calls.contains("hunter2"));
        }

        #[test]
        fn password_is_never_logged() {
            use std::sync::Arc;

            use crate::log::MockLogSink;

            let tools = tempfile::tempdir().unwrap();
            let root = tempfile::tempdir().unwrap();
            let mut sink = MockLogSink::new();
            sink.expect_emit()
                .withf(|event| !event.message().contains("hunter2"))
                .returning(|_| ());
            let mut server = ServerInstaller::new(
                &linux_profile(),
                InstallTarget::new(root.path(), fake_steamcmd(tools.path())),
                Arc::new(sink),
            );

            assert!(server.configure_install_directory(root.path()).succeeded);
            let creds = Credentials::new("gaben", Some("hunter2".to_string()));
            assert!(server.authenticate(&creds, true).succeeded);
            assert!(server.install_or_update("740", false).succeeded);
        }

        #[test]
        fn directory_is_bound_after_login() {
            let tools = tempfile::tempdir().unwrap();
            let root = tempfile::tempdir().unwrap();
            let other = tempfile::tempdir().unwrap();
            let mut server = installer(tools.path(), root.path());

            // switching before login is fine
            assert!(server.configure_install_directory(other.path()).succeeded);
            assert!(server.configure_install_directory(root.path()).succeeded);
            assert!(server
                .authenticate(&Credentials::new("gaben", None), false)
                .succeeded);

            let res = server.configure_install_directory(other.path());
            assert_eq!(res.error_kind(), Some(ErrorKind::PreconditionNotMet));
            assert_eq!(server.target().root_directory, root.path());
            assert!(server.configure_install_directory(root.path()).succeeded);
        }

        #[test]
        fn install_requires_login() {
            let tools = tempfile::tempdir().unwrap();
            let root = tempfile::tempdir().unwrap();
            let mut server = installer(tools.path(), root.path());
            assert!(server.configure_install_directory(root.path()).succeeded);
            let res = server.install_or_update("740", false);
            assert_eq!(res.error_kind(), Some(ErrorKind::PreconditionNotMet));
        }

        #[test]
        fn install_renames_present_libraries_only() {
            let tools = tempfile::tempdir().unwrap();
            let root = tempfile::tempdir().unwrap();
            let mut server = installer(tools.path(), root.path());
            assert!(server.configure_install_directory(root.path()).succeeded);
            assert!(server
                .authenticate(&Credentials::new("gaben", None), false)
                .succeeded);

            let res = server.install_or_update("740", false);
            assert!(res.succeeded, "{}", res.summary());
            let bin = root.path().join("bin");
            assert!(bin.join("libgcc_s.so.1.bak").is_file());
            assert!(!bin.join("libgcc_s.so.1").exists());
            assert!(!bin.join("libstdc++.so.6.bak").exists());

            let calls = fs::read_to_string(tools.path().join("calls.log")).unwrap();
            assert!(calls.contains("+app_update 740 +quit"));
        }

        #[test]
        fn windows_skips_library_fix() {
            let tools = tempfile::tempdir().unwrap();
            let root = tempfile::tempdir().unwrap();
            let mut profile = linux_profile();
            profile.os_family = OsFamily::Windows;
            let mut server = ServerInstaller::new(
                &profile,
                InstallTarget::new(root.path(), fake_steamcmd(tools.path())),
                MemorySink::shared(),
            );
            assert!(server.configure_install_directory(root.path()).succeeded);
            assert!(server
                .authenticate(&Credentials::new("gaben", None), false)
                .succeeded);

            let res = server.install_or_update("740", true);
            assert!(res.succeeded, "{}", res.summary());
            assert!(server.is_installed());
            assert!(root.path().join("bin/libgcc_s.so.1").is_file());
        }

        #[test]
        fn failing_tool_reports_stderr() {
            let tools = tempfile::tempdir().unwrap();
            let root = tempfile::tempdir().unwrap();
            let tool = script(
                tools.path(),
                "steamcmd.sh",
                "#!/bin/sh\necho 'ERROR! Failed to connect' >&2\nexit 7\n",
            );
            let mut server = ServerInstaller::new(
                &linux_profile(),
                InstallTarget::new(root.path(), tool),
                MemorySink::shared(),
            );
            let res = server.configure_install_directory(root.path());
            assert_eq!(res.error_kind(), Some(ErrorKind::ExternalToolFailure));
            assert!(res.summary().contains("ERROR! Failed to connect"));
        }
    }
}
