//! Runs every stage in order for one [`Environment`]

use std::ops::ControlFlow;

use crate::{
    api::{HttpTransport, SharedTransport},
    core::{
        config::ConfigMutator, fetch_tool::FetchToolInstaller, modloader::ModLoaderInstaller,
        plugins::PluginAcquirer, server::ServerInstaller,
    },
    error::ProvisionError,
    log::{Sink, SinkExt},
    model::{Environment, InstallTarget, PlatformProfile, Stage, StageReport, StageResult},
    CSGO_APP_ID,
};

pub struct Pipeline {
    profile: PlatformProfile,
    environment: Environment,
    transport: SharedTransport,
    sink: Sink,
}

impl Pipeline {
    pub fn new(profile: PlatformProfile, environment: Environment, sink: Sink) -> Self {
        Self {
            profile,
            environment,
            transport: HttpTransport::shared(),
            sink,
        }
    }

    pub fn with_transport(mut self, transport: SharedTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Run all stages, stopping after the first failure. Stages the
    /// environment asks to skip are reported as skipped without running.
    pub fn run(&self) -> Vec<StageResult> {
        let mut results = vec![];
        if self.run_stages(&mut results).is_continue() {
            self.sink.success("Server provisioning complete!");
        }
        results
    }

    fn record(&self, results: &mut Vec<StageResult>, res: StageResult) -> ControlFlow<()> {
        let failed = !res.succeeded;
        if failed {
            self.sink.critical(res.summary());
        }
        results.push(res);
        if failed {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    fn skip(&self, results: &mut Vec<StageResult>, stages: &[Stage]) {
        for stage in stages {
            self.sink.info(format!("Skipping {stage}"));
            results.push(StageResult::skipped(*stage));
        }
    }

    fn run_stages(&self, results: &mut Vec<StageResult>) -> ControlFlow<()> {
        let env = &self.environment;
        let skip = &env.skip;

        self.sink.section("System detection");
        for line in self.profile.to_string().lines() {
            self.sink.info(line);
        }
        self.record(results, StageResult::success(Stage::Detect))?;

        let mut fetch_tool = FetchToolInstaller::new(&self.profile, self.sink.clone())
            .with_transport(self.transport.clone());
        if let Some(dir) = &env.fetch_tool_dir {
            fetch_tool = fetch_tool.with_tool_dir(dir);
        }
        if skip.fetch_tool {
            self.skip(results, &[Stage::FetchTool]);
        } else {
            let mut res = fetch_tool.ensure_installed();
            if res.succeeded && !res.skipped {
                let update = fetch_tool.run_initial_update();
                if !update.succeeded {
                    res = update;
                }
            }
            self.record(results, res)?;
        }

        let target = InstallTarget::new(&env.install_dir, fetch_tool.tool_path());
        if skip.server {
            self.skip(
                results,
                &[Stage::InstallDirectory, Stage::Authenticate, Stage::ServerPayload],
            );
        } else {
            let mut server = ServerInstaller::new(&self.profile, target, self.sink.clone());
            self.record(results, server.configure_install_directory(&env.install_dir))?;
            self.record(
                results,
                server.authenticate(&env.login.credentials, env.login.first_session),
            )?;
            self.record(results, server.install_or_update(CSGO_APP_ID, env.validate))?;
        }

        if skip.mod_loaders {
            self.skip(results, &[Stage::BaseLoader, Stage::ScriptingLayer]);
        } else {
            let loaders = ModLoaderInstaller::new(&self.profile, &env.install_dir, self.sink.clone())
                .with_transport(self.transport.clone());
            for res in loaders.install_all(env.force_mod_loaders) {
                self.record(results, res)?;
            }
        }

        if !env.plugins.is_empty() {
            let acquirer = PluginAcquirer::new(&env.install_dir, self.sink.clone())
                .with_transport(self.transport.clone());
            for plugin in &env.plugins {
                self.record(results, acquirer.install(plugin))?;
            }
        }

        if skip.config {
            self.skip(results, &[Stage::Config, Stage::VersionDescriptor]);
        } else {
            let mutator = ConfigMutator::new(&env.install_dir, self.sink.clone());
            self.record(results, mutator.write_server_config(&env.server_config))?;
            self.record(results, mutator.patch_version_descriptor(&env.legacy_version))?;
        }

        ControlFlow::Continue(())
    }

    /// Machine-readable summary of a run
    pub fn report_json(results: &[StageResult]) -> Result<String, ProvisionError> {
        let report = results.iter().map(StageReport::from).collect::<Vec<_>>();
        Ok(serde_json::to_string_pretty(&report)?)
    }
}
