
pub mod api;
pub mod core;
pub mod error;
pub mod log;
pub mod model;

/// Steam app id of the CS:GO dedicated server
pub const CSGO_APP_ID: &str = "740";
/// Last protocol version before the CS2 switch-over
pub const LEGACY_VERSION: &str = "2000258";

// Important functions and structs
pub use crate::core::detect::detect;
pub use crate::core::{
    config::{ConfigMutator, LaunchOptions, ServerConfig},
    fetch_tool::{FetchToolInstaller, Strategy},
    modloader::{ModLoader, ModLoaderInstaller},
    pipeline::Pipeline,
    plugins::{PluginAcquirer, PluginSource},
    server::ServerInstaller,
};
pub use crate::error::{ErrorKind, ProvisionError};
pub use crate::log::{LogEvent, LogSink, MemorySink, Sink, SinkExt, TracingSink};
pub use crate::model::{
    Credentials, Environment, InstallTarget, OsFamily, PackageManager, PlatformProfile,
    ServerLayout, Stage, StageResult,
};
