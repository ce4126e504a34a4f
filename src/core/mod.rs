pub mod archive;
pub mod config;
pub mod detect;
pub mod fetch_tool;
pub mod modloader;
pub mod pipeline;
pub mod plugins;
pub mod server;
pub(crate) mod utils;
