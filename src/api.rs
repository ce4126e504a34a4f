use std::{
    fs::File,
    io::{self, Write},
    path::Path,
    sync::Arc,
};

use tracing::debug;

use crate::error::{PathContext, ProvisionError};

pub const STEAMCMD_LINUX_URL: &str =
    "https://steamcdn-a.akamaihd.net/client/installer/steamcmd_linux.tar.gz";
pub const STEAMCMD_WINDOWS_URL: &str =
    "https://steamcdn-a.akamaihd.net/client/installer/steamcmd.zip";
pub const STEAMCMD_AUR_URL: &str = "https://aur.archlinux.org/steamcmd.git";

pub const METAMOD_LINUX_URL: &str =
    "https://mms.alliedmods.net/mmsdrop/1.11/mmsource-1.11.0-git1148-linux.tar.gz";
pub const METAMOD_WINDOWS_URL: &str =
    "https://mms.alliedmods.net/mmsdrop/1.11/mmsource-1.11.0-git1148-windows.zip";
pub const SOURCEMOD_LINUX_URL: &str =
    "https://sm.alliedmods.net/smdrop/1.11/sourcemod-1.11.0-git6968-linux.tar.gz";
pub const SOURCEMOD_WINDOWS_URL: &str =
    "https://sm.alliedmods.net/smdrop/1.11/sourcemod-1.11.0-git6968-windows.zip";

/// Fetch-and-save of a single URL
pub trait Transport: Send + Sync {
    /// Write the body at `url` into `output`, returning the number of bytes
    fn download(&self, url: &str, output: &mut dyn Write) -> Result<u64, ProvisionError>;
}

pub type SharedTransport = Arc<dyn Transport>;

/// Plain HTTP(S) downloads through `ureq`
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpTransport;

impl HttpTransport {
    pub fn shared() -> SharedTransport {
        Arc::new(Self)
    }
}

impl Transport for HttpTransport {
    /// # Errors
    /// * Non-success HTTP status or connection failure
    /// * IO errors while writing the body
    fn download(&self, url: &str, output: &mut dyn Write) -> Result<u64, ProvisionError> {
        debug!("Starting download from {}", url);
        let res = ureq::get(url).call()?;
        let written = io::copy(&mut res.into_reader(), output)?;
        debug!("Downloaded {} bytes from {}", written, url);
        Ok(written)
    }
}

/// Download `url` to `path`, returning the file reopened for reading
pub fn download_file(
    transport: &dyn Transport,
    url: &str,
    path: impl AsRef<Path>,
) -> Result<File, ProvisionError> {
    let path = path.as_ref();
    {
        let mut file = File::create(path).at(path)?;
        transport.download(url, &mut file)?;
        file.flush().at(path)?;
    }
    debug!("Finished download to {}", path.display());
    File::open(path).at(path)
}
