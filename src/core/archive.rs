use std::{
    fs::{self, OpenOptions},
    io::{self, Read, Seek},
    path::Path,
};

use flate2::read::GzDecoder;
use tracing::{debug, trace};
use zip::ZipArchive;

use crate::{
    error::{PathContext, ProvisionError},
    model::OsFamily,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Upstream ships zips for Windows and gzipped tarballs for everything else
    pub fn for_os(os: OsFamily) -> Self {
        match os {
            OsFamily::Windows => Self::Zip,
            _ => Self::TarGz,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
        }
    }
}

/// Unpack `archive` below `target`, creating directories as needed
pub fn extract(
    archive: impl Read + Seek,
    format: ArchiveFormat,
    target: impl AsRef<Path>,
) -> Result<(), ProvisionError> {
    let target = target.as_ref();
    fs::create_dir_all(target).at(target)?;
    match format {
        ArchiveFormat::Zip => extract_zip(archive, target),
        ArchiveFormat::TarGz => extract_tar_gz(archive, target),
    }
}

fn extract_zip(zip_file: impl Read + Seek, target: &Path) -> Result<(), ProvisionError> {
    let mut archive = ZipArchive::new(zip_file)?;
    for i in 0..archive.len() {
        let mut f = archive.by_index(i)?;
        let Some(name) = f.enclosed_name() else {
            trace!("Skip missing enclosed name '{}'", f.name());
            continue;
        };
        let out = target.join(name);

        if f.is_dir() {
            trace!("Create directory {}", out.display());
            fs::create_dir_all(&out).at(&out)?;
            continue;
        } else if let Some(p) = out.parent() {
            fs::create_dir_all(p).at(p)?;
        }

        let mut outfile = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&out)
            .at(&out)?;

        trace!("Write file {}", out.display());
        io::copy(&mut f, &mut outfile).at(&out)?;

        #[cfg(unix)]
        if let Some(mode) = f.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out, fs::Permissions::from_mode(mode)).at(&out)?;
        }
    }

    Ok(())
}

fn extract_tar_gz(tar_file: impl Read, target: &Path) -> Result<(), ProvisionError> {
    let mut archive = tar::Archive::new(GzDecoder::new(tar_file));
    archive.set_preserve_permissions(true);
    for entry in archive.entries().at(target)? {
        let mut entry = entry.at(target)?;
        let path = entry.path().at(target)?.into_owned();
        trace!("Unpack {}", path.display());
        // unpack_in refuses entries that would land outside of target
        if !entry.unpack_in(target).at(target.join(&path))? {
            debug!("Skipped unsafe archive entry {}", path.display());
        }
    }
    Ok(())
}
