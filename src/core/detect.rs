use std::{ffi::OsStr, fs, path::Path, process::Command};

use tracing::debug;

use crate::{
    core::utils,
    model::{OsFamily, PackageManager, PlatformProfile},
};

const OS_RELEASE: &str = "/etc/os-release";

/// Probe the running host. Never fails; anything unrecognised degrades to
/// [`OsFamily::Unknown`] or an absent distribution.
pub fn detect() -> PlatformProfile {
    detect_with(std::env::consts::OS, |cmd| which::which(cmd).is_ok(), || {
        lookup_distribution(Path::new(OS_RELEASE), "lsb_release")
    })
}

/// Build a profile from an OS name, a `PATH` probe and a distribution lookup
pub fn detect_with(
    os: &str,
    on_path: impl Fn(&str) -> bool,
    distribution: impl FnOnce() -> Option<String>,
) -> PlatformProfile {
    let os_family = match os {
        "linux" => OsFamily::Linux,
        "windows" => OsFamily::Windows,
        _ => OsFamily::Unknown,
    };
    let distribution_id = match os_family {
        OsFamily::Linux => distribution(),
        _ => None,
    };

    let profile = PlatformProfile {
        os_family,
        distribution_id,
        architecture: std::env::consts::ARCH.to_string(),
        package_managers: package_managers(on_path),
    };
    debug!("Detected platform: {:?}", profile);
    profile
}

/// Every known package manager found on `PATH`, in probe order.
/// Returns `[Unknown]` rather than an empty list.
pub fn package_managers(on_path: impl Fn(&str) -> bool) -> Vec<PackageManager> {
    let mut found = PackageManager::CANDIDATES
        .into_iter()
        .filter(|pm| on_path(pm.command()))
        .inspect(|pm| debug!("Found package manager: {}", pm.command()))
        .collect::<Vec<_>>();
    if found.is_empty() {
        debug!("No known package managers detected");
        found.push(PackageManager::Unknown);
    }
    found
}

/// `ID` from an os-release document, `"unknown"` when the key is missing
pub fn parse_os_release(raw: &str) -> String {
    raw.lines()
        .filter_map(|line| line.trim().split_once('='))
        .find(|(key, _)| *key == "ID")
        .map(|(_, value)| value.trim().trim_matches(['"', '\'']).to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Distribution id from `os_release`, falling back to `lsb_release -is`.
/// `None` when neither source answers.
pub fn lookup_distribution(os_release: &Path, lsb_release: impl AsRef<OsStr>) -> Option<String> {
    match fs::read_to_string(os_release) {
        Ok(raw) => return Some(parse_os_release(&raw)),
        Err(e) => debug!("{} not readable: {}", os_release.display(), e),
    }

    let mut cmd = Command::new(lsb_release);
    cmd.arg("-is");
    let out = match utils::run_captured(&mut cmd, "lsb_release") {
        Ok(out) => out,
        Err(e) => {
            debug!("lsb_release unavailable: {}", e);
            return None;
        }
    };
    let id = out.trim().to_lowercase();
    (!id.is_empty()).then_some(id)
}
