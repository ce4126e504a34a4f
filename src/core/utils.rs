use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};

use crate::error::{PathContext, ProvisionError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Expand a leading `~` to the current user's home directory
pub fn expand_home(raw: &str) -> PathBuf {
    let rest = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') => rest,
        _ => return PathBuf::from(raw),
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest.trim_start_matches(['/', '\\'])),
        None => PathBuf::from(raw),
    }
}

/// `true` only for a regular file the current platform would run
pub fn is_executable(path: impl AsRef<Path>) -> bool {
    let Ok(meta) = fs::metadata(path.as_ref()) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(unix)]
pub fn set_executable(path: &Path) -> Result<(), ProvisionError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perm = fs::metadata(path).at(path)?.permissions();
    perm.set_mode(perm.mode() | 0o755);
    fs::set_permissions(path, perm).at(path)
}

#[cfg(not(unix))]
pub fn set_executable(_path: &Path) -> Result<(), ProvisionError> {
    Ok(())
}

/// Copy a single file, keeping its permissions and modification time.
/// An existing destination is overwritten.
pub fn copy_file(src: &Path, dest: &Path) -> Result<u64, ProvisionError> {
    let meta = fs::metadata(src).at(src)?;
    let written = {
        let mut input = File::open(src).at(src)?;
        let mut output = File::create(dest).at(dest)?;
        let written = io::copy(&mut input, &mut output).at(dest)?;
        if let Ok(modified) = meta.modified() {
            output.set_modified(modified).at(dest)?;
        }
        written
    };
    fs::set_permissions(dest, meta.permissions()).at(dest)?;
    Ok(written)
}

/// What [`merge_tree`] did
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Merged {
    /// Relative paths of the copied files, sorted
    pub copied: Vec<PathBuf>,
    /// Relative paths of source symlinks that were left out, sorted
    pub skipped_links: Vec<PathBuf>,
}

/// Copy every file below `src` to the same relative path below `dest`.
///
/// Relative paths listed in `skip` are left out along with everything under
/// them. Symlinks in `src` are never followed or copied. Directory links that
/// already exist in `dest` are written through.
pub fn merge_tree(src: &Path, dest: &Path, skip: &[&Path]) -> Result<Merged, ProvisionError> {
    let mut merged = Merged::default();
    let mut pending = vec![PathBuf::new()];
    while let Some(rel_dir) = pending.pop() {
        let dir = src.join(&rel_dir);
        for entry in dir.read_dir().at(&dir)? {
            let entry = entry.at(&dir)?;
            let rel = rel_dir.join(entry.file_name());
            if skip.iter().any(|s| rel.as_path() == *s) {
                trace!("Skipping {}", rel.display());
                continue;
            }

            let path = entry.path();
            let target = dest.join(&rel);
            let file_type = entry.file_type().at(&path)?;
            if file_type.is_symlink() {
                warn!("Not copying symlink {}", path.display());
                merged.skipped_links.push(rel);
                continue;
            }
            if file_type.is_dir() {
                fs::create_dir_all(&target).at(&target)?;
                pending.push(rel);
                continue;
            }

            if let Some(p) = target.parent() {
                fs::create_dir_all(p).at(p)?;
            }
            trace!("Copy {} -> {}", path.display(), target.display());
            copy_file(&path, &target)?;
            merged.copied.push(rel);
        }
    }

    merged.copied.sort();
    merged.skipped_links.sort();
    Ok(merged)
}

/// Move the contents of `staging` into `dest`.
///
/// Everything except `last` is merged first. The `last` entries are then
/// renamed into place (or merged, when they already exist) so that an
/// interrupted install never exposes them half-written.
pub fn commit_staged(staging: &Path, dest: &Path, last: &[&Path]) -> Result<(), ProvisionError> {
    merge_tree(staging, dest, last)?;

    for rel in last {
        let src = staging.join(rel);
        if !src.exists() {
            continue;
        }
        let target = dest.join(rel);
        if let Some(p) = target.parent() {
            fs::create_dir_all(p).at(p)?;
        }

        if !target.exists() && fs::rename(&src, &target).is_ok() {
            debug!("Moved {} into place", target.display());
            continue;
        }

        if src.is_dir() {
            fs::create_dir_all(&target).at(&target)?;
            merge_tree(&src, &target, &[])?;
        } else {
            copy_file(&src, &target)?;
        }
    }

    Ok(())
}

fn spawn(cmd: &mut Command, tool: &str) -> Result<Child, ProvisionError> {
    // arguments may carry credentials
    debug!("Running {:?} with {} arguments", cmd.get_program(), cmd.get_args().len());
    cmd.spawn().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => {
            ProvisionError::PreconditionNotMet(format!("{tool} is not installed or not on PATH"))
        }
        _ => ProvisionError::Io(e),
    })
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = vec![];
        if let Some(mut r) = reader {
            if let Err(e) = r.read_to_end(&mut buf) {
                trace!("Stopped reading child output: {}", e);
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn check_status(tool: &str, status: ExitStatus, stderr: String) -> Result<(), ProvisionError> {
    if status.success() {
        Ok(())
    } else {
        Err(ProvisionError::ExternalTool {
            tool: tool.to_string(),
            status: status.code(),
            stderr: stderr.trim().to_string(),
        })
    }
}

/// Run to completion and capture stdout
pub fn run_captured(cmd: &mut Command, tool: &str) -> Result<String, ProvisionError> {
    let child = spawn(
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped()),
        tool,
    )?;
    let out = child.wait_with_output()?;
    check_status(
        tool,
        out.status,
        String::from_utf8_lossy(&out.stderr).into_owned(),
    )?;
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Run with the terminal attached so the tool can prompt the operator
pub fn run_interactive(cmd: &mut Command, tool: &str) -> Result<(), ProvisionError> {
    let mut child = spawn(
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit()),
        tool,
    )?;
    let status = child.wait()?;
    check_status(tool, status, String::new())
}

/// Run to completion, handing each non-empty stdout line to `on_line` as it
/// arrives. Stderr is collected on a helper thread and reported on failure.
pub fn run_streaming(
    cmd: &mut Command,
    tool: &str,
    mut on_line: impl FnMut(&str),
) -> Result<(), ProvisionError> {
    let mut child = spawn(
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped()),
        tool,
    )?;
    let stderr = drain(child.stderr.take());

    if let Some(stdout) = child.stdout.take() {
        for line in BufReader::new(stdout).split(b'\n') {
            let line = line?;
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if !line.is_empty() {
                on_line(line);
            }
        }
    }

    let status = child.wait()?;
    let stderr = stderr.join().unwrap_or_default();
    check_status(tool, status, stderr)
}

/// Run with a hard deadline; the child is killed when it is exceeded
pub fn run_with_timeout(
    cmd: &mut Command,
    tool: &str,
    timeout: Duration,
) -> Result<String, ProvisionError> {
    let mut child = spawn(
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped()),
        tool,
    )?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            if let Err(e) = child.kill() {
                debug!("Unable to kill {}: {}", tool, e);
            }
            // reap it so no zombie is left behind
            let _ = child.wait();
            return Err(ProvisionError::Timeout {
                tool: tool.to_string(),
                after: timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stderr = stderr.join().unwrap_or_default();
    check_status(tool, status, stderr)?;
    Ok(stdout.join().unwrap_or_default())
}
