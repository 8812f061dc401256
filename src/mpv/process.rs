//! MPV binary discovery and process launch.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("MPV executable not found")]
  NotFound,
  #[error("Failed to spawn MPV: {0}")]
  SpawnFailed(#[from] std::io::Error),
}

/// IPC socket/pipe path the launched player listens on.
pub fn ipc_path() -> String {
  #[cfg(windows)]
  {
    r"\\.\pipe\capture-deck-mpv".to_string()
  }
  #[cfg(not(windows))]
  {
    std::env::temp_dir()
      .join("capture-deck-mpv.sock")
      .to_string_lossy()
      .into_owned()
  }
}

/// Locate the MPV binary: explicit path first, then PATH, then the usual install spots.
pub fn find_mpv(configured: Option<&Path>) -> Option<PathBuf> {
  if let Some(path) = configured {
    if path.exists() {
      return Some(path.to_path_buf());
    }
    log::warn!("Configured MPV path {:?} does not exist, searching PATH", path);
  }

  if let Ok(path) = which::which("mpv") {
    return Some(path);
  }

  let candidates: &[&str] = if cfg!(windows) {
    &[r"C:\Program Files\mpv\mpv.exe", r"C:\mpv\mpv.exe"]
  } else if cfg!(target_os = "macos") {
    &["/opt/homebrew/bin/mpv", "/usr/local/bin/mpv", "/Applications/mpv.app/Contents/MacOS/mpv"]
  } else {
    &["/usr/bin/mpv", "/usr/local/bin/mpv"]
  };
  candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

/// Arguments for an idle player that waits for `loadfile` over IPC.
pub fn launch_args(ipc: &str, extra_args: &[String]) -> Vec<String> {
  let mut args = vec![
    format!("--input-ipc-server={}", ipc),
    "--idle=yes".to_string(),
    "--force-window=yes".to_string(),
    "--keep-open=no".to_string(),
    "--no-terminal".to_string(),
  ];
  args.extend(extra_args.iter().cloned());
  args
}

pub fn spawn_mpv(binary: &Path, extra_args: &[String]) -> Result<Child, ProcessError> {
  let ipc = ipc_path();
  log::info!("Spawning MPV {:?} with IPC {}", binary, ipc);

  let child = Command::new(binary)
    .args(launch_args(&ipc, extra_args))
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .spawn()?;
  Ok(child)
}

/// Remove a stale socket left by a previous run.
pub fn cleanup_ipc() {
  #[cfg(not(windows))]
  {
    let _ = std::fs::remove_file(ipc_path());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_launch_args_keep_user_args_last() {
    let args = launch_args("/tmp/x.sock", &["--hwdec=auto".to_string()]);
    assert_eq!(args[0], "--input-ipc-server=/tmp/x.sock");
    assert!(args.contains(&"--idle=yes".to_string()));
    assert_eq!(args.last().map(String::as_str), Some("--hwdec=auto"));
  }

  #[test]
  fn test_missing_configured_path_is_not_returned() {
    let bogus = Path::new("/definitely/not/here/mpv");
    assert_ne!(find_mpv(Some(bogus)).as_deref(), Some(bogus));
  }
}
