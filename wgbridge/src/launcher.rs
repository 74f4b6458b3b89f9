//! Detaching the device worker from the invoking shell.
//!
//! `add` re-executes the current binary with a sentinel variable set. The
//! child sees the sentinel, runs the device in the foreground and writes its
//! output to a per-interface log file.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::Flavor;
use crate::error::LaunchError;

/// Set to `1` in the environment of a detached worker
pub const ENV_FOREGROUND: &str = "WG_PROCESS_FOREGROUND";

/// Flavor tag (`wg` or `awg`) of a worker
pub const ENV_PROTOCOL_TYPE: &str = "ENV_PROTOCOL_TYPE";

/// Interface served by a worker
pub const ENV_PROTOCOL_TAG: &str = "ENV_PROTOCOL_TAG";

/// Whether this process launches a worker or is the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Launch,
    Foreground,
}

impl RunMode {
    pub fn from_env() -> Self {
        Self::from_value(std::env::var_os(ENV_FOREGROUND).as_deref().and_then(|v| v.to_str()))
    }

    pub fn from_value(value: Option<&str>) -> Self {
        match value {
            Some("1") => RunMode::Foreground,
            _ => RunMode::Launch,
        }
    }
}

/// Everything needed to start a detached worker
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Executable to run; the current one when `None`
    pub program: Option<PathBuf>,
    pub args: Vec<OsString>,
    pub flavor: Flavor,
    pub interface: String,
    /// Directory receiving `<interface>.log`; output is discarded when `None`
    pub log_dir: Option<PathBuf>,
}

impl LaunchRequest {
    /// Re-run this process with the same arguments
    pub fn from_current(flavor: Flavor, interface: &str, log_dir: Option<PathBuf>) -> Self {
        Self {
            program: None,
            args: std::env::args_os().skip(1).collect(),
            flavor,
            interface: interface.to_string(),
            log_dir,
        }
    }

    /// Variables added to the inherited environment
    pub fn environment(&self) -> [(&'static str, String); 3] {
        [
            (ENV_FOREGROUND, "1".to_string()),
            (ENV_PROTOCOL_TYPE, self.flavor.tag().to_string()),
            (ENV_PROTOCOL_TAG, self.interface.clone()),
        ]
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", self.interface)))
    }
}

fn open_log(path: &Path) -> Result<File, LaunchError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o666)
        .open(path)
        .map_err(|source| LaunchError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

/// Start the worker and return its pid without waiting for it
pub fn spawn_detached(request: &LaunchRequest) -> Result<u32, LaunchError> {
    let program = match &request.program {
        Some(program) => program.clone(),
        None => std::env::current_exe().map_err(LaunchError::CurrentExe)?,
    };

    let (stdout, stderr) = match request.log_path() {
        Some(path) => {
            let log = open_log(&path)?;
            let log_err = log.try_clone().map_err(|source| LaunchError::LogFile {
                path: path.clone(),
                source,
            })?;
            (Stdio::from(log), Stdio::from(log_err))
        }
        None => (Stdio::null(), Stdio::null()),
    };

    let child = Command::new(program)
        .args(&request.args)
        .envs(request.environment())
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0)
        .spawn()
        .map_err(LaunchError::Spawn)?;

    tracing::debug!("Started worker for {} (pid {})", request.interface, child.id());
    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn request(log_dir: Option<PathBuf>) -> LaunchRequest {
        LaunchRequest {
            program: Some(PathBuf::from("/bin/sh")),
            args: vec!["-c".into(), "echo worker $ENV_PROTOCOL_TAG".into()],
            flavor: Flavor::Awg,
            interface: "awg3".to_string(),
            log_dir,
        }
    }

    #[test]
    fn test_run_mode_sentinel() {
        assert_eq!(RunMode::from_value(Some("1")), RunMode::Foreground);
        assert_eq!(RunMode::from_value(Some("0")), RunMode::Launch);
        assert_eq!(RunMode::from_value(None), RunMode::Launch);
    }

    #[test]
    fn test_environment_tags_worker() {
        let env = request(None).environment();
        assert!(env.contains(&(ENV_FOREGROUND, "1".to_string())));
        assert!(env.contains(&(ENV_PROTOCOL_TYPE, "awg".to_string())));
        assert!(env.contains(&(ENV_PROTOCOL_TAG, "awg3".to_string())));
    }

    #[test]
    fn test_output_goes_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid = spawn_detached(&request(Some(dir.path().to_path_buf()))).unwrap();
        assert!(pid > 0);

        let path = dir.path().join("awg3.log");
        let mut contents = String::new();
        for _ in 0..50 {
            contents = std::fs::read_to_string(&path).unwrap();
            if !contents.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(contents, "worker awg3\n");
    }

    #[test]
    fn test_log_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("awg3.log");
        std::fs::write(&path, "previous run\n").unwrap();

        let file = open_log(&path).unwrap();
        drop(file);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "previous run\n");
        assert!(std::fs::metadata(&path).unwrap().permissions().mode() & 0o777 != 0);
    }

    #[test]
    fn test_missing_log_dir_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = spawn_detached(&request(Some(dir.path().join("missing")))).unwrap_err();
        assert!(matches!(err, LaunchError::LogFile { .. }));
    }
}
