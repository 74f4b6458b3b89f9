//! Locating running workers through their environment tags.

use std::fs;
use std::io;
use std::path::Path;

use crate::config::Flavor;
use crate::launcher::{ENV_PROTOCOL_TAG, ENV_PROTOCOL_TYPE};

/// Default procfs mount point
pub const PROC_ROOT: &str = "/proc";

/// A detached worker found under `/proc`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProcess {
    pub pid: u32,
    pub flavor: Flavor,
    pub interface: String,
}

/// Read the worker tags out of a NUL-separated environ block
fn parse_environ(pid: u32, environ: &[u8]) -> Option<WorkerProcess> {
    let mut flavor = None;
    let mut interface = None;

    for entry in environ.split(|b| *b == 0) {
        let Ok(entry) = std::str::from_utf8(entry) else {
            continue;
        };
        match entry.split_once('=') {
            Some((ENV_PROTOCOL_TYPE, value)) => flavor = Flavor::from_tag(value),
            Some((ENV_PROTOCOL_TAG, value)) if !value.is_empty() => {
                interface = Some(value.to_string())
            }
            _ => {}
        }
    }

    Some(WorkerProcess {
        pid,
        flavor: flavor?,
        interface: interface?,
    })
}

/// List every tagged worker. Processes that vanish or cannot be read are
/// skipped.
pub fn scan(proc_root: &Path) -> io::Result<Vec<WorkerProcess>> {
    let mut workers = Vec::new();

    for entry in fs::read_dir(proc_root)? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(environ) = fs::read(entry.path().join("environ")) else {
            continue;
        };
        if let Some(worker) = parse_environ(pid, &environ) {
            workers.push(worker);
        }
    }

    workers.sort_by_key(|w| w.pid);
    Ok(workers)
}

/// The worker serving `interface` with the given flavor, if any
pub fn find(
    proc_root: &Path,
    interface: &str,
    flavor: Flavor,
) -> io::Result<Option<WorkerProcess>> {
    Ok(scan(proc_root)?
        .into_iter()
        .find(|w| w.interface == interface && w.flavor == flavor))
}
