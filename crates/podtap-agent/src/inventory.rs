//! Socket inventory: which process listens where.
//!
//! Joins two views of the system: the process table under `/proc` (pids,
//! names, parent pids, and the inode numbers of their socket descriptors)
//! and the kernel's diagnostic dump of listening TCP sockets. The join key
//! is the socket inode.

use std::collections::HashMap;
use std::fs;
use std::os::linux::fs::MetadataExt;
use std::path::Path;

use crate::error::Result;
use crate::sock_diag::{self, DiagSocket};

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    /// Process ID.
    pub pid: u32,
    /// Parent process ID.
    pub ppid: u32,
    /// Executable name from the stat line's comm field.
    pub name: String,
}

/// Lists all processes visible under `/proc`.
///
/// Entries that disappear mid-scan are skipped.
///
/// # Errors
///
/// Returns an error only if `/proc` itself cannot be read.
pub fn list_processes() -> std::io::Result<Vec<ProcessEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(parsed) = parse_stat_line(pid, &stat) {
            entries.push(parsed);
        }
    }
    Ok(entries)
}

/// Parses a `/proc/<pid>/stat` line. The comm field is parenthesized and
/// may itself contain spaces or parentheses, so it is delimited by the
/// first `(` and the last `)`.
fn parse_stat_line(pid: u32, stat: &str) -> Option<ProcessEntry> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let name = stat.get(open + 1..close)?.to_string();
    // After the comm field: state, then ppid.
    let mut rest = stat.get(close + 1..)?.split_whitespace();
    let _state = rest.next()?;
    let ppid = rest.next()?.parse().ok()?;
    Some(ProcessEntry { pid, ppid, name })
}

/// Returns the inode numbers of every socket descriptor held by `pid`.
///
/// # Errors
///
/// Returns an error if the fd directory cannot be listed; individual
/// descriptors that vanish mid-scan are skipped.
pub fn socket_inodes(pid: u32) -> std::io::Result<Vec<u64>> {
    socket_inodes_in(Path::new("/proc").join(pid.to_string()).join("fd"))
}

fn socket_inodes_in(fd_dir: impl AsRef<Path>) -> std::io::Result<Vec<u64>> {
    let mut inodes = Vec::new();
    for entry in fs::read_dir(fd_dir)? {
        let entry = entry?;
        // stat() follows the fd symlink to the socket inode itself.
        let Ok(metadata) = fs::metadata(entry.path()) else {
            continue;
        };
        if metadata.st_mode() & libc::S_IFMT == libc::S_IFSOCK {
            inodes.push(metadata.st_ino());
        }
    }
    Ok(inodes)
}

/// Maps each pid to the listening sockets it owns.
///
/// # Errors
///
/// Returns an error if the diagnostic dump or the `/proc` walk fails
/// outright.
pub fn listening_sockets_by_pid() -> Result<HashMap<u32, Vec<DiagSocket>>> {
    let listening = sock_diag::query_listening_sockets()?;
    let by_inode: HashMap<u64, DiagSocket> = listening
        .into_iter()
        .map(|sock| (u64::from(sock.inode), sock))
        .collect();

    let mut by_pid: HashMap<u32, Vec<DiagSocket>> = HashMap::new();
    for process in list_processes()? {
        let Ok(inodes) = socket_inodes(process.pid) else {
            // Permission or a process that exited; not this pid's fault.
            continue;
        };
        for inode in inodes {
            if let Some(sock) = by_inode.get(&inode) {
                by_pid.entry(process.pid).or_default().push(*sock);
            }
        }
    }
    Ok(by_pid)
}
