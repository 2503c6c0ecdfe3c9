use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use procfs::process::{all_processes, FDTarget, Process};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerminateError {
    #[error("Permission denied to terminate process {0}")]
    PermissionDenied(u32),
    #[error("Failed to terminate process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::Error,
    },
}

/// Command line of a running process, arguments joined by spaces.
pub fn cmdline(pid: u32) -> Option<String> {
    let process = Process::new(pid as i32).ok()?;
    let args = process.cmdline().ok()?;
    Some(args.join(" ").trim_end().to_string())
}

/// Pids with an open descriptor on `device`, excluding our own process.
///
/// Processes we are not allowed to inspect are skipped silently.
pub fn device_holders(device: &Path) -> Vec<u32> {
    let own_pid = std::process::id();
    let processes = match all_processes() {
        Ok(processes) => processes,
        Err(e) => {
            log::debug!("Cannot enumerate processes: {}", e);
            return Vec::new();
        }
    };

    processes
        .filter_map(Result::ok)
        .filter(|process| process.pid as u32 != own_pid)
        .filter(|process| {
            process.fd().is_ok_and(|fds| {
                fds.filter_map(Result::ok)
                    .any(|fd| matches!(&fd.target, FDTarget::Path(path) if path == device))
            })
        })
        .map(|process| process.pid as u32)
        .collect()
}

pub fn terminate(pid: u32) -> Result<(), TerminateError> {
    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(nix::Error::EPERM) => Err(TerminateError::PermissionDenied(pid)),
        Err(source) => Err(TerminateError::Signal { pid, source }),
    }
}
