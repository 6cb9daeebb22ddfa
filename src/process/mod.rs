mod controller;
mod locator;

pub use controller::{ProcessController, SignalController, TerminationOutcome};
pub use locator::{CommandSpec, ProcessLocator, SystemLocator, TargetMatch};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use sysinfo::{Pid as SysPid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

/// A process as the supervisor knows it. The start time (seconds since the
/// epoch, as the OS reports it) tells a PID apart from a later process that
/// reused it; it is `None` when the OS could not report it, and then the PID
/// alone identifies the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub pid: i32,
    pub start_time: Option<u64>,
}

impl Target {
    pub fn current() -> Self {
        Self::from_pid(std::process::id() as i32)
    }

    pub fn from_pid(pid: i32) -> Self {
        Self {
            pid,
            start_time: observe(pid).map(|seen| seen.start_time),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Gone,
    /// The PID is in use by a different process.
    Replaced,
}

pub fn liveness(target: &Target) -> Liveness {
    match kill(Pid::from_raw(target.pid), None) {
        Err(Errno::ESRCH) => return Liveness::Gone,
        // EPERM still means the PID exists.
        Ok(()) | Err(_) => {}
    }
    if !sysinfo::IS_SUPPORTED_SYSTEM {
        return Liveness::Alive;
    }
    match observe(target.pid) {
        None => Liveness::Gone,
        Some(seen) if seen.exited => Liveness::Gone,
        Some(seen) => match target.start_time {
            Some(expected) if expected != seen.start_time => Liveness::Replaced,
            _ => Liveness::Alive,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observed {
    start_time: u64,
    exited: bool,
}

/// Refreshes a single process. Status and start time come with every
/// refresh, so nothing else is requested.
fn observe(pid: i32) -> Option<Observed> {
    let pid = SysPid::from_u32(u32::try_from(pid).ok()?);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::new(),
    );
    system.process(pid).map(|process| Observed {
        start_time: process.start_time(),
        exited: has_exited(process.status()),
    })
}

/// Zombies still hold their PID but will never run again.
pub(crate) fn has_exited(status: ProcessStatus) -> bool {
    matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}
