use super::{has_exited, Target};
use crate::error::SupervisorError;
use async_trait::async_trait;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::process::Command;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

/// Environment variable stamped on every spawned target.
pub const MARKER_ENV: &str = "RESTARTD_TARGET";

/// How the watchdog recognises its target among running processes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum TargetMatch {
    /// Substring of the space-joined command line.
    CommandLine { contains: String },
    /// `RESTARTD_TARGET=<value>` in the process environment.
    EnvMarker { value: String },
}

impl fmt::Display for TargetMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandLine { contains } => write!(f, "command line containing {contains:?}"),
            Self::EnvMarker { value } => write!(f, "{MARKER_ENV}={value}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    pub working_directory: Option<PathBuf>,
    /// Value for [`MARKER_ENV`] in the spawned process.
    pub marker: Option<String>,
}

#[async_trait]
pub trait ProcessLocator: Send + Sync + 'static {
    /// The single live process matching `matcher`.
    ///
    /// No match is [`SupervisorError::TargetNotFound`], more than one is
    /// [`SupervisorError::AmbiguousTarget`].
    async fn find_target(&self, matcher: &TargetMatch) -> Result<Target, SupervisorError>;

    /// Launches a new target, detached from this process's group.
    async fn respawn(&self, command: &CommandSpec) -> Result<Target>;
}

/// Finds targets in the OS process table.
#[derive(Debug, Clone, Default)]
pub struct SystemLocator;

#[async_trait]
impl ProcessLocator for SystemLocator {
    #[instrument(skip(self))]
    async fn find_target(&self, matcher: &TargetMatch) -> Result<Target, SupervisorError> {
        let table = tokio::task::spawn_blocking(process_table)
            .await
            .unwrap_or_else(|err| {
                warn!(?err, "Process scan panicked");
                Vec::new()
            });
        let own_pid = std::process::id() as i32;

        match select(matcher, &table, own_pid).as_slice() {
            [] => Err(SupervisorError::TargetNotFound(matcher.to_string())),
            [target] => {
                info!(pid = target.pid, "Found target process");
                Ok(*target)
            }
            many => Err(SupervisorError::AmbiguousTarget {
                matcher: matcher.to_string(),
                count: many.len(),
            }),
        }
    }

    #[instrument(skip(self))]
    async fn respawn(&self, spec: &CommandSpec) -> Result<Target> {
        let command = shell_words::split(&spec.command).wrap_err("Invalid command")?;
        let (program, args) = command
            .split_first()
            .ok_or_else(|| eyre!("Empty command"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        if let Some(dir) = &spec.working_directory {
            command.current_dir(dir);
        }
        if let Some(marker) = &spec.marker {
            command.env(MARKER_ENV, marker);
        }
        let mut child = command.spawn().wrap_err("Failed to spawn target")?;
        let pid = child.id().ok_or_else(|| eyre!("Target exited instantly"))? as i32;

        // Reap it whenever it goes, without tying its lifetime to ours.
        tokio::spawn(
            async move {
                match child.wait().await {
                    Ok(status) => info!(%status, "Target exited"),
                    Err(err) => warn!(?err, "Failed to wait for target"),
                }
            }
            .instrument(info_span!("reap_target", pid)),
        );

        info!(pid, "Target started");
        Ok(Target::from_pid(pid))
    }
}

/// What matching needs to know about one running process.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcessEntry {
    pid: i32,
    start_time: u64,
    cmdline: String,
    environ: Vec<String>,
    exited: bool,
}

fn process_table() -> Vec<ProcessEntry> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::new()
            .with_cmd(UpdateKind::Always)
            .with_environ(UpdateKind::Always),
    );

    // Threads show up as processes on some platforms and share their
    // owner's command line and environment.
    let mut threads = HashSet::new();
    for (pid, process) in system.processes() {
        if let Some(tasks) = process.tasks() {
            threads.extend(tasks.iter().filter(|task| *task != pid).copied());
        }
    }

    system
        .processes()
        .iter()
        .filter(|(pid, _)| !threads.contains(*pid))
        .filter_map(|(pid, process)| {
            let pid = i32::try_from(pid.as_u32()).ok()?;
            Some(ProcessEntry {
                pid,
                start_time: process.start_time(),
                cmdline: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" "),
                environ: process
                    .environ()
                    .iter()
                    .map(|entry| entry.to_string_lossy().into_owned())
                    .collect(),
                exited: has_exited(process.status()),
            })
        })
        .collect()
}

/// Live processes in `table` matching `matcher`, ordered by PID.
fn select(matcher: &TargetMatch, table: &[ProcessEntry], own_pid: i32) -> Vec<Target> {
    let mut found: Vec<Target> = table
        .iter()
        .filter(|entry| entry.pid != own_pid && !entry.exited)
        .filter(|entry| match matcher {
            // Kernel threads have an empty command line.
            TargetMatch::CommandLine { contains } => {
                !entry.cmdline.is_empty() && entry.cmdline.contains(contains.as_str())
            }
            TargetMatch::EnvMarker { value } => has_marker(&entry.environ, value),
        })
        .map(|entry| Target {
            pid: entry.pid,
            start_time: Some(entry.start_time),
        })
        .collect();
    found.sort_by_key(|target| target.pid);
    debug!(matches = found.len(), "Scanned {} processes", table.len());
    found
}

fn has_marker(environ: &[String], value: &str) -> bool {
    let wanted = format!("{MARKER_ENV}={value}");
    environ.iter().any(|entry| *entry == wanted)
}
