//! Execution units: the two hosts a stage generation can run in.
//!
//! A unit is launched, polled for its exit, and (on cancellation) stopped.
//! The supervisor never cares which backend it is talking to; threads and
//! forked child processes expose the same three capabilities.

use crate::error::{Error, Result};
use crate::execution::ExecutionMode;
use crate::stage::{RunResult, Stage};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Child exit code for a clean [`RunResult::Failed`] return.
const EXIT_FAILED: i32 = 1;
/// Child exit code when the stage runner panicked.
const EXIT_PANICKED: i32 = 2;

/// How a unit left the world.
#[derive(Debug)]
pub(crate) enum UnitExit {
    /// Clean success; the stage is complete for this run.
    Succeeded,
    /// Clean failure reported by the runner.
    Failed(Error),
    /// The unit died without returning: panic, signal, or bad exit code.
    Crashed(String),
}

/// One launched generation of a stage.
pub(crate) enum ExecutionUnit {
    /// Spawned OS thread running the stage runner.
    Thread(Option<JoinHandle<RunResult>>),
    /// Forked child process; the runner's result is conveyed via the exit
    /// code (0 success, 1 failed, 2 panicked, signals observed by waitpid).
    Process(Pid),
}

impl ExecutionUnit {
    /// Launch a fresh unit for one stage generation.
    pub(crate) fn launch(mode: ExecutionMode, stage: &Arc<Stage>) -> Result<Self> {
        match mode {
            ExecutionMode::Threads => {
                let stage = Arc::clone(stage);
                let handle = std::thread::Builder::new()
                    .name(stage.name().to_string())
                    .spawn(move || stage.run())?;
                Ok(Self::Thread(Some(handle)))
            }
            ExecutionMode::Processes => {
                // The child shares no memory with the supervisor after this
                // point; channels must be on the posix transport, which the
                // assembler validated.
                match unsafe { fork() }? {
                    ForkResult::Child => {
                        let code = match catch_unwind(AssertUnwindSafe(|| stage.run())) {
                            Ok(RunResult::Succeeded) => 0,
                            Ok(RunResult::Failed(_)) => EXIT_FAILED,
                            Err(_) => EXIT_PANICKED,
                        };
                        unsafe { nix::libc::_exit(code) }
                    }
                    ForkResult::Parent { child } => Ok(Self::Process(child)),
                }
            }
        }
    }

    /// Check for unit exit without blocking.
    ///
    /// Returns `None` while the unit is still running. A terminal result is
    /// returned exactly once; polling afterwards keeps returning `None`.
    pub(crate) fn poll(&mut self, stage_name: &str) -> Result<Option<UnitExit>> {
        match self {
            Self::Thread(handle) => {
                if !handle.as_ref().map(JoinHandle::is_finished).unwrap_or(false) {
                    return Ok(None);
                }
                let Some(handle) = handle.take() else {
                    return Ok(None);
                };
                Ok(Some(match handle.join() {
                    Ok(RunResult::Succeeded) => UnitExit::Succeeded,
                    Ok(RunResult::Failed(e)) => UnitExit::Failed(e),
                    Err(payload) => UnitExit::Crashed(panic_reason(payload)),
                }))
            }
            Self::Process(pid) => match waitpid(*pid, Some(WaitPidFlag::WNOHANG))? {
                WaitStatus::StillAlive => Ok(None),
                WaitStatus::Exited(_, 0) => Ok(Some(UnitExit::Succeeded)),
                WaitStatus::Exited(_, EXIT_FAILED) => {
                    Ok(Some(UnitExit::Failed(Error::StageCrashed {
                        stage: stage_name.to_string(),
                        reason: "unit reported failure".into(),
                    })))
                }
                WaitStatus::Exited(_, code) => {
                    Ok(Some(UnitExit::Crashed(format!("exit code {code}"))))
                }
                WaitStatus::Signaled(_, signal, _) => {
                    Ok(Some(UnitExit::Crashed(format!("killed by {signal:?}"))))
                }
                _ => Ok(None),
            },
        }
    }

    /// Stop a still-running unit during cancellation or teardown.
    ///
    /// Thread units are joined (the caller has already cancelled the token
    /// they observe); child processes are killed and reaped.
    pub(crate) fn stop(&mut self) {
        match self {
            Self::Thread(handle) => {
                if let Some(handle) = handle.take() {
                    let _ = handle.join();
                }
            }
            Self::Process(pid) => {
                let _ = kill(*pid, Signal::SIGKILL);
                let _ = waitpid(*pid, None);
            }
        }
    }
}

fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".into()
    }
}
