//! Debuggee process under ptrace control.

use log::{debug, warn};
use nix::sys;
use nix::sys::personality::Persona;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("run {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("attach to {0}: {1}")]
    Attach(Pid, nix::Error),
    #[error("ptrace: {0}")]
    Ptrace(nix::Error),
    #[error("waitpid: {0}")]
    Waitpid(nix::Error),
    #[error("debuggee is not running")]
    NotAlive,
}

/// Why the debuggee stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stopped by a signal, the debuggee can be inspected.
    Stopped(Signal),
    /// Exited with a code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
}

impl StopReason {
    pub fn is_alive(&self) -> bool {
        matches!(self, StopReason::Stopped(_))
    }
}

/// Traced process, stopped whenever the tracer holds control.
pub struct Target {
    pid: Pid,
    program: String,
    /// Attached by pid: detached rather than killed on drop.
    external: bool,
    alive: bool,
    /// Signal to deliver on the next resume.
    pending_signal: Option<Signal>,
}

impl Target {
    /// Run a program under ptrace. The debuggee is stopped right after `exec`.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, TargetError> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        unsafe {
            cmd.pre_exec(|| {
                sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
                sys::ptrace::traceme().map_err(io::Error::from)
            });
        }

        let child = cmd.spawn().map_err(|source| TargetError::Spawn {
            program: program.to_string(),
            source,
        })?;
        let pid = Pid::from_raw(child.id() as i32);

        let mut target = Self {
            pid,
            program: program.to_string(),
            external: false,
            alive: true,
            pending_signal: None,
        };
        match target.wait()? {
            StopReason::Stopped(_) => {
                debug!("debuggee {program} started, pid {pid}");
                Ok(target)
            }
            _ => Err(TargetError::NotAlive),
        }
    }

    /// Attach to a running process and stop it.
    pub fn attach(pid: Pid) -> Result<Self, TargetError> {
        sys::ptrace::attach(pid).map_err(|e| TargetError::Attach(pid, e))?;
        let program = std::fs::read_link(format!("/proc/{pid}/exe"))
            .map(|path| path.to_string_lossy().to_string())
            .unwrap_or_else(|_| pid.to_string());

        let mut target = Self {
            pid,
            program,
            external: true,
            alive: true,
            pending_signal: None,
        };
        loop {
            match target.wait()? {
                StopReason::Stopped(Signal::SIGSTOP) => break,
                // a signal that raced with the attach, deliver it on resume
                StopReason::Stopped(sig) => {
                    target.pending_signal = Some(sig);
                    sys::ptrace::cont(pid, None).map_err(TargetError::Ptrace)?;
                }
                _ => return Err(TargetError::NotAlive),
            }
        }
        debug!("attached to {} ({pid})", target.program);
        Ok(target)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Execute a single instruction.
    pub fn step(&mut self) -> Result<StopReason, TargetError> {
        self.ensure_alive()?;
        let sig = self.pending_signal.take();
        sys::ptrace::step(self.pid, sig).map_err(TargetError::Ptrace)?;
        self.wait()
    }

    /// Resume until the next signal or exit.
    pub fn cont(&mut self) -> Result<StopReason, TargetError> {
        self.ensure_alive()?;
        let sig = self.pending_signal.take();
        sys::ptrace::cont(self.pid, sig).map_err(TargetError::Ptrace)?;
        self.wait()
    }

    fn ensure_alive(&self) -> Result<(), TargetError> {
        if self.alive {
            Ok(())
        } else {
            Err(TargetError::NotAlive)
        }
    }

    fn wait(&mut self) -> Result<StopReason, TargetError> {
        let status = waitpid(self.pid, None).map_err(TargetError::Waitpid)?;
        let reason = match status {
            WaitStatus::Stopped(_, sig) => {
                // SIGINT comes from the console terminal, the debuggee never sees it
                if !matches!(sig, Signal::SIGTRAP | Signal::SIGSTOP | Signal::SIGINT) {
                    self.pending_signal = Some(sig);
                }
                StopReason::Stopped(sig)
            }
            WaitStatus::Exited(_, code) => StopReason::Exited(code),
            WaitStatus::Signaled(_, sig, _) => StopReason::Signaled(sig),
            other => {
                debug!("debuggee stop: {other:?}");
                StopReason::Stopped(Signal::SIGTRAP)
            }
        };
        self.alive = reason.is_alive();
        Ok(reason)
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        if !self.alive {
            return;
        }
        if self.external {
            if let Err(e) = sys::ptrace::detach(self.pid, self.pending_signal) {
                warn!("detach from {}: {e}", self.pid);
            }
        } else {
            _ = sys::signal::kill(self.pid, Signal::SIGKILL);
            _ = waitpid(self.pid, None);
        }
    }
}
