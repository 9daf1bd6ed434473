//! Execution context handed to builders.
//!
//! A [`BuildHandle`] is the only door a builder has into the engine: it
//! runs child processes with a timeout, hands out scratch paths under the
//! build tree, forwards progress messages and exposes the cooperative
//! stop flag. Everything a builder does through the handle happens
//! outside the engine lock.

use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::{NamedTempFile, TempDir};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::progress::ProgressSender;

/// How often a waiting `run_command` polls its child for exit.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct BuildHandle<'a> {
    temp_directory: &'a Path,
    command_timeout: Duration,
    stop: &'a AtomicBool,
    progress: &'a ProgressSender,
}

impl<'a> BuildHandle<'a> {
    pub(crate) fn new(
        temp_directory: &'a Path,
        command_timeout: Duration,
        stop: &'a AtomicBool,
        progress: &'a ProgressSender,
    ) -> Self {
        Self {
            temp_directory,
            command_timeout,
            stop,
            progress,
        }
    }

    /// Run a child process and capture its stdout.
    ///
    /// Non-zero exits become [`EngineError::CommandFailed`]; exceeding the
    /// configured timeout kills the child and returns
    /// [`EngineError::Timeout`].
    pub fn run_command<S: AsRef<OsStr>>(&self, argv: &[S]) -> Result<String> {
        self.run_command_with_timeout(argv, self.command_timeout)
    }

    pub fn run_command_with_timeout<S: AsRef<OsStr>>(
        &self,
        argv: &[S],
        timeout: Duration,
    ) -> Result<String> {
        let argv_display: Vec<String> = argv
            .iter()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .collect();
        let (program, args) = match argv.split_first() {
            Some(parts) => parts,
            None => return Err(EngineError::BuilderFailed("empty command line".into())),
        };
        debug!(command = ?argv_display, "running");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(EngineError::Timeout {
                    argv: argv_display,
                    timeout,
                });
            }
            thread::sleep(CHILD_POLL_INTERVAL);
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        if !status.success() {
            return Err(EngineError::CommandFailed {
                argv: argv_display,
                stdout,
                stderr,
                code: status.code().unwrap_or(-1),
            });
        }
        Ok(stdout)
    }

    /// A scratch directory under `<build>/tmp`, removed when dropped.
    pub fn tempdir(&self) -> Result<TempDir> {
        fs::create_dir_all(self.temp_directory)?;
        Ok(tempfile::tempdir_in(self.temp_directory)?)
    }

    /// A scratch file under `<build>/tmp`, removed when dropped. The file
    /// exists and is closed, so child processes may reopen it freely.
    pub fn tempfile(&self, suffix: &str) -> Result<NamedTempFile> {
        fs::create_dir_all(self.temp_directory)?;
        let suffix = if suffix.is_empty() {
            String::new()
        } else {
            format!(".{suffix}")
        };
        Ok(tempfile::Builder::new()
            .suffix(&suffix)
            .tempfile_in(self.temp_directory)?)
    }

    /// Cooperative cancellation point for long-running builders.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    /// Send a message to the progress stream.
    pub fn log(&self, message: impl Into<String>) {
        self.progress.log(message);
    }
}

/// Collect a child pipe to a string on a helper thread, so stdout and
/// stderr cannot deadlock each other on full pipe buffers.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buffer);
        }
        buffer
    })
}
