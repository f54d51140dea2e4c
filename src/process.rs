use eyre::eyre;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{pipe2, Pid};
use std::fmt;
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Result;
use crate::buffer::{Buffering, NonBlockingReader, DEFAULT_READ_CHUNK};
use crate::config::{HarnessConfig, ShutdownPolicy};
use crate::environment::Environment;
use crate::fork_hooks::ForkHooks;

/// Describes a process to launch under test
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    argv: Vec<String>,
    environment: Environment,
    working_directory: Option<PathBuf>,
    hooks: ForkHooks,
    shutdown: ShutdownPolicy,
    read_chunk_size: usize,
}

impl ProcessBuilder {
    /// Starts a description from an argument vector.
    ///
    /// Nothing is launched until [`spawn`](Self::spawn). The child inherits our environment
    /// and working directory unless told otherwise.
    ///
    /// # Arguments
    /// * `argv` - The program followed by its arguments; the program is looked up in `PATH`
    ///
    /// # Examples
    /// ```no_run
    /// use proctest::ProcessBuilder;
    ///
    /// let process = ProcessBuilder::new(["my-server", "--port", "8080"])
    ///     .env("RUST_LOG", "debug")
    ///     .current_dir("/tmp")
    ///     .spawn()?;
    /// # Ok::<(), eyre::Report>(())
    /// ```
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            environment: Environment::new(),
            working_directory: None,
            hooks: ForkHooks::new(),
            shutdown: ShutdownPolicy::default(),
            read_chunk_size: DEFAULT_READ_CHUNK,
        }
    }

    /// Sets a variable on top of the inherited environment
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.set(key, value);
        self
    }

    /// Layers a whole set of overrides on top of the inherited environment
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment.extend(environment);
        self
    }

    /// Sets the working directory of the child.
    ///
    /// # Arguments
    /// * `dir` - Directory the child starts in, relative paths resolve against ours
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Hooks to run in the child between fork and exec
    pub fn fork_hooks(mut self, hooks: ForkHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Sets how long [`ManagedProcess::close`] waits after SIGINT and SIGTERM.
    ///
    /// # Arguments
    /// * `policy` - Number of polls and poll interval for each escalation step
    pub fn shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown = policy;
        self
    }

    /// Sets the size of a single read from the output pipe.
    ///
    /// # Arguments
    /// * `size` - Bytes per read, zero is raised to one
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    /// Takes the shutdown timings and read size from `config`
    pub fn config(self, config: &HarnessConfig) -> Self {
        self.shutdown_policy(config.shutdown.clone())
            .read_chunk_size(config.read_chunk_size)
    }

    /// Launches the process with stderr merged into stdout.
    ///
    /// The read side of the output pipe is non-blocking before this returns. Registered
    /// fork hooks run in the child before exec.
    ///
    /// # Returns
    /// * `Result<ManagedProcess>` - The running process, or an error if `argv` is empty or
    ///   the program could not be executed
    pub fn spawn(self) -> Result<ManagedProcess> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| eyre!("Cannot launch a process from an empty argument vector"))?;

        // Both stdout and stderr of the child point to the same pipe. Created close-on-exec
        // so that children launched concurrently from other threads do not inherit it.
        let (output, input) = pipe2(OFlag::O_CLOEXEC)?;

        let mut command = Command::new(program);
        command.args(args);
        self.environment.apply(&mut command);
        if let Some(ref dir) = self.working_directory {
            command.current_dir(dir);
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::from(input.try_clone()?));
        command.stderr(Stdio::from(input));

        if !self.hooks.is_empty() {
            let hooks = self.hooks.clone();
            unsafe {
                command.pre_exec(move || {
                    hooks.run_child();
                    Ok(())
                });
            }
        }

        let child = command
            .spawn()
            .map_err(|e| eyre!("Failed to launch {:?}: {}", self.argv, e))?;
        // Release our copies of the write end so only the child holds it
        drop(command);

        let pid = Pid::from_raw(i32::try_from(child.id())?);
        let output = NonBlockingReader::with_chunk_size(File::from(output), self.read_chunk_size)?;

        info!("Launched {:?} with PID {}", self.argv, pid);
        Ok(ManagedProcess {
            argv: self.argv,
            child,
            pid,
            output,
            shutdown: self.shutdown,
            status: None,
            closed: false,
        })
    }
}

/// A launched process whose merged output is collected without blocking.
///
/// Closing it (explicitly or on drop) walks the SIGINT -> SIGTERM -> SIGKILL escalation of
/// its [`ShutdownPolicy`] and always reaps the process.
pub struct ManagedProcess {
    argv: Vec<String>,
    child: Child,
    pid: Pid,
    output: NonBlockingReader<File>,
    shutdown: ShutdownPolicy,
    status: Option<ExitStatus>,
    closed: bool,
}

impl ManagedProcess {
    /// Launches `argv` with the default settings
    pub fn spawn<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessBuilder::new(argv).spawn()
    }

    /// Starts describing a launch of `argv`, see [`ProcessBuilder`]
    pub fn builder<I, S>(argv: I) -> ProcessBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessBuilder::new(argv)
    }

    /// PID of the child, still reported after it has been reaped
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// True until the process has exited
    pub fn is_alive(&mut self) -> bool {
        self.poll().is_none()
    }

    /// Exit status, once the process has exited
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.poll()
    }

    /// Delivers `signal` to the process.
    ///
    /// Once the process has exited and been collected this does nothing, so a recycled
    /// PID is never signalled.
    pub fn signal(&mut self, signal: Signal) -> Result<()> {
        if self.poll().is_some() {
            debug!("Not sending {:?} to exited process {}", signal, self.pid);
            return Ok(());
        }
        debug!("Sending {:?} to process {}", signal, self.pid);
        kill(self.pid, signal)?;
        Ok(())
    }

    /// Collects any available output and returns everything collected so far
    pub fn read(&mut self) -> &str {
        self.output.read()
    }

    /// Forgets the output collected so far
    pub fn reset(&mut self) {
        self.output.reset()
    }

    /// Output collected so far, without reading
    pub fn output(&self) -> &str {
        self.output.contents()
    }

    /// Stops and reaps the process.
    ///
    /// Sends SIGINT and polls for exit; if the process is still running, sends SIGTERM and
    /// polls again; if it survives that too, it is reported as `KILLED` on stderr and sent
    /// SIGKILL. Each window is configured by the [`ShutdownPolicy`].
    ///
    /// A process that is already gone is not an error. Other signal failures are returned,
    /// but the output is still drained and the process still waited for. Calling this
    /// again does nothing.
    ///
    /// # Returns
    /// * `Result<()>` - The first signalling or waiting error, if any
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let stopped = match self.stop() {
            Err(e) if is_no_such_process(&e) => Ok(()),
            other => other,
        };
        let reaped = self.reap();
        stopped.and(reaped)
    }

    fn stop(&mut self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        let policy = self.shutdown.clone();

        self.signal(Signal::SIGINT)?;
        if self.wait_for_exit(policy.interrupt_polls, policy.interrupt_poll_interval) {
            return Ok(());
        }

        debug!("Process {} still running after SIGINT, sending SIGTERM", self.pid);
        self.signal(Signal::SIGTERM)?;
        if self.wait_for_exit(policy.terminate_polls, policy.terminate_poll_interval) {
            return Ok(());
        }

        eprintln!("KILLED {}", self);
        warn!("Process {} ignored SIGINT and SIGTERM, killing it", self.pid);
        self.signal(Signal::SIGKILL)
    }

    /// Sleeps `interval` up to `polls` times, returning as soon as the process has exited
    fn wait_for_exit(&mut self, polls: u32, interval: Duration) -> bool {
        for _ in 0..polls {
            sleep(interval);
            if !self.is_alive() {
                return true;
            }
        }
        false
    }

    fn reap(&mut self) -> Result<()> {
        self.output.read();
        drop(self.output.take_source());
        drop(self.child.stdin.take());
        drop(self.child.stdout.take());
        drop(self.child.stderr.take());

        let status = self.child.wait()?;
        self.status = Some(status);
        debug!("Process {} reaped with {}", self.pid, status);
        Ok(())
    }

    fn poll(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.status = status,
                Err(e) => warn!("Failed to poll process {}: {}", self.pid, e),
            }
        }
        self.status
    }
}

impl Buffering for ManagedProcess {
    fn read(&mut self) -> &str {
        ManagedProcess::read(self)
    }

    fn reset(&mut self) {
        ManagedProcess::reset(self)
    }
}

impl fmt::Display for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManagedProcess(pid={}, argv={:?})", self.pid, self.argv)
    }
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("pid", &self.pid)
            .field("argv", &self.argv)
            .field("status", &self.status)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            eprintln!("Failed to close {}: {}", self, e);
        }
    }
}

fn is_no_such_process(error: &eyre::Report) -> bool {
    matches!(error.downcast_ref::<nix::Error>(), Some(Errno::ESRCH))
}
