use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::termios::Termios;
use nix::unistd::{fork, write, ForkResult};
use std::fmt;
use std::os::fd::BorrowedFd;
use std::sync::Arc;

use super::Result;

/// Callback run in a freshly forked child
pub type ChildHook = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Registry of callbacks to run in the child right after a fork.
///
/// Whoever forks calls [`run_child`](Self::run_child) explicitly: [`ProcessBuilder`] does it
/// before exec, and [`fork`](Self::fork) / [`forkpty`](Self::forkpty) do it for code that
/// forks without exec.
///
/// [`ProcessBuilder`]: crate::process::ProcessBuilder
#[derive(Clone, Default)]
pub struct ForkHooks {
    child: Vec<ChildHook>,
}

impl ForkHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a callback for the child side of every subsequent fork
    pub fn register_child<F>(&mut self, hook: F)
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.child.push(Arc::new(hook));
    }

    /// Number of registered child hooks
    pub fn len(&self) -> usize {
        self.child.len()
    }

    pub fn is_empty(&self) -> bool {
        self.child.is_empty()
    }

    /// Runs every child hook in registration order.
    ///
    /// A failing hook does not prevent the others from running. Failures are reported on
    /// stderr with a fixed message written straight to the descriptor: between fork and
    /// exec the child may not take the locks behind `eprintln!` or `tracing`.
    pub fn run_child(&self) {
        for hook in &self.child {
            if hook().is_err() {
                report_child_failure();
            }
        }
    }

    /// Forks the current process and runs the child hooks on the child side.
    ///
    /// # Safety
    ///
    /// Same contract as [`nix::unistd::fork`]: in a multi-threaded program the child may
    /// only call async-signal-safe functions until it execs, and that includes the hooks.
    pub unsafe fn fork(&self) -> nix::Result<ForkResult> {
        let result = unsafe { fork() }?;
        if result.is_child() {
            self.run_child();
        }
        Ok(result)
    }

    /// Like [`fork`](Self::fork), with the child attached to a new pseudo terminal.
    ///
    /// # Safety
    ///
    /// Same contract as [`nix::pty::forkpty`].
    pub unsafe fn forkpty(
        &self,
        winsize: Option<&Winsize>,
        termios: Option<&Termios>,
    ) -> nix::Result<ForkptyResult> {
        let result = unsafe { forkpty(winsize, termios) }?;
        if matches!(result, ForkptyResult::Child) {
            self.run_child();
        }
        Ok(result)
    }
}

fn report_child_failure() {
    let stderr = unsafe { BorrowedFd::borrow_raw(libc::STDERR_FILENO) };
    let _ = write(stderr, CHILD_FAILURE_MESSAGE);
}

const CHILD_FAILURE_MESSAGE: &[u8] = b"post-fork hook failed\n";

impl fmt::Debug for ForkHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkHooks")
            .field("child_hooks", &self.child.len())
            .finish()
    }
}
