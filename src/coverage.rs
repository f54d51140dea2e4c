//! Restarting coverage measurement across forks.
//!
//! The harness does not measure anything by itself. A [`CoverageController`] drives whatever
//! tool does, and [`setup_coverage`] wires a [`CoverageSession`] around it into a
//! [`ForkHooks`] registry so each forked child starts its own measurement.

use std::sync::{Arc, Mutex, TryLockError};
use tracing::{debug, info, warn};

use super::Result;
use crate::config::HarnessConfig;
use crate::fork_hooks::ForkHooks;

/// Handle on a coverage measurement tool
pub trait CoverageController: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    /// Persists what has been collected so far
    fn save(&mut self) -> Result<()>;
}

/// A coverage controller together with whether it is currently measuring.
///
/// Dropping an active session stops and saves it.
#[derive(Debug)]
pub struct CoverageSession<C: CoverageController> {
    controller: C,
    active: bool,
}

impl<C: CoverageController> CoverageSession<C> {
    /// Wraps `controller` in an inactive session; nothing is measured until [`restart`](Self::restart)
    pub fn new(controller: C) -> Self {
        Self {
            controller,
            active: false,
        }
    }

    /// True while a measurement started by this session is running
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Saves and stops a running measurement, then starts a new one
    pub fn restart(&mut self) -> Result<()> {
        if self.active {
            self.controller.save()?;
            self.controller.stop()?;
            self.active = false;
        }
        self.controller.start()?;
        self.active = true;
        Ok(())
    }

    /// Stops and saves a running measurement. Does nothing when inactive.
    pub fn finish(&mut self) -> Result<()> {
        if self.active {
            self.active = false;
            self.controller.stop()?;
            self.controller.save()?;
        }
        Ok(())
    }
}

impl<C: CoverageController> Drop for CoverageSession<C> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("Failed to save coverage data: {}", e);
        }
    }
}

/// True when `env_var` is set to a non-empty value
pub fn coverage_enabled(env_var: &str) -> bool {
    std::env::var_os(env_var).is_some_and(|value| !value.is_empty())
}

/// Starts a session around `controller` and registers a child hook restarting it after fork.
///
/// The hook never blocks: when the session is locked by another thread at fork time, the
/// child keeps the measurement it inherited.
///
/// # Arguments
/// * `controller` - The coverage tool to drive
/// * `hooks` - The registry the restart hook is added to
///
/// # Returns
/// * `Result<Arc<Mutex<CoverageSession<C>>>>` - The running session, shared with the hook
pub fn install_coverage<C>(
    controller: C,
    hooks: &mut ForkHooks,
) -> Result<Arc<Mutex<CoverageSession<C>>>>
where
    C: CoverageController + 'static,
{
    let mut session = CoverageSession::new(controller);
    session.restart()?;

    let session = Arc::new(Mutex::new(session));
    let child_session = Arc::clone(&session);
    hooks.register_child(move || {
        let mut session = match child_session.try_lock() {
            Ok(session) => session,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            // Held by another parent thread at fork time, nobody will release it in the child
            Err(TryLockError::WouldBlock) => return Ok(()),
        };
        session.restart()
    });

    info!("Coverage measurement restarts after fork");
    Ok(session)
}

/// Enables coverage restarts after fork when `env_var` is set to a non-empty value.
///
/// Returns `None` without touching `controller` or `hooks` otherwise.
///
/// # Arguments
/// * `env_var` - Name of the variable that switches coverage on
/// * `controller` - The coverage tool to drive
/// * `hooks` - The registry the restart hook is added to
pub fn setup_coverage<C>(
    env_var: &str,
    controller: C,
    hooks: &mut ForkHooks,
) -> Result<Option<Arc<Mutex<CoverageSession<C>>>>>
where
    C: CoverageController + 'static,
{
    if !coverage_enabled(env_var) {
        debug!("{} not set, coverage hooks disabled", env_var);
        return Ok(None);
    }
    install_coverage(controller, hooks).map(Some)
}

/// Same as [`setup_coverage`], reading the switch variable from `config`
pub fn setup_coverage_from_config<C>(
    config: &HarnessConfig,
    controller: C,
    hooks: &mut ForkHooks,
) -> Result<Option<Arc<Mutex<CoverageSession<C>>>>>
where
    C: CoverageController + 'static,
{
    setup_coverage(&config.coverage_env_var, controller, hooks)
}
