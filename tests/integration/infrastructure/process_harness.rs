use eyre::{Result, WrapErr};
use proctest::{Environment, HarnessConfig, ManagedProcess, ShutdownPolicy};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Writes throwaway shell scripts and launches them as managed processes
pub struct ScriptHarness {
    temp_dir: TempDir,
    config: HarnessConfig,
    environment: Environment,
    shutdown: Option<ShutdownPolicy>,
}

impl ScriptHarness {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new().wrap_err("Failed to create temporary directory")?;
        let config = HarnessConfig::from_env().wrap_err("Invalid PROCTEST_* settings")?;
        Ok(Self {
            temp_dir,
            config,
            environment: Environment::new(),
            shutdown: None,
        })
    }

    /// Set an environment variable for spawned processes
    pub fn set_environment(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.environment.set(key, value);
    }

    /// Use a custom shutdown policy instead of the default one
    pub fn set_shutdown(&mut self, policy: ShutdownPolicy) {
        self.shutdown = Some(policy);
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Write an executable `sh` script named `name`
    pub fn write_script(&self, name: &str, body: &str) -> Result<PathBuf> {
        let path = self.temp_dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body))
            .wrap_err_with(|| format!("Failed to write script {}", name))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    /// Write and launch a script
    pub fn spawn_script(&self, name: &str, body: &str) -> Result<ManagedProcess> {
        let path = self.write_script(name, body)?;
        // Exec'ing a freshly written file can fail with ETXTBSY
        self.spawn(&["sh", &*path.to_string_lossy()])
    }

    /// Launch an arbitrary command with the harness environment
    pub fn spawn(&self, argv: &[&str]) -> Result<ManagedProcess> {
        let mut builder = ManagedProcess::builder(argv.iter().copied())
            .config(&self.config)
            .environment(self.environment.clone())
            .current_dir(self.temp_dir.path());
        if let Some(ref policy) = self.shutdown {
            builder = builder.shutdown_policy(policy.clone());
        }
        builder
            .spawn()
            .wrap_err_with(|| format!("Failed to spawn {:?}", argv))
    }
}

/// A script that prints `ready` and then ignores SIGINT but dies on SIGTERM
pub const IGNORES_INTERRUPT: &str = "trap '' INT\necho ready\nexec sleep 30";

/// A script that prints `ready` and then ignores both SIGINT and SIGTERM
pub const IGNORES_INTERRUPT_AND_TERMINATE: &str = "trap '' INT TERM\necho ready\nexec sleep 30";

/// True once `pid` has been reaped and no longer exists
pub fn is_reaped(pid: nix::unistd::Pid) -> bool {
    matches!(
        nix::sys::wait::waitpid(pid, Some(nix::sys::wait::WaitPidFlag::WNOHANG)),
        Err(nix::errno::Errno::ECHILD)
    )
}
