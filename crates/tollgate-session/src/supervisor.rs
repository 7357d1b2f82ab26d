//! Engine Process Supervisor
//!
//! Owns at most one running engine child process. The engine is invoked as
//!
//! ```text
//! <binary> -d <data_dir> -f <config_path>
//! ```
//!
//! with `data_dir` as its working directory. Its stdout and stderr are
//! drained line by line into `tracing` under the `tollgate::engine` target.
//!
//! Process errors never escape this module: every operation reports a
//! `bool` and logs the reason.

use crate::config::{DEFAULT_CONTROLLER_ADDR, SessionConfig};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default crash-detection window after spawn
pub const DEFAULT_CRASH_WINDOW: Duration = Duration::from_millis(500);

/// Engine config written on first use, with the controller on `controller_addr`
pub fn default_engine_config(controller_addr: &str) -> String {
    format!(
        "port: 7890\n\
         socks-port: 7891\n\
         allow-lan: false\n\
         mode: rule\n\
         log-level: info\n\
         external-controller: {}\n\
         tun:\n  enable: false\n",
        controller_addr
    )
}

/// Engine process supervisor
#[derive(Debug)]
pub struct ProcessSupervisor {
    binary: PathBuf,
    data_dir: PathBuf,
    controller_addr: String,
    crash_window: Duration,
    child: Mutex<Option<Child>>,
    /// Last observed liveness, read when the child lock is busy
    alive: AtomicBool,
}

impl ProcessSupervisor {
    /// Create a supervisor for `binary`, rooted at `data_dir`
    pub fn new(binary: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            data_dir: data_dir.into(),
            controller_addr: DEFAULT_CONTROLLER_ADDR.to_string(),
            crash_window: DEFAULT_CRASH_WINDOW,
            child: Mutex::new(None),
            alive: AtomicBool::new(false),
        }
    }

    /// Create a supervisor from session configuration
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(&config.engine_binary, &config.data_dir)
            .with_controller_addr(&config.controller_addr)
            .with_crash_window(config.crash_window())
    }

    /// Controller `host:port` written into a fresh engine config
    pub fn with_controller_addr(mut self, addr: impl Into<String>) -> Self {
        self.controller_addr = addr.into();
        self
    }

    /// Override the crash-detection window
    pub fn with_crash_window(mut self, window: Duration) -> Self {
        self.crash_window = window;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Start the engine with `config_path`
    ///
    /// Returns true if the engine is running afterwards, including when it
    /// was already running. Blocks for the crash window.
    pub fn start(&self, config_path: &Path) -> bool {
        let mut slot = self.lock();

        if let Some(child) = slot.as_mut() {
            match child.try_wait() {
                Ok(None) => {
                    debug!("Engine already running (pid {})", child.id());
                    return true;
                }
                Ok(Some(status)) => {
                    info!("Previous engine exited with {}", status);
                }
                Err(e) => {
                    warn!("Failed to poll previous engine: {}", e);
                }
            }
            *slot = None;
            self.alive.store(false, Ordering::SeqCst);
        }

        if !self.binary.is_file() {
            error!("Engine binary not found: {}", self.binary.display());
            return false;
        }

        if let Err(e) = std::fs::create_dir_all(&self.data_dir) {
            error!("Failed to create data dir {}: {}", self.data_dir.display(), e);
            return false;
        }

        let spawned = Command::new(&self.binary)
            .arg("-d")
            .arg(&self.data_dir)
            .arg("-f")
            .arg(config_path)
            .current_dir(&self.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn engine {}: {}", self.binary.display(), e);
                return false;
            }
        };

        if let Some(stdout) = child.stdout.take() {
            drain_output("engine-stdout", "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            drain_output("engine-stderr", "stderr", stderr);
        }

        // An engine that rejects its config exits almost immediately
        thread::sleep(self.crash_window);

        match child.try_wait() {
            Ok(None) => {
                info!("Engine started (pid {})", child.id());
                *slot = Some(child);
                self.alive.store(true, Ordering::SeqCst);
                true
            }
            Ok(Some(status)) => {
                error!("Engine exited during startup with {}", status);
                false
            }
            Err(e) => {
                error!("Failed to poll engine after spawn: {}", e);
                let _ = child.kill();
                let _ = child.wait();
                false
            }
        }
    }

    /// Stop the engine
    ///
    /// Returns true if no engine is tracked afterwards. A failed wait keeps
    /// the handle so a later call can retry.
    pub fn stop(&self) -> bool {
        let mut slot = self.lock();
        let Some(child) = slot.as_mut() else {
            return true;
        };

        let pid = child.id();
        if let Err(e) = child.kill() {
            // Already exited; wait still reaps it
            debug!("Kill engine (pid {}): {}", pid, e);
        }

        match child.wait() {
            Ok(status) => {
                info!("Engine stopped (pid {}, {})", pid, status);
                *slot = None;
                self.alive.store(false, Ordering::SeqCst);
                true
            }
            Err(e) => {
                error!("Failed to reap engine (pid {}): {}", pid, e);
                false
            }
        }
    }

    /// Check whether the tracked engine is alive
    ///
    /// Never blocks: while a start or stop holds the lock, the last observed
    /// value is returned.
    pub fn is_running(&self) -> bool {
        let mut slot = match self.child.try_lock() {
            Ok(slot) => slot,
            Err(TryLockError::WouldBlock) => return self.alive.load(Ordering::SeqCst),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let running = match slot.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        };
        self.alive.store(running, Ordering::SeqCst);
        running
    }

    /// PID of the tracked engine if it is alive
    pub fn pid(&self) -> Option<u32> {
        let mut slot = self.lock();
        let child = slot.as_mut()?;
        match child.try_wait() {
            Ok(None) => Some(child.id()),
            _ => None,
        }
    }

    /// Path of the default engine config
    pub fn default_config_path(&self) -> PathBuf {
        self.data_dir.join("configs").join("default.yaml")
    }

    /// Write the default engine config if it does not exist yet
    pub fn ensure_config_file(&self) -> io::Result<PathBuf> {
        let path = self.default_config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(default_engine_config(&self.controller_addr).as_bytes())?;
                info!("Wrote default engine config {}", path.display());
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
        Ok(path)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Child>> {
        match self.child.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        let slot = match self.child.get_mut() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(child) = slot.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                warn!("Supervisor dropped with live engine (pid {}), killing", child.id());
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

/// Forward a child stream into the log on its own thread
fn drain_output<R: Read + Send + 'static>(thread_name: &str, stream: &'static str, reader: R) {
    let spawned = thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || {
            for line in BufReader::new(reader).lines() {
                match line {
                    Ok(line) => debug!(target: "tollgate::engine", stream, "{}", line),
                    Err(_) => break,
                }
            }
        });

    if let Err(e) = spawned {
        warn!("Failed to spawn {} reader: {}", stream, e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_util::{TempDir, spawn_guard, temp_dir, write_script};

    fn supervisor(dir: &TempDir, body: &str) -> ProcessSupervisor {
        let binary = write_script(dir.path(), body);
        ProcessSupervisor::new(binary, dir.path().join("data"))
            .with_crash_window(Duration::from_millis(200))
    }

    #[test]
    fn test_missing_binary() {
        let _guard = spawn_guard();
        let dir = temp_dir("supervisor");
        let sup = ProcessSupervisor::new(dir.path().join("nope"), dir.path());

        assert!(!sup.start(&dir.path().join("config.yaml")));
        assert!(!sup.is_running());
        assert!(sup.pid().is_none());
    }

    #[test]
    fn test_start_stop_idempotent() {
        let _guard = spawn_guard();
        let dir = temp_dir("supervisor");
        let sup = supervisor(&dir, "exec sleep 30");
        let config = sup.ensure_config_file().unwrap();

        assert!(sup.start(&config));
        assert!(sup.is_running());
        let pid = sup.pid().unwrap();

        assert!(sup.start(&config));
        assert_eq!(sup.pid(), Some(pid));

        assert!(sup.stop());
        assert!(!sup.is_running());
        assert!(sup.stop());
    }

    #[test]
    fn test_crash_during_startup() {
        let _guard = spawn_guard();
        let dir = temp_dir("supervisor");
        let sup = supervisor(&dir, "echo boom\nexit 3");

        assert!(!sup.start(&dir.path().join("config.yaml")));
        assert!(!sup.is_running());
        assert!(sup.stop());
    }

    #[test]
    fn test_restart_after_exit() {
        let _guard = spawn_guard();
        let dir = temp_dir("supervisor");
        let sup = supervisor(&dir, "exec sleep 30");
        let config = sup.ensure_config_file().unwrap();

        assert!(sup.start(&config));
        let first = sup.pid().unwrap();
        // Kill behind the supervisor's back
        std::process::Command::new("kill")
            .arg("-9")
            .arg(first.to_string())
            .status()
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(!sup.is_running());

        assert!(sup.start(&config));
        assert_ne!(sup.pid(), Some(first));
        assert!(sup.stop());
    }

    #[test]
    fn test_invocation_arguments() {
        let _guard = spawn_guard();
        let dir = temp_dir("supervisor");
        let sup = supervisor(&dir, "echo \"$@\" > args.txt\nexec sleep 30");
        let config = sup.ensure_config_file().unwrap();

        assert!(sup.start(&config));
        let args = std::fs::read_to_string(dir.path().join("data").join("args.txt")).unwrap();
        assert_eq!(
            args.trim(),
            format!("-d {} -f {}", dir.path().join("data").display(), config.display())
        );
        assert!(sup.stop());
    }

    #[test]
    fn test_ensure_config_file_never_overwrites() {
        let dir = temp_dir("supervisor");
        let sup = ProcessSupervisor::new(dir.path().join("engine"), dir.path());

        let path = sup.ensure_config_file().unwrap();
        assert_eq!(path, dir.path().join("configs").join("default.yaml"));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("socks-port: 7891"));
        assert!(contents.contains("external-controller: 127.0.0.1:9090"));

        std::fs::write(&path, "mode: global\n").unwrap();
        sup.ensure_config_file().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "mode: global\n");
    }

    #[test]
    fn test_config_file_uses_configured_controller() {
        let dir = temp_dir("supervisor");
        let mut config = SessionConfig::new(dir.path());
        config.controller_addr = "127.0.0.1:19090".to_string();
        let sup = ProcessSupervisor::from_config(&config);

        let path = sup.ensure_config_file().unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("external-controller: 127.0.0.1:19090"));
        assert_eq!(config.controller_url(), "http://127.0.0.1:19090");
    }
}
