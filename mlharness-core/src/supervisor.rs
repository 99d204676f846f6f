//! Lifecycle of the service under test and its datastore container
//!
//! Stopping is best-effort everywhere in this module: teardown logs what went
//! wrong and carries on, it never returns an error.

use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tracing::{debug, info, warn};

use crate::config::{ContainerConfig, HarnessConfig, ServiceConfig};
use crate::error::{HarnessError, HarnessResult};

/// How to launch the service process
#[derive(Debug, Clone, Default)]
pub struct ServiceCommand {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    /// Receives stdout and stderr; discarded when unset
    pub log_path: Option<PathBuf>,
}

impl ServiceCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `<runtime> -m <module> --api <kinds> [--config <path>]`
    pub fn from_config(service: &ServiceConfig) -> Self {
        let mut command = Self::new(&service.runtime)
            .arg("-m")
            .arg(&service.module)
            .arg("--api")
            .arg(service.apis.join(","));

        if let Some(path) = &service.config_path {
            command = command.arg("--config").arg(path.display().to_string());
        }
        command.workdir = service.workdir.clone();
        command.log_path = service.log_path.clone();
        command
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn spawn(&self) -> HarnessResult<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null());

        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        match &self.log_path {
            Some(path) => {
                let log = File::create(path)?;
                cmd.stdout(log.try_clone()?).stderr(log);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        cmd.spawn()
            .map_err(|e| HarnessError::process(format!("failed to start '{}': {}", self.command_line(), e)))
    }
}

/// A running (or attached) service instance
#[derive(Debug)]
pub struct ServiceHandle {
    pid: Option<u32>,
    address: String,
    liveness_url: String,
    child: Option<Child>,
}

impl ServiceHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn liveness_url(&self) -> &str {
        &self.liveness_url
    }

    /// False for attached services and after `stop`
    pub fn is_owned(&self) -> bool {
        self.child.is_some()
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Datastore container, remembered only when this run started it
#[derive(Debug)]
struct StartedContainer {
    config: ContainerConfig,
    launcher: Option<Child>,
}

/// Spawns and terminates the service bound to a known port
#[derive(Debug)]
pub struct ProcessSupervisor {
    host: String,
    port: u16,
    liveness_url: String,
    container: Option<StartedContainer>,
}

impl ProcessSupervisor {
    pub fn new(host: impl Into<String>, port: u16, liveness_url: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            liveness_url: liveness_url.into(),
            container: None,
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(
            config.service.host.clone(),
            config.service.http_port,
            config.liveness_url(),
        )
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn start(&self, command: &ServiceCommand) -> HarnessResult<ServiceHandle> {
        info!("🚀 Starting service: {}", command.command_line());

        let child = command.spawn()?;
        let pid = child.id();
        debug!(pid, address = %self.address(), "service process spawned");

        Ok(ServiceHandle {
            pid: Some(pid),
            address: self.address(),
            liveness_url: self.liveness_url.clone(),
            child: Some(child),
        })
    }

    /// Handle for a service someone else runs; stopping it is a no-op
    pub fn attach(&self) -> ServiceHandle {
        info!("🔗 Attaching to service at {}", self.address());

        ServiceHandle {
            pid: None,
            address: self.address(),
            liveness_url: self.liveness_url.clone(),
            child: None,
        }
    }

    /// Terminate a spawned service.
    ///
    /// The service may fork workers that keep the port after the spawned
    /// process dies, so whoever listens on the port is killed first.
    pub fn stop(&self, handle: &mut ServiceHandle) {
        let mut child = match handle.child.take() {
            Some(child) => child,
            None => {
                debug!(address = %handle.address, "service not owned, nothing to stop");
                return;
            }
        };

        info!("🛑 Stopping service pid {}", child.id());

        if let Some(pid) = find_listener_pid(self.port) {
            if pid != std::process::id() && pid != child.id() {
                debug!(pid, port = self.port, "killing port listener");
                kill_pid(pid);
            }
        }

        if let Err(e) = child.kill() {
            debug!(error = %e, "service process already gone");
        }
        if let Err(e) = child.wait() {
            warn!("Failed to reap service process: {}", e);
        }
    }

    /// Start the datastore container unless one with the same name runs.
    ///
    /// Returns true when this call started it; only then is it stopped
    /// again by [`stop_container`](Self::stop_container).
    pub fn start_container(&mut self, config: &ContainerConfig) -> HarnessResult<bool> {
        if is_container_running(&config.name)? {
            info!("🐳 Container {} already running", config.name);
            return Ok(false);
        }

        let (program, args) = config
            .start_command
            .split_first()
            .ok_or_else(|| HarnessError::configuration("container start command is empty"))?;

        info!("🐳 Starting container {}", config.name);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &config.workdir {
            cmd.current_dir(dir);
        }

        let launcher = cmd
            .spawn()
            .map_err(|e| HarnessError::process(format!("failed to start container {}: {}", config.name, e)))?;

        self.container = Some(StartedContainer {
            config: config.clone(),
            launcher: Some(launcher),
        });
        Ok(true)
    }

    pub fn stop_container(&mut self) {
        let Some(mut started) = self.container.take() else {
            return;
        };

        info!("🐳 Stopping container {}", started.config.name);

        if let Some((program, args)) = started.config.stop_command.split_first() {
            let mut cmd = Command::new(program);
            cmd.args(args).stdout(Stdio::null()).stderr(Stdio::null());
            if let Some(dir) = &started.config.workdir {
                cmd.current_dir(dir);
            }
            match cmd.status() {
                Ok(status) if status.success() => {}
                Ok(status) => warn!("Container stop command exited with {}", status),
                Err(e) => warn!("Failed to run container stop command: {}", e),
            }
        }

        if let Some(mut launcher) = started.launcher.take() {
            let _ = launcher.kill();
            let _ = launcher.wait();
        }
    }
}

/// Owns the supervisor for a run and tears everything down exactly once,
/// on every exit path
pub struct ServiceGuard {
    supervisor: ProcessSupervisor,
    handle: Option<ServiceHandle>,
    released: bool,
}

impl ServiceGuard {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self {
            supervisor,
            handle: None,
            released: false,
        }
    }

    pub fn supervisor_mut(&mut self) -> &mut ProcessSupervisor {
        &mut self.supervisor
    }

    /// Spawn the service; it is stopped on release
    pub fn start(&mut self, command: &ServiceCommand) -> HarnessResult<&ServiceHandle> {
        let handle = self.supervisor.start(command)?;
        Ok(&*self.handle.insert(handle))
    }

    pub fn attach(&mut self) -> &ServiceHandle {
        let handle = self.supervisor.attach();
        self.handle.insert(handle)
    }

    /// Stop the service and any container this run started.
    /// Returns false when teardown already happened.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;

        if let Some(mut handle) = self.handle.take() {
            self.supervisor.stop(&mut handle);
        }
        self.supervisor.stop_container();
        true
    }
}

impl Drop for ServiceGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn is_container_running(name: &str) -> HarnessResult<bool> {
    let filter = format!("name={}", name);
    let output = Command::new("docker")
        .args(["ps", "--filter", filter.as_str(), "--format", "{{.Names}}"])
        .output()
        .map_err(|e| HarnessError::process(format!("failed to run docker ps: {}", e)))?;

    if !output.status.success() {
        return Err(HarnessError::process(format!(
            "docker ps failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .any(|line| line.trim() == name))
}

fn kill_pid(pid: u32) {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    let Some(process) = system.process(pid) else {
        debug!(%pid, "port listener already exited");
        return;
    };

    match process.kill_with(Signal::Kill) {
        Some(true) => debug!(%pid, name = ?process.name(), "sent SIGKILL to port listener"),
        Some(false) => warn!("Failed to kill port listener {}", pid),
        None => warn!("SIGKILL is not supported here, port listener {} left running", pid),
    }
}

/// Pid of the process holding a listening TCP socket on `port`
#[cfg(target_os = "linux")]
pub fn find_listener_pid(port: u16) -> Option<u32> {
    let inodes: Vec<String> = ["/proc/net/tcp", "/proc/net/tcp6"]
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .flat_map(|table| listening_inodes(&table, port))
        .collect();

    if inodes.is_empty() {
        return None;
    }

    let targets: Vec<String> = inodes.iter().map(|i| format!("socket:[{}]", i)).collect();

    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let pid = match entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
            Some(pid) => pid,
            None => continue,
        };

        let fds = match std::fs::read_dir(entry.path().join("fd")) {
            Ok(fds) => fds,
            Err(_) => continue,
        };

        for fd in fds.flatten() {
            if let Ok(link) = std::fs::read_link(fd.path()) {
                if targets.iter().any(|t| link.as_os_str() == t.as_str()) {
                    return Some(pid);
                }
            }
        }
    }

    None
}

#[cfg(not(target_os = "linux"))]
pub fn find_listener_pid(_port: u16) -> Option<u32> {
    None
}

/// Socket inodes in LISTEN state on `port` from a `/proc/net/tcp` table
#[cfg(target_os = "linux")]
fn listening_inodes(table: &str, port: u16) -> Vec<String> {
    const LISTEN: &str = "0A";

    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != LISTEN {
                return None;
            }
            let local_port = fields[1].rsplit(':').next()?;
            if u16::from_str_radix(local_port, 16).ok()? != port {
                return None;
            }
            Some(fields[9].to_string())
        })
        .collect()
}
