//! Host backend: process table and network-environment cleanup
//!
//! Process enumeration and termination go through sysinfo; the DNS policy
//! rule and adapter cleanup are PowerShell one-liners run hidden with a
//! bounded wait, since they are last-resort steps after a failed stop.

use std::process::Child;
use std::time::{Duration, Instant};

use log::{debug, info};
use sysinfo::{Pid, System};

use super::{HostEnvironment, ServiceError};
use crate::utils::hidden_command;

/// Bounded wait for each cleanup shell-out.
const CLEANUP_WAIT: Duration = Duration::from_secs(60);

pub struct SystemHost {
    system: System,
}

impl SystemHost {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

/// Match a process-table name against the service executable name. The
/// process table reports `veiltunnel-svc.exe` on Windows.
fn name_matches(process_name: &str, exe_name: &str) -> bool {
    process_name == exe_name
        || process_name
            .strip_suffix(".exe")
            .map(|stem| stem == exe_name)
            .unwrap_or(false)
}

/// Run a command, waiting at most `timeout` for it to exit.
fn wait_bounded(mut child: Child, what: &str, timeout: Duration) -> Result<(), ServiceError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(status) if status.success() => {
                debug!("{} completed", what);
                return Ok(());
            }
            Some(status) => {
                return Err(ServiceError::Control(format!(
                    "{} exited with {}",
                    what, status
                )));
            }
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                return Err(ServiceError::Control(format!(
                    "waited {:?}, {} did not complete",
                    timeout, what
                )));
            }
            None => std::thread::sleep(Duration::from_millis(250)),
        }
    }
}

fn run_powershell(script: String, what: &str) -> Result<(), ServiceError> {
    info!("running: powershell {}", script);
    let child = spawn_powershell(&script)?;
    wait_bounded(child, what, CLEANUP_WAIT)
}

fn spawn_powershell(script: &str) -> std::io::Result<Child> {
    hidden_command("powershell")
        .args(["-NoProfile", "-Command", script])
        .spawn()
}

impl HostEnvironment for SystemHost {
    fn matching_pids(&mut self, exe_name: &str) -> Vec<u32> {
        self.system.refresh_processes();
        self.system
            .processes()
            .iter()
            .filter(|(_, process)| name_matches(process.name(), exe_name))
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }

    fn kill(&mut self, pid: u32) -> bool {
        self.system.refresh_processes();
        match self.system.process(Pid::from_u32(pid)) {
            Some(process) => process.kill(),
            None => false,
        }
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        self.system.refresh_processes();
        self.system.process(Pid::from_u32(pid)).is_some()
    }

    fn remove_dns_rules(&mut self, tag: &str) -> Result<(), ServiceError> {
        let script = format!(
            "Get-DnsClientNrptRule | Where-Object {{ $_.Comment -like '{}*' }} \
             | Remove-DnsClientNrptRule -Force -ErrorAction SilentlyContinue",
            tag
        );
        run_powershell(script, "DNS rule removal")
    }

    fn disable_adapters(&mut self, prefix: &str) -> Result<(), ServiceError> {
        let script = format!(
            "Get-NetAdapter | Where-Object {{ $_.Name -like '{}*' }} \
             | Disable-NetAdapter -Confirm:$false -ErrorAction SilentlyContinue",
            prefix
        );
        run_powershell(script, "adapter disable")
    }
}
