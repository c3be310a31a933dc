//! Service supervision for the managed tunnel service
//!
//! Reports the service's run state and drives start/stop transitions with
//! bounded waits. When a graceful stop fails, escalates to forced process
//! termination and best-effort environment cleanup (DNS policy rules,
//! virtual adapters) before re-signaling the original failure.

pub mod control;
pub mod host;

use std::fmt;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::config::UpdaterConfig;

pub use control::ScmControl;
pub use host::SystemHost;

/// How often transition waits re-query the service state.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service control failure: {0}")]
    Control(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Run state of the managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
    StartPending,
    StopPending,
    /// The service manager reported something we cannot interpret. The
    /// service is treated as effectively stopped for reporting purposes.
    Unknown,
}

impl ServiceState {
    pub fn is_effectively_stopped(&self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Unknown)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Running => "Running",
            ServiceState::Stopped => "Stopped",
            ServiceState::StartPending => "StartPending",
            ServiceState::StopPending => "StopPending",
            ServiceState::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

/// Interface to the OS service manager for one named service.
pub trait ServiceControl {
    fn query(&mut self) -> Result<ServiceState, ServiceError>;
    fn start(&mut self) -> Result<(), ServiceError>;
    fn stop(&mut self) -> Result<(), ServiceError>;
}

/// Interface to the host for escalation: the process table and the network
/// environment the service leaves behind.
pub trait HostEnvironment {
    /// Pids of processes whose executable name matches the service binary.
    fn matching_pids(&mut self, exe_name: &str) -> Vec<u32>;
    /// Request forced termination. False when the signal could not be sent.
    fn kill(&mut self, pid: u32) -> bool;
    fn is_alive(&mut self, pid: u32) -> bool;
    /// Remove DNS policy rules whose comment carries the given tag.
    fn remove_dns_rules(&mut self, tag: &str) -> Result<(), ServiceError>;
    /// Disable virtual network adapters whose name matches the prefix.
    fn disable_adapters(&mut self, prefix: &str) -> Result<(), ServiceError>;
}

/// Supervisor for one managed service instance.
///
/// Explicitly constructed and scoped to a service name; transitions are not
/// reentrant, so callers drive at most one at a time.
pub struct ServiceSupervisor<C: ServiceControl, H: HostEnvironment> {
    control: C,
    host: H,
    exe_name: String,
    dns_rule_tag: String,
    adapter_prefix: String,
    transition_wait: Duration,
    kill_wait: Duration,
}

impl ServiceSupervisor<ScmControl, SystemHost> {
    /// Supervisor over the real Windows service manager and process table.
    pub fn for_host(config: &UpdaterConfig) -> Self {
        Self::new(
            ScmControl::new(&config.service_name),
            SystemHost::new(),
            config,
        )
    }
}

impl<C: ServiceControl, H: HostEnvironment> ServiceSupervisor<C, H> {
    pub fn new(control: C, host: H, config: &UpdaterConfig) -> Self {
        Self {
            control,
            host,
            exe_name: config.service_exe.clone(),
            dns_rule_tag: config.dns_rule_tag.clone(),
            adapter_prefix: config.adapter_prefix.clone(),
            transition_wait: Duration::from_secs(config.service_wait_secs),
            kill_wait: Duration::from_secs(config.kill_wait_secs),
        }
    }

    /// Current service state, reconciled against the process table.
    ///
    /// The service manager keeps reporting StopPending when the service
    /// crashed or was killed by a user. That is wrong - the service is dead,
    /// not pending. If no matching process exists the state is normalized
    /// to Stopped; if one is found, StopPending stands.
    pub fn query_status(&mut self) -> Result<ServiceState, ServiceError> {
        let state = self.control.query()?;
        debug!("service status asked for. current value: {}", state);

        if state == ServiceState::StopPending {
            let pids = self.host.matching_pids(&self.exe_name);
            if pids.is_empty() {
                warn!(
                    "service manager reports StopPending but there is no {} process! reporting service as stopped",
                    self.exe_name
                );
                return Ok(ServiceState::Stopped);
            }
            if pids.len() > 1 {
                // More than one tunnel process is its own problem, but the
                // service is certainly not dead
                warn!(
                    "found {} {} processes while StopPending",
                    pids.len(),
                    self.exe_name
                );
            }
        }

        Ok(state)
    }

    /// Issue a start and wait up to the bounded transition time for Running.
    ///
    /// The final observed state is returned even when the wait elapses -
    /// a timeout is reported, not thrown.
    pub async fn start(&mut self) -> Result<ServiceState, ServiceError> {
        info!(
            "request to start {} service received... waiting up to {:?} for service start...",
            self.exe_name, self.transition_wait
        );
        self.control.start()?;
        let state = self.wait_for(ServiceState::Running).await;
        info!("request to start service complete. state: {}", state);
        Ok(state)
    }

    /// Issue a graceful stop and wait up to the bounded transition time.
    ///
    /// When the stop call itself fails, escalate: forcibly terminate every
    /// process matching the service executable (bounded wait each, an
    /// un-killable process is logged but not retried), then best-effort
    /// cleanup of DNS rules and virtual adapters. The original stop failure
    /// is re-signaled afterward - cleanup never masks it.
    pub async fn stop(&mut self) -> Result<ServiceState, ServiceError> {
        info!(
            "request to stop {} service received... waiting up to {:?} for service stop...",
            self.exe_name, self.transition_wait
        );

        match self.control.stop() {
            Ok(()) => {
                let state = self.wait_for(ServiceState::Stopped).await;
                info!("request to stop service complete. state: {}", state);
                Ok(state)
            }
            Err(stop_err) => {
                error!(
                    "failed to stop service via the service manager. attempting to find and kill {} directly",
                    self.exe_name
                );
                self.terminate_matching_processes().await;

                info!("graceful shutdown failed. removing all tagged DNS rules");
                if let Err(e) = self.host.remove_dns_rules(&self.dns_rule_tag) {
                    error!("failed to remove DNS rules: {}", e);
                }

                info!(
                    "graceful shutdown failed. disabling all {}* interfaces",
                    self.adapter_prefix
                );
                if let Err(e) = self.host.disable_adapters(&self.adapter_prefix) {
                    error!("failed to disable adapters: {}", e);
                }

                Err(stop_err)
            }
        }
    }

    async fn terminate_matching_processes(&mut self) {
        for pid in self.host.matching_pids(&self.exe_name) {
            warn!("attempting to forcefully terminate process: {}", pid);
            if !self.host.kill(pid) {
                error!("could not signal process: {}", pid);
                continue;
            }
            if self.wait_for_exit(pid).await {
                warn!("terminated process forcefully: {}", pid);
            } else {
                error!(
                    "waited {:?}, could not terminate process: {}",
                    self.kill_wait, pid
                );
            }
        }
    }

    async fn wait_for_exit(&mut self, pid: u32) -> bool {
        let deadline = tokio::time::Instant::now() + self.kill_wait;
        loop {
            if !self.host.is_alive(pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll until the desired state is observed or the bounded wait elapses;
    /// returns the last observed state either way.
    async fn wait_for(&mut self, desired: ServiceState) -> ServiceState {
        let deadline = tokio::time::Instant::now() + self.transition_wait;
        let mut last = ServiceState::Unknown;
        loop {
            match self.query_status() {
                Ok(state) => {
                    if state == desired {
                        return state;
                    }
                    last = state;
                }
                Err(e) => {
                    warn!("status query failed while waiting: {}", e);
                    last = ServiceState::Unknown;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return last;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct FakeControl {
        states: VecDeque<ServiceState>,
        start_result: Result<(), ()>,
        stop_result: Result<(), ()>,
    }

    impl FakeControl {
        fn reporting(states: &[ServiceState]) -> Self {
            Self {
                states: states.iter().copied().collect(),
                start_result: Ok(()),
                stop_result: Ok(()),
            }
        }
    }

    impl ServiceControl for FakeControl {
        fn query(&mut self) -> Result<ServiceState, ServiceError> {
            match self.states.len() {
                0 => Ok(ServiceState::Unknown),
                1 => Ok(*self.states.front().unwrap()),
                _ => Ok(self.states.pop_front().unwrap()),
            }
        }

        fn start(&mut self) -> Result<(), ServiceError> {
            self.start_result
                .map_err(|_| ServiceError::Control("start refused".to_string()))
        }

        fn stop(&mut self) -> Result<(), ServiceError> {
            self.stop_result
                .map_err(|_| ServiceError::Control("access denied".to_string()))
        }
    }

    #[derive(Default)]
    struct FakeHost {
        pids: Vec<u32>,
        killed: Vec<u32>,
        kill_succeeds: bool,
        dns_rules_removed: Vec<String>,
        adapters_disabled: Vec<String>,
        dns_removal_fails: bool,
    }

    impl HostEnvironment for FakeHost {
        fn matching_pids(&mut self, _exe_name: &str) -> Vec<u32> {
            self.pids.clone()
        }

        fn kill(&mut self, pid: u32) -> bool {
            self.killed.push(pid);
            self.kill_succeeds
        }

        fn is_alive(&mut self, pid: u32) -> bool {
            // Killed processes die immediately in the fake
            !self.killed.contains(&pid)
        }

        fn remove_dns_rules(&mut self, tag: &str) -> Result<(), ServiceError> {
            self.dns_rules_removed.push(tag.to_string());
            if self.dns_removal_fails {
                Err(ServiceError::Control("powershell exploded".to_string()))
            } else {
                Ok(())
            }
        }

        fn disable_adapters(&mut self, prefix: &str) -> Result<(), ServiceError> {
            self.adapters_disabled.push(prefix.to_string());
            Ok(())
        }
    }

    fn test_config() -> UpdaterConfig {
        let mut config = UpdaterConfig::default();
        // Keep waits at zero so timeout paths return promptly in tests
        config.service_wait_secs = 0;
        config.kill_wait_secs = 0;
        config
    }

    fn supervisor(
        control: FakeControl,
        host: FakeHost,
    ) -> ServiceSupervisor<FakeControl, FakeHost> {
        ServiceSupervisor::new(control, host, &test_config())
    }

    #[test]
    fn stop_pending_without_process_normalizes_to_stopped() {
        let control = FakeControl::reporting(&[ServiceState::StopPending]);
        let host = FakeHost::default(); // no matching pids
        let mut sup = supervisor(control, host);

        assert_eq!(sup.query_status().unwrap(), ServiceState::Stopped);
    }

    #[test]
    fn stop_pending_with_process_stays_pending() {
        let control = FakeControl::reporting(&[ServiceState::StopPending]);
        let host = FakeHost {
            pids: vec![4312],
            ..FakeHost::default()
        };
        let mut sup = supervisor(control, host);

        assert_eq!(sup.query_status().unwrap(), ServiceState::StopPending);
    }

    #[test]
    fn running_state_passes_through_unchanged() {
        let control = FakeControl::reporting(&[ServiceState::Running]);
        let mut sup = supervisor(control, FakeHost::default());

        assert_eq!(sup.query_status().unwrap(), ServiceState::Running);
    }

    #[tokio::test]
    async fn start_reports_running_when_reached() {
        let control = FakeControl::reporting(&[ServiceState::Running]);
        let mut sup = supervisor(control, FakeHost::default());

        assert_eq!(sup.start().await.unwrap(), ServiceState::Running);
    }

    #[tokio::test]
    async fn start_timeout_reports_last_state_not_error() {
        // Never reaches Running; zero wait makes the bound elapse at once
        let control = FakeControl::reporting(&[ServiceState::StartPending]);
        let mut sup = supervisor(control, FakeHost::default());

        let state = sup.start().await.unwrap();
        assert_eq!(state, ServiceState::StartPending);
    }

    #[tokio::test]
    async fn graceful_stop_waits_for_stopped() {
        let control = FakeControl::reporting(&[ServiceState::Stopped]);
        let mut sup = supervisor(control, FakeHost::default());

        assert_eq!(sup.stop().await.unwrap(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn failed_stop_escalates_and_resignals_original_error() {
        let mut control = FakeControl::reporting(&[ServiceState::StopPending]);
        control.stop_result = Err(());
        let host = FakeHost {
            pids: vec![101, 102],
            kill_succeeds: true,
            ..FakeHost::default()
        };
        let mut sup = supervisor(control, host);

        let err = sup.stop().await.unwrap_err();
        assert!(matches!(err, ServiceError::Control(ref m) if m == "access denied"));

        assert_eq!(sup.host.killed, vec![101, 102]);
        assert_eq!(sup.host.dns_rules_removed, vec!["Added by veiltunnel-svc"]);
        assert_eq!(sup.host.adapters_disabled, vec!["veil"]);
    }

    #[tokio::test]
    async fn cleanup_step_failure_does_not_mask_stop_error_or_skip_later_steps() {
        let mut control = FakeControl::reporting(&[ServiceState::StopPending]);
        control.stop_result = Err(());
        let host = FakeHost {
            kill_succeeds: true,
            dns_removal_fails: true,
            ..FakeHost::default()
        };
        let mut sup = supervisor(control, host);

        let err = sup.stop().await.unwrap_err();
        // Original failure, not the DNS cleanup one
        assert!(matches!(err, ServiceError::Control(ref m) if m == "access denied"));
        // Adapter disable still ran after the DNS step failed
        assert_eq!(sup.host.adapters_disabled, vec!["veil"]);
    }

    #[tokio::test]
    async fn unkillable_process_is_logged_not_fatal() {
        let mut control = FakeControl::reporting(&[ServiceState::StopPending]);
        control.stop_result = Err(());
        let host = FakeHost {
            pids: vec![55],
            kill_succeeds: false, // signal cannot even be sent
            ..FakeHost::default()
        };
        let mut sup = supervisor(control, host);

        let err = sup.stop().await.unwrap_err();
        assert!(matches!(err, ServiceError::Control(_)));
        // Cleanup still ran
        assert_eq!(sup.host.dns_rules_removed.len(), 1);
        assert_eq!(sup.host.adapters_disabled.len(), 1);
    }

    #[test]
    fn state_strings_are_reportable() {
        assert_eq!(ServiceState::Running.to_string(), "Running");
        assert_eq!(ServiceState::StopPending.to_string(), "StopPending");
        assert!(ServiceState::Unknown.is_effectively_stopped());
        assert!(!ServiceState::StartPending.is_effectively_stopped());
    }
}
