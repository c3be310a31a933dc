//! Service-manager backend over sc.exe
//!
//! Shells out through a hidden command so background update cycles never
//! flash a console window at the user.

use log::debug;

use super::{ServiceControl, ServiceError, ServiceState};
use crate::utils::hidden_command;

/// Control handle for one named Windows service.
pub struct ScmControl {
    service_name: String,
}

impl ScmControl {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
        }
    }

    fn run_sc(&self, verb: &str) -> Result<String, ServiceError> {
        let output = hidden_command("sc")
            .args([verb, &self.service_name])
            .output()?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServiceError::Control(format!(
                "sc {} {} failed: {}",
                verb,
                self.service_name,
                if stderr.trim().is_empty() {
                    stdout.trim()
                } else {
                    stderr.trim()
                }
            )));
        }

        Ok(stdout)
    }
}

impl ServiceControl for ScmControl {
    fn query(&mut self) -> Result<ServiceState, ServiceError> {
        let stdout = self.run_sc("query")?;
        let state = parse_sc_state(&stdout)?;
        debug!("sc query {} -> {}", self.service_name, state);
        Ok(state)
    }

    fn start(&mut self) -> Result<(), ServiceError> {
        self.run_sc("start").map(|_| ())
    }

    fn stop(&mut self) -> Result<(), ServiceError> {
        self.run_sc("stop").map(|_| ())
    }
}

/// Parse the STATE line of `sc query` output.
///
/// The line looks like `        STATE              : 4  RUNNING`; the
/// numeric code is authoritative, the trailing word is display only.
fn parse_sc_state(output: &str) -> Result<ServiceState, ServiceError> {
    let state_line = output
        .lines()
        .find(|line| line.trim_start().starts_with("STATE"))
        .ok_or_else(|| ServiceError::Control("no STATE line in sc query output".to_string()))?;

    let code = state_line
        .split(':')
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|token| token.parse::<u32>().ok())
        .ok_or_else(|| {
            ServiceError::Control(format!("unparseable STATE line: '{}'", state_line.trim()))
        })?;

    Ok(match code {
        1 => ServiceState::Stopped,
        2 => ServiceState::StartPending,
        3 => ServiceState::StopPending,
        4 => ServiceState::Running,
        _ => ServiceState::Unknown,
    })
}
