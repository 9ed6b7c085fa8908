//! Blocking helpers on top of the reactive engine
//!
//! Each helper submits a request and drives `which_events` /
//! `wait_events` / `service` until the request completes or the
//! configured command timeout passes.

use crate::error::{IscsiError, ScsiResult};
use crate::initiator::IscsiInitiator;
use crate::login::{portal_from_target_address, DiscoveryAddress};
use crate::queue::{Outcome, Reply, TaskHandle};
use crate::scsi::{CommandStatus, ScsiTask};
use log::{info, warn};
use std::time::{Duration, Instant};

/// Longest single wait inside [`IscsiInitiator::run_until`]
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Redirects followed by one login
const MAX_REDIRECTS: u32 = 4;

impl IscsiInitiator {
    /// Drive the engine until `handle` completes
    ///
    /// Protocol errors on other requests are logged and the loop continues;
    /// transport errors end it.
    pub fn run_until(&mut self, handle: &mut TaskHandle, timeout: Duration) -> ScsiResult<Outcome> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = handle.take_outcome() {
                return Ok(outcome);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(IscsiError::Timeout(format!(
                    "itt 0x{:08x} did not complete within {:?}",
                    handle.itt, timeout
                )));
            }

            let interest = self.which_events();
            let revents = self
                .transport
                .wait_events(interest, (deadline - now).min(POLL_INTERVAL))?;
            if revents.is_empty() {
                continue;
            }

            match self.service(revents) {
                Ok(()) => {}
                Err(e @ (IscsiError::Transport(_) | IscsiError::Io(_))) => return Err(e),
                Err(e) => warn!("{}", e),
            }
        }
    }

    /// [`run_until`](Self::run_until) with the command timeout; a request
    /// that times out is cancelled locally
    fn wait_for(&mut self, mut handle: TaskHandle) -> ScsiResult<Outcome> {
        match self.run_until(&mut handle, self.config.command_timeout) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if self.is_outstanding(handle.itt) {
                    let _ = self.cancel(handle.itt);
                }
                Err(e)
            }
        }
    }

    /// Connect when needed and log in, following target redirects
    pub fn login_sync(&mut self) -> ScsiResult<()> {
        for _ in 0..=MAX_REDIRECTS {
            if !self.transport.is_connected() {
                self.connect()?;
            }

            let handle = self.login()?;
            let outcome = self.wait_for(handle)?;
            match outcome.status {
                CommandStatus::Good => return Ok(()),
                CommandStatus::Redirect => {
                    let address = self.session.params.target_address.clone().ok_or_else(|| {
                        IscsiError::Protocol("Redirect without TargetAddress".to_string())
                    })?;
                    let portal = portal_from_target_address(&address).to_string();
                    info!("Following redirect from {} to {}", self.portal, portal);
                    self.disconnect();
                    self.portal = portal;
                }
                _ => {
                    return Err(self
                        .login
                        .failure
                        .take()
                        .unwrap_or_else(|| IscsiError::Session("Login failed".to_string())))
                }
            }
        }
        Err(IscsiError::Session(format!(
            "Gave up after {} login redirects",
            MAX_REDIRECTS
        )))
    }

    /// SendTargets=All on a logged-in discovery session
    pub fn discover_sync(&mut self) -> ScsiResult<Vec<DiscoveryAddress>> {
        let handle = self.discover()?;
        let outcome = self.wait_for(handle)?;
        match (outcome.status, outcome.reply) {
            (CommandStatus::Good, Reply::Discovery(targets)) => Ok(targets),
            (status, _) => Err(IscsiError::Protocol(format!("Discovery failed: {:?}", status))),
        }
    }

    /// Run one SCSI command to completion
    ///
    /// The task comes back for any SCSI status, CHECK CONDITION included.
    pub fn scsi_command_sync(&mut self, task: ScsiTask, lun: u32) -> ScsiResult<ScsiTask> {
        let handle = self.submit(task, lun)?;
        let outcome = self.wait_for(handle)?;
        match outcome.status {
            CommandStatus::Cancelled => Err(IscsiError::Cancelled),
            CommandStatus::Error => Err(IscsiError::Scsi("Command failed".to_string())),
            _ => outcome
                .into_task()
                .ok_or_else(|| IscsiError::Scsi("Completion carried no task".to_string())),
        }
    }

    /// Log out and close the connection
    pub fn logout_sync(&mut self) -> ScsiResult<()> {
        let handle = self.logout()?;
        let result = self.wait_for(handle);
        self.disconnect();
        match result?.status {
            CommandStatus::Good => Ok(()),
            status => Err(IscsiError::Session(format!("Logout failed: {:?}", status))),
        }
    }

    /// Round-trip a NOP and return the echoed payload
    pub fn ping_sync(&mut self, data: Vec<u8>) -> ScsiResult<Vec<u8>> {
        let handle = self.ping(data)?;
        let outcome = self.wait_for(handle)?;
        match (outcome.status, outcome.reply) {
            (CommandStatus::Good, Reply::Nop(data)) => Ok(data),
            (status, _) => Err(IscsiError::Protocol(format!("NOP failed: {:?}", status))),
        }
    }
}
