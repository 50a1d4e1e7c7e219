//! Periodic agents and the bookkeeping they share.
//!
//! Every agent embeds a [`PeriodicCore`] holding its name, the status of the
//! current period and the handle to the coordinator stack it sits in. The
//! coordinator talks to agents only through [`PeriodicAgent`].

pub mod altitude;
pub mod distance;
pub mod led;
pub mod manual;

pub use altitude::{AltitudeController, ExpectedAltitude};
pub use distance::DistanceControl;
pub use led::LedTask;
pub use manual::ManualMode;

use crate::link::CommandSink;
use crate::periodicity::PeriodicityCoordinator;
use crate::presentation::Presentation;
use crate::protocol::Command;
use crate::scheduler::{AlarmId, AlarmService};
use crate::session::FinishSignal;
use crate::time::GoEpoch;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

/// Outcome of one agent for one period. Ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i8)]
pub enum PeriodStatus {
    Failure = -2,
    Missed = -1,
    Ignored = 0,
    Overridden = 1,
    Success = 2,
}

impl PeriodStatus {
    /// Whether the agent took ownership of the command.
    pub fn claims(self) -> bool {
        matches!(self, PeriodStatus::Success | PeriodStatus::Failure)
    }
}

impl fmt::Display for PeriodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeriodStatus::Failure => "failure",
            PeriodStatus::Missed => "missed",
            PeriodStatus::Ignored => "ignored",
            PeriodStatus::Overridden => "overridden",
            PeriodStatus::Success => "success",
        };
        f.write_str(name)
    }
}

/// Final statuses an agent has logged so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodTally {
    pub success: u32,
    pub overridden: u32,
    pub ignored: u32,
    pub missed: u32,
    pub failure: u32,
}

impl PeriodTally {
    fn record(&mut self, status: PeriodStatus) {
        let counter = match status {
            PeriodStatus::Success => &mut self.success,
            PeriodStatus::Overridden => &mut self.overridden,
            PeriodStatus::Ignored => &mut self.ignored,
            PeriodStatus::Missed => &mut self.missed,
            PeriodStatus::Failure => &mut self.failure,
        };
        *counter += 1;
    }

    pub fn total(&self) -> u32 {
        self.success + self.overridden + self.ignored + self.missed + self.failure
    }
}

/// Identity of one stack entry. A re-added agent gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub(crate) u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Weak back-reference from an agent to the stack that holds it.
#[derive(Debug, Clone)]
pub struct StackHandle {
    id: AgentId,
    coordinator: Weak<PeriodicityCoordinator>,
}

impl StackHandle {
    pub(crate) fn new(id: AgentId, coordinator: Weak<PeriodicityCoordinator>) -> Self {
        Self { id, coordinator }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub(crate) fn belongs_to(&self, coordinator: &PeriodicityCoordinator) -> bool {
        std::ptr::eq(self.coordinator.as_ptr(), coordinator)
    }

    fn detach(self) {
        match self.coordinator.upgrade() {
            Some(coordinator) => {
                coordinator.remove_periodic_agent(self.id);
            }
            None => debug!("Agent {} outlived its coordinator", self.id),
        }
    }
}

/// State every periodic agent carries.
#[derive(Debug)]
pub struct PeriodicCore {
    name: String,
    status: PeriodStatus,
    handle: Option<StackHandle>,
    tally: PeriodTally,
}

impl PeriodicCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: PeriodStatus::Missed,
            handle: None,
            tally: PeriodTally::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> PeriodStatus {
        self.status
    }

    pub fn set_status(&mut self, status: PeriodStatus) {
        self.status = status;
    }

    pub fn tally(&self) -> PeriodTally {
        self.tally
    }

    pub fn handle(&self) -> Option<&StackHandle> {
        self.handle.as_ref()
    }

    pub fn is_attached(&self) -> bool {
        self.handle.is_some()
    }

    /// Leaves any previous stack before taking the new handle.
    pub(crate) fn attach(&mut self, handle: StackHandle) {
        if let Some(previous) = self.handle.take() {
            previous.detach();
        }
        self.handle = Some(handle);
    }

    #[cfg(test)]
    pub(crate) fn forget_handle(&mut self) {
        self.handle = None;
    }

    /// Removes the agent from its coordinator.
    pub fn cancel(&mut self) {
        match self.handle.take() {
            Some(handle) => handle.detach(),
            None => error!("{} has called cancel but it is not in any stack", self.name),
        }
    }

    pub fn mark_overridden(&mut self, timestamp: f64, period: u32, overrider: &str) {
        if self.status != PeriodStatus::Missed {
            error!(
                "{} is overridden in period {} while its status is already {}",
                self.name, period, self.status
            );
        }
        debug!(
            "{} is overridden by {} at period {} and time {:.3}",
            self.name, overrider, period, timestamp
        );
        self.status = PeriodStatus::Overridden;
    }

    /// Logs the final status of `period` and resets for the next one.
    pub fn finish_period(&mut self, timestamp: f64, period: u32) {
        match self.status {
            PeriodStatus::Success => info!(
                "{} has succeeded the period number {} at {:.3}",
                self.name, period, timestamp
            ),
            PeriodStatus::Overridden => debug!(
                "{} is overridden at the period number {} at {:.3}",
                self.name, period, timestamp
            ),
            PeriodStatus::Ignored => info!(
                "{} ignored the period number {} at {:.3}",
                self.name, period, timestamp
            ),
            PeriodStatus::Missed => error!(
                "{} has missed the period number {} at {:.3}",
                self.name, period, timestamp
            ),
            PeriodStatus::Failure => error!(
                "{} has failed the period number {} at {:.3}",
                self.name, period, timestamp
            ),
        }
        self.tally.record(self.status);
        self.status = PeriodStatus::Missed;
    }
}

/// A behavior taking part in period arbitration.
pub trait PeriodicAgent: Send {
    fn core(&self) -> &PeriodicCore;

    fn core_mut(&mut self) -> &mut PeriodicCore;

    /// Decides on a command received inside the current period window.
    /// Must leave the period status consistent with the returned value.
    fn attempt_cmd(&mut self, timestamp: f64, period: u32, command: &Command) -> PeriodStatus;

    /// Another agent higher in the stack claimed this period's command.
    fn notify_overridden(&mut self, timestamp: f64, period: u32, overrider: &str) {
        self.core_mut().mark_overridden(timestamp, period, overrider);
    }

    fn on_period_finished(&mut self, timestamp: f64, period: u32) {
        self.core_mut().finish_period(timestamp, period);
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn period_status(&self) -> PeriodStatus {
        self.core().status()
    }
}

pub type SharedAgent = Arc<Mutex<dyn PeriodicAgent>>;

/// Collaborators handed to every agent.
#[derive(Clone)]
pub struct AgentServices {
    pub link: Arc<dyn CommandSink>,
    pub screen: Arc<dyn Presentation>,
    pub alarms: Arc<dyn AlarmService>,
    pub epoch: GoEpoch,
    pub finished: FinishSignal,
}

impl AgentServices {
    pub fn send(&self, command: Command) {
        self.link.send(command);
    }

    /// Schedules `callback` at `relative` seconds after the go epoch.
    pub fn schedule_at<F>(&self, relative: f64, label: &str, callback: F) -> AlarmId
    where
        F: FnOnce() + Send + 'static,
    {
        self.alarms
            .schedule_fn(self.epoch.at(relative), label, move |_| callback())
    }
}

impl fmt::Debug for AgentServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentServices")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordering_matches_severity() {
        assert!(PeriodStatus::Failure < PeriodStatus::Missed);
        assert!(PeriodStatus::Missed < PeriodStatus::Ignored);
        assert!(PeriodStatus::Ignored < PeriodStatus::Overridden);
        assert!(PeriodStatus::Overridden < PeriodStatus::Success);
        assert_eq!(PeriodStatus::Failure as i8, -2);
        assert_eq!(PeriodStatus::Success as i8, 2);
    }

    #[test]
    fn test_finish_period_resets_to_missed() {
        let mut core = PeriodicCore::new("scripted");
        core.set_status(PeriodStatus::Success);
        core.finish_period(1.0, 10);
        assert_eq!(core.status(), PeriodStatus::Missed);
        core.finish_period(1.1, 11);
        assert_eq!(core.tally().success, 1);
        assert_eq!(core.tally().missed, 1);
        assert_eq!(core.tally().total(), 2);
    }

    #[test]
    fn test_cancel_without_stack_is_harmless() {
        let mut core = PeriodicCore::new("scripted");
        core.cancel();
        assert!(!core.is_attached());
    }
}
