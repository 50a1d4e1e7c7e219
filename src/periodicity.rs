//! Period clock and the arbitration stack.
//!
//! Period `n` is centered on `n * period`. A command is arbitrated only when
//! its timestamp falls in `[n * period - offset, n * period + offset)`, and the
//! period ends with an alarm at `n * period + offset`.
//!
//! Lock order is always agent before stack: the coordinator copies the stack
//! out under its lock and calls agents with the lock released, so agents may
//! add or remove stack entries from inside their callbacks.

use crate::agents::{AgentId, AgentServices, PeriodStatus, SharedAgent, StackHandle};
use crate::dispatcher::CommandConsumer;
use crate::error::CoordinatorError;
use crate::presentation::ScreenUpdate;
use crate::protocol::Command;
use crate::scheduler::AlarmId;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, warn};

#[derive(Clone)]
struct StackEntry {
    id: AgentId,
    agent: SharedAgent,
}

struct CoordinatorState {
    stack: Vec<StackEntry>,
    period_number: u32,
    next_period_end: f64,
    next_id: u64,
    boundary_alarm: Option<AlarmId>,
    alive: bool,
}

pub struct PeriodicityCoordinator {
    period: f64,
    period_offset: f64,
    services: AgentServices,
    state: Mutex<CoordinatorState>,
    this: Weak<PeriodicityCoordinator>,
}

impl PeriodicityCoordinator {
    /// Creates the coordinator and arms the end of period 0.
    pub fn new(period: f64, period_offset: f64, services: AgentServices) -> Arc<Self> {
        let coordinator = Arc::new_cyclic(|this| Self {
            period,
            period_offset,
            services,
            state: Mutex::new(CoordinatorState {
                stack: Vec::new(),
                period_number: 0,
                next_period_end: period_offset,
                next_id: 0,
                boundary_alarm: None,
                alive: true,
            }),
            this: this.clone(),
        });

        coordinator.services.screen.update(ScreenUpdate::PeriodNumber(0));
        let alarm = coordinator.arm_boundary(period_offset);
        coordinator.state.lock().boundary_alarm = Some(alarm);
        coordinator
    }

    pub fn period(&self) -> f64 {
        self.period
    }

    pub fn period_offset(&self) -> f64 {
        self.period_offset
    }

    pub fn current_period(&self) -> u32 {
        self.state.lock().period_number
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().alive
    }

    pub fn stack_len(&self) -> usize {
        self.state.lock().stack.len()
    }

    pub fn contains(&self, id: AgentId) -> bool {
        self.state.lock().stack.iter().any(|entry| entry.id == id)
    }

    /// Agent names from bottom to top.
    pub fn agent_names(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|entry| entry.agent.lock().name().to_owned())
            .collect()
    }

    fn snapshot(&self) -> Vec<StackEntry> {
        self.state.lock().stack.clone()
    }

    fn arm_boundary(&self, relative: f64) -> AlarmId {
        let this = self.this.clone();
        self.services.alarms.schedule_fn(
            self.services.epoch.at(relative),
            "period-boundary",
            move |fired_at| {
                let Some(coordinator) = this.upgrade() else {
                    return;
                };
                match coordinator.on_period(fired_at) {
                    Ok(()) => {}
                    Err(CoordinatorError::Finished) => debug!("Boundary fired after finish"),
                    Err(err) => error!("Period coordinator stopped: {}", err),
                }
            },
        )
    }

    /// Pushes `agent` on top of the stack. An agent already sitting in a
    /// stack is moved.
    pub fn add_periodic_agent(&self, agent: SharedAgent) -> AgentId {
        let mut guard = agent.lock();
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            AgentId(state.next_id)
        };
        guard
            .core_mut()
            .attach(StackHandle::new(id, self.this.clone()));
        debug!("{} joins the period stack as {}", guard.name(), id);

        drop(guard);
        self.state.lock().stack.push(StackEntry { id, agent });
        id
    }

    /// Removes the entry by identity. Never locks the agent.
    pub fn remove_periodic_agent(&self, id: AgentId) -> bool {
        let mut state = self.state.lock();
        match state.stack.iter().position(|entry| entry.id == id) {
            Some(idx) => {
                state.stack.remove(idx);
                true
            }
            None => {
                warn!("Attempted to remove periodic agent {} but it is not in the stack", id);
                false
            }
        }
    }

    /// Arbitrates one command among the stacked agents, top first.
    pub fn process_cmd(&self, timestamp: f64, command: &Command) {
        let (period_number, stack) = {
            let state = self.state.lock();
            if !state.alive {
                return;
            }
            (state.period_number, state.stack.clone())
        };

        let period_time = f64::from(period_number) * self.period;
        let window_start = period_time - self.period_offset;
        let window_end = period_time + self.period_offset;
        if !(window_start <= timestamp && timestamp < window_end) {
            debug!(
                "Coordinator ignores {} at {:.3}, outside of period {} window",
                command, timestamp, period_number
            );
            return;
        }

        let mut overrider: Option<String> = None;
        for entry in stack.iter().rev() {
            let mut agent = entry.agent.lock();
            if let Some(name) = &overrider {
                agent.notify_overridden(timestamp, period_number, name);
                continue;
            }
            match agent.attempt_cmd(timestamp, period_number, command) {
                PeriodStatus::Success => {
                    debug!("{} accepted {}", agent.name(), command);
                    overrider = Some(agent.name().to_owned());
                }
                PeriodStatus::Failure => {
                    debug!("{} rejected {}", agent.name(), command);
                    overrider = Some(agent.name().to_owned());
                }
                PeriodStatus::Ignored => {}
                other => error!(
                    "{} answered {} with an unexpected status {}",
                    agent.name(),
                    command,
                    other
                ),
            }
        }
    }

    /// Period boundary: re-arms the next one and closes the finished period
    /// on every agent.
    pub fn on_period(&self, fired_at: Instant) -> Result<(), CoordinatorError> {
        let timestamp = self.services.epoch.relative(fired_at);
        let (finished_period, stack) = {
            let mut state = self.state.lock();
            if !state.alive {
                return Err(CoordinatorError::Finished);
            }
            state.next_period_end += self.period;
            state.period_number += 1;
            let next_end = state.next_period_end;
            state.boundary_alarm = Some(self.arm_boundary(next_end));
            (state.period_number - 1, state.stack.clone())
        };

        for entry in &stack {
            let mut agent = entry.agent.lock();
            let consistent = agent
                .core()
                .handle()
                .is_some_and(|handle| handle.id() == entry.id && handle.belongs_to(self));
            if !consistent {
                if !self.contains(entry.id) {
                    debug!("{} left the stack during the period boundary", agent.name());
                    continue;
                }
                let name = agent.name().to_owned();
                drop(agent);
                error!(
                    "Agent {} ({}) is in the stack without being attached to it, stopping",
                    entry.id, name
                );
                self.stop();
                return Err(CoordinatorError::StackInconsistency { agent: entry.id, name });
            }
            agent.on_period_finished(timestamp, finished_period);
        }

        let period_number = self.current_period();
        self.services
            .screen
            .update(ScreenUpdate::PeriodNumber(period_number));
        Ok(())
    }

    fn stop(&self) {
        let alarm = {
            let mut state = self.state.lock();
            state.alive = false;
            state.boundary_alarm.take()
        };
        if let Some(alarm) = alarm {
            self.services.alarms.cancel(alarm);
        }
    }

    /// Stops the period clock and empties the stack.
    pub fn finish(&self) {
        self.stop();
        let dropped = std::mem::take(&mut self.state.lock().stack);
        debug!("Period coordinator finished with {} agents left", dropped.len());
    }
}

impl CommandConsumer for PeriodicityCoordinator {
    fn process_cmd(&self, timestamp: f64, command: &Command) {
        PeriodicityCoordinator::process_cmd(self, timestamp, command);
    }

    fn process_empty(&self) {
        debug!(
            "No command arrived within the queue timeout in period {}",
            self.current_period()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{PeriodicAgent, PeriodicCore};
    use crate::link::RecordingSink;
    use crate::presentation::RecordingPresentation;
    use crate::scheduler::{AlarmService, SteppedAlarms};
    use crate::session::FinishSignal;
    use crate::time::GoEpoch;
    use std::time::Duration;

    /// Claims every command with a fixed answer and records callbacks.
    struct ScriptedAgent {
        core: PeriodicCore,
        answer: PeriodStatus,
        overridden: u32,
        finished: Vec<u32>,
    }

    impl ScriptedAgent {
        fn shared(name: &str, answer: PeriodStatus) -> Arc<Mutex<ScriptedAgent>> {
            Arc::new(Mutex::new(ScriptedAgent {
                core: PeriodicCore::new(name),
                answer,
                overridden: 0,
                finished: Vec::new(),
            }))
        }
    }

    impl PeriodicAgent for ScriptedAgent {
        fn core(&self) -> &PeriodicCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut PeriodicCore {
            &mut self.core
        }

        fn attempt_cmd(&mut self, _timestamp: f64, _period: u32, _command: &Command) -> PeriodStatus {
            if self.answer.claims() {
                self.core.set_status(self.answer);
            }
            self.answer
        }

        fn notify_overridden(&mut self, timestamp: f64, period: u32, overrider: &str) {
            self.overridden += 1;
            self.core.mark_overridden(timestamp, period, overrider);
        }

        fn on_period_finished(&mut self, timestamp: f64, period: u32) {
            self.finished.push(period);
            self.core.finish_period(timestamp, period);
        }
    }

    fn setup() -> (Arc<SteppedAlarms>, Arc<RecordingPresentation>, Arc<PeriodicityCoordinator>) {
        let origin = Instant::now();
        let alarms = SteppedAlarms::new(origin);
        let screen = Arc::new(RecordingPresentation::new());
        let services = AgentServices {
            link: Arc::new(RecordingSink::new()),
            screen: Arc::clone(&screen) as _,
            alarms: Arc::clone(&alarms) as _,
            epoch: GoEpoch::new(origin),
            finished: FinishSignal::new(),
        };
        let coordinator = PeriodicityCoordinator::new(0.1, 0.05, services);
        (alarms, screen, coordinator)
    }

    #[test]
    fn test_top_claim_overrides_agents_below() {
        let (_alarms, _screen, coordinator) = setup();
        let bottom = ScriptedAgent::shared("A", PeriodStatus::Success);
        let top = ScriptedAgent::shared("B", PeriodStatus::Success);
        coordinator.add_periodic_agent(bottom.clone());
        coordinator.add_periodic_agent(top.clone());

        coordinator.process_cmd(0.0, &Command::Distance(1));

        assert_eq!(top.lock().period_status(), PeriodStatus::Success);
        assert_eq!(bottom.lock().overridden, 1);
        assert_eq!(bottom.lock().period_status(), PeriodStatus::Overridden);
    }

    #[test]
    fn test_ignoring_agent_passes_command_down() {
        let (_alarms, _screen, coordinator) = setup();
        let bottom = ScriptedAgent::shared("A", PeriodStatus::Failure);
        let top = ScriptedAgent::shared("B", PeriodStatus::Ignored);
        coordinator.add_periodic_agent(bottom.clone());
        coordinator.add_periodic_agent(top.clone());

        coordinator.process_cmd(0.01, &Command::Press(4));

        assert_eq!(bottom.lock().period_status(), PeriodStatus::Failure);
        assert_eq!(top.lock().overridden, 0);
        assert_eq!(top.lock().period_status(), PeriodStatus::Missed);
    }

    #[test]
    fn test_command_outside_window_is_not_arbitrated() {
        let (_alarms, _screen, coordinator) = setup();
        let agent = ScriptedAgent::shared("A", PeriodStatus::Success);
        coordinator.add_periodic_agent(agent.clone());

        // Period 0 window is [-0.05, 0.05).
        coordinator.process_cmd(0.05, &Command::Distance(1));
        coordinator.process_cmd(0.07, &Command::Distance(1));
        assert_eq!(agent.lock().period_status(), PeriodStatus::Missed);

        coordinator.process_cmd(-0.05, &Command::Distance(1));
        assert_eq!(agent.lock().period_status(), PeriodStatus::Success);
    }

    #[test]
    fn test_period_boundary_resets_status_and_reports_number() {
        let (alarms, screen, coordinator) = setup();
        let agent = ScriptedAgent::shared("A", PeriodStatus::Success);
        coordinator.add_periodic_agent(agent.clone());
        coordinator.process_cmd(0.0, &Command::Distance(1));

        let origin = alarms.now();
        alarms.advance_to(origin + Duration::from_millis(260));

        assert_eq!(coordinator.current_period(), 3);
        let scripted = agent.lock();
        assert_eq!(scripted.finished, vec![0, 1, 2]);
        assert_eq!(scripted.core().tally().success, 1);
        assert_eq!(scripted.core().tally().missed, 2);
        assert_eq!(scripted.period_status(), PeriodStatus::Missed);
        drop(scripted);

        assert_eq!(
            screen.updates(),
            vec![
                ScreenUpdate::PeriodNumber(0),
                ScreenUpdate::PeriodNumber(1),
                ScreenUpdate::PeriodNumber(2),
                ScreenUpdate::PeriodNumber(3),
            ]
        );
    }

    #[test]
    fn test_remove_and_readd_agent() {
        let (_alarms, _screen, coordinator) = setup();
        let agent = ScriptedAgent::shared("A", PeriodStatus::Success);
        let first = coordinator.add_periodic_agent(agent.clone());
        let second = coordinator.add_periodic_agent(agent.clone());

        assert_ne!(first, second);
        assert_eq!(coordinator.stack_len(), 1);
        assert!(!coordinator.remove_periodic_agent(first));
        agent.lock().core_mut().cancel();
        assert_eq!(coordinator.stack_len(), 0);
        assert!(!agent.lock().core().is_attached());
    }

    #[test]
    fn test_unattached_agent_in_stack_stops_coordinator() {
        let (alarms, _screen, coordinator) = setup();
        let agent = ScriptedAgent::shared("A", PeriodStatus::Success);
        coordinator.add_periodic_agent(agent.clone());

        // Break the back-reference without leaving the stack.
        agent.lock().core_mut().forget_handle();

        let err = coordinator.on_period(alarms.now()).unwrap_err();
        assert!(matches!(err, CoordinatorError::StackInconsistency { .. }));
        assert!(!coordinator.is_alive());
        assert_eq!(alarms.pending(), 1);
    }

    #[test]
    fn test_finish_stops_the_clock() {
        let (alarms, _screen, coordinator) = setup();
        coordinator.add_periodic_agent(ScriptedAgent::shared("A", PeriodStatus::Success));
        coordinator.finish();

        assert_eq!(coordinator.stack_len(), 0);
        assert_eq!(alarms.pending(), 0);
        let origin = alarms.now();
        alarms.advance_to(origin + Duration::from_secs(1));
        assert_eq!(coordinator.current_period(), 0);
    }
}
