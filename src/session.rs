//! One autopilot run, from the go command to the end of the flight.

use crate::agents::{
    AgentServices, AltitudeController, DistanceControl, ManualMode, PeriodTally, PeriodicAgent,
    SharedAgent,
};
use crate::config::TestCase;
use crate::dispatcher::CommandDispatcher;
use crate::error::SessionError;
use crate::link::CommandSink;
use crate::periodicity::PeriodicityCoordinator;
use crate::presentation::Presentation;
use crate::protocol::Command;
use crate::queue::CommandQueue;
use crate::scheduler::AlarmService;
use crate::time::GoEpoch;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Raised once the flight is over, by an agent or by the operator.
#[derive(Debug, Clone, Default)]
pub struct FinishSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl FinishSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        let (raised, cvar) = &*self.inner;
        *raised.lock() = true;
        cvar.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Blocks until raised. Returns `false` when `timeout` elapsed first.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let (raised, cvar) = &*self.inner;
        let mut guard = raised.lock();
        match timeout {
            None => {
                while !*guard {
                    cvar.wait(&mut guard);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*guard {
                    if cvar.wait_until(&mut guard, deadline).timed_out() {
                        return *guard;
                    }
                }
                true
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionStats {
    pub periods_completed: u32,
    pub total_distance: u16,
    pub remaining_distance: u16,
    pub distance_periods: PeriodTally,
    pub agents_left: usize,
    pub pending_alarms: usize,
    pub commands_dispatched: u64,
}

struct Running {
    epoch: GoEpoch,
    coordinator: Arc<PeriodicityCoordinator>,
    distance: Arc<Mutex<DistanceControl>>,
    altitude: Vec<Arc<Mutex<AltitudeController>>>,
    manual: Option<Arc<Mutex<ManualMode>>>,
    dispatcher: CommandDispatcher,
}

/// Wires the queue, the period coordinator and the agents for a test case.
pub struct AutopilotSession {
    test_case: TestCase,
    queue: Arc<CommandQueue>,
    link: Arc<dyn CommandSink>,
    screen: Arc<dyn Presentation>,
    alarms: Arc<dyn AlarmService>,
    finished: FinishSignal,
    running: Option<Running>,
}

impl AutopilotSession {
    pub fn new(
        test_case: TestCase,
        queue: Arc<CommandQueue>,
        link: Arc<dyn CommandSink>,
        screen: Arc<dyn Presentation>,
        alarms: Arc<dyn AlarmService>,
    ) -> Self {
        Self {
            test_case,
            queue,
            link,
            screen,
            alarms,
            finished: FinishSignal::new(),
            running: None,
        }
    }

    pub fn test_case(&self) -> &TestCase {
        &self.test_case
    }

    pub fn finish_signal(&self) -> FinishSignal {
        self.finished.clone()
    }

    pub fn is_started(&self) -> bool {
        self.running.is_some()
    }

    pub fn coordinator(&self) -> Option<&Arc<PeriodicityCoordinator>> {
        self.running.as_ref().map(|running| &running.coordinator)
    }

    pub fn go_epoch(&self) -> Option<GoEpoch> {
        self.running.as_ref().map(|running| running.epoch)
    }

    /// Sends the go command and starts arbitrating periods from `go`.
    pub fn start(&mut self, go: Instant) -> Result<(), SessionError> {
        if self.running.is_some() {
            return Err(SessionError::AlreadyStarted);
        }
        self.test_case.validate()?;
        let tc = &self.test_case;

        let epoch = GoEpoch::new(go);
        self.queue.set_go_epoch(epoch);
        info!("Sending go command with total distance {}", tc.total_distance);
        self.link.send(Command::Go(tc.total_distance));

        let services = AgentServices {
            link: Arc::clone(&self.link),
            screen: Arc::clone(&self.screen),
            alarms: Arc::clone(&self.alarms),
            epoch,
            finished: self.finished.clone(),
        };
        let coordinator = PeriodicityCoordinator::new(tc.period, tc.period_offset, services.clone());

        // Bottom of the stack: consulted last.
        let distance = Arc::new(Mutex::new(DistanceControl::new(
            tc.total_distance,
            tc.speed_step,
            services.clone(),
        )));
        let shared: SharedAgent = distance.clone();
        coordinator.add_periodic_agent(shared);

        let mut altitude = Vec::with_capacity(tc.altitude_controls.len());
        for (idx, control) in tc.altitude_controls.iter().enumerate() {
            let controller = AltitudeController::new_shared(idx, control, tc.period, services.clone());
            let shared: SharedAgent = controller.clone();
            coordinator.add_periodic_agent(shared);
            altitude.push(controller);
        }

        let manual = tc.manual.clone().map(|manual| {
            ManualMode::new_shared(manual, tc.led_timeout, services.clone(), &coordinator)
        });

        let mut dispatcher = CommandDispatcher::new(Arc::clone(&self.queue));
        dispatcher.add_consumer(coordinator.clone());
        dispatcher.start()?;

        info!(
            "Autopilot started: period {:.3}s, offset {:.3}s, {} altitude controls",
            tc.period,
            tc.period_offset,
            altitude.len()
        );
        self.running = Some(Running {
            epoch,
            coordinator,
            distance,
            altitude,
            manual,
            dispatcher,
        });
        Ok(())
    }

    /// Blocks until an agent or the operator ends the flight.
    pub fn wait_until_finished(&self, timeout: Option<Duration>) -> bool {
        self.finished.wait(timeout)
    }

    pub fn stats(&self) -> SessionStats {
        let Some(running) = &self.running else {
            return SessionStats {
                total_distance: self.test_case.total_distance,
                remaining_distance: self.test_case.total_distance,
                pending_alarms: self.alarms.pending(),
                ..SessionStats::default()
            };
        };
        let distance = running.distance.lock();
        SessionStats {
            periods_completed: running.coordinator.current_period(),
            total_distance: distance.total_distance(),
            remaining_distance: distance.remaining_distance(),
            distance_periods: distance.core().tally(),
            agents_left: running.coordinator.stack_len(),
            pending_alarms: self.alarms.pending(),
            commands_dispatched: 0,
        }
    }

    /// Stops the period clock and the dispatcher.
    pub fn finish(&mut self) -> Result<SessionStats, SessionError> {
        let mut stats = self.stats();
        let mut running = self.running.take().ok_or(SessionError::NotStarted)?;
        self.finished.raise();

        running.coordinator.finish();
        stats.commands_dispatched = running.dispatcher.stop();
        if let Some(manual) = &running.manual {
            manual.lock().finish();
        }
        for controller in &running.altitude {
            let controller = controller.lock();
            if controller.core().is_attached() {
                warn!("{} is still active at the end of the flight", controller.name());
            }
        }

        let pending = self.alarms.pending();
        if pending > 0 {
            warn!(
                "Autopilot has finished but {} alarms are pending, some may be delivered later",
                pending
            );
        }
        info!(
            "Autopilot finished after {} periods, remaining distance {}",
            stats.periods_completed, stats.remaining_distance
        );
        Ok(stats)
    }
}
