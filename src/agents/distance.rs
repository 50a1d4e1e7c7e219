use super::{AgentServices, PeriodStatus, PeriodicAgent, PeriodicCore};
use crate::protocol::Command;
use tracing::{error, info};

/// Drives the plane toward the target by one speed step per period and checks
/// every distance report against the predicted remaining distance.
#[derive(Debug)]
pub struct DistanceControl {
    core: PeriodicCore,
    services: AgentServices,
    total_distance: u16,
    remaining_distance: u16,
    speed_step: u16,
}

impl DistanceControl {
    pub fn new(total_distance: u16, speed_step: u16, services: AgentServices) -> Self {
        let mut core = PeriodicCore::new("DistanceControl");
        // The go command and the first report share period 0, so it is not judged.
        core.set_status(PeriodStatus::Ignored);
        Self {
            core,
            services,
            total_distance,
            remaining_distance: total_distance,
            speed_step,
        }
    }

    pub fn total_distance(&self) -> u16 {
        self.total_distance
    }

    pub fn remaining_distance(&self) -> u16 {
        self.remaining_distance
    }

    fn send_speed_cmd(&mut self) {
        self.remaining_distance = self.remaining_distance.saturating_sub(self.speed_step);
        self.services.send(Command::Speed(self.speed_step));
    }
}

impl PeriodicAgent for DistanceControl {
    fn core(&self) -> &PeriodicCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PeriodicCore {
        &mut self.core
    }

    fn attempt_cmd(&mut self, _timestamp: f64, _period: u32, command: &Command) -> PeriodStatus {
        let Command::Distance(distance) = *command else {
            return PeriodStatus::Ignored;
        };

        if self.core.status() != PeriodStatus::Missed {
            error!("Distance command for this period was already received");
            self.core.set_status(PeriodStatus::Failure);
            return PeriodStatus::Failure;
        }
        if self.remaining_distance == distance {
            self.core.set_status(PeriodStatus::Success);
        } else {
            error!(
                "DistanceControl expected distance to be {} but found {}",
                self.remaining_distance, distance
            );
            self.core.set_status(PeriodStatus::Failure);
        }

        if self.remaining_distance == 0 {
            info!("Remaining distance is 0, ending the flight");
            self.services.send(Command::End);
            self.core.cancel();
            self.services.finished.raise();
            return self.core.status();
        }
        self.send_speed_cmd();
        self.core.status()
    }

    fn notify_overridden(&mut self, timestamp: f64, period: u32, overrider: &str) {
        self.core.mark_overridden(timestamp, period, overrider);
        // The plane still needs a speed for this period.
        self.send_speed_cmd();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::RecordingSink;
    use crate::presentation::RecordingPresentation;
    use crate::scheduler::SteppedAlarms;
    use crate::session::FinishSignal;
    use crate::time::GoEpoch;
    use std::sync::Arc;
    use std::time::Instant;

    fn services(link: Arc<RecordingSink>) -> AgentServices {
        let origin = Instant::now();
        AgentServices {
            link,
            screen: Arc::new(RecordingPresentation::new()),
            alarms: SteppedAlarms::new(origin),
            epoch: GoEpoch::new(origin),
            finished: FinishSignal::new(),
        }
    }

    #[test]
    fn test_first_period_is_ignored_not_missed() {
        let link = Arc::new(RecordingSink::new());
        let mut agent = DistanceControl::new(100, 10, services(link));
        assert_eq!(agent.period_status(), PeriodStatus::Ignored);
        agent.on_period_finished(0.05, 0);
        assert_eq!(agent.core().tally().ignored, 1);
        assert_eq!(agent.period_status(), PeriodStatus::Missed);
    }

    #[test]
    fn test_matching_report_sends_speed() {
        let link = Arc::new(RecordingSink::new());
        let mut agent = DistanceControl::new(100, 10, services(Arc::clone(&link)));
        agent.on_period_finished(0.05, 0);

        let status = agent.attempt_cmd(0.1, 1, &Command::Distance(100));
        assert_eq!(status, PeriodStatus::Success);
        assert_eq!(agent.remaining_distance(), 90);
        assert_eq!(link.commands(), vec![Command::Speed(10)]);
    }

    #[test]
    fn test_wrong_or_duplicate_report_fails() {
        let link = Arc::new(RecordingSink::new());
        let mut agent = DistanceControl::new(100, 10, services(Arc::clone(&link)));
        agent.on_period_finished(0.05, 0);

        assert_eq!(agent.attempt_cmd(0.1, 1, &Command::Distance(55)), PeriodStatus::Failure);
        // A speed is still sent so the plane keeps moving.
        assert_eq!(agent.remaining_distance(), 90);
        assert_eq!(agent.attempt_cmd(0.11, 1, &Command::Distance(90)), PeriodStatus::Failure);
        assert_eq!(link.count(Command::Speed(10)), 1);
    }

    #[test]
    fn test_overridden_still_sends_speed() {
        let link = Arc::new(RecordingSink::new());
        let mut agent = DistanceControl::new(100, 10, services(Arc::clone(&link)));
        agent.on_period_finished(0.05, 0);

        agent.notify_overridden(0.1, 1, "LedTask");
        assert_eq!(agent.period_status(), PeriodStatus::Overridden);
        assert_eq!(agent.remaining_distance(), 90);
        assert_eq!(link.count(Command::Speed(10)), 1);
    }

    #[test]
    fn test_other_commands_are_ignored() {
        let link = Arc::new(RecordingSink::new());
        let mut agent = DistanceControl::new(100, 10, services(Arc::clone(&link)));
        agent.on_period_finished(0.05, 0);
        assert_eq!(agent.attempt_cmd(0.1, 1, &Command::Press(4)), PeriodStatus::Ignored);
        assert_eq!(agent.period_status(), PeriodStatus::Missed);
        assert!(link.commands().is_empty());
    }
}
