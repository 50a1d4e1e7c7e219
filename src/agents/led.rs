use super::{AgentServices, PeriodStatus, PeriodicAgent, PeriodicCore};
use crate::error::AgentError;
use crate::protocol::{Command, LED_OFF};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{error, info};

/// Button the pilot must press for each LED.
pub fn button_for_led(led: u8) -> Option<u8> {
    match led {
        1 => Some(4),
        2 => Some(5),
        3 => Some(6),
        4 => Some(7),
        _ => None,
    }
}

/// Lights one LED for a while and waits for the matching button.
#[derive(Debug)]
pub struct LedTask {
    core: PeriodicCore,
    services: AgentServices,
    led: u8,
    button: u8,
    add_time: f64,
    remove_time: f64,
    satisfied: bool,
}

impl LedTask {
    pub fn new(start_time: f64, led: u8, timeout: f64, services: AgentServices) -> Result<Self, AgentError> {
        let button = button_for_led(led).ok_or(AgentError::InvalidLed(led))?;
        Ok(Self {
            core: PeriodicCore::new(format!("LedTask{}@{:.1}", led, start_time)),
            services,
            led,
            button,
            add_time: start_time,
            remove_time: start_time + timeout,
            satisfied: false,
        })
    }

    /// Builds the task and arms its add and remove alarms.
    pub fn new_shared(
        start_time: f64,
        led: u8,
        timeout: f64,
        services: AgentServices,
    ) -> Result<Arc<Mutex<Self>>, AgentError> {
        let task = Arc::new(Mutex::new(Self::new(start_time, led, timeout, services.clone())?));
        let (add_time, remove_time) = {
            let task = task.lock();
            (task.add_time, task.remove_time)
        };

        let weak = Arc::downgrade(&task);
        services.schedule_at(add_time, &format!("led-{}-add", led), move || {
            with_task(&weak, LedTask::on_add_alarm);
        });
        let weak = Arc::downgrade(&task);
        services.schedule_at(remove_time, &format!("led-{}-remove", led), move || {
            with_task(&weak, LedTask::on_remove_alarm);
        });
        Ok(task)
    }

    pub fn led(&self) -> u8 {
        self.led
    }

    pub fn is_satisfied(&self) -> bool {
        self.satisfied
    }

    fn in_window(&self, timestamp: f64) -> bool {
        self.add_time < timestamp && timestamp < self.remove_time
    }

    pub fn on_add_alarm(&mut self) {
        info!("Led task is added at {:.3} for led {}", self.add_time, self.led);
        self.services.send(Command::Led(self.led));
    }

    pub fn on_remove_alarm(&mut self) {
        // Turn it off in case the pilot never pressed.
        self.services.send(Command::Led(LED_OFF));
        if self.satisfied {
            info!("Led task of led {} at {:.3} was successful", self.led, self.add_time);
        } else {
            error!("Led task of led {} at {:.3} has failed", self.led, self.add_time);
        }
        if self.core.is_attached() {
            self.core.cancel();
        }
    }
}

fn with_task(weak: &Weak<Mutex<LedTask>>, action: fn(&mut LedTask)) {
    if let Some(task) = weak.upgrade() {
        action(&mut task.lock());
    }
}

impl PeriodicAgent for LedTask {
    fn core(&self) -> &PeriodicCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PeriodicCore {
        &mut self.core
    }

    fn attempt_cmd(&mut self, timestamp: f64, _period: u32, command: &Command) -> PeriodStatus {
        if !self.in_window(timestamp) {
            return PeriodStatus::Ignored;
        }
        let Command::Press(button) = *command else {
            return PeriodStatus::Ignored;
        };

        if button == self.button {
            if self.satisfied {
                info!(
                    "Led task of led {} at {:.3} was already satisfied",
                    self.led, self.add_time
                );
            } else {
                info!(
                    "Led task of led {} at {:.3} is satisfied at {:.3}",
                    self.led, self.add_time, timestamp
                );
                self.satisfied = true;
                self.services.send(Command::Led(LED_OFF));
            }
            self.core.set_status(PeriodStatus::Success);
        } else {
            error!(
                "Led task of led {} at {:.3} has received incorrect button {} at {:.3}",
                self.led, self.add_time, button, timestamp
            );
            self.core.set_status(PeriodStatus::Failure);
        }
        self.core.status()
    }

    fn on_period_finished(&mut self, timestamp: f64, period: u32) {
        if !self.in_window(timestamp) {
            return;
        }
        // Periods without a press are fine as long as one press lands.
        if self.core.status() == PeriodStatus::Missed {
            self.core.set_status(PeriodStatus::Ignored);
        }
        self.core.finish_period(timestamp, period);
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
    use std::time::{Duration, Instant};

    fn services(origin: Instant, link: &Arc<RecordingSink>, alarms: &Arc<SteppedAlarms>) -> AgentServices {
        AgentServices {
            link: Arc::clone(link) as _,
            screen: Arc::new(RecordingPresentation::new()),
            alarms: Arc::clone(alarms) as _,
            epoch: GoEpoch::new(origin),
            finished: FinishSignal::new(),
        }
    }

    #[test]
    fn test_invalid_led_is_rejected() {
        let origin = Instant::now();
        let link = Arc::new(RecordingSink::new());
        let alarms = SteppedAlarms::new(origin);
        let err = LedTask::new(1.0, 5, 3.0, services(origin, &link, &alarms)).unwrap_err();
        assert_eq!(err, AgentError::InvalidLed(5));
    }

    #[test]
    fn test_first_press_turns_led_off_once() {
        let origin = Instant::now();
        let link = Arc::new(RecordingSink::new());
        let alarms = SteppedAlarms::new(origin);
        let mut task = LedTask::new(1.0, 2, 3.0, services(origin, &link, &alarms)).expect("valid led");

        assert_eq!(task.attempt_cmd(1.5, 15, &Command::Press(5)), PeriodStatus::Success);
        assert!(task.is_satisfied());
        task.on_period_finished(1.55, 15);
        assert_eq!(task.attempt_cmd(1.6, 16, &Command::Press(5)), PeriodStatus::Success);
        assert_eq!(link.count(Command::Led(LED_OFF)), 1);

        task.on_period_finished(1.65, 16);
        assert_eq!(task.attempt_cmd(1.7, 17, &Command::Press(4)), PeriodStatus::Failure);
    }

    #[test]
    fn test_idle_periods_are_ignored_and_outside_window_untouched() {
        let origin = Instant::now();
        let link = Arc::new(RecordingSink::new());
        let alarms = SteppedAlarms::new(origin);
        let mut task = LedTask::new(1.0, 1, 3.0, services(origin, &link, &alarms)).expect("valid led");

        assert_eq!(task.attempt_cmd(0.5, 5, &Command::Press(4)), PeriodStatus::Ignored);
        task.on_period_finished(0.55, 5);
        assert_eq!(task.core().tally().total(), 0);

        task.on_period_finished(2.05, 20);
        assert_eq!(task.core().tally().ignored, 1);
        assert_eq!(task.core().tally().missed, 0);
    }

    #[test]
    fn test_alarms_light_and_clear_the_led() {
        let origin = Instant::now();
        let link = Arc::new(RecordingSink::new());
        let alarms = SteppedAlarms::new(origin);
        let _task = LedTask::new_shared(1.0, 3, 3.0, services(origin, &link, &alarms)).expect("valid led");

        alarms.advance_to(origin + Duration::from_secs(2));
        assert_eq!(link.commands(), vec![Command::Led(3)]);
        alarms.advance_to(origin + Duration::from_secs(5));
        assert_eq!(link.commands(), vec![Command::Led(3), Command::Led(LED_OFF)]);
    }
}
