//! Altitude control windows.
//!
//! A controller runs an ordered program of events while the flight is inside
//! its `(enter, exit)` window:
//!
//! * `freq` asks the plane for altitude reports every 200/400/600 ms,
//! * `free` accepts any altitude for a number of periods,
//! * `altitude` expects an exact value on the next `count` due reports.
//!
//! Whether a report is due, and what it must carry, is decided one period
//! ahead at the end of each period.

use super::{AgentServices, PeriodStatus, PeriodicAgent, PeriodicCore};
use crate::config::{AltitudeControlConfig, AltitudeEvent};
use crate::presentation::{AltitudeZoneState, ScreenUpdate};
use crate::protocol::{AltitudePeriod, Command};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

/// Expectation for the upcoming period's altitude report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedAltitude {
    Any,
    Value(u16),
}

#[derive(Debug)]
pub struct AltitudeController {
    core: PeriodicCore,
    services: AgentServices,
    index: usize,
    period: f64,
    enter: f64,
    exit: f64,
    events: Vec<AltitudeEvent>,
    event_idx: usize,
    /// Progress inside the current `free` or `altitude` event.
    progress: u32,
    events_finished: bool,
    last_freq: AltitudePeriod,
    last_freq_period: Option<u32>,
    zone: Option<u32>,
    next_expected: Option<ExpectedAltitude>,
}

impl AltitudeController {
    pub fn new(index: usize, config: &AltitudeControlConfig, period: f64, services: AgentServices) -> Self {
        Self {
            core: PeriodicCore::new(format!("AltitudeController{}", index)),
            services,
            index,
            period,
            enter: config.enter,
            exit: config.exit,
            events_finished: config.events.is_empty(),
            events: config.events.clone(),
            event_idx: 0,
            progress: 0,
            last_freq: AltitudePeriod::Off,
            last_freq_period: None,
            zone: None,
            next_expected: None,
        }
    }

    /// Builds the controller and arms its enter and exit alarms.
    pub fn new_shared(
        index: usize,
        config: &AltitudeControlConfig,
        period: f64,
        services: AgentServices,
    ) -> Arc<Mutex<Self>> {
        let controller = Arc::new(Mutex::new(Self::new(index, config, period, services.clone())));

        let weak = Arc::downgrade(&controller);
        services.schedule_at(config.enter, &format!("altitude-{}-enter", index), move || {
            with_controller(&weak, AltitudeController::on_enter);
        });
        let weak = Arc::downgrade(&controller);
        services.schedule_at(config.exit, &format!("altitude-{}-exit", index), move || {
            with_controller(&weak, AltitudeController::on_exit);
        });
        controller
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Expectation computed for the period after the last finished one.
    pub fn expected_altitude(&self) -> Option<ExpectedAltitude> {
        self.next_expected
    }

    pub fn events_finished(&self) -> bool {
        self.events_finished
    }

    fn in_window(&self, timestamp: f64) -> bool {
        self.enter < timestamp && timestamp < self.exit
    }

    pub fn on_enter(&mut self) {
        info!("AltitudeController no {} enters its window", self.index);
        self.services.screen.update(ScreenUpdate::AltitudeControls(true));
    }

    pub fn on_exit(&mut self) {
        info!(
            "AltitudeController no {} exits, stopping incoming altitude commands",
            self.index
        );
        self.services
            .send(Command::Altitude(AltitudePeriod::Off.millis()));
        self.services.screen.update(ScreenUpdate::AltitudeControls(false));
        if self.core.is_attached() {
            self.core.cancel();
        }
    }

    /// Periods between two altitude reports at the last requested frequency.
    fn stride(&self) -> u32 {
        let periods = (f64::from(self.last_freq.millis()) / 1000.0 / self.period).round();
        if periods < 1.0 {
            1
        } else {
            periods as u32
        }
    }

    fn report_due(&self, period: u32) -> bool {
        if self.last_freq == AltitudePeriod::Off {
            return false;
        }
        match self.last_freq_period {
            Some(start) if period > start => (period - start) % self.stride() == 0,
            _ => false,
        }
    }

    fn expect_if_due(&mut self, period: u32, expectation: ExpectedAltitude) -> bool {
        let due = self.report_due(period);
        self.next_expected = due.then_some(expectation);
        due
    }

    fn update_zone_screen(&self) {
        let state = match (self.core.status(), self.next_expected) {
            (PeriodStatus::Failure | PeriodStatus::Missed, _) => AltitudeZoneState::Bad,
            // A free stretch is not an altitude zone.
            (PeriodStatus::Success, Some(ExpectedAltitude::Value(_))) => AltitudeZoneState::Good,
            _ => return,
        };
        match self.zone {
            Some(zone) => self.services.screen.update(ScreenUpdate::AltitudeZone {
                controller: self.index,
                zone,
                state,
            }),
            None => debug!(
                "AltitudeController no {} has no zone to mark {:?}",
                self.index, state
            ),
        }
    }

    fn advance_program(&mut self, timestamp: f64, period: u32) {
        let next = period + 1;
        if self.events_finished {
            self.expect_if_due(next, ExpectedAltitude::Any);
            return;
        }

        match self.events[self.event_idx] {
            AltitudeEvent::Freq { value } => {
                debug!(
                    "AltitudeController no {} sends freq {} ms at {:.3}",
                    self.index, value, timestamp
                );
                self.services.send(Command::Altitude(value));
                self.last_freq = AltitudePeriod::from_millis(value).unwrap_or_else(|| {
                    error!("Unsupported altitude frequency {} ms, reports stop", value);
                    AltitudePeriod::Off
                });
                self.last_freq_period = Some(period);
                self.core.set_status(PeriodStatus::Ignored);
                self.event_idx += 1;
                // The plane gets one period to apply the new frequency.
                self.next_expected = None;
            }
            AltitudeEvent::Free { count } => {
                self.progress += 1;
                if self.progress >= count {
                    self.event_idx += 1;
                    self.progress = 0;
                }
                self.expect_if_due(next, ExpectedAltitude::Any);
            }
            AltitudeEvent::Altitude { value, count } => {
                if self.last_freq == AltitudePeriod::Off {
                    error!(
                        "AltitudeController no {} expects altitude {} but no report frequency is set",
                        self.index, value
                    );
                }
                if self.expect_if_due(next, ExpectedAltitude::Value(value)) {
                    if self.progress == 0 {
                        self.zone = Some(self.zone.map_or(0, |zone| zone + 1));
                    }
                    self.progress += 1;
                    if self.progress >= count {
                        self.event_idx += 1;
                        self.progress = 0;
                    }
                }
            }
        }

        if self.event_idx == self.events.len() {
            debug!(
                "AltitudeController no {} finished progressing all of its events",
                self.index
            );
            self.events_finished = true;
        }
    }
}

fn with_controller(weak: &Weak<Mutex<AltitudeController>>, action: fn(&mut AltitudeController)) {
    if let Some(controller) = weak.upgrade() {
        action(&mut controller.lock());
    }
}

impl PeriodicAgent for AltitudeController {
    fn core(&self) -> &PeriodicCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PeriodicCore {
        &mut self.core
    }

    fn attempt_cmd(&mut self, timestamp: f64, period: u32, command: &Command) -> PeriodStatus {
        if !self.in_window(timestamp) {
            self.core.set_status(PeriodStatus::Missed);
            return PeriodStatus::Ignored;
        }
        let Command::Altitude(altitude) = *command else {
            return PeriodStatus::Ignored;
        };
        self.services.screen.update(ScreenUpdate::Altitude(altitude));

        if self.core.status() != PeriodStatus::Missed {
            error!(
                "AltitudeController no {} already received an altitude in period {}",
                self.index, period
            );
            self.core.set_status(PeriodStatus::Failure);
            return PeriodStatus::Failure;
        }

        let status = match self.next_expected {
            None => PeriodStatus::Ignored,
            Some(ExpectedAltitude::Any) => PeriodStatus::Success,
            Some(ExpectedAltitude::Value(expected)) if expected == altitude => {
                info!(
                    "AltitudeController no {} has succeeded period {} at {:.3}",
                    self.index, period, timestamp
                );
                PeriodStatus::Success
            }
            Some(ExpectedAltitude::Value(expected)) => {
                error!(
                    "AltitudeController no {} expected altitude {} but found {} in period {}",
                    self.index, expected, altitude, period
                );
                PeriodStatus::Failure
            }
        };
        self.core.set_status(status);
        status
    }

    fn on_period_finished(&mut self, timestamp: f64, period: u32) {
        if !self.in_window(timestamp) {
            return;
        }
        if self.next_expected.is_none() && self.core.status() == PeriodStatus::Missed {
            self.core.set_status(PeriodStatus::Ignored);
        }
        self.update_zone_screen();
        self.advance_program(timestamp, period);
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
    use std::time::Instant;

    const PERIOD: f64 = 0.1;

    struct Fixture {
        link: Arc<RecordingSink>,
        screen: Arc<RecordingPresentation>,
        services: AgentServices,
    }

    fn fixture() -> Fixture {
        let origin = Instant::now();
        let link = Arc::new(RecordingSink::new());
        let screen = Arc::new(RecordingPresentation::new());
        let services = AgentServices {
            link: Arc::clone(&link) as _,
            screen: Arc::clone(&screen) as _,
            alarms: SteppedAlarms::new(origin),
            epoch: GoEpoch::new(origin),
            finished: FinishSignal::new(),
        };
        Fixture {
            link,
            screen,
            services,
        }
    }

    fn config(events: Vec<AltitudeEvent>) -> AltitudeControlConfig {
        AltitudeControlConfig {
            enter: 0.0,
            exit: 100.0,
            events,
        }
    }

    fn period_end(period: u32) -> f64 {
        f64::from(period) * PERIOD + PERIOD / 2.0
    }

    #[test]
    fn test_expectations_follow_report_frequency() {
        let fx = fixture();
        let cfg = config(vec![
            AltitudeEvent::Freq { value: 400 },
            AltitudeEvent::Altitude { value: 9000, count: 3 },
        ]);
        let mut controller = AltitudeController::new(0, &cfg, PERIOD, fx.services.clone());

        let freq_period = 1;
        let mut expectations = Vec::new();
        for period in freq_period..freq_period + 20 {
            controller.on_period_finished(period_end(period), period);
            expectations.push((period + 1, controller.expected_altitude()));
        }

        for (period, expected) in &expectations {
            if expected.is_some() {
                assert_eq!((period - freq_period) % 4, 0, "period {} is not due", period);
            }
        }
        let exact = expectations
            .iter()
            .filter(|(_, expected)| *expected == Some(ExpectedAltitude::Value(9000)))
            .count();
        assert_eq!(exact, 3);
        assert_eq!(fx.link.commands(), vec![Command::Altitude(400)]);
        assert!(controller.events_finished());
    }

    #[test]
    fn test_stride_rounds_to_whole_periods() {
        for (period, freq, stride) in [(0.15, 200, 1), (0.1, 600, 6), (0.1, 400, 4), (0.25, 600, 2)] {
            let fx = fixture();
            let cfg = config(vec![AltitudeEvent::Freq { value: freq }]);
            let mut controller = AltitudeController::new(0, &cfg, period, fx.services.clone());
            controller.on_period_finished(1.5 * period, 1);

            assert_eq!(controller.stride(), stride, "{} ms over {} s", freq, period);
            assert!(!controller.report_due(1));
            assert!(controller.report_due(1 + stride));
            assert!(controller.report_due(1 + 2 * stride));
        }
    }

    #[test]
    fn test_reports_are_judged_against_expectation() {
        let fx = fixture();
        let cfg = config(vec![
            AltitudeEvent::Freq { value: 200 },
            AltitudeEvent::Altitude { value: 5000, count: 2 },
        ]);
        let mut controller = AltitudeController::new(3, &cfg, PERIOD, fx.services.clone());

        // Freq at period 1; period 2 is a grace period.
        controller.on_period_finished(period_end(1), 1);
        assert_eq!(controller.expected_altitude(), None);
        controller.on_period_finished(period_end(2), 2);
        assert_eq!(controller.expected_altitude(), Some(ExpectedAltitude::Value(5000)));

        let ts = 0.3;
        assert_eq!(
            controller.attempt_cmd(ts, 3, &Command::Altitude(5000)),
            PeriodStatus::Success
        );
        assert_eq!(
            controller.attempt_cmd(ts, 3, &Command::Altitude(5000)),
            PeriodStatus::Failure
        );
        controller.on_period_finished(period_end(3), 3);
        controller.on_period_finished(period_end(4), 4);

        assert_eq!(
            controller.attempt_cmd(0.5, 5, &Command::Altitude(4000)),
            PeriodStatus::Failure
        );
        controller.on_period_finished(period_end(5), 5);

        let zones: Vec<_> = fx
            .screen
            .updates()
            .into_iter()
            .filter(|update| matches!(update, ScreenUpdate::AltitudeZone { .. }))
            .collect();
        assert_eq!(
            zones.last(),
            Some(&ScreenUpdate::AltitudeZone {
                controller: 3,
                zone: 0,
                state: AltitudeZoneState::Bad
            })
        );
        assert!(fx.screen.updates().contains(&ScreenUpdate::Altitude(4000)));
    }

    #[test]
    fn test_outside_window_is_ignored_quietly() {
        let fx = fixture();
        let cfg = AltitudeControlConfig {
            enter: 5.0,
            exit: 6.0,
            events: vec![AltitudeEvent::Free { count: 2 }],
        };
        let mut controller = AltitudeController::new(0, &cfg, PERIOD, fx.services.clone());

        assert_eq!(
            controller.attempt_cmd(1.0, 10, &Command::Altitude(100)),
            PeriodStatus::Ignored
        );
        assert_eq!(controller.period_status(), PeriodStatus::Missed);
        controller.on_period_finished(1.05, 10);
        assert_eq!(controller.core().tally().total(), 0);
        assert!(fx.screen.updates().is_empty());
    }

    #[test]
    fn test_enter_and_exit_alarms_toggle_screen() {
        let origin = Instant::now();
        let alarms = SteppedAlarms::new(origin);
        let link = Arc::new(RecordingSink::new());
        let screen = Arc::new(RecordingPresentation::new());
        let services = AgentServices {
            link: Arc::clone(&link) as _,
            screen: Arc::clone(&screen) as _,
            alarms: Arc::clone(&alarms) as _,
            epoch: GoEpoch::new(origin),
            finished: FinishSignal::new(),
        };
        let cfg = AltitudeControlConfig {
            enter: 1.0,
            exit: 2.0,
            events: Vec::new(),
        };
        let _controller = AltitudeController::new_shared(0, &cfg, PERIOD, services);

        alarms.advance_to(origin + std::time::Duration::from_secs(3));
        assert_eq!(
            screen.updates(),
            vec![
                ScreenUpdate::AltitudeControls(true),
                ScreenUpdate::AltitudeControls(false)
            ]
        );
        assert_eq!(link.commands(), vec![Command::Altitude(0)]);
    }
}
