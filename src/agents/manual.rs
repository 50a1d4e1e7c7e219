use super::led::LedTask;
use super::{AgentServices, SharedAgent};
use crate::config::ManualConfig;
use crate::error::AgentError;
use crate::periodicity::PeriodicityCoordinator;
use crate::presentation::ScreenUpdate;
use crate::protocol::Command;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{error, info};

/// Switches the plane to manual control for a window and stacks the LED
/// tasks on the coordinator when the window opens.
pub struct ManualMode {
    config: ManualConfig,
    led_timeout: f64,
    services: AgentServices,
    coordinator: Weak<PeriodicityCoordinator>,
    leds: Vec<Arc<Mutex<LedTask>>>,
    active: bool,
}

impl ManualMode {
    pub fn new_shared(
        config: ManualConfig,
        led_timeout: f64,
        services: AgentServices,
        coordinator: &Arc<PeriodicityCoordinator>,
    ) -> Arc<Mutex<Self>> {
        let (enter, exit) = (config.manual_enter, config.manual_exit);
        let manual = Arc::new(Mutex::new(Self {
            config,
            led_timeout,
            services: services.clone(),
            coordinator: Arc::downgrade(coordinator),
            leds: Vec::new(),
            active: false,
        }));

        let weak = Arc::downgrade(&manual);
        services.schedule_at(enter, "manual-enter", move || {
            if let Some(manual) = weak.upgrade() {
                manual.lock().on_manual_enter();
            }
        });
        let weak = Arc::downgrade(&manual);
        services.schedule_at(exit, "manual-exit", move || {
            if let Some(manual) = weak.upgrade() {
                manual.lock().on_manual_exit();
            }
        });
        manual
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn led_tasks(&self) -> &[Arc<Mutex<LedTask>>] {
        &self.leds
    }

    pub fn on_manual_enter(&mut self) {
        info!("Entering manual mode");
        self.active = true;
        self.services.send(Command::Manual(1));
        self.services.screen.update(ScreenUpdate::Manual(true));

        let Some(coordinator) = self.coordinator.upgrade() else {
            error!("Manual mode has no coordinator to add led tasks to");
            return;
        };
        for task in &self.config.leds {
            match self.spawn_task(task.start_time, task.led) {
                Ok(led) => {
                    let agent: SharedAgent = led.clone();
                    coordinator.add_periodic_agent(agent);
                    self.leds.push(led);
                }
                Err(err) => error!("Led task at {:.3} is skipped: {}", task.start_time, err),
            }
        }
    }

    fn spawn_task(&self, start_time: f64, led: u8) -> Result<Arc<Mutex<LedTask>>, AgentError> {
        LedTask::new_shared(start_time, led, self.led_timeout, self.services.clone())
    }

    pub fn on_manual_exit(&mut self) {
        info!("Exiting manual mode");
        self.active = false;
        self.services.send(Command::Manual(0));
        self.services.screen.update(ScreenUpdate::Manual(false));
    }

    /// Drops the tasks; their pending alarms then do nothing.
    pub fn finish(&mut self) {
        self.leds.clear();
    }
}
