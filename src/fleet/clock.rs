use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{error, info, warn};
use serde::Serialize;
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::{config::SimulationConfig, error::AppResult, fleet::handle::FleetHandle};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClockState {
    Stopped,
    Running,
}

/// Drives the fleet with periodic ticks on a background task.
///
/// Ticks run one after another on that task and take the engine lock, so
/// they never overlap each other or a command. A slow tick delays the next
/// one instead of bunching up.
pub struct SimulationClock {
    fleet: FleetHandle,
    interval: Duration,
    tick_seconds: f64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimulationClock {
    pub fn new(fleet: FleetHandle, config: &SimulationConfig) -> Arc<Self> {
        Arc::new(Self {
            fleet,
            interval: config.tick_interval,
            tick_seconds: config.tick_seconds(),
            worker: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ClockState {
        let worker = match self.worker.lock() {
            Ok(worker) => worker,
            Err(poisoned) => poisoned.into_inner(),
        };
        match worker.as_ref() {
            Some(handle) if !handle.is_finished() => ClockState::Running,
            _ => ClockState::Stopped,
        }
    }

    /// Returns false when the clock was already running.
    pub fn start(&self) -> bool {
        let mut worker = match self.worker.lock() {
            Ok(worker) => worker,
            Err(poisoned) => poisoned.into_inner(),
        };
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let fleet = self.fleet.clone();
        let period = self.interval;
        let tick_seconds = self.tick_seconds;
        *worker = Some(tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                match fleet.tick(tick_seconds).await {
                    Ok(report) if !report.completed.is_empty() || !report.expired.is_empty() => info!(
                        "Tick {}: {} completed, {} expired",
                        report.tick,
                        report.completed.len(),
                        report.expired.len()
                    ),
                    Ok(_) => {}
                    Err(e) => error!("Tick aborted: {}", e),
                }
            }
        }));
        info!(
            "Simulation clock started: every {:?}, {:.1} s simulated per tick",
            period, tick_seconds
        );
        true
    }

    /// Returns false when the clock was not running. A tick is applied
    /// synchronously under the engine lock, so aborting never splits one.
    pub fn stop(&self) -> bool {
        let mut worker = match self.worker.lock() {
            Ok(worker) => worker,
            Err(poisoned) => poisoned.into_inner(),
        };
        match worker.take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                info!("Simulation clock stopped");
                true
            }
            _ => false,
        }
    }

    /// Stop ticking and write everything out.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.stop();
        let result = self.fleet.save_all().await;
        if let Err(e) = &result {
            warn!("Final save incomplete: {}", e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        advisor::gateway::RouteAdvisorGateway,
        config::FleetSettings,
        db::app_storage::FleetStorage,
        fleet::{emergency::EmergencyLatch, engine::FleetEngine},
        notify::EventLog,
    };

    fn fleet() -> FleetHandle {
        let settings = FleetSettings::default();
        let log = Arc::new(EventLog::new());
        let store = Arc::new(FleetStorage::temporary().unwrap());
        let engine = FleetEngine::new(settings.clone(), store, log.clone(), EmergencyLatch::default());
        FleetHandle::new(engine, RouteAdvisorGateway::new(&settings, None, log))
    }

    #[tokio::test]
    async fn runs_ticks_until_stopped() {
        let handle = fleet();
        let config = SimulationConfig {
            enabled: true,
            tick_interval: Duration::from_millis(10),
            speed_multiplier: 1.0,
        };
        let clock = SimulationClock::new(handle.clone(), &config);
        assert_eq!(clock.state(), ClockState::Stopped);

        assert!(clock.start());
        assert!(!clock.start());
        assert_eq!(clock.state(), ClockState::Running);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.get_fleet_snapshot().tick > 0);

        assert!(clock.stop());
        assert!(!clock.stop());
        assert_eq!(clock.state(), ClockState::Stopped);
        clock.shutdown().await.unwrap();
    }
}
