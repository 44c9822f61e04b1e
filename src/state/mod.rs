use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    advisor::gateway::RouteAdvisorGateway,
    config::AppConfig,
    db::FleetStore,
    fleet::{EmergencyLatch, FleetEngine, FleetHandle, SimulationClock},
    notify::EventLog,
};

#[derive(Clone)]
pub struct AppState {
    pub fleet: FleetHandle,
    pub clock: Arc<SimulationClock>,
    pub events: Arc<EventLog>,
    pub config: Arc<AppConfig>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Load the fleet from `store` and wire the engine, advisor and clock together.
    /// The clock is created stopped.
    pub fn new(store: Arc<dyn FleetStore>, config: AppConfig) -> Self {
        let events = Arc::new(EventLog::new());
        let settings = config.settings.clone();

        let engine = FleetEngine::load(settings.clone(), store, events.clone(), EmergencyLatch::default());
        let gateway = RouteAdvisorGateway::from_settings(&settings, events.clone());
        let fleet = FleetHandle::new(engine, gateway);
        let clock = SimulationClock::new(fleet.clone(), &settings.simulation);

        Self {
            fleet,
            clock,
            events,
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }
}
