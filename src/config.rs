use std::{env, str::FromStr, time::Duration};

use chrono::TimeDelta;
use dotenvy::dotenv;

use crate::error::AppError;

/// Per-vehicle physical limits used by the motion model and the scheduler.
#[derive(Clone, Debug)]
pub struct AgvConfig {
    pub max_speed_kmh: f64,
    pub min_battery_level: f64,
    pub charging_threshold: f64,
    pub charging_rate_per_minute: f64,
    /// Battery level at which a charging vehicle returns to service.
    pub charge_complete_level: f64,
    /// Battery percent consumed per 100 metres travelled.
    pub drain_per_100m: f64,
    /// Distance under which a vehicle counts as arrived, in metres.
    pub arrival_epsilon: f64,
}

impl Default for AgvConfig {
    fn default() -> Self {
        Self {
            max_speed_kmh: 25.0,
            min_battery_level: 10.0,
            charging_threshold: 20.0,
            charging_rate_per_minute: 2.5,
            charge_complete_level: 90.0,
            drain_per_100m: 1.0,
            arrival_epsilon: 0.5,
        }
    }
}

impl AgvConfig {
    pub fn speed_m_per_s(&self) -> f64 {
        self.max_speed_kmh / 3.6
    }

    /// Battery percent needed to travel `distance` metres.
    pub fn energy_for(&self, distance: f64) -> f64 {
        distance / 100.0 * self.drain_per_100m
    }
}

#[derive(Clone, Debug)]
pub struct FleetConfig {
    pub max_agvs: usize,
    pub max_concurrent_tasks: usize,
    pub task_timeout: TimeDelta,
    /// Multiplier applied to the outbound trip when checking battery eligibility.
    pub round_trip_factor: f64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_agvs: 20,
            max_concurrent_tasks: 50,
            task_timeout: TimeDelta::minutes(120),
            round_trip_factor: 2.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub enabled: bool,
    pub tick_interval: Duration,
    pub speed_multiplier: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: Duration::from_secs(5),
            speed_multiplier: 1.0,
        }
    }
}

impl SimulationConfig {
    /// Simulated seconds covered by one tick.
    pub fn tick_seconds(&self) -> f64 {
        self.tick_interval.as_secs_f64() * self.speed_multiplier
    }
}

#[derive(Clone, Debug)]
pub struct AdvisorConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub timeout: Duration,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            timeout: Duration::from_millis(2000),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AlertConfig {
    pub low_battery_threshold: f64,
    pub stall_duration: TimeDelta,
    pub deadline_warning_window: TimeDelta,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            low_battery_threshold: 20.0,
            stall_duration: TimeDelta::minutes(30),
            deadline_warning_window: TimeDelta::minutes(10),
        }
    }
}

/// Bounds of the yard, in metres from the origin corner.
#[derive(Clone, Debug)]
pub struct YardConfig {
    pub width: f64,
    pub height: f64,
    /// Longest straight leg accepted in a suggested route.
    pub max_route_leg: f64,
}

impl Default for YardConfig {
    fn default() -> Self {
        Self {
            width: 1000.0,
            height: 1000.0,
            max_route_leg: 600.0,
        }
    }
}

/// Everything the fleet engine needs; fixed at construction.
#[derive(Clone, Debug, Default)]
pub struct FleetSettings {
    pub agv: AgvConfig,
    pub fleet: FleetConfig,
    pub simulation: SimulationConfig,
    pub advisor: AdvisorConfig,
    pub alerts: AlertConfig,
    pub yard: YardConfig,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_root_path: String,
    pub roster_path: Option<String>,
    pub settings: FleetSettings,
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| AppError::validation(format!("{key}={raw}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if it exists
        dotenv().ok();

        let d = FleetSettings::default();

        let agv = AgvConfig {
            max_speed_kmh: env_or("AGV_MAX_SPEED", d.agv.max_speed_kmh)?,
            min_battery_level: env_or("AGV_MIN_BATTERY", d.agv.min_battery_level)?,
            charging_threshold: env_or("AGV_CHARGING_THRESHOLD", d.agv.charging_threshold)?,
            charging_rate_per_minute: env_or("AGV_CHARGING_RATE", d.agv.charging_rate_per_minute)?,
            charge_complete_level: env_or("AGV_CHARGE_COMPLETE", d.agv.charge_complete_level)?,
            drain_per_100m: env_or("AGV_DRAIN_PER_100M", d.agv.drain_per_100m)?,
            arrival_epsilon: d.agv.arrival_epsilon,
        };

        let fleet = FleetConfig {
            max_agvs: env_or("FLEET_MAX_AGVS", d.fleet.max_agvs)?,
            max_concurrent_tasks: env_or("FLEET_MAX_TASKS", d.fleet.max_concurrent_tasks)?,
            task_timeout: TimeDelta::minutes(env_or("TASK_TIMEOUT", 120i64)?),
            round_trip_factor: env_or("ROUND_TRIP_FACTOR", d.fleet.round_trip_factor)?,
        };

        let simulation = SimulationConfig {
            enabled: env_flag("SIMULATION_ENABLED", d.simulation.enabled),
            tick_interval: Duration::from_millis(env_or("SIMULATION_TICK_MS", 5000u64)?),
            speed_multiplier: env_or("SIMULATION_SPEED", d.simulation.speed_multiplier)?,
        };

        let advisor = AdvisorConfig {
            enabled: env_flag("ROUTE_OPTIMIZATION", d.advisor.enabled),
            url: env::var("ADVISOR_URL").ok().filter(|s| !s.is_empty()),
            timeout: Duration::from_millis(env_or("ADVISOR_TIMEOUT_MS", 2000u64)?),
        };

        let alerts = AlertConfig {
            low_battery_threshold: env_or(
                "LOW_BATTERY_THRESHOLD",
                agv.charging_threshold,
            )?,
            stall_duration: TimeDelta::minutes(env_or("STALL_MINUTES", 30i64)?),
            deadline_warning_window: TimeDelta::minutes(env_or("DEADLINE_WARNING_MINUTES", 10i64)?),
        };

        let yard = YardConfig {
            width: env_or("YARD_WIDTH", d.yard.width)?,
            height: env_or("YARD_HEIGHT", d.yard.height)?,
            max_route_leg: env_or("MAX_ROUTE_LEG", d.yard.max_route_leg)?,
        };

        let config = Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 5001u16)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            database_root_path: env::var("DATABASE_ROOT_PATH")
                .unwrap_or_else(|_| "./data".to_string()),
            roster_path: env::var("FLEET_ROSTER_PATH").ok().filter(|s| !s.is_empty()),
            settings: FleetSettings {
                agv,
                fleet,
                simulation,
                advisor,
                alerts,
                yard,
            },
        };
        config.settings.validate()?;
        Ok(config)
    }
}

impl FleetSettings {
    pub fn validate(&self) -> Result<(), AppError> {
        let mut errors = Vec::new();

        if !(self.agv.max_speed_kmh > 0.0 && self.agv.max_speed_kmh <= 50.0) {
            errors.push("AGV_MAX_SPEED must be in (0, 50] km/h".to_string());
        }
        if !(0.0..=100.0).contains(&self.agv.min_battery_level) {
            errors.push("AGV_MIN_BATTERY must be in [0, 100]".to_string());
        }
        if self.agv.charging_threshold < self.agv.min_battery_level {
            errors.push("AGV_CHARGING_THRESHOLD must not be below AGV_MIN_BATTERY".to_string());
        }
        if self.agv.charge_complete_level <= self.agv.charging_threshold
            || self.agv.charge_complete_level > 100.0
        {
            errors.push("AGV_CHARGE_COMPLETE must be above the charging threshold".to_string());
        }
        if self.agv.charging_rate_per_minute <= 0.0 || self.agv.drain_per_100m < 0.0 {
            errors.push("charging rate must be positive and drain non-negative".to_string());
        }
        if self.fleet.max_concurrent_tasks == 0 {
            errors.push("FLEET_MAX_TASKS must be at least 1".to_string());
        }
        if self.fleet.task_timeout <= TimeDelta::zero() {
            errors.push("TASK_TIMEOUT must be positive".to_string());
        }
        if self.fleet.round_trip_factor < 1.0 {
            errors.push("ROUND_TRIP_FACTOR must be at least 1".to_string());
        }
        if self.simulation.speed_multiplier <= 0.0 || self.simulation.tick_interval.is_zero() {
            errors.push("SIMULATION_SPEED and SIMULATION_TICK_MS must be positive".to_string());
        }
        if self.advisor.timeout.is_zero() {
            errors.push("ADVISOR_TIMEOUT_MS must be positive".to_string());
        }
        if self.yard.width <= 0.0 || self.yard.height <= 0.0 || self.yard.max_route_leg <= 0.0 {
            errors.push("yard dimensions must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::validation(errors.join("; ")))
        }
    }
}
