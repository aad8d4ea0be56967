use std::env;

use log::LevelFilter;

/// Identity of the attached coffee machine's wire protocol family. Only `Thermoplan`
/// carries the boiler-cooling characteristic that drives boiler-idle compensation
/// (see `scheduler::TaskScheduler::boiler_compensation`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoffeeVendor {
    Thermoplan,
    Eversys,
}

/// How pickup slots are handed out. See `scheduler::pickup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickupMode {
    Rotate,
    Sensor,
}

/// Boot-time configuration, read once from environment variables (via `dotenv`).
///
/// An example `.env`:
///
/// ```txt
///     COFFEE_VENDOR = "thermoplan"
///     PICKUP_MODE = "rotate"
///     SIMULATE_DURATIONS = "false"
///     DISPATCH_POLL_MS = "100"
/// ```
pub struct Consts;

impl Consts {
    /// Coffee machine vendor tag. Defaults to `Thermoplan`.
    pub fn coffee_vendor() -> CoffeeVendor {
        match env::var("COFFEE_VENDOR")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "eversys" => CoffeeVendor::Eversys,
            _ => CoffeeVendor::Thermoplan,
        }
    }

    /// Pickup slot assignment strategy. Defaults to `Rotate`.
    pub fn pickup_mode() -> PickupMode {
        match env::var("PICKUP_MODE")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "sensor" => PickupMode::Sensor,
            _ => PickupMode::Rotate,
        }
    }

    /// Whether `RecipeStore` should replace every positive duration with
    /// `simulation_duration_secs()`. Defaults to `false`.
    pub fn simulate_durations() -> bool {
        env::var("SIMULATE_DURATIONS")
            .unwrap_or_default()
            .parse::<bool>()
            .unwrap_or(false)
    }

    /// The constant duration used in place of real recipe durations when
    /// `simulate_durations()` is set. Defaults to 1.5s.
    pub fn simulation_duration_secs() -> f32 {
        env::var("SIMULATION_DURATION_SECS")
            .unwrap_or("1.5".to_string())
            .parse::<f32>()
            .unwrap_or(1.5)
    }

    /// Dispatcher loop poll interval, in milliseconds. Defaults to 100ms.
    pub fn dispatch_poll_ms() -> u64 {
        env::var("DISPATCH_POLL_MS")
            .unwrap_or("100".to_string())
            .parse::<u64>()
            .unwrap_or(100)
    }

    /// Number of pickup slots on the rack. Defaults to 4.
    pub fn pickup_slot_count() -> u32 {
        env::var("PICKUP_SLOT_COUNT")
            .unwrap_or("4".to_string())
            .parse::<u32>()
            .unwrap_or(4)
    }
}

/// Timeout for `wait_for_init` while waiting on ordinary robot motion.
pub const ROBOT_MOTION_TIMEOUT_SECS: u64 = 600;

/// Timeout for each step of the cup-dispense handshake.
pub const CUP_HANDSHAKE_TIMEOUT_SECS: u64 = 60;

/// Small delay between successive register writes, absorbing register-bus latency.
pub const REGISTER_WRITE_DELAY_MS: u64 = 50;

/// Idle threshold past which a Thermoplan boiler needs an extra warmup.
pub const IDLE_TIME_THRESHOLD_SECS: u64 = 5 * 60;

/// Extra seconds added to the coffee-wait sleep when boiler-idle compensation applies.
pub const BOILER_COMPENSATION_EXTRA_SECS: f32 = 20.0;

/// Minimum remaining coffee-wait time, in seconds, required to start another
/// parallel order during the interleave loop.
pub const PARALLEL_THRESHOLD_SECS: f32 = 20.0;

/// Poll interval while waiting for a pickup slot to free up in sensor mode.
pub const PICKUP_SENSOR_POLL_SECS: u64 = 2;

/// Initializes the logger, reading the `RUST_LOG` environment variable.
///
/// Defaults to `INFO` when unset or unparsable.
pub fn init_logger() {
    env_logger::builder()
        .filter(
            None,
            env::var("RUST_LOG")
                .unwrap_or_default()
                .parse::<LevelFilter>()
                .unwrap_or(LevelFilter::Info),
        )
        .format_timestamp(None)
        .init();
}
