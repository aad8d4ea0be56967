pub mod simulated;

use std::time::Duration;

use log::debug;

use crate::error::{CoreError, CoreErrorKind};
use crate::protocol::ack_for;
use crate::sync::sleep;

/// Stateless adapter over the robot register plane. The register space is opaque
/// integers; meaning is imposed by the scheduler, not by this trait.
pub trait RobotGateway: Send + Sync {
    fn read_register(&self, addr: i64) -> Result<i64, CoreError>;
    fn write_register(&self, addr: i64, value: i64) -> Result<(), CoreError>;
    fn stop_program(&self) -> Result<(), CoreError>;
    fn start_program(&self, idx: i64) -> Result<(), CoreError>;

    /// Writes `cmd_code` to `REG_CMD`.
    fn send_command(&self, cmd_code: i64) -> Result<(), CoreError> {
        self.write_register(crate::protocol::REG_CMD, cmd_code)
    }

    /// Polls `REG_INIT` until it equals `target`, `mode_is_auto()` turns false, or
    /// `timeout` elapses. Every suspension point re-checks mode so leaving
    /// AUTO aborts the wait cleanly instead of blocking until the timeout.
    fn wait_for_init(
        &self,
        target: i64,
        timeout: Duration,
        mode_is_auto: &dyn Fn() -> bool,
    ) -> Result<(), CoreError> {
        let poll_interval = Duration::from_millis(20);
        let mut waited = Duration::ZERO;
        loop {
            if !mode_is_auto() {
                return Err(CoreError::new_of_type(
                    "wait_for_init aborted: system left AUTO",
                    CoreErrorKind::ModeLeftAuto,
                ));
            }
            let value = self.read_register(crate::protocol::REG_INIT)?;
            if value == target {
                return Ok(());
            }
            if waited >= timeout {
                return Err(CoreError::new_of_type(
                    &format!("wait_for_init timed out waiting for REG_INIT == {target}"),
                    CoreErrorKind::RobotTimeout,
                ));
            }
            sleep(poll_interval);
            waited += poll_interval;
        }
    }

    /// Convenience: `wait_for_init` for the ack of `cmd_code`.
    fn wait_for_ack(
        &self,
        cmd_code: i64,
        timeout: Duration,
        mode_is_auto: &dyn Fn() -> bool,
    ) -> Result<(), CoreError> {
        debug!("waiting for ack of cmd {cmd_code}");
        self.wait_for_init(ack_for(cmd_code), timeout, mode_is_auto)
    }
}

/// Fire-and-forget / synchronous device actuation. Coffee extraction and rinse
/// are fire-and-forget from the caller's perspective: the scheduler times itself against
/// the recipe's duration via an explicit `sleep` action rather than blocking here.
pub trait DeviceGateway: Send + Sync {
    fn make_coffee(&self, product_id: i64, precharge_time: f32) -> Result<(), CoreError>;
    fn execute_rinse(&self) -> Result<(), CoreError>;
    fn dispense_ice_water(&self, ice_s: f32, water_s: f32) -> Result<(), CoreError>;
    fn dispense_sparkling(&self, s: f32) -> Result<(), CoreError>;
    fn dispense_hot_water(&self, s: f32) -> Result<(), CoreError>;
    fn dispense_syrup(&self, id: u8, s: f32) -> Result<(), CoreError>;
    fn stop_all(&self) -> Result<(), CoreError>;
}

/// Raw coil-level IO: cup-dispense toggles and the cup-presence sensor bit.
pub trait IoGateway: Send + Sync {
    fn pulse(&self, unit: u8, addr: i64, seconds: f32) -> Result<(), CoreError>;
    fn write_coil(&self, unit: u8, addr: i64, value: i64) -> Result<(), CoreError>;
    fn read_coils(&self, unit: u8, addr: i64, count: u32) -> Result<Vec<bool>, CoreError>;
}

/// Customer pickup rack.
pub trait PickupGateway: Send + Sync {
    fn notify_slot(&self, zone: u32, slot: u32, order_no: i64, menu_code: i64) -> Result<(), CoreError>;
    fn get_occupancy(&self, zone: u32) -> Result<Vec<bool>, CoreError>;
}
