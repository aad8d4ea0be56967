//! In-process stand-ins for the real transports. Each simulated gateway
//! advances its own state on a background thread the way the real hardware would on its
//! own clock, so the scheduler's polling protocol is exercised against realistic timing
//! without a robot, modbus bus, or pickup rack attached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info};

use crate::error::CoreError;
use crate::protocol::{ack_for, cmd, REG_CMD, REG_CUP_IDX, REG_CUP_MOVE, REG_CUP_ON, REG_INIT};
use crate::sync::{thread, Arc, Mutex};
use crate::sync::sleep;

use super::{DeviceGateway, IoGateway, PickupGateway, RobotGateway};

const SIM_TICK: Duration = Duration::from_millis(5);

/// A robot register plane backed by a background thread that plays the part of the real
/// controller: it watches `REG_CMD` and, after a short delay, publishes the ack on
/// `REG_INIT`, driving the cup sub-protocol's `CUP_ON`/`CUP_MOVE` handshake when the
/// dispatched command is `CUP_MOVE`.
pub struct SimulatedRobotGateway {
    registers: Arc<Mutex<HashMap<i64, i64>>>,
    running: Arc<AtomicBool>,
}

impl SimulatedRobotGateway {
    pub fn new() -> Self {
        let registers = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        let loop_registers = Arc::clone(&registers);
        let loop_running = Arc::clone(&running);
        thread::spawn(move || run_sim_loop(loop_registers, loop_running));

        SimulatedRobotGateway { registers, running }
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Default for SimulatedRobotGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimulatedRobotGateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_sim_loop(registers: Arc<Mutex<HashMap<i64, i64>>>, running: Arc<AtomicBool>) {
    let mut last_acked_cmd = 0_i64;

    while running.load(Ordering::SeqCst) {
        sleep(SIM_TICK);

        let cmd_code = {
            let regs = registers.lock().unwrap();
            *regs.get(&REG_CMD).unwrap_or(&0)
        };

        if cmd_code == 0 || cmd_code == last_acked_cmd {
            continue;
        }

        if cmd_code == cmd::CUP_MOVE {
            simulate_cup_move(&registers, &running);
        } else {
            sleep(SIM_TICK);
        }

        let mut regs = registers.lock().unwrap();
        regs.insert(REG_INIT, ack_for(cmd_code));
        last_acked_cmd = cmd_code;
        debug!("[SIM ROBOT] acked cmd {cmd_code}");
    }
}

/// Drives the cup sub-protocol's robot-side signals: publish
/// `CUP_ON=1`, wait for the scheduler to reset it and rewrite `REG_CUP_IDX` to 3/4, then
/// publish `CUP_MOVE=1` and wait for the scheduler to read the cup-presence sensor and
/// write `REG_CUP_SENSOR` before this function returns (the caller acks afterward).
fn simulate_cup_move(registers: &Arc<Mutex<HashMap<i64, i64>>>, running: &Arc<AtomicBool>) {
    {
        let mut regs = registers.lock().unwrap();
        regs.insert(REG_CUP_ON, 1);
    }
    wait_until(registers, running, |regs| *regs.get(&REG_CUP_ON).unwrap_or(&0) == 0);
    wait_until(registers, running, |regs| {
        matches!(regs.get(&REG_CUP_IDX), Some(3) | Some(4))
    });

    {
        let mut regs = registers.lock().unwrap();
        regs.insert(REG_CUP_MOVE, 1);
    }
    wait_until(registers, running, |regs| *regs.get(&REG_CUP_MOVE).unwrap_or(&0) == 0);
}

fn wait_until(
    registers: &Arc<Mutex<HashMap<i64, i64>>>,
    running: &Arc<AtomicBool>,
    predicate: impl Fn(&HashMap<i64, i64>) -> bool,
) {
    while running.load(Ordering::SeqCst) {
        {
            let regs = registers.lock().unwrap();
            if predicate(&regs) {
                return;
            }
        }
        sleep(SIM_TICK);
    }
}

impl RobotGateway for SimulatedRobotGateway {
    fn read_register(&self, addr: i64) -> Result<i64, CoreError> {
        Ok(*self.registers.lock().unwrap().get(&addr).unwrap_or(&0))
    }

    fn write_register(&self, addr: i64, value: i64) -> Result<(), CoreError> {
        self.registers.lock().unwrap().insert(addr, value);
        Ok(())
    }

    fn stop_program(&self) -> Result<(), CoreError> {
        info!("[SIM ROBOT] stop_program");
        Ok(())
    }

    fn start_program(&self, idx: i64) -> Result<(), CoreError> {
        info!("[SIM ROBOT] start_program({idx})");
        Ok(())
    }
}

/// Simulated coffee/ice/hot-water/syrup bus. The synchronous calls here acknowledge
/// receipt of the command only; the scheduler owns the actual extraction/dispense
/// timing via explicit `sleep` device actions, so this gateway never blocks for
/// the recipe-encoded duration itself.
pub struct SimulatedDeviceGateway;

impl SimulatedDeviceGateway {
    pub fn new() -> Self {
        SimulatedDeviceGateway
    }
}

impl Default for SimulatedDeviceGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceGateway for SimulatedDeviceGateway {
    fn make_coffee(&self, product_id: i64, precharge_time: f32) -> Result<(), CoreError> {
        debug!("[SIM DEVICE] make_coffee(product_id={product_id}, precharge={precharge_time})");
        Ok(())
    }

    fn execute_rinse(&self) -> Result<(), CoreError> {
        debug!("[SIM DEVICE] execute_rinse");
        Ok(())
    }

    fn dispense_ice_water(&self, ice_s: f32, water_s: f32) -> Result<(), CoreError> {
        debug!("[SIM DEVICE] dispense_ice_water(ice={ice_s}, water={water_s})");
        Ok(())
    }

    fn dispense_sparkling(&self, s: f32) -> Result<(), CoreError> {
        debug!("[SIM DEVICE] dispense_sparkling({s})");
        Ok(())
    }

    fn dispense_hot_water(&self, s: f32) -> Result<(), CoreError> {
        debug!("[SIM DEVICE] dispense_hot_water({s})");
        Ok(())
    }

    fn dispense_syrup(&self, id: u8, s: f32) -> Result<(), CoreError> {
        debug!("[SIM DEVICE] dispense_syrup(id={id}, {s})");
        Ok(())
    }

    fn stop_all(&self) -> Result<(), CoreError> {
        info!("[SIM DEVICE] stop_all");
        Ok(())
    }
}

/// Simulated modbus coil plane. `force_cup_miss` lets tests drive the cup-sensor-failure
/// path (S4) deterministically instead of relying on randomness.
pub struct SimulatedIoGateway {
    coils: Mutex<HashMap<(u8, i64), i64>>,
    force_cup_miss: AtomicBool,
}

impl SimulatedIoGateway {
    pub fn new() -> Self {
        SimulatedIoGateway {
            coils: Mutex::new(HashMap::new()),
            force_cup_miss: AtomicBool::new(false),
        }
    }

    /// When set, `read_coils` for the cup-presence bit always reports "missing".
    pub fn set_force_cup_miss(&self, miss: bool) {
        self.force_cup_miss.store(miss, Ordering::SeqCst);
    }
}

impl Default for SimulatedIoGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl IoGateway for SimulatedIoGateway {
    fn pulse(&self, unit: u8, addr: i64, seconds: f32) -> Result<(), CoreError> {
        debug!("[SIM IO] pulse(unit={unit}, addr={addr}, {seconds}s)");
        self.coils.lock().unwrap().insert((unit, addr), 1);
        sleep(Duration::from_secs_f32(seconds));
        self.coils.lock().unwrap().insert((unit, addr), 0);
        Ok(())
    }

    fn write_coil(&self, unit: u8, addr: i64, value: i64) -> Result<(), CoreError> {
        self.coils.lock().unwrap().insert((unit, addr), value);
        Ok(())
    }

    fn read_coils(&self, unit: u8, addr: i64, count: u32) -> Result<Vec<bool>, CoreError> {
        if (unit, addr) == crate::protocol::coil::CUP_PRESENCE
            && self.force_cup_miss.load(Ordering::SeqCst)
        {
            return Ok(vec![false; count as usize]);
        }

        let coils = self.coils.lock().unwrap();
        Ok((0..count as i64)
            .map(|i| *coils.get(&(unit, addr + i)).unwrap_or(&1) != 0)
            .collect())
    }
}

/// Simulated pickup rack: zone 1, four slots, tracked purely in memory.
pub struct SimulatedPickupGateway {
    occupied: Mutex<Vec<bool>>,
}

impl SimulatedPickupGateway {
    pub fn new(slot_count: usize) -> Self {
        SimulatedPickupGateway {
            occupied: Mutex::new(vec![false; slot_count]),
        }
    }
}

impl PickupGateway for SimulatedPickupGateway {
    fn notify_slot(&self, zone: u32, slot: u32, order_no: i64, menu_code: i64) -> Result<(), CoreError> {
        info!("[SIM PICKUP] zone={zone} slot={slot} order_no={order_no} menu_code={menu_code}");
        if let Some(entry) = self.occupied.lock().unwrap().get_mut(slot.saturating_sub(1) as usize) {
            *entry = true;
        }
        Ok(())
    }

    fn get_occupancy(&self, _zone: u32) -> Result<Vec<bool>, CoreError> {
        Ok(self.occupied.lock().unwrap().clone())
    }
}

impl SimulatedPickupGateway {
    /// Frees a slot, e.g. once a test has observed the pickup notification and wants to
    /// simulate the customer taking their cup.
    pub fn clear_slot(&self, slot: u32) {
        if let Some(entry) = self.occupied.lock().unwrap().get_mut(slot.saturating_sub(1) as usize) {
            *entry = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{REG_CUP_SENSOR, REG_INIT};

    #[test]
    fn robot_gateway_acks_plain_commands() {
        let robot = SimulatedRobotGateway::new();
        robot.write_register(REG_CMD, cmd::HOME).unwrap();
        let ok = robot.wait_for_init(ack_for(cmd::HOME), Duration::from_secs(2), &|| true);
        assert!(ok.is_ok());
    }

    #[test]
    fn cup_move_handshake_runs_to_completion() {
        let robot = SimulatedRobotGateway::new();
        robot.write_register(REG_CMD, cmd::CUP_MOVE).unwrap();

        loop {
            if robot.read_register(REG_CUP_ON).unwrap() == 1 {
                break;
            }
            std::thread::yield_now();
        }
        robot.write_register(REG_CUP_ON, 0).unwrap();
        robot.write_register(REG_CUP_IDX, 4).unwrap();

        loop {
            if robot.read_register(REG_CUP_MOVE).unwrap() == 1 {
                break;
            }
            std::thread::yield_now();
        }
        robot.write_register(REG_CUP_SENSOR, 1).unwrap();
        robot.write_register(REG_CUP_MOVE, 0).unwrap();

        let ok = robot.wait_for_init(ack_for(cmd::CUP_MOVE), Duration::from_secs(2), &|| true);
        assert!(ok.is_ok());
        assert_eq!(robot.read_register(REG_INIT).unwrap(), ack_for(cmd::CUP_MOVE));
    }

    #[test]
    fn io_gateway_forced_cup_miss_reads_false() {
        let io = SimulatedIoGateway::new();
        io.set_force_cup_miss(true);
        let (unit, addr) = crate::protocol::coil::CUP_PRESENCE;
        let bits = io.read_coils(unit, addr, 1).unwrap();
        assert_eq!(bits, vec![false]);
    }

    #[test]
    fn pickup_gateway_tracks_occupancy() {
        let pickup = SimulatedPickupGateway::new(4);
        pickup.notify_slot(1, 2, 42, 101).unwrap();
        let occ = pickup.get_occupancy(1).unwrap();
        assert!(occ[1]);
        pickup.clear_slot(2);
        assert!(!pickup.get_occupancy(1).unwrap()[1]);
    }
}
