//! The robot register plane and the device IO coil table. The register space is
//! opaque integers; meaning is imposed entirely by the scheduler that reads/writes them.

/// Core→Robot: motion verb to execute.
pub const REG_CMD: i64 = 600;
/// Robot→Core: ack, equals `REG_CMD + 500` on completion; 0 when idle.
pub const REG_INIT: i64 = 700;
/// Robot→Core: 0 idle, 1 moving (informational only).
pub const REG_STAT: i64 = 900;
/// Core→Robot: 1=hot, 2=iced; rewritten to 3/4 once the robot reaches the cup dispenser.
pub const REG_CUP_IDX: i64 = 100;
/// Core→Robot: target pickup slot, 1..=4.
pub const REG_PICKUP_IDX: i64 = 101;
/// Robot→Core: 1=dispense ok, 2=fail. Legacy: defined for protocol completeness, unused
/// on the dispense path (the cup sub-protocol uses `REG_CUP_SENSOR` instead).
pub const REG_CUP_RES: i64 = 102;
/// Robot→Core: 1 when the robot has arrived at the cup sensor.
pub const REG_CUP_MOVE: i64 = 104;
/// Core→Robot: 1=cup present, 2=missing.
pub const REG_CUP_SENSOR: i64 = 105;
/// Robot→Core: 1 when the robot is in position for dispense.
pub const REG_CUP_ON: i64 = 106;
/// Core→Robot: 1..=8 syrup selector.
pub const REG_SYRUP_IDX: i64 = 107;

/// The ack for command `cmd` is `cmd + ACK_OFFSET`, observed on `REG_INIT`.
pub const ACK_OFFSET: i64 = 500;

/// Motion verbs (cmd_code -> ack = cmd + 500).
pub mod cmd {
    pub const CUP_MOVE: i64 = 110;
    pub const WI_MOVE: i64 = 111;
    pub const WI_DONE: i64 = 112;
    pub const COFFEE_MOVE: i64 = 113;
    pub const COFFEE_DONE: i64 = 114;
    pub const COFFEE_PLACE: i64 = 115;
    pub const COFFEE_PICK: i64 = 116;
    pub const HOT_MOVE: i64 = 117;
    pub const HOT_DONE: i64 = 118;
    pub const PICKUP_MOVE: i64 = 119;
    pub const PICKUP_PLACE: i64 = 120;
    pub const SYRUP_MOVE: i64 = 121;
    pub const SYRUP_DONE: i64 = 122;
    pub const HOME: i64 = 123;
}

/// Device IO coil addresses (unit, addr).
pub mod coil {
    /// Ice-machine trigger button: unit 5, addr 3200, pulse 0.5s.
    pub const ICE_TRIGGER: (u8, i64) = (5, 3200);
    /// Hot-water tap: unit 5, addr 3201, pulse 0.5s to open.
    pub const HOT_WATER_TAP: (u8, i64) = (5, 3201);
    /// Cup dispense signal, hot cup: unit 5, addr 3202, pulse 1s.
    pub const CUP_DISPENSE_HOT: (u8, i64) = (5, 3202);
    /// Cup dispense signal, iced cup: unit 5, addr 3203, pulse 1s.
    pub const CUP_DISPENSE_ICED: (u8, i64) = (5, 3203);
    /// Sparkling solenoid: unit 5, addr 3204.
    pub const SPARKLING: (u8, i64) = (5, 3204);
    /// Cup-presence sensor bit: unit 3, addr 6, count 1.
    pub const CUP_PRESENCE: (u8, i64) = (3, 6);

    /// Syrup coil for 1-indexed syrup id (1..=8): syrups 1..4 on unit 6 addr 3200..3203,
    /// syrups 5..8 on unit 6 addr 3204..3207.
    pub fn syrup(id: u8) -> (u8, i64) {
        let offset = (id.saturating_sub(1)) as i64;
        (6, 3200 + offset)
    }
}

/// Acknowledgement register value for a dispatched command.
pub fn ack_for(cmd_code: i64) -> i64 {
    cmd_code + ACK_OFFSET
}
