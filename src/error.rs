use std::fmt;

/// Behaviorally distinct error kinds the scheduling core can raise.
///
/// These drive different recovery paths in the scheduler (see `scheduler::TaskScheduler`):
/// most kinds trigger fail-safe, `ModeLeftAuto` does not, and `BadRequest` never reaches
/// the scheduler at all (the planner swallows it into an empty plan).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreErrorKind {
    /// A single gateway call failed (transport-level).
    TransientTransportError,
    /// `wait_for_init` exceeded its timeout.
    RobotTimeout,
    /// The cup-presence sensor did not confirm the dispensed cup.
    CupSensorFailure,
    /// Planner input was invalid (unknown menu code, bad `cup_num`).
    BadRequest,
    /// A wait was aborted because the system left AUTO mode.
    ModeLeftAuto,
}

/// The crate's single error type: a message plus a kind discriminant.
#[derive(Debug)]
pub struct CoreError {
    pub message: String,
    pub kind: CoreErrorKind,
}

impl CoreError {
    /// Builds a generic transport-level error.
    pub fn new(message: &str) -> Self {
        CoreError {
            message: message.to_string(),
            kind: CoreErrorKind::TransientTransportError,
        }
    }

    /// Builds an error of a specific kind.
    pub fn new_of_type(message: &str, kind: CoreErrorKind) -> Self {
        CoreError {
            message: message.to_string(),
            kind,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CoreError {}
