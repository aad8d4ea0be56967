use crate::sync::{Arc, Mutex};

/// Process-wide operating mode. Initialized MANUAL; mutated only through
/// `TaskScheduler::set_mode`, which also performs the robot-program start/stop
/// side-effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMode {
    Manual,
    Auto,
}

/// A shareable handle onto the single mode cell. Every suspension point in the
/// scheduler re-checks `is_auto()` so leaving AUTO aborts a wait cleanly.
#[derive(Clone)]
pub struct SystemModeCell(Arc<Mutex<SystemMode>>);

impl SystemModeCell {
    pub fn new() -> Self {
        SystemModeCell(Arc::new(Mutex::new(SystemMode::Manual)))
    }

    pub fn get(&self) -> SystemMode {
        *self.0.lock().unwrap()
    }

    pub fn is_auto(&self) -> bool {
        self.get() == SystemMode::Auto
    }

    pub(crate) fn set(&self, mode: SystemMode) {
        *self.0.lock().unwrap() = mode;
    }
}

impl Default for SystemModeCell {
    fn default() -> Self {
        Self::new()
    }
}
