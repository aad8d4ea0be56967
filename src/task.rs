use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Monotonic task-id counter, scoped to the planner.
static CONTADOR_TASKS: AtomicI64 = AtomicI64::new(1);

fn next_task_id() -> i64 {
    CONTADOR_TASKS.fetch_add(1, Ordering::SeqCst)
}

/// Node status within an order's execution graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Pre/post device side-effects attached to a task. Represented as a tagged union
/// with named fields rather than dynamic-dispatch callbacks, so the
/// executor pattern-matches on the variant instead of invoking an opaque closure.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceAction {
    Coffee { product_id: i64, precharge_secs: f32 },
    IceWater { ice_secs: f32, water_secs: f32 },
    IceWaterSparkling { ice_secs: f32, water_secs: f32, sparkling_secs: f32 },
    HotWater { secs: f32 },
    Syrup { id: u8, secs: f32 },
    Sparkling { secs: f32 },
    Sleep { secs: f32 },
    Rinse,
}

/// Destination descriptor for a finished cup.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyPickup {
    pub zone: u32,
    pub order_no: i64,
    pub menu_code: i64,
}

/// A node in an order's execution graph.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: i64,
    pub cmd_code: i64,
    pub params: HashMap<i64, i64>,
    pub dependencies: Vec<i64>,
    pub status: TaskStatus,
    pub order_uuid: String,
    pub skippable: bool,
    pub chained_next_task_id: Option<i64>,
    pub pre_device_action: Option<DeviceAction>,
    pub post_device_action: Option<DeviceAction>,
    pub notify_pickup: Option<NotifyPickup>,
    pub assigned_slot: Option<u32>,
    pub parallel_check_point: bool,
    pub is_coffee_wait: bool,
    pub menu_name: String,
    pub order_no: i64,
}

impl Task {
    /// Builds a new task with a fresh monotonic `task_id` and everything else defaulted,
    /// for the planner to fill in per-stage.
    pub fn new(cmd_code: i64, order_uuid: &str, menu_name: &str, order_no: i64) -> Self {
        Task {
            task_id: next_task_id(),
            cmd_code,
            params: HashMap::new(),
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            order_uuid: order_uuid.to_string(),
            skippable: false,
            chained_next_task_id: None,
            pre_device_action: None,
            post_device_action: None,
            notify_pickup: None,
            assigned_slot: None,
            parallel_check_point: false,
            is_coffee_wait: false,
            menu_name: menu_name.to_string(),
            order_no,
        }
    }

    pub fn with_param(mut self, addr: i64, value: i64) -> Self {
        self.params.insert(addr, value);
        self
    }

    pub fn depends_on(mut self, task_id: i64) -> Self {
        self.dependencies.push(task_id);
        self
    }

    pub fn chained_to(mut self, next_task_id: i64) -> Self {
        self.chained_next_task_id = Some(next_task_id);
        self
    }

    pub fn with_pre(mut self, action: DeviceAction) -> Self {
        self.pre_device_action = Some(action);
        self
    }

    pub fn with_post(mut self, action: DeviceAction) -> Self {
        self.post_device_action = Some(action);
        self
    }

    pub fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }

    pub fn parallel_check_point(mut self) -> Self {
        self.parallel_check_point = true;
        self
    }

    pub fn coffee_wait(mut self) -> Self {
        self.is_coffee_wait = true;
        self
    }

    pub fn with_notify_pickup(mut self, notify: NotifyPickup) -> Self {
        self.notify_pickup = Some(notify);
        self
    }

    /// Whether every dependency of this task has completed, i.e. it is eligible for
    /// dispatch.
    pub fn is_ready(&self, completed: &dyn Fn(i64) -> bool) -> bool {
        self.dependencies.iter().all(|dep| completed(*dep))
    }
}
