use std::collections::{HashMap, VecDeque};

use log::{info, warn};

use crate::mode::{SystemMode, SystemModeCell};
use crate::order::{Order, OrderStatus};
use crate::recipe::RecipeStore;
use crate::scheduler::TaskScheduler;
use crate::sync::{thread, Arc, Condvar, Mutex};

/// The shared active-order map, plus the FIFO of uuids the plan loop drains — a FIFO of
/// uuids, not of `Order` objects, since orders live in the map and cancel is O(1).
///
/// Cloning a `SharedOrders` clones the handle, not the data: every clone sees the same
/// map and queue. This is the typed, narrow surface `TaskScheduler` is handed instead of
/// raw access to `OrderManager`'s internals.
#[derive(Clone)]
pub struct SharedOrders {
    orders: Arc<Mutex<HashMap<String, Order>>>,
    queue: Arc<(Mutex<VecDeque<String>>, Condvar)>,
}

impl SharedOrders {
    pub fn new() -> Self {
        SharedOrders {
            orders: Arc::new(Mutex::new(HashMap::new())),
            queue: Arc::new((Mutex::new(VecDeque::new()), Condvar::new())),
        }
    }

    pub fn get(&self, uuid: &str) -> Option<Order> {
        self.orders.lock().unwrap().get(uuid).cloned()
    }

    /// Inserts a new order, status WAITING, and enqueues its uuid for the plan loop.
    pub fn insert(&self, order: Order) {
        let uuid = order.uuid.clone();
        self.orders.lock().unwrap().insert(uuid.clone(), order);
        let (lock, cvar) = &*self.queue;
        lock.lock().unwrap().push_back(uuid);
        cvar.notify_all();
    }

    /// Blocks until a uuid is queued, then pops and returns it (FIFO order).
    pub fn dequeue_blocking(&self) -> Option<String> {
        let (lock, cvar) = &*self.queue;
        let mut queue = lock.lock().unwrap();
        while queue.is_empty() {
            queue = cvar.wait(queue).unwrap();
        }
        queue.pop_front()
    }

    pub fn update_status(&self, uuid: &str, status: OrderStatus) {
        let mut orders = self.orders.lock().unwrap();
        if let Some(order) = orders.get_mut(uuid) {
            match status {
                OrderStatus::Waiting => order.status = OrderStatus::Waiting,
                OrderStatus::Processing => order.mark_processing(),
                OrderStatus::Completed => order.mark_completed(),
                OrderStatus::Cancelled => order.mark_cancelled(),
                OrderStatus::Failed => order.mark_failed(),
            }
        }
        // Every terminal status frees the slot immediately, FAILED included — a failed
        // order is not replanned or retried, so nothing is served by keeping it resident.
        if matches!(status, OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Failed) {
            orders.remove(uuid);
        }
    }

    /// Transitions to CANCELLED and removes from the active map. Returns false
    /// for an unknown, already-cancelled, or already-completed uuid.
    pub fn cancel(&self, uuid: &str) -> bool {
        let mut orders = self.orders.lock().unwrap();
        match orders.get(uuid) {
            Some(order) if !order.is_terminal() => {
                orders.remove(uuid);
                true
            }
            _ => false,
        }
    }

    /// Read-only peek at whether `claim_parallel_candidate` would currently find
    /// something, without claiming it — used to decide whether a coffee-move task
    /// should swap its outgoing command to `COFFEE_PLACE` in the first place.
    pub fn has_parallel_candidate(&self, is_coffee_order: impl Fn(&Order) -> bool) -> bool {
        self.orders
            .lock()
            .unwrap()
            .values()
            .any(|o| o.status == OrderStatus::Waiting && !o.parallel_skip && !is_coffee_order(o))
    }

    /// Atomically claims the earliest-created WAITING, non-coffee, non-skipped order for
    /// the parallel-interleave sub-protocol,
    /// flipping its status to PROCESSING before releasing the lock so no other caller
    /// can claim the same order twice.
    pub fn claim_parallel_candidate(&self, is_coffee_order: impl Fn(&Order) -> bool) -> Option<Order> {
        let mut orders = self.orders.lock().unwrap();
        let uuid = orders
            .values()
            .filter(|o| o.status == OrderStatus::Waiting && !o.parallel_skip && !is_coffee_order(o))
            .min_by_key(|o| o.created_at_millis)
            .map(|o| o.uuid.clone())?;
        let order = orders.get_mut(&uuid).unwrap();
        order.mark_processing();
        Some(order.clone())
    }

    /// Restores a failed parallel order to WAITING and sets `parallel_skip` so the
    /// current interleave session does not retry it.
    pub fn restore_waiting_with_skip(&self, uuid: &str) {
        let mut orders = self.orders.lock().unwrap();
        if let Some(order) = orders.get_mut(uuid) {
            order.status = OrderStatus::Waiting;
            order.parallel_skip = true;
        }
    }

    /// Clears every order's `parallel_skip` flag.
    pub fn clear_all_parallel_skip(&self) {
        for order in self.orders.lock().unwrap().values_mut() {
            order.parallel_skip = false;
        }
    }

    /// A snapshot of every order still tracked (WAITING/PROCESSING only — terminal
    /// orders are removed as soon as they resolve) — for status queries.
    pub fn snapshot(&self) -> Vec<Order> {
        self.orders.lock().unwrap().values().cloned().collect()
    }
}

impl Default for SharedOrders {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds active orders, exposes add/cancel, drives the plan-and-submit loop.
pub struct OrderManager {
    shared: SharedOrders,
    recipe_store: Arc<RecipeStore>,
    scheduler: Arc<TaskScheduler>,
    mode: SystemModeCell,
}

impl OrderManager {
    pub fn new(shared: SharedOrders, recipe_store: Arc<RecipeStore>, scheduler: Arc<TaskScheduler>, mode: SystemModeCell) -> Self {
        OrderManager { shared, recipe_store, scheduler, mode }
    }

    /// Assigns a uuid, status WAITING, enqueues for the plan loop. Returns the uuid.
    pub fn add(&self, order_no: i64, menu_code: i64, menu_name: &str) -> String {
        let order = Order::new(order_no, menu_code, menu_name);
        let uuid = order.uuid.clone();
        info!("OrderManager: order {uuid} (order_no={order_no}, menu_code={menu_code}) added, status WAITING");
        self.shared.insert(order);
        uuid
    }

    /// Cancels `uuid`: transitions to CANCELLED, forwards to the scheduler's task
    /// cancellation, removes from the active map. No-op returning false if the order is
    /// already terminal or unknown.
    pub fn cancel(&self, uuid: &str) -> bool {
        let cancelled = self.shared.cancel(uuid);
        if cancelled {
            self.scheduler.cancel_tasks(uuid);
            info!("OrderManager: order {uuid} cancelled");
        }
        cancelled
    }

    /// MANUAL → AUTO: reset the scheduler's rotate counter, start the robot program.
    /// AUTO → MANUAL: stop the robot program, emergency-stop the scheduler. WAITING
    /// orders remain; PROCESSING tasks finish their current command in place.
    pub fn set_mode(&self, mode: SystemMode) {
        match mode {
            SystemMode::Auto => {
                self.scheduler.reset_rotate_counter();
                if let Err(e) = self.scheduler.start_robot_program() {
                    warn!("OrderManager: failed to start robot program entering AUTO: {e}");
                }
            }
            SystemMode::Manual => {
                if let Err(e) = self.scheduler.stop_robot_program() {
                    warn!("OrderManager: failed to stop robot program entering MANUAL: {e}");
                }
                self.scheduler.emergency_stop();
            }
        }
        self.mode.set(mode);
        info!("OrderManager: system mode set to {mode:?}");
    }

    /// Runs the plan loop forever on the calling thread: dequeue a uuid; if still
    /// WAITING and the system is AUTO, plan and submit it; if MANUAL, wait without
    /// dequeuing. Intended to be spawned as the dedicated plan-loop thread.
    pub fn run_plan_loop(self: Arc<Self>) {
        loop {
            if !self.mode.is_auto() {
                crate::sync::sleep(std::time::Duration::from_millis(100));
                continue;
            }

            let uuid = match self.shared.dequeue_blocking() {
                Some(uuid) => uuid,
                None => continue,
            };

            let order = match self.shared.get(&uuid) {
                Some(order) if order.status == OrderStatus::Waiting => order,
                _ => continue,
            };

            let tasks = crate::planner::plan_order(&order, &self.recipe_store);
            if tasks.is_empty() {
                // BadRequest: the order stays WAITING, removed only by cancel/restart.
                continue;
            }
            self.scheduler.submit(tasks);
        }
    }

    pub fn spawn_plan_loop(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        thread::Builder::new()
            .name("[ PLAN LOOP ]".to_string())
            .spawn(move || self.run_plan_loop())
            .expect("failed to spawn plan loop thread")
    }
}
