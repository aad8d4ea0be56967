use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::{self, Consts, PickupMode};
use crate::error::{CoreError, CoreErrorKind};
use crate::gateways::{DeviceGateway, IoGateway, PickupGateway, RobotGateway};
use crate::mode::{SystemMode, SystemModeCell};
use crate::order::{Order, OrderStatus};
use crate::order_manager::SharedOrders;
use crate::protocol::{self, cmd};
use crate::recipe::RecipeStore;
use crate::sync::{sleep, thread, Arc, Mutex};
use crate::task::{DeviceAction, Task, TaskStatus};

/// Drives every order's task graph against the gateways. One instance per
/// bar: a single physical robot, so `robot_io` serializes the register round trip across
/// however many tasks from however many orders are in flight at once.
pub struct TaskScheduler {
    tasks: Mutex<Vec<Task>>,
    robot: Arc<dyn RobotGateway>,
    device: Arc<dyn DeviceGateway>,
    io: Arc<dyn IoGateway>,
    pickup: Arc<dyn PickupGateway>,
    recipe_store: Arc<RecipeStore>,
    mode: SystemModeCell,
    orders: SharedOrders,
    /// Serializes the register send/ack round trip; held only for that round trip, not
    /// for device pre/post actions, so a long coffee wait leaves the robot free.
    robot_io: Mutex<()>,
    /// Non-None while a chained MOVE/DONE pair is "in flight": the dispatcher refuses to
    /// dispatch anything except the named successor task until it completes. Armed for
    /// every chained pair, including the coffee pair — when `COFFEE_MOVE` takes the
    /// parallel path, the paired `COFFEE_DONE` is never dispatched through the normal
    /// flow, so `run_parallel_interleave` releases the gate itself once it resolves
    /// `COFFEE_DONE` directly.
    chained_task_id: Mutex<Option<i64>>,
    rotate_counter: Mutex<u32>,
    /// Stamped at construction and after every completed rinse; never "unset".
    last_coffee_time: Mutex<Instant>,
    running: std::sync::atomic::AtomicBool,
    /// Set by the dispatcher before handing a task to its executor thread, cleared by
    /// that executor on return. Gates dispatch so at most one task is ever RUNNING.
    robot_busy: std::sync::atomic::AtomicBool,
}

impl TaskScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        robot: Arc<dyn RobotGateway>,
        device: Arc<dyn DeviceGateway>,
        io: Arc<dyn IoGateway>,
        pickup: Arc<dyn PickupGateway>,
        recipe_store: Arc<RecipeStore>,
        mode: SystemModeCell,
        orders: SharedOrders,
    ) -> Self {
        TaskScheduler {
            tasks: Mutex::new(Vec::new()),
            robot,
            device,
            io,
            pickup,
            recipe_store,
            mode,
            orders,
            robot_io: Mutex::new(()),
            chained_task_id: Mutex::new(None),
            rotate_counter: Mutex::new(0),
            last_coffee_time: Mutex::new(Instant::now()),
            running: std::sync::atomic::AtomicBool::new(true),
            robot_busy: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Appends a freshly-planned order's tasks to the shared graph.
    pub fn submit(&self, tasks: Vec<Task>) {
        self.tasks.lock().unwrap().extend(tasks);
    }

    /// Removes only the still-PENDING tasks belonging to `order_uuid`.
    pub fn cancel_tasks(&self, order_uuid: &str) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|t| !(t.order_uuid == order_uuid && t.status == TaskStatus::Pending));
    }

    pub fn reset_rotate_counter(&self) {
        *self.rotate_counter.lock().unwrap() = 0;
    }

    pub fn start_robot_program(&self) -> Result<(), CoreError> {
        self.robot.start_program(0)
    }

    pub fn stop_robot_program(&self) -> Result<(), CoreError> {
        self.robot.stop_program()
    }

    /// Best-effort halt of any device currently dispensing; does not touch in-flight
    /// tasks.
    pub fn emergency_stop(&self) {
        if let Err(e) = self.device.stop_all() {
            warn!("emergency_stop: device.stop_all failed: {e}");
        }
    }

    pub fn shutdown(&self) {
        self.running.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Remaining (non-completed, non-failed) task count for an order — for tests and
    /// status queries.
    pub fn remaining_task_count(&self, order_uuid: &str) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.order_uuid == order_uuid && t.status != TaskStatus::Completed && t.status != TaskStatus::Failed)
            .count()
    }

    pub fn spawn_dispatcher(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        thread::Builder::new()
            .name("[ DISPATCHER ]".to_string())
            .spawn(move || self.run_dispatcher())
            .expect("failed to spawn dispatcher thread")
    }

    /// The dispatcher loop: poll at `Consts::dispatch_poll_ms()`, skip
    /// while not AUTO, otherwise dispatch the next eligible task onto its own named
    /// executor thread.
    fn run_dispatcher(self: Arc<Self>) {
        let poll = Duration::from_millis(Consts::dispatch_poll_ms());
        while self.running.load(std::sync::atomic::Ordering::SeqCst) {
            if !self.mode.is_auto() {
                sleep(poll);
                continue;
            }
            // Invariant 6: never pick a task while the robot is busy (dispatcher
            // is the sole setter of this flag; the executor it hands off to is the sole
            // clearer, once it returns).
            if self.robot_busy.swap(true, std::sync::atomic::Ordering::SeqCst) {
                sleep(poll);
                continue;
            }
            match self.try_dispatch_next() {
                Some(task) => {
                    let scheduler = Arc::clone(&self);
                    let task_id = task.task_id;
                    thread::Builder::new()
                        .name(format!("[ EXECUTOR #{task_id} ]"))
                        .spawn(move || scheduler.execute_task(task))
                        .expect("failed to spawn executor thread");
                }
                None => {
                    self.robot_busy.store(false, std::sync::atomic::Ordering::SeqCst);
                    sleep(poll);
                }
            }
        }
    }

    /// Synchronously drains every currently-ready task on the calling thread, one at a
    /// time, until none remain ready. Used by tests that need a deterministic endpoint
    /// instead of `spawn_dispatcher`'s background polling.
    pub fn dispatch_until_idle(&self) {
        while let Some(task) = self.try_dispatch_next() {
            self.execute_task(task);
        }
    }

    /// Picks the next task to run: while the chain gate is armed, only the gated
    /// successor itself may dispatch (everything else waits); otherwise the
    /// earliest-queued ready task, auto-completing a `skippable` HOME task in place of
    /// dispatching it whenever any other task, ready or not, is still PENDING. Marking a
    /// freshly-picked task RUNNING also bumps its order to PROCESSING.
    fn try_dispatch_next(&self) -> Option<Task> {
        let gate = *self.chained_task_id.lock().unwrap();
        loop {
            let mut tasks = self.tasks.lock().unwrap();
            let completed: std::collections::HashSet<i64> = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .map(|t| t.task_id)
                .collect();
            let ready: Vec<usize> = tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.status == TaskStatus::Pending && t.is_ready(&|dep| completed.contains(&dep)))
                .map(|(i, _)| i)
                .collect();
            if ready.is_empty() {
                return None;
            }
            if let Some(gated_id) = gate {
                let idx = ready.iter().find(|&&i| tasks[i].task_id == gated_id).copied()?;
                tasks[idx].status = TaskStatus::Running;
                let task = tasks[idx].clone();
                let order_uuid = task.order_uuid.clone();
                drop(tasks);
                self.orders.update_status(&order_uuid, OrderStatus::Processing);
                return Some(task);
            }
            if let Some(&skip_idx) = ready.iter().find(|&&i| tasks[i].skippable) {
                let other_pending = tasks.iter().enumerate().any(|(j, t)| j != skip_idx && t.status == TaskStatus::Pending);
                if other_pending {
                    tasks[skip_idx].status = TaskStatus::Completed;
                    let uuid = tasks[skip_idx].order_uuid.clone();
                    drop(tasks);
                    self.maybe_complete_order(&uuid);
                    continue;
                }
            }
            let idx = ready[0];
            let task = tasks[idx].clone();
            tasks[idx].status = TaskStatus::Running;
            if let Some(next_id) = task.chained_next_task_id {
                *self.chained_task_id.lock().unwrap() = Some(next_id);
            }
            let order_uuid = task.order_uuid.clone();
            drop(tasks);
            self.orders.update_status(&order_uuid, OrderStatus::Processing);
            return Some(task);
        }
    }

    /// Entry point handed to the executor thread: runs the task, then clears
    /// `robot_busy` regardless of how it returned.
    fn execute_task(&self, task: Task) {
        self.execute_task_inner(task);
        self.robot_busy.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Runs a single task end to end: parallel check, pre-action, the serialized
    /// register round trip, post-action or parallel sub-protocol, bookkeeping.
    fn execute_task_inner(&self, task: Task) {
        let mode = self.mode.clone();
        let mode_is_auto = move || mode.is_auto();

        // Step 1: the coffee-move check point may swap the outgoing command to
        // COFFEE_PLACE if another order's work can be interleaved into the wait.
        let take_parallel_path = task.parallel_check_point && self.has_parallel_candidate();
        let actual_cmd = if take_parallel_path { cmd::COFFEE_PLACE } else { task.cmd_code };
        // Whenever this task aborts before its chained successor ever runs, the gate
        // must be released with the successor's id (what it was actually armed to), not
        // this task's own id — otherwise a predecessor's abort leaves the dispatcher
        // wedged forever waiting for a successor that will never be dispatched.
        let abort_release_key = task.chained_next_task_id.unwrap_or(task.task_id);

        if let Some(action) = task.pre_device_action.clone() {
            if let Err(e) = self.perform_device_action(&action, &task) {
                self.fail_safe(&task.order_uuid, &e, OrderStatus::Failed);
                self.release_chain_gate(abort_release_key);
                return;
            }
        }

        let robot_result = {
            let _guard = self.robot_io.lock().unwrap();
            self.run_register_protocol(&task, actual_cmd, &mode_is_auto)
        };

        let assigned_slot = match robot_result {
            Ok(slot) => slot,
            Err(e) if e.kind == CoreErrorKind::ModeLeftAuto => {
                info!("task {} left pending: {}", task.task_id, e);
                self.requeue_pending(task.task_id);
                self.release_chain_gate(abort_release_key);
                return;
            }
            Err(e) if e.kind == CoreErrorKind::CupSensorFailure => {
                // No drink, but the robot is safe — complete the order instead of
                // failing it, then trip fail-safe regardless.
                warn!("{e}");
                self.mark_completed(task.task_id, None);
                self.release_chain_gate(abort_release_key);
                self.fail_safe(&task.order_uuid, &e, OrderStatus::Completed);
                return;
            }
            Err(e) => {
                self.fail_safe(&task.order_uuid, &e, OrderStatus::Failed);
                self.release_chain_gate(abort_release_key);
                return;
            }
        };

        if take_parallel_path {
            // Step 9: the parallel sub-protocol replaces the generic post-action
            // entirely, and itself resolves the paired COFFEE_DONE task — and with it,
            // the chain gate COFFEE_MOVE armed on dispatch.
            self.mark_completed(task.task_id, assigned_slot);
            self.run_parallel_interleave(&task);
            self.maybe_complete_order(&task.order_uuid);
            return;
        }

        if let Some(action) = task.post_device_action.clone() {
            if let Err(e) = self.perform_device_action(&action, &task) {
                self.fail_safe(&task.order_uuid, &e, OrderStatus::Failed);
                self.release_chain_gate(abort_release_key);
                return;
            }
        }

        // Only releases when this task is itself the gated successor (its own id
        // matches what the predecessor armed); a predecessor's own successful
        // completion must leave the gate in place until its successor runs.
        self.mark_completed(task.task_id, assigned_slot);
        self.release_chain_gate(task.task_id);
        self.maybe_complete_order(&task.order_uuid);
    }

    /// The register-level half of a task: cup and pickup commands get extra choreography,
    /// everything else is a plain send/ack. `actual_cmd` is normally
    /// `task.cmd_code`, except for a coffee-move task taking the parallel path, where the
    /// caller has already resolved it to `COFFEE_PLACE`. Returns the pickup
    /// slot assigned, if any.
    fn run_register_protocol(&self, task: &Task, actual_cmd: i64, mode_is_auto: &dyn Fn() -> bool) -> Result<Option<u32>, CoreError> {
        if task.cmd_code == cmd::CUP_MOVE {
            self.execute_cup_stage(task, mode_is_auto)?;
            Ok(None)
        } else if task.cmd_code == cmd::PICKUP_PLACE {
            let slot = self.assign_pickup_slot(mode_is_auto)?;
            self.reset_init_if_set()?;
            self.robot.write_register(protocol::REG_PICKUP_IDX, slot as i64)?;
            sleep(Duration::from_millis(config::REGISTER_WRITE_DELAY_MS));
            self.robot.send_command(actual_cmd)?;
            self.robot
                .wait_for_ack(actual_cmd, Duration::from_secs(config::ROBOT_MOTION_TIMEOUT_SECS), mode_is_auto)?;
            if let Some(notify) = &task.notify_pickup {
                self.pickup.notify_slot(notify.zone, slot, notify.order_no, notify.menu_code)?;
            }
            Ok(Some(slot))
        } else {
            self.reset_init_if_set()?;
            for (addr, value) in &task.params {
                self.robot.write_register(*addr, *value)?;
                sleep(Duration::from_millis(config::REGISTER_WRITE_DELAY_MS));
            }
            self.robot.send_command(actual_cmd)?;
            self.robot
                .wait_for_ack(actual_cmd, Duration::from_secs(config::ROBOT_MOTION_TIMEOUT_SECS), mode_is_auto)?;
            Ok(None)
        }
    }

    /// Step 4 of execute-one-task: clears a stale ack left over from a previous
    /// command before sending a new one, so a coincidental match doesn't satisfy
    /// `wait_for_ack` before the robot has actually moved.
    fn reset_init_if_set(&self) -> Result<(), CoreError> {
        if self.robot.read_register(protocol::REG_INIT)? != 0 {
            self.robot.write_register(protocol::REG_INIT, 0)?;
        }
        Ok(())
    }

    /// The cup-dispense handshake: wait for the robot to signal it is in position
    /// to dispense (`REG_CUP_ON`), pulse the matching coil, rewrite the cup kind to its
    /// sensor-approach code (3 hot / 4 iced), wait for the robot to reach the cup sensor
    /// (`REG_CUP_MOVE`), read the cup-presence sensor, and publish the result on
    /// `REG_CUP_SENSOR`. A sensor miss is not silently tolerated: the caller marks the
    /// order COMPLETED anyway (the robot is safe, just emptyhanded) and trips fail-safe —
    /// this function just surfaces `CupSensorFailure` for it to do so.
    fn execute_cup_stage(&self, task: &Task, mode_is_auto: &dyn Fn() -> bool) -> Result<(), CoreError> {
        let cup_num = *task.params.get(&protocol::REG_CUP_IDX).unwrap_or(&1);
        self.robot.write_register(protocol::REG_CUP_IDX, cup_num)?;
        sleep(Duration::from_millis(config::REGISTER_WRITE_DELAY_MS));
        self.robot.send_command(cmd::CUP_MOVE)?;

        // Step 1: robot in position to dispense.
        self.wait_for_register(protocol::REG_CUP_ON, 1, mode_is_auto)?;
        self.robot.write_register(protocol::REG_CUP_ON, 0)?;

        // Step 2: pulse the dispense line for the requested cup kind.
        let (unit, addr) = if cup_num == 1 {
            protocol::coil::CUP_DISPENSE_HOT
        } else {
            protocol::coil::CUP_DISPENSE_ICED
        };
        self.io.pulse(unit, addr, 1.0)?;

        // Step 3: re-encode the cup kind for the robot's sensor-approach path.
        let dispense_code = if cup_num == 1 { 3 } else { 4 };
        self.robot.write_register(protocol::REG_CUP_IDX, dispense_code)?;

        // Step 4: robot at the cup sensor.
        self.wait_for_register(protocol::REG_CUP_MOVE, 1, mode_is_auto)?;
        self.robot.write_register(protocol::REG_CUP_MOVE, 0)?;

        // Step 5: read cup presence, publish the result.
        let (presence_unit, presence_addr) = protocol::coil::CUP_PRESENCE;
        let present = self
            .io
            .read_coils(presence_unit, presence_addr, 1)?
            .first()
            .copied()
            .unwrap_or(false);
        self.robot
            .write_register(protocol::REG_CUP_SENSOR, if present { 1 } else { 2 })?;

        if !present {
            // Step 6: the robot still needs to finish its home-return before the order
            // can be safely resolved.
            self.robot
                .wait_for_ack(cmd::CUP_MOVE, Duration::from_secs(config::CUP_HANDSHAKE_TIMEOUT_SECS), mode_is_auto)?;
            return Err(CoreError::new_of_type(
                &format!("cup sensor did not confirm a dispensed cup for order {}", task.order_uuid),
                CoreErrorKind::CupSensorFailure,
            ));
        }

        // Step 7: ordinary ack wait.
        self.robot
            .wait_for_ack(cmd::CUP_MOVE, Duration::from_secs(config::CUP_HANDSHAKE_TIMEOUT_SECS), mode_is_auto)
    }

    fn wait_for_register(&self, addr: i64, target: i64, mode_is_auto: &dyn Fn() -> bool) -> Result<(), CoreError> {
        let timeout = Duration::from_secs(config::CUP_HANDSHAKE_TIMEOUT_SECS);
        let poll = Duration::from_millis(20);
        let mut waited = Duration::ZERO;
        loop {
            if !mode_is_auto() {
                return Err(CoreError::new_of_type(
                    "wait aborted: system left AUTO",
                    CoreErrorKind::ModeLeftAuto,
                ));
            }
            if self.robot.read_register(addr)? == target {
                return Ok(());
            }
            if waited >= timeout {
                return Err(CoreError::new_of_type(
                    &format!("timed out waiting for register {addr} == {target}"),
                    CoreErrorKind::RobotTimeout,
                ));
            }
            sleep(poll);
            waited += poll;
        }
    }

    /// Assigns the next pickup slot: a round-robin counter, or the first free slot
    /// reported by the pickup sensor, polling until one frees up.
    fn assign_pickup_slot(&self, mode_is_auto: &dyn Fn() -> bool) -> Result<u32, CoreError> {
        match Consts::pickup_mode() {
            PickupMode::Rotate => {
                let slot_count = Consts::pickup_slot_count().max(1);
                let mut counter = self.rotate_counter.lock().unwrap();
                *counter = (*counter % slot_count) + 1;
                Ok(*counter)
            }
            PickupMode::Sensor => loop {
                if !mode_is_auto() {
                    return Err(CoreError::new_of_type(
                        "pickup slot wait aborted: system left AUTO",
                        CoreErrorKind::ModeLeftAuto,
                    ));
                }
                let occupancy = self.pickup.get_occupancy(1)?;
                if let Some(pos) = occupancy.iter().position(|occupied| !occupied) {
                    return Ok(pos as u32 + 1);
                }
                sleep(Duration::from_secs(config::PICKUP_SENSOR_POLL_SECS));
            },
        }
    }

    /// Executes a pre/post device side-effect. A plain `Sleep` on the coffee-wait task is
    /// stretched by boiler-idle compensation when it applies.
    fn perform_device_action(&self, action: &DeviceAction, task: &Task) -> Result<(), CoreError> {
        match action {
            DeviceAction::Coffee { product_id, precharge_secs } => self.device.make_coffee(*product_id, *precharge_secs),
            DeviceAction::IceWater { ice_secs, water_secs } => self.device.dispense_ice_water(*ice_secs, *water_secs),
            DeviceAction::IceWaterSparkling { ice_secs, water_secs, sparkling_secs } => {
                self.device.dispense_ice_water(*ice_secs, *water_secs)?;
                if *sparkling_secs > 0.0 {
                    self.device.dispense_sparkling(*sparkling_secs)?;
                }
                Ok(())
            }
            DeviceAction::HotWater { secs } => self.device.dispense_hot_water(*secs),
            DeviceAction::Syrup { id, secs } => self.device.dispense_syrup(*id, *secs),
            DeviceAction::Sparkling { secs } => self.device.dispense_sparkling(*secs),
            DeviceAction::Sleep { secs } => {
                let secs = if task.is_coffee_wait { self.boiler_compensated_secs(*secs) } else { *secs };
                sleep(Duration::from_secs_f32(secs));
                Ok(())
            }
            DeviceAction::Rinse => {
                self.device.execute_rinse()?;
                *self.last_coffee_time.lock().unwrap() = Instant::now();
                Ok(())
            }
        }
    }

    /// Adds the Thermoplan boiler-cooldown penalty when the machine has sat idle past
    /// `IDLE_TIME_THRESHOLD_SECS`. A no-op for any other vendor tag.
    fn boiler_compensated_secs(&self, secs: f32) -> f32 {
        if Consts::coffee_vendor() != config::CoffeeVendor::Thermoplan {
            return secs;
        }
        let idle = self.last_coffee_time.lock().unwrap().elapsed();
        if idle.as_secs() >= config::IDLE_TIME_THRESHOLD_SECS {
            secs + config::BOILER_COMPENSATION_EXTRA_SECS
        } else {
            secs
        }
    }

    /// Whether `_check_parallel_opportunity_` would currently find a candidate,
    /// without claiming one — used only to decide whether to swap `COFFEE_MOVE` for
    /// `COFFEE_PLACE` before the command is even sent.
    fn has_parallel_candidate(&self) -> bool {
        let store = Arc::clone(&self.recipe_store);
        self.orders
            .has_parallel_candidate(move |order: &Order| store.get(order.menu_code).map(|r| r.coffee_ext_time > 0.0).unwrap_or(true))
    }

    /// The parallel-interleave sub-protocol. Runs entirely on the thread that is
    /// executing the coffee-move task: the robot has just placed a cup in the machine and
    /// is free until extraction finishes, so this thread directly drives however many
    /// non-coffee orders fit in that window before reclaiming the robot for `COFFEE_PICK`.
    /// This *is* the "sole planner-executor" for whatever it interleaves: it
    /// never hands those tasks to the background dispatcher.
    fn run_parallel_interleave(&self, coffee_move: &Task) {
        let coffee_done_id = coffee_move.chained_next_task_id;
        let coffee_done_pre = coffee_done_id.and_then(|id| {
            self.tasks
                .lock()
                .unwrap()
                .iter()
                .find(|t| t.task_id == id)
                .and_then(|t| t.pre_device_action.clone())
        });
        let base_secs = match coffee_done_pre {
            Some(DeviceAction::Sleep { secs }) => secs,
            _ => 0.0,
        };
        let coffee_duration = self.boiler_compensated_secs(base_secs);

        // Step 1: start extraction now, unless the pre-action variant (grind-ahead,
        // product_id == 1) already started it before the robot moved.
        if coffee_move.pre_device_action.is_none() {
            if let Some(action) = coffee_move.post_device_action.clone() {
                if let Err(e) = self.perform_device_action(&action, coffee_move) {
                    warn!("parallel interleave: failed to start coffee extraction for order {}: {e}", coffee_move.order_uuid);
                }
            }
        }
        let coffee_start = Instant::now();

        // Step 2: interleave non-coffee orders while enough coffee-wait remains.
        loop {
            let candidate = match self.claim_parallel_candidate() {
                Some(candidate) => candidate,
                None => break,
            };
            // The plan loop may have already planned and submitted this order's tasks
            // before the claim flipped its status off WAITING; drop
            // whatever it queued so this loop is the sole planner-executor for it.
            self.cancel_tasks(&candidate.uuid);

            let seeded = crate::planner::plan_order(&candidate, &self.recipe_store);
            if seeded.is_empty() {
                self.orders.restore_waiting_with_skip(&candidate.uuid);
                break;
            }

            info!(
                "parallel interleave: running order {} ({}) alongside order {}'s coffee wait",
                candidate.uuid, candidate.menu_name, coffee_move.order_uuid
            );
            match self.run_parallel_order_tasks(&seeded) {
                Ok(()) => {
                    self.orders.update_status(&candidate.uuid, OrderStatus::Completed);
                    info!("order {} completed (parallel interleave)", candidate.uuid);
                }
                Err(e) => {
                    warn!("parallel interleave: order {} failed: {e}", candidate.uuid);
                    self.orders.restore_waiting_with_skip(&candidate.uuid);
                    break;
                }
            }

            let remaining = coffee_duration - coffee_start.elapsed().as_secs_f32();
            if remaining < config::PARALLEL_THRESHOLD_SECS {
                break;
            }
        }

        // Step 3: sleep whatever coffee-wait remains.
        let remaining = (coffee_duration - coffee_start.elapsed().as_secs_f32()).max(0.0);
        sleep(Duration::from_secs_f32(remaining));

        // Step 4: reclaim the robot and pick up the cup.
        let mode = self.mode.clone();
        let mode_is_auto = move || mode.is_auto();
        let pick_result: Result<(), CoreError> = (|| {
            let _guard = self.robot_io.lock().unwrap();
            self.reset_init_if_set()?;
            self.robot.send_command(cmd::COFFEE_PICK)?;
            self.robot
                .wait_for_ack(cmd::COFFEE_PICK, Duration::from_secs(config::ROBOT_MOTION_TIMEOUT_SECS), &mode_is_auto)
        })();

        // Step 5: resolve the chained COFFEE_DONE without executing it, then release the
        // chain gate COFFEE_MOVE armed — the normal per-task release never runs for a
        // task that's resolved directly like this.
        if let Some(done_id) = coffee_done_id {
            {
                let mut tasks = self.tasks.lock().unwrap();
                if let Some(done) = tasks.iter_mut().find(|t| t.task_id == done_id) {
                    done.status = TaskStatus::Completed;
                }
            }
            self.release_chain_gate(done_id);
        }

        match pick_result {
            Ok(()) => {
                if let Err(e) = self.device.execute_rinse() {
                    warn!("parallel interleave: rinse failed: {e}");
                }
                *self.last_coffee_time.lock().unwrap() = Instant::now();
            }
            Err(e) => self.fail_safe(&coffee_move.order_uuid, &e, OrderStatus::Failed),
        }

        // Step 6: clear parallel session state.
        self.orders.clear_all_parallel_skip();
    }

    /// `_check_parallel_opportunity_`: claims the earliest-created WAITING
    /// non-coffee, non-skipped order, if any.
    fn claim_parallel_candidate(&self) -> Option<Order> {
        let store = Arc::clone(&self.recipe_store);
        self.orders
            .claim_parallel_candidate(move |order: &Order| store.get(order.menu_code).map(|r| r.coffee_ext_time > 0.0).unwrap_or(true))
    }

    /// Executes a pre-planned task list directly, bypassing the shared task graph and
    /// dispatcher entirely: a `skippable` `HOME` is always skipped, since
    /// the robot must return to the coffee machine rather than home.
    fn run_parallel_order_tasks(&self, tasks: &[Task]) -> Result<(), CoreError> {
        let mode = self.mode.clone();
        let mode_is_auto = move || mode.is_auto();
        for t in tasks {
            if t.skippable {
                continue;
            }
            if let Some(action) = &t.pre_device_action {
                self.perform_device_action(action, t)?;
            }
            {
                let _guard = self.robot_io.lock().unwrap();
                self.run_register_protocol(t, t.cmd_code, &mode_is_auto)?;
            }
            if let Some(action) = &t.post_device_action {
                self.perform_device_action(action, t)?;
            }
        }
        Ok(())
    }

    fn requeue_pending(&self, task_id: i64) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(t) = tasks.iter_mut().find(|t| t.task_id == task_id) {
            t.status = TaskStatus::Pending;
        }
    }

    fn mark_completed(&self, task_id: i64, assigned_slot: Option<u32>) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(t) = tasks.iter_mut().find(|t| t.task_id == task_id) {
            t.status = TaskStatus::Completed;
            t.assigned_slot = assigned_slot;
        }
    }

    fn release_chain_gate(&self, task_id: i64) {
        let mut gate = self.chained_task_id.lock().unwrap();
        if *gate == Some(task_id) {
            *gate = None;
        }
    }

    /// The uniform recovery action (glossary "Fail-safe"): switches to MANUAL, stops the
    /// robot program, stops all devices, clears the entire task list and chain gate, and
    /// resolves `order_uuid` to `final_status`. Idempotent: calling it again with nothing left
    /// to clear and the mode already MANUAL leaves the system in the same state.
    fn fail_safe(&self, order_uuid: &str, err: &CoreError, final_status: OrderStatus) {
        warn!("fail-safe triggered for order {order_uuid}: {err}");
        self.mode.set(SystemMode::Manual);
        if let Err(e) = self.robot.stop_program() {
            warn!("fail_safe: robot.stop_program failed: {e}");
        }
        if let Err(e) = self.device.stop_all() {
            warn!("fail_safe: device.stop_all failed: {e}");
        }
        self.tasks.lock().unwrap().clear();
        *self.chained_task_id.lock().unwrap() = None;
        self.orders.update_status(order_uuid, final_status);
    }

    /// Once every task for an order has completed, marks the order COMPLETED and drops
    /// its tasks from the shared graph. A no-op while any task is still pending,
    /// running, or failed (fail-safe already recorded the terminal state in that case).
    fn maybe_complete_order(&self, order_uuid: &str) {
        let mut tasks = self.tasks.lock().unwrap();
        let mine: Vec<&Task> = tasks.iter().filter(|t| t.order_uuid == order_uuid).collect();
        if mine.is_empty() || mine.iter().any(|t| t.status == TaskStatus::Failed) {
            return;
        }
        if mine.iter().all(|t| t.status == TaskStatus::Completed) {
            drop(mine);
            tasks.retain(|t| t.order_uuid != order_uuid);
            drop(tasks);
            self.orders.update_status(order_uuid, OrderStatus::Completed);
            info!("order {order_uuid} completed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateways::simulated::{SimulatedDeviceGateway, SimulatedIoGateway, SimulatedPickupGateway, SimulatedRobotGateway};
    use crate::mode::SystemMode;
    use crate::recipe::RecipeStore;

    fn build_scheduler(robot: Arc<dyn RobotGateway>, store: RecipeStore) -> (Arc<TaskScheduler>, SharedOrders) {
        let orders = SharedOrders::new();
        let mode = SystemModeCell::new();
        mode.set(SystemMode::Auto);
        let scheduler = Arc::new(TaskScheduler::new(
            robot,
            Arc::new(SimulatedDeviceGateway::new()),
            Arc::new(SimulatedIoGateway::new()),
            Arc::new(SimulatedPickupGateway::new(4)),
            Arc::new(store),
            mode,
            orders.clone(),
        ));
        (scheduler, orders)
    }

    fn water_recipe_store() -> RecipeStore {
        RecipeStore::load_from_str(r#"[{"menu_code": 1, "menu_name": "still water", "cup_num": 1}]"#).unwrap()
    }

    #[test]
    fn simple_order_runs_to_completion() {
        let (scheduler, orders) = build_scheduler(Arc::new(SimulatedRobotGateway::new()), water_recipe_store());
        let order = Order::new(1, 1, "still water");
        let uuid = order.uuid.clone();
        orders.insert(order.clone());

        let tasks = crate::planner::plan_order(&order, scheduler_recipe_store(&scheduler));
        scheduler.submit(tasks);
        scheduler.dispatch_until_idle();

        assert!(orders.get(&uuid).is_none());
        assert_eq!(scheduler.remaining_task_count(&uuid), 0);
    }

    #[test]
    fn cancel_tasks_removes_only_pending() {
        let (scheduler, _orders) = build_scheduler(Arc::new(SimulatedRobotGateway::new()), water_recipe_store());
        let order = Order::new(1, 1, "still water");
        let uuid = order.uuid.clone();
        let mut tasks = crate::planner::plan_order(&order, scheduler_recipe_store(&scheduler));
        tasks[0].status = TaskStatus::Completed;
        scheduler.submit(tasks);

        scheduler.cancel_tasks(&uuid);

        let remaining = scheduler.remaining_task_count(&uuid);
        assert_eq!(remaining, 0);
    }

    fn ice_water_recipe_store() -> RecipeStore {
        RecipeStore::load_from_str(r#"[{"menu_code": 2, "menu_name": "ade", "cup_num": 1, "ice_ext_time": 1.0, "water_ext_time": 1.0}]"#).unwrap()
    }

    #[test]
    fn first_task_dispatch_moves_order_to_processing() {
        let (scheduler, orders) = build_scheduler(Arc::new(SimulatedRobotGateway::new()), water_recipe_store());
        let order = Order::new(1, 1, "still water");
        let uuid = order.uuid.clone();
        orders.insert(order.clone());
        scheduler.submit(crate::planner::plan_order(&order, scheduler_recipe_store(&scheduler)));

        assert_eq!(orders.get(&uuid).unwrap().status, OrderStatus::Waiting);
        let cup_task = scheduler.try_dispatch_next().expect("cup task should be ready");
        assert_eq!(orders.get(&uuid).unwrap().status, OrderStatus::Processing);

        scheduler.execute_task(cup_task);
        scheduler.dispatch_until_idle();
        assert!(orders.get(&uuid).is_none());
    }

    #[test]
    fn chain_gate_blocks_other_orders_until_successor_dispatched() {
        let (scheduler, orders) = build_scheduler(Arc::new(SimulatedRobotGateway::new()), ice_water_recipe_store());
        let order_a = Order::new(1, 2, "ade");
        let order_b = Order::new(2, 2, "ade");
        let uuid_a = order_a.uuid.clone();
        let uuid_b = order_b.uuid.clone();
        orders.insert(order_a.clone());
        orders.insert(order_b.clone());
        scheduler.submit(crate::planner::plan_order(&order_a, scheduler_recipe_store(&scheduler)));
        scheduler.submit(crate::planner::plan_order(&order_b, scheduler_recipe_store(&scheduler)));

        let cup_a = scheduler.try_dispatch_next().expect("order a's cup task");
        scheduler.execute_task(cup_a);

        let wi_move_a = scheduler.try_dispatch_next().expect("order a's wi_move arms the chain");
        assert_eq!(wi_move_a.cmd_code, cmd::WI_MOVE);

        // Order b's cup task is ready right now too, but the chain gate must hold it
        // back until wi_done_a, specifically, has run.
        assert!(scheduler.try_dispatch_next().is_none(), "chain gate must block every other task");

        scheduler.execute_task(wi_move_a);

        let wi_done_a = scheduler.try_dispatch_next().expect("chain gate must admit only wi_done");
        assert_eq!(wi_done_a.cmd_code, cmd::WI_DONE);
        scheduler.execute_task(wi_done_a);

        scheduler.dispatch_until_idle();
        assert!(orders.get(&uuid_a).is_none());
        assert!(orders.get(&uuid_b).is_none());
    }

    fn mixed_recipe_store() -> RecipeStore {
        RecipeStore::load_from_str(
            r#"[
                {"menu_code": 1, "menu_name": "still water", "cup_num": 1},
                {"menu_code": 2, "menu_name": "ade", "cup_num": 1, "ice_ext_time": 1.0, "water_ext_time": 1.0}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn skippable_home_skips_when_another_order_has_pending_not_yet_ready_work() {
        let (scheduler, orders) = build_scheduler(Arc::new(FailingRobotGateway), mixed_recipe_store());
        let order_a = Order::new(1, 1, "still water");
        let order_b = Order::new(2, 2, "ade");
        let uuid_a = order_a.uuid.clone();
        let uuid_b = order_b.uuid.clone();
        orders.insert(order_a.clone());
        orders.insert(order_b.clone());

        let mut tasks_a = crate::planner::plan_order(&order_a, scheduler_recipe_store(&scheduler));
        // Pretend cup/pickup already ran: only the skippable HOME is left pending.
        for t in tasks_a.iter_mut().take(3) {
            t.status = TaskStatus::Completed;
        }
        scheduler.submit(tasks_a);
        // Order b's WI_MOVE/WI_DONE are PENDING but not yet ready (blocked on its own
        // CUP_MOVE) — the skip rule must honor this, not just the ready set.
        scheduler.submit(crate::planner::plan_order(&order_b, scheduler_recipe_store(&scheduler)));

        let task = scheduler.try_dispatch_next().expect("order b's cup task should dispatch");
        assert_eq!(task.order_uuid, uuid_b);
        assert!(orders.get(&uuid_a).is_none(), "home should have been skipped and order a completed");
        assert!(scheduler.mode.is_auto(), "a failing HOME dispatch would have tripped fail-safe into MANUAL");
    }

    struct FailingRobotGateway;

    impl RobotGateway for FailingRobotGateway {
        fn read_register(&self, _addr: i64) -> Result<i64, CoreError> {
            Ok(0)
        }
        fn write_register(&self, _addr: i64, _value: i64) -> Result<(), CoreError> {
            Ok(())
        }
        fn stop_program(&self) -> Result<(), CoreError> {
            Ok(())
        }
        fn start_program(&self, _idx: i64) -> Result<(), CoreError> {
            Ok(())
        }
        fn send_command(&self, _cmd_code: i64) -> Result<(), CoreError> {
            Err(CoreError::new("forced transport failure"))
        }
    }

    #[test]
    fn transport_failure_triggers_fail_safe() {
        let (scheduler, orders) = build_scheduler(Arc::new(FailingRobotGateway), water_recipe_store());
        let order = Order::new(1, 1, "still water");
        let uuid = order.uuid.clone();
        orders.insert(order.clone());

        let tasks = crate::planner::plan_order(&order, scheduler_recipe_store(&scheduler));
        scheduler.submit(tasks);
        scheduler.dispatch_until_idle();

        assert!(orders.get(&uuid).is_none(), "a failed order is dropped from the active map");
    }

    /// Test-only accessor: exposes the scheduler's recipe store for planning a task list
    /// the same way `OrderManager::run_plan_loop` would.
    fn scheduler_recipe_store(scheduler: &Arc<TaskScheduler>) -> &RecipeStore {
        &scheduler.recipe_store
    }
}
