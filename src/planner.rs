use log::warn;

use crate::order::Order;
use crate::protocol::{cmd, REG_CUP_IDX, REG_SYRUP_IDX};
use crate::recipe::{Recipe, RecipeStore};
use crate::task::{DeviceAction, NotifyPickup, Task};

/// Pickup zone this bar serves.
const PICKUP_ZONE: u32 = 1;

/// Coffee precharge time attached to `COFFEE_MOVE`'s device action; the real wait is on
/// the paired `COFFEE_DONE`.
const COFFEE_PRECHARGE_SECS: f32 = 0.5;

/// Looks up `order.menu_code` in `store` and plans it, or returns an empty task list and
/// logs a warning on an unknown menu code or an invalid recipe.
pub fn plan_order(order: &Order, store: &RecipeStore) -> Vec<Task> {
    match store.get(order.menu_code) {
        Some(recipe) if recipe.is_valid() => plan(order, recipe),
        Some(_) => {
            warn!(
                "planner: recipe for menu_code={} failed validation, order {} stays WAITING",
                order.menu_code, order.uuid
            );
            Vec::new()
        }
        None => {
            warn!(
                "planner: unknown menu_code={}, order {} stays WAITING",
                order.menu_code, order.uuid
            );
            Vec::new()
        }
    }
}

/// Converts `(order, recipe)` into an ordered list of tasks with dependencies, device
/// side-effects, and a marked parallel-check-point. Deterministic given the same
/// recipe and order fields (task ids may differ run to run).
pub fn plan(order: &Order, recipe: &Recipe) -> Vec<Task> {
    let mut tasks = Vec::new();
    let uuid = &order.uuid;
    let menu_name = &order.menu_name;
    let order_no = order.order_no;

    // Stage 1: cup. Always present; not chained — the cup sub-protocol is
    // self-contained.
    let cup_task = Task::new(cmd::CUP_MOVE, uuid, menu_name, order_no)
        .with_param(REG_CUP_IDX, recipe.cup_num as i64);
    let mut prev_id = cup_task.task_id;
    tasks.push(cup_task);

    // Stage 2: ice / water / sparkling.
    if recipe.ice_ext_time > 0.0 || recipe.water_ext_time > 0.0 || recipe.sparkling_ext_time > 0.0 {
        prev_id = push_chained_pair(
            &mut tasks,
            uuid,
            menu_name,
            order_no,
            prev_id,
            cmd::WI_MOVE,
            cmd::WI_DONE,
            Some(DeviceAction::IceWaterSparkling {
                ice_secs: recipe.ice_ext_time,
                water_secs: recipe.water_ext_time,
                sparkling_secs: recipe.sparkling_ext_time,
            }),
            Some(DeviceAction::Sleep {
                secs: recipe
                    .ice_ext_time
                    .max(recipe.water_ext_time)
                    .max(recipe.sparkling_ext_time),
            }),
        );
    }

    // Stage 3: hot water. The MOVE only pulses the tap open; the paired DONE carries
    // the effective wait.
    if recipe.hotwater_ext_time > 0.0 {
        prev_id = push_chained_pair(
            &mut tasks,
            uuid,
            menu_name,
            order_no,
            prev_id,
            cmd::HOT_MOVE,
            cmd::HOT_DONE,
            Some(DeviceAction::HotWater { secs: recipe.hotwater_ext_time }),
            Some(DeviceAction::Sleep { secs: recipe.hotwater_ext_time }),
        );
    }

    // Stage 4: coffee. COFFEE_MOVE is the parallel check point; COFFEE_DONE is the
    // coffee-wait whose sleep the scheduler may extend with boiler-idle compensation.
    if recipe.coffee_ext_time > 0.0 {
        let coffee_action = DeviceAction::Coffee {
            product_id: recipe.coffee_product_id,
            precharge_secs: COFFEE_PRECHARGE_SECS,
        };

        let mut coffee_move = Task::new(cmd::COFFEE_MOVE, uuid, menu_name, order_no)
            .depends_on(prev_id)
            .parallel_check_point();
        coffee_move = if recipe.coffee_product_id == 1 {
            coffee_move.with_pre(coffee_action)
        } else {
            coffee_move.with_post(coffee_action)
        };
        let coffee_move_id = coffee_move.task_id;

        let coffee_done = Task::new(cmd::COFFEE_DONE, uuid, menu_name, order_no)
            .depends_on(coffee_move_id)
            .coffee_wait()
            .with_pre(DeviceAction::Sleep { secs: recipe.coffee_ext_time })
            .with_post(DeviceAction::Rinse);
        let coffee_done_id = coffee_done.task_id;

        tasks.push(coffee_move.chained_to(coffee_done_id));
        tasks.push(coffee_done);
        prev_id = coffee_done_id;
    }

    // Stage 5: syrups, strictly serial, each an atomic pair.
    for syrup in &recipe.syrups {
        prev_id = push_chained_pair(
            &mut tasks,
            uuid,
            menu_name,
            order_no,
            prev_id,
            cmd::SYRUP_MOVE,
            cmd::SYRUP_DONE,
            Some(DeviceAction::Syrup { id: syrup.id, secs: syrup.time_seconds }),
            None,
        );
        if let Some(move_task) = tasks.iter_mut().rev().nth(1) {
            move_task.params.insert(REG_SYRUP_IDX, syrup.id as i64);
        }
    }

    // Stage 6: serve. PICKUP_MOVE chains to PICKUP_PLACE; HOME is skippable.
    let pickup_move = Task::new(cmd::PICKUP_MOVE, uuid, menu_name, order_no).depends_on(prev_id);
    let pickup_move_id = pickup_move.task_id;

    let pickup_place = Task::new(cmd::PICKUP_PLACE, uuid, menu_name, order_no)
        .depends_on(pickup_move_id)
        .with_notify_pickup(NotifyPickup {
            zone: PICKUP_ZONE,
            order_no,
            menu_code: order.menu_code,
        });
    let pickup_place_id = pickup_place.task_id;

    tasks.push(pickup_move.chained_to(pickup_place_id));
    tasks.push(pickup_place);

    let home = Task::new(cmd::HOME, uuid, menu_name, order_no)
        .depends_on(pickup_place_id)
        .skippable();
    tasks.push(home);

    tasks
}

#[allow(clippy::too_many_arguments)]
fn push_chained_pair(
    tasks: &mut Vec<Task>,
    uuid: &str,
    menu_name: &str,
    order_no: i64,
    prev_id: i64,
    move_cmd: i64,
    done_cmd: i64,
    move_post: Option<DeviceAction>,
    done_pre: Option<DeviceAction>,
) -> i64 {
    let mut move_task = Task::new(move_cmd, uuid, menu_name, order_no).depends_on(prev_id);
    if let Some(action) = move_post {
        move_task = move_task.with_post(action);
    }
    let move_id = move_task.task_id;

    let mut done_task = Task::new(done_cmd, uuid, menu_name, order_no).depends_on(move_id);
    if let Some(action) = done_pre {
        done_task = done_task.with_pre(action);
    }
    let done_id = done_task.task_id;

    tasks.push(move_task.chained_to(done_id));
    tasks.push(done_task);
    done_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::SyrupSpec;

    fn recipe(menu_code: i64) -> Recipe {
        Recipe {
            menu_code,
            menu_name: "test".to_string(),
            cup_num: 2,
            ice_ext_time: 0.0,
            water_ext_time: 0.0,
            sparkling_ext_time: 0.0,
            hotwater_ext_time: 0.0,
            coffee_ext_time: 0.0,
            coffee_product_id: 0,
            syrups: Vec::new(),
        }
    }

    #[test]
    fn empty_recipe_plans_exactly_cup_pickup_home() {
        let order = Order::new(1, 1, "water");
        let tasks = plan(&order, &recipe(1));
        let codes: Vec<i64> = tasks.iter().map(|t| t.cmd_code).collect();
        assert_eq!(codes, vec![cmd::CUP_MOVE, cmd::PICKUP_MOVE, cmd::PICKUP_PLACE, cmd::HOME]);
        assert!(tasks.last().unwrap().skippable);
    }

    #[test]
    fn coffee_recipe_emits_parallel_check_point() {
        let mut r = recipe(2);
        r.coffee_ext_time = 30.0;
        r.coffee_product_id = 1;
        let order = Order::new(1, 2, "americano");
        let tasks = plan(&order, &r);
        let coffee_move = tasks.iter().find(|t| t.cmd_code == cmd::COFFEE_MOVE).unwrap();
        assert!(coffee_move.parallel_check_point);
        assert!(coffee_move.pre_device_action.is_some());
        assert_eq!(coffee_move.chained_next_task_id, tasks.iter().find(|t| t.cmd_code == cmd::COFFEE_DONE).map(|t| t.task_id));
    }

    #[test]
    fn milk_coffee_uses_post_action_not_pre() {
        let mut r = recipe(3);
        r.coffee_ext_time = 25.0;
        r.coffee_product_id = 2;
        let order = Order::new(1, 3, "latte");
        let tasks = plan(&order, &r);
        let coffee_move = tasks.iter().find(|t| t.cmd_code == cmd::COFFEE_MOVE).unwrap();
        assert!(coffee_move.pre_device_action.is_none());
        assert!(coffee_move.post_device_action.is_some());
    }

    #[test]
    fn s1_iced_americano_command_sequence() {
        let mut r = recipe(101);
        r.cup_num = 2;
        r.ice_ext_time = 3.0;
        r.water_ext_time = 2.0;
        r.coffee_ext_time = 31.0;
        r.coffee_product_id = 1;
        let order = Order::new(1, 101, "iced americano");
        let tasks = plan(&order, &r);
        let codes: Vec<i64> = tasks.iter().map(|t| t.cmd_code).collect();
        assert_eq!(
            codes,
            vec![
                cmd::CUP_MOVE,
                cmd::WI_MOVE,
                cmd::WI_DONE,
                cmd::COFFEE_MOVE,
                cmd::COFFEE_DONE,
                cmd::PICKUP_MOVE,
                cmd::PICKUP_PLACE,
                cmd::HOME,
            ]
        );
    }

    #[test]
    fn syrups_are_serial_atomic_pairs() {
        let mut r = recipe(4);
        r.syrups = vec![
            SyrupSpec { id: 3, time_seconds: 2.0 },
            SyrupSpec { id: 5, time_seconds: 1.0 },
        ];
        let order = Order::new(1, 4, "ade");
        let tasks = plan(&order, &r);
        let syrup_moves: Vec<&Task> = tasks.iter().filter(|t| t.cmd_code == cmd::SYRUP_MOVE).collect();
        assert_eq!(syrup_moves.len(), 2);
        assert_eq!(syrup_moves[0].params.get(&REG_SYRUP_IDX), Some(&3));
        assert_eq!(syrup_moves[1].params.get(&REG_SYRUP_IDX), Some(&5));
    }
}
