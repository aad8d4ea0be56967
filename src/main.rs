use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use std::{env, thread};

use dotenv::dotenv;
use log::{info, warn};

use bevbot::config::{self, Consts};
use bevbot::gateways::simulated::{SimulatedDeviceGateway, SimulatedIoGateway, SimulatedPickupGateway, SimulatedRobotGateway};
use bevbot::mode::{SystemMode, SystemModeCell};
use bevbot::order_manager::{OrderManager, SharedOrders};
use bevbot::recipe::RecipeStore;
use bevbot::scheduler::TaskScheduler;

/// Built-in menu used when no recipe file is given, or the given one fails to load —
/// enough to exercise a coffee order (with its parallel check point) and a plain
/// non-coffee order side by side.
const DEMO_MENU: &str = r#"[
    {"menu_code": 101, "menu_name": "iced americano", "cup_num": 2, "ice_ext_time": 3.0, "water_ext_time": 2.0, "coffee_ext_time": 31.0, "coffee_product_id": 1},
    {"menu_code": 1, "menu_name": "still water", "cup_num": 1}
]"#;

/// Demo bootstrap: wires the scheduling core to the simulated gateways, queues a
/// couple of orders, and runs until they settle. Everything a real deployment would
/// add on top — HTTP routes, serial drivers, recipe-file persistence — is out of
/// scope and lives outside this crate.
fn main() {
    config::init_logger();
    dotenv().ok();

    let recipe_path = env::args().nth(1);
    let recipe_store = Arc::new(load_recipes(recipe_path.as_deref()));

    let mode = SystemModeCell::new();
    let orders = SharedOrders::new();

    let scheduler = Arc::new(TaskScheduler::new(
        Arc::new(SimulatedRobotGateway::new()),
        Arc::new(SimulatedDeviceGateway::new()),
        Arc::new(SimulatedIoGateway::new()),
        Arc::new(SimulatedPickupGateway::new(Consts::pickup_slot_count() as usize)),
        Arc::clone(&recipe_store),
        mode.clone(),
        orders.clone(),
    ));

    let manager = Arc::new(OrderManager::new(orders.clone(), Arc::clone(&recipe_store), Arc::clone(&scheduler), mode.clone()));

    Arc::clone(&scheduler).spawn_dispatcher();
    Arc::clone(&manager).spawn_plan_loop();

    manager.set_mode(SystemMode::Auto);

    let first = manager.add(1, 101, "iced americano");
    let second = manager.add(2, 1, "still water");
    info!("main: demo orders queued: {first}, {second}");

    loop {
        thread::sleep(Duration::from_secs(2));
        if orders.snapshot().is_empty() {
            break;
        }
    }

    info!("main: all demo orders settled, shutting down");
    scheduler.shutdown();
}

fn load_recipes(path: Option<&str>) -> RecipeStore {
    match path {
        Some(path) => match RecipeStore::load_from_path(Path::new(path)) {
            Ok(store) => store,
            Err(e) => {
                warn!("main: {e}; falling back to the built-in demo menu");
                RecipeStore::load_from_str(DEMO_MENU).expect("built-in demo menu is valid JSON")
            }
        },
        None => RecipeStore::load_from_str(DEMO_MENU).expect("built-in demo menu is valid JSON"),
    }
}
