use std::collections::HashMap;

use log::{info, warn};
use serde::Deserialize;

use crate::config::Consts;
use crate::error::{CoreError, CoreErrorKind};

/// One syrup pump application: `{id in 1..=8, time_seconds}`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SyrupSpec {
    pub id: u8,
    #[serde(default)]
    pub time_seconds: f32,
}

/// A menu definition, keyed by `menu_code`. Absent duration fields default to 0,
/// which the planner reads as "skip this station".
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Recipe {
    pub menu_code: i64,
    #[serde(default)]
    pub menu_name: String,
    pub cup_num: u8,
    #[serde(default)]
    pub ice_ext_time: f32,
    #[serde(default)]
    pub water_ext_time: f32,
    #[serde(default)]
    pub sparkling_ext_time: f32,
    #[serde(default)]
    pub hotwater_ext_time: f32,
    #[serde(default)]
    pub coffee_ext_time: f32,
    #[serde(default)]
    pub coffee_product_id: i64,
    #[serde(default)]
    pub syrups: Vec<SyrupSpec>,
}

impl Recipe {
    /// `cup_num` must be 1 (hot) or 2 (iced); durations must be non-negative finite.
    pub fn is_valid(&self) -> bool {
        (self.cup_num == 1 || self.cup_num == 2)
            && [
                self.ice_ext_time,
                self.water_ext_time,
                self.sparkling_ext_time,
                self.hotwater_ext_time,
                self.coffee_ext_time,
            ]
            .iter()
            .all(|t| t.is_finite() && *t >= 0.0)
    }

    /// Replaces every positive duration with `secs`, for the simulation-override boot
    /// flag.
    fn with_simulated_durations(mut self, secs: f32) -> Self {
        for field in [
            &mut self.ice_ext_time,
            &mut self.water_ext_time,
            &mut self.sparkling_ext_time,
            &mut self.hotwater_ext_time,
            &mut self.coffee_ext_time,
        ] {
            if *field > 0.0 {
                *field = secs;
            }
        }
        for syrup in &mut self.syrups {
            if syrup.time_seconds > 0.0 {
                syrup.time_seconds = secs;
            }
        }
        self
    }
}

/// Either shape tolerated on load: `[recipe, ...]` or `{menu_code: recipe}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RecipeDocument {
    List(Vec<Recipe>),
    Map(HashMap<String, Recipe>),
}

/// Read-only, in-memory menu catalog. Loaded once at start; `RecipeStore` never
/// mutates its own entries afterward — the out-of-scope persistence layer is the only
/// writer of the backing file.
pub struct RecipeStore {
    recipes: HashMap<i64, Recipe>,
}

impl RecipeStore {
    /// Parses a recipe document from a JSON string, normalizing either accepted shape
    /// into the internal by-menu-code map. Applies the simulation-duration override
    /// when `Consts::simulate_durations()` is set.
    pub fn load_from_str(json: &str) -> Result<Self, CoreError> {
        let document: RecipeDocument = serde_json::from_str(json).map_err(|e| {
            CoreError::new_of_type(
                &format!("failed to parse recipe document: {e}"),
                CoreErrorKind::BadRequest,
            )
        })?;

        let list = match document {
            RecipeDocument::List(list) => list,
            RecipeDocument::Map(map) => map.into_values().collect(),
        };

        let simulate = Consts::simulate_durations();
        let sim_secs = Consts::simulation_duration_secs();

        let mut recipes = HashMap::new();
        for recipe in list {
            if !recipe.is_valid() {
                warn!(
                    "RecipeStore: dropping invalid recipe for menu_code={}",
                    recipe.menu_code
                );
                continue;
            }
            let recipe = if simulate {
                recipe.with_simulated_durations(sim_secs)
            } else {
                recipe
            };
            recipes.insert(recipe.menu_code, recipe);
        }

        info!("RecipeStore: loaded {} recipes", recipes.len());
        Ok(RecipeStore { recipes })
    }

    /// Reads `path` and parses it the same way as `load_from_str`. The out-of-scope
    /// HTTP-facing persistence layer is whatever writes this file; this is just the read side.
    pub fn load_from_path(path: &std::path::Path) -> Result<Self, CoreError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            CoreError::new_of_type(
                &format!("failed to read recipe file {}: {e}", path.display()),
                CoreErrorKind::BadRequest,
            )
        })?;
        Self::load_from_str(&json)
    }

    pub fn get(&self, menu_code: i64) -> Option<&Recipe> {
        self.recipes.get(&menu_code)
    }

    pub fn all(&self) -> Vec<&Recipe> {
        self.recipes.values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_list_shape() {
        let json = r#"[{"menu_code": 101, "menu_name": "iced americano", "cup_num": 2, "coffee_ext_time": 31.0, "coffee_product_id": 1}]"#;
        let store = RecipeStore::load_from_str(json).unwrap();
        let recipe = store.get(101).unwrap();
        assert_eq!(recipe.menu_name, "iced americano");
        assert_eq!(recipe.cup_num, 2);
        assert_eq!(recipe.coffee_ext_time, 31.0);
        assert_eq!(recipe.ice_ext_time, 0.0);
    }

    #[test]
    fn loads_map_shape() {
        let json = r#"{"202": {"menu_code": 202, "cup_num": 1, "coffee_ext_time": 25.0, "coffee_product_id": 2}}"#;
        let store = RecipeStore::load_from_str(json).unwrap();
        assert!(store.get(202).is_some());
    }

    #[test]
    fn rejects_invalid_cup_num() {
        let json = r#"[{"menu_code": 1, "cup_num": 9}]"#;
        let store = RecipeStore::load_from_str(json).unwrap();
        assert!(store.get(1).is_none());
    }

    #[test]
    fn unknown_menu_code_returns_none() {
        let store = RecipeStore::load_from_str("[]").unwrap();
        assert!(store.get(999).is_none());
    }
}
