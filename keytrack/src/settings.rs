use anyhow::{Context, Result};
use hashbrown::HashMap;
use keytrack_game::{ModeFlag, SequenceBreakType};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TrackerSettings {
    #[serde(default)]
    pub small_key_shuffle: bool,
    #[serde(default)]
    pub big_key_shuffle: bool,
    #[serde(default)]
    pub key_drop_shuffle: bool,
    #[serde(default)]
    pub generic_keys: bool,
    #[serde(default)]
    pub map_compass_shuffle: bool,
    #[serde(default)]
    pub sequence_breaks: SequenceBreakSettings,
}

impl TrackerSettings {
    pub fn flag(&self, flag: ModeFlag) -> bool {
        match flag {
            ModeFlag::SmallKeyShuffle => self.small_key_shuffle,
            ModeFlag::BigKeyShuffle => self.big_key_shuffle,
            ModeFlag::KeyDropShuffle => self.key_drop_shuffle,
            ModeFlag::GenericKeys => self.generic_keys,
            ModeFlag::MapCompassShuffle => self.map_compass_shuffle,
        }
    }

    // Whether the dungeon's small keys are hidden among its own item locations. Otherwise the
    // player's key count is known exactly.
    pub fn small_keys_in_pool(&self) -> bool {
        !self.small_key_shuffle && !self.generic_keys
    }

    pub fn big_key_in_pool(&self) -> bool {
        !self.big_key_shuffle
    }
}

/// Per-type sequence break toggles. Types not listed are enabled.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct SequenceBreakSettings {
    enabled: HashMap<SequenceBreakType, bool>,
}

impl SequenceBreakSettings {
    pub fn is_enabled(&self, break_type: SequenceBreakType) -> bool {
        self.enabled.get(&break_type).copied().unwrap_or(true)
    }

    pub fn set_enabled(&mut self, break_type: SequenceBreakType, enabled: bool) {
        self.enabled.insert(break_type, enabled);
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EngineConfig {
    // Upper bound on concurrently running pipeline stages, and the evaluator pool size.
    pub max_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        EngineConfig {
            max_workers: parallelism.clamp(1, 8),
        }
    }
}

pub fn parse_tracker_settings(settings_json: &str) -> Result<TrackerSettings> {
    let mut des = serde_json::Deserializer::from_str(settings_json);
    let settings = serde_path_to_error::deserialize(&mut des)?;
    Ok(settings)
}

pub fn load_tracker_settings(path: &Path) -> Result<TrackerSettings> {
    let settings_str = std::fs::read_to_string(path)
        .with_context(|| format!("Unable to read settings at {}", path.display()))?;
    parse_tracker_settings(&settings_str)
        .with_context(|| format!("Unable to parse settings at {}", path.display()))
}
