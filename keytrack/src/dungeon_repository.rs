use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use hashbrown::HashMap;
use keytrack_game::{Dungeon, DungeonId};
use log::info;

use crate::engine::DungeonEngine;
use crate::settings::EngineConfig;

/// Dungeon graphs loaded once at startup, one JSON file per dungeon.
pub struct DungeonRepository {
    dungeons: HashMap<DungeonId, Arc<Dungeon>>,
}

impl DungeonRepository {
    pub fn load(base_path: &Path) -> Result<Self> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(base_path)
            .with_context(|| format!("Unable to read dungeon directory {}", base_path.display()))?
        {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut dungeons: HashMap<DungeonId, Arc<Dungeon>> = HashMap::new();
        for path in &paths {
            let dungeon = Dungeon::load(path)?;
            if dungeons.contains_key(&dungeon.id) {
                bail!(
                    "Dungeon {:?} defined more than once (second in {})",
                    dungeon.id,
                    path.display()
                );
            }
            dungeons.insert(dungeon.id, Arc::new(dungeon));
        }
        info!(
            "{} dungeons loaded ({})",
            dungeons.len(),
            base_path.display()
        );
        Ok(DungeonRepository { dungeons })
    }

    pub fn get(&self, dungeon_id: DungeonId) -> Result<Arc<Dungeon>> {
        self.dungeons
            .get(&dungeon_id)
            .cloned()
            .with_context(|| format!("Dungeon {dungeon_id:?} not loaded"))
    }

    pub fn dungeon_ids(&self) -> Vec<DungeonId> {
        let mut ids: Vec<DungeonId> = self.dungeons.keys().copied().collect();
        ids.sort();
        ids
    }

    /// One engine per loaded dungeon, in dungeon id order.
    pub fn engines(&self, config: &EngineConfig) -> Result<Vec<DungeonEngine>> {
        let mut engines: Vec<DungeonEngine> = Vec::new();
        for dungeon_id in self.dungeon_ids() {
            engines.push(DungeonEngine::new(self.get(dungeon_id)?, config)?);
        }
        Ok(engines)
    }
}
