use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{ensure, Result};
use keytrack_game::{Dungeon, DungeonId};
use keytrack_logic::{AccessibilityLevel, DungeonState, ItemState};
use log::debug;
use serde::Serialize;

use crate::aggregate::{section_total, submit_evaluation, ResultFold, SectionVerdict};
use crate::evaluator::EvaluationContext;
use crate::key_door_iterator::{enumerate_terminal_states, initial_states, submit_layers};
use crate::pool::EvaluatorPool;
use crate::scheduler::{JobSet, Scheduler};
use crate::settings::{EngineConfig, TrackerSettings};

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct BossVerdict {
    pub name: String,
    pub accessibility: AccessibilityLevel,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DungeonVerdict {
    pub dungeon_id: DungeonId,
    pub section: SectionVerdict,
    pub bosses: Vec<BossVerdict>,
}

/// Accessibility engine for one dungeon. Owns the dungeon's evaluator pool for its lifetime.
pub struct DungeonEngine {
    dungeon: Arc<Dungeon>,
    pool: EvaluatorPool,
    scheduler: Scheduler,
    // The pool is sized for a single run; concurrent recomputes on one engine take turns.
    run_lock: Mutex<()>,
}

impl DungeonEngine {
    pub fn new(dungeon: Arc<Dungeon>, config: &EngineConfig) -> Result<Self> {
        let scheduler = Scheduler::new(config.max_workers)?;
        let pool = EvaluatorPool::new(dungeon.clone(), config.max_workers)?;
        ensure!(pool.size() >= scheduler.max_workers());
        Ok(DungeonEngine {
            dungeon,
            pool,
            scheduler,
            run_lock: Mutex::new(()),
        })
    }

    pub fn dungeon(&self) -> &Arc<Dungeon> {
        &self.dungeon
    }

    pub fn recompute(&self, settings: &TrackerSettings, items: &ItemState) -> Result<DungeonVerdict> {
        let _guard = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let cx = EvaluationContext::new(settings, items);
        let initial = initial_states(&self.dungeon, &cx);
        let num_initial = initial.len();

        let (final_tx, final_rx) = crossbeam::channel::unbounded();
        let (result_tx, result_rx) = crossbeam::channel::unbounded();
        let mut jobs = JobSet::new();
        submit_layers(&mut jobs, &self.pool, cx, initial, final_tx)?;
        submit_evaluation(
            &mut jobs,
            &self.pool,
            cx,
            final_rx,
            result_tx,
            self.scheduler.max_workers(),
        );
        self.scheduler.run(jobs)?;

        let mut fold = ResultFold::new(
            section_total(&self.dungeon, settings),
            self.dungeon.bosses.len(),
        );
        for result in result_rx.try_iter() {
            fold.push(&result)?;
        }
        let (section, boss_levels) = fold.finish(&items.dungeon(self.dungeon.id))?;
        debug!(
            "{}: {num_initial} initial states, {} results: {:?} {}/{}",
            self.dungeon.name,
            fold.num_results(),
            section.accessibility,
            section.accessible,
            section.total
        );

        let bosses = self
            .dungeon
            .bosses
            .iter()
            .zip(boss_levels)
            .map(|(boss, accessibility)| BossVerdict {
                name: boss.name.clone(),
                accessibility,
            })
            .collect();
        Ok(DungeonVerdict {
            dungeon_id: self.dungeon.id,
            section,
            bosses,
        })
    }

    /// Terminal states of the key-door expansion, before key layout validation.
    pub fn terminal_states(
        &self,
        settings: &TrackerSettings,
        items: &ItemState,
    ) -> Result<Vec<DungeonState>> {
        let _guard = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        enumerate_terminal_states(
            &self.scheduler,
            &self.pool,
            EvaluationContext::new(settings, items),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE_DOOR_DUNGEON: &str = r#"{
        "id": "ThievesTown",
        "nodes": ["Entrance", "Inner"],
        "entry": "Entrance",
        "smallKeys": 1,
        "keyDoors": [{"name": "Door", "from": "Entrance", "to": "Inner"}],
        "locations": [
            {"name": "Front", "node": "Entrance"},
            {"name": "Back", "node": "Inner"}
        ],
        "bosses": [{"name": "Blind", "node": "Inner"}],
        "keyLayouts": [{"smallKey": {"count": 1, "locations": ["Front"]}}]
    }"#;

    fn engine(max_workers: usize) -> DungeonEngine {
        let dungeon = Arc::new(Dungeon::parse_str(ONE_DOOR_DUNGEON).unwrap());
        DungeonEngine::new(dungeon, &EngineConfig { max_workers }).unwrap()
    }

    #[test]
    fn test_shuffled_key_opens_dungeon() -> Result<()> {
        let engine = engine(2);
        let settings = TrackerSettings {
            small_key_shuffle: true,
            ..Default::default()
        };
        let mut items = ItemState::default();
        items.dungeon_mut(DungeonId::ThievesTown).small_keys = 1;
        let verdict = engine.recompute(&settings, &items)?;
        assert_eq!(verdict.dungeon_id, DungeonId::ThievesTown);
        assert_eq!(verdict.section.accessibility, AccessibilityLevel::Normal);
        assert_eq!(verdict.section.accessible, 2);
        assert_eq!(verdict.section.total, 2);
        assert_eq!(
            verdict.bosses,
            vec![BossVerdict {
                name: "Blind".to_string(),
                accessibility: AccessibilityLevel::Normal
            }]
        );
        Ok(())
    }

    #[test]
    fn test_no_keys_never_normal() -> Result<()> {
        let engine = engine(1);
        let settings = TrackerSettings {
            small_key_shuffle: true,
            ..Default::default()
        };
        let verdict = engine.recompute(&settings, &ItemState::default())?;
        assert_eq!(verdict.section.accessibility, AccessibilityLevel::Partial);
        assert_eq!(verdict.section.accessible, 1);
        assert_eq!(verdict.bosses[0].accessibility, AccessibilityLevel::None);
        Ok(())
    }

    #[test]
    fn test_unshuffled_key() -> Result<()> {
        // The key can only be in the front chest, leaving one real item.
        let engine = engine(4);
        let verdict = engine.recompute(&TrackerSettings::default(), &ItemState::default())?;
        assert_eq!(verdict.section.total, 1);
        assert_eq!(verdict.section.accessibility, AccessibilityLevel::Normal);
        assert_eq!(verdict.section.accessible, 1);
        assert_eq!(verdict.bosses[0].accessibility, AccessibilityLevel::Normal);
        Ok(())
    }

    #[test]
    fn test_repeated_recompute_is_stable() -> Result<()> {
        let engine = engine(3);
        let settings = TrackerSettings::default();
        let items = ItemState::default();
        let first = engine.recompute(&settings, &items)?;
        for _ in 0..5 {
            assert_eq!(engine.recompute(&settings, &items)?, first);
        }
        Ok(())
    }
}
