use anyhow::{bail, ensure, Result};
use crossbeam::channel::{Receiver, Sender};
use keytrack_game::Dungeon;
use keytrack_logic::{AccessibilityLevel, DungeonItems, DungeonResult, DungeonState};
use log::debug;
use serde::Serialize;

use crate::evaluator::EvaluationContext;
use crate::pool::EvaluatorPool;
use crate::scheduler::JobSet;
use crate::settings::TrackerSettings;

/// Number of items a player can expect to find in the dungeon's item locations, not counting
/// the dungeon's own keys, map and compass when those are not shuffled.
pub fn section_total(dungeon: &Dungeon, settings: &TrackerSettings) -> usize {
    let mut dungeon_items = 0;
    if settings.small_keys_in_pool() {
        dungeon_items += dungeon.max_small_keys(settings.key_drop_shuffle);
    }
    if dungeon.big_key && settings.big_key_in_pool() {
        dungeon_items += 1;
    }
    if !settings.map_compass_shuffle {
        dungeon_items += dungeon.map as usize + dungeon.compass as usize;
    }
    dungeon
        .num_item_locations(settings.key_drop_shuffle)
        .saturating_sub(dungeon_items)
}

/// Submits `parallelism` jobs sharing the final-state queue. Each valid state yields one
/// result on `result_tx`; states rejected by the key layout check are dropped.
pub fn submit_evaluation<'env>(
    jobs: &mut JobSet<'env>,
    pool: &'env EvaluatorPool,
    cx: EvaluationContext<'env>,
    final_rx: Receiver<DungeonState>,
    result_tx: Sender<DungeonResult>,
    parallelism: usize,
) {
    for i in 0..parallelism.max(1) {
        let final_rx = final_rx.clone();
        let result_tx = result_tx.clone();
        jobs.submit(format!("{} evaluate {i}", pool.dungeon().name), move || {
            evaluate_states(pool, cx, final_rx, result_tx)
        });
    }
}

fn evaluate_states(
    pool: &EvaluatorPool,
    cx: EvaluationContext,
    final_rx: Receiver<DungeonState>,
    result_tx: Sender<DungeonResult>,
) -> Result<()> {
    let Ok(first) = final_rx.recv() else {
        return Ok(());
    };
    let mut evaluator = pool.checkout()?;
    let mut num_valid = 0;
    let mut num_discarded = 0;
    for state in std::iter::once(first).chain(final_rx.iter()) {
        evaluator.apply_state(&state, &cx);
        if !evaluator.validate_key_layout(&state, &cx) {
            num_discarded += 1;
            continue;
        }
        result_tx.send(evaluator.get_dungeon_result(&state, &cx))?;
        num_valid += 1;
    }
    debug!(
        "{}: {num_valid} valid terminal states, {num_discarded} discarded",
        pool.dungeon().name
    );
    Ok(())
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SectionVerdict {
    pub accessibility: AccessibilityLevel,
    // Items still obtainable, after subtracting those already checked.
    pub accessible: usize,
    pub total: usize,
    pub sequence_break: bool,
    pub visible: bool,
}

// (adjusted accessible, raw accessible); compared lexicographically.
type AccessibleCount = (usize, usize);

/// Commutative fold over the results of one recompute.
#[derive(Clone, Debug)]
pub struct ResultFold {
    total: usize,
    highest: Option<AccessibleCount>,
    // Only results that do not rely on sequence breaks.
    lowest: Option<AccessibleCount>,
    boss_highest: Vec<AccessibilityLevel>,
    boss_lowest: Vec<AccessibilityLevel>,
    visible: bool,
    num_results: usize,
}

impl ResultFold {
    pub fn new(total: usize, num_bosses: usize) -> Self {
        ResultFold {
            total,
            highest: None,
            lowest: None,
            boss_highest: vec![AccessibilityLevel::None; num_bosses],
            boss_lowest: vec![AccessibilityLevel::Cleared; num_bosses],
            visible: false,
            num_results: 0,
        }
    }

    pub fn push(&mut self, result: &DungeonResult) -> Result<()> {
        ensure!(
            result.bosses.len() == self.boss_highest.len(),
            "result has {} bosses, expected {}",
            result.bosses.len(),
            self.boss_highest.len()
        );
        let adjusted = result
            .accessible
            .min(self.total.saturating_sub(result.minimum_inaccessible));
        let count = (adjusted, result.accessible);
        self.highest = Some(self.highest.map_or(count, |h| h.max(count)));
        if !result.sequence_break {
            self.lowest = Some(self.lowest.map_or(count, |l| l.min(count)));
        }
        for (i, &level) in result.bosses.iter().enumerate() {
            self.boss_highest[i] = self.boss_highest[i].max(level);
            self.boss_lowest[i] = self.boss_lowest[i].min(level);
        }
        self.visible |= result.visible;
        self.num_results += 1;
        Ok(())
    }

    pub fn num_results(&self) -> usize {
        self.num_results
    }

    pub fn highest_accessible(&self) -> Option<usize> {
        self.highest.map(|(adjusted, _)| adjusted)
    }

    pub fn lowest_accessible(&self) -> Option<usize> {
        self.lowest.map(|(adjusted, _)| adjusted)
    }

    pub fn finish(&self, items: &DungeonItems) -> Result<(SectionVerdict, Vec<AccessibilityLevel>)> {
        Ok((self.finish_section(items), self.finish_bosses()?))
    }

    fn finish_section(&self, items: &DungeonItems) -> SectionVerdict {
        let remaining = self.total.saturating_sub(items.checked);
        if remaining == 0 {
            return SectionVerdict {
                accessibility: AccessibilityLevel::Cleared,
                accessible: 0,
                total: self.total,
                sequence_break: false,
                visible: false,
            };
        }
        let (Some((highest, _)), Some((lowest, _))) = (self.highest, self.lowest) else {
            return SectionVerdict {
                accessibility: AccessibilityLevel::None,
                accessible: 0,
                total: self.total,
                sequence_break: true,
                visible: false,
            };
        };
        let best = highest.saturating_sub(items.checked).min(remaining);
        let worst = lowest.saturating_sub(items.checked).min(remaining);
        let accessibility = if best >= remaining {
            if worst >= remaining {
                AccessibilityLevel::Normal
            } else {
                AccessibilityLevel::SequenceBreak
            }
        } else if best > 0 {
            AccessibilityLevel::Partial
        } else if self.visible {
            AccessibilityLevel::Inspect
        } else {
            AccessibilityLevel::None
        };
        SectionVerdict {
            accessibility,
            accessible: best,
            total: self.total,
            sequence_break: accessibility == AccessibilityLevel::SequenceBreak,
            visible: self.visible,
        }
    }

    fn finish_bosses(&self) -> Result<Vec<AccessibilityLevel>> {
        if self.num_results == 0 {
            return Ok(vec![AccessibilityLevel::None; self.boss_highest.len()]);
        }
        let mut out: Vec<AccessibilityLevel> = Vec::with_capacity(self.boss_highest.len());
        for (i, (&highest, &lowest)) in self.boss_highest.iter().zip(&self.boss_lowest).enumerate() {
            let level = match highest {
                AccessibilityLevel::None | AccessibilityLevel::SequenceBreak => highest,
                AccessibilityLevel::Normal if lowest >= AccessibilityLevel::Normal => highest,
                AccessibilityLevel::Normal => AccessibilityLevel::SequenceBreak,
                _ => bail!("boss {i} folded to {highest:?}"),
            };
            out.push(level);
        }
        Ok(out)
    }
}
