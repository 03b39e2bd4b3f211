use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{ensure, Context, Result};
use crossbeam::channel::{Receiver, Sender};
use keytrack_game::Dungeon;

use crate::evaluator::MutableDungeon;

/// Fixed set of evaluators for one dungeon, shared by the jobs of a recompute.
///
/// `checkout` blocks until an evaluator is free. Each evaluator is used by at most one holder
/// at a time and goes back to the pool when the handle is dropped, including on early return.
pub struct EvaluatorPool {
    dungeon: Arc<Dungeon>,
    evaluators: Vec<Mutex<MutableDungeon>>,
    free_tx: Sender<usize>,
    free_rx: Receiver<usize>,
}

impl EvaluatorPool {
    pub fn new(dungeon: Arc<Dungeon>, size: usize) -> Result<Self> {
        ensure!(size > 0, "evaluator pool for {} must not be empty", dungeon.name);
        let (free_tx, free_rx) = crossbeam::channel::bounded(size);
        let mut evaluators = Vec::with_capacity(size);
        for i in 0..size {
            evaluators.push(Mutex::new(MutableDungeon::new(dungeon.clone())));
            free_tx.send(i)?;
        }
        Ok(EvaluatorPool {
            dungeon,
            evaluators,
            free_tx,
            free_rx,
        })
    }

    pub fn size(&self) -> usize {
        self.evaluators.len()
    }

    pub fn dungeon(&self) -> &Arc<Dungeon> {
        &self.dungeon
    }

    pub fn checkout(&self) -> Result<PooledEvaluator<'_>> {
        let idx = self
            .free_rx
            .recv()
            .context("evaluator pool free list closed")?;
        let slot = Slot {
            idx,
            free_tx: &self.free_tx,
        };
        // A panic while holding an evaluator only poisons the mutex; `apply_state` overwrites
        // everything, so the evaluator itself is still usable.
        let evaluator = self.evaluators[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(PooledEvaluator {
            evaluator,
            _slot: slot,
        })
    }
}

struct Slot<'a> {
    idx: usize,
    free_tx: &'a Sender<usize>,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        // The pool owns the receiver and outlives every handle, so this cannot fail.
        let _ = self.free_tx.send(self.idx);
    }
}

pub struct PooledEvaluator<'a> {
    // Declared before the slot: the lock is released before the index is returned.
    evaluator: MutexGuard<'a, MutableDungeon>,
    _slot: Slot<'a>,
}

impl Deref for PooledEvaluator<'_> {
    type Target = MutableDungeon;

    fn deref(&self) -> &MutableDungeon {
        &self.evaluator
    }
}

impl DerefMut for PooledEvaluator<'_> {
    fn deref_mut(&mut self) -> &mut MutableDungeon {
        &mut self.evaluator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dungeon() -> Arc<Dungeon> {
        Arc::new(
            Dungeon::parse_str(
                r#"{"id": "SwampPalace", "nodes": ["Entrance"], "entry": "Entrance"}"#,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_checkout_returns_on_drop() -> Result<()> {
        let pool = EvaluatorPool::new(dungeon(), 2)?;
        assert_eq!(pool.size(), 2);
        let a = pool.checkout()?;
        let b = pool.checkout()?;
        assert!(pool.free_rx.is_empty());
        drop(a);
        let c = pool.checkout()?;
        assert_eq!(c.dungeon().name, "SwampPalace");
        drop(b);
        drop(c);
        assert_eq!(pool.free_rx.len(), 2);
        Ok(())
    }

    #[test]
    fn test_checkout_blocks_until_free() -> Result<()> {
        let pool = EvaluatorPool::new(dungeon(), 1)?;
        let held = pool.checkout()?;
        std::thread::scope(|s| {
            let waiter = s.spawn(|| pool.checkout().map(|_| ()));
            std::thread::sleep(Duration::from_millis(50));
            assert!(!waiter.is_finished());
            drop(held);
            waiter.join().unwrap()
        })
    }

    #[test]
    fn test_returned_after_panic() -> Result<()> {
        let pool = EvaluatorPool::new(dungeon(), 1)?;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ev = pool.checkout().unwrap();
            panic!("evaluation failed");
        }));
        assert!(result.is_err());
        let _ev = pool.checkout()?;
        Ok(())
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(EvaluatorPool::new(dungeon(), 0).is_err());
    }
}
