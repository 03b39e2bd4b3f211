use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use crossbeam::channel::{Receiver, Sender};
use hashbrown::HashMap;
use keytrack_game::DungeonId;
use keytrack_logic::ItemState;
use log::{debug, info, warn};

use crate::engine::{DungeonEngine, DungeonVerdict};
use crate::settings::TrackerSettings;

#[derive(Clone, Debug, Default)]
pub struct TrackerInput {
    pub settings: TrackerSettings,
    pub items: ItemState,
}

pub struct RecomputeOutcome {
    // Generation of the input this was computed from. Strictly increasing across outcomes.
    pub generation: u64,
    pub result: Result<HashMap<DungeonId, DungeonVerdict>>,
}

/// Background recompute loop. Inputs are processed one run at a time; inputs that arrive
/// while a run is in progress are coalesced so that only the newest one is computed next.
pub struct RecomputeService {
    // Numbering and sending happen under one lock, so the inbox is always in generation order.
    inbox: Mutex<Inbox>,
    worker: Option<JoinHandle<()>>,
}

struct Inbox {
    input_tx: Option<Sender<(u64, TrackerInput)>>,
    last_generation: u64,
}

impl RecomputeService {
    pub fn spawn(engines: Vec<DungeonEngine>) -> Result<(Self, Receiver<RecomputeOutcome>)> {
        let (input_tx, input_rx) = crossbeam::channel::unbounded();
        let (outcome_tx, outcome_rx) = crossbeam::channel::unbounded();
        let worker = std::thread::Builder::new()
            .name("recompute".to_string())
            .spawn(move || run_service(engines, input_rx, outcome_tx))
            .context("unable to start recompute thread")?;
        Ok((
            RecomputeService {
                inbox: Mutex::new(Inbox {
                    input_tx: Some(input_tx),
                    last_generation: 0,
                }),
                worker: Some(worker),
            },
            outcome_rx,
        ))
    }

    /// Queues a recompute and returns the generation its outcome will carry.
    pub fn input_changed(&self, input: TrackerInput) -> Result<u64> {
        let mut inbox = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = inbox.last_generation + 1;
        inbox
            .input_tx
            .as_ref()
            .context("recompute service is shut down")?
            .send((generation, input))
            .map_err(|_| anyhow!("recompute thread has exited"))?;
        inbox.last_generation = generation;
        Ok(generation)
    }

    /// Stops accepting input, finishes the pending run and waits for the thread to exit.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        self.inbox
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .input_tx = None;
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| anyhow!("recompute thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for RecomputeService {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("{e:#}");
        }
    }
}

fn run_service(
    engines: Vec<DungeonEngine>,
    input_rx: Receiver<(u64, TrackerInput)>,
    outcome_tx: Sender<RecomputeOutcome>,
) {
    info!("Recompute service started for {} dungeons", engines.len());
    while let Ok(mut pending) = input_rx.recv() {
        let mut num_superseded = 0;
        while let Ok(newer) = input_rx.try_recv() {
            pending = newer;
            num_superseded += 1;
        }
        let (generation, input) = pending;
        if num_superseded > 0 {
            debug!("Generation {generation} supersedes {num_superseded} pending inputs");
        }
        let result = recompute_all(&engines, &input);
        if let Err(e) = &result {
            warn!("Recompute of generation {generation} failed: {e:#}");
        }
        if outcome_tx.send(RecomputeOutcome { generation, result }).is_err() {
            break;
        }
    }
    info!("Recompute service stopped");
}

pub fn recompute_all(
    engines: &[DungeonEngine],
    input: &TrackerInput,
) -> Result<HashMap<DungeonId, DungeonVerdict>> {
    let mut verdicts: HashMap<DungeonId, DungeonVerdict> = HashMap::new();
    for engine in engines {
        let verdict = engine
            .recompute(&input.settings, &input.items)
            .with_context(|| format!("Recomputing {}", engine.dungeon().name))?;
        verdicts.insert(engine.dungeon().id, verdict);
    }
    Ok(verdicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::EngineConfig;
    use keytrack_game::{Dungeon, Item};
    use keytrack_logic::AccessibilityLevel;
    use std::sync::Arc;

    fn engines() -> Vec<DungeonEngine> {
        let dungeon = Dungeon::parse_str(
            r#"{
                "id": "MiseryMire",
                "nodes": ["Entrance", "Dark"],
                "entry": "Entrance",
                "connections": [{"from": "Entrance", "to": "Dark", "requires": "Lamp"}],
                "locations": [
                    {"name": "Lit Chest", "node": "Entrance"},
                    {"name": "Dark Chest", "node": "Dark"}
                ]
            }"#,
        )
        .unwrap();
        vec![DungeonEngine::new(Arc::new(dungeon), &EngineConfig { max_workers: 2 }).unwrap()]
    }

    #[test]
    fn test_generations_increase() -> Result<()> {
        let (service, outcome_rx) = RecomputeService::spawn(engines())?;
        let mut input = TrackerInput::default();
        let mut generations: Vec<u64> = Vec::new();
        for i in 0..5 {
            if i == 4 {
                input.items.collect(Item::Lamp);
            }
            generations.push(service.input_changed(input.clone())?);
        }
        assert_eq!(generations, vec![1, 2, 3, 4, 5]);
        service.shutdown()?;

        let outcomes: Vec<RecomputeOutcome> = outcome_rx.try_iter().collect();
        assert!(!outcomes.is_empty());
        for pair in outcomes.windows(2) {
            assert!(pair[0].generation < pair[1].generation);
        }
        // The newest input is never dropped by coalescing.
        let last = outcomes.last().unwrap();
        assert_eq!(last.generation, 5);
        let verdicts = last.result.as_ref().unwrap();
        let verdict = &verdicts[&DungeonId::MiseryMire];
        assert_eq!(verdict.section.accessibility, AccessibilityLevel::Normal);
        assert_eq!(verdict.section.accessible, 2);
        Ok(())
    }

    #[test]
    fn test_concurrent_senders() -> Result<()> {
        let (service, outcome_rx) = RecomputeService::spawn(engines())?;
        let num_threads = 4;
        let num_inputs = 50;
        let mut generations: Vec<u64> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..num_threads)
                .map(|_| {
                    s.spawn(|| -> Result<Vec<u64>> {
                        let mut out = Vec::new();
                        for _ in 0..num_inputs {
                            out.push(service.input_changed(TrackerInput::default())?);
                        }
                        Ok(out)
                    })
                })
                .collect();
            let mut all = Vec::new();
            for handle in handles {
                all.extend(handle.join().unwrap()?);
            }
            Ok::<_, anyhow::Error>(all)
        })?;
        let last_generation = num_threads * num_inputs;
        generations.sort();
        assert_eq!(generations, (1..=last_generation).collect::<Vec<u64>>());
        service.shutdown()?;

        let outcomes: Vec<RecomputeOutcome> = outcome_rx.try_iter().collect();
        for pair in outcomes.windows(2) {
            assert!(pair[0].generation < pair[1].generation);
        }
        assert_eq!(outcomes.last().unwrap().generation, last_generation);
        Ok(())
    }

    #[test]
    fn test_recompute_all() -> Result<()> {
        let verdicts = recompute_all(&engines(), &TrackerInput::default())?;
        let verdict = &verdicts[&DungeonId::MiseryMire];
        assert_eq!(verdict.section.accessibility, AccessibilityLevel::Partial);
        assert_eq!(verdict.section.accessible, 1);
        Ok(())
    }

    #[test]
    fn test_input_after_shutdown() -> Result<()> {
        let (mut service, _outcome_rx) = RecomputeService::spawn(engines())?;
        service.stop()?;
        assert!(service.input_changed(TrackerInput::default()).is_err());
        Ok(())
    }
}
