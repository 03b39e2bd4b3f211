//! Layered expansion of key-door hypotheses.
//!
//! Layer `i` holds the states with exactly `i` doors unlocked. Each layer is drained by one
//! job, which either finalizes a state (no key left to spend, or no locked door in reach) or
//! forwards one successor per reachable locked door to layer `i + 1`. A dungeon with `N` key
//! doors has layers `0..=N`.

use anyhow::{bail, ensure, Context, Result};
use crossbeam::channel::{Receiver, Sender};
use keytrack_game::Dungeon;
use keytrack_logic::DungeonState;
use log::debug;

use crate::evaluator::EvaluationContext;
use crate::pool::EvaluatorPool;
use crate::scheduler::{JobSet, Scheduler};

/// Small key counts to hypothesize. When keys are shuffled out of the dungeon the player's
/// count is known; otherwise any number of the dungeon's own chest keys may have been found.
pub fn small_key_values(dungeon: &Dungeon, cx: &EvaluationContext) -> Vec<usize> {
    if cx.settings.small_keys_in_pool() {
        (0..=dungeon.max_small_keys(cx.settings.key_drop_shuffle)).collect()
    } else {
        vec![cx.items.dungeon(dungeon.id).small_keys]
    }
}

pub fn big_key_values(dungeon: &Dungeon, cx: &EvaluationContext) -> Vec<bool> {
    if !dungeon.big_key {
        vec![false]
    } else if cx.settings.big_key_shuffle {
        vec![cx.items.dungeon(dungeon.id).big_key]
    } else {
        vec![false, true]
    }
}

pub fn initial_states(dungeon: &Dungeon, cx: &EvaluationContext) -> Vec<DungeonState> {
    let mut states: Vec<DungeonState> = Vec::new();
    for keys in small_key_values(dungeon, cx) {
        for big_key in big_key_values(dungeon, cx) {
            states.push(DungeonState::new(keys, big_key, false));
            states.push(DungeonState::new(keys, big_key, true));
        }
    }
    states
}

/// Submits one drain job per layer. Terminal states are sent to `final_tx`; the final queue
/// closes once every layer job has finished and the caller has dropped its own senders.
pub fn submit_layers<'env>(
    jobs: &mut JobSet<'env>,
    pool: &'env EvaluatorPool,
    cx: EvaluationContext<'env>,
    initial: Vec<DungeonState>,
    final_tx: Sender<DungeonState>,
) -> Result<()> {
    let num_layers = pool.dungeon().key_doors.len() + 1;
    let (layer_txs, layer_rxs): (Vec<Sender<DungeonState>>, Vec<Receiver<DungeonState>>) =
        (0..num_layers)
            .map(|_| crossbeam::channel::unbounded())
            .unzip();

    let mut layer_txs = layer_txs.into_iter();
    let seed_tx = layer_txs.next().context("missing layer 0 queue")?;
    debug!(
        "{}: {} initial states",
        pool.dungeon().name,
        initial.len()
    );
    for state in initial {
        seed_tx.send(state)?;
    }
    drop(seed_tx);

    let next_txs = layer_txs.map(Some).chain(std::iter::once(None));
    for (layer, (layer_rx, next_tx)) in layer_rxs.into_iter().zip(next_txs).enumerate() {
        let final_tx = final_tx.clone();
        jobs.submit(format!("{} layer {layer}", pool.dungeon().name), move || {
            drain_layer(layer, pool, cx, layer_rx, next_tx, final_tx)
        });
    }
    Ok(())
}

fn drain_layer(
    layer: usize,
    pool: &EvaluatorPool,
    cx: EvaluationContext,
    layer_rx: Receiver<DungeonState>,
    next_tx: Option<Sender<DungeonState>>,
    final_tx: Sender<DungeonState>,
) -> Result<()> {
    let name = &pool.dungeon().name;
    // Closed without input: nothing reached this depth.
    let Ok(first) = layer_rx.recv() else {
        return Ok(());
    };
    let mut evaluator = pool.checkout()?;
    let mut num_states = 0;
    let mut num_terminal = 0;
    let mut num_expanded = 0;
    for state in std::iter::once(first).chain(layer_rx.iter()) {
        num_states += 1;
        evaluator.apply_state(&state, &cx);
        let sequence_break = state.sequence_break();
        let keys = evaluator.available_small_keys(sequence_break, &cx) + state.keys_collected();
        let num_unlocked = state.unlocked_doors().len();
        ensure!(
            keys >= num_unlocked,
            "{name}: layer {layer} state {state:?} unlocked {num_unlocked} doors with {keys} keys"
        );
        let available_keys = keys - num_unlocked;
        let doors = if available_keys == 0 {
            vec![]
        } else {
            evaluator.accessible_key_doors(sequence_break)
        };
        if doors.is_empty() {
            final_tx.send(state)?;
            num_terminal += 1;
            continue;
        }
        let Some(next_tx) = &next_tx else {
            bail!("{name}: state {state:?} can still unlock doors {doors:?} past the last layer");
        };
        for door_idx in doors {
            next_tx.send(state.with_unlocked_door(door_idx))?;
            num_expanded += 1;
        }
    }
    debug!(
        "{name}: layer {layer}: {num_states} states, {num_terminal} terminal, {num_expanded} expanded"
    );
    Ok(())
}

/// Runs the pipeline on its own and returns every terminal state.
pub fn enumerate_terminal_states(
    scheduler: &Scheduler,
    pool: &EvaluatorPool,
    cx: EvaluationContext,
) -> Result<Vec<DungeonState>> {
    ensure!(
        pool.size() >= scheduler.max_workers(),
        "evaluator pool of {} is smaller than the {} scheduler workers",
        pool.size(),
        scheduler.max_workers()
    );
    let (final_tx, final_rx) = crossbeam::channel::unbounded();
    let mut jobs = JobSet::new();
    submit_layers(
        &mut jobs,
        pool,
        cx,
        initial_states(pool.dungeon(), &cx),
        final_tx,
    )?;
    scheduler.run(jobs)?;
    Ok(final_rx.try_iter().collect())
}
