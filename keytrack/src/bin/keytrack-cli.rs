use anyhow::{Context, Result};
use clap::Parser;
use keytrack::engine::DungeonEngine;
use keytrack::settings::{load_tracker_settings, EngineConfig, TrackerSettings};
use keytrack_game::Dungeon;
use keytrack_logic::ItemState;
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
struct Args {
    #[arg(long)]
    dungeon: PathBuf,

    #[arg(long)]
    settings: Option<PathBuf>,

    #[arg(long)]
    items: Option<PathBuf>,

    #[arg(long)]
    max_workers: Option<usize>,

    // Print the terminal states of the key-door expansion instead of the verdict.
    #[arg(long)]
    states: bool,
}

fn load_items(path: &Path) -> Result<ItemState> {
    let items_str = std::fs::read_to_string(path)
        .with_context(|| format!("Unable to read items at {}", path.display()))?;
    let mut des = serde_json::Deserializer::from_str(&items_str);
    serde_path_to_error::deserialize(&mut des)
        .with_context(|| format!("Unable to parse items at {}", path.display()))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();
    let dungeon = Arc::new(Dungeon::load(&args.dungeon)?);
    let settings = match &args.settings {
        Some(path) => load_tracker_settings(path)?,
        None => TrackerSettings::default(),
    };
    let items = match &args.items {
        Some(path) => load_items(path)?,
        None => ItemState::default(),
    };
    let mut config = EngineConfig::default();
    if let Some(max_workers) = args.max_workers {
        config.max_workers = max_workers;
    }
    info!(
        "{}: {} nodes, {} key doors, {} workers",
        dungeon.name,
        dungeon.num_nodes(),
        dungeon.key_doors.len(),
        config.max_workers
    );

    let engine = DungeonEngine::new(dungeon, &config)?;
    if args.states {
        let states = engine.terminal_states(&settings, &items)?;
        info!("{} terminal states", states.len());
        for state in &states {
            let doors: Vec<&str> = state
                .unlocked_doors()
                .iter()
                .map(|&idx| engine.dungeon().key_doors[idx].name.as_str())
                .collect();
            println!(
                "keys={} big_key={} sequence_break={} unlocked={:?}",
                state.keys_collected(),
                state.big_key_collected(),
                state.sequence_break(),
                doors
            );
        }
    } else {
        let verdict = engine.recompute(&settings, &items)?;
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    }
    Ok(())
}
