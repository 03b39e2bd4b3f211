pub mod aggregate;
pub mod dungeon_repository;
pub mod engine;
pub mod evaluator;
pub mod key_door_iterator;
pub mod pool;
pub mod recompute;
pub mod scheduler;
pub mod settings;
