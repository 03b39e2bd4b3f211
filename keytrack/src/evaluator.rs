use std::sync::Arc;

use hashbrown::HashSet;
use keytrack_game::{BossIdx, Dungeon, KeyDoorIdx, KeyLayout, LocationIdx, NodeIdx, Requirement};
use keytrack_logic::{AccessibilityLevel, DungeonResult, DungeonState, ItemState};
use log::debug;

use crate::settings::TrackerSettings;

/// Inputs that stay fixed for the duration of one recompute.
#[derive(Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub settings: &'a TrackerSettings,
    pub items: &'a ItemState,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(settings: &'a TrackerSettings, items: &'a ItemState) -> Self {
        EvaluationContext { settings, items }
    }
}

struct RequirementContext<'a> {
    settings: &'a TrackerSettings,
    items: &'a ItemState,
    doors_unlocked: &'a [bool],
    big_key: bool,
}

fn apply_requirement(req: &Requirement, cx: &RequirementContext) -> AccessibilityLevel {
    match req {
        Requirement::Free => AccessibilityLevel::Normal,
        Requirement::Never => AccessibilityLevel::None,
        Requirement::Item(item) => cx.items.has(*item).into(),
        Requirement::ItemCount(item, count) => (cx.items.count(*item) >= *count).into(),
        Requirement::Setting(flag) => cx.settings.flag(*flag).into(),
        Requirement::NotSetting(flag) => (!cx.settings.flag(*flag)).into(),
        Requirement::SequenceBreak(break_type) => {
            if cx.settings.sequence_breaks.is_enabled(*break_type) {
                AccessibilityLevel::SequenceBreak
            } else {
                AccessibilityLevel::None
            }
        }
        Requirement::KeyDoor(door_idx) => cx.doors_unlocked[*door_idx].into(),
        Requirement::BigKey => cx.big_key.into(),
        Requirement::And(sub_reqs) => {
            let mut level = AccessibilityLevel::Normal;
            for r in sub_reqs {
                level = level.min(apply_requirement(r, cx));
                if level == AccessibilityLevel::None {
                    break;
                }
            }
            level
        }
        Requirement::Or(sub_reqs) => {
            let mut level = AccessibilityLevel::None;
            for r in sub_reqs {
                level = level.max(apply_requirement(r, cx));
                if level == AccessibilityLevel::Normal {
                    break;
                }
            }
            level
        }
    }
}

/// A reusable working copy of one dungeon's graph.
///
/// `apply_state` overwrites everything derived from the previous state, so an instance can be
/// handed from one hypothesis to the next without carrying anything over.
pub struct MutableDungeon {
    dungeon: Arc<Dungeon>,
    doors_unlocked: Vec<bool>,
    big_key: bool,
    node_levels: Vec<AccessibilityLevel>,
}

impl MutableDungeon {
    pub fn new(dungeon: Arc<Dungeon>) -> Self {
        let num_doors = dungeon.key_doors.len();
        let num_nodes = dungeon.num_nodes();
        MutableDungeon {
            dungeon,
            doors_unlocked: vec![false; num_doors],
            big_key: false,
            node_levels: vec![AccessibilityLevel::None; num_nodes],
        }
    }

    pub fn dungeon(&self) -> &Dungeon {
        &self.dungeon
    }

    fn requirement_context<'a>(&'a self, cx: &EvaluationContext<'a>) -> RequirementContext<'a> {
        RequirementContext {
            settings: cx.settings,
            items: cx.items,
            doors_unlocked: &self.doors_unlocked,
            big_key: self.big_key,
        }
    }

    pub fn apply_state(&mut self, state: &DungeonState, cx: &EvaluationContext) {
        self.doors_unlocked.fill(false);
        for &door_idx in state.unlocked_doors() {
            self.doors_unlocked[door_idx] = true;
        }
        self.big_key = state.big_key_collected();
        self.derive_node_levels(cx);
    }

    // Forward fixed point: a node's level is the best, over its inbound connections, of the
    // weaker of the source level and the connection requirement. Levels only ever rise, so
    // propagating from the modified nodes until nothing changes terminates.
    fn derive_node_levels(&mut self, cx: &EvaluationContext) {
        // Built inline rather than via requirement_context(): node_levels is borrowed mutably below.
        let req_cx = RequirementContext {
            settings: cx.settings,
            items: cx.items,
            doors_unlocked: &self.doors_unlocked,
            big_key: self.big_key,
        };
        let dungeon = &self.dungeon;
        let node_levels = &mut self.node_levels;
        node_levels.fill(AccessibilityLevel::None);
        node_levels[dungeon.entry_node_idx] = AccessibilityLevel::Normal;

        let mut modified_nodes: HashSet<NodeIdx> = HashSet::new();
        modified_nodes.insert(dungeon.entry_node_idx);
        while !modified_nodes.is_empty() {
            let mut new_modified_nodes: HashSet<NodeIdx> = HashSet::new();
            let modified_nodes_vec = {
                // Sorted so that the pass is deterministic.
                let mut m: Vec<NodeIdx> = modified_nodes.into_iter().collect();
                m.sort();
                m
            };
            for &src_idx in &modified_nodes_vec {
                let src_level = node_levels[src_idx];
                for conn in &dungeon.connections_by_src[src_idx] {
                    let dst_idx = conn.to_node_idx;
                    if node_levels[dst_idx] >= src_level {
                        continue;
                    }
                    let level = src_level.min(apply_requirement(&conn.requirement, &req_cx));
                    if level > node_levels[dst_idx] {
                        node_levels[dst_idx] = level;
                        new_modified_nodes.insert(dst_idx);
                    }
                }
            }
            modified_nodes = new_modified_nodes;
        }
    }

    pub fn node_level(&self, node_idx: NodeIdx) -> AccessibilityLevel {
        self.node_levels[node_idx]
    }

    pub fn location_level(&self, location_idx: LocationIdx, cx: &EvaluationContext) -> AccessibilityLevel {
        let location = &self.dungeon.locations[location_idx];
        let node_level = self.node_levels[location.node_idx];
        if node_level == AccessibilityLevel::None {
            return node_level;
        }
        node_level.min(apply_requirement(
            &location.requirement,
            &self.requirement_context(cx),
        ))
    }

    pub fn boss_level(&self, boss_idx: BossIdx, cx: &EvaluationContext) -> AccessibilityLevel {
        let boss = &self.dungeon.bosses[boss_idx];
        let node_level = self.node_levels[boss.node_idx];
        if node_level == AccessibilityLevel::None {
            return node_level;
        }
        node_level.min(apply_requirement(&boss.requirement, &self.requirement_context(cx)))
    }

    fn requirement_met(&self, req: &Requirement, sequence_break: bool, cx: &EvaluationContext) -> bool {
        apply_requirement(req, &self.requirement_context(cx)).is_reachable(sequence_break)
    }

    /// Small keys that are fixed in place (unshuffled key drops) and currently reachable.
    pub fn available_small_keys(&self, sequence_break: bool, cx: &EvaluationContext) -> usize {
        if cx.settings.key_drop_shuffle {
            return 0;
        }
        (0..self.dungeon.locations.len())
            .filter(|&i| {
                self.dungeon.locations[i].key_drop
                    && self.location_level(i, cx).is_reachable(sequence_break)
            })
            .count()
    }

    /// Locked doors that the player can currently walk up to.
    pub fn accessible_key_doors(&self, sequence_break: bool) -> Vec<KeyDoorIdx> {
        let mut out: Vec<KeyDoorIdx> = Vec::new();
        for (door_idx, door) in self.dungeon.key_doors.iter().enumerate() {
            if self.doors_unlocked[door_idx] {
                continue;
            }
            if door
                .locked_side_node_idxs
                .iter()
                .any(|&n| self.node_levels[n].is_reachable(sequence_break))
            {
                out.push(door_idx);
            }
        }
        out
    }

    fn count_reachable_locations(&self, sequence_break: bool, cx: &EvaluationContext) -> usize {
        let key_drop_shuffle = cx.settings.key_drop_shuffle;
        (0..self.dungeon.locations.len())
            .filter(|&i| {
                self.dungeon.is_item_location(i, key_drop_shuffle)
                    && self.location_level(i, cx).is_reachable(sequence_break)
            })
            .count()
    }

    fn chest_key_pool(&self, cx: &EvaluationContext) -> usize {
        if cx.settings.small_keys_in_pool() {
            self.dungeon.max_small_keys(cx.settings.key_drop_shuffle)
        } else {
            0
        }
    }

    fn big_key_in_pool(&self, cx: &EvaluationContext) -> bool {
        self.dungeon.big_key && cx.settings.big_key_in_pool()
    }

    // Keys the state says were picked up from this dungeon's own item locations.
    fn held_chest_keys(&self, state: &DungeonState, cx: &EvaluationContext) -> usize {
        if cx.settings.small_keys_in_pool() {
            state.keys_collected()
        } else {
            0
        }
    }

    /// Checks that the applied state is a placement of the dungeon's keys that could exist.
    /// Returns false for states that are to be discarded.
    pub fn validate_key_layout(&self, state: &DungeonState, cx: &EvaluationContext) -> bool {
        let sequence_break = state.sequence_break();
        let num_locations = self.dungeon.num_item_locations(cx.settings.key_drop_shuffle);
        let reachable = self.count_reachable_locations(sequence_break, cx);
        let unreachable = num_locations - reachable;
        let key_pool = self.chest_key_pool(cx);
        let big_key_in_pool = self.big_key_in_pool(cx);

        let held_keys = self.held_chest_keys(state, cx);
        if held_keys > key_pool {
            debug!(
                "{}: {} keys collected but only {} in the pool",
                self.dungeon.name, held_keys, key_pool
            );
            return false;
        }
        let held_big_key = (big_key_in_pool && state.big_key_collected()) as usize;
        if held_keys + held_big_key > reachable {
            return false;
        }
        let missing_big_key = (big_key_in_pool && !state.big_key_collected()) as usize;
        if key_pool - held_keys + missing_big_key > unreachable {
            return false;
        }

        if self.dungeon.key_layouts.is_empty() {
            return true;
        }
        self.dungeon
            .key_layouts
            .iter()
            .any(|layout| self.validate_layout(layout, state, cx))
    }

    fn validate_layout(&self, layout: &KeyLayout, state: &DungeonState, cx: &EvaluationContext) -> bool {
        let sequence_break = state.sequence_break();
        let children = match layout {
            KeyLayout::End => return true,
            KeyLayout::SmallKey {
                count,
                locations,
                requirement,
                children,
            } => {
                if cx.settings.small_keys_in_pool()
                    && self.requirement_met(requirement, sequence_break, cx)
                {
                    let inaccessible = locations
                        .iter()
                        .filter(|&&i| !self.location_level(i, cx).is_reachable(sequence_break))
                        .count();
                    if state.keys_collected() < count.saturating_sub(inaccessible) {
                        return false;
                    }
                }
                children
            }
            KeyLayout::BigKey {
                locations,
                requirement,
                children,
            } => {
                if self.big_key_in_pool(cx) && self.requirement_met(requirement, sequence_break, cx) {
                    let accessible = locations
                        .iter()
                        .filter(|&&i| self.location_level(i, cx).is_reachable(sequence_break))
                        .count();
                    if accessible == locations.len() && !state.big_key_collected() {
                        return false;
                    }
                    if accessible == 0 && state.big_key_collected() {
                        return false;
                    }
                }
                children
            }
        };
        children.is_empty()
            || children
                .iter()
                .any(|child| self.validate_layout(child, state, cx))
    }

    pub fn get_dungeon_result(&self, state: &DungeonState, cx: &EvaluationContext) -> DungeonResult {
        let sequence_break = state.sequence_break();
        let key_drop_shuffle = cx.settings.key_drop_shuffle;
        let num_locations = self.dungeon.num_item_locations(key_drop_shuffle);
        let reachable = self.count_reachable_locations(sequence_break, cx);
        let big_key_in_pool = self.big_key_in_pool(cx);

        let held_keys = self.held_chest_keys(state, cx);
        let held_big_key = (big_key_in_pool && state.big_key_collected()) as usize;
        let missing_keys = self.chest_key_pool(cx).saturating_sub(held_keys)
            + (big_key_in_pool && !state.big_key_collected()) as usize;
        let map_compass = if cx.settings.map_compass_shuffle {
            0
        } else {
            self.dungeon.map as usize + self.dungeon.compass as usize
        };

        let mut visible = false;
        for (i, location) in self.dungeon.locations.iter().enumerate() {
            if !self.dungeon.is_item_location(i, key_drop_shuffle) {
                continue;
            }
            if let Some(node_idx) = location.visible_from {
                if self.node_levels[node_idx].is_reachable(sequence_break)
                    && !self.location_level(i, cx).is_reachable(sequence_break)
                {
                    visible = true;
                    break;
                }
            }
        }

        let bosses = (0..self.dungeon.bosses.len())
            .map(|i| {
                let level = self.boss_level(i, cx);
                if level.is_reachable(sequence_break) {
                    level
                } else {
                    AccessibilityLevel::None
                }
            })
            .collect();

        DungeonResult {
            accessible: reachable.saturating_sub(held_keys + held_big_key),
            minimum_inaccessible: (num_locations - reachable)
                .saturating_sub(missing_keys + map_compass),
            bosses,
            sequence_break,
            visible,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keytrack_game::{Item, SequenceBreakType};

    // Entrance -[Door A]-> Middle -[Door B]-> Back, with a dark room off the entrance.
    const CHAIN_DUNGEON: &str = r#"{
        "id": "HyruleCastle",
        "nodes": ["Entrance", "Middle", "Back", "Dark"],
        "entry": "Entrance",
        "smallKeys": 1,
        "connections": [
            {"from": "Entrance", "to": "Dark", "requires": {"or": ["Lamp", {"sequenceBreak": "DarkRoomHC"}]}}
        ],
        "keyDoors": [
            {"name": "Door A", "from": "Entrance", "to": "Middle"},
            {"name": "Door B", "from": "Middle", "to": "Back"}
        ],
        "locations": [
            {"name": "Front Chest", "node": "Entrance"},
            {"name": "Middle Chest", "node": "Middle"},
            {"name": "Back Chest", "node": "Back", "visibleFrom": "Middle"},
            {"name": "Dark Drop", "node": "Dark", "keyDrop": true}
        ],
        "bosses": [{"name": "Boss", "node": "Back", "requires": "Hammer"}]
    }"#;

    fn chain_dungeon() -> MutableDungeon {
        MutableDungeon::new(Arc::new(Dungeon::parse_str(CHAIN_DUNGEON).unwrap()))
    }

    #[test]
    fn test_apply_state_chain() {
        let mut ev = chain_dungeon();
        let settings = TrackerSettings::default();
        let items = ItemState::default();
        let cx = EvaluationContext::new(&settings, &items);

        let state = DungeonState::new(1, false, false);
        ev.apply_state(&state, &cx);
        assert_eq!(ev.node_level(0), AccessibilityLevel::Normal);
        assert_eq!(ev.node_level(1), AccessibilityLevel::None);
        assert_eq!(ev.node_level(3), AccessibilityLevel::SequenceBreak);
        assert_eq!(ev.accessible_key_doors(false), vec![0]);
        assert_eq!(ev.available_small_keys(false, &cx), 0);
        assert_eq!(ev.available_small_keys(true, &cx), 1);

        let state = state.with_unlocked_door(0).with_unlocked_door(1);
        ev.apply_state(&state, &cx);
        assert_eq!(ev.node_level(2), AccessibilityLevel::Normal);
        assert!(ev.accessible_key_doors(true).is_empty());

        // A fresh state must not see the doors opened by the previous one.
        ev.apply_state(&DungeonState::new(0, false, false), &cx);
        assert_eq!(ev.node_level(1), AccessibilityLevel::None);
        assert_eq!(ev.node_level(2), AccessibilityLevel::None);
    }

    #[test]
    fn test_disabled_sequence_break() {
        let mut ev = chain_dungeon();
        let mut settings = TrackerSettings::default();
        settings
            .sequence_breaks
            .set_enabled(SequenceBreakType::DarkRoomHC, false);
        let mut items = ItemState::default();
        let cx = EvaluationContext::new(&settings, &items);
        ev.apply_state(&DungeonState::new(0, false, true), &cx);
        assert_eq!(ev.node_level(3), AccessibilityLevel::None);

        items.collect(Item::Lamp);
        let cx = EvaluationContext::new(&settings, &items);
        ev.apply_state(&DungeonState::new(0, false, false), &cx);
        assert_eq!(ev.node_level(3), AccessibilityLevel::Normal);
        assert_eq!(ev.available_small_keys(false, &cx), 1);
    }

    #[test]
    fn test_validate_key_pool() {
        let mut ev = chain_dungeon();
        let settings = TrackerSettings::default();
        let items = ItemState::default();
        let cx = EvaluationContext::new(&settings, &items);

        // Only one chest key exists.
        let state = DungeonState::new(2, false, false);
        ev.apply_state(&state, &cx);
        assert!(!ev.validate_key_layout(&state, &cx));

        // With nothing open, the key can still be behind Door A.
        let state = DungeonState::new(0, false, false);
        ev.apply_state(&state, &cx);
        assert!(ev.validate_key_layout(&state, &cx));

        // Everything reachable: the key must have been collected.
        let state = DungeonState::new(0, false, false)
            .with_unlocked_door(0)
            .with_unlocked_door(1);
        ev.apply_state(&state, &cx);
        assert!(!ev.validate_key_layout(&state, &cx));
    }

    // Entrance -[Door]-> Inner, with one chest on each side.
    fn locked_dungeon(extra: &str) -> MutableDungeon {
        let dungeon_str = format!(
            r#"{{
                "id": "IcePalace",
                "nodes": ["Entrance", "Inner"],
                "entry": "Entrance",
                "keyDoors": [{{"name": "Door", "from": "Entrance", "to": "Inner"}}],
                "locations": [
                    {{"name": "Front", "node": "Entrance"}},
                    {{"name": "Back", "node": "Inner"}}
                ],
                {extra}
            }}"#
        );
        MutableDungeon::new(Arc::new(Dungeon::parse_str(&dungeon_str).unwrap()))
    }

    #[test]
    fn test_held_keys_limited_by_reachable_locations() {
        let mut ev = locked_dungeon(r#""smallKeys": 1, "bigKey": true"#);
        let settings = TrackerSettings::default();
        let items = ItemState::default();
        let cx = EvaluationContext::new(&settings, &items);

        // Only the front chest is reachable, so the small key and big key cannot both be held.
        let state = DungeonState::new(1, true, false);
        ev.apply_state(&state, &cx);
        assert!(!ev.validate_key_layout(&state, &cx));

        let state = DungeonState::new(1, false, false);
        ev.apply_state(&state, &cx);
        assert!(ev.validate_key_layout(&state, &cx));
    }

    #[test]
    fn test_big_key_behind_locked_door() {
        let mut ev = locked_dungeon(
            r#""bigKey": true, "keyLayouts": [{"bigKey": {"locations": ["Back"]}}]"#,
        );
        let settings = TrackerSettings::default();
        let items = ItemState::default();
        let cx = EvaluationContext::new(&settings, &items);

        let state = DungeonState::new(0, true, false);
        ev.apply_state(&state, &cx);
        assert!(!ev.validate_key_layout(&state, &cx));

        let state = DungeonState::new(0, false, false);
        ev.apply_state(&state, &cx);
        assert!(ev.validate_key_layout(&state, &cx));
    }

    #[test]
    fn test_dungeon_result() {
        let mut ev = chain_dungeon();
        let settings = TrackerSettings::default();
        let mut items = ItemState::default();
        items.collect(Item::Hammer);
        let cx = EvaluationContext::new(&settings, &items);

        let state = DungeonState::new(1, false, false).with_unlocked_door(0);
        ev.apply_state(&state, &cx);
        let result = ev.get_dungeon_result(&state, &cx);
        assert_eq!(result.accessible, 1);
        assert_eq!(result.minimum_inaccessible, 1);
        assert_eq!(result.bosses, vec![AccessibilityLevel::None]);
        assert!(result.visible);
        assert!(!result.sequence_break);

        let state = state.with_unlocked_door(1);
        ev.apply_state(&state, &cx);
        let result = ev.get_dungeon_result(&state, &cx);
        assert_eq!(result.accessible, 2);
        assert_eq!(result.minimum_inaccessible, 0);
        assert_eq!(result.bosses, vec![AccessibilityLevel::Normal]);
        assert!(!result.visible);
    }
}
