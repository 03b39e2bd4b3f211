use hashbrown::HashMap;
use keytrack_game::{DungeonId, Item, KeyDoorIdx};
use serde::{Deserialize, Serialize};

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum AccessibilityLevel {
    #[default]
    None,
    Inspect,
    Partial,
    SequenceBreak,
    Normal,
    Cleared,
}

impl AccessibilityLevel {
    // Whether something at this level can be obtained, given whether sequence breaks are allowed.
    pub fn is_reachable(self, sequence_break: bool) -> bool {
        if sequence_break {
            self >= AccessibilityLevel::SequenceBreak
        } else {
            self >= AccessibilityLevel::Normal
        }
    }
}

impl From<bool> for AccessibilityLevel {
    fn from(value: bool) -> Self {
        if value {
            AccessibilityLevel::Normal
        } else {
            AccessibilityLevel::None
        }
    }
}

/// One hypothesis about a dungeon: which key doors have been unlocked, how many small keys
/// have been collected and whether the big key is held. Sequence breaks being allowed is part
/// of the hypothesis, so each layout is explored both with and without them.
///
/// States are never modified after creation; expanding a state produces a new one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DungeonState {
    // Kept sorted, so that equality does not depend on the order doors were opened in.
    unlocked_doors: Vec<KeyDoorIdx>,
    keys_collected: usize,
    big_key_collected: bool,
    sequence_break: bool,
}

impl DungeonState {
    pub fn new(keys_collected: usize, big_key_collected: bool, sequence_break: bool) -> Self {
        DungeonState {
            unlocked_doors: vec![],
            keys_collected,
            big_key_collected,
            sequence_break,
        }
    }

    pub fn unlocked_doors(&self) -> &[KeyDoorIdx] {
        &self.unlocked_doors
    }

    pub fn keys_collected(&self) -> usize {
        self.keys_collected
    }

    pub fn big_key_collected(&self) -> bool {
        self.big_key_collected
    }

    pub fn sequence_break(&self) -> bool {
        self.sequence_break
    }

    /// Returns a new state with one more door unlocked.
    ///
    /// Panics if the door is already unlocked: the expansion only ever offers locked doors.
    pub fn with_unlocked_door(&self, door_idx: KeyDoorIdx) -> DungeonState {
        let pos = match self.unlocked_doors.binary_search(&door_idx) {
            Ok(_) => panic!("Key door {door_idx} is already unlocked"),
            Err(pos) => pos,
        };
        let mut unlocked_doors = Vec::with_capacity(self.unlocked_doors.len() + 1);
        unlocked_doors.extend_from_slice(&self.unlocked_doors[..pos]);
        unlocked_doors.push(door_idx);
        unlocked_doors.extend_from_slice(&self.unlocked_doors[pos..]);
        DungeonState {
            unlocked_doors,
            ..*self
        }
    }
}

/// Accessibility outcome of one valid terminal state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DungeonResult {
    // Reachable item locations, excluding the keys that the state says were collected there.
    pub accessible: usize,
    // Unreachable item locations that must hold real items, after setting aside the keys,
    // map and compass that could still be hidden in them.
    pub minimum_inaccessible: usize,
    pub bosses: Vec<AccessibilityLevel>,
    pub sequence_break: bool,
    pub visible: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DungeonItems {
    #[serde(default)]
    pub small_keys: usize,
    #[serde(default)]
    pub big_key: bool,
    // Item locations already checked by the player.
    #[serde(default)]
    pub checked: usize,
}

/// Snapshot of what the player currently has.
///
/// `small_keys` is the effective count: with generic keys it is the shared pool.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemState {
    #[serde(default)]
    pub items: HashMap<Item, u8>,
    #[serde(default)]
    pub dungeons: HashMap<DungeonId, DungeonItems>,
}

impl ItemState {
    pub fn count(&self, item: Item) -> u8 {
        self.items.get(&item).copied().unwrap_or(0)
    }

    pub fn has(&self, item: Item) -> bool {
        self.count(item) > 0
    }

    pub fn dungeon(&self, dungeon_id: DungeonId) -> DungeonItems {
        self.dungeons.get(&dungeon_id).copied().unwrap_or_default()
    }

    pub fn collect(&mut self, item: Item) {
        let count = self.items.entry(item).or_insert(0);
        if item.is_progressive() {
            *count = count.saturating_add(1);
        } else {
            *count = 1;
        }
    }

    pub fn dungeon_mut(&mut self, dungeon_id: DungeonId) -> &mut DungeonItems {
        self.dungeons.entry(dungeon_id).or_default()
    }
}
