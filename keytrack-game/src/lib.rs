// The changes suggested by this lint usually make the code more cluttered and less clear:
#![allow(clippy::needless_range_loop)]

use anyhow::{bail, ensure, Context, Result};
use hashbrown::HashMap;
use json::JsonValue;
use log::debug;
use serde::{Deserialize, Serialize};
use std::borrow::ToOwned;
use std::fs::File;
use std::hash::Hash;
use std::path::Path;
use std::str::FromStr;
use strum_macros::{EnumString, VariantNames};

pub type NodeIdx = usize; // Index into Dungeon.node_isv.keys
pub type KeyDoorIdx = usize; // Index into Dungeon.key_doors
pub type LocationIdx = usize; // Index into Dungeon.locations: chests, standing items and key drops
pub type BossIdx = usize; // Index into Dungeon.bosses

#[derive(Default, Clone, Debug)]
pub struct IndexedVec<T: Hash + Eq> {
    pub keys: Vec<T>,
    pub index_by_key: HashMap<T, usize>,
}

impl<T: Hash + Eq> IndexedVec<T> {
    pub fn add<U: ToOwned<Owned = T> + ?Sized>(&mut self, name: &U) -> usize {
        if !self.index_by_key.contains_key(&name.to_owned()) {
            let idx = self.keys.len();
            self.index_by_key.insert(name.to_owned(), self.keys.len());
            self.keys.push(name.to_owned());
            idx
        } else {
            self.index_by_key[&name.to_owned()]
        }
    }
}

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
    PartialOrd,
    Ord,
)]
pub enum Item {
    Bow,
    Boomerang,
    Hookshot,
    Bombs,
    Powder,
    FireRod,
    IceRod,
    Bombos,
    Ether,
    Quake,
    Lamp,
    Hammer,
    Flute,
    Net,
    Book,
    Bottle,
    Somaria,
    Byrna,
    Cape,
    Mirror,
    Boots,
    Gloves, // progressive: 1 = Power Glove, 2 = Titan's Mitt
    Flippers,
    MoonPearl,
    Sword, // progressive: 1..=4
    Shield,
    Mail,
    Shovel,
    Mushroom,
    HalfMagic,
}

impl Item {
    pub fn is_progressive(self) -> bool {
        [Item::Gloves, Item::Sword, Item::Shield, Item::Mail].contains(&self)
    }
}

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
    PartialOrd,
    Ord,
)]
pub enum DungeonId {
    HyruleCastle,
    AgahnimsTower,
    EasternPalace,
    DesertPalace,
    TowerOfHera,
    PalaceOfDarkness,
    SwampPalace,
    SkullWoods,
    ThievesTown,
    IcePalace,
    MiseryMire,
    TurtleRock,
    GanonsTower,
}

// Tracker mode flags that dungeon logic can branch on.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, EnumString, VariantNames, Serialize, Deserialize,
)]
pub enum ModeFlag {
    SmallKeyShuffle,
    BigKeyShuffle,
    KeyDropShuffle,
    GenericKeys,
    MapCompassShuffle,
}

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
    PartialOrd,
    Ord,
)]
pub enum SequenceBreakType {
    BombDuplicationAncillaOverload,
    BombDuplicationMirror,
    BombJumpPoDHammerJump,
    BombJumpSWBigChest,
    BombJumpIPBJ,
    BombJumpIPHookshotGap,
    BombJumpIPFreezorRoomGap,
    DarkRoomHC,
    DarkRoomAT,
    DarkRoomEPRight,
    DarkRoomEPBack,
    DarkRoomPoDDarkBasement,
    DarkRoomPoDDarkMaze,
    DarkRoomPoDBossArea,
    DarkRoomMM,
    DarkRoomTR,
    FakeFlippersSplashDeletion,
    IPIceBreaker,
    MMSideArea,
    SWBigChestSkip,
    TRLaserSkip,
    TRPipeSkip,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Requirement {
    Free,
    Never,
    Item(Item),
    ItemCount(Item, u8),
    Setting(ModeFlag),
    NotSetting(ModeFlag),
    SequenceBreak(SequenceBreakType),
    KeyDoor(KeyDoorIdx),
    BigKey,
    And(Vec<Requirement>),
    Or(Vec<Requirement>),
}

impl Requirement {
    pub fn make_and(reqs: Vec<Requirement>) -> Requirement {
        let mut out_reqs: Vec<Requirement> = vec![];
        for req in reqs {
            if let Requirement::Never = req {
                return Requirement::Never;
            } else if let Requirement::Free = req {
                continue;
            } else if let Requirement::And(and_reqs) = req {
                out_reqs.extend(and_reqs);
            } else {
                out_reqs.push(req);
            }
        }
        if out_reqs.is_empty() {
            Requirement::Free
        } else if out_reqs.len() == 1 {
            out_reqs.into_iter().next().unwrap()
        } else {
            Requirement::And(out_reqs)
        }
    }

    pub fn make_or(reqs: Vec<Requirement>) -> Requirement {
        let mut out_reqs: Vec<Requirement> = vec![];
        for req in reqs {
            if let Requirement::Never = req {
                continue;
            } else if let Requirement::Free = req {
                return Requirement::Free;
            } else if let Requirement::Or(or_reqs) = req {
                out_reqs.extend(or_reqs);
            } else {
                out_reqs.push(req);
            }
        }
        if out_reqs.is_empty() {
            Requirement::Never
        } else if out_reqs.len() == 1 {
            out_reqs.into_iter().next().unwrap()
        } else {
            Requirement::Or(out_reqs)
        }
    }
}

#[derive(Clone, Debug)]
pub struct Connection {
    pub from_node_idx: NodeIdx,
    pub to_node_idx: NodeIdx,
    pub requirement: Requirement,
}

#[derive(Clone, Debug)]
pub struct KeyDoor {
    pub name: String,
    // Nodes from which the door can be unlocked. Bidirectional doors list both sides.
    pub locked_side_node_idxs: Vec<NodeIdx>,
}

#[derive(Clone, Debug)]
pub struct Location {
    pub name: String,
    pub node_idx: NodeIdx,
    pub requirement: Requirement,
    // Node from which the location can be seen without being collected.
    pub visible_from: Option<NodeIdx>,
    // Enemy/pot key drops are fixed small keys unless key drops are shuffled.
    pub key_drop: bool,
}

#[derive(Clone, Debug)]
pub struct Boss {
    pub name: String,
    pub node_idx: NodeIdx,
    pub requirement: Requirement,
}

#[derive(Clone, Debug)]
pub enum KeyLayout {
    End,
    SmallKey {
        count: usize,
        locations: Vec<LocationIdx>,
        requirement: Requirement,
        children: Vec<KeyLayout>,
    },
    BigKey {
        locations: Vec<LocationIdx>,
        requirement: Requirement,
        children: Vec<KeyLayout>,
    },
}

#[derive(Clone, Debug)]
pub struct Dungeon {
    pub id: DungeonId,
    pub name: String,
    pub node_isv: IndexedVec<String>,
    pub entry_node_idx: NodeIdx,
    pub connections_by_src: Vec<Vec<Connection>>,
    pub key_door_isv: IndexedVec<String>,
    pub key_doors: Vec<KeyDoor>,
    pub location_isv: IndexedVec<String>,
    pub locations: Vec<Location>,
    pub bosses: Vec<Boss>,
    // Small keys placed in chests (key drops excluded).
    pub small_key_count: usize,
    pub big_key: bool,
    pub map: bool,
    pub compass: bool,
    pub key_layouts: Vec<KeyLayout>,
}

impl Dungeon {
    pub fn num_nodes(&self) -> usize {
        self.node_isv.keys.len()
    }

    pub fn num_key_drops(&self) -> usize {
        self.locations.iter().filter(|loc| loc.key_drop).count()
    }

    // Size of the small key pool that is placed among the dungeon's item locations.
    pub fn max_small_keys(&self, key_drop_shuffle: bool) -> usize {
        if key_drop_shuffle {
            self.small_key_count + self.num_key_drops()
        } else {
            self.small_key_count
        }
    }

    pub fn is_item_location(&self, location_idx: LocationIdx, key_drop_shuffle: bool) -> bool {
        key_drop_shuffle || !self.locations[location_idx].key_drop
    }

    pub fn num_item_locations(&self, key_drop_shuffle: bool) -> usize {
        (0..self.locations.len())
            .filter(|&i| self.is_item_location(i, key_drop_shuffle))
            .count()
    }

    pub fn load(path: &Path) -> Result<Dungeon> {
        let dungeon_json = read_json(path)?;
        let dungeon =
            Dungeon::parse(&dungeon_json).with_context(|| format!("loading {}", path.display()))?;
        debug!(
            "{}: {} nodes, {} key doors, {} locations",
            dungeon.name,
            dungeon.num_nodes(),
            dungeon.key_doors.len(),
            dungeon.locations.len()
        );
        Ok(dungeon)
    }

    pub fn parse_str(dungeon_str: &str) -> Result<Dungeon> {
        let dungeon_json = json::parse(dungeon_str).context("unable to parse dungeon JSON")?;
        Dungeon::parse(&dungeon_json)
    }

    pub fn parse(dungeon_json: &JsonValue) -> Result<Dungeon> {
        let mut parser = DungeonParser::default();
        parser.parse(dungeon_json)
    }
}

pub fn read_json(path: &Path) -> Result<JsonValue> {
    let file = File::open(path).with_context(|| format!("unable to open {}", path.display()))?;
    let json_str = std::io::read_to_string(file)
        .with_context(|| format!("unable to read {}", path.display()))?;
    let json_data =
        json::parse(&json_str).with_context(|| format!("unable to parse {}", path.display()))?;
    Ok(json_data)
}

fn get_str<'a>(value: &'a JsonValue, key: &str) -> Result<&'a str> {
    value[key]
        .as_str()
        .with_context(|| format!("missing/invalid '{key}' in {value}"))
}

#[derive(Default)]
struct DungeonParser {
    node_isv: IndexedVec<String>,
    key_door_isv: IndexedVec<String>,
    location_isv: IndexedVec<String>,
}

impl DungeonParser {
    fn parse(&mut self, dungeon_json: &JsonValue) -> Result<Dungeon> {
        let id_str = get_str(dungeon_json, "id")?;
        let id = DungeonId::from_str(id_str)
            .with_context(|| format!("Unrecognized dungeon id '{id_str}'"))?;
        let name = dungeon_json["name"].as_str().unwrap_or(id_str).to_string();

        ensure!(dungeon_json["nodes"].is_array(), "missing 'nodes' in {name}");
        for node_json in dungeon_json["nodes"].members() {
            let node_name = node_json
                .as_str()
                .with_context(|| format!("invalid node {node_json}"))?;
            ensure!(
                !self.node_isv.index_by_key.contains_key(node_name),
                "Duplicate node '{node_name}'"
            );
            self.node_isv.add(node_name);
        }
        let entry_node_idx = self.node_idx(get_str(dungeon_json, "entry")?)?;

        // Names are registered first so that requirements may refer to any door or location.
        for door_json in dungeon_json["keyDoors"].members() {
            let door_name = get_str(door_json, "name")?;
            ensure!(
                !self.key_door_isv.index_by_key.contains_key(door_name),
                "Duplicate key door '{door_name}'"
            );
            self.key_door_isv.add(door_name);
        }
        for location_json in dungeon_json["locations"].members() {
            let location_name = get_str(location_json, "name")?;
            ensure!(
                !self.location_isv.index_by_key.contains_key(location_name),
                "Duplicate location '{location_name}'"
            );
            self.location_isv.add(location_name);
        }

        let num_nodes = self.node_isv.keys.len();
        let mut connections_by_src: Vec<Vec<Connection>> = vec![Vec::new(); num_nodes];
        for conn_json in dungeon_json["connections"].members() {
            let from_node_idx = self.node_idx(get_str(conn_json, "from")?)?;
            let to_node_idx = self.node_idx(get_str(conn_json, "to")?)?;
            let requirement = self
                .parse_optional_requirement(&conn_json["requires"])
                .with_context(|| format!("Processing connection {conn_json}"))?;
            if conn_json["bidirectional"].as_bool().unwrap_or(false) {
                connections_by_src[to_node_idx].push(Connection {
                    from_node_idx: to_node_idx,
                    to_node_idx: from_node_idx,
                    requirement: requirement.clone(),
                });
            }
            connections_by_src[from_node_idx].push(Connection {
                from_node_idx,
                to_node_idx,
                requirement,
            });
        }

        let mut key_doors: Vec<KeyDoor> = Vec::new();
        for (door_idx, door_json) in dungeon_json["keyDoors"].members().enumerate() {
            let door_name = get_str(door_json, "name")?;
            let from_node_idx = self.node_idx(get_str(door_json, "from")?)?;
            let to_node_idx = self.node_idx(get_str(door_json, "to")?)?;
            let requirement = Requirement::make_and(vec![
                Requirement::KeyDoor(door_idx),
                self.parse_optional_requirement(&door_json["requires"])
                    .with_context(|| format!("Processing key door '{door_name}'"))?,
            ]);
            let mut locked_side_node_idxs = vec![from_node_idx];
            if door_json["bidirectional"].as_bool().unwrap_or(false) {
                locked_side_node_idxs.push(to_node_idx);
                connections_by_src[to_node_idx].push(Connection {
                    from_node_idx: to_node_idx,
                    to_node_idx: from_node_idx,
                    requirement: requirement.clone(),
                });
            }
            connections_by_src[from_node_idx].push(Connection {
                from_node_idx,
                to_node_idx,
                requirement,
            });
            key_doors.push(KeyDoor {
                name: door_name.to_string(),
                locked_side_node_idxs,
            });
        }

        let mut locations: Vec<Location> = Vec::new();
        for location_json in dungeon_json["locations"].members() {
            let location_name = get_str(location_json, "name")?;
            let visible_from = match location_json["visibleFrom"].as_str() {
                Some(node_name) => Some(self.node_idx(node_name)?),
                None => None,
            };
            locations.push(Location {
                name: location_name.to_string(),
                node_idx: self.node_idx(get_str(location_json, "node")?)?,
                requirement: self
                    .parse_optional_requirement(&location_json["requires"])
                    .with_context(|| format!("Processing location '{location_name}'"))?,
                visible_from,
                key_drop: location_json["keyDrop"].as_bool().unwrap_or(false),
            });
        }

        let mut bosses: Vec<Boss> = Vec::new();
        for boss_json in dungeon_json["bosses"].members() {
            let boss_name = get_str(boss_json, "name")?;
            bosses.push(Boss {
                name: boss_name.to_string(),
                node_idx: self.node_idx(get_str(boss_json, "node")?)?,
                requirement: self
                    .parse_optional_requirement(&boss_json["requires"])
                    .with_context(|| format!("Processing boss '{boss_name}'"))?,
            });
        }

        let small_key_count = dungeon_json["smallKeys"].as_usize().unwrap_or(0);
        let big_key = dungeon_json["bigKey"].as_bool().unwrap_or(false);
        let num_key_drops = locations.iter().filter(|loc| loc.key_drop).count();
        let num_chests = locations.len() - num_key_drops;
        let num_dungeon_items = small_key_count + big_key as usize;
        ensure!(
            num_dungeon_items <= num_chests,
            "{name}: {num_dungeon_items} keys do not fit in {num_chests} chests"
        );

        let mut key_layouts: Vec<KeyLayout> = Vec::new();
        for layout_json in dungeon_json["keyLayouts"].members() {
            key_layouts.push(
                self.parse_key_layout(layout_json)
                    .with_context(|| format!("Processing key layout {layout_json}"))?,
            );
        }

        Ok(Dungeon {
            id,
            name,
            node_isv: std::mem::take(&mut self.node_isv),
            entry_node_idx,
            connections_by_src,
            key_door_isv: std::mem::take(&mut self.key_door_isv),
            key_doors,
            location_isv: std::mem::take(&mut self.location_isv),
            locations,
            bosses,
            small_key_count,
            big_key,
            map: dungeon_json["map"].as_bool().unwrap_or(false),
            compass: dungeon_json["compass"].as_bool().unwrap_or(false),
            key_layouts,
        })
    }

    fn node_idx(&self, name: &str) -> Result<NodeIdx> {
        match self.node_isv.index_by_key.get(name) {
            Some(&idx) => Ok(idx),
            None => bail!("Unrecognized node '{name}'"),
        }
    }

    fn location_idxs(&self, value: &JsonValue) -> Result<Vec<LocationIdx>> {
        ensure!(value.is_array(), "expected location list, got {value}");
        let mut out: Vec<LocationIdx> = Vec::new();
        for name_json in value.members() {
            let name = name_json
                .as_str()
                .with_context(|| format!("invalid location {name_json}"))?;
            match self.location_isv.index_by_key.get(name) {
                Some(&idx) => out.push(idx),
                None => bail!("Unrecognized location '{name}'"),
            }
        }
        Ok(out)
    }

    fn parse_key_layout(&self, layout_json: &JsonValue) -> Result<KeyLayout> {
        if layout_json.as_str() == Some("end") {
            return Ok(KeyLayout::End);
        }
        ensure!(
            layout_json.is_object() && layout_json.len() == 1,
            "Unrecognized key layout {layout_json}"
        );
        let (key, value) = layout_json
            .entries()
            .next()
            .with_context(|| format!("Empty key layout {layout_json}"))?;
        let mut children: Vec<KeyLayout> = Vec::new();
        for child_json in value["children"].members() {
            children.push(self.parse_key_layout(child_json)?);
        }
        let requirement = self.parse_optional_requirement(&value["requires"])?;
        let locations = self.location_idxs(&value["locations"])?;
        if key == "smallKey" {
            let count = value["count"]
                .as_usize()
                .with_context(|| format!("missing/invalid small key count in {layout_json}"))?;
            ensure!(
                count <= locations.len(),
                "{count} small keys cannot fit in {} locations",
                locations.len()
            );
            Ok(KeyLayout::SmallKey {
                count,
                locations,
                requirement,
                children,
            })
        } else if key == "bigKey" {
            ensure!(!locations.is_empty(), "Big key layout without locations");
            Ok(KeyLayout::BigKey {
                locations,
                requirement,
                children,
            })
        } else {
            bail!("Unrecognized key layout type '{key}'");
        }
    }

    fn parse_optional_requirement(&self, req_json: &JsonValue) -> Result<Requirement> {
        if req_json.is_null() {
            Ok(Requirement::Free)
        } else {
            self.parse_requirement(req_json)
        }
    }

    fn parse_requires_list(&self, req_jsons: &[JsonValue]) -> Result<Vec<Requirement>> {
        let mut reqs: Vec<Requirement> = Vec::new();
        for req_json in req_jsons {
            reqs.push(
                self.parse_requirement(req_json)
                    .with_context(|| format!("Processing requirement {req_json}"))?,
            );
        }
        Ok(reqs)
    }

    fn parse_requirement(&self, req_json: &JsonValue) -> Result<Requirement> {
        if let Some(value) = req_json.as_str() {
            if value == "never" {
                return Ok(Requirement::Never);
            } else if value == "free" {
                return Ok(Requirement::Free);
            } else if value == "bigKey" {
                return Ok(Requirement::BigKey);
            } else if let Ok(item) = Item::from_str(value) {
                return Ok(Requirement::Item(item));
            }
        } else if req_json.is_object() && req_json.len() == 1 {
            let (key, value) = req_json.entries().next().unwrap();
            if key == "or" {
                ensure!(value.is_array());
                return Ok(Requirement::make_or(
                    self.parse_requires_list(value.members().as_slice())?,
                ));
            } else if key == "and" {
                ensure!(value.is_array());
                return Ok(Requirement::make_and(
                    self.parse_requires_list(value.members().as_slice())?,
                ));
            } else if key == "itemCount" {
                let item_name = get_str(value, "item")?;
                let item = Item::from_str(item_name)
                    .with_context(|| format!("Unrecognized item '{item_name}'"))?;
                let count = value["count"]
                    .as_u8()
                    .with_context(|| format!("missing/invalid item count in {req_json}"))?;
                return Ok(Requirement::ItemCount(item, count));
            } else if key == "setting" || key == "notSetting" {
                let flag_name = value
                    .as_str()
                    .with_context(|| format!("invalid setting in {req_json}"))?;
                let flag = ModeFlag::from_str(flag_name)
                    .with_context(|| format!("Unrecognized setting '{flag_name}'"))?;
                if key == "setting" {
                    return Ok(Requirement::Setting(flag));
                } else {
                    return Ok(Requirement::NotSetting(flag));
                }
            } else if key == "sequenceBreak" {
                let break_name = value
                    .as_str()
                    .with_context(|| format!("invalid sequence break in {req_json}"))?;
                let break_type = SequenceBreakType::from_str(break_name)
                    .with_context(|| format!("Unrecognized sequence break '{break_name}'"))?;
                return Ok(Requirement::SequenceBreak(break_type));
            } else if key == "keyDoor" {
                let door_name = value
                    .as_str()
                    .with_context(|| format!("invalid key door in {req_json}"))?;
                match self.key_door_isv.index_by_key.get(door_name) {
                    Some(&door_idx) => return Ok(Requirement::KeyDoor(door_idx)),
                    None => bail!("Unrecognized key door '{door_name}'"),
                }
            }
        }
        bail!("Unable to parse requirement: {}", req_json);
    }
}
