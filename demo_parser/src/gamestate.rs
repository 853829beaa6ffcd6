use ahash::AHashMap as HashMap;
use tracing::{debug, warn};

use crate::common::{handle_index, Vector};
use crate::entity::{Entity, EntityOp, EntityStore};
use crate::equipment::{Equipment, EquipmentType, GrenadeProjectile};
use crate::events::{Event, GrenadeProjectileDestroy, GrenadeProjectileThrow};
use crate::player::{Player, PlayerInfo};
use crate::serverclass::PropertyValue;
use crate::team::{TeamSide, TeamState};

/// Round state machine: `PreRound -> Live -> OfficialEnd -> PreRound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundPhase {
    #[default]
    PreRound,
    Live,
    OfficialEnd,
}

/// Axis-aligned bombsite trigger volume.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundingBox {
    pub min: Vector,
    pub max: Vector,
}

impl BoundingBox {
    /// Containment is inclusive at all six faces.
    pub fn contains(&self, point: Vector) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Bombsite {
    pub center: Vector,
    pub trigger_entity_id: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct PlantedBomb {
    pub entity_id: i32,
    pub planter_user_id: Option<i32>,
    pub site: Option<char>,
    pub ticking: bool,
    pub defused: bool,
}

/// Authoritative in-memory model of the match, derived from entity and
/// event streams. All accessors returning collections hand out clones.
#[derive(Default)]
pub struct GameState {
    pub ingame_tick: i32,
    round_phase: RoundPhase,
    total_rounds_played: i32,

    players: HashMap<i32, Player>,
    user_by_entity: HashMap<i32, i32>,
    user_by_pawn_handle: HashMap<u32, i32>,
    raw_players: HashMap<i32, PlayerInfo>,

    team_terrorists: TeamState,
    team_counter_terrorists: TeamState,

    equipment: HashMap<i32, Equipment>,
    grenades: HashMap<i32, GrenadeProjectile>,

    bombsite_a: Bombsite,
    bombsite_b: Bombsite,
    triggers: HashMap<i32, BoundingBox>,
    planted_bomb: Option<PlantedBomb>,

    server_convars: HashMap<String, String>,
}

impl GameState {
    pub fn new() -> Self {
        Self {
            team_terrorists: TeamState {
                side: TeamSide::Terrorists,
                ..TeamState::default()
            },
            team_counter_terrorists: TeamState {
                side: TeamSide::CounterTerrorists,
                ..TeamState::default()
            },
            ..Self::default()
        }
    }

    pub fn round_phase(&self) -> RoundPhase {
        self.round_phase
    }

    pub fn total_rounds_played(&self) -> i32 {
        self.total_rounds_played
    }

    pub fn team(&self, side: TeamSide) -> Option<&TeamState> {
        match side {
            TeamSide::Terrorists => Some(&self.team_terrorists),
            TeamSide::CounterTerrorists => Some(&self.team_counter_terrorists),
            _ => None,
        }
    }

    pub fn planted_bomb(&self) -> Option<&PlantedBomb> {
        self.planted_bomb.as_ref()
    }

    pub fn bombsite(&self, site: char) -> Option<&Bombsite> {
        match site {
            'A' => Some(&self.bombsite_a),
            'B' => Some(&self.bombsite_b),
            _ => None,
        }
    }

    /// Grenades currently in flight, by entity id.
    pub fn grenade_projectiles(&self) -> HashMap<i32, GrenadeProjectile> {
        self.grenades.to_owned()
    }

    /// Tracked weapon instances, by entity id.
    pub fn equipment(&self) -> HashMap<i32, Equipment> {
        self.equipment.to_owned()
    }

    pub fn server_convars(&self) -> HashMap<String, String> {
        self.server_convars.to_owned()
    }

    pub fn set_convar(&mut self, name: String, value: String) {
        self.server_convars.insert(name, value);
    }

    pub fn participants(&self) -> Participants<'_> {
        Participants { state: self }
    }

    pub fn on_ingame_tick(&mut self, tick: i32) {
        self.ingame_tick = tick;
    }

    /// Registers a raw player record from the `userinfo` string table.
    /// `entry_index` is the table index; the controller entity sits at
    /// `entry_index + 1`.
    pub fn register_raw_player(&mut self, entry_index: i32, info: PlayerInfo) {
        if info.name.is_empty() && info.xuid == 0 {
            return;
        }
        let user_id = info.user_id;
        let entity_id = entry_index + 1;

        let player = self.players.entry(user_id).or_default();
        player.user_id = user_id;
        player.name = info.name.to_owned();
        player.steam_id = info.xuid;
        player.is_bot = info.is_fake_player || info.guid == "BOT";
        player.is_connected = true;
        player.entity_id = entity_id;
        self.user_by_entity.insert(entity_id, user_id);
        self.raw_players.insert(entry_index, info);
        debug!(user_id, entity_id, "registered player");
    }

    pub fn on_player_disconnect(&mut self, user_id: i32) {
        if let Some(player) = self.players.get_mut(&user_id) {
            player.is_connected = false;
            player.health = 0;
            if player.entity_id >= 0 {
                self.user_by_entity.remove(&player.entity_id);
            }
            player.entity_id = -1;
        }
    }

    pub fn on_player_death(&mut self, victim: i32, attacker: i32, assister: i32) {
        if let Some(player) = self.players.get_mut(&victim) {
            player.deaths += 1;
        }
        if attacker != victim && attacker != 0 {
            if let Some(player) = self.players.get_mut(&attacker) {
                player.kills += 1;
            }
        }
        if assister != 0 {
            if let Some(player) = self.players.get_mut(&assister) {
                player.assists += 1;
            }
        }
    }

    pub fn on_round_start(&mut self) {
        self.round_phase = RoundPhase::PreRound;
        self.planted_bomb = None;
    }

    pub fn on_freezetime_end(&mut self) {
        self.round_phase = RoundPhase::Live;
    }

    pub fn on_round_officially_ended(&mut self) {
        self.round_phase = RoundPhase::OfficialEnd;
        self.total_rounds_played += 1;
    }

    pub fn on_bomb_planted(&mut self, planter: i32, site: Option<char>) {
        let entity_id = self
            .planted_bomb
            .as_ref()
            .map(|b| b.entity_id)
            .unwrap_or(-1);
        self.planted_bomb = Some(PlantedBomb {
            entity_id,
            planter_user_id: Some(planter),
            site,
            ticking: true,
            defused: false,
        });
    }

    pub fn on_bomb_defused(&mut self) {
        if let Some(bomb) = self.planted_bomb.as_mut() {
            bomb.ticking = false;
            bomb.defused = true;
        }
    }

    pub fn on_bomb_exploded(&mut self) {
        if let Some(bomb) = self.planted_bomb.as_mut() {
            bomb.ticking = false;
        }
    }

    /// Which bombsite's trigger volume contains `point`, if any.
    pub fn bombsite_containing(&self, point: Vector) -> Option<char> {
        for (site, bombsite) in [('A', &self.bombsite_a), ('B', &self.bombsite_b)] {
            if let Some(trigger_id) = bombsite.trigger_entity_id {
                if let Some(bbox) = self.triggers.get(&trigger_id) {
                    if bbox.contains(point) {
                        return Some(site);
                    }
                }
            }
        }
        None
    }

    pub fn trigger(&self, entity_id: i32) -> Option<&BoundingBox> {
        self.triggers.get(&entity_id)
    }

    pub fn set_trigger(&mut self, entity_id: i32, bbox: BoundingBox) {
        self.triggers.insert(entity_id, bbox);
        self.bind_bombsite_triggers();
    }

    fn bind_bombsite_triggers(&mut self) {
        let center_a = self.bombsite_a.center;
        let center_b = self.bombsite_b.center;
        if self.bombsite_a.trigger_entity_id.is_none() {
            self.bombsite_a.trigger_entity_id = find_trigger(&self.triggers, center_a);
        }
        if self.bombsite_b.trigger_entity_id.is_none() {
            self.bombsite_b.trigger_entity_id = find_trigger(&self.triggers, center_b);
        }
    }

    /// Applies one entity mutation to the aggregate model, emitting the
    /// events it implies (projectile lifecycles).
    pub fn apply_entity_op(
        &mut self,
        op: &EntityOp,
        entities: &EntityStore,
        out_events: &mut Vec<Event>,
    ) {
        match op {
            EntityOp::Created { id } => {
                let Some(entity) = entities.get(*id) else {
                    return;
                };
                if entity.is_player() {
                    self.bind_controller(entity);
                } else if entity.is_team() {
                    self.bind_team(entity);
                } else if entity.is_grenade_projectile() {
                    self.bind_projectile(entity, out_events);
                } else if entity.is_weapon() {
                    self.equipment.insert(
                        *id,
                        Equipment {
                            entity_id: *id,
                            eq_type: EquipmentType::from_class_name(&entity.class.name),
                            owner_user_id: self.owner_user_of(entity),
                            position: entity.position(),
                            ammo_in_magazine: entity.property_value("m_iClip1").as_integer(),
                        },
                    );
                } else if entity.is_planted_bomb() {
                    let planter = handle_index(
                        entity
                            .property_value("m_hOwnerEntity")
                            .as_handle()
                            .unwrap_or(crate::common::INVALID_ENTITY_HANDLE),
                    )
                    .and_then(|eid| self.user_by_entity.get(&eid).copied());
                    let position = entity.position();
                    self.planted_bomb = Some(PlantedBomb {
                        entity_id: *id,
                        planter_user_id: planter,
                        site: self.bombsite_containing(position),
                        ticking: true,
                        defused: false,
                    });
                } else if entity.is_player_resource() {
                    self.bind_player_resource(entity);
                } else if entity.is_base_trigger() {
                    self.bind_trigger(entity);
                }
            }
            EntityOp::PropertyChanged { id, slot, old } => {
                self.apply_property_change(*id, *slot, old, entities);
            }
            EntityOp::PositionChanged { id } => {
                let Some(entity) = entities.get(*id) else {
                    return;
                };
                let position = entity.position();
                if let Some(projectile) = self.grenades.get_mut(id) {
                    if projectile.trajectory.last() != Some(&position) {
                        projectile.trajectory.push(position);
                    }
                }
                if let Some(user_id) = self.user_for_entity(entity) {
                    if let Some(player) = self.players.get_mut(&user_id) {
                        player.position = position;
                    }
                }
                if let Some(weapon) = self.equipment.get_mut(id) {
                    weapon.position = position;
                }
            }
            EntityOp::Updated { .. } | EntityOp::Left { .. } => {}
            EntityOp::Deleted { id } => {
                if let Some(projectile) = self.grenades.remove(id) {
                    out_events.push(Event::GrenadeProjectileDestroy(GrenadeProjectileDestroy {
                        entity_id: *id,
                        thrower_user_id: projectile.thrower_user_id.unwrap_or(0),
                        trajectory: projectile.trajectory,
                    }));
                }
                self.equipment.remove(id);
                self.triggers.remove(id);
                if self.planted_bomb.as_ref().map(|b| b.entity_id) == Some(*id) {
                    if let Some(bomb) = self.planted_bomb.as_mut() {
                        bomb.ticking = false;
                    }
                }
            }
        }
    }

    fn bind_controller(&mut self, entity: &Entity) {
        let user_id = match self.user_by_entity.get(&entity.id).copied() {
            Some(user_id) => user_id,
            None => {
                // Controller seen before its userinfo entry arrived.
                let raw = self.raw_players.get(&(entity.id - 1)).cloned();
                match raw {
                    Some(info) => {
                        self.register_raw_player(entity.id - 1, info);
                        match self.user_by_entity.get(&entity.id).copied() {
                            Some(user_id) => user_id,
                            None => return,
                        }
                    }
                    None => return,
                }
            }
        };
        if let Some(player) = self.players.get_mut(&user_id) {
            player.entity_id = entity.id;
            player.is_connected = true;
            player.team =
                TeamSide::from_num(entity.property_value("m_iTeamNum").as_integer());
            if let Some(handle) = entity.property_value("m_hPlayerPawn").as_handle() {
                player.pawn_handle = handle;
                self.user_by_pawn_handle.insert(handle, user_id);
            }
        }
    }

    fn bind_team(&mut self, entity: &Entity) {
        let side = TeamSide::from_num(entity.property_value("m_iTeamNum").as_integer());
        let team = match side {
            TeamSide::Terrorists => &mut self.team_terrorists,
            TeamSide::CounterTerrorists => &mut self.team_counter_terrorists,
            _ => return,
        };
        team.entity_id = entity.id;
        team.clan_name = entity.property_value("m_szClanTeamname").as_str().to_string();
        if team.clan_name.is_empty() {
            team.clan_name = entity.property_value("m_szTeamname").as_str().to_string();
        }
    }

    fn bind_projectile(&mut self, entity: &Entity, out_events: &mut Vec<Event>) {
        let thrower = self.owner_user_of(entity);
        let eq_type = EquipmentType::from_class_name(&entity.class.name);
        self.grenades.insert(
            entity.id,
            GrenadeProjectile {
                entity_id: entity.id,
                eq_type,
                thrower_user_id: thrower,
                owner_user_id: thrower,
                trajectory: vec![entity.position()],
            },
        );
        out_events.push(Event::GrenadeProjectileThrow(GrenadeProjectileThrow {
            entity_id: entity.id,
            thrower_user_id: thrower.unwrap_or(0),
        }));
    }

    fn bind_player_resource(&mut self, entity: &Entity) {
        for (prop, site) in [
            ("m_bombsiteCenterA", 'A'),
            ("m_bombsiteCenterB", 'B'),
        ] {
            if let Some(value) = entity.property(prop) {
                let center = value.as_vector();
                match site {
                    'A' => self.bombsite_a.center = center,
                    _ => self.bombsite_b.center = center,
                }
            }
        }
        self.bind_bombsite_triggers();
    }

    fn bind_trigger(&mut self, entity: &Entity) {
        let mins = ["m_Collision.m_vecMins", "m_vecMins"]
            .iter()
            .find_map(|p| entity.property(p));
        let maxs = ["m_Collision.m_vecMaxs", "m_vecMaxs"]
            .iter()
            .find_map(|p| entity.property(p));
        if let (Some(mins), Some(maxs)) = (mins, maxs) {
            let origin = entity.position();
            let (mins, maxs) = (mins.as_vector(), maxs.as_vector());
            self.set_trigger(
                entity.id,
                BoundingBox {
                    min: Vector::new(origin.x + mins.x, origin.y + mins.y, origin.z + mins.z),
                    max: Vector::new(origin.x + maxs.x, origin.y + maxs.y, origin.z + maxs.z),
                },
            );
        }
    }

    fn apply_property_change(
        &mut self,
        id: i32,
        slot: usize,
        _old: &PropertyValue,
        entities: &EntityStore,
    ) {
        let Some(entity) = entities.get(id) else {
            return;
        };
        let Some(entry) = entity.class.flattened_props.get(slot) else {
            return;
        };
        let name = entry.name.as_str();
        let new = &entity.props[slot];

        // Team score lives on the team entity.
        if entity.is_team() && matches!(name, "m_scoreTotal" | "m_iScore") {
            let side = TeamSide::from_num(entity.property_value("m_iTeamNum").as_integer());
            match side {
                TeamSide::Terrorists => self.team_terrorists.score = new.as_integer(),
                TeamSide::CounterTerrorists => {
                    self.team_counter_terrorists.score = new.as_integer()
                }
                _ => {}
            }
            return;
        }

        if entity.is_planted_bomb() && name == "m_bBombDefused" && new.as_bool() {
            self.on_bomb_defused();
            return;
        }

        let Some(user_id) = self.user_for_entity(entity) else {
            return;
        };
        let Some(player) = self.players.get_mut(&user_id) else {
            return;
        };

        match name {
            "m_iHealth" => player.health = new.as_integer(),
            "m_ArmorValue" => player.armor = new.as_integer(),
            "m_iAccount" | "m_pInGameMoneyServices.m_iAccount" => {
                player.money = new.as_integer()
            }
            "m_iTeamNum" => player.team = TeamSide::from_num(new.as_integer()),
            "m_flFlashDuration" => player.flash_duration = new.as_float(),
            "m_hPlayerPawn" => {
                if let Some(handle) = new.as_handle() {
                    player.pawn_handle = handle;
                    self.user_by_pawn_handle.insert(handle, user_id);
                }
            }
            _ => {}
        }
    }

    /// User owning this entity through one of its owner handles.
    pub fn owner_user_of(&self, entity: &Entity) -> Option<i32> {
        for prop in ["m_hThrower", "m_hOwnerEntity", "m_hOwner"] {
            if let Some(handle) = entity.property_value(prop).as_handle() {
                if let Some(eid) = handle_index(handle) {
                    if let Some(user_id) = self.user_by_entity.get(&eid) {
                        return Some(*user_id);
                    }
                }
            }
        }
        None
    }

    /// User owning this entity: a controller directly, or a pawn through
    /// its controller handle map.
    pub fn user_for_entity(&self, entity: &Entity) -> Option<i32> {
        if let Some(user_id) = self.user_by_entity.get(&entity.id) {
            return Some(*user_id);
        }
        if entity.is_pawn() || entity.is_player() {
            return self.user_by_pawn_handle.get(&entity.handle()).copied();
        }
        None
    }

    pub fn warn_missing_bombsite(&self, site_index: i32) {
        warn!(site_index, "bombsite index not found in trigger list");
    }
}

fn find_trigger(triggers: &HashMap<i32, BoundingBox>, center: Vector) -> Option<i32> {
    triggers
        .iter()
        .find(|(_, bbox)| bbox.contains(center))
        .map(|(id, _)| *id)
}

/// Query view over the player set. Every accessor returns independent
/// copies, never live aliases.
pub struct Participants<'a> {
    state: &'a GameState,
}

impl Participants<'_> {
    /// Every player ever seen, keyed by user id, disconnected included.
    pub fn all_by_user_id(&self) -> HashMap<i32, Player> {
        self.state.players.to_owned()
    }

    /// Connected players keyed by user id.
    pub fn by_user_id(&self) -> HashMap<i32, Player> {
        self.state
            .players
            .iter()
            .filter(|(_, p)| p.is_connected)
            .map(|(k, v)| (*k, v.to_owned()))
            .collect()
    }

    /// Connected players keyed by controller entity id.
    pub fn by_entity_id(&self) -> HashMap<i32, Player> {
        self.state
            .players
            .values()
            .filter(|p| p.is_connected && p.entity_id >= 0)
            .map(|p| (p.entity_id, p.to_owned()))
            .collect()
    }

    pub fn by_steam_id(&self) -> HashMap<u64, Player> {
        self.state
            .players
            .values()
            .filter(|p| p.is_connected && p.steam_id != 0)
            .map(|p| (p.steam_id, p.to_owned()))
            .collect()
    }

    pub fn connected(&self) -> Vec<Player> {
        self.state
            .players
            .values()
            .filter(|p| p.is_connected)
            .map(Player::to_owned)
            .collect()
    }

    pub fn team_members(&self, side: TeamSide) -> Vec<Player> {
        self.connected()
            .into_iter()
            .filter(|p| p.team == side)
            .collect()
    }

    pub fn find_by_user_id(&self, user_id: i32) -> Option<Player> {
        self.state.players.get(&user_id).map(Player::to_owned)
    }

    pub fn find_by_pawn_handle(&self, handle: u32) -> Option<Player> {
        self.state
            .user_by_pawn_handle
            .get(&handle)
            .and_then(|uid| self.state.players.get(uid))
            .map(Player::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(user_id: i32, name: &str) -> PlayerInfo {
        PlayerInfo {
            xuid: 76561198000000000 + user_id as u64,
            name: name.to_string(),
            user_id,
            ..PlayerInfo::default()
        }
    }

    #[test]
    fn bounding_box_containment_is_inclusive() {
        let bbox = BoundingBox {
            min: Vector::new(-100.0, -100.0, 0.0),
            max: Vector::new(100.0, 100.0, 50.0),
        };
        assert!(bbox.contains(Vector::new(0.0, 0.0, 25.0)));
        assert!(bbox.contains(Vector::new(100.0, 100.0, 50.0)));
        assert!(bbox.contains(Vector::new(-100.0, -100.0, 0.0)));
        assert!(!bbox.contains(Vector::new(100.01, 0.0, 25.0)));
        assert!(!bbox.contains(Vector::new(0.0, 0.0, 50.0 + f64::EPSILON * 64.0)));
    }

    #[test]
    fn participants_snapshots_are_independent() {
        let mut gs = GameState::new();
        gs.register_raw_player(2, info(7, "alpha"));
        gs.register_raw_player(3, info(9, "bravo"));

        let mut snapshot = gs.participants().by_user_id();
        assert_eq!(snapshot.len(), 2);
        snapshot.clear();

        assert_eq!(gs.participants().by_user_id().len(), 2);
    }

    #[test]
    fn disconnect_keeps_player_in_all_view() {
        let mut gs = GameState::new();
        gs.register_raw_player(2, info(7, "alpha"));
        gs.on_player_disconnect(7);

        assert_eq!(gs.participants().by_user_id().len(), 0);
        assert_eq!(gs.participants().all_by_user_id().len(), 1);
        assert!(!gs.participants().all_by_user_id().get(&7).unwrap().is_connected);
    }

    #[test]
    fn round_machine_walks_phases() {
        let mut gs = GameState::new();
        assert_eq!(gs.round_phase(), RoundPhase::PreRound);
        gs.on_freezetime_end();
        assert_eq!(gs.round_phase(), RoundPhase::Live);
        gs.on_round_officially_ended();
        assert_eq!(gs.round_phase(), RoundPhase::OfficialEnd);
        assert_eq!(gs.total_rounds_played(), 1);
        gs.on_round_start();
        assert_eq!(gs.round_phase(), RoundPhase::PreRound);
    }

    #[test]
    fn kill_bookkeeping_updates_stats() {
        let mut gs = GameState::new();
        gs.register_raw_player(2, info(7, "victim"));
        gs.register_raw_player(3, info(9, "killer"));

        gs.on_player_death(7, 9, 0);
        let players = gs.participants().by_user_id();
        assert_eq!(players.get(&7).unwrap().deaths, 1);
        assert_eq!(players.get(&9).unwrap().kills, 1);

        // Suicides never award a kill.
        gs.on_player_death(9, 9, 0);
        let players = gs.participants().by_user_id();
        assert_eq!(players.get(&9).unwrap().kills, 1);
        assert_eq!(players.get(&9).unwrap().deaths, 1);
    }

    #[test]
    fn bombsite_resolution_through_triggers() {
        let mut gs = GameState::new();
        gs.bombsite_a.center = Vector::new(50.0, 50.0, 10.0);
        gs.set_trigger(
            400,
            BoundingBox {
                min: Vector::new(0.0, 0.0, 0.0),
                max: Vector::new(100.0, 100.0, 50.0),
            },
        );

        assert_eq!(gs.bombsite('A').unwrap().trigger_entity_id, Some(400));
        assert_eq!(gs.bombsite_containing(Vector::new(10.0, 10.0, 5.0)), Some('A'));
        assert_eq!(gs.bombsite_containing(Vector::new(500.0, 0.0, 0.0)), None);
    }
}
