use demo_dispatcher::Dispatchable;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::Vector;
use crate::gameevent::RawGameEvent;

/// Variant tag of [`Event`]; handlers subscribe by tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    FrameDone,
    DataTablesParsed,
    ParserWarn,
    MatchStart,
    RoundStart,
    RoundFreezetimeEnd,
    RoundEnd,
    RoundOfficiallyEnded,
    PlayerConnect,
    PlayerDisconnected,
    PlayerSpawn,
    PlayerFootstep,
    PlayerHurt,
    PlayerDeath,
    WeaponFire,
    BombPlanted,
    BombDefused,
    BombExplode,
    FlashExplode,
    HeExplode,
    SmokeStarted,
    SmokeExpired,
    DecoyStarted,
    DecoyExpired,
    GrenadeProjectileThrow,
    GrenadeProjectileDestroy,
    RawGameEvent,
}

/// Consumer-facing event stream: typed records for the load-bearing events,
/// raw name-keyed records for everything else.
#[derive(Debug, Clone)]
pub enum Event {
    FrameDone(FrameDone),
    DataTablesParsed,
    ParserWarn(ParserWarn),
    MatchStart,
    RoundStart(RoundStart),
    RoundFreezetimeEnd,
    RoundEnd(RoundEnd),
    RoundOfficiallyEnded,
    PlayerConnect(PlayerConnect),
    PlayerDisconnected(PlayerDisconnected),
    PlayerSpawn(PlayerSpawn),
    PlayerFootstep(PlayerFootstep),
    PlayerHurt(PlayerHurt),
    PlayerDeath(PlayerDeath),
    WeaponFire(WeaponFire),
    BombPlanted(BombEvent),
    BombDefused(BombEvent),
    BombExplode(BombEvent),
    FlashExplode(GrenadeEvent),
    HeExplode(GrenadeEvent),
    SmokeStarted(GrenadeEvent),
    SmokeExpired(GrenadeEvent),
    DecoyStarted(GrenadeEvent),
    DecoyExpired(GrenadeEvent),
    GrenadeProjectileThrow(GrenadeProjectileThrow),
    GrenadeProjectileDestroy(GrenadeProjectileDestroy),
    RawGameEvent(RawGameEvent),
}

impl Dispatchable for Event {
    type Tag = EventKind;

    fn tag(&self) -> EventKind {
        match self {
            Event::FrameDone(_) => EventKind::FrameDone,
            Event::DataTablesParsed => EventKind::DataTablesParsed,
            Event::ParserWarn(_) => EventKind::ParserWarn,
            Event::MatchStart => EventKind::MatchStart,
            Event::RoundStart(_) => EventKind::RoundStart,
            Event::RoundFreezetimeEnd => EventKind::RoundFreezetimeEnd,
            Event::RoundEnd(_) => EventKind::RoundEnd,
            Event::RoundOfficiallyEnded => EventKind::RoundOfficiallyEnded,
            Event::PlayerConnect(_) => EventKind::PlayerConnect,
            Event::PlayerDisconnected(_) => EventKind::PlayerDisconnected,
            Event::PlayerSpawn(_) => EventKind::PlayerSpawn,
            Event::PlayerFootstep(_) => EventKind::PlayerFootstep,
            Event::PlayerHurt(_) => EventKind::PlayerHurt,
            Event::PlayerDeath(_) => EventKind::PlayerDeath,
            Event::WeaponFire(_) => EventKind::WeaponFire,
            Event::BombPlanted(_) => EventKind::BombPlanted,
            Event::BombDefused(_) => EventKind::BombDefused,
            Event::BombExplode(_) => EventKind::BombExplode,
            Event::FlashExplode(_) => EventKind::FlashExplode,
            Event::HeExplode(_) => EventKind::HeExplode,
            Event::SmokeStarted(_) => EventKind::SmokeStarted,
            Event::SmokeExpired(_) => EventKind::SmokeExpired,
            Event::DecoyStarted(_) => EventKind::DecoyStarted,
            Event::DecoyExpired(_) => EventKind::DecoyExpired,
            Event::GrenadeProjectileThrow(_) => EventKind::GrenadeProjectileThrow,
            Event::GrenadeProjectileDestroy(_) => EventKind::GrenadeProjectileDestroy,
            Event::RawGameEvent(_) => EventKind::RawGameEvent,
        }
    }
}

impl Event {
    /// Projects a decoded server event into its typed record, falling back
    /// to the raw form for events without one.
    pub fn from_raw(raw: RawGameEvent) -> Event {
        fn typed<T: serde::de::DeserializeOwned + Default>(raw: &RawGameEvent) -> T {
            serde_json::from_value(Value::Object(raw.fields.to_owned())).unwrap_or_default()
        }

        match raw.name.as_str() {
            "round_announce_match_start" => Event::MatchStart,
            "round_start" => Event::RoundStart(typed(&raw)),
            "round_freeze_end" => Event::RoundFreezetimeEnd,
            "round_end" => Event::RoundEnd(typed(&raw)),
            "round_officially_ended" => Event::RoundOfficiallyEnded,
            "player_connect" => Event::PlayerConnect(typed(&raw)),
            "player_disconnect" => Event::PlayerDisconnected(typed(&raw)),
            "player_spawn" => Event::PlayerSpawn(typed(&raw)),
            "player_footstep" => Event::PlayerFootstep(typed(&raw)),
            "player_hurt" => Event::PlayerHurt(typed(&raw)),
            "player_death" => Event::PlayerDeath(typed(&raw)),
            "weapon_fire" => Event::WeaponFire(typed(&raw)),
            "bomb_planted" => Event::BombPlanted(typed(&raw)),
            "bomb_defused" => Event::BombDefused(typed(&raw)),
            "bomb_exploded" => Event::BombExplode(typed(&raw)),
            "flashbang_detonate" => Event::FlashExplode(typed(&raw)),
            "hegrenade_detonate" => Event::HeExplode(typed(&raw)),
            "smokegrenade_detonate" => Event::SmokeStarted(typed(&raw)),
            "smokegrenade_expired" => Event::SmokeExpired(typed(&raw)),
            "decoy_started" => Event::DecoyStarted(typed(&raw)),
            "decoy_detonate" => Event::DecoyExpired(typed(&raw)),
            _ => Event::RawGameEvent(raw),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameDone {
    pub tick: i32,
    pub frame: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserWarn {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundStart {
    pub timelimit: i32,
    pub fraglimit: i32,
    pub objective: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundEnd {
    pub winner: i32,
    pub reason: i32,
    pub message: String,
    pub legacy: i32,
    pub player_count: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConnect {
    pub userid: i32,
    pub name: String,
    pub networkid: String,
    pub index: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerDisconnected {
    pub userid: i32,
    pub reason: String,
    pub name: String,
    pub networkid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSpawn {
    pub userid: i32,
    pub teamnum: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerFootstep {
    pub userid: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerHurt {
    pub userid: i32,
    pub attacker: i32,
    pub health: i32,
    pub armor: i32,
    pub dmg_health: i32,
    pub dmg_armor: i32,
    pub weapon: String,
    pub hitgroup: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerDeath {
    pub userid: i32,
    pub attacker: i32,
    pub assister: i32,
    pub assistedflash: bool,
    pub weapon: String,
    pub headshot: bool,
    pub penetrated: i32,
    pub noscope: bool,
    pub thrusmoke: bool,
    pub attackerblind: bool,
    pub distance: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeaponFire {
    pub userid: i32,
    pub weapon: String,
    pub silenced: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BombEvent {
    pub userid: i32,
    pub site: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrenadeEvent {
    pub entityid: i32,
    pub userid: i32,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrenadeProjectileThrow {
    pub entity_id: i32,
    pub thrower_user_id: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrenadeProjectileDestroy {
    pub entity_id: i32,
    pub thrower_user_id: i32,
    pub trajectory: Vec<Vector>,
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::*;

    fn raw(name: &str, fields: &[(&str, Value)]) -> RawGameEvent {
        let mut map = Map::new();
        for (k, v) in fields {
            map.insert((*k).to_string(), v.to_owned());
        }
        RawGameEvent {
            name: name.to_string(),
            fields: map,
        }
    }

    #[test]
    fn typed_projection_fills_named_fields() {
        let event = Event::from_raw(raw(
            "player_death",
            &[
                ("userid", json!(7)),
                ("attacker", json!(3)),
                ("weapon", json!("ak47")),
                ("headshot", json!(true)),
            ],
        ));
        match event {
            Event::PlayerDeath(death) => {
                assert_eq!(death.userid, 7);
                assert_eq!(death.attacker, 3);
                assert_eq!(death.weapon, "ak47");
                assert!(death.headshot);
                assert!(!death.noscope);
            }
            other => panic!("expected PlayerDeath, got {other:?}"),
        }
    }

    #[test]
    fn unknown_events_stay_raw() {
        let event = Event::from_raw(raw("vote_cast", &[("vote_option", json!(1))]));
        assert_eq!(event.tag(), EventKind::RawGameEvent);
    }

    #[test]
    fn tags_match_variants() {
        assert_eq!(
            Event::RoundStart(RoundStart::default()).tag(),
            EventKind::RoundStart
        );
        assert_eq!(Event::MatchStart.tag(), EventKind::MatchStart);
    }
}
