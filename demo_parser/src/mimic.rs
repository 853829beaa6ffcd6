use ahash::AHashMap as HashMap;

use crate::entity::{EntityOp, EntityStore};
use crate::events::{BombEvent, Event, EventKind, PlayerDeath, RoundEnd};
use crate::gamestate::GameState;
use crate::serverclass::PropertyValue;

use demo_dispatcher::Dispatchable;

/// Synthesizes legacy-shaped game events from entity-property changes for
/// demos whose servers do not emit them. Synthesized events are buffered
/// during the tick and dropped when the demo turns out to emit the real
/// event for the same tick.
pub struct MimicSource1Events {
    enabled: bool,
    pending: Vec<Event>,
    real_event_ticks: HashMap<EventKind, i32>,
}

impl MimicSource1Events {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            pending: Vec::new(),
            real_event_ticks: HashMap::new(),
        }
    }

    /// Records that the demo itself emitted `kind` at `tick`.
    pub fn note_real_event(&mut self, kind: EventKind, tick: i32) {
        self.real_event_ticks.insert(kind, tick);
    }

    /// Watches one applied entity mutation for mimic-worthy transitions.
    pub fn on_entity_op(&mut self, op: &EntityOp, entities: &EntityStore, state: &GameState) {
        if !self.enabled {
            return;
        }

        match op {
            EntityOp::Created { id } => {
                let Some(entity) = entities.get(*id) else {
                    return;
                };
                if entity.is_planted_bomb() {
                    let userid = state.owner_user_of(entity).unwrap_or(0);
                    self.pending
                        .push(Event::BombPlanted(BombEvent { userid, site: 0 }));
                }
            }
            EntityOp::PropertyChanged { id, slot, old } => {
                let Some(entity) = entities.get(*id) else {
                    return;
                };
                let Some(entry) = entity.class.flattened_props.get(*slot) else {
                    return;
                };
                let new = &entity.props[*slot];

                match entry.name.as_str() {
                    "m_iHealth" if entity.is_pawn() || entity.is_player() => {
                        if old.as_integer() > 0 && new.as_integer() <= 0 {
                            let userid = state.user_for_entity(entity).unwrap_or(0);
                            self.pending.push(Event::PlayerDeath(PlayerDeath {
                                userid,
                                ..PlayerDeath::default()
                            }));
                        }
                    }
                    "m_bFreezePeriod" if entity.is_game_rules() => {
                        match (old.as_bool(), new.as_bool()) {
                            (false, true) => {
                                self.pending
                                    .push(Event::RoundStart(Default::default()));
                            }
                            (true, false) => {
                                self.pending.push(Event::RoundFreezetimeEnd);
                            }
                            _ => {}
                        }
                    }
                    "m_eRoundWinReason" | "m_iRoundWinStatus" if entity.is_game_rules() => {
                        let reason = entity
                            .property_value("m_eRoundWinReason")
                            .as_integer()
                            .max(0);
                        let winner = entity.property_value("m_iRoundWinStatus").as_integer();
                        if new.as_integer() != 0 && !matches!(old, PropertyValue::None) {
                            self.pending.push(Event::RoundEnd(RoundEnd {
                                winner,
                                reason,
                                ..RoundEnd::default()
                            }));
                        }
                    }
                    "m_bBombDefused" if entity.is_planted_bomb() => {
                        if !old.as_bool() && new.as_bool() {
                            self.pending.push(Event::BombDefused(BombEvent {
                                userid: 0,
                                site: 0,
                            }));
                        }
                    }
                    _ => {}
                }
            }
            EntityOp::Deleted { id } => {
                if let Some(bomb) = state.planted_bomb() {
                    if bomb.entity_id == *id && bomb.ticking && !bomb.defused {
                        self.pending.push(Event::BombExplode(BombEvent {
                            userid: bomb.planter_user_id.unwrap_or(0),
                            site: 0,
                        }));
                    }
                }
            }
            _ => {}
        }
    }

    /// Takes the events synthesized during `tick`, minus any whose kind the
    /// demo emitted for real in the same tick.
    pub fn drain_for_tick(&mut self, tick: i32) -> Vec<Event> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let real = &self.real_event_ticks;
        self.pending
            .drain(..)
            .filter(|event| real.get(&event.tag()).copied() != Some(tick))
            .collect()
    }
}
