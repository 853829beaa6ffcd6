use serde::{Deserialize, Serialize};

/// Team slot as networked in `m_iTeamNum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TeamSide {
    #[default]
    Unassigned,
    Spectators,
    Terrorists,
    CounterTerrorists,
}

impl TeamSide {
    pub fn from_num(num: i32) -> TeamSide {
        match num {
            1 => TeamSide::Spectators,
            2 => TeamSide::Terrorists,
            3 => TeamSide::CounterTerrorists,
            _ => TeamSide::Unassigned,
        }
    }

    pub fn other(self) -> TeamSide {
        match self {
            TeamSide::Terrorists => TeamSide::CounterTerrorists,
            TeamSide::CounterTerrorists => TeamSide::Terrorists,
            other => other,
        }
    }
}

/// Mutable per-team aggregate, fed by the team entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamState {
    pub side: TeamSide,
    pub entity_id: i32,
    pub clan_name: String,
    pub flag: String,
    pub score: i32,
    pub member_user_ids: Vec<i32>,
}
