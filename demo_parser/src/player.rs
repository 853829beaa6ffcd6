use std::io::Cursor;

use demo_bitreader::BitReader;
use prost::Message;
use serde::{Deserialize, Serialize};

use ahash::AHashMap as HashMap;

use crate::common::Vector;
use crate::equipment::Equipment;
use crate::error::Result;
use crate::team::TeamSide;

pub const PLAYER_NAME_MAX_LENGTH: usize = 128;
pub const GUID_LENGTH: usize = 33;

/// Raw registration record from the `userinfo` string table.
#[derive(Debug, Clone, Default)]
pub struct PlayerInfo {
    pub version: u64,
    pub xuid: u64,
    pub name: String,
    pub user_id: i32,
    pub guid: String,
    pub friends_id: u64,
    pub friends_name: String,
    pub is_fake_player: bool,
    pub is_hltv: bool,
    pub entity_id: i32,
}

impl PlayerInfo {
    /// Decodes the legacy fixed-layout blob carried by Source 1 demos.
    pub fn from_source1_bytes(bytes: &[u8]) -> Result<Self> {
        let mut br = BitReader::new_small_bit_reader(Cursor::new(bytes.to_vec()))?;
        let version = uint64_be(&br.read_bytes(8)?);
        let xuid = uint64_be(&br.read_bytes(8)?);
        let name = br.read_cstring(PLAYER_NAME_MAX_LENGTH)?;
        let user_id = uint32_be(&br.read_bytes(4)?) as i32;
        let guid = br.read_cstring(GUID_LENGTH)?;
        br.skip(24)?;
        let friends_id = friends_id(&br.read_bytes(4)?);
        let friends_name = br.read_cstring(PLAYER_NAME_MAX_LENGTH)?;
        let is_fake_player = br.read_single_byte()? != 0;
        let is_hltv = br.read_single_byte()? != 0;
        Ok(Self {
            version,
            xuid,
            name,
            user_id,
            guid,
            friends_id,
            friends_name,
            is_fake_player,
            is_hltv,
            entity_id: -1,
        })
    }

    /// Decodes the protobuf form carried by Source 2 demos.
    pub fn from_source2_bytes(bytes: &[u8]) -> Result<Self> {
        let msg = CMsgPlayerInfo::decode(bytes)?;
        Ok(Self {
            version: 0,
            xuid: msg.xuid(),
            name: msg.name().to_string(),
            user_id: msg.userid(),
            guid: msg.steamid().to_string(),
            friends_id: 0,
            friends_name: String::new(),
            is_fake_player: msg.fakeplayer(),
            is_hltv: msg.ishltv(),
            entity_id: -1,
        })
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct CMsgPlayerInfo {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(uint64, optional, tag = "2")]
    pub xuid: Option<u64>,
    #[prost(int32, optional, tag = "3")]
    pub userid: Option<i32>,
    #[prost(uint64, optional, tag = "4")]
    pub steamid: Option<u64>,
    #[prost(bool, optional, tag = "5")]
    pub fakeplayer: Option<bool>,
    #[prost(bool, optional, tag = "6")]
    pub ishltv: Option<bool>,
}

// The legacy blob stores its integers big-endian.
fn uint64_be(b: &[u8]) -> u64 {
    u64::from_be_bytes(b[..8].try_into().unwrap_or_default())
}

fn uint32_be(b: &[u8]) -> u32 {
    u32::from_be_bytes(b[..4].try_into().unwrap_or_default())
}

fn friends_id(b: &[u8]) -> u64 {
    b[2] as u64 | (b[1] as u64) << 8 | (b[0] as u64) << 16
}

/// Aggregated per-player view; accessors hand out independent clones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Player {
    pub user_id: i32,
    pub steam_id: u64,
    pub name: String,
    pub entity_id: i32,
    pub pawn_handle: u32,
    pub team: TeamSide,
    pub is_bot: bool,
    pub is_connected: bool,
    pub health: i32,
    pub armor: i32,
    pub money: i32,
    pub kills: i32,
    pub deaths: i32,
    pub assists: i32,
    pub position: Vector,
    pub flash_duration: f64,
    #[serde(skip)]
    pub inventory: HashMap<i32, Equipment>,
}

impl Player {
    pub fn is_alive(&self) -> bool {
        self.is_connected && self.health > 0
    }
}
