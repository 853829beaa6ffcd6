use prost::Message;
use serde::{Deserialize, Serialize};

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
pub struct CsvcMsgServerInfo {
    #[prost(int32, optional, tag = "1")]
    pub protocol: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub server_count: Option<i32>,
    #[prost(bool, optional, tag = "3")]
    pub is_dedicated: Option<bool>,
    #[prost(bool, optional, tag = "4")]
    pub is_official_valve_server: Option<bool>,
    #[prost(bool, optional, tag = "5")]
    pub is_hltv: Option<bool>,
    #[prost(bool, optional, tag = "6")]
    pub is_replay: Option<bool>,
    #[prost(bool, optional, tag = "21")]
    pub is_redirecting_to_proxy_relay: Option<bool>,
    #[prost(int32, optional, tag = "7")]
    pub c_os: Option<i32>,
    #[prost(fixed32, optional, tag = "8")]
    pub map_crc: Option<u32>,
    #[prost(fixed32, optional, tag = "9")]
    pub client_crc: Option<u32>,
    #[prost(fixed32, optional, tag = "10")]
    pub string_table_crc: Option<u32>,
    #[prost(int32, optional, tag = "11")]
    pub max_clients: Option<i32>,
    #[prost(int32, optional, tag = "12")]
    pub max_classes: Option<i32>,
    #[prost(int32, optional, tag = "13")]
    pub player_slot: Option<i32>,
    #[prost(float, optional, tag = "14")]
    pub tick_interval: Option<f32>,
    #[prost(string, optional, tag = "15")]
    pub game_dir: Option<String>,
    #[prost(string, optional, tag = "16")]
    pub map_name: Option<String>,
    #[prost(string, optional, tag = "17")]
    pub map_group_name: Option<String>,
    #[prost(string, optional, tag = "18")]
    pub sky_name: Option<String>,
    #[prost(string, optional, tag = "19")]
    pub host_name: Option<String>,
    #[prost(uint32, optional, tag = "20")]
    pub public_ip: Option<u32>,
    #[prost(uint64, optional, tag = "22")]
    pub ugc_map_id: Option<u64>,
}
