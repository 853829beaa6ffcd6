use ahash::AHashMap as HashMap;
use prost::Message;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::error::Result;

#[derive(Clone, PartialEq, Message)]
pub struct CsvcMsgGameEventList {
    #[prost(message, repeated, tag = "1")]
    pub descriptors: Vec<DescriptorT>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DescriptorT {
    #[prost(int32, tag = "1")]
    pub eventid: i32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, repeated, tag = "3")]
    pub keys: Vec<DescriptorKeyT>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DescriptorKeyT {
    #[prost(int32, tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct CsvcMsgGameEvent {
    #[prost(string, optional, tag = "1")]
    pub event_name: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub eventid: Option<i32>,
    #[prost(message, repeated, tag = "3")]
    pub keys: Vec<KeyT>,
    #[prost(int32, optional, tag = "4")]
    pub passthrough: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct KeyT {
    #[prost(int32, tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub val_string: String,
    #[prost(float, tag = "3")]
    pub val_float: f32,
    #[prost(int32, tag = "4")]
    pub val_long: i32,
    #[prost(int32, tag = "5")]
    pub val_short: i32,
    #[prost(int32, tag = "6")]
    pub val_byte: i32,
    #[prost(bool, tag = "7")]
    pub val_bool: bool,
    #[prost(uint64, tag = "8")]
    pub val_uint64: u64,
    #[prost(bytes = "vec", tag = "9")]
    pub val_wstring: Vec<u8>,
}

/// Descriptor of one event kind: id, name and the ordered field schema.
#[derive(Debug, Clone)]
pub struct GameEventDescriptor {
    pub event_id: i32,
    pub name: String,
    pub keys: Vec<(String, i32)>,
}

impl From<&DescriptorT> for GameEventDescriptor {
    fn from(d: &DescriptorT) -> Self {
        Self {
            event_id: d.eventid,
            name: d.name.to_owned(),
            keys: d
                .keys
                .iter()
                .map(|k| (k.name.to_owned(), k.r#type))
                .collect(),
        }
    }
}

impl GameEventDescriptor {
    /// Projects the positional field list into a record keyed by the
    /// descriptor's field names.
    pub fn to_object(&self, msg: &CsvcMsgGameEvent) -> Map<String, Value> {
        let mut fields = Map::new();
        for (i, (key_name, _)) in self.keys.iter().enumerate() {
            let value = match msg.keys.get(i) {
                Some(v) => v,
                None => break,
            };
            let field_value = match value.r#type {
                1 => json!(value.val_string),
                2 => json!(value.val_float),
                3 => json!(value.val_long),
                4 => json!(value.val_short),
                5 => json!(value.val_byte),
                6 => json!(value.val_bool),
                7 => json!(value.val_uint64),
                8 => json!(String::from_utf8_lossy(&value.val_wstring)),
                _ => Value::Null,
            };
            fields.insert(key_name.to_owned(), field_value);
        }
        fields
    }
}

/// A decoded event as sent by the server: name plus named fields.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RawGameEvent {
    pub name: String,
    pub fields: Map<String, Value>,
}

/// Consumes the event descriptor list, then decodes each raw event into a
/// name-keyed record.
#[derive(Default)]
pub struct GameEventDecoder {
    descriptors: HashMap<i32, GameEventDescriptor>,
    fallback_list_bin: Option<Vec<u8>>,
    in_band_list_seen: bool,
}

impl GameEventDecoder {
    pub fn new(fallback_list_bin: Option<Vec<u8>>) -> Self {
        Self {
            fallback_list_bin,
            ..Self::default()
        }
    }

    pub fn descriptors_ready(&self) -> bool {
        !self.descriptors.is_empty()
    }

    pub fn descriptor_by_name(&self, name: &str) -> Option<&GameEventDescriptor> {
        self.descriptors.values().find(|d| d.name == name)
    }

    /// An in-band list always wins; the configured fallback is abandoned
    /// once one arrives.
    pub fn on_game_event_list(&mut self, msg: &CsvcMsgGameEventList) {
        self.in_band_list_seen = true;
        self.descriptors.clear();
        for d in msg.descriptors.iter() {
            self.descriptors.insert(d.eventid, d.into());
        }
    }

    /// Loads the configured fallback descriptors, used only when the server
    /// never sent a list (empty-server hibernation bug).
    fn load_fallback(&mut self) -> Result<()> {
        if self.in_band_list_seen || self.descriptors_ready() {
            return Ok(());
        }
        if let Some(bin) = self.fallback_list_bin.take() {
            let msg = CsvcMsgGameEventList::decode(bin.as_slice())?;
            for d in msg.descriptors.iter() {
                self.descriptors.insert(d.eventid, d.into());
            }
            warn!("game event list missing from demo, using configured fallback");
        }
        Ok(())
    }

    /// Decodes one raw event. Events without a known descriptor are
    /// discarded with a warning.
    pub fn decode(&mut self, msg: &CsvcMsgGameEvent) -> Result<Option<RawGameEvent>> {
        self.load_fallback()?;

        let descriptor = match self.descriptors.get(&msg.eventid()) {
            Some(d) => d,
            None => {
                warn!(event_id = msg.eventid(), "event without descriptor dropped");
                return Ok(None);
            }
        };

        Ok(Some(RawGameEvent {
            name: descriptor.name.to_owned(),
            fields: descriptor.to_object(msg),
        }))
    }
}
