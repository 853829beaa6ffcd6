use std::any::Any;
use std::io::Cursor;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use demo_bitreader::BitReader;
use demo_dispatcher::Dispatchable;
use prost::Message;
use tracing::trace;

use crate::commands::{DemoProtocol, FrameKind, MessageType};
use crate::convar::CnetMsgSetConVar;
use crate::entity::CsvcMsgPacketEntities;
use crate::error::Result;
use crate::frame::Frame;
use crate::gameevent::{CsvcMsgGameEvent, CsvcMsgGameEventList};
use crate::serializers::{CDemoClassInfo, CDemoSendTables};
use crate::serverinfo::CsvcMsgServerInfo;
use crate::stringtable::{
    CDemoStringTables, CsvcMsgCreateStringTable, CsvcMsgCreateStringTableS2,
    CsvcMsgUpdateStringTable, StringTableParams,
};
use crate::tick::CnetMsgTick;

#[derive(Clone, PartialEq, Message)]
pub struct CDemoPacket {
    #[prost(bytes = "vec", optional, tag = "3")]
    pub data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CDemoFullPacket {
    #[prost(message, optional, tag = "1")]
    pub string_table: Option<CDemoStringTables>,
    #[prost(message, optional, tag = "2")]
    pub packet: Option<CDemoPacket>,
}

/// Constructor for user-supplied message types, keyed by message id.
pub type NetMessageCreator =
    Box<dyn Fn(&[u8]) -> Result<Arc<dyn Any + Send + Sync>> + Send + Sync>;

/// One routed message: either a decoded core message or a user-registered
/// additional type. Moved, never aliased, across the queue boundary.
pub enum NetMessage {
    Tick(CnetMsgTick),
    SetConVar(CnetMsgSetConVar),
    ServerInfo(Box<CsvcMsgServerInfo>),
    CreateStringTable(StringTableParams),
    UpdateStringTable(CsvcMsgUpdateStringTable),
    ClearAllStringTables,
    PacketEntities(CsvcMsgPacketEntities),
    GameEvent(CsvcMsgGameEvent),
    GameEventList(CsvcMsgGameEventList),
    /// Source 1 `DataTables` frame payload, decoded by the send-table
    /// registry on the consumer side.
    DataTables(Vec<u8>),
    SendTables(CDemoSendTables),
    ClassInfo(CDemoClassInfo),
    StringTables(CDemoStringTables),
    Additional {
        id: u32,
        message: Arc<dyn Any + Send + Sync>,
    },
    /// Queue token marking the end of one outer frame.
    FrameParsed { tick: i32, frame: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetMessageKind {
    Tick,
    SetConVar,
    ServerInfo,
    CreateStringTable,
    UpdateStringTable,
    ClearAllStringTables,
    PacketEntities,
    GameEvent,
    GameEventList,
    DataTables,
    SendTables,
    ClassInfo,
    StringTables,
    Additional(u32),
    FrameParsed,
}

impl Dispatchable for NetMessage {
    type Tag = NetMessageKind;

    fn tag(&self) -> NetMessageKind {
        match self {
            NetMessage::Tick(_) => NetMessageKind::Tick,
            NetMessage::SetConVar(_) => NetMessageKind::SetConVar,
            NetMessage::ServerInfo(_) => NetMessageKind::ServerInfo,
            NetMessage::CreateStringTable(_) => NetMessageKind::CreateStringTable,
            NetMessage::UpdateStringTable(_) => NetMessageKind::UpdateStringTable,
            NetMessage::ClearAllStringTables => NetMessageKind::ClearAllStringTables,
            NetMessage::PacketEntities(_) => NetMessageKind::PacketEntities,
            NetMessage::GameEvent(_) => NetMessageKind::GameEvent,
            NetMessage::GameEventList(_) => NetMessageKind::GameEventList,
            NetMessage::DataTables(_) => NetMessageKind::DataTables,
            NetMessage::SendTables(_) => NetMessageKind::SendTables,
            NetMessage::ClassInfo(_) => NetMessageKind::ClassInfo,
            NetMessage::StringTables(_) => NetMessageKind::StringTables,
            NetMessage::Additional { id, .. } => NetMessageKind::Additional(*id),
            NetMessage::FrameParsed { .. } => NetMessageKind::FrameParsed,
        }
    }
}

/// Unwraps nested messages out of packet frames and routes them to typed
/// values. Unknown types are skipped unless an additional creator claims
/// them.
pub struct NetMessageDemux {
    protocol: DemoProtocol,
    additional_creators: HashMap<u32, NetMessageCreator>,
}

impl NetMessageDemux {
    pub fn new(
        protocol: DemoProtocol,
        additional_creators: HashMap<u32, NetMessageCreator>,
    ) -> Self {
        Self {
            protocol,
            additional_creators,
        }
    }

    /// Routes one outer frame into its embedded messages.
    pub fn demux_frame(&self, frame: &Frame, out: &mut Vec<NetMessage>) -> Result<()> {
        match frame.kind {
            FrameKind::SignOn | FrameKind::Packet => match self.protocol {
                DemoProtocol::Source1 => self.demux_packet(&frame.payload, out)?,
                DemoProtocol::Source2 => {
                    let packet = CDemoPacket::decode(frame.payload.as_slice())?;
                    self.demux_packet(packet.data(), out)?;
                }
            },
            FrameKind::DataTables => match self.protocol {
                DemoProtocol::Source1 => out.push(NetMessage::DataTables(frame.payload.to_owned())),
                DemoProtocol::Source2 => {
                    let msg = CDemoSendTables::decode(frame.payload.as_slice())?;
                    out.push(NetMessage::SendTables(msg));
                }
            },
            FrameKind::ClassInfo => {
                let msg = CDemoClassInfo::decode(frame.payload.as_slice())?;
                out.push(NetMessage::ClassInfo(msg));
            }
            FrameKind::StringTables => {
                if self.protocol == DemoProtocol::Source2 {
                    let msg = CDemoStringTables::decode(frame.payload.as_slice())?;
                    out.push(NetMessage::StringTables(msg));
                }
                // The legacy frame duplicates in-band table messages.
            }
            FrameKind::FullPacket => {
                let msg = CDemoFullPacket::decode(frame.payload.as_slice())?;
                if let Some(tables) = msg.string_table {
                    out.push(NetMessage::StringTables(tables));
                }
                if let Some(packet) = msg.packet {
                    self.demux_packet(packet.data(), out)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Unwraps the `varint type, varint length`-prefixed messages embedded
    /// in one packet payload.
    pub fn demux_packet(&self, payload: &[u8], out: &mut Vec<NetMessage>) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let total_bits = payload.len() << 3;
        let mut r = BitReader::new_small_bit_reader(Cursor::new(payload.to_vec()))?;

        while total_bits.saturating_sub(r.actual_position()) >= 8 {
            let msg_id = match self.protocol {
                DemoProtocol::Source1 => r.read_varint32()?,
                DemoProtocol::Source2 => r.read_ubitint()? as u32,
            };
            let size = r.read_varint32()? as usize;

            let msg_type = MessageType::from_id(msg_id, self.protocol);
            if matches!(msg_type, MessageType::Skippable(_)) {
                r.skip(size << 3)?;
                continue;
            }
            if let MessageType::Other(id) = msg_type {
                match self.additional_creators.get(&id) {
                    Some(creator) => {
                        let buf = r.read_bytes(size)?;
                        out.push(NetMessage::Additional {
                            id,
                            message: creator(&buf)?,
                        });
                    }
                    None => {
                        trace!(id, size, "skipping unknown net message");
                        r.skip(size << 3)?;
                    }
                }
                continue;
            }

            let buf = r.read_bytes(size)?;
            if let Some(msg) = self.decode_known(msg_type, &buf)? {
                out.push(msg);
            }
        }
        Ok(())
    }

    fn decode_known(&self, msg_type: MessageType, buf: &[u8]) -> Result<Option<NetMessage>> {
        Ok(match msg_type {
            MessageType::Tick => Some(NetMessage::Tick(CnetMsgTick::decode(buf)?)),
            MessageType::SetConVar => {
                Some(NetMessage::SetConVar(CnetMsgSetConVar::decode(buf)?))
            }
            MessageType::ServerInfo => Some(NetMessage::ServerInfo(Box::new(
                CsvcMsgServerInfo::decode(buf)?,
            ))),
            MessageType::CreateStringTable => {
                let params = match self.protocol {
                    DemoProtocol::Source1 => CsvcMsgCreateStringTable::decode(buf)?.into(),
                    DemoProtocol::Source2 => CsvcMsgCreateStringTableS2::decode(buf)?.into(),
                };
                Some(NetMessage::CreateStringTable(params))
            }
            MessageType::UpdateStringTable => Some(NetMessage::UpdateStringTable(
                CsvcMsgUpdateStringTable::decode(buf)?,
            )),
            MessageType::ClearAllStringTables => Some(NetMessage::ClearAllStringTables),
            MessageType::PacketEntities => Some(NetMessage::PacketEntities(
                CsvcMsgPacketEntities::decode(buf)?,
            )),
            MessageType::GameEvent => Some(NetMessage::GameEvent(CsvcMsgGameEvent::decode(buf)?)),
            MessageType::GameEventList => Some(NetMessage::GameEventList(
                CsvcMsgGameEventList::decode(buf)?,
            )),
            // The embedded class-info message is redundant with the frame.
            MessageType::SignonState | MessageType::ClassInfo => None,
            MessageType::Skippable(_) | MessageType::Other(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint(mut v: u32, out: &mut Vec<u8>) {
        loop {
            let mut b = (v & 0x7F) as u8;
            v >>= 7;
            if v != 0 {
                b |= 0x80;
            }
            out.push(b);
            if v == 0 {
                break;
            }
        }
    }

    fn s1_packet(messages: &[(u32, Vec<u8>)]) -> Vec<u8> {
        let mut payload = Vec::new();
        for (id, bytes) in messages {
            varint(*id, &mut payload);
            varint(bytes.len() as u32, &mut payload);
            payload.extend_from_slice(bytes);
        }
        payload
    }

    fn encoded_server_info() -> Vec<u8> {
        let msg = CsvcMsgServerInfo {
            tick_interval: Some(1.0 / 64.0),
            map_name: Some("de_inferno".to_string()),
            ..Default::default()
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn demuxes_known_messages_and_skips_unknown() {
        let payload = s1_packet(&[
            (8, encoded_server_info()),
            (999, vec![1, 2, 3, 4]), // unknown, skipped
            (4, {
                let mut buf = Vec::new();
                CnetMsgTick {
                    tick: 1234,
                    ..Default::default()
                }
                .encode(&mut buf)
                .unwrap();
                buf
            }),
        ]);

        let demux = NetMessageDemux::new(DemoProtocol::Source1, HashMap::new());
        let mut out = Vec::new();
        demux.demux_packet(&payload, &mut out).unwrap();

        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], NetMessage::ServerInfo(_)));
        assert!(matches!(out[1], NetMessage::Tick(CnetMsgTick { tick: 1234, .. })));
    }

    #[test]
    fn additional_creator_claims_unknown_id() {
        let mut creators: HashMap<u32, NetMessageCreator> = HashMap::new();
        creators.insert(
            999,
            Box::new(|bytes| Ok(Arc::new(bytes.to_vec()) as Arc<dyn Any + Send + Sync>)),
        );

        let payload = s1_packet(&[(999, vec![9, 9, 9])]);
        let demux = NetMessageDemux::new(DemoProtocol::Source1, creators);
        let mut out = Vec::new();
        demux.demux_packet(&payload, &mut out).unwrap();

        assert_eq!(out.len(), 1);
        match &out[0] {
            NetMessage::Additional { id, message } => {
                assert_eq!(*id, 999);
                let bytes = message.downcast_ref::<Vec<u8>>().unwrap();
                assert_eq!(bytes, &vec![9, 9, 9]);
            }
            _ => panic!("expected additional message"),
        }
    }

    #[test]
    fn skippable_messages_produce_nothing() {
        // 14 is voice init in the Source 1 table.
        let payload = s1_packet(&[(14, vec![0xFF; 16])]);
        let demux = NetMessageDemux::new(DemoProtocol::Source1, HashMap::new());
        let mut out = Vec::new();
        demux.demux_packet(&payload, &mut out).unwrap();
        assert!(out.is_empty());
    }
}
