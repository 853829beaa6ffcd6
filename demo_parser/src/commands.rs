use crate::error::ParseError;

/// Which container format the demo uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoProtocol {
    /// "HL2DEMO\0" container with fixed-width frame headers.
    Source1,
    /// "PBDEMS2\0" container with varint frame headers and snappy payloads.
    Source2,
}

/// Source 2 frame commands carry the compressed flag in the high bit range.
pub const S2_COMPRESSED_FLAG: u32 = 64;

/// Outer frame kind, unified over both containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    SignOn,
    Packet,
    SyncTick,
    ConsoleCmd,
    UserCmd,
    DataTables,
    Stop,
    CustomData,
    StringTables,
    FullPacket,
    ClassInfo,
    FileHeader,
    FileInfo,
    /// Known but irrelevant commands that are skipped wholesale.
    Reserved(u32),
}

impl FrameKind {
    pub fn from_source1(cmd: u8) -> Result<Self, ParseError> {
        Ok(match cmd {
            1 => FrameKind::SignOn,
            2 => FrameKind::Packet,
            3 => FrameKind::SyncTick,
            4 => FrameKind::ConsoleCmd,
            5 => FrameKind::UserCmd,
            6 => FrameKind::DataTables,
            7 => FrameKind::Stop,
            8 => FrameKind::CustomData,
            9 => FrameKind::StringTables,
            other => return Err(ParseError::UnknownFrameKind(other as u32)),
        })
    }

    // EDemoCommands
    pub fn from_source2(cmd: u32) -> Result<Self, ParseError> {
        Ok(match cmd {
            0 => FrameKind::Stop,
            1 => FrameKind::FileHeader,
            2 => FrameKind::FileInfo,
            3 => FrameKind::SyncTick,
            4 => FrameKind::DataTables,
            5 => FrameKind::ClassInfo,
            6 => FrameKind::StringTables,
            7 => FrameKind::Packet,
            8 => FrameKind::SignOn,
            9 => FrameKind::ConsoleCmd,
            10 => FrameKind::CustomData,
            11 | 14 | 15 | 16 => FrameKind::Reserved(cmd),
            12 => FrameKind::UserCmd,
            13 => FrameKind::FullPacket,
            other => return Err(ParseError::UnknownFrameKind(other)),
        })
    }
}

/// Embedded net-message discriminator, unified over both protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Tick,
    SetConVar,
    SignonState,
    ServerInfo,
    ClassInfo,
    CreateStringTable,
    UpdateStringTable,
    ClearAllStringTables,
    GameEvent,
    PacketEntities,
    GameEventList,
    /// Recognized but deliberately not decoded.
    Skippable(u32),
    /// Not recognized; candidates for additional creators.
    Other(u32),
}

impl MessageType {
    pub fn from_id(id: u32, protocol: DemoProtocol) -> Self {
        match protocol {
            DemoProtocol::Source1 => Self::from_source1(id),
            DemoProtocol::Source2 => Self::from_source2(id),
        }
    }

    fn from_source1(id: u32) -> Self {
        match id {
            4 => MessageType::Tick,
            6 => MessageType::SetConVar,
            7 => MessageType::SignonState,
            8 => MessageType::ServerInfo,
            10 => MessageType::ClassInfo,
            12 => MessageType::CreateStringTable,
            13 => MessageType::UpdateStringTable,
            25 => MessageType::GameEvent,
            26 => MessageType::PacketEntities,
            30 => MessageType::GameEventList,
            // Voice, sounds, view, temp entities, prefetch, avatars.
            14 | 15 | 17 | 18 | 27 | 28 | 100 => MessageType::Skippable(id),
            other => MessageType::Other(other),
        }
    }

    fn from_source2(id: u32) -> Self {
        match id {
            4 => MessageType::Tick,
            6 => MessageType::SetConVar,
            7 => MessageType::SignonState,
            40 => MessageType::ServerInfo,
            42 => MessageType::ClassInfo,
            44 => MessageType::CreateStringTable,
            45 => MessageType::UpdateStringTable,
            51 => MessageType::ClearAllStringTables,
            55 => MessageType::PacketEntities,
            205 => MessageType::GameEventList,
            207 => MessageType::GameEvent,
            // Voice, print, sounds, view, cmd key-values, user messages.
            46..=50 | 52..=54 | 56..=63 | 70..=75 => MessageType::Skippable(id),
            other => MessageType::Other(other),
        }
    }
}
