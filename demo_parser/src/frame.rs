use std::io::{Read, Seek};

use demo_bitreader::{BitError, BitReader};
use prost::Message;

use crate::commands::{DemoProtocol, FrameKind, S2_COMPRESSED_FLAG};
use crate::error::{ParseError, Result};
use crate::header::Header;

// Per-frame command info recorded by the Source 1 engine between the frame
// header and the payload: origin/angles snapshot plus two sequence numbers.
const S1_COMMAND_INFO_BITS: usize = (152 + 4 + 4) << 3;

/// One outer record of the demo container, payload decompressed.
#[derive(Debug, Clone)]
pub struct Frame {
    pub tick: i32,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CDemoFileHeader {
    #[prost(int32, optional, tag = "1")]
    pub network_protocol: Option<i32>,
    #[prost(string, optional, tag = "2")]
    pub server_name: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub client_name: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub map_name: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub game_directory: Option<String>,
    #[prost(int32, optional, tag = "6")]
    pub fullpackets_version: Option<i32>,
    #[prost(bool, optional, tag = "7")]
    pub allow_clientside_entities: Option<bool>,
    #[prost(bool, optional, tag = "8")]
    pub allow_clientside_particles: Option<bool>,
    #[prost(string, optional, tag = "9")]
    pub addons: Option<String>,
    #[prost(string, optional, tag = "10")]
    pub demo_version_name: Option<String>,
    #[prost(string, optional, tag = "11")]
    pub demo_version_guid: Option<String>,
    #[prost(int32, optional, tag = "12")]
    pub build_num: Option<i32>,
    #[prost(string, optional, tag = "13")]
    pub game: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CDemoFileInfo {
    #[prost(float, optional, tag = "1")]
    pub playback_time: Option<f32>,
    #[prost(int32, optional, tag = "2")]
    pub playback_ticks: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub playback_frames: Option<i32>,
}

/// Decodes the outer framing of a demo stream and keeps the header current.
pub struct DemoFrameReader<T>
where
    T: Read + Seek + Send,
{
    reader: BitReader<T>,
    header: Header,
}

impl<T> DemoFrameReader<T>
where
    T: Read + Seek + Send,
{
    pub fn new(mut reader: BitReader<T>) -> Result<Self> {
        let header = Header::parse(&mut reader)?;
        Ok(Self { reader, header })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Consumes the reader, returning its backing buffer to the pool.
    pub fn pool(self) -> std::result::Result<(), BitError> {
        self.reader.pool()
    }

    /// Reads the next frame. `Ok(None)` means clean end of stream.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.header.protocol_kind {
            DemoProtocol::Source1 => self.next_frame_source1(),
            DemoProtocol::Source2 => self.next_frame_source2(),
        }
    }

    fn next_frame_source1(&mut self) -> Result<Option<Frame>> {
        let cmd = match self.reader.read_single_byte() {
            Ok(b) => b,
            Err(BitError::UnexpectedEof) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let kind = FrameKind::from_source1(cmd)?;
        let tick = self.reader.read_signed_int(32)? as i32;
        // Recording player slot; always -1 for GOTV demos.
        self.reader.skip(8)?;

        let payload = match kind {
            FrameKind::SignOn | FrameKind::Packet => {
                self.reader.skip(S1_COMMAND_INFO_BITS)?;
                self.read_size_prefixed()?
            }
            FrameKind::SyncTick | FrameKind::Stop => Vec::new(),
            FrameKind::UserCmd => {
                // Outgoing sequence number.
                self.reader.skip(32)?;
                self.read_size_prefixed()?
            }
            FrameKind::CustomData => {
                // Callback index.
                self.reader.skip(32)?;
                self.read_size_prefixed()?
            }
            FrameKind::ConsoleCmd | FrameKind::DataTables | FrameKind::StringTables => {
                self.read_size_prefixed()?
            }
            // The remaining kinds only exist in Source 2 containers.
            _ => return Err(ParseError::UnknownFrameKind(cmd as u32)),
        };

        Ok(Some(Frame {
            tick,
            kind,
            payload,
        }))
    }

    fn next_frame_source2(&mut self) -> Result<Option<Frame>> {
        let raw_cmd = match self.reader.read_varint32() {
            Ok(v) => v,
            Err(BitError::UnexpectedEof) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let compressed = raw_cmd & S2_COMPRESSED_FLAG != 0;
        let kind = FrameKind::from_source2(raw_cmd & !S2_COMPRESSED_FLAG)?;

        let tick = self.reader.read_varint32()? as i32;
        // Pre-game records use the all-ones tick.
        let tick = if tick == -1 { 0 } else { tick };

        let size = self.reader.read_varint32()? as usize;
        let mut payload = self.reader.read_bytes(size)?;

        if compressed {
            payload = snap::raw::Decoder::new().decompress_vec(&payload)?;
        }

        match kind {
            FrameKind::FileHeader => {
                let msg = CDemoFileHeader::decode(payload.as_slice())?;
                self.header.network_protocol = msg.network_protocol();
                self.header.server_name = msg.server_name().to_string();
                self.header.client_name = msg.client_name().to_string();
                self.header.map_name = msg.map_name().to_string();
                self.header.game_directory = msg.game_directory().to_string();
            }
            FrameKind::FileInfo => {
                let msg = CDemoFileInfo::decode(payload.as_slice())?;
                self.header.playback_time = msg.playback_time();
                self.header.playback_ticks = msg.playback_ticks();
                self.header.playback_frames = msg.playback_frames();
            }
            _ => {}
        }

        Ok(Some(Frame {
            tick,
            kind,
            payload,
        }))
    }

    fn read_size_prefixed(&mut self) -> Result<Vec<u8>> {
        let size = self.reader.read_signed_int(32)? as usize;
        Ok(self.reader.read_bytes(size)?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::header::MAGIC_SOURCE2;

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

    fn source2_stream(frames: &[(u32, u32, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC_SOURCE2);
        buf.extend_from_slice(&0_i32.to_le_bytes());
        buf.extend_from_slice(&0_i32.to_le_bytes());
        for (cmd, tick, payload) in frames {
            varint(*cmd, &mut buf);
            varint(*tick, &mut buf);
            varint(payload.len() as u32, &mut buf);
            buf.extend_from_slice(payload);
        }
        buf
    }

    #[test]
    fn reads_source2_frames_until_stop() {
        let bytes = source2_stream(&[(3, 5, &[]), (7, 6, b"abc"), (0, 7, &[])]);
        let reader = BitReader::new_small_bit_reader(Cursor::new(bytes)).unwrap();
        let mut fr = DemoFrameReader::new(reader).unwrap();

        let f = fr.next_frame().unwrap().unwrap();
        assert_eq!(f.kind, FrameKind::SyncTick);
        assert_eq!(f.tick, 5);

        let f = fr.next_frame().unwrap().unwrap();
        assert_eq!(f.kind, FrameKind::Packet);
        assert_eq!(f.payload, b"abc");

        let f = fr.next_frame().unwrap().unwrap();
        assert_eq!(f.kind, FrameKind::Stop);
    }

    #[test]
    fn decompresses_flagged_source2_payloads() {
        let raw = b"the quick brown fox jumps over the lazy dog".to_vec();
        let compressed = snap::raw::Encoder::new().compress_vec(&raw).unwrap();
        let bytes = source2_stream(&[(7 | S2_COMPRESSED_FLAG, 1, &compressed)]);
        let reader = BitReader::new_small_bit_reader(Cursor::new(bytes)).unwrap();
        let mut fr = DemoFrameReader::new(reader).unwrap();

        let f = fr.next_frame().unwrap().unwrap();
        assert_eq!(f.kind, FrameKind::Packet);
        assert_eq!(f.payload, raw);
    }

    #[test]
    fn file_info_patches_header() {
        let info = CDemoFileInfo {
            playback_time: Some(120.0),
            playback_ticks: Some(7680),
            playback_frames: Some(3840),
        };
        let mut payload = Vec::new();
        info.encode(&mut payload).unwrap();
        let bytes = source2_stream(&[(2, 0, &payload)]);
        let reader = BitReader::new_small_bit_reader(Cursor::new(bytes)).unwrap();
        let mut fr = DemoFrameReader::new(reader).unwrap();

        fr.next_frame().unwrap().unwrap();
        assert_eq!(fr.header().playback_ticks, 7680);
        assert_eq!(fr.header().tick_rate(), 64.0);
    }

    #[test]
    fn eof_at_frame_boundary_is_clean_end() {
        let bytes = source2_stream(&[]);
        let reader = BitReader::new_small_bit_reader(Cursor::new(bytes)).unwrap();
        let mut fr = DemoFrameReader::new(reader).unwrap();
        assert!(fr.next_frame().unwrap().is_none());
    }
}
