use std::io::{Read, Seek};
use std::time::Duration;

use demo_bitreader::BitReader;

use crate::commands::DemoProtocol;
use crate::error::{ParseError, Result};

const MAX_OS_PATH: usize = 260;

pub const MAGIC_SOURCE1: &[u8; 8] = b"HL2DEMO\0";
pub const MAGIC_SOURCE2: &[u8; 8] = b"PBDEMS2\0";

/// Demo header. For Source 1 files every field is read up front; for
/// Source 2 files the string fields and playback counts arrive later in
/// `FileHeader` / `FileInfo` frames and are patched in as they are seen.
#[derive(Debug, PartialEq, Clone)]
pub struct Header {
    pub protocol_kind: DemoProtocol,
    pub filestamp: String,
    pub protocol: i32,
    pub network_protocol: i32,
    pub server_name: String,
    pub client_name: String,
    pub map_name: String,
    pub game_directory: String,
    pub playback_time: f32,
    pub playback_ticks: i32,
    pub playback_frames: i32,
    pub signon_length: i32,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            protocol_kind: DemoProtocol::Source2,
            filestamp: String::new(),
            protocol: 0,
            network_protocol: 0,
            server_name: String::new(),
            client_name: String::new(),
            map_name: String::new(),
            game_directory: String::new(),
            playback_time: 0.0,
            playback_ticks: 0,
            playback_frames: 0,
            signon_length: 0,
        }
    }
}

impl Header {
    /// Parses the fixed 1072-byte Source 1 header following the magic.
    pub fn parse_source1<T: Read + Seek + Send>(r: &mut BitReader<T>) -> Result<Self> {
        Ok(Self {
            protocol_kind: DemoProtocol::Source1,
            filestamp: String::from_utf8_lossy(MAGIC_SOURCE1)
                .trim_end_matches('\0')
                .to_string(),
            protocol: r.read_signed_int(32)? as i32,
            network_protocol: r.read_signed_int(32)? as i32,
            server_name: r.read_cstring(MAX_OS_PATH)?,
            client_name: r.read_cstring(MAX_OS_PATH)?,
            map_name: r.read_cstring(MAX_OS_PATH)?,
            game_directory: r.read_cstring(MAX_OS_PATH)?,
            playback_time: r.read_float()?,
            playback_ticks: r.read_signed_int(32)? as i32,
            playback_frames: r.read_signed_int(32)? as i32,
            signon_length: r.read_signed_int(32)? as i32,
        })
    }

    /// Parses the Source 2 preamble following the magic: two file offsets.
    /// The rest of the header is filled from later frames.
    pub fn parse_source2<T: Read + Seek + Send>(r: &mut BitReader<T>) -> Result<Self> {
        let _summary_offset = r.read_signed_int(32)?;
        let _unknown_offset = r.read_signed_int(32)?;
        Ok(Self {
            protocol_kind: DemoProtocol::Source2,
            filestamp: String::from_utf8_lossy(MAGIC_SOURCE2)
                .trim_end_matches('\0')
                .to_string(),
            ..Self::default()
        })
    }

    pub fn parse<T: Read + Seek + Send>(r: &mut BitReader<T>) -> Result<Self> {
        let mut magic = [0_u8; 8];
        r.read_bytes_into(&mut magic)
            .map_err(|_| ParseError::InvalidHeader("truncated magic"))?;
        match &magic {
            m if m == MAGIC_SOURCE1 => Self::parse_source1(r),
            m if m == MAGIC_SOURCE2 => Self::parse_source2(r),
            _ => Err(ParseError::InvalidHeader("magic mismatch")),
        }
    }

    /// Demo-frame recording rate. Zero for corrupt headers.
    pub fn frame_rate(&self) -> f64 {
        if self.playback_time == 0.0 {
            return 0.0;
        }
        self.playback_frames as f64 / self.playback_time as f64
    }

    /// Duration of one demo frame. Zero for corrupt headers.
    pub fn frame_time(&self) -> Duration {
        if self.playback_frames == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.playback_time as f64 / self.playback_frames as f64)
    }

    /// Server tick rate as recorded in the header. Zero for corrupt headers.
    pub fn tick_rate(&self) -> f64 {
        if self.playback_time == 0.0 {
            return 0.0;
        }
        self.playback_ticks as f64 / self.playback_time as f64
    }

    /// Duration of one server tick. Zero for corrupt headers.
    pub fn tick_time(&self) -> Duration {
        if self.playback_ticks == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.playback_time as f64 / self.playback_ticks as f64)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn source1_header_bytes() -> Vec<u8> {
        let mut buf = Vec::with_capacity(1072);
        buf.extend_from_slice(MAGIC_SOURCE1);
        buf.extend_from_slice(&4_i32.to_le_bytes());
        buf.extend_from_slice(&13_869_i32.to_le_bytes());
        for name in ["gotv.example.net", "GOTV Demo", "de_nuke", "csgo"] {
            let mut field = name.as_bytes().to_vec();
            field.resize(MAX_OS_PATH, 0);
            buf.extend_from_slice(&field);
        }
        buf.extend_from_slice(&120.0_f32.to_le_bytes());
        buf.extend_from_slice(&7680_i32.to_le_bytes());
        buf.extend_from_slice(&3840_i32.to_le_bytes());
        buf.extend_from_slice(&0_i32.to_le_bytes());
        buf
    }

    #[test]
    fn parses_source1_header() {
        let mut bytes = source1_header_bytes();
        bytes.resize(bytes.len() + 64, 0);
        let mut r = BitReader::new_small_bit_reader(Cursor::new(bytes)).unwrap();
        let h = Header::parse(&mut r).unwrap();

        assert_eq!(h.protocol_kind, DemoProtocol::Source1);
        assert_eq!(h.map_name, "de_nuke");
        assert_eq!(h.server_name, "gotv.example.net");
        assert_eq!(h.playback_ticks, 7680);
        assert_eq!(h.tick_rate(), 64.0);
        assert_eq!(h.frame_rate(), 32.0);
        assert_eq!(h.tick_time(), Duration::from_nanos(15_625_000));
    }

    #[test]
    fn zeroed_header_reports_zero_rates() {
        let h = Header::default();
        assert_eq!(h.frame_rate(), 0.0);
        assert_eq!(h.frame_time(), Duration::ZERO);
        assert_eq!(h.tick_rate(), 0.0);
        assert_eq!(h.tick_time(), Duration::ZERO);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = b"NOTADEMO".to_vec();
        bytes.resize(64, 0);
        let mut r = BitReader::new_small_bit_reader(Cursor::new(bytes)).unwrap();
        assert!(matches!(
            Header::parse(&mut r),
            Err(ParseError::InvalidHeader("magic mismatch"))
        ));
    }
}
