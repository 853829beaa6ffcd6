use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prost::Message;

use demo_parser::demux::CDemoPacket;
use demo_parser::events::{Event, EventKind};
use demo_parser::gameevent::{
    CsvcMsgGameEvent, CsvcMsgGameEventList, DescriptorKeyT, DescriptorT, KeyT,
};
use demo_parser::player::CMsgPlayerInfo;
use demo_parser::stringtable::CsvcMsgCreateStringTableS2;
use demo_parser::{Dispatchable, Parser, ParserConfig};

const MAX_OS_PATH: usize = 260;

// LSB-first bit writer matching the parser's wire layout.
struct BitWriter {
    bytes: Vec<u8>,
    bit: usize,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            bit: 0,
        }
    }

    fn push_bits(&mut self, value: u64, n: usize) {
        for i in 0..n {
            if self.bit & 7 == 0 {
                self.bytes.push(0);
            }
            if (value >> i) & 1 == 1 {
                let idx = self.bit >> 3;
                self.bytes[idx] |= 1 << (self.bit & 7);
            }
            self.bit += 1;
        }
    }

    fn push_bit(&mut self, b: bool) {
        self.push_bits(b as u64, 1);
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.push_bits(*b as u64, 8);
        }
    }

    // The 6-bit prefixed variable integer used for embedded message ids.
    fn push_ubitint(&mut self, v: u64) {
        let low = v & 15;
        let rest = v >> 4;
        if rest == 0 {
            self.push_bits(v, 6);
        } else if rest < 1 << 4 {
            self.push_bits(16 | low, 6);
            self.push_bits(rest, 4);
        } else if rest < 1 << 8 {
            self.push_bits(32 | low, 6);
            self.push_bits(rest, 8);
        } else {
            self.push_bits(48 | low, 6);
            self.push_bits(rest, 28);
        }
    }

    fn push_varint(&mut self, mut v: u64) {
        loop {
            let mut b = (v & 0x7F) as u8;
            v >>= 7;
            if v != 0 {
                b |= 0x80;
            }
            self.push_bits(b as u64, 8);
            if v == 0 {
                break;
            }
        }
    }
}

fn varint_bytes(mut v: u32, out: &mut Vec<u8>) {
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

fn source2_stream(frames: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"PBDEMS2\0");
    buf.extend_from_slice(&0_i32.to_le_bytes());
    buf.extend_from_slice(&0_i32.to_le_bytes());
    for (cmd, tick, payload) in frames {
        varint_bytes(*cmd, &mut buf);
        varint_bytes(*tick, &mut buf);
        varint_bytes(payload.len() as u32, &mut buf);
        buf.extend_from_slice(payload);
    }
    buf
}

fn source1_header_only() -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"HL2DEMO\0");
    buf.extend_from_slice(&4_i32.to_le_bytes());
    buf.extend_from_slice(&13869_i32.to_le_bytes());
    for name in ["gotv.example.net", "GOTV Demo", "de_nuke", "csgo"] {
        let mut field = name.as_bytes().to_vec();
        field.resize(MAX_OS_PATH, 0);
        buf.extend_from_slice(&field);
    }
    buf.extend_from_slice(&120.0_f32.to_le_bytes());
    buf.extend_from_slice(&7680_i32.to_le_bytes());
    buf.extend_from_slice(&3840_i32.to_le_bytes());
    buf.extend_from_slice(&0_i32.to_le_bytes());
    // One Stop frame: command, tick, recording slot.
    buf.push(7);
    buf.extend_from_slice(&7680_i32.to_le_bytes());
    buf.push(0);
    // Pad past the reader's sled.
    buf.resize(buf.len() + 16, 0);
    buf
}

// Embedded net messages wrapped into a CDemoPacket payload.
fn packet_payload(messages: &[(u64, Vec<u8>)]) -> Vec<u8> {
    let mut w = BitWriter::new();
    for (id, bytes) in messages {
        w.push_ubitint(*id);
        w.push_varint(bytes.len() as u64);
        w.push_bytes(bytes);
    }
    let packet = CDemoPacket {
        data: Some(w.bytes),
    };
    let mut out = Vec::new();
    packet.encode(&mut out).unwrap();
    out
}

fn weapon_fire_event_list() -> Vec<u8> {
    let list = CsvcMsgGameEventList {
        descriptors: vec![DescriptorT {
            eventid: 10,
            name: "weapon_fire".to_string(),
            keys: vec![
                DescriptorKeyT {
                    r#type: 4,
                    name: "userid".to_string(),
                },
                DescriptorKeyT {
                    r#type: 1,
                    name: "weapon".to_string(),
                },
                DescriptorKeyT {
                    r#type: 6,
                    name: "silenced".to_string(),
                },
            ],
        }],
    };
    let mut buf = Vec::new();
    list.encode(&mut buf).unwrap();
    buf
}

fn weapon_fire_event(userid: i32) -> Vec<u8> {
    let event = CsvcMsgGameEvent {
        event_name: None,
        eventid: Some(10),
        passthrough: None,
        keys: vec![
            KeyT {
                r#type: 4,
                val_short: userid,
                ..Default::default()
            },
            KeyT {
                r#type: 1,
                val_string: "weapon_ak47".to_string(),
                ..Default::default()
            },
            KeyT {
                r#type: 6,
                val_bool: false,
                ..Default::default()
            },
        ],
    };
    let mut buf = Vec::new();
    event.encode(&mut buf).unwrap();
    buf
}

fn userinfo_create_table(entity_index: u32, player: &CMsgPlayerInfo) -> Vec<u8> {
    let mut player_bytes = Vec::new();
    player.encode(&mut player_bytes).unwrap();

    let mut w = BitWriter::new();
    w.push_bit(true); // sequential index
    w.push_bit(true); // has key
    w.push_bit(false); // no history prefix
    w.push_bytes(format!("{entity_index}").as_bytes());
    w.push_bits(0, 8); // key terminator
    w.push_bit(true); // has user data
    w.push_bits(player_bytes.len() as u64, 17);
    w.push_bytes(&player_bytes);

    let msg = CsvcMsgCreateStringTableS2 {
        name: Some("userinfo".to_string()),
        num_entries: Some(1),
        user_data_fixed_size: Some(false),
        user_data_size: Some(0),
        user_data_size_bits: Some(0),
        flags: Some(0),
        string_data: Some(w.bytes),
        uses_varint_bitcounts: Some(false),
    };
    let mut buf = Vec::new();
    msg.encode(&mut buf).unwrap();
    buf
}

// A small Source 2 demo: descriptors, a player registration, three shots
// over two ticks, then stop.
fn shooting_demo() -> Vec<u8> {
    let player = CMsgPlayerInfo {
        name: Some("chopper".to_string()),
        xuid: Some(76561198000000001),
        userid: Some(7),
        steamid: Some(76561198000000001),
        fakeplayer: Some(false),
        ishltv: Some(false),
    };

    source2_stream(&[
        (
            7,
            1,
            packet_payload(&[
                (205, weapon_fire_event_list()),
                (44, userinfo_create_table(2, &player)),
            ]),
        ),
        (
            7,
            2,
            packet_payload(&[(207, weapon_fire_event(7)), (207, weapon_fire_event(7))]),
        ),
        (7, 3, packet_payload(&[(207, weapon_fire_event(7))])),
        (0, 4, Vec::new()),
    ])
}

type EventLog = Arc<Mutex<Vec<String>>>;

fn record_all_events(parser: &mut Parser<Cursor<Vec<u8>>>) -> EventLog {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let log_clone = log.clone();
    parser.register_event_handler_any(move |event| {
        let line = match event {
            Event::WeaponFire(fire) => format!("weapon_fire:{}:{}", fire.userid, fire.weapon),
            Event::FrameDone(done) => format!("frame_done:{}:{}", done.tick, done.frame),
            other => format!("{:?}", other.tag()),
        };
        log_clone.lock().unwrap().push(line);
    });
    log
}

fn parse_with_queue_size(bytes: Vec<u8>, queue_size: i32) -> Vec<String> {
    let config = ParserConfig {
        msg_queue_buffer_size: queue_size,
        ..ParserConfig::default()
    };
    let mut parser = Parser::with_config(Cursor::new(bytes), config).unwrap();
    let log = record_all_events(&mut parser);
    parser.parse_to_end().unwrap();
    parser.close().unwrap();
    let result = log.lock().unwrap().clone();
    result
}

#[test]
fn header_only_demo_reports_rates() {
    let config = ParserConfig {
        msg_queue_buffer_size: 0,
        ..ParserConfig::default()
    };
    let mut parser = Parser::with_config(Cursor::new(source1_header_only()), config).unwrap();

    let header = parser.header().unwrap();
    assert_eq!(header.map_name, "de_nuke");
    assert_eq!(header.playback_ticks, 7680);
    assert_eq!(header.playback_frames, 3840);
    assert_eq!(header.frame_rate(), 32.0);

    assert_eq!(parser.tick_rate(), 64.0);
    assert_eq!(parser.tick_time(), Duration::from_nanos(15_625_000));

    parser.parse_to_end().unwrap();
    assert!(parser.progress() > 0.0);
    assert!(parser.progress() < 1.0);
    parser.close().unwrap();
}

#[test]
fn events_flow_through_typed_handlers() {
    let config = ParserConfig {
        msg_queue_buffer_size: 0,
        ..ParserConfig::default()
    };
    let mut parser = Parser::with_config(Cursor::new(shooting_demo()), config).unwrap();

    let fires: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let fires_clone = fires.clone();
    parser.register_event_handler(EventKind::WeaponFire, move |event| {
        if let Event::WeaponFire(fire) = event {
            fires_clone.lock().unwrap().push(fire.userid);
        }
    });

    parser.parse_to_end().unwrap();

    assert_eq!(fires.lock().unwrap().as_slice(), &[7, 7, 7]);

    // The userinfo table registered the shooter.
    let players = parser.participants().by_user_id();
    assert_eq!(players.len(), 1);
    assert_eq!(players.get(&7).unwrap().name, "chopper");
    assert_eq!(players.get(&7).unwrap().steam_id, 76561198000000001);
    parser.close().unwrap();
}

#[test]
fn queue_modes_emit_identical_event_sequences() {
    let synchronous = parse_with_queue_size(shooting_demo(), 0);
    let queued = parse_with_queue_size(shooting_demo(), 65536);

    assert!(!synchronous.is_empty());
    assert_eq!(synchronous, queued);
}

#[test]
fn reparsing_the_same_demo_is_deterministic() {
    let first = parse_with_queue_size(shooting_demo(), 0);
    let second = parse_with_queue_size(shooting_demo(), 0);
    assert_eq!(first, second);
}

#[test]
fn unregistered_handlers_stop_receiving() {
    let config = ParserConfig {
        msg_queue_buffer_size: 0,
        ..ParserConfig::default()
    };
    let mut parser = Parser::with_config(Cursor::new(shooting_demo()), config).unwrap();

    let typed_count = Arc::new(Mutex::new(0_usize));
    let any_count = Arc::new(Mutex::new(0_usize));

    let typed_clone = typed_count.clone();
    let h1 = parser.register_event_handler(EventKind::WeaponFire, move |_| {
        *typed_clone.lock().unwrap() += 1;
    });
    let any_clone = any_count.clone();
    parser.register_event_handler_any(move |event| {
        if matches!(event, Event::WeaponFire(_)) {
            *any_clone.lock().unwrap() += 1;
        }
    });

    assert!(parser.unregister_event_handler(h1));
    assert!(!parser.unregister_event_handler(h1));

    parser.parse_to_end().unwrap();

    assert_eq!(*typed_count.lock().unwrap(), 0);
    assert_eq!(*any_count.lock().unwrap(), 3);
    parser.close().unwrap();
}

#[test]
fn additional_net_message_creators_receive_payloads() {
    use std::any::Any;

    // Wrap an unknown message id into a packet frame.
    let payload = packet_payload(&[(700, vec![1, 2, 3])]);
    let bytes = source2_stream(&[(7, 1, payload), (0, 2, Vec::new())]);

    let mut creators = ahash::AHashMap::default();
    creators.insert(
        700_u32,
        Box::new(|bytes: &[u8]| {
            Ok(Arc::new(bytes.to_vec()) as Arc<dyn Any + Send + Sync>)
        }) as demo_parser::demux::NetMessageCreator,
    );

    let config = ParserConfig {
        msg_queue_buffer_size: 0,
        additional_net_message_creators: creators,
        ..ParserConfig::default()
    };
    let mut parser = Parser::with_config(Cursor::new(bytes), config).unwrap();

    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    parser.register_net_message_handler(
        demo_parser::demux::NetMessageKind::Additional(700),
        move |msg| {
            if let demo_parser::demux::NetMessage::Additional { message, .. } = msg {
                if let Some(bytes) = message.downcast_ref::<Vec<u8>>() {
                    seen_clone.lock().unwrap().push(bytes.to_owned());
                }
            }
        },
    );

    parser.parse_to_end().unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), &[vec![1, 2, 3]]);
    parser.close().unwrap();
}
