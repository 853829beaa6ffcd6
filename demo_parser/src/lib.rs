pub mod commands;
pub mod common;
pub mod convar;
pub mod demux;
pub mod entity;
pub mod equipment;
pub mod error;
pub mod events;
pub mod fieldpath;
pub mod frame;
pub mod gameevent;
pub mod gamestate;
pub mod header;
pub mod mimic;
pub mod player;
pub mod sendtable;
pub mod serializers;
pub mod serverclass;
pub mod serverinfo;
pub mod stringtable;
pub mod team;
pub mod tick;

#[cfg(test)]
pub(crate) mod testutil;

use std::fs::File;
use std::io::{Read, Seek};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use demo_bitreader::BitReader;
use parking_lot::Mutex;
use tracing::warn;

use crate::commands::{DemoProtocol, FrameKind};
use crate::demux::{NetMessage, NetMessageCreator, NetMessageDemux, NetMessageKind};
use crate::entity::{Entity, EntityOp, EntityStore};
use crate::error::{ParseError, Result};
use crate::events::{Event, EventKind, FrameDone, ParserWarn};
use crate::frame::DemoFrameReader;
use crate::gameevent::GameEventDecoder;
use crate::gamestate::{GameState, Participants};
use crate::header::Header;
use crate::mimic::MimicSource1Events;
use crate::serializers::SerializerRegistry;
use crate::serverclass::{PropertyValue, ServerClasses};
use crate::serverinfo::CsvcMsgServerInfo;
use crate::stringtable::{
    StringTableRegistry, ST_NAME_INSTANCE_BASELINE, ST_NAME_USER_INFO,
};

pub use demo_dispatcher::{Dispatchable, Dispatcher, HandlerIdentifier};

/// Input format of the demo stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DemoFormat {
    #[default]
    File,
    CstvBroadcast,
}

/// Parser configuration. `Default` matches the common file-parsing case.
pub struct ParserConfig {
    /// Net-message queue depth. Negative defers sizing until the header is
    /// read (playback ticks become the capacity); zero forces strictly
    /// synchronous execution on the caller's thread.
    pub msg_queue_buffer_size: i32,
    /// Extra message types to decode and dispatch, keyed by message id.
    pub additional_net_message_creators: HashMap<u32, NetMessageCreator>,
    /// Downgrades missing-bombsite errors on bomb events to warnings.
    pub ignore_err_bombsite_index_not_found: bool,
    /// Disables synthesizing legacy events for Source 2 demos.
    pub disable_mimic_source1_events: bool,
    /// Fallback descriptor list for demos recorded under the empty-server
    /// hibernation bug; ignored once an in-band list arrives.
    pub source2_fallback_game_event_list_bin: Option<Vec<u8>>,
    /// Discards the remainder of a packet-entities message that fails to
    /// decode instead of aborting the demo (broken POV recordings).
    pub ignore_packet_entities_panic: bool,
    pub format: DemoFormat,
    /// Retry budget of the external broadcast reader; the input surfaces
    /// as EOF once it elapses.
    pub cstv_timeout: Duration,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            msg_queue_buffer_size: -1,
            additional_net_message_creators: HashMap::new(),
            ignore_err_bombsite_index_not_found: false,
            disable_mimic_source1_events: false,
            source2_fallback_game_event_list_bin: None,
            ignore_packet_entities_panic: false,
            format: DemoFormat::File,
            cstv_timeout: Duration::from_secs(10),
        }
    }
}

type ErrorLatch = Arc<Mutex<Option<ParseError>>>;
type DelayedHandler = Box<dyn FnOnce(&mut GameState, &mut Dispatcher<Event>) + Send>;

/// Drives the parsing pipeline frame by frame.
pub struct Parser<T>
where
    T: Read + Seek + Send,
{
    frame_reader: Option<DemoFrameReader<T>>,
    demux: NetMessageDemux,
    state: ConsumerState,
    msg_queue_buffer_size: i32,
    last_error: ErrorLatch,
    closed: bool,
}

impl Parser<File> {
    /// Opens a demo file with the default configuration.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file_with_config(path, ParserConfig::default())
    }

    pub fn from_file_with_config<P: AsRef<Path>>(path: P, config: ParserConfig) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(demo_bitreader::BitError::Io)?;
        Self::with_config(file, config)
    }
}

/// Parses a whole demo file, letting `configure` register handlers first.
pub fn parse_demo<P: AsRef<Path>>(
    path: P,
    configure: impl FnOnce(&mut Parser<File>) -> Result<()>,
) -> Result<()> {
    let mut parser = Parser::from_file(path)?;
    configure(&mut parser)?;
    let result = parser.parse_to_end();
    parser.close()?;
    result
}

impl<T> Parser<T>
where
    T: Read + Seek + Send,
{
    pub fn new(demostream: T) -> Result<Self> {
        Self::with_config(demostream, ParserConfig::default())
    }

    pub fn with_config(demostream: T, config: ParserConfig) -> Result<Self> {
        let reader = match config.format {
            DemoFormat::File => BitReader::new_large_bit_reader(demostream)?,
            DemoFormat::CstvBroadcast => BitReader::new_small_bit_reader(demostream)?,
        };
        let frame_reader = DemoFrameReader::new(reader)?;
        let protocol = frame_reader.header().protocol_kind;

        let last_error: ErrorLatch = Arc::new(Mutex::new(None));
        let state = ConsumerState::new(protocol, &config, last_error.clone());
        let demux = NetMessageDemux::new(protocol, config.additional_net_message_creators);

        Ok(Self {
            frame_reader: Some(frame_reader),
            demux,
            state,
            msg_queue_buffer_size: config.msg_queue_buffer_size,
            last_error,
            closed: false,
        })
    }

    pub fn header(&self) -> Option<&Header> {
        self.frame_reader.as_ref().map(DemoFrameReader::header)
    }

    pub fn game_state(&self) -> &GameState {
        &self.state.game_state
    }

    pub fn participants(&self) -> Participants<'_> {
        self.state.game_state.participants()
    }

    pub fn entities(&self) -> &EntityStore {
        &self.state.entities
    }

    /// Compiled server classes; stable after `DataTablesParsed` fires.
    pub fn server_classes(&self) -> &ServerClasses {
        &self.state.classes
    }

    pub fn string_tables(&self) -> &StringTableRegistry {
        &self.state.string_tables
    }

    pub fn current_frame(&self) -> i32 {
        self.state.current_frame
    }

    /// Parsing progress in `[0, 1]`. Returns 0 for corrupt headers.
    pub fn progress(&self) -> f64 {
        let frames = self
            .header()
            .map(|h| h.playback_frames)
            .unwrap_or_default();
        if frames <= 0 {
            return 0.0;
        }
        (self.state.current_frame as f64 / frames as f64).min(1.0)
    }

    /// Server tick rate; prefers the in-band server info over the header.
    pub fn tick_rate(&self) -> f64 {
        if self.state.tick_interval != 0.0 {
            return 1.0 / self.state.tick_interval as f64;
        }
        self.header().map(Header::tick_rate).unwrap_or(-1.0)
    }

    /// Duration of one server tick.
    pub fn tick_time(&self) -> Duration {
        if self.state.tick_interval != 0.0 {
            return Duration::from_secs_f64(self.state.tick_interval as f64);
        }
        self.header().map(Header::tick_time).unwrap_or_default()
    }

    /// Time elapsed since the start of the demo.
    pub fn current_time(&self) -> Duration {
        Duration::from_secs_f64(
            (self.state.game_state.ingame_tick.max(0) as f64) * self.state.tick_interval as f64,
        )
    }

    pub fn register_event_handler(
        &mut self,
        kind: EventKind,
        handler: impl FnMut(&Event) + Send + 'static,
    ) -> HandlerIdentifier {
        self.state.event_dispatcher.register(kind, handler)
    }

    /// Registers a handler receiving every event.
    pub fn register_event_handler_any(
        &mut self,
        handler: impl FnMut(&Event) + Send + 'static,
    ) -> HandlerIdentifier {
        self.state.event_dispatcher.register_any(handler)
    }

    pub fn unregister_event_handler(&mut self, id: HandlerIdentifier) -> bool {
        self.state.event_dispatcher.unregister(id)
    }

    pub fn register_net_message_handler(
        &mut self,
        kind: NetMessageKind,
        handler: impl FnMut(&NetMessage) + Send + 'static,
    ) -> HandlerIdentifier {
        self.state.msg_dispatcher.register(kind, handler)
    }

    pub fn unregister_net_message_handler(&mut self, id: HandlerIdentifier) -> bool {
        self.state.msg_dispatcher.unregister(id)
    }

    /// Registers a callback invoked for every changed entry of the named
    /// string table.
    pub fn register_string_table_handler(
        &mut self,
        table: &str,
        handler: impl FnMut(&crate::stringtable::StringTableUpdate) + Send + 'static,
    ) {
        self.state.string_tables.on_table_change(table, handler);
    }

    pub fn register_entity_created_handler(
        &mut self,
        class_name: &str,
        handler: impl FnMut(&Entity) + Send + 'static,
    ) {
        self.state.entities.observers.on_created(class_name, handler);
    }

    pub fn register_entity_property_handler(
        &mut self,
        class_name: &str,
        prop_name: &str,
        handler: impl FnMut(&Entity, &PropertyValue, &PropertyValue) + Send + 'static,
    ) {
        self.state
            .entities
            .observers
            .on_property(class_name, prop_name, handler);
    }

    /// Reads and routes one outer frame. `Ok(false)` once the demo ended.
    pub fn parse_next_frame(&mut self) -> Result<bool> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }

        let frame_reader = match self.frame_reader.as_mut() {
            Some(fr) => fr,
            None => return Err(ParseError::UnexpectedEof),
        };

        let frame = match frame_reader.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(false),
            Err(err) => {
                self.set_error(err);
                return Err(self.take_error().expect("error latched above"));
            }
        };

        let mut messages = Vec::new();
        let result = self
            .demux
            .demux_frame(&frame, &mut messages)
            .and_then(|()| {
                messages.push(NetMessage::FrameParsed {
                    tick: frame.tick,
                    frame: self.state.current_frame + 1,
                });
                for msg in messages.drain(..) {
                    self.state.apply_message(msg)?;
                }
                Ok(())
            });

        if let Err(err) = result {
            self.set_error(err);
            return Err(self.take_error().expect("error latched above"));
        }
        if let Some(err) = self.take_error() {
            return Err(err);
        }

        Ok(frame.kind != FrameKind::Stop)
    }

    /// Iterates until `Stop`, end of stream, or the first fatal error.
    pub fn parse_to_end(&mut self) -> Result<()> {
        let capacity = self.resolve_queue_capacity();
        if capacity == 0 {
            loop {
                if !self.parse_next_frame()? {
                    return Ok(());
                }
            }
        }
        self.parse_to_end_queued(capacity)
    }

    fn resolve_queue_capacity(&self) -> usize {
        match self.msg_queue_buffer_size {
            0 => 0,
            n if n > 0 => n as usize,
            // Deferred sizing: the header's tick count caps the queue.
            _ => self
                .header()
                .map(|h| h.playback_ticks.max(1024) as usize)
                .unwrap_or(1024),
        }
    }

    fn parse_to_end_queued(&mut self, capacity: usize) -> Result<()> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }

        let Self {
            frame_reader,
            demux,
            state,
            last_error,
            ..
        } = self;
        let frame_reader = match frame_reader.as_mut() {
            Some(fr) => fr,
            None => return Err(ParseError::UnexpectedEof),
        };

        let (tx, rx) = crossbeam_channel::bounded::<NetMessage>(capacity);

        std::thread::scope(|scope| {
            // Producer: reads and decodes frames into the bounded queue.
            let producer = scope.spawn(move || -> Result<()> {
                let mut frame_no = 0;
                let mut messages = Vec::new();
                loop {
                    let frame = match frame_reader.next_frame()? {
                        Some(frame) => frame,
                        None => return Ok(()),
                    };
                    frame_no += 1;

                    messages.clear();
                    demux.demux_frame(&frame, &mut messages)?;
                    messages.push(NetMessage::FrameParsed {
                        tick: frame.tick,
                        frame: frame_no,
                    });
                    for msg in messages.drain(..) {
                        if tx.send(msg).is_err() {
                            // Consumer hung up (error or close).
                            return Ok(());
                        }
                    }

                    if frame.kind == FrameKind::Stop {
                        return Ok(());
                    }
                }
            });

            // Consumer: applies mutations and runs callbacks, caller thread.
            for msg in rx.iter() {
                if let Err(err) = state.apply_message(msg) {
                    latch_error(last_error, err);
                    break;
                }
                if last_error.lock().is_some() {
                    break;
                }
            }
            drop(rx);

            match producer.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => latch_error(last_error, err),
                Err(payload) => latch_error(
                    last_error,
                    ParseError::HandlerPanic(panic_message(payload.as_ref())),
                ),
            }
        });

        match self.take_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Idempotent teardown: pools the reader buffers and drops the queue.
    /// Does not alter a latched parse error; reports only close failures.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(frame_reader) = self.frame_reader.take() {
            if frame_reader.pool().is_err() {
                self.state
                    .warn_event("failed to return bit-reader buffer to pool".to_string());
            }
        }
        Ok(())
    }

    fn set_error(&self, err: ParseError) {
        latch_error(&self.last_error, err);
    }

    fn take_error(&self) -> Option<ParseError> {
        self.last_error.lock().take()
    }
}

/// First writer wins; later errors are dropped.
fn latch_error(latch: &ErrorLatch, err: ParseError) {
    let mut slot = latch.lock();
    if slot.is_none() {
        *slot = Some(err);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string())
}

/// The consumer half of the pipeline: all mutable game state plus the
/// dispatchers. Only ever touched from one thread at a time.
struct ConsumerState {
    protocol: DemoProtocol,
    current_frame: i32,
    tick_interval: f32,

    game_state: GameState,
    entities: EntityStore,
    classes: ServerClasses,
    serializers: SerializerRegistry,
    string_tables: StringTableRegistry,
    game_events: GameEventDecoder,
    mimic: MimicSource1Events,

    event_dispatcher: Dispatcher<Event>,
    msg_dispatcher: Dispatcher<NetMessage>,
    delayed_handlers: Vec<DelayedHandler>,
    entity_ops: Vec<EntityOp>,

    server_info: Option<Box<CsvcMsgServerInfo>>,
    ignore_packet_entities_panic: bool,
    ignore_err_bombsite_index_not_found: bool,
}

impl ConsumerState {
    fn new(protocol: DemoProtocol, config: &ParserConfig, latch: ErrorLatch) -> Self {
        let event_latch = latch.clone();
        let event_dispatcher = Dispatcher::with_panic_handler(move |message| {
            latch_error(&event_latch, ParseError::HandlerPanic(message));
        });
        let msg_latch = latch;
        let msg_dispatcher = Dispatcher::with_panic_handler(move |message| {
            latch_error(&msg_latch, ParseError::HandlerPanic(message));
        });

        Self {
            protocol,
            current_frame: 0,
            tick_interval: 0.0,
            game_state: GameState::new(),
            entities: EntityStore::default(),
            classes: ServerClasses::default(),
            serializers: SerializerRegistry::default(),
            string_tables: StringTableRegistry::default(),
            game_events: GameEventDecoder::new(
                config.source2_fallback_game_event_list_bin.to_owned(),
            ),
            mimic: MimicSource1Events::new(
                protocol == DemoProtocol::Source2 && !config.disable_mimic_source1_events,
            ),
            event_dispatcher,
            msg_dispatcher,
            delayed_handlers: Vec::new(),
            entity_ops: Vec::new(),
            server_info: None,
            ignore_packet_entities_panic: config.ignore_packet_entities_panic,
            ignore_err_bombsite_index_not_found: config.ignore_err_bombsite_index_not_found,
        }
    }

    fn apply_message(&mut self, msg: NetMessage) -> Result<()> {
        self.msg_dispatcher.dispatch(&msg);

        match msg {
            NetMessage::Tick(tick) => {
                self.game_state.on_ingame_tick(tick.tick as i32);
            }
            NetMessage::SetConVar(msg) => {
                if let Some(convars) = msg.convars {
                    for cvar in convars.cvars {
                        self.game_state.set_convar(cvar.name, cvar.value);
                    }
                }
            }
            NetMessage::ServerInfo(info) => {
                self.tick_interval = info.tick_interval();
                self.server_info = Some(info);
            }
            NetMessage::CreateStringTable(params) => {
                let updates = self.string_tables.on_create(params, self.protocol)?;
                self.route_table_updates(updates)?;
            }
            NetMessage::UpdateStringTable(msg) => {
                let updates = self.string_tables.on_update(&msg, self.protocol)?;
                self.route_table_updates(updates)?;
            }
            NetMessage::ClearAllStringTables => {
                self.string_tables = StringTableRegistry::default();
            }
            NetMessage::StringTables(snapshot) => {
                let updates = self.string_tables.on_snapshot(&snapshot)?;
                self.route_table_updates(updates)?;
            }
            NetMessage::DataTables(payload) => {
                self.classes.on_data_tables(&payload)?;
                self.seed_baselines_from_table();
                self.event_dispatcher.dispatch(&Event::DataTablesParsed);
            }
            NetMessage::SendTables(msg) => {
                self.serializers.on_send_tables(&msg)?;
            }
            NetMessage::ClassInfo(msg) => {
                let classes = self.serializers.build_classes(&msg)?;
                let class_bits = self.source2_class_bits(classes.len());
                self.classes.install(classes, class_bits);
                self.seed_baselines_from_table();
                self.event_dispatcher.dispatch(&Event::DataTablesParsed);
            }
            NetMessage::PacketEntities(msg) => {
                self.handle_packet_entities(&msg)?;
            }
            NetMessage::GameEvent(msg) => {
                self.handle_game_event(&msg)?;
            }
            NetMessage::GameEventList(msg) => {
                self.game_events.on_game_event_list(&msg);
            }
            NetMessage::Additional { .. } => {
                // Dispatched above; no core handling.
            }
            NetMessage::FrameParsed { tick, frame } => {
                self.end_frame(tick, frame);
            }
        }
        Ok(())
    }

    fn source2_class_bits(&self, class_count: usize) -> usize {
        let max_classes = self
            .server_info
            .as_ref()
            .map(|info| info.max_classes())
            .filter(|c| *c > 0)
            .unwrap_or(class_count as i32);
        (f64::log2(max_classes.max(2) as f64).floor() as usize) + 1
    }

    /// Baselines that arrived in the string table before the class
    /// directory was parsed.
    fn seed_baselines_from_table(&mut self) {
        let mut pending = Vec::new();
        if let Some(table) = self.string_tables.by_name(ST_NAME_INSTANCE_BASELINE) {
            for (_, entry) in table.entries() {
                if entry.user_data.is_empty() {
                    continue;
                }
                if let Ok(class_id) = entry.key.parse::<i32>() {
                    pending.push((class_id, entry.user_data.to_owned()));
                }
            }
        }
        for (class_id, data) in pending {
            self.classes.set_instance_baseline(class_id, data);
        }
    }

    fn route_table_updates(
        &mut self,
        updates: Vec<crate::stringtable::StringTableUpdate>,
    ) -> Result<()> {
        for update in updates {
            match update.table.as_str() {
                ST_NAME_USER_INFO => {
                    if update.user_data.is_empty() {
                        continue;
                    }
                    let info = match self.protocol {
                        DemoProtocol::Source1 => {
                            crate::player::PlayerInfo::from_source1_bytes(&update.user_data)?
                        }
                        DemoProtocol::Source2 => {
                            crate::player::PlayerInfo::from_source2_bytes(&update.user_data)?
                        }
                    };
                    // Source 2 keys userinfo by entity index rather than
                    // table position.
                    let index = match self.protocol {
                        DemoProtocol::Source1 => update.index,
                        DemoProtocol::Source2 => {
                            update.key.parse::<i32>().unwrap_or(update.index)
                        }
                    };
                    self.game_state.register_raw_player(index, info);
                }
                ST_NAME_INSTANCE_BASELINE => {
                    if let Ok(class_id) = update.key.parse::<i32>() {
                        self.classes.set_instance_baseline(class_id, update.user_data);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn handle_packet_entities(&mut self, msg: &crate::entity::CsvcMsgPacketEntities) -> Result<()> {
        self.entity_ops.clear();

        let result = if self.ignore_packet_entities_panic {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.entities.apply_packet_entities(
                    msg,
                    &mut self.classes,
                    self.protocol,
                    self.game_state.ingame_tick,
                    &mut self.entity_ops,
                )
            }));
            match outcome {
                Ok(result) => result,
                Err(_) => {
                    self.warn_event(
                        "skipped malformed packet-entities message".to_string(),
                    );
                    Ok(())
                }
            }
        } else {
            self.entities.apply_packet_entities(
                msg,
                &mut self.classes,
                self.protocol,
                self.game_state.ingame_tick,
                &mut self.entity_ops,
            )
        };
        result?;

        let ops = std::mem::take(&mut self.entity_ops);
        let mut implied_events = Vec::new();
        for op in ops.iter() {
            self.mimic.on_entity_op(op, &self.entities, &self.game_state);
            self.game_state
                .apply_entity_op(op, &self.entities, &mut implied_events);
            for event in implied_events.drain(..) {
                self.event_dispatcher.dispatch(&event);
            }
        }
        self.entity_ops = ops;
        Ok(())
    }

    fn handle_game_event(&mut self, msg: &crate::gameevent::CsvcMsgGameEvent) -> Result<()> {
        let raw = match self.game_events.decode(msg)? {
            Some(raw) => raw,
            None => {
                self.warn_event(format!(
                    "dropped game event {} without descriptor",
                    msg.eventid()
                ));
                return Ok(());
            }
        };

        let event = Event::from_raw(raw);
        self.mimic
            .note_real_event(event.tag(), self.game_state.ingame_tick);
        self.apply_event_to_state(&event)?;

        // Flash detonations wait for the flash-duration property updates
        // landing later in the same tick.
        if matches!(event, Event::FlashExplode(_)) {
            self.delayed_handlers.push(Box::new(move |_, dispatcher| {
                dispatcher.dispatch(&event);
            }));
        } else {
            self.event_dispatcher.dispatch(&event);
        }
        Ok(())
    }

    fn apply_event_to_state(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::RoundStart(_) => self.game_state.on_round_start(),
            Event::RoundFreezetimeEnd => self.game_state.on_freezetime_end(),
            Event::RoundOfficiallyEnded => self.game_state.on_round_officially_ended(),
            Event::PlayerDeath(death) => {
                self.game_state
                    .on_player_death(death.userid, death.attacker, death.assister);
            }
            Event::PlayerDisconnected(disconnect) => {
                self.game_state.on_player_disconnect(disconnect.userid);
            }
            Event::BombPlanted(bomb) => {
                let site = self.resolve_bombsite(bomb.site)?;
                self.game_state.on_bomb_planted(bomb.userid, site);
            }
            Event::BombDefused(_) => self.game_state.on_bomb_defused(),
            Event::BombExplode(_) => self.game_state.on_bomb_exploded(),
            _ => {}
        }
        Ok(())
    }

    /// Maps a bombsite trigger index from an event onto the site letter.
    fn resolve_bombsite(&mut self, site_index: i32) -> Result<Option<char>> {
        if site_index <= 0 {
            return Ok(None);
        }
        for site in ['A', 'B'] {
            if let Some(bombsite) = self.game_state.bombsite(site) {
                if bombsite.trigger_entity_id == Some(site_index) {
                    return Ok(Some(site));
                }
            }
        }
        if self.game_state.trigger(site_index).is_none() {
            if self.ignore_err_bombsite_index_not_found {
                self.game_state.warn_missing_bombsite(site_index);
                self.warn_event(format!("bombsite index {site_index} not found"));
                return Ok(None);
            }
            return Err(ParseError::SchemaMismatch(format!(
                "bombsite index {site_index} not found"
            )));
        }
        Ok(None)
    }

    /// End-of-frame bookkeeping: mimicked events, delayed handlers in
    /// registration order, then the frame-done marker.
    fn end_frame(&mut self, tick: i32, frame: i32) {
        self.current_frame = frame;
        if tick >= 0 {
            self.game_state.on_ingame_tick(tick);
        }

        for event in self.mimic.drain_for_tick(self.game_state.ingame_tick) {
            if self.apply_event_to_state(&event).is_err() {
                continue;
            }
            self.event_dispatcher.dispatch(&event);
        }

        for handler in std::mem::take(&mut self.delayed_handlers) {
            handler(&mut self.game_state, &mut self.event_dispatcher);
        }

        self.event_dispatcher.dispatch(&Event::FrameDone(FrameDone {
            tick: self.game_state.ingame_tick,
            frame,
        }));
    }

    fn warn_event(&mut self, message: String) {
        warn!("{message}");
        self.event_dispatcher
            .dispatch(&Event::ParserWarn(ParserWarn { message }));
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn source2_bytes(frames: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
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
        let mut buf = Vec::new();
        buf.extend_from_slice(crate::header::MAGIC_SOURCE2);
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

    fn sync_config() -> ParserConfig {
        ParserConfig {
            msg_queue_buffer_size: 0,
            ..ParserConfig::default()
        }
    }

    #[test]
    fn stop_frame_ends_parsing() {
        let bytes = source2_bytes(&[(3, 1, Vec::new()), (0, 2, Vec::new())]);
        let mut parser = Parser::with_config(Cursor::new(bytes), sync_config()).unwrap();

        assert!(parser.parse_next_frame().unwrap());
        assert!(!parser.parse_next_frame().unwrap());
        parser.close().unwrap();
    }

    #[test]
    fn close_is_idempotent() {
        let bytes = source2_bytes(&[(0, 0, Vec::new())]);
        let mut parser = Parser::with_config(Cursor::new(bytes), sync_config()).unwrap();
        parser.close().unwrap();
        parser.close().unwrap();
    }

    #[test]
    fn handler_panic_is_latched_as_error() {
        let bytes = source2_bytes(&[(3, 1, Vec::new()), (0, 2, Vec::new())]);
        let mut parser = Parser::with_config(Cursor::new(bytes), sync_config()).unwrap();
        parser.register_event_handler(EventKind::FrameDone, |_| panic!("boom in handler"));

        let err = parser.parse_to_end().unwrap_err();
        assert!(matches!(err, ParseError::HandlerPanic(msg) if msg.contains("boom")));
    }

    #[test]
    fn frame_done_fires_per_frame_in_order() {
        use std::sync::atomic::{AtomicI32, Ordering};

        let bytes = source2_bytes(&[(3, 1, Vec::new()), (3, 2, Vec::new()), (0, 3, Vec::new())]);
        let mut parser = Parser::with_config(Cursor::new(bytes), sync_config()).unwrap();

        let frames = Arc::new(AtomicI32::new(0));
        let frames_clone = frames.clone();
        parser.register_event_handler(EventKind::FrameDone, move |event| {
            if let Event::FrameDone(done) = event {
                assert_eq!(done.frame, frames_clone.load(Ordering::SeqCst) + 1);
                frames_clone.store(done.frame, Ordering::SeqCst);
            }
        });

        parser.parse_to_end().unwrap();
        assert_eq!(frames.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn progress_clamps_and_handles_corrupt_header() {
        let bytes = source2_bytes(&[(0, 0, Vec::new())]);
        let parser = Parser::with_config(Cursor::new(bytes), sync_config()).unwrap();
        // playback_frames is zero until a FileInfo frame arrives.
        assert_eq!(parser.progress(), 0.0);
    }
}
