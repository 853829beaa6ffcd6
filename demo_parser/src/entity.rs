use std::io::Cursor;
use std::io::{Read, Seek};
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use demo_bitreader::BitReader;
use prost::Message;
use tracing::trace;

use crate::commands::DemoProtocol;
use crate::common::{coord_from_cell, handle_serial, make_handle, Vector};
use crate::error::{ParseError, Result};
use crate::fieldpath::{read_field_paths, FieldPath};
use crate::serializers::{resolve_path, ResolvedOp};
use crate::serverclass::{PropertyValue, ServerClass, ServerClasses};

const S1_SERIAL_BITS: usize = 10;
const S2_SERIAL_BITS: usize = 17;

// Position-bound properties, per protocol and entity flavor.
pub const S1_PLAYER_POSITION_XY_PROP: &str = "cslocaldata.m_vecOrigin";
pub const S1_PLAYER_POSITION_Z_PROP: &str = "cslocaldata.m_vecOrigin[2]";
pub const S1_CELL_BITS_PROP: &str = "m_cellbits";
pub const S1_CELL_X_PROP: &str = "m_cellX";
pub const S1_CELL_Y_PROP: &str = "m_cellY";
pub const S1_CELL_Z_PROP: &str = "m_cellZ";
pub const S1_ORIGIN_PROP: &str = "m_vecOrigin";

pub const S2_CELL_X_PROP: &str = "CBodyComponent.m_cellX";
pub const S2_CELL_Y_PROP: &str = "CBodyComponent.m_cellY";
pub const S2_CELL_Z_PROP: &str = "CBodyComponent.m_cellZ";
pub const S2_VEC_X_PROP: &str = "CBodyComponent.m_vecX";
pub const S2_VEC_Y_PROP: &str = "CBodyComponent.m_vecY";
pub const S2_VEC_Z_PROP: &str = "CBodyComponent.m_vecZ";

// game/shared/shareddefs.h
const S2_CELL_BITS: i32 = 9;

#[derive(Clone, PartialEq, Message)]
pub struct CsvcMsgPacketEntities {
    #[prost(int32, optional, tag = "1")]
    pub max_entries: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub updated_entries: Option<i32>,
    #[prost(bool, optional, tag = "3")]
    pub is_delta: Option<bool>,
    #[prost(bool, optional, tag = "4")]
    pub update_baseline: Option<bool>,
    #[prost(int32, optional, tag = "5")]
    pub baseline: Option<i32>,
    #[prost(int32, optional, tag = "6")]
    pub delta_from: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub entity_data: Option<Vec<u8>>,
}

/// A networked entity: sparse slot, lifetime serial, class schema and the
/// current value of every compiled property slot.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: i32,
    pub serial_num: u32,
    pub class: Arc<ServerClass>,
    pub active: bool,
    pub props: Vec<PropertyValue>,
    pub created_on_tick: i32,
}

impl Entity {
    pub fn handle(&self) -> u32 {
        make_handle(self.id, self.serial_num)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.class
            .property_index(name)
            .and_then(|idx| self.props.get(idx))
    }

    /// Cloned property value, `PropertyValue::None` when the slot is absent.
    pub fn property_value(&self, name: &str) -> PropertyValue {
        self.property(name).cloned().unwrap_or(PropertyValue::None)
    }

    pub fn is_player(&self) -> bool {
        matches!(
            self.class.name.as_str(),
            "CCSPlayer" | "CCSPlayerController"
        )
    }

    pub fn is_pawn(&self) -> bool {
        self.class.name == "CCSPlayerPawn"
    }

    pub fn is_team(&self) -> bool {
        matches!(self.class.name.as_str(), "CCSTeam" | "CCSTeamState")
    }

    pub fn is_game_rules(&self) -> bool {
        self.class.name == "CCSGameRulesProxy"
    }

    pub fn is_planted_bomb(&self) -> bool {
        self.class.name == "CPlantedC4"
    }

    pub fn is_bomb(&self) -> bool {
        self.class.name == "CC4"
    }

    pub fn is_player_resource(&self) -> bool {
        self.class.name == "CCSPlayerResource"
    }

    pub fn is_base_trigger(&self) -> bool {
        self.class.name == "CBaseTrigger"
    }

    pub fn is_grenade_projectile(&self) -> bool {
        self.class.name.ends_with("Projectile")
            || self.class.has_base_class("DT_BaseCSGrenade")
            || self.class.has_base_class("DT_BaseGrenade")
    }

    pub fn is_weapon(&self) -> bool {
        self.class.has_base_class("DT_WeaponCSBase")
            && !self.class.has_base_class("DT_BaseCSGrenade")
    }

    /// Current world position, derived from whichever position encoding the
    /// entity's class uses.
    pub fn position(&self) -> Vector {
        if let (Some(cell_x), Some(cell_y), Some(cell_z)) = (
            self.property(S2_CELL_X_PROP),
            self.property(S2_CELL_Y_PROP),
            self.property(S2_CELL_Z_PROP),
        ) {
            let cell_width = 1 << S2_CELL_BITS;
            return Vector {
                x: coord_from_cell(
                    cell_x.as_integer(),
                    cell_width,
                    self.property_value(S2_VEC_X_PROP).as_float(),
                ),
                y: coord_from_cell(
                    cell_y.as_integer(),
                    cell_width,
                    self.property_value(S2_VEC_Y_PROP).as_float(),
                ),
                z: coord_from_cell(
                    cell_z.as_integer(),
                    cell_width,
                    self.property_value(S2_VEC_Z_PROP).as_float(),
                ),
            };
        }

        if let (Some(xy), Some(z)) = (
            self.property(S1_PLAYER_POSITION_XY_PROP),
            self.property(S1_PLAYER_POSITION_Z_PROP),
        ) {
            let v = xy.as_vector();
            return Vector {
                x: v.x,
                y: v.y,
                z: z.as_float(),
            };
        }

        if let (Some(cell_bits), Some(cell_x), Some(cell_y), Some(cell_z), Some(origin)) = (
            self.property(S1_CELL_BITS_PROP),
            self.property(S1_CELL_X_PROP),
            self.property(S1_CELL_Y_PROP),
            self.property(S1_CELL_Z_PROP),
            self.property(S1_ORIGIN_PROP),
        ) {
            let cell_width = 1 << cell_bits.as_integer();
            let offset = origin.as_vector();
            return Vector {
                x: coord_from_cell(cell_x.as_integer(), cell_width, offset.x),
                y: coord_from_cell(cell_y.as_integer(), cell_width, offset.y),
                z: coord_from_cell(cell_z.as_integer(), cell_width, offset.z),
            };
        }

        Vector::default()
    }

    pub fn is_alive(&self) -> bool {
        self.property_value("m_iHealth").as_integer() > 0
    }
}

fn is_position_prop(name: &str) -> bool {
    matches!(
        name,
        S1_PLAYER_POSITION_XY_PROP
            | S1_PLAYER_POSITION_Z_PROP
            | S1_CELL_X_PROP
            | S1_CELL_Y_PROP
            | S1_CELL_Z_PROP
            | S1_ORIGIN_PROP
            | S2_CELL_X_PROP
            | S2_CELL_Y_PROP
            | S2_CELL_Z_PROP
            | S2_VEC_X_PROP
            | S2_VEC_Y_PROP
            | S2_VEC_Z_PROP
    )
}

/// State mutation produced while applying one packet-entities message, in
/// application order.
#[derive(Debug, Clone)]
pub enum EntityOp {
    Created { id: i32 },
    PropertyChanged { id: i32, slot: usize, old: PropertyValue },
    PositionChanged { id: i32 },
    Updated { id: i32 },
    Left { id: i32 },
    Deleted { id: i32 },
}

type CreatedHandler = Box<dyn FnMut(&Entity) + Send>;
type PropertyHandler = Box<dyn FnMut(&Entity, &PropertyValue, &PropertyValue) + Send>;

/// Per-class observer registry; the public entity contract.
#[derive(Default)]
pub struct EntityObservers {
    created: HashMap<String, Vec<CreatedHandler>>,
    property: HashMap<(String, String), Vec<PropertyHandler>>,
}

impl EntityObservers {
    pub fn on_created(&mut self, class_name: &str, handler: impl FnMut(&Entity) + Send + 'static) {
        self.created
            .entry(class_name.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    pub fn on_property(
        &mut self,
        class_name: &str,
        prop_name: &str,
        handler: impl FnMut(&Entity, &PropertyValue, &PropertyValue) + Send + 'static,
    ) {
        self.property
            .entry((class_name.to_string(), prop_name.to_string()))
            .or_default()
            .push(Box::new(handler));
    }
}

/// Sparse map of entity slots; applies create/update/leave/delete deltas.
#[derive(Default)]
pub struct EntityStore {
    entities: HashMap<i32, Entity>,
    pub observers: EntityObservers,
    field_paths: Vec<FieldPath>,
    changed: Vec<(usize, PropertyValue)>,
}

impl EntityStore {
    pub fn get(&self, id: i32) -> Option<&Entity> {
        self.entities.get(&id)
    }

    /// Resolves a packed handle, requiring the serial to match the entity
    /// currently occupying the slot.
    pub fn by_handle(&self, handle: u32) -> Option<&Entity> {
        let id = crate::common::handle_index(handle)?;
        self.entities
            .get(&id)
            .filter(|e| e.serial_num == handle_serial(handle))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&mut self, entity: Entity) {
        self.entities.insert(entity.id, entity);
    }

    /// Decodes one packet-entities message, pushing every state mutation
    /// onto `ops` in application order.
    pub fn apply_packet_entities(
        &mut self,
        msg: &CsvcMsgPacketEntities,
        classes: &mut ServerClasses,
        protocol: DemoProtocol,
        tick: i32,
        ops: &mut Vec<EntityOp>,
    ) -> Result<()> {
        if !classes.is_parsed() {
            return Err(ParseError::SchemaMismatch(
                "packet entities before send tables".to_string(),
            ));
        }

        let data = msg.entity_data().to_vec();
        let mut r = BitReader::new_small_bit_reader(Cursor::new(data))?;

        let mut current = -1_i32;
        for _ in 0..msg.updated_entries() {
            current += 1 + r.read_ubitint()? as i32;

            let remove = r.read_bit()?;
            let create_or_delete = r.read_bit()?;

            match (remove, create_or_delete) {
                (false, true) => self.read_enter_pvs(&mut r, current, classes, protocol, tick, ops)?,
                (false, false) => self.read_update(&mut r, current, protocol, ops)?,
                (true, true) => {
                    if self.entities.remove(&current).is_some() {
                        ops.push(EntityOp::Deleted { id: current });
                    }
                }
                (true, false) => {
                    if let Some(entity) = self.entities.get_mut(&current) {
                        entity.active = false;
                        ops.push(EntityOp::Left { id: current });
                    }
                }
            }
        }
        Ok(())
    }

    /// Allocates or reuses an entity slot, applies the class baseline, then
    /// reads the first delta.
    fn read_enter_pvs<T: Read + Seek + Send>(
        &mut self,
        r: &mut BitReader<T>,
        id: i32,
        classes: &mut ServerClasses,
        protocol: DemoProtocol,
        tick: i32,
        ops: &mut Vec<EntityOp>,
    ) -> Result<()> {
        let class_id = r.read_int(classes.class_bits())? as i32;
        let serial_num = match protocol {
            DemoProtocol::Source1 => r.read_int(S1_SERIAL_BITS)? as u32,
            DemoProtocol::Source2 => {
                let serial = r.read_int(S2_SERIAL_BITS)? as u32;
                // Trailing varint with no known consumer.
                r.read_varint32()?;
                serial
            }
        };

        match self.entities.get(&id).map(|e| e.serial_num) {
            Some(serial) if serial == serial_num => {
                // Same lifetime re-entering the PVS: plain delta update.
                if let Some(existing) = self.entities.get_mut(&id) {
                    existing.active = true;
                }
                return self.read_update(r, id, protocol, ops);
            }
            Some(_) => {
                // Slot reuse with a new serial: delete then create.
                self.entities.remove(&id);
                ops.push(EntityOp::Deleted { id });
            }
            None => {}
        }

        let class = classes
            .by_id(class_id)
            .ok_or_else(|| {
                ParseError::SchemaMismatch(format!("enter PVS with unknown class id {class_id}"))
            })?
            .to_owned();

        let mut props = match classes.preprocessed_baseline(class_id).cloned() {
            Some(baseline) => baseline,
            None => {
                let mut props = vec![PropertyValue::None; class.flattened_props.len()];
                if let Some(raw) = classes.instance_baseline(class_id).cloned() {
                    let mut br = BitReader::new_small_bit_reader(Cursor::new(raw))?;
                    let mut scratch = Vec::new();
                    read_delta(
                        &mut br,
                        &class,
                        &mut props,
                        protocol,
                        &mut self.field_paths,
                        &mut scratch,
                    )?;
                    classes.store_preprocessed_baseline(class_id, props.to_owned());
                }
                props
            }
        };

        self.changed.clear();
        read_delta(
            r,
            &class,
            &mut props,
            protocol,
            &mut self.field_paths,
            &mut self.changed,
        )?;

        trace!(id, class = %class.name, "entity entered PVS");
        let entity = Entity {
            id,
            serial_num,
            class,
            active: true,
            props,
            created_on_tick: tick,
        };
        self.entities.insert(id, entity);

        ops.push(EntityOp::Created { id });
        self.push_change_ops(id, ops);
        self.fire_created_observers(id);
        Ok(())
    }

    fn read_update<T: Read + Seek + Send>(
        &mut self,
        r: &mut BitReader<T>,
        id: i32,
        protocol: DemoProtocol,
        ops: &mut Vec<EntityOp>,
    ) -> Result<()> {
        let entity = self.entities.get_mut(&id).ok_or_else(|| {
            ParseError::SchemaMismatch(format!("delta update for missing entity {id}"))
        })?;
        let class = entity.class.to_owned();

        self.changed.clear();
        read_delta(
            r,
            &class,
            &mut entity.props,
            protocol,
            &mut self.field_paths,
            &mut self.changed,
        )?;

        ops.push(EntityOp::Updated { id });
        self.push_change_ops(id, ops);
        Ok(())
    }

    fn push_change_ops(&mut self, id: i32, ops: &mut Vec<EntityOp>) {
        let entity = match self.entities.get(&id) {
            Some(e) => e,
            None => return,
        };

        let mut position_changed = false;
        for (slot, old) in self.changed.drain(..) {
            let name = entity.class.flattened_props[slot].name.as_str();
            if is_position_prop(name) {
                position_changed = true;
            }

            if let Some(handlers) = self
                .observers
                .property
                .get_mut(&(entity.class.name.to_owned(), name.to_owned()))
            {
                let new = &entity.props[slot];
                for handler in handlers.iter_mut() {
                    handler(entity, &old, new);
                }
            }

            ops.push(EntityOp::PropertyChanged { id, slot, old });
        }

        if position_changed {
            ops.push(EntityOp::PositionChanged { id });
        }
    }

    fn fire_created_observers(&mut self, id: i32) {
        let entity = match self.entities.get(&id) {
            Some(e) => e,
            None => return,
        };
        if let Some(handlers) = self.observers.created.get_mut(&entity.class.name) {
            for handler in handlers.iter_mut() {
                handler(entity);
            }
        }
    }
}

/// Reads one field delta into `props`, recording `(slot, old_value)` pairs.
pub fn read_delta<T: Read + Seek + Send>(
    r: &mut BitReader<T>,
    class: &ServerClass,
    props: &mut [PropertyValue],
    protocol: DemoProtocol,
    field_paths: &mut Vec<FieldPath>,
    changed: &mut Vec<(usize, PropertyValue)>,
) -> Result<()> {
    match protocol {
        DemoProtocol::Source1 => read_delta_source1(r, class, props, changed),
        DemoProtocol::Source2 => read_delta_source2(r, class, props, field_paths, changed),
    }
}

fn read_delta_source1<T: Read + Seek + Send>(
    r: &mut BitReader<T>,
    class: &ServerClass,
    props: &mut [PropertyValue],
    changed: &mut Vec<(usize, PropertyValue)>,
) -> Result<()> {
    let new_way = r.read_bit()?;

    let mut indices = Vec::with_capacity(8);
    let mut idx = -1_isize;
    loop {
        idx = r.read_field_index(idx, new_way)?;
        if idx == -1 {
            break;
        }
        indices.push(idx as usize);
    }

    for slot in indices {
        let entry = class.flattened_props.get(slot).ok_or_else(|| {
            ParseError::SchemaMismatch(format!(
                "property index {slot} out of range for class {}",
                class.name
            ))
        })?;
        let value = entry.decoder.decode(r)?;
        let old = std::mem::replace(&mut props[slot], value);
        changed.push((slot, old));
    }
    Ok(())
}

fn read_delta_source2<T: Read + Seek + Send>(
    r: &mut BitReader<T>,
    class: &ServerClass,
    props: &mut [PropertyValue],
    field_paths: &mut Vec<FieldPath>,
    changed: &mut Vec<(usize, PropertyValue)>,
) -> Result<()> {
    let serializer = class.serializer.as_ref().ok_or_else(|| {
        ParseError::SchemaMismatch(format!("class {} has no serializer", class.name))
    })?;

    read_field_paths(r, field_paths)?;

    // Values follow the whole path list, in path order.
    let paths = std::mem::take(field_paths);
    let result = (|| -> Result<()> {
        for fp in paths.iter() {
            let resolved = resolve_path(serializer, fp)?;
            let slot = class.property_index(&resolved.name).ok_or_else(|| {
                ParseError::SchemaMismatch(format!(
                    "field {} missing from compiled schema of {}",
                    resolved.name, class.name
                ))
            })?;

            match resolved.op {
                ResolvedOp::Value(decoder) => {
                    let value = decoder.decode(r)?;
                    let old = std::mem::replace(&mut props[slot], value);
                    changed.push((slot, old));
                }
                ResolvedOp::ArrayResize => {
                    let count = r.read_varint32()? as usize;
                    let old = std::mem::replace(
                        &mut props[slot],
                        PropertyValue::Array(vec![PropertyValue::None; count]),
                    );
                    changed.push((slot, old));
                }
                ResolvedOp::ArrayElem { index, elem } => {
                    let value = elem.decode(r)?;
                    let old = props[slot].to_owned();
                    if let PropertyValue::Array(items) = &mut props[slot] {
                        if items.len() <= index {
                            items.resize(index + 1, PropertyValue::None);
                        }
                        items[index] = value;
                    } else {
                        let mut items = vec![PropertyValue::None; index + 1];
                        items[index] = value;
                        props[slot] = PropertyValue::Array(items);
                    }
                    changed.push((slot, old));
                }
                ResolvedOp::PointerPresence => {
                    r.read_bit()?;
                }
            }
        }
        Ok(())
    })();
    *field_paths = paths;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sendtable::{compile_decoder, SendTableProperty, PROP_FLAG_UNSIGNED};
    use crate::serverclass::FlattenedPropEntry;
    use crate::testutil::BitWriter;

    fn int_prop(name: &str) -> FlattenedPropEntry {
        let prop = SendTableProperty {
            flags: PROP_FLAG_UNSIGNED,
            name: name.to_string(),
            dt_name: String::new(),
            low_value: 0.0,
            high_value: 0.0,
            num_bits: 8,
            num_elems: 0,
            priority: 0,
            raw_type: 0,
        };
        FlattenedPropEntry {
            decoder: compile_decoder(&prop, None).unwrap(),
            name: name.to_string(),
            prop,
            index: 0,
        }
    }

    fn test_classes() -> ServerClasses {
        let mut props = vec![int_prop("m_iHealth"), int_prop("m_iTeamNum")];
        for (i, p) in props.iter_mut().enumerate() {
            p.index = i as i32;
        }
        let mut prop_name_to_idx = HashMap::new();
        for (i, p) in props.iter().enumerate() {
            prop_name_to_idx.insert(p.name.to_owned(), i);
        }
        let class = Arc::new(ServerClass {
            id: 0,
            name: "CCSPlayer".to_string(),
            dt_name: "DT_CSPlayer".to_string(),
            base_classes: Vec::new(),
            flattened_props: props,
            prop_name_to_idx,
            serializer: None,
        });
        let mut classes = ServerClasses::default();
        classes.install(vec![class], 1);
        classes
    }

    // Entity header, enter-PVS record for slot `id`, class 0, given serial.
    fn push_enter(w: &mut BitWriter, serial: u32, health: u8) {
        w.push_bits(0, 6); // ubitint jump of zero
        w.push_bit(false); // remove
        w.push_bit(true); // create
        w.push_bits(0, 1); // class id (1 bit for a single class)
        w.push_bits(serial as u64, 10);
        // Delta: old-way encoding, slot 0, 8-bit value, end marker.
        w.push_bit(false);
        w.push_bits(0, 7);
        w.push_bits(health as u64, 8);
        w.push_s1_end_marker();
    }

    fn packet(entity_data: Vec<u8>, updated: i32) -> CsvcMsgPacketEntities {
        CsvcMsgPacketEntities {
            updated_entries: Some(updated),
            entity_data: Some(entity_data),
            ..Default::default()
        }
    }

    #[test]
    fn enter_pvs_creates_entity_with_schema_sized_props() {
        let mut classes = test_classes();
        let mut store = EntityStore::default();
        let mut ops = Vec::new();

        let mut w = BitWriter::new();
        push_enter(&mut w, 7, 100);
        store
            .apply_packet_entities(
                &packet(w.finish(), 1),
                &mut classes,
                DemoProtocol::Source1,
                64,
                &mut ops,
            )
            .unwrap();

        let entity = store.get(0).expect("entity 0");
        assert_eq!(entity.serial_num, 7);
        assert_eq!(entity.props.len(), entity.class.flattened_props.len());
        assert_eq!(entity.property_value("m_iHealth").as_integer(), 100);
        assert!(entity.active);
        assert!(matches!(ops[0], EntityOp::Created { id: 0 }));
    }

    #[test]
    fn update_replaces_value_and_reports_old() {
        let mut classes = test_classes();
        let mut store = EntityStore::default();
        let mut ops = Vec::new();

        let mut w = BitWriter::new();
        push_enter(&mut w, 7, 100);
        store
            .apply_packet_entities(
                &packet(w.finish(), 1),
                &mut classes,
                DemoProtocol::Source1,
                64,
                &mut ops,
            )
            .unwrap();

        ops.clear();
        let mut w = BitWriter::new();
        w.push_bits(0, 6);
        w.push_bit(false);
        w.push_bit(false); // plain update
        w.push_bit(false); // old-way delta
        w.push_bits(0, 7); // slot 0
        w.push_bits(0, 8); // health 0
        w.push_s1_end_marker();
        store
            .apply_packet_entities(
                &packet(w.finish(), 1),
                &mut classes,
                DemoProtocol::Source1,
                65,
                &mut ops,
            )
            .unwrap();

        assert_eq!(store.get(0).unwrap().property_value("m_iHealth").as_integer(), 0);
        assert!(ops.iter().any(|op| matches!(
            op,
            EntityOp::PropertyChanged { id: 0, slot: 0, old: PropertyValue::Integer(100) }
        )));
    }

    #[test]
    fn slot_reuse_with_new_serial_deletes_then_creates() {
        let mut classes = test_classes();
        let mut store = EntityStore::default();
        let mut ops = Vec::new();

        let mut w = BitWriter::new();
        push_enter(&mut w, 7, 100);
        store
            .apply_packet_entities(
                &packet(w.finish(), 1),
                &mut classes,
                DemoProtocol::Source1,
                64,
                &mut ops,
            )
            .unwrap();

        ops.clear();
        let mut w = BitWriter::new();
        push_enter(&mut w, 8, 55);
        store
            .apply_packet_entities(
                &packet(w.finish(), 1),
                &mut classes,
                DemoProtocol::Source1,
                65,
                &mut ops,
            )
            .unwrap();

        assert!(matches!(ops[0], EntityOp::Deleted { id: 0 }));
        assert!(matches!(ops[1], EntityOp::Created { id: 0 }));
        let entity = store.get(0).unwrap();
        assert_eq!(entity.serial_num, 8);
        assert_eq!(entity.property_value("m_iHealth").as_integer(), 55);
    }

    #[test]
    fn leave_deactivates_and_force_delete_removes() {
        let mut classes = test_classes();
        let mut store = EntityStore::default();
        let mut ops = Vec::new();

        let mut w = BitWriter::new();
        push_enter(&mut w, 7, 100);
        store
            .apply_packet_entities(
                &packet(w.finish(), 1),
                &mut classes,
                DemoProtocol::Source1,
                64,
                &mut ops,
            )
            .unwrap();

        let mut w = BitWriter::new();
        w.push_bits(0, 6);
        w.push_bit(true); // leave
        w.push_bit(false);
        store
            .apply_packet_entities(
                &packet(w.finish(), 1),
                &mut classes,
                DemoProtocol::Source1,
                65,
                &mut ops,
            )
            .unwrap();
        assert!(!store.get(0).unwrap().active);

        let mut w = BitWriter::new();
        w.push_bits(0, 6);
        w.push_bit(true); // leave with force delete
        w.push_bit(true);
        store
            .apply_packet_entities(
                &packet(w.finish(), 1),
                &mut classes,
                DemoProtocol::Source1,
                66,
                &mut ops,
            )
            .unwrap();
        assert!(store.get(0).is_none());
        assert!(matches!(ops.last(), Some(EntityOp::Deleted { id: 0 })));
    }

    #[test]
    fn handle_lookup_requires_matching_serial() {
        let mut classes = test_classes();
        let mut store = EntityStore::default();
        let mut ops = Vec::new();

        let mut w = BitWriter::new();
        push_enter(&mut w, 7, 100);
        store
            .apply_packet_entities(
                &packet(w.finish(), 1),
                &mut classes,
                DemoProtocol::Source1,
                64,
                &mut ops,
            )
            .unwrap();

        let good = make_handle(0, 7);
        let stale = make_handle(0, 6);
        assert!(store.by_handle(good).is_some());
        assert!(store.by_handle(stale).is_none());
    }

    #[test]
    fn created_observer_fires_with_entity() {
        use std::sync::atomic::{AtomicI32, Ordering};
        use std::sync::Arc as StdArc;

        let mut classes = test_classes();
        let mut store = EntityStore::default();
        let seen = StdArc::new(AtomicI32::new(-1));
        let seen_clone = seen.clone();
        store.observers.on_created("CCSPlayer", move |entity| {
            seen_clone.store(entity.id, Ordering::SeqCst);
        });

        let mut ops = Vec::new();
        let mut w = BitWriter::new();
        push_enter(&mut w, 7, 100);
        store
            .apply_packet_entities(
                &packet(w.finish(), 1),
                &mut classes,
                DemoProtocol::Source1,
                64,
                &mut ops,
            )
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
