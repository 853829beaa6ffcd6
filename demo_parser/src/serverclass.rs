use std::io::{Read, Seek};
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use demo_bitreader::BitReader;
use prost::Message;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::Vector;
use crate::error::{ParseError, Result};
use crate::sendtable::{
    CsvcMsgSendTable, SendTable, SendTableFlattener, SendTableProperty,
};
use crate::serializers::Serializer;

const SERVER_CLASS_IDENTIFIER: u32 = 9;
const MAX_STRING_PROP_LENGTH: usize = 512;
const STRING_PROP_LENGTH_BITS: usize = 9;

/// Decoded value of one networked property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Integer(i32),
    Integer64(i64),
    Float(f64),
    Vector(Vector),
    QAngle(Vector),
    String(String),
    Array(Vec<PropertyValue>),
    Handle(u32),
    None,
}

impl PropertyValue {
    pub fn as_integer(&self) -> i32 {
        match self {
            PropertyValue::Integer(v) => *v,
            PropertyValue::Integer64(v) => *v as i32,
            PropertyValue::Handle(v) => *v as i32,
            _ => -1,
        }
    }

    pub fn as_float(&self) -> f64 {
        match self {
            PropertyValue::Float(v) => *v,
            PropertyValue::Integer(v) => *v as f64,
            _ => 0.0,
        }
    }

    pub fn as_vector(&self) -> Vector {
        match self {
            PropertyValue::Vector(v) | PropertyValue::QAngle(v) => *v,
            _ => Vector::default(),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PropertyValue::String(s) => s,
            _ => "",
        }
    }

    pub fn as_handle(&self) -> Option<u32> {
        match self {
            PropertyValue::Handle(h) => Some(*h),
            PropertyValue::Integer(v) => Some(*v as u32),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> bool {
        self.as_integer() == 1
    }
}

/// Float wire encodings shared by both protocols.
#[derive(Debug, Clone, PartialEq)]
pub enum FloatKind {
    NoScale,
    Coord,
    CoordMp { integral: bool, low_precision: bool },
    Normal,
    CellCoord { bits: usize, integral: bool, low_precision: bool },
    Quantized { bits: usize, low: f32, high: f32 },
}

impl FloatKind {
    fn decode<T: Read + Seek + Send>(&self, r: &mut BitReader<T>) -> Result<f64> {
        Ok(match self {
            FloatKind::NoScale => r.read_float()? as f64,
            FloatKind::Coord => r.read_bitcoord()? as f64,
            FloatKind::CoordMp {
                integral,
                low_precision,
            } => r.read_bitcoordmp(*integral, *low_precision)? as f64,
            FloatKind::Normal => r.read_bitnormal()? as f64,
            FloatKind::CellCoord {
                bits,
                integral,
                low_precision,
            } => r.read_bitcellcoord(*bits, *integral, *low_precision)? as f64,
            FloatKind::Quantized { bits, low, high } => {
                if *bits == 0 || *bits >= 32 {
                    r.read_float()? as f64
                } else {
                    let steps = ((1_u64 << *bits) - 1) as f64;
                    let fraction = r.read_int(*bits)? as f64 / steps;
                    *low as f64 + (*high - *low) as f64 * fraction
                }
            }
        })
    }
}

/// One compiled decode step of a class decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoder {
    Bool,
    Int { bits: usize, unsigned: bool, varint: bool },
    Int64 { bits: usize, unsigned: bool, varint: bool },
    Float(FloatKind),
    Vector { kind: FloatKind, normal: bool },
    VectorXY { kind: FloatKind },
    QAngle { bits: usize, pitch_yaw_only: bool },
    CString,
    VarString,
    Array { elem: Box<Decoder>, count_bits: usize },
    Handle,
}

impl Decoder {
    pub fn decode<T: Read + Seek + Send>(&self, r: &mut BitReader<T>) -> Result<PropertyValue> {
        Ok(match self {
            Decoder::Bool => PropertyValue::Integer(r.read_bit()? as i32),
            Decoder::Int {
                bits,
                unsigned,
                varint,
            } => PropertyValue::Integer(match (varint, unsigned) {
                (true, true) => r.read_varint32()? as i32,
                (true, false) => r.read_signed_varint32()?,
                (false, true) => r.read_int(*bits)? as i32,
                (false, false) => r.read_signed_int(*bits)? as i32,
            }),
            Decoder::Int64 {
                bits,
                unsigned,
                varint,
            } => PropertyValue::Integer64(match (varint, unsigned) {
                (true, true) => r.read_varint64()? as i64,
                (true, false) => zigzag64(r.read_varint64()?),
                (false, true) => {
                    let low = r.read_int(32)? as u64;
                    let high = r.read_int(bits.saturating_sub(32))? as u64;
                    ((high << 32) | low) as i64
                }
                (false, false) => {
                    let neg = r.read_bit()?;
                    let low = r.read_int(32)? as u64;
                    let high = r.read_int(bits.saturating_sub(33))? as u64;
                    let val = ((high << 32) | low) as i64;
                    if neg {
                        -val
                    } else {
                        val
                    }
                }
            }),
            Decoder::Float(kind) => PropertyValue::Float(kind.decode(r)?),
            Decoder::Vector { kind, normal } => {
                let x = kind.decode(r)?;
                let y = kind.decode(r)?;
                let z = if *normal {
                    let sum = x * x + y * y;
                    let is_neg = r.read_bit()?;
                    let abs = if sum < 1.0 { f64::sqrt(1.0 - sum) } else { 0.0 };
                    if is_neg {
                        -abs
                    } else {
                        abs
                    }
                } else {
                    kind.decode(r)?
                };
                PropertyValue::Vector(Vector { x, y, z })
            }
            Decoder::VectorXY { kind } => PropertyValue::Vector(Vector {
                x: kind.decode(r)?,
                y: kind.decode(r)?,
                z: 0.0,
            }),
            Decoder::QAngle {
                bits,
                pitch_yaw_only,
            } => {
                if *pitch_yaw_only {
                    let scale = 360.0 / (1_u64 << *bits) as f64;
                    PropertyValue::QAngle(Vector {
                        x: r.read_int(*bits)? as f64 * scale,
                        y: r.read_int(*bits)? as f64 * scale,
                        z: 0.0,
                    })
                } else if *bits == 0 {
                    let has_x = r.read_bit()?;
                    let has_y = r.read_bit()?;
                    let has_z = r.read_bit()?;
                    PropertyValue::QAngle(Vector {
                        x: if has_x { r.read_bitcoord()? as f64 } else { 0.0 },
                        y: if has_y { r.read_bitcoord()? as f64 } else { 0.0 },
                        z: if has_z { r.read_bitcoord()? as f64 } else { 0.0 },
                    })
                } else {
                    let scale = 360.0 / (1_u64 << *bits) as f64;
                    PropertyValue::QAngle(Vector {
                        x: r.read_int(*bits)? as f64 * scale,
                        y: r.read_int(*bits)? as f64 * scale,
                        z: r.read_int(*bits)? as f64 * scale,
                    })
                }
            }
            Decoder::CString => {
                let length = r.read_int(STRING_PROP_LENGTH_BITS)?.min(MAX_STRING_PROP_LENGTH);
                PropertyValue::String(r.read_cstring(length)?)
            }
            Decoder::VarString => PropertyValue::String(r.read_string()?),
            Decoder::Array { elem, count_bits } => {
                let count = r.read_int(*count_bits)?;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(elem.decode(r)?);
                }
                PropertyValue::Array(values)
            }
            Decoder::Handle => PropertyValue::Handle(r.read_varint32()?),
        })
    }
}

fn zigzag64(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// One entry of a compiled class decoder: slot name, wire schema and the
/// decode step the slot runs.
#[derive(Debug, Clone)]
pub struct FlattenedPropEntry {
    pub name: String,
    pub prop: SendTableProperty,
    pub decoder: Decoder,
    pub index: i32,
}

/// Schema of one entity class; immutable once `DataTablesParsed` fires.
#[derive(Debug, Clone)]
pub struct ServerClass {
    pub id: i32,
    pub name: String,
    pub dt_name: String,
    pub base_classes: Vec<String>,
    pub flattened_props: Vec<FlattenedPropEntry>,
    pub prop_name_to_idx: HashMap<String, usize>,
    /// Source 2 decode tree; `None` for Source 1 classes.
    pub serializer: Option<Arc<Serializer>>,
}

impl ServerClass {
    pub fn has_base_class(&self, name: &str) -> bool {
        self.base_classes.iter().any(|b| b == name)
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.prop_name_to_idx.get(name).copied()
    }
}

/// The send-table registry: ingests class/property schemas of either
/// protocol, compiles per-class decoders and owns instance baselines.
#[derive(Default)]
pub struct ServerClasses {
    classes: Vec<Arc<ServerClass>>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<i32, usize>,
    class_bits: usize,
    instance_baselines: HashMap<i32, Vec<u8>>,
    preprocessed_baselines: HashMap<i32, Vec<PropertyValue>>,
}

impl ServerClasses {
    pub fn is_parsed(&self) -> bool {
        !self.classes.is_empty()
    }

    pub fn class_bits(&self) -> usize {
        self.class_bits
    }

    pub fn by_id(&self, id: i32) -> Option<&Arc<ServerClass>> {
        self.by_id.get(&id).map(|i| &self.classes[*i])
    }

    pub fn by_index(&self, index: usize) -> Option<&Arc<ServerClass>> {
        self.classes.get(index)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<ServerClass>> {
        self.by_name.get(name).map(|i| &self.classes[*i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServerClass>> {
        self.classes.iter()
    }

    /// Stores the default encoded property block for a class. Invalidates
    /// any previously decoded form of the baseline.
    pub fn set_instance_baseline(&mut self, class_id: i32, data: Vec<u8>) {
        self.preprocessed_baselines.remove(&class_id);
        self.instance_baselines.insert(class_id, data);
    }

    pub fn instance_baseline(&self, class_id: i32) -> Option<&Vec<u8>> {
        self.instance_baselines.get(&class_id)
    }

    pub fn preprocessed_baseline(&self, class_id: i32) -> Option<&Vec<PropertyValue>> {
        self.preprocessed_baselines.get(&class_id)
    }

    pub fn store_preprocessed_baseline(&mut self, class_id: i32, values: Vec<PropertyValue>) {
        self.preprocessed_baselines.insert(class_id, values);
    }

    /// Ingests a Source 1 `DataTables` frame: the send-table list followed
    /// by the server-class directory, then compiles every class decoder.
    pub fn on_data_tables(&mut self, payload: &[u8]) -> Result<()> {
        let mut r = BitReader::new_small_bit_reader(std::io::Cursor::new(payload))?;

        let mut tables: Vec<SendTable> = Vec::new();
        loop {
            let t = r.read_varint32()?;
            if t != SERVER_CLASS_IDENTIFIER {
                return Err(ParseError::SchemaMismatch(format!(
                    "expected send-table message ({SERVER_CLASS_IDENTIFIER}), got {t}"
                )));
            }

            let size = r.read_varint32()? as usize;
            r.begin_chunk(size << 3);
            let table = SendTable::from(CsvcMsgSendTable::decode(r.read_bytes(size)?.as_slice())?);
            r.end_chunk()?;
            if table.is_end {
                break;
            }
            tables.push(table);
        }

        let flattener = SendTableFlattener::new(&tables);

        let server_class_count = r.read_int(16)?;
        let mut classes = Vec::with_capacity(server_class_count);
        for _ in 0..server_class_count {
            let class_id = r.read_int(16)? as i32;
            if class_id as usize > server_class_count {
                return Err(ParseError::SchemaMismatch(format!(
                    "class id {class_id} exceeds class count {server_class_count}"
                )));
            }
            let name = r.read_string()?;
            let dt_name = r.read_string()?;

            let (flattened_props, base_classes) = flattener.flatten(&dt_name)?;
            let mut prop_name_to_idx = HashMap::with_capacity(flattened_props.len());
            for (idx, fp) in flattened_props.iter().enumerate() {
                prop_name_to_idx.insert(fp.name.to_owned(), idx);
            }

            debug!(class = %name, props = flattened_props.len(), "compiled class decoder");
            classes.push(Arc::new(ServerClass {
                id: class_id,
                name,
                dt_name,
                base_classes,
                flattened_props,
                prop_name_to_idx,
                serializer: None,
            }));
        }

        let class_bits = f64::ceil(f64::log2(classes.len().max(2) as f64)) as usize;
        self.install(classes, class_bits);
        Ok(())
    }

    /// Installs compiled classes coming from either schema path.
    pub fn install(&mut self, classes: Vec<Arc<ServerClass>>, class_bits: usize) {
        self.by_name.clear();
        self.by_id.clear();
        for (i, class) in classes.iter().enumerate() {
            self.by_name.insert(class.name.to_owned(), i);
            self.by_id.insert(class.id, i);
        }
        self.class_bits = class_bits;
        self.classes = classes;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn small_reader(bytes: Vec<u8>) -> BitReader<Cursor<Vec<u8>>> {
        BitReader::new_small_bit_reader(Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn int_decoder_respects_sign_and_width() {
        let mut r = small_reader(vec![0xFF, 0xFF, 0, 0, 0, 0, 0, 0]);
        let dec = Decoder::Int {
            bits: 8,
            unsigned: true,
            varint: false,
        };
        assert_eq!(dec.decode(&mut r).unwrap(), PropertyValue::Integer(255));

        let dec = Decoder::Int {
            bits: 8,
            unsigned: false,
            varint: false,
        };
        assert_eq!(dec.decode(&mut r).unwrap(), PropertyValue::Integer(-1));
    }

    #[test]
    fn quantized_float_maps_full_range() {
        // 8 bits, all ones: fraction == 1.0 -> high end of range.
        let mut r = small_reader(vec![0xFF, 0, 0, 0, 0, 0, 0, 0]);
        let dec = Decoder::Float(FloatKind::Quantized {
            bits: 8,
            low: -10.0,
            high: 10.0,
        });
        assert_eq!(dec.decode(&mut r).unwrap(), PropertyValue::Float(10.0));
    }

    #[test]
    fn array_decoder_reads_count_then_elements() {
        // 3-bit count of 2, then the 8-bit elements 7 and 9, LSB-first.
        let mut r = small_reader(vec![0x3A, 0x48, 0, 0, 0, 0, 0, 0]);
        let dec = Decoder::Array {
            elem: Box::new(Decoder::Int {
                bits: 8,
                unsigned: true,
                varint: false,
            }),
            count_bits: 3,
        };
        assert_eq!(
            dec.decode(&mut r).unwrap(),
            PropertyValue::Array(vec![PropertyValue::Integer(7), PropertyValue::Integer(9)])
        );
    }

    #[test]
    fn handle_decoder_reads_varint() {
        let mut r = small_reader(vec![0xAC, 0x02, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            Decoder::Handle.decode(&mut r).unwrap(),
            PropertyValue::Handle(300)
        );
    }

    #[test]
    fn baseline_invalidated_on_overwrite() {
        let mut classes = ServerClasses::default();
        classes.set_instance_baseline(3, vec![1, 2, 3]);
        classes.store_preprocessed_baseline(3, vec![PropertyValue::Integer(1)]);
        assert!(classes.preprocessed_baseline(3).is_some());

        classes.set_instance_baseline(3, vec![4, 5, 6]);
        assert!(classes.preprocessed_baseline(3).is_none());
        assert_eq!(classes.instance_baseline(3).unwrap(), &vec![4, 5, 6]);
    }
}
