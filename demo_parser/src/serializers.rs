use std::sync::Arc;

use ahash::AHashMap as HashMap;
use demo_bitreader::BitReader;
use prost::Message;
use tracing::debug;

use crate::error::{ParseError, Result};
use crate::fieldpath::FieldPath;
use crate::sendtable::SendTableProperty;
use crate::serverclass::{
    Decoder, FlattenedPropEntry, FloatKind, ServerClass,
};

// Quantized-float encode flags.
const QF_ROUND_DOWN: i32 = 1;
const QF_ROUND_UP: i32 = 2;

#[derive(Clone, PartialEq, Message)]
pub struct CDemoSendTables {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CDemoClassInfo {
    #[prost(message, repeated, tag = "1")]
    pub classes: Vec<ClassT>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ClassT {
    #[prost(int32, optional, tag = "1")]
    pub class_id: Option<i32>,
    #[prost(string, optional, tag = "2")]
    pub network_name: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub table_name: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CsvcMsgFlattenedSerializer {
    #[prost(message, repeated, tag = "1")]
    pub serializers: Vec<ProtoFlattenedSerializerT>,
    #[prost(string, repeated, tag = "2")]
    pub symbols: Vec<String>,
    #[prost(message, repeated, tag = "3")]
    pub fields: Vec<ProtoFlattenedSerializerFieldT>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoFlattenedSerializerT {
    #[prost(int32, optional, tag = "1")]
    pub serializer_name_sym: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub serializer_version: Option<i32>,
    #[prost(int32, repeated, tag = "3")]
    pub fields_index: Vec<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoFlattenedSerializerFieldT {
    #[prost(int32, optional, tag = "1")]
    pub var_type_sym: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub var_name_sym: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub bit_count: Option<i32>,
    #[prost(float, optional, tag = "4")]
    pub low_value: Option<f32>,
    #[prost(float, optional, tag = "5")]
    pub high_value: Option<f32>,
    #[prost(int32, optional, tag = "6")]
    pub encode_flags: Option<i32>,
    #[prost(int32, optional, tag = "7")]
    pub field_serializer_name_sym: Option<i32>,
    #[prost(int32, optional, tag = "8")]
    pub field_serializer_version: Option<i32>,
    #[prost(int32, optional, tag = "9")]
    pub send_node_sym: Option<i32>,
    #[prost(int32, optional, tag = "10")]
    pub var_encoder_sym: Option<i32>,
}

/// How one serializer field is laid out on the wire.
#[derive(Debug, Clone)]
pub enum FieldModel {
    Value(Decoder),
    FixedArray { elem: Decoder, size: usize },
    DynamicArray { elem: Decoder },
    /// Vector of serializer-described elements.
    DynamicTable { serializer: Arc<Serializer> },
    /// Nested serializer reached through the path without indexing.
    Pointer { serializer: Arc<Serializer> },
}

#[derive(Debug, Clone)]
pub struct SerializerField {
    pub var_name: String,
    pub var_type: String,
    pub bit_count: i32,
    pub model: FieldModel,
}

/// Source 2 class schema: an ordered field tree addressed by field paths.
#[derive(Debug, Clone)]
pub struct Serializer {
    pub name: String,
    pub fields: Vec<SerializerField>,
}

/// What a decoded field path resolved to.
#[derive(Debug)]
pub enum ResolvedOp {
    Value(Decoder),
    ArrayElem { index: usize, elem: Decoder },
    /// Path addresses a vector itself: a varint element count follows.
    ArrayResize,
    /// Path addresses a pointer field: a presence bit follows.
    PointerPresence,
}

#[derive(Debug)]
pub struct ResolvedField {
    pub name: String,
    pub op: ResolvedOp,
}

/// Resolves a field path against a serializer tree.
pub fn resolve_path(serializer: &Serializer, fp: &FieldPath) -> Result<ResolvedField> {
    let components = fp.components();
    let mut current = serializer;
    let mut name = String::new();
    let mut i = 0;

    loop {
        let idx = *components
            .get(i)
            .ok_or_else(|| ParseError::SchemaMismatch("empty field path".to_string()))?
            as usize;
        let field = current.fields.get(idx).ok_or_else(|| {
            ParseError::SchemaMismatch(format!(
                "field path component {idx} out of range in {}",
                current.name
            ))
        })?;

        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&field.var_name);

        let last = i + 1 == components.len();
        match &field.model {
            FieldModel::Value(decoder) => {
                if !last {
                    return Err(ParseError::SchemaMismatch(format!(
                        "field path descends into scalar {name}"
                    )));
                }
                return Ok(ResolvedField {
                    name,
                    op: ResolvedOp::Value(decoder.clone()),
                });
            }
            FieldModel::Pointer { serializer } => {
                if last {
                    return Ok(ResolvedField {
                        name,
                        op: ResolvedOp::PointerPresence,
                    });
                }
                current = serializer.as_ref();
                i += 1;
            }
            FieldModel::FixedArray { elem, .. } | FieldModel::DynamicArray { elem } => {
                if last {
                    return Ok(ResolvedField {
                        name,
                        op: ResolvedOp::ArrayResize,
                    });
                }
                return Ok(ResolvedField {
                    name,
                    op: ResolvedOp::ArrayElem {
                        index: components[i + 1] as usize,
                        elem: elem.clone(),
                    },
                });
            }
            FieldModel::DynamicTable { serializer } => {
                if last {
                    return Ok(ResolvedField {
                        name,
                        op: ResolvedOp::ArrayResize,
                    });
                }
                let index = components[i + 1] as usize;
                // Deeper components select a field of the element struct;
                // the element slot stores that field's decoded value.
                let elem = if i + 2 < components.len() {
                    let sub = FieldPath {
                        path: {
                            let mut p = [0; crate::fieldpath::MAX_FIELD_PATH_DEPTH];
                            let rest = &components[i + 2..];
                            p[..rest.len()].copy_from_slice(rest);
                            p
                        },
                        last: components.len() - i - 3,
                    };
                    match resolve_path(serializer, &sub)?.op {
                        ResolvedOp::Value(d) | ResolvedOp::ArrayElem { elem: d, .. } => d,
                        _ => Decoder::Bool,
                    }
                } else {
                    Decoder::Bool
                };
                return Ok(ResolvedField {
                    name,
                    op: ResolvedOp::ArrayElem { index, elem },
                });
            }
        }
    }
}

/// Ingests `CDemoSendTables`, builds the serializer graph and retains it
/// until the class directory (`CDemoClassInfo`) arrives.
#[derive(Default)]
pub struct SerializerRegistry {
    by_name: HashMap<String, Arc<Serializer>>,
}

impl SerializerRegistry {
    pub fn is_parsed(&self) -> bool {
        !self.by_name.is_empty()
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<Serializer>> {
        self.by_name.get(name)
    }

    pub fn on_send_tables(&mut self, msg: &CDemoSendTables) -> Result<()> {
        let data = msg.data();
        // The payload is a varint-length-prefixed flattened-serializer message.
        let mut r = BitReader::new_small_bit_reader(std::io::Cursor::new(data.to_vec()))?;
        let size = r.read_varint32()? as usize;
        let buf = r.read_bytes(size)?;
        let fs = CsvcMsgFlattenedSerializer::decode(buf.as_slice())?;

        let symbol = |sym: Option<i32>| -> Result<&str> {
            let sym = sym.unwrap_or_default();
            fs.symbols
                .get(sym as usize)
                .map(String::as_str)
                .ok_or_else(|| ParseError::SchemaMismatch(format!("symbol {sym} out of range")))
        };

        for proto_ser in fs.serializers.iter() {
            let ser_name = symbol(proto_ser.serializer_name_sym)?.to_string();
            let mut fields = Vec::with_capacity(proto_ser.fields_index.len());

            for field_index in proto_ser.fields_index.iter() {
                let proto_field = fs.fields.get(*field_index as usize).ok_or_else(|| {
                    ParseError::SchemaMismatch(format!("field index {field_index} out of range"))
                })?;

                let var_name = symbol(proto_field.var_name_sym)?.to_string();
                let var_type = symbol(proto_field.var_type_sym)?.to_string();
                let var_encoder = proto_field
                    .var_encoder_sym
                    .map(|s| symbol(Some(s)))
                    .transpose()?
                    .unwrap_or("");
                let field_serializer = proto_field
                    .field_serializer_name_sym
                    .map(|s| symbol(Some(s)))
                    .transpose()?
                    .map(|name| {
                        self.by_name.get(name).cloned().ok_or_else(|| {
                            ParseError::SchemaMismatch(format!(
                                "field serializer {name} referenced before definition"
                            ))
                        })
                    })
                    .transpose()?;

                let model = field_model(
                    &var_type,
                    var_encoder,
                    proto_field.bit_count(),
                    proto_field.low_value,
                    proto_field.high_value,
                    proto_field.encode_flags(),
                    field_serializer,
                )?;

                fields.push(SerializerField {
                    var_name,
                    var_type,
                    bit_count: proto_field.bit_count(),
                    model,
                });
            }

            debug!(serializer = %ser_name, fields = fields.len(), "built serializer");
            self.by_name.insert(
                ser_name.to_owned(),
                Arc::new(Serializer {
                    name: ser_name,
                    fields,
                }),
            );
        }
        Ok(())
    }

    /// Builds the compiled class set once `CDemoClassInfo` names the
    /// serializer of every networked class.
    pub fn build_classes(&self, msg: &CDemoClassInfo) -> Result<Vec<Arc<ServerClass>>> {
        let mut classes = Vec::with_capacity(msg.classes.len());
        for class in msg.classes.iter() {
            let name = class.network_name().to_string();
            let serializer = self.by_name.get(&name).cloned().ok_or_else(|| {
                ParseError::SchemaMismatch(format!("no serializer for class {name}"))
            })?;

            let mut flattened_props = Vec::new();
            flatten_serializer(&serializer, "", &mut flattened_props);
            let mut prop_name_to_idx = HashMap::with_capacity(flattened_props.len());
            for (idx, fp) in flattened_props.iter().enumerate() {
                prop_name_to_idx.insert(fp.name.to_owned(), idx);
            }

            classes.push(Arc::new(ServerClass {
                id: class.class_id(),
                name: name.to_owned(),
                dt_name: name,
                base_classes: Vec::new(),
                flattened_props,
                prop_name_to_idx,
                serializer: Some(serializer),
            }));
        }
        Ok(classes)
    }
}

/// Assigns one value slot per addressable field; nested serializers expand
/// with dotted prefixes, arrays occupy a single slot.
fn flatten_serializer(
    serializer: &Serializer,
    prefix: &str,
    out: &mut Vec<FlattenedPropEntry>,
) {
    for field in serializer.fields.iter() {
        let name = if prefix.is_empty() {
            field.var_name.to_owned()
        } else {
            format!("{prefix}.{}", field.var_name)
        };

        match &field.model {
            FieldModel::Pointer { serializer } => {
                flatten_serializer(serializer, &name, out);
            }
            FieldModel::Value(decoder) => {
                push_slot(out, name, field, decoder.clone());
            }
            FieldModel::FixedArray { elem, size } => {
                let decoder = Decoder::Array {
                    elem: Box::new(elem.clone()),
                    count_bits: 0,
                };
                let mut entry_field = field.clone();
                entry_field.bit_count = *size as i32;
                push_slot(out, name, &entry_field, decoder);
            }
            FieldModel::DynamicArray { elem } => {
                let decoder = Decoder::Array {
                    elem: Box::new(elem.clone()),
                    count_bits: 0,
                };
                push_slot(out, name, field, decoder);
            }
            FieldModel::DynamicTable { .. } => {
                let decoder = Decoder::Array {
                    elem: Box::new(Decoder::Bool),
                    count_bits: 0,
                };
                push_slot(out, name, field, decoder);
            }
        }
    }
}

fn push_slot(
    out: &mut Vec<FlattenedPropEntry>,
    name: String,
    field: &SerializerField,
    decoder: Decoder,
) {
    out.push(FlattenedPropEntry {
        prop: SendTableProperty {
            flags: 0,
            name: name.to_owned(),
            dt_name: String::new(),
            low_value: 0.0,
            high_value: 0.0,
            num_bits: field.bit_count,
            num_elems: 0,
            priority: 0,
            raw_type: -1,
        },
        decoder,
        index: out.len() as i32,
        name,
    });
}

fn field_model(
    var_type: &str,
    var_encoder: &str,
    bit_count: i32,
    low_value: Option<f32>,
    high_value: Option<f32>,
    encode_flags: i32,
    field_serializer: Option<Arc<Serializer>>,
) -> Result<FieldModel> {
    // Fixed-size arrays: `T[N]`. Char arrays are wire strings.
    if let Some(open) = var_type.find('[') {
        let base = &var_type[..open];
        if base == "char" {
            return Ok(FieldModel::Value(Decoder::VarString));
        }
        let size: usize = var_type[open + 1..var_type.len() - 1]
            .trim()
            .parse()
            .unwrap_or(0);
        let elem = scalar_decoder(base, var_encoder, bit_count, low_value, high_value, encode_flags);
        return Ok(FieldModel::FixedArray { elem, size });
    }

    if let Some(open) = var_type.find('<') {
        let outer = var_type[..open].trim();
        let inner = var_type[open + 1..var_type.rfind('>').unwrap_or(var_type.len())].trim();
        match outer {
            "CHandle" | "CEntityHandle" => {
                return Ok(FieldModel::Value(Decoder::Handle));
            }
            // Strong handles are full 64-bit references, not ehandles.
            "CStrongHandle" => {
                return Ok(FieldModel::Value(Decoder::Int64 {
                    bits: 0,
                    unsigned: true,
                    varint: true,
                }));
            }
            "CUtlVector" | "CNetworkUtlVectorBase" | "CUtlVectorEmbeddedNetworkVar" => {
                if let Some(serializer) = field_serializer {
                    return Ok(FieldModel::DynamicTable { serializer });
                }
                let elem = field_model(
                    inner,
                    var_encoder,
                    bit_count,
                    low_value,
                    high_value,
                    encode_flags,
                    None,
                )?;
                return Ok(match elem {
                    FieldModel::Value(decoder) => FieldModel::DynamicArray { elem: decoder },
                    _ => FieldModel::DynamicArray {
                        elem: Decoder::VarString,
                    },
                });
            }
            _ => {}
        }
    }

    if let Some(serializer) = field_serializer {
        return Ok(FieldModel::Pointer { serializer });
    }

    Ok(FieldModel::Value(scalar_decoder(
        var_type,
        var_encoder,
        bit_count,
        low_value,
        high_value,
        encode_flags,
    )))
}

fn scalar_decoder(
    var_type: &str,
    var_encoder: &str,
    bit_count: i32,
    low_value: Option<f32>,
    high_value: Option<f32>,
    encode_flags: i32,
) -> Decoder {
    match var_type {
        "bool" => Decoder::Bool,
        "int8" | "int16" | "int32" => Decoder::Int {
            bits: 0,
            unsigned: false,
            varint: true,
        },
        "int64" => Decoder::Int64 {
            bits: 0,
            unsigned: false,
            varint: true,
        },
        "uint8" | "uint16" | "uint32" | "CUtlStringToken" | "Color" | "color32" | "HSequence" => {
            Decoder::Int {
                bits: 0,
                unsigned: true,
                varint: true,
            }
        }
        "uint64" | "CStrongHandle" => {
            if var_encoder == "fixed64" {
                Decoder::Int64 {
                    bits: 64,
                    unsigned: true,
                    varint: false,
                }
            } else {
                Decoder::Int64 {
                    bits: 0,
                    unsigned: true,
                    varint: true,
                }
            }
        }
        "float32" | "CNetworkedQuantizedFloat" | "GameTime_t" => Decoder::Float(float_kind(
            var_type,
            var_encoder,
            bit_count,
            low_value,
            high_value,
            encode_flags,
        )),
        "Vector" => Decoder::Vector {
            kind: float_kind(
                "float32",
                var_encoder,
                bit_count,
                low_value,
                high_value,
                encode_flags,
            ),
            normal: var_encoder == "normal",
        },
        "Vector2D" => Decoder::VectorXY {
            kind: float_kind(
                "float32",
                var_encoder,
                bit_count,
                low_value,
                high_value,
                encode_flags,
            ),
        },
        "QAngle" => {
            if var_encoder == "qangle_pitch_yaw" {
                Decoder::QAngle {
                    bits: bit_count.max(1) as usize,
                    pitch_yaw_only: true,
                }
            } else {
                Decoder::QAngle {
                    bits: bit_count.max(0) as usize,
                    pitch_yaw_only: false,
                }
            }
        }
        "CUtlString" | "CUtlSymbolLarge" | "char" => Decoder::VarString,
        "CGameSceneNodeHandle" => Decoder::Handle,
        // Unknown engine types and enums fall back to the varint form.
        _ => Decoder::Int64 {
            bits: 0,
            unsigned: true,
            varint: true,
        },
    }
}

fn float_kind(
    var_type: &str,
    var_encoder: &str,
    bit_count: i32,
    low_value: Option<f32>,
    high_value: Option<f32>,
    encode_flags: i32,
) -> FloatKind {
    if var_type == "GameTime_t" {
        return FloatKind::NoScale;
    }
    match var_encoder {
        "coord" => return FloatKind::Coord,
        "normal" => return FloatKind::Normal,
        _ => {}
    }
    if bit_count <= 0 || bit_count >= 32 {
        return FloatKind::NoScale;
    }

    let mut low = low_value.unwrap_or(0.0);
    let mut high = high_value.unwrap_or(1.0);
    let step = (high - low) / (1_u64 << bit_count) as f32;
    if encode_flags & QF_ROUND_DOWN != 0 {
        high -= step;
    }
    if encode_flags & QF_ROUND_UP != 0 {
        low += step;
    }

    FloatKind::Quantized {
        bits: bit_count as usize,
        low,
        high,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_field(name: &str, var_type: &str) -> SerializerField {
        SerializerField {
            var_name: name.to_string(),
            var_type: var_type.to_string(),
            bit_count: 0,
            model: field_model(var_type, "", 0, None, None, 0, None).unwrap(),
        }
    }

    fn pawn_serializer() -> Arc<Serializer> {
        let body = Arc::new(Serializer {
            name: "CBodyComponent".to_string(),
            fields: vec![
                value_field("m_cellX", "uint16"),
                value_field("m_vecX", "CNetworkedQuantizedFloat"),
            ],
        });
        Arc::new(Serializer {
            name: "CCSPlayerPawn".to_string(),
            fields: vec![
                SerializerField {
                    var_name: "CBodyComponent".to_string(),
                    var_type: "CBodyComponent".to_string(),
                    bit_count: 0,
                    model: FieldModel::Pointer { serializer: body },
                },
                value_field("m_iHealth", "int32"),
                SerializerField {
                    var_name: "m_hMyWeapons".to_string(),
                    var_type: "CNetworkUtlVectorBase< CHandle< CBasePlayerWeapon > >".to_string(),
                    bit_count: 0,
                    model: FieldModel::DynamicArray {
                        elem: Decoder::Handle,
                    },
                },
            ],
        })
    }

    fn path(components: &[i32]) -> FieldPath {
        let mut fp = FieldPath::default();
        fp.path[..components.len()].copy_from_slice(components);
        fp.last = components.len() - 1;
        fp
    }

    #[test]
    fn flatten_expands_pointers_with_dotted_names() {
        let ser = pawn_serializer();
        let mut out = Vec::new();
        flatten_serializer(&ser, "", &mut out);
        let names: Vec<&str> = out.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "CBodyComponent.m_cellX",
                "CBodyComponent.m_vecX",
                "m_iHealth",
                "m_hMyWeapons"
            ]
        );
    }

    #[test]
    fn resolves_scalar_and_nested_paths() {
        let ser = pawn_serializer();

        let resolved = resolve_path(&ser, &path(&[1])).unwrap();
        assert_eq!(resolved.name, "m_iHealth");
        assert!(matches!(resolved.op, ResolvedOp::Value(_)));

        let resolved = resolve_path(&ser, &path(&[0, 1])).unwrap();
        assert_eq!(resolved.name, "CBodyComponent.m_vecX");
        assert!(matches!(resolved.op, ResolvedOp::Value(_)));
    }

    #[test]
    fn resolves_vector_size_and_element_paths() {
        let ser = pawn_serializer();

        let resolved = resolve_path(&ser, &path(&[2])).unwrap();
        assert!(matches!(resolved.op, ResolvedOp::ArrayResize));

        let resolved = resolve_path(&ser, &path(&[2, 5])).unwrap();
        match resolved.op {
            ResolvedOp::ArrayElem { index, elem } => {
                assert_eq!(index, 5);
                assert_eq!(elem, Decoder::Handle);
            }
            other => panic!("expected array element, got {other:?}"),
        }
    }

    #[test]
    fn char_arrays_decode_as_strings() {
        let model = field_model("char[64]", "", 0, None, None, 0, None).unwrap();
        assert!(matches!(model, FieldModel::Value(Decoder::VarString)));
    }

    #[test]
    fn handles_parse_from_template_types() {
        let model = field_model("CHandle< CCSPlayerPawn >", "", 0, None, None, 0, None).unwrap();
        assert!(matches!(model, FieldModel::Value(Decoder::Handle)));
    }

    #[test]
    fn quantized_floats_respect_round_down() {
        let kind = float_kind("float32", "", 8, Some(0.0), Some(256.0), QF_ROUND_DOWN);
        match kind {
            FloatKind::Quantized { bits, low, high } => {
                assert_eq!(bits, 8);
                assert_eq!(low, 0.0);
                assert_eq!(high, 255.0);
            }
            other => panic!("expected quantized, got {other:?}"),
        }
    }
}
