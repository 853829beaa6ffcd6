use ahash::AHashMap as HashMap;
use prost::Message;

use crate::error::{ParseError, Result};
use crate::serverclass::{Decoder, FlattenedPropEntry, FloatKind};

pub type SendPropertyFlags = i32;

pub trait SendPropertyFlagsTrait {
    fn has_flag_set(self, flag: SendPropertyFlags) -> bool;
}

impl SendPropertyFlagsTrait for SendPropertyFlags {
    #[inline]
    fn has_flag_set(self, flag: SendPropertyFlags) -> bool {
        self & flag == flag
    }
}

pub const PROP_FLAG_UNSIGNED: SendPropertyFlags = 1;
pub const PROP_FLAG_COORD: SendPropertyFlags = 2;
pub const PROP_FLAG_NO_SCALE: SendPropertyFlags = 4;
pub const PROP_FLAG_NORMAL: SendPropertyFlags = 32;
pub const PROP_FLAG_EXCLUDE: SendPropertyFlags = 64;
pub const PROP_FLAG_INSIDE_ARRAY: SendPropertyFlags = 256;
pub const PROP_FLAG_COLLAPSIBLE: SendPropertyFlags = 2048;
pub const PROP_FLAG_COORD_MP: SendPropertyFlags = 4096;
pub const PROP_FLAG_COORD_MP_LOW_PRECISION: SendPropertyFlags = 8192;
pub const PROP_FLAG_COORD_MP_INTEGRAL: SendPropertyFlags = 16384;
pub const PROP_FLAG_CELL_COORD: SendPropertyFlags = 65536;
pub const PROP_FLAG_CELL_COORD_LOW_PRECISION: SendPropertyFlags = 131072;
pub const PROP_FLAG_CHANGES_OFTEN: SendPropertyFlags = 262144;
pub const PROP_FLAG_VARINT: SendPropertyFlags = 524288;

const PROP_FLAG_SPECIAL_FLOAT: SendPropertyFlags = PROP_FLAG_COORD
    | PROP_FLAG_NO_SCALE
    | PROP_FLAG_NORMAL
    | PROP_FLAG_COORD_MP
    | PROP_FLAG_COORD_MP_LOW_PRECISION
    | PROP_FLAG_COORD_MP_INTEGRAL
    | PROP_FLAG_CELL_COORD
    | PROP_FLAG_CELL_COORD_LOW_PRECISION;

pub const PROP_TYPE_INT: i32 = 0;
pub const PROP_TYPE_FLOAT: i32 = 1;
pub const PROP_TYPE_VECTOR: i32 = 2;
pub const PROP_TYPE_VECTOR_XY: i32 = 3;
pub const PROP_TYPE_STRING: i32 = 4;
pub const PROP_TYPE_ARRAY: i32 = 5;
pub const PROP_TYPE_DATA_TABLE: i32 = 6;
pub const PROP_TYPE_INT64: i32 = 7;

// Properties carrying this flag sort as if they had priority 64.
const CHANGES_OFTEN_PRIORITY: i32 = 64;

#[derive(Debug, Clone)]
pub struct SendTable {
    pub properties: Vec<SendTableProperty>,
    pub name: String,
    pub is_end: bool,
}

impl From<CsvcMsgSendTable> for SendTable {
    fn from(st: CsvcMsgSendTable) -> Self {
        let mut properties = Vec::with_capacity(st.props.len());
        properties.extend(st.props.iter().map(SendTableProperty::from));
        Self {
            properties,
            name: st.net_table_name().to_string(),
            is_end: st.is_end(),
        }
    }
}

/// Wire-level schema of one networked property.
#[derive(Debug, Clone)]
pub struct SendTableProperty {
    pub flags: SendPropertyFlags,
    pub name: String,
    pub dt_name: String,
    pub low_value: f32,
    pub high_value: f32,
    pub num_bits: i32,
    pub num_elems: i32,
    pub priority: i32,
    pub raw_type: i32,
}

impl From<&SendpropT> for SendTableProperty {
    fn from(prop: &SendpropT) -> Self {
        Self {
            flags: prop.flags,
            dt_name: prop.dt_name().to_owned(),
            high_value: prop.high_value(),
            low_value: prop.low_value(),
            name: prop.var_name.to_owned(),
            num_bits: prop.num_bits,
            num_elems: prop.num_elements(),
            priority: prop.priority,
            raw_type: prop.r#type,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExcludeEntry {
    pub var_name: String,
    pub dt_name: String,
    pub excluding_dt: String,
}

#[derive(Clone, Message)]
pub struct CsvcMsgSendTable {
    #[prost(bool, optional, tag = "1")]
    pub is_end: Option<bool>,
    #[prost(string, optional, tag = "2")]
    pub net_table_name: Option<String>,
    #[prost(bool, optional, tag = "3")]
    pub needs_decoder: Option<bool>,
    #[prost(message, repeated, tag = "4")]
    pub props: Vec<SendpropT>,
}

#[derive(Clone, Message)]
pub struct SendpropT {
    #[prost(int32, tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub var_name: String,
    #[prost(int32, tag = "3")]
    pub flags: i32,
    #[prost(int32, tag = "4")]
    pub priority: i32,
    #[prost(string, optional, tag = "5")]
    pub dt_name: Option<String>,
    #[prost(int32, optional, tag = "6")]
    pub num_elements: Option<i32>,
    #[prost(float, optional, tag = "7")]
    pub low_value: Option<f32>,
    #[prost(float, optional, tag = "8")]
    pub high_value: Option<f32>,
    #[prost(int32, tag = "9")]
    pub num_bits: i32,
}

/// Flattens the inherited send-table DAG of one server class into the
/// ordered property list its compiled decoder runs over.
pub struct SendTableFlattener<'a> {
    tables: &'a [SendTable],
    by_name: HashMap<&'a str, usize>,
}

impl<'a> SendTableFlattener<'a> {
    pub fn new(tables: &'a [SendTable]) -> Self {
        let mut by_name = HashMap::with_capacity(tables.len());
        for (i, table) in tables.iter().enumerate() {
            by_name.insert(table.name.as_str(), i);
        }
        Self { tables, by_name }
    }

    fn table(&self, name: &str) -> Result<&'a SendTable> {
        self.by_name
            .get(name)
            .map(|i| &self.tables[*i])
            .ok_or_else(|| ParseError::SchemaMismatch(format!("unknown send table {name}")))
    }

    /// Returns the flattened properties and the names of the base classes
    /// collected along `baseclass` edges.
    pub fn flatten(&self, dt_name: &str) -> Result<(Vec<FlattenedPropEntry>, Vec<String>)> {
        let table = self.table(dt_name)?;

        let mut excludes: HashMap<String, ExcludeEntry> = HashMap::new();
        let mut base_classes = Vec::new();
        self.gather_prerequisites(table, true, &mut base_classes, &mut excludes)?;

        let mut flattened = Vec::with_capacity(table.properties.len());
        self.gather_props(table, "", &excludes, &mut flattened)?;
        sort_by_priority(&mut flattened);

        for (i, fp) in flattened.iter_mut().enumerate() {
            fp.index = i as i32;
        }

        Ok((flattened, base_classes))
    }

    fn gather_prerequisites(
        &self,
        table: &SendTable,
        collect_base_classes: bool,
        base_classes: &mut Vec<String>,
        excludes: &mut HashMap<String, ExcludeEntry>,
    ) -> Result<()> {
        for stp in table.properties.iter() {
            if stp.flags.has_flag_set(PROP_FLAG_EXCLUDE) {
                excludes.insert(
                    stp.name.to_owned(),
                    ExcludeEntry {
                        var_name: stp.name.to_owned(),
                        dt_name: stp.dt_name.to_owned(),
                        excluding_dt: table.name.to_owned(),
                    },
                );
            }

            if stp.raw_type == PROP_TYPE_DATA_TABLE {
                let sub = self.table(&stp.dt_name)?;
                self.gather_prerequisites(
                    sub,
                    collect_base_classes && stp.name == "baseclass",
                    base_classes,
                    excludes,
                )?;
                if collect_base_classes && stp.name == "baseclass" {
                    base_classes.push(stp.dt_name.to_owned());
                }
            }
        }
        Ok(())
    }

    // Nested-table properties land before the current table's scalars;
    // collapsible tables inline into the scalar run instead.
    fn gather_props(
        &self,
        table: &SendTable,
        prefix: &str,
        excludes: &HashMap<String, ExcludeEntry>,
        out: &mut Vec<FlattenedPropEntry>,
    ) -> Result<()> {
        let mut scalars = Vec::with_capacity(table.properties.len());
        self.gather_props_iterate(table, prefix, excludes, &mut scalars, out)?;
        out.append(&mut scalars);
        Ok(())
    }

    fn gather_props_iterate(
        &self,
        table: &SendTable,
        prefix: &str,
        excludes: &HashMap<String, ExcludeEntry>,
        scalars: &mut Vec<FlattenedPropEntry>,
        out: &mut Vec<FlattenedPropEntry>,
    ) -> Result<()> {
        for (i, prop) in table.properties.iter().enumerate() {
            if prop.flags.has_flag_set(PROP_FLAG_INSIDE_ARRAY)
                || prop.flags.has_flag_set(PROP_FLAG_EXCLUDE)
                || is_prop_excluded(table, prop, excludes)
            {
                continue;
            }

            if prop.raw_type == PROP_TYPE_DATA_TABLE {
                let sub = self.table(&prop.dt_name)?;
                if prop.flags.has_flag_set(PROP_FLAG_COLLAPSIBLE) {
                    self.gather_props_iterate(sub, prefix, excludes, scalars, out)?;
                } else {
                    let mut sub_prefix = prefix.to_string();
                    if !prop.name.is_empty() {
                        sub_prefix.push_str(&prop.name);
                        sub_prefix.push('.');
                    }
                    self.gather_props(sub, &sub_prefix, excludes, out)?;
                }
            } else {
                let array_elem = if prop.raw_type == PROP_TYPE_ARRAY {
                    if i == 0 {
                        return Err(ParseError::SchemaMismatch(format!(
                            "array property {} has no element property",
                            prop.name
                        )));
                    }
                    Some(table.properties[i - 1].to_owned())
                } else {
                    None
                };

                scalars.push(FlattenedPropEntry {
                    name: format!("{}{}", prefix, prop.name),
                    decoder: compile_decoder(prop, array_elem.as_ref())?,
                    prop: prop.to_owned(),
                    index: scalars.len() as i32,
                });
            }
        }
        Ok(())
    }
}

fn is_prop_excluded(
    table: &SendTable,
    prop: &SendTableProperty,
    excludes: &HashMap<String, ExcludeEntry>,
) -> bool {
    matches!(excludes.get(&prop.name), Some(exclude) if exclude.dt_name == table.name)
}

/// Stable sort by `(priority, original index)`; `changes_often` properties
/// take an implicit priority of 64.
pub fn sort_by_priority(flattened: &mut [FlattenedPropEntry]) {
    flattened.sort_by_key(|fp| effective_priority(&fp.prop));
}

fn effective_priority(prop: &SendTableProperty) -> i32 {
    if prop.flags.has_flag_set(PROP_FLAG_CHANGES_OFTEN)
        && prop.priority > CHANGES_OFTEN_PRIORITY
    {
        CHANGES_OFTEN_PRIORITY
    } else {
        prop.priority
    }
}

/// Maps one wire schema entry onto a decode step.
pub fn compile_decoder(
    prop: &SendTableProperty,
    array_elem: Option<&SendTableProperty>,
) -> Result<Decoder> {
    Ok(match prop.raw_type {
        PROP_TYPE_INT => Decoder::Int {
            bits: prop.num_bits as usize,
            unsigned: prop.flags.has_flag_set(PROP_FLAG_UNSIGNED),
            varint: prop.flags.has_flag_set(PROP_FLAG_VARINT),
        },
        PROP_TYPE_INT64 => Decoder::Int64 {
            bits: prop.num_bits as usize,
            unsigned: prop.flags.has_flag_set(PROP_FLAG_UNSIGNED),
            varint: prop.flags.has_flag_set(PROP_FLAG_VARINT),
        },
        PROP_TYPE_FLOAT => Decoder::Float(compile_float(prop)),
        PROP_TYPE_VECTOR => Decoder::Vector {
            kind: compile_float(prop),
            normal: prop.flags.has_flag_set(PROP_FLAG_NORMAL),
        },
        PROP_TYPE_VECTOR_XY => Decoder::VectorXY {
            kind: compile_float(prop),
        },
        PROP_TYPE_STRING => Decoder::CString,
        PROP_TYPE_ARRAY => {
            let elem = array_elem.ok_or_else(|| {
                ParseError::SchemaMismatch(format!(
                    "array property {} has no element property",
                    prop.name
                ))
            })?;
            let count_bits = f64::floor(f64::log2(prop.num_elems.max(1) as f64) + 1.0) as usize;
            Decoder::Array {
                elem: Box::new(compile_decoder(elem, None)?),
                count_bits,
            }
        }
        other => {
            return Err(ParseError::SchemaMismatch(format!(
                "property {} has unknown type {other}",
                prop.name
            )))
        }
    })
}

fn compile_float(prop: &SendTableProperty) -> FloatKind {
    if prop.flags & PROP_FLAG_SPECIAL_FLOAT == 0 {
        return FloatKind::Quantized {
            bits: prop.num_bits as usize,
            low: prop.low_value,
            high: prop.high_value,
        };
    }

    if prop.flags.has_flag_set(PROP_FLAG_COORD) {
        FloatKind::Coord
    } else if prop.flags.has_flag_set(PROP_FLAG_COORD_MP) {
        FloatKind::CoordMp {
            integral: false,
            low_precision: false,
        }
    } else if prop.flags.has_flag_set(PROP_FLAG_COORD_MP_LOW_PRECISION) {
        FloatKind::CoordMp {
            integral: false,
            low_precision: true,
        }
    } else if prop.flags.has_flag_set(PROP_FLAG_COORD_MP_INTEGRAL) {
        FloatKind::CoordMp {
            integral: true,
            low_precision: false,
        }
    } else if prop.flags.has_flag_set(PROP_FLAG_NO_SCALE) {
        FloatKind::NoScale
    } else if prop.flags.has_flag_set(PROP_FLAG_NORMAL) {
        FloatKind::Normal
    } else {
        FloatKind::CellCoord {
            bits: prop.num_bits as usize,
            integral: prop.flags.has_flag_set(PROP_FLAG_CELL_COORD),
            low_precision: prop.flags.has_flag_set(PROP_FLAG_CELL_COORD_LOW_PRECISION),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prop(name: &str, priority: i32, flags: SendPropertyFlags) -> SendTableProperty {
        SendTableProperty {
            flags,
            name: name.to_string(),
            dt_name: String::new(),
            low_value: 0.0,
            high_value: 1.0,
            num_bits: 8,
            num_elems: 0,
            priority,
            raw_type: PROP_TYPE_INT,
        }
    }

    fn entry(name: &str, priority: i32, flags: SendPropertyFlags) -> FlattenedPropEntry {
        let p = prop(name, priority, flags);
        FlattenedPropEntry {
            decoder: compile_decoder(&p, None).unwrap(),
            name: name.to_string(),
            prop: p,
            index: 0,
        }
    }

    #[test]
    fn priority_sort_is_stable_with_changes_often_at_64() {
        let mut props = vec![
            entry("z_low_prio", 128, 0),
            entry("a_first", 32, 0),
            entry("b_second", 32, 0),
            entry("hot", 4096, PROP_FLAG_CHANGES_OFTEN),
            entry("c_third", 64, 0),
        ];
        sort_by_priority(&mut props);

        let order: Vec<&str> = props.iter().map(|p| p.name.as_str()).collect();
        // Ties keep encounter order; changes_often sorts into the 64 bucket
        // after same-priority regular properties seen earlier.
        assert_eq!(
            order,
            vec!["a_first", "b_second", "hot", "c_third", "z_low_prio"]
        );
    }

    #[test]
    fn changes_often_keeps_lower_priority() {
        let mut props = vec![
            entry("hot_low", 2, PROP_FLAG_CHANGES_OFTEN),
            entry("plain", 1, 0),
        ];
        sort_by_priority(&mut props);
        let order: Vec<&str> = props.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(order, vec!["plain", "hot_low"]);
    }

    #[test]
    fn flatten_inlines_base_and_collapsible_tables() {
        let base = SendTable {
            name: "DT_Base".to_string(),
            is_end: false,
            properties: vec![prop("m_iBaseVal", 0, 0)],
        };
        let nested = SendTable {
            name: "DT_Local".to_string(),
            is_end: false,
            properties: vec![prop("m_flNested", 0, 0)],
        };
        let mut table_prop = prop("baseclass", 0, PROP_FLAG_COLLAPSIBLE);
        table_prop.raw_type = PROP_TYPE_DATA_TABLE;
        table_prop.dt_name = "DT_Base".to_string();
        let mut local_prop = prop("localdata", 0, 0);
        local_prop.raw_type = PROP_TYPE_DATA_TABLE;
        local_prop.dt_name = "DT_Local".to_string();
        let derived = SendTable {
            name: "DT_Derived".to_string(),
            is_end: false,
            properties: vec![table_prop, local_prop, prop("m_iOwnVal", 0, 0)],
        };

        let tables = vec![base, nested, derived];
        let flattener = SendTableFlattener::new(&tables);
        let (flattened, base_classes) = flattener.flatten("DT_Derived").unwrap();

        // Non-collapsible nested tables flatten ahead of the scalar run.
        let names: Vec<&str> = flattened.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["localdata.m_flNested", "m_iBaseVal", "m_iOwnVal"]
        );
        assert_eq!(base_classes, vec!["DT_Base".to_string()]);
        assert!(flattened.iter().enumerate().all(|(i, p)| p.index == i as i32));
    }

    #[test]
    fn excluded_props_are_dropped() {
        let mut exclude_marker = prop("m_iBaseVal", 0, PROP_FLAG_EXCLUDE);
        exclude_marker.dt_name = "DT_Base".to_string();
        let base = SendTable {
            name: "DT_Base".to_string(),
            is_end: false,
            properties: vec![prop("m_iBaseVal", 0, 0), prop("m_iKept", 0, 0)],
        };
        let mut table_prop = prop("baseclass", 0, PROP_FLAG_COLLAPSIBLE);
        table_prop.raw_type = PROP_TYPE_DATA_TABLE;
        table_prop.dt_name = "DT_Base".to_string();
        let derived = SendTable {
            name: "DT_Derived".to_string(),
            is_end: false,
            properties: vec![exclude_marker, table_prop],
        };

        let tables = vec![base, derived];
        let flattener = SendTableFlattener::new(&tables);
        let (flattened, _) = flattener.flatten("DT_Derived").unwrap();
        let names: Vec<&str> = flattened.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["m_iKept"]);
    }
}
