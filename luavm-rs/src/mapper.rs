//! Weak mapping of Lua tables onto host structs.
//!
//! [`from_dynamic`] drives any `serde::Deserialize` type from a [`Dynamic`],
//! coercing scalar kinds the way a config loader would rather than insisting
//! on an exact schema match.
//!
//! # Field names
//!
//! A table key matches a struct field when it is equal to the field name, or
//! equal after lower-casing both and dropping underscores.  `WorkPlace`,
//! `workPlace` and `work_place` all land in `work_place`.  When several keys
//! match one field, the exact name wins; otherwise the last key in sorted
//! order does.  Keys that match no field are ignored.
//!
//! Fields with no key are mapped from nil, so they take the zero value in the
//! table below: `0`, `""`, `false`, empty sequences, `None`, nested structs of
//! zero values, and for enums the first variant.  `#[serde(default)]` is not
//! consulted.  `#[serde(alias)]` is not supported.
//!
//! # Coercions
//!
//! | Target   | Accepted                                                        |
//! |----------|-----------------------------------------------------------------|
//! | integer  | integer; float truncated toward zero; bool as 1/0; string parsed after trimming ASCII whitespace (`+`/`-` sign, decimal digits, or any float syntax then truncated); empty string or nil as 0 |
//! | float    | integer; float; bool as 1.0/0.0; trimmed string parsed as `f64`; empty string or nil as 0.0 |
//! | bool     | bool; non-zero number; `1`/`t`/`true` and `0`/`f`/`false` (any case); empty string or nil as false |
//! | string   | string; numbers via `Display`; bool as `"1"`/`"0"`; bytes decoded lossily; nil as `""` |
//! | sequence | array; nil or empty map as empty; any other scalar as a one-element sequence |
//! | struct   | map; nil or empty array as empty                                 |
//! | option   | nil as `None`, anything else as `Some`                          |
//! | enum     | variant name; single-entry map `{Variant = payload}`; nil as the first variant |
//! | char     | one-character string; nil as `'\0'`                              |
//!
//! Parsing is locale independent.  Out-of-range integers are errors, never
//! wrapped or saturated.  Lua functions and userdata cannot be mapped.

use std::collections::BTreeMap;

use serde::de::{
    self, DeserializeOwned, DeserializeSeed, EnumAccess, IntoDeserializer, MapAccess, SeqAccess,
    VariantAccess, Visitor,
};
use serde::de::value::StringDeserializer;
use serde::de::Deserializer as _;
use serde::forward_to_deserialize_any;

use crate::error::MapError;
use crate::value::{float_as_int, Dynamic};

/// Map a dynamic value onto `T` with weak coercion.
pub fn from_dynamic<T: DeserializeOwned>(value: Dynamic) -> Result<T, MapError> {
    T::deserialize(Deserializer::new(value))
}

/// `serde` deserializer over a [`Dynamic`] value.
pub struct Deserializer {
    value: Dynamic,
}

impl Deserializer {
    pub fn new(value: Dynamic) -> Self {
        Self { value }
    }
}

fn invalid(value: &Dynamic, target: &str) -> MapError {
    MapError::new(format!("cannot convert {} to {target}", value.type_name()))
}

// ── Scalar coercions ──────────────────────────────────────────────────────────

fn truncate_float(x: f64) -> Result<i64, MapError> {
    float_as_int(x.trunc()).ok_or_else(|| MapError::new(format!("{x} is out of integer range")))
}

/// Largest float that still names a `u64`.  `u64::MAX` itself rounds up to
/// 2^64 when stored as a float, so the bound is inclusive.
const U64_LIMIT: f64 = 18_446_744_073_709_551_616.0;

fn truncate_unsigned(x: f64) -> Result<u64, MapError> {
    let t = x.trunc();
    if t < 0.0 {
        return Err(MapError::new(format!("{x} is negative, expected an unsigned integer")));
    }
    if t <= U64_LIMIT {
        Ok(t as u64)
    } else {
        Err(MapError::new(format!("{x} is out of integer range")))
    }
}

fn parse_uint(s: &str) -> Result<u64, MapError> {
    let t = s.trim_matches(|c: char| c.is_ascii_whitespace());
    if t.is_empty() {
        return Ok(0);
    }
    match t.parse::<u64>() {
        Ok(n) => Ok(n),
        Err(e) if matches!(e.kind(), std::num::IntErrorKind::PosOverflow) => {
            Err(MapError::new(format!("{t:?} is out of integer range")))
        }
        Err(_) => match t.parse::<f64>() {
            Ok(x) => truncate_unsigned(x),
            Err(_) => Err(MapError::new(format!("cannot parse {t:?} as an integer"))),
        },
    }
}

fn coerce_u64(v: &Dynamic) -> Result<u64, MapError> {
    match v {
        Dynamic::Float(x) => truncate_unsigned(*x),
        Dynamic::Str(s) => parse_uint(s),
        other => {
            let n = coerce_i64(other)?;
            u64::try_from(n)
                .map_err(|_| MapError::new(format!("{n} is negative, expected an unsigned integer")))
        }
    }
}

fn parse_int(s: &str) -> Result<i64, MapError> {
    let t = s.trim_matches(|c: char| c.is_ascii_whitespace());
    if t.is_empty() {
        return Ok(0);
    }
    match t.parse::<i64>() {
        Ok(n) => Ok(n),
        Err(e) if matches!(e.kind(), std::num::IntErrorKind::PosOverflow | std::num::IntErrorKind::NegOverflow) => {
            Err(MapError::new(format!("{t:?} is out of integer range")))
        }
        Err(_) => match t.parse::<f64>() {
            Ok(x) => truncate_float(x),
            Err(_) => Err(MapError::new(format!("cannot parse {t:?} as an integer"))),
        },
    }
}

fn coerce_i64(v: &Dynamic) -> Result<i64, MapError> {
    match v {
        Dynamic::Nil => Ok(0),
        Dynamic::Bool(b) => Ok(i64::from(*b)),
        Dynamic::Int(n) => Ok(*n),
        Dynamic::Float(x) => truncate_float(*x),
        Dynamic::Str(s) => parse_int(s),
        other => Err(invalid(other, "an integer")),
    }
}

fn coerce_f64(v: &Dynamic) -> Result<f64, MapError> {
    match v {
        Dynamic::Nil => Ok(0.0),
        Dynamic::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Dynamic::Int(n) => Ok(*n as f64),
        Dynamic::Float(x) => Ok(*x),
        Dynamic::Str(s) => {
            let t = s.trim_matches(|c: char| c.is_ascii_whitespace());
            if t.is_empty() {
                return Ok(0.0);
            }
            t.parse::<f64>()
                .map_err(|_| MapError::new(format!("cannot parse {t:?} as a number")))
        }
        other => Err(invalid(other, "a number")),
    }
}

fn coerce_bool(v: &Dynamic) -> Result<bool, MapError> {
    match v {
        Dynamic::Nil => Ok(false),
        Dynamic::Bool(b) => Ok(*b),
        Dynamic::Int(n) => Ok(*n != 0),
        Dynamic::Float(x) => Ok(*x != 0.0),
        Dynamic::Str(s) => {
            let t = s.trim_matches(|c: char| c.is_ascii_whitespace()).to_ascii_lowercase();
            match t.as_str() {
                "1" | "t" | "true" => Ok(true),
                "" | "0" | "f" | "false" => Ok(false),
                _ => Err(MapError::new(format!("cannot parse {s:?} as a boolean"))),
            }
        }
        other => Err(invalid(other, "a boolean")),
    }
}

fn coerce_string(v: Dynamic) -> Result<String, MapError> {
    match v {
        Dynamic::Nil => Ok(String::new()),
        Dynamic::Bool(b) => Ok(if b { "1" } else { "0" }.to_owned()),
        Dynamic::Int(n) => Ok(n.to_string()),
        Dynamic::Float(x) => Ok(x.to_string()),
        Dynamic::Str(s) => Ok(s),
        Dynamic::Bytes(b) => Ok(String::from_utf8_lossy(&b).into_owned()),
        other => Err(invalid(&other, "a string")),
    }
}

/// The field `key` lands in, if any: an exact match first, then a folded one.
fn match_field(key: &str, fields: &'static [&'static str]) -> Option<&'static str> {
    if let Some(f) = fields.iter().find(|f| **f == key) {
        return Some(*f);
    }
    let folded = fold(key);
    fields.iter().find(|f| fold(f) == folded).copied()
}

/// Rename table keys to the struct's field names, one entry per field, and
/// fill fields with no key with nil.
fn align_fields(
    map: BTreeMap<String, Dynamic>,
    fields: &'static [&'static str],
) -> BTreeMap<String, Dynamic> {
    let mut out = BTreeMap::new();
    let mut exact: Vec<&'static str> = Vec::new();
    for (key, value) in map {
        let Some(field) = match_field(&key, fields) else { continue };
        if field == key {
            exact.push(field);
            out.insert(field.to_owned(), value);
        } else if !exact.contains(&field) {
            out.insert(field.to_owned(), value);
        }
    }
    for field in fields {
        out.entry((*field).to_owned()).or_insert(Dynamic::Nil);
    }
    out
}

fn fold(name: &str) -> String {
    name.chars()
        .filter(|&c| c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

// ── Deserializer ──────────────────────────────────────────────────────────────

macro_rules! deserialize_signed {
    ($($method:ident),*) => {$(
        fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
            visitor.visit_i64(coerce_i64(&self.value)?)
        }
    )*};
}

macro_rules! deserialize_unsigned {
    ($($method:ident),*) => {$(
        fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
            visitor.visit_u64(coerce_u64(&self.value)?)
        }
    )*};
}

impl<'de> de::Deserializer<'de> for Deserializer {
    type Error = MapError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
        match self.value {
            Dynamic::Nil => visitor.visit_unit(),
            Dynamic::Bool(b) => visitor.visit_bool(b),
            Dynamic::Int(n) => visitor.visit_i64(n),
            Dynamic::Float(x) => visitor.visit_f64(x),
            Dynamic::Str(s) => visitor.visit_string(s),
            Dynamic::Bytes(b) => visitor.visit_byte_buf(b),
            Dynamic::Array(items) => visitor.visit_seq(SeqDeserializer::new(items)),
            Dynamic::Map(map) => visitor.visit_map(MapDeserializer::new(map)),
            other => Err(invalid(&other, "a host value")),
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
        visitor.visit_bool(coerce_bool(&self.value)?)
    }

    deserialize_signed!(deserialize_i8, deserialize_i16, deserialize_i32, deserialize_i64);
    deserialize_unsigned!(deserialize_u8, deserialize_u16, deserialize_u32, deserialize_u64);

    fn deserialize_f32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
        visitor.visit_f64(coerce_f64(&self.value)?)
    }

    fn deserialize_f64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
        visitor.visit_f64(coerce_f64(&self.value)?)
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
        if self.value.is_nil() {
            return visitor.visit_char('\0');
        }
        let s = coerce_string(self.value)?;
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => visitor.visit_char(c),
            _ => Err(MapError::new(format!("expected a single character, found {s:?}"))),
        }
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
        visitor.visit_string(coerce_string(self.value)?)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
        visitor.visit_string(coerce_string(self.value)?)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
        match self.value {
            Dynamic::Bytes(b) => visitor.visit_byte_buf(b),
            Dynamic::Str(s) => visitor.visit_byte_buf(s.into_bytes()),
            Dynamic::Array(items) => visitor.visit_seq(SeqDeserializer::new(items)),
            other => Err(invalid(&other, "bytes")),
        }
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
        match self.value {
            Dynamic::Nil => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, MapError> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, MapError> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
        match self.value {
            Dynamic::Array(items) => visitor.visit_seq(SeqDeserializer::new(items)),
            Dynamic::Nil => visitor.visit_seq(SeqDeserializer::new(Vec::new())),
            Dynamic::Map(m) if m.is_empty() => visitor.visit_seq(SeqDeserializer::new(Vec::new())),
            Dynamic::Map(_) => Err(MapError::new("cannot convert map to a sequence")),
            single => visitor.visit_seq(SeqDeserializer::new(vec![single])),
        }
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value, MapError> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, MapError> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
        match self.value {
            Dynamic::Map(map) => visitor.visit_map(MapDeserializer::new(map)),
            Dynamic::Nil => visitor.visit_map(MapDeserializer::new(BTreeMap::new())),
            Dynamic::Array(items) => {
                let map = items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| ((i + 1).to_string(), v))
                    .collect();
                visitor.visit_map(MapDeserializer::new(map))
            }
            other => Err(invalid(&other, "a map")),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, MapError> {
        let map = match self.value {
            Dynamic::Map(map) => map,
            Dynamic::Nil => BTreeMap::new(),
            Dynamic::Array(items) if items.is_empty() => BTreeMap::new(),
            other => return Err(invalid(&other, name)),
        };
        visitor.visit_map(MapDeserializer::new(align_fields(map, fields)))
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, MapError> {
        match self.value {
            Dynamic::Nil => match variants.first() {
                Some(first) => visitor.visit_enum(EnumDeserializer {
                    variant: (*first).to_owned(),
                    value: None,
                }),
                None => Err(MapError::new(format!("enum {name} has no variants"))),
            },
            Dynamic::Str(variant) => visitor.visit_enum(EnumDeserializer { variant, value: None }),
            Dynamic::Map(map) if map.len() == 1 => match map.into_iter().next() {
                Some((variant, value)) => {
                    visitor.visit_enum(EnumDeserializer { variant, value: Some(value) })
                }
                None => Err(MapError::new(format!("empty map for enum {name}"))),
            },
            other => Err(invalid(&other, name)),
        }
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
        self.deserialize_string(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, MapError> {
        visitor.visit_unit()
    }

    forward_to_deserialize_any! { i128 u128 }
}

// ── Access helpers ────────────────────────────────────────────────────────────

struct SeqDeserializer {
    iter: std::vec::IntoIter<Dynamic>,
    index: usize,
}

impl SeqDeserializer {
    fn new(items: Vec<Dynamic>) -> Self {
        Self { iter: items.into_iter(), index: 0 }
    }
}

impl<'de> SeqAccess<'de> for SeqDeserializer {
    type Error = MapError;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> Result<Option<T::Value>, MapError> {
        let Some(item) = self.iter.next() else { return Ok(None) };
        self.index += 1;
        let index = self.index;
        seed.deserialize(Deserializer::new(item))
            .map(Some)
            .map_err(|e| MapError::new(format!("[{index}]: {e}")))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct MapDeserializer {
    iter: std::collections::btree_map::IntoIter<String, Dynamic>,
    pending: Option<(String, Dynamic)>,
}

impl MapDeserializer {
    fn new(map: BTreeMap<String, Dynamic>) -> Self {
        Self { iter: map.into_iter(), pending: None }
    }
}

impl<'de> MapAccess<'de> for MapDeserializer {
    type Error = MapError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>, MapError> {
        let Some((key, value)) = self.iter.next() else { return Ok(None) };
        let key_de: StringDeserializer<MapError> = key.clone().into_deserializer();
        let out = seed.deserialize(key_de)?;
        self.pending = Some((key, value));
        Ok(Some(out))
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value, MapError> {
        let (key, value) = self
            .pending
            .take()
            .ok_or_else(|| MapError::new("map value requested before its key"))?;
        seed.deserialize(Deserializer::new(value))
            .map_err(|e| MapError::new(format!("{key}: {e}")))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct EnumDeserializer {
    variant: String,
    value: Option<Dynamic>,
}

impl<'de> EnumAccess<'de> for EnumDeserializer {
    type Error = MapError;
    type Variant = VariantDeserializer;

    fn variant_seed<V: DeserializeSeed<'de>>(self, seed: V) -> Result<(V::Value, Self::Variant), MapError> {
        let variant_de: StringDeserializer<MapError> = self.variant.into_deserializer();
        let variant = seed.deserialize(variant_de)?;
        Ok((variant, VariantDeserializer { value: self.value }))
    }
}

struct VariantDeserializer {
    value: Option<Dynamic>,
}

impl<'de> VariantAccess<'de> for VariantDeserializer {
    type Error = MapError;

    fn unit_variant(self) -> Result<(), MapError> {
        Ok(())
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> Result<T::Value, MapError> {
        seed.deserialize(Deserializer::new(self.value.unwrap_or_default()))
    }

    fn tuple_variant<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value, MapError> {
        Deserializer::new(self.value.unwrap_or_default()).deserialize_seq(visitor)
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, MapError> {
        Deserializer::new(self.value.unwrap_or_default()).deserialize_struct("variant", fields, visitor)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
