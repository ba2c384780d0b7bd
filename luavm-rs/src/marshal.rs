//! Conversion between [`Dynamic`] and `mlua::Value`.
//!
//! # Rules
//!
//! | Host ([`Dynamic`]) | Lua                                  |
//! |--------------------|--------------------------------------|
//! | `Nil`              | `nil`                                |
//! | `Bool`             | boolean                              |
//! | `Int`              | integer                              |
//! | `Float`            | float (comes back as `Int` if integral) |
//! | `Str`              | string                               |
//! | `Bytes`            | [`Blob`] userdata (opaque handle)    |
//! | `Array`            | table with keys `1..=n`              |
//! | `Map`              | table with string keys               |
//! | `Function`/`UserData` | passed through                    |
//!
//! A Lua table converts to `Array` when its keys are exactly `1..=n`
//! (including the empty table), otherwise to `Map` with every key,
//! integer ones included, turned into a string.  Lua values with no
//! `Dynamic` counterpart (threads, light userdata) become `Nil` and are
//! logged.

use std::collections::BTreeMap;
use std::ffi::c_void;

use mlua::prelude::*;
use mlua::{FromLua, IntoLua, MetaMethod, UserData, UserDataMethods};

use crate::value::{float_as_int, Dynamic};

/// Tables nested deeper than this convert to `Nil`.
pub const MAX_DEPTH: usize = 64;

// ── Blob ──────────────────────────────────────────────────────────────────────

/// Byte buffer handed to Lua as userdata.
///
/// Scripts can take its length (`#blob`) and print it, but cannot index it;
/// it exists to carry bytes through Lua code back to the host unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl UserData for Blob {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Len, |_, this, ()| Ok(this.0.len()));
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("blob({} bytes)", this.0.len()))
        });
    }
}

// ── Host → Lua ────────────────────────────────────────────────────────────────

/// Convert a host value into a Lua value owned by `lua`.
pub fn to_lua(lua: &Lua, value: &Dynamic) -> LuaResult<LuaValue> {
    Ok(match value {
        Dynamic::Nil => LuaValue::Nil,
        Dynamic::Bool(b) => LuaValue::Boolean(*b),
        Dynamic::Int(n) => LuaValue::Integer(*n),
        Dynamic::Float(x) => LuaValue::Number(*x),
        Dynamic::Str(s) => LuaValue::String(lua.create_string(s)?),
        Dynamic::Bytes(b) => LuaValue::UserData(lua.create_userdata(Blob(b.clone()))?),
        Dynamic::Array(items) => {
            let tbl = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                tbl.raw_set(i + 1, to_lua(lua, item)?)?;
            }
            LuaValue::Table(tbl)
        }
        Dynamic::Map(map) => {
            let tbl = lua.create_table_with_capacity(0, map.len())?;
            for (k, v) in map {
                tbl.raw_set(k.as_str(), to_lua(lua, v)?)?;
            }
            LuaValue::Table(tbl)
        }
        Dynamic::Function(f) => LuaValue::Function(f.clone()),
        Dynamic::UserData(ud) => LuaValue::UserData(ud.clone()),
    })
}

/// Convert a list of host values into Lua call arguments.
pub fn to_lua_multi(lua: &Lua, values: &[Dynamic]) -> LuaResult<LuaMultiValue> {
    Ok(values
        .iter()
        .map(|v| to_lua(lua, v))
        .collect::<LuaResult<Vec<_>>>()?
        .into())
}

// ── Lua → Host ────────────────────────────────────────────────────────────────

/// Convert a Lua value into a host value.  Never fails; see module docs.
pub fn from_lua(value: LuaValue) -> Dynamic {
    Converter::default().convert(value, 0)
}

/// Convert Lua call results into host values.
pub fn from_lua_multi(values: LuaMultiValue) -> Vec<Dynamic> {
    values.into_iter().map(from_lua).collect()
}

#[derive(Default)]
struct Converter {
    // Tables on the current conversion path, for cycle detection.
    open: Vec<*const c_void>,
}

impl Converter {
    fn convert(&mut self, value: LuaValue, depth: usize) -> Dynamic {
        match value {
            LuaValue::Nil => Dynamic::Nil,
            LuaValue::Boolean(b) => Dynamic::Bool(b),
            LuaValue::Integer(n) => Dynamic::Int(n),
            LuaValue::Number(x) => Dynamic::number(x),
            LuaValue::String(s) => match s.to_str() {
                Ok(text) => Dynamic::Str(text.to_string()),
                Err(_) => Dynamic::Bytes(s.as_bytes().to_vec()),
            },
            LuaValue::Table(tbl) => self.table(tbl, depth),
            LuaValue::Function(f) => Dynamic::Function(f),
            LuaValue::UserData(ud) => {
                let blob = ud.borrow::<Blob>().ok().map(|b| b.0.clone());
                match blob {
                    Some(bytes) => Dynamic::Bytes(bytes),
                    None => Dynamic::UserData(ud),
                }
            }
            other => {
                tracing::error!(kind = other.type_name(), "unsupported Lua value converted to nil");
                Dynamic::Nil
            }
        }
    }

    fn table(&mut self, tbl: LuaTable, depth: usize) -> Dynamic {
        if depth >= MAX_DEPTH {
            tracing::warn!(max_depth = MAX_DEPTH, "Lua table nested too deeply, converted to nil");
            return Dynamic::Nil;
        }
        let ptr = tbl.to_pointer();
        if self.open.contains(&ptr) {
            tracing::warn!("cyclic Lua table reference converted to nil");
            return Dynamic::Nil;
        }
        self.open.push(ptr);

        let mut entries = Vec::new();
        for pair in tbl.pairs::<LuaValue, LuaValue>() {
            match pair {
                Ok(kv) => entries.push(kv),
                Err(e) => {
                    tracing::error!(error = %e, "failed to iterate Lua table");
                    break;
                }
            }
        }

        let n = entries.len();
        let is_sequence = entries
            .iter()
            .all(|(k, _)| sequence_index(k).is_some_and(|i| i <= n));

        let out = if is_sequence {
            let mut items = vec![Dynamic::Nil; n];
            for (k, v) in entries {
                if let Some(i) = sequence_index(&k) {
                    items[i - 1] = self.convert(v, depth + 1);
                }
            }
            Dynamic::Array(items)
        } else {
            let mut map = BTreeMap::new();
            for (k, v) in entries {
                map.insert(key_string(&k), self.convert(v, depth + 1));
            }
            Dynamic::Map(map)
        };

        self.open.pop();
        out
    }
}

/// A positive integer key, as a 1-based index.
fn sequence_index(key: &LuaValue) -> Option<usize> {
    let n = match key {
        LuaValue::Integer(n) => *n,
        LuaValue::Number(x) => float_as_int(*x)?,
        _ => return None,
    };
    usize::try_from(n).ok().filter(|&i| i >= 1)
}

/// String form of a table key for `Map` conversion.
fn key_string(key: &LuaValue) -> String {
    match key {
        LuaValue::Integer(n) => n.to_string(),
        LuaValue::Number(x) => Dynamic::number(*x).to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        LuaValue::String(s) => s.to_string_lossy().to_string(),
        other => format!("{}: {:p}", other.type_name(), other.to_pointer()),
    }
}

// ── mlua trait glue ───────────────────────────────────────────────────────────

impl IntoLua for Dynamic {
    fn into_lua(self, lua: &Lua) -> LuaResult<LuaValue> {
        to_lua(lua, &self)
    }
}

impl FromLua for Dynamic {
    fn from_lua(value: LuaValue, _lua: &Lua) -> LuaResult<Self> {
        Ok(from_lua(value))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(lua: &Lua, src: &str) -> Dynamic {
        from_lua(lua.load(src).eval::<LuaValue>().unwrap())
    }

    fn map(pairs: &[(&str, Dynamic)]) -> Dynamic {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn integral_numbers_become_ints() {
        let lua = Lua::new();
        assert_eq!(eval(&lua, "return 5"), Dynamic::Int(5));
        assert_eq!(eval(&lua, "return 4.0"), Dynamic::Int(4));
        assert_eq!(eval(&lua, "return 10 / 4"), Dynamic::Float(2.5));
        assert_eq!(eval(&lua, "return 2^70"), Dynamic::Float(2f64.powi(70)));
    }

    #[test]
    fn contiguous_table_is_array() {
        let lua = Lua::new();
        assert_eq!(
            eval(&lua, "return {10, 20, 30}"),
            Dynamic::Array(vec![Dynamic::Int(10), Dynamic::Int(20), Dynamic::Int(30)])
        );
        assert_eq!(
            eval(&lua, "return {[3] = 'c', [1] = 'a', [2] = 'b'}"),
            Dynamic::Array(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn empty_table_is_empty_array() {
        let lua = Lua::new();
        assert_eq!(eval(&lua, "return {}"), Dynamic::Array(vec![]));
    }

    #[test]
    fn mixed_table_is_map_with_string_keys() {
        let lua = Lua::new();
        assert_eq!(
            eval(&lua, "return {x = 1, [2] = 2}"),
            map(&[("x", Dynamic::Int(1)), ("2", Dynamic::Int(2))])
        );
        assert_eq!(
            eval(&lua, "return {'a', 'b', n = 2}"),
            map(&[("1", "a".into()), ("2", "b".into()), ("n", Dynamic::Int(2))])
        );
    }

    #[test]
    fn gap_makes_a_map() {
        let lua = Lua::new();
        assert_eq!(
            eval(&lua, "return {[1] = true, [3] = false}"),
            map(&[("1", Dynamic::Bool(true)), ("3", Dynamic::Bool(false))])
        );
    }

    #[test]
    fn odd_keys_are_stringified() {
        let lua = Lua::new();
        assert_eq!(
            eval(&lua, "return {[true] = 1, [1.5] = 2, [-1] = 3}"),
            map(&[("true", Dynamic::Int(1)), ("1.5", Dynamic::Int(2)), ("-1", Dynamic::Int(3))])
        );
    }

    #[test]
    fn nested_tables() {
        let lua = Lua::new();
        let v = eval(&lua, "return {name = 'x', tags = {'a', 'b'}}");
        assert_eq!(v.get("name"), Some(&Dynamic::Str("x".into())));
        assert_eq!(v.get("tags"), Some(&Dynamic::Array(vec!["a".into(), "b".into()])));
    }

    #[test]
    fn cyclic_table_is_cut() {
        let lua = Lua::new();
        let v = eval(&lua, "local t = {name = 'loop'} t.self = t return t");
        assert_eq!(v.get("self"), Some(&Dynamic::Nil));
        assert_eq!(v.get("name"), Some(&Dynamic::Str("loop".into())));
    }

    #[test]
    fn shared_subtable_is_not_a_cycle() {
        let lua = Lua::new();
        let v = eval(&lua, "local s = {1} return {a = s, b = s}");
        assert_eq!(v.get("a"), v.get("b"));
        assert_eq!(v.get("a"), Some(&Dynamic::Array(vec![Dynamic::Int(1)])));
    }

    #[test]
    fn bytes_travel_as_userdata() {
        let lua = Lua::new();
        let v = to_lua(&lua, &Dynamic::bytes(b"\x00\xff".to_vec())).unwrap();
        assert!(matches!(v, LuaValue::UserData(_)));
        lua.globals().set("blob", v.clone()).unwrap();
        let len: i64 = lua.load("return #blob").eval().unwrap();
        assert_eq!(len, 2);
        assert_eq!(from_lua(v), Dynamic::Bytes(vec![0, 255]));
    }

    #[test]
    fn non_utf8_string_becomes_bytes() {
        let lua = Lua::new();
        let s = lua.create_string(b"\xff\xfe").unwrap();
        assert_eq!(from_lua(LuaValue::String(s)), Dynamic::Bytes(vec![0xff, 0xfe]));
    }

    #[test]
    fn map_to_lua_and_back() {
        let lua = Lua::new();
        let host = map(&[("a", Dynamic::Int(1)), ("b", Dynamic::Float(0.25))]);
        let tbl = to_lua(&lua, &host).unwrap();
        lua.globals().set("t", tbl.clone()).unwrap();
        let a: i64 = lua.load("return t.a").eval().unwrap();
        assert_eq!(a, 1);
        assert_eq!(from_lua(tbl), host);
    }

    #[test]
    fn functions_pass_through() {
        let lua = Lua::new();
        let f: LuaFunction = lua.load("return function() return 7 end").eval().unwrap();
        let d = from_lua(LuaValue::Function(f.clone()));
        assert_eq!(d, Dynamic::Function(f));
        let back = to_lua(&lua, &d).unwrap();
        let r: i64 = back.as_function().unwrap().call(()).unwrap();
        assert_eq!(r, 7);
    }

    #[test]
    fn threads_convert_to_nil() {
        let lua = Lua::new();
        let v: LuaValue = lua
            .load("return coroutine.create(function() end)")
            .eval()
            .unwrap();
        assert_eq!(from_lua(v), Dynamic::Nil);
    }

    #[test]
    fn multi_values() {
        let lua = Lua::new();
        let args = to_lua_multi(&lua, &[Dynamic::Int(1), "x".into()]).unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(from_lua_multi(args), vec![Dynamic::Int(1), Dynamic::Str("x".into())]);
    }
}
