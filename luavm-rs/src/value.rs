//! The boundary value type shared by host and script.
//!
//! [`Dynamic`] is what every value crossing between Rust and Lua becomes.
//! Numbers are split into `Int` and `Float`: a number that is exactly an
//! integer is always `Int`, whichever side it came from.  Composite Lua
//! tables become either an `Array` or a string-keyed `Map` (see
//! [`crate::marshal`] for the rule).

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use mlua::{AnyUserData, Function};

/// A dynamically typed value at the host/script boundary.
#[derive(Debug, Clone, Default)]
pub enum Dynamic {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Opaque byte buffer; handed to Lua as a userdata handle, not a string.
    Bytes(Vec<u8>),
    Array(Vec<Dynamic>),
    Map(BTreeMap<String, Dynamic>),
    /// A Lua function, passed through untouched.
    Function(Function),
    /// A host object bound into Lua, passed through untouched.
    UserData(AnyUserData),
}

impl Dynamic {
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Dynamic::Bytes(data.into())
    }

    /// Build a number, normalising integral floats to `Int`.
    pub fn number(x: f64) -> Self {
        match float_as_int(x) {
            Some(n) => Dynamic::Int(n),
            None => Dynamic::Float(x),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Dynamic::Nil => "nil",
            Dynamic::Bool(_) => "boolean",
            Dynamic::Int(_) => "integer",
            Dynamic::Float(_) => "float",
            Dynamic::Str(_) => "string",
            Dynamic::Bytes(_) => "bytes",
            Dynamic::Array(_) => "array",
            Dynamic::Map(_) => "map",
            Dynamic::Function(_) => "function",
            Dynamic::UserData(_) => "userdata",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Dynamic::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Dynamic::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Dynamic::Int(n) => Some(*n),
            Dynamic::Float(x) => float_as_int(*x),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Dynamic::Int(n) => Some(*n as f64),
            Dynamic::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Dynamic::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Dynamic]> {
        match self {
            Dynamic::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Dynamic>> {
        match self {
            Dynamic::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Map lookup; `None` for non-maps and missing keys.
    pub fn get(&self, key: &str) -> Option<&Dynamic> {
        self.as_map()?.get(key)
    }
}

/// `Some(n)` when `x` is exactly representable as an `i64`.
pub(crate) fn float_as_int(x: f64) -> Option<i64> {
    // 2^63 is exact as an f64; anything at or above it does not fit.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if x.is_finite() && x == x.trunc() && x >= -LIMIT && x < LIMIT {
        Some(x as i64)
    } else {
        None
    }
}

impl PartialEq for Dynamic {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Dynamic::Nil, Dynamic::Nil) => true,
            (Dynamic::Bool(a), Dynamic::Bool(b)) => a == b,
            (Dynamic::Int(a), Dynamic::Int(b)) => a == b,
            (Dynamic::Float(a), Dynamic::Float(b)) => a == b,
            (Dynamic::Str(a), Dynamic::Str(b)) => a == b,
            (Dynamic::Bytes(a), Dynamic::Bytes(b)) => a == b,
            (Dynamic::Array(a), Dynamic::Array(b)) => a == b,
            (Dynamic::Map(a), Dynamic::Map(b)) => a == b,
            (Dynamic::Function(a), Dynamic::Function(b)) => a.to_pointer() == b.to_pointer(),
            (Dynamic::UserData(a), Dynamic::UserData(b)) => a.to_pointer() == b.to_pointer(),
            _ => false,
        }
    }
}

impl fmt::Display for Dynamic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dynamic::Nil => f.write_str("nil"),
            Dynamic::Bool(b) => write!(f, "{b}"),
            Dynamic::Int(n) => write!(f, "{n}"),
            Dynamic::Float(x) => write!(f, "{x}"),
            Dynamic::Str(s) => f.write_str(s),
            Dynamic::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Dynamic::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Dynamic::Map(m) => {
                f.write_str("{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Dynamic::Function(func) => write!(f, "function: {:p}", func.to_pointer()),
            Dynamic::UserData(ud) => write!(f, "userdata: {:p}", ud.to_pointer()),
        }
    }
}

// ── Host value → Dynamic ──────────────────────────────────────────────────────

impl From<()> for Dynamic {
    fn from(_: ()) -> Self {
        Dynamic::Nil
    }
}

impl From<bool> for Dynamic {
    fn from(b: bool) -> Self {
        Dynamic::Bool(b)
    }
}

macro_rules! from_lossless_int {
    ($($t:ty),*) => {$(
        impl From<$t> for Dynamic {
            fn from(n: $t) -> Self {
                Dynamic::Int(i64::from(n))
            }
        }
    )*};
}

from_lossless_int!(i8, i16, i32, i64, u8, u16, u32);

macro_rules! from_wide_int {
    ($($t:ty),*) => {$(
        impl From<$t> for Dynamic {
            fn from(n: $t) -> Self {
                match i64::try_from(n) {
                    Ok(n) => Dynamic::Int(n),
                    Err(_) => Dynamic::Float(n as f64),
                }
            }
        }
    )*};
}

from_wide_int!(isize, usize, u64);

impl From<f32> for Dynamic {
    fn from(x: f32) -> Self {
        Dynamic::Float(f64::from(x))
    }
}

impl From<f64> for Dynamic {
    fn from(x: f64) -> Self {
        Dynamic::Float(x)
    }
}

impl From<String> for Dynamic {
    fn from(s: String) -> Self {
        Dynamic::Str(s)
    }
}

impl From<&str> for Dynamic {
    fn from(s: &str) -> Self {
        Dynamic::Str(s.to_owned())
    }
}

impl From<&[u8]> for Dynamic {
    fn from(b: &[u8]) -> Self {
        Dynamic::Bytes(b.to_vec())
    }
}

impl From<Vec<Dynamic>> for Dynamic {
    fn from(items: Vec<Dynamic>) -> Self {
        Dynamic::Array(items)
    }
}

impl<T: Into<Dynamic>> From<BTreeMap<String, T>> for Dynamic {
    fn from(m: BTreeMap<String, T>) -> Self {
        Dynamic::Map(m.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<Dynamic>> From<HashMap<String, T>> for Dynamic {
    fn from(m: HashMap<String, T>) -> Self {
        Dynamic::Map(m.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<Dynamic>> From<Option<T>> for Dynamic {
    fn from(v: Option<T>) -> Self {
        v.map_or(Dynamic::Nil, Into::into)
    }
}

impl From<Function> for Dynamic {
    fn from(f: Function) -> Self {
        Dynamic::Function(f)
    }
}

impl From<AnyUserData> for Dynamic {
    fn from(ud: AnyUserData) -> Self {
        Dynamic::UserData(ud)
    }
}

impl FromIterator<Dynamic> for Dynamic {
    fn from_iter<I: IntoIterator<Item = Dynamic>>(iter: I) -> Self {
        Dynamic::Array(iter.into_iter().collect())
    }
}

impl FromIterator<(String, Dynamic)> for Dynamic {
    fn from_iter<I: IntoIterator<Item = (String, Dynamic)>>(iter: I) -> Self {
        Dynamic::Map(iter.into_iter().collect())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
