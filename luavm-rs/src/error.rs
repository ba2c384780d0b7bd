//! Error taxonomy for the host/script boundary.
//!
//! | Variant                    | Raised by                               | Caller policy |
//! |----------------------------|-----------------------------------------|---------------|
//! | [`VmError::Config`]        | building a fresh interpreter instance   | fatal         |
//! | [`VmError::Load`] / `Io`   | `load_string` / `load_file`             | recoverable   |
//! | [`VmError::NothingLoaded`] | `execute` before any load               | recoverable   |
//! | [`VmError::Runtime`]       | `execute` / `call_function`             | caller decides (usually fatal) |
//! | [`VmError::Map`]           | `read_global_as` / `read_global_into`   | recoverable   |
//!
//! Protected calls never produce a `VmError`; see [`crate::vm::VirtualMachine::pcall`].

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by pools and sessions.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("cannot create Lua instance: {0}")]
    Config(#[source] mlua::Error),

    #[error("failed to compile chunk '{chunk}': {source}")]
    Load {
        chunk: String,
        #[source]
        source: mlua::Error,
    },

    #[error("cannot read script {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no chunk loaded")]
    NothingLoaded,

    #[error("global '{name}' is not a function (found {found})")]
    NotAFunction { name: String, found: &'static str },

    #[error("Lua runtime error: {0}")]
    Runtime(#[source] mlua::Error),

    #[error("{0}")]
    Bind(String),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

/// Error produced while mapping a dynamic value onto a host type.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct MapError {
    pub message: String,
}

impl MapError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl serde::de::Error for MapError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        Self::new(msg.to_string())
    }
}

/// Convert a host-side error into a Lua runtime error so it can cross back
/// into a script.
impl From<VmError> for mlua::Error {
    fn from(err: VmError) -> Self {
        match err {
            VmError::Runtime(e) | VmError::Lua(e) => e,
            other => mlua::Error::RuntimeError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_not_a_function() {
        let e = VmError::NotAFunction { name: "run".into(), found: "nil" };
        assert_eq!(e.to_string(), "global 'run' is not a function (found nil)");
    }

    #[test]
    fn bind_error_becomes_runtime_error() {
        let e: mlua::Error = VmError::Bind("no field 'x'".into()).into();
        match e {
            mlua::Error::RuntimeError(msg) => assert_eq!(msg, "no field 'x'"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn map_error_is_serde_error() {
        let e = <MapError as serde::de::Error>::custom("missing field `name`");
        assert_eq!(e.message, "missing field `name`");
    }
}
