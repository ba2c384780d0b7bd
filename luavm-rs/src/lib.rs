//! Pooled Lua 5.4 sessions for host applications.
//!
//! | Module      | Role                                                    |
//! |-------------|---------------------------------------------------------|
//! | [`pool`]    | LIFO pool of reusable interpreter instances             |
//! | [`vm`]      | [`VirtualMachine`]: one session on one pooled instance  |
//! | [`value`]   | [`Dynamic`], the boundary value type                    |
//! | [`marshal`] | `Dynamic` ⇄ Lua conversion (array/map, numbers, blobs)  |
//! | [`bind`]    | live host objects in Lua ([`ScriptObject`])             |
//! | [`mapper`]  | weak table → struct mapping via `serde`                 |
//! | [`config`]  | [`VmOptions`] for new instances                         |
//! | [`error`]   | [`VmError`]                                             |
//!
//! The library emits `tracing` events but never installs a subscriber.

pub mod bind;
pub mod config;
pub mod error;
pub mod mapper;
pub mod marshal;
pub mod pool;
pub mod value;
pub mod vm;

pub use bind::ScriptObject;
pub use config::VmOptions;
pub use error::{MapError, VmError};
pub use pool::{Instance, StatePool};
pub use value::Dynamic;
pub use vm::VirtualMachine;

pub use mlua;
