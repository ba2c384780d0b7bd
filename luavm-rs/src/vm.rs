//! Script sessions.
//!
//! A [`VirtualMachine`] borrows one interpreter instance from a
//! [`StatePool`] for its whole lifetime and gives it back when closed or
//! dropped.  Every value crossing the boundary goes through
//! [`crate::marshal`].
//!
//! ```no_run
//! use luavm::{Dynamic, VirtualMachine};
//!
//! let mut vm = VirtualMachine::new()?;
//! vm.register_dynamic_function("add", |args| {
//!     let a = args.first().and_then(Dynamic::as_i64).unwrap_or(0);
//!     let b = args.get(1).and_then(Dynamic::as_i64).unwrap_or(0);
//!     Ok(Dynamic::Int(a + b))
//! })?;
//! vm.execute_string("result = add(2, 3)")?;
//! assert_eq!(vm.get_global("result")?, Dynamic::Int(5));
//! vm.close();
//! # Ok::<(), luavm::VmError>(())
//! ```
//!
//! # Failure channels
//!
//! [`execute`](VirtualMachine::execute) and
//! [`call_function`](VirtualMachine::call_function) return script errors as
//! [`VmError::Runtime`]; callers that treat a failing script as fatal simply
//! propagate it.  The [`pcall`](VirtualMachine::pcall) family catches the
//! error, logs it and yields `None` instead.

use std::path::Path;
use std::sync::{Arc, Mutex};

use mlua::prelude::*;
use serde::de::DeserializeOwned;

use crate::bind::{Bound, ScriptObject};
use crate::error::VmError;
use crate::mapper;
use crate::marshal::{from_lua, from_lua_multi, to_lua, to_lua_multi};
use crate::pool::{self, Instance, StatePool};
use crate::value::Dynamic;

/// Name of the global function returning the script directory.
pub const SCRIPT_PATH_FN: &str = "GetLuaPath";

/// A single-owner Lua session backed by a pooled instance.
pub struct VirtualMachine {
    instance: Option<Instance>,
    pool: Option<Arc<StatePool>>,
    chunk: Option<LuaFunction>,
}

impl VirtualMachine {
    /// Open a session on the process-wide pool.
    pub fn new() -> Result<Self, VmError> {
        Self::with_pool(pool::global())
    }

    /// Open a session on `pool`.
    pub fn with_pool(pool: Arc<StatePool>) -> Result<Self, VmError> {
        let instance = pool.borrow()?;
        let script_dir = pool.options().resolve_script_dir();
        let vm = Self { instance: Some(instance), pool: Some(pool), chunk: None };
        vm.install_script_path(&script_dir)?;
        Ok(vm)
    }

    /// Wrap an externally created Lua state.  It is dropped, not pooled, on
    /// close.
    pub fn from_lua(lua: Lua, script_dir: &Path) -> Result<Self, VmError> {
        let vm = Self {
            instance: Some(Instance::detached(lua)),
            pool: None,
            chunk: None,
        };
        vm.install_script_path(script_dir)?;
        Ok(vm)
    }

    fn install_script_path(&self, dir: &Path) -> Result<(), VmError> {
        let path = dir.to_string_lossy().into_owned();
        self.register_function(SCRIPT_PATH_FN, move |_, ()| Ok(path.clone()))
    }

    fn instance(&self) -> &Instance {
        // Only `close`/`drop` take the instance, and both consume the session.
        match &self.instance {
            Some(inst) => inst,
            None => unreachable!("session used after close"),
        }
    }

    /// The underlying Lua state.
    pub fn lua(&self) -> &Lua {
        self.instance().lua()
    }

    /// Identity of the pooled instance this session holds.
    pub fn instance_id(&self) -> u64 {
        self.instance().id()
    }

    // ── Host → script registration ────────────────────────────────────────

    /// Install a Rust function as global `name`, replacing any existing value.
    pub fn register_function<F, A, R>(&self, name: &str, func: F) -> Result<(), VmError>
    where
        F: Fn(&Lua, A) -> LuaResult<R> + Send + 'static,
        A: FromLuaMulti,
        R: IntoLuaMulti,
    {
        let lua = self.lua();
        lua.globals().set(name, lua.create_function(func)?)?;
        Ok(())
    }

    /// Install a function whose arguments and result are marshalled through
    /// [`Dynamic`].
    pub fn register_dynamic_function<F>(&self, name: &str, func: F) -> Result<(), VmError>
    where
        F: Fn(Vec<Dynamic>) -> Result<Dynamic, VmError> + Send + 'static,
    {
        self.register_function(name, move |lua, args: LuaMultiValue| {
            let result = func(from_lua_multi(args))?;
            to_lua(lua, &result)
        })
    }

    /// Run `loader(name)` and register its result as module `name`.
    ///
    /// The loader runs on every call, even when an earlier session on the
    /// same pooled instance registered `name`.  Its result replaces
    /// `package.loaded[name]` (so `require` sees it) and global `name`.
    /// A loader error is returned and leaves both untouched.
    pub fn register_module<F>(&self, name: &str, loader: F) -> Result<(), VmError>
    where
        F: FnOnce(&Lua, String) -> LuaResult<LuaTable>,
    {
        let lua = self.lua();
        let module = loader(lua, name.to_owned())?;
        loaded_table(lua)?.set(name, module.clone())?;
        lua.globals().set(name, module)?;
        Ok(())
    }

    /// Expose a host object as global `name` with live field and method access.
    pub fn bind_struct<T: ScriptObject>(&self, name: &str, object: Arc<Mutex<T>>) -> Result<(), VmError> {
        let lua = self.lua();
        lua.globals().set(name, lua.create_userdata(Bound::new(object))?)?;
        Ok(())
    }

    // ── Globals ───────────────────────────────────────────────────────────

    pub fn set_global(&self, name: &str, value: &Dynamic) -> Result<(), VmError> {
        let lua = self.lua();
        lua.globals().set(name, to_lua(lua, value)?)?;
        Ok(())
    }

    pub fn get_global(&self, name: &str) -> Result<Dynamic, VmError> {
        Ok(from_lua(self.lua().globals().get::<LuaValue>(name)?))
    }

    /// Weakly map global table `name` onto `T`.  See [`crate::mapper`].
    pub fn read_global_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, VmError> {
        Ok(mapper::from_dynamic(self.get_global(name)?)?)
    }

    /// Like [`read_global_as`](Self::read_global_as), writing into `out`.
    ///
    /// `out` is replaced as a whole: fields with no matching key get their
    /// zero value, not the value `out` held before.  `out` is left untouched
    /// on error.
    pub fn read_global_into<T: DeserializeOwned>(&self, name: &str, out: &mut T) -> Result<(), VmError> {
        *out = self.read_global_as(name)?;
        Ok(())
    }

    // ── Loading ───────────────────────────────────────────────────────────

    /// Compile `source`, replacing the current chunk.  Nothing is executed.
    pub fn load_string(&mut self, source: &str) -> Result<(), VmError> {
        let func = self.compile(source.as_bytes(), "=<string>")?;
        self.chunk = Some(func);
        Ok(())
    }

    /// Compile the file at `path`, replacing the current chunk.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), VmError> {
        let path = path.as_ref();
        let source = std::fs::read(path).map_err(|source| VmError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let func = self.compile(&source, &format!("@{}", path.display()))?;
        self.chunk = Some(func);
        Ok(())
    }

    fn compile(&self, source: &[u8], chunk_name: &str) -> Result<LuaFunction, VmError> {
        self.lua()
            .load(source)
            .set_name(chunk_name)
            .set_mode(mlua::ChunkMode::Text)
            .into_function()
            .map_err(|source| VmError::Load { chunk: chunk_name.to_owned(), source })
    }

    /// Whether a chunk is currently loaded.
    pub fn is_loaded(&self) -> bool {
        self.chunk.is_some()
    }

    // ── Execution ─────────────────────────────────────────────────────────

    /// Run the loaded chunk to completion.
    pub fn execute(&self) -> Result<(), VmError> {
        let chunk = self.chunk.as_ref().ok_or(VmError::NothingLoaded)?;
        chunk.call::<()>(()).map_err(VmError::Runtime)
    }

    pub fn execute_string(&mut self, source: &str) -> Result<(), VmError> {
        self.load_string(source)?;
        self.execute()
    }

    pub fn execute_file(&mut self, path: impl AsRef<Path>) -> Result<(), VmError> {
        self.load_file(path)?;
        self.execute()
    }

    /// Evaluate a Lua expression (or a chunk ending in `return`).
    pub fn eval(&self, source: &str) -> Result<Dynamic, VmError> {
        let value: LuaValue = self
            .lua()
            .load(source)
            .set_name("=<eval>")
            .eval()
            .map_err(VmError::Runtime)?;
        Ok(from_lua(value))
    }

    /// Call global function `name` with marshalled `args`, returning its
    /// first result (nil if none).
    pub fn call_function(&self, name: &str, args: &[Dynamic]) -> Result<Dynamic, VmError> {
        let func = self.global_function(name)?;
        let args = to_lua_multi(self.lua(), args)?;
        let result: LuaValue = func.call(args).map_err(VmError::Runtime)?;
        Ok(from_lua(result))
    }

    fn global_function(&self, name: &str) -> Result<LuaFunction, VmError> {
        match self.lua().globals().get::<LuaValue>(name)? {
            LuaValue::Function(f) => Ok(f),
            other => Err(VmError::NotAFunction { name: name.to_owned(), found: other.type_name() }),
        }
    }

    // ── Protected calls ───────────────────────────────────────────────────

    /// Call global `name` with marshalled `args`, catching any error.
    ///
    /// Returns all results on success.  On failure the error is logged and
    /// `None` is returned; the session stays usable.
    pub fn pcall(&self, name: &str, args: &[Dynamic]) -> Option<Vec<Dynamic>> {
        let args = match to_lua_multi(self.lua(), args) {
            Ok(args) => args,
            Err(e) => {
                tracing::error!(function = name, error = %e, "lua pcall: cannot marshal arguments");
                return None;
            }
        };
        self.pcall_values(name, args).map(from_lua_multi)
    }

    /// Call global `name` with already converted Lua arguments.
    pub fn pcall_values(&self, name: &str, args: LuaMultiValue) -> Option<LuaMultiValue> {
        let func = match self.global_function(name) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(function = name, error = %e, "lua pcall failed");
                return None;
            }
        };
        self.protected(name, &func, args)
    }

    /// Call a function value with already converted Lua arguments.
    pub fn pcall_function(&self, func: &LuaFunction, args: LuaMultiValue) -> Option<LuaMultiValue> {
        self.protected("<function>", func, args)
    }

    fn protected(&self, label: &str, func: &LuaFunction, args: LuaMultiValue) -> Option<LuaMultiValue> {
        match func.call::<LuaMultiValue>(args) {
            Ok(results) => Some(results),
            Err(e) => {
                tracing::error!(function = label, error = %e, "lua pcall failed");
                None
            }
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// End the session, returning the instance to its pool.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        // The chunk belongs to the instance; release it first.
        self.chunk = None;
        let Some(instance) = self.instance.take() else { return };
        match &self.pool {
            Some(pool) => pool.give_back(instance),
            None => tracing::trace!(id = instance.id(), "closing unpooled Lua instance"),
        }
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("instance", &self.instance)
            .field("pooled", &self.pool.is_some())
            .field("loaded", &self.chunk.is_some())
            .finish()
    }
}

/// The registry's `_LOADED` table, which backs `package.loaded`.
fn loaded_table(lua: &Lua) -> LuaResult<LuaTable> {
    const LOADED: &str = "_LOADED";
    match lua.named_registry_value::<Option<LuaTable>>(LOADED)? {
        Some(t) => Ok(t),
        None => {
            let t = lua.create_table()?;
            lua.set_named_registry_value(LOADED, t.clone())?;
            Ok(t)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
