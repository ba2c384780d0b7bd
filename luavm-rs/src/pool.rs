//! Interpreter instance pool.
//!
//! Creating a Lua state is comparatively expensive, so sessions borrow an
//! idle [`Instance`] from a [`StatePool`] and give it back when they close.
//! The pool grows on demand and never shrinks until [`StatePool::shutdown`].
//!
//! Idle instances are kept on a stack: the most recently returned instance
//! is handed out first, so under steady load the number of live instances
//! tracks peak concurrency rather than total request count.
//!
//! [`global`] returns a lazily created process-wide pool; tests and hosts
//! that want isolation build their own with [`StatePool::new`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use mlua::{HookTriggers, Lua, LuaOptions, VmState};

use crate::config::VmOptions;
use crate::error::VmError;

// ── Instance ──────────────────────────────────────────────────────────────────

/// One Lua state plus a pool-unique identity.
///
/// An `Instance` is moved between the pool and its borrower, never cloned,
/// so it is always either idle in exactly one pool or owned by exactly one
/// caller.
pub struct Instance {
    id: u64,
    lua: Lua,
}

impl Instance {
    /// Wrap a Lua state that did not come from a pool.  Its id is 0.
    pub fn detached(lua: Lua) -> Self {
        Self { id: 0, lua }
    }

    /// Identity assigned at creation; stable across borrow/return cycles.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Consume the wrapper, keeping only the Lua state.
    pub fn into_lua(self) -> Lua {
        self.lua
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance").field("id", &self.id).finish_non_exhaustive()
    }
}

// ── StatePool ─────────────────────────────────────────────────────────────────

/// Thread-safe LIFO pool of idle interpreter instances.
pub struct StatePool {
    options: VmOptions,
    saved: Mutex<Vec<Instance>>,
    next_id: AtomicU64,
}

impl StatePool {
    pub fn new(options: VmOptions) -> Self {
        Self {
            options,
            saved: Mutex::new(Vec::with_capacity(10)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(VmOptions::default())
    }

    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    /// Take the most recently returned idle instance, or create a new one.
    ///
    /// Never blocks waiting for an instance.  An error here means the
    /// configured options cannot produce a Lua state at all.
    pub fn borrow(&self) -> Result<Instance, VmError> {
        if let Some(inst) = self.lock().pop() {
            tracing::trace!(id = inst.id, "reusing idle Lua instance");
            return Ok(inst);
        }
        self.create_instance()
    }

    /// Put an instance back on the idle stack.
    pub fn give_back(&self, inst: Instance) {
        tracing::trace!(id = inst.id, "Lua instance returned to pool");
        self.lock().push(inst);
    }

    /// Close every idle instance.  Returns how many were closed.
    ///
    /// Instances still checked out are not tracked by the pool and are
    /// unaffected; quiesce all sessions before calling this.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Instance> = std::mem::take(&mut *self.lock());
        let closed = drained.len();
        drop(drained);
        tracing::info!(closed, "Lua state pool shut down");
        closed
    }

    /// Number of idle instances currently held.
    pub fn idle_count(&self) -> usize {
        self.lock().len()
    }

    /// Number of instances this pool has ever constructed.
    pub fn created_count(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Instance>> {
        // Only push/pop happen under the lock, so a poisoned guard still
        // holds a consistent Vec.
        self.saved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_instance(&self) -> Result<Instance, VmError> {
        let lua = Lua::new_with(self.options.stdlib, LuaOptions::new()).map_err(VmError::Config)?;
        if let Some(limit) = self.options.memory_limit {
            lua.set_memory_limit(limit).map_err(VmError::Config)?;
        }
        if let Some(depth) = self.options.max_call_depth {
            install_call_depth_limit(&lua, depth);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id, "created Lua instance");
        Ok(Instance { id, lua })
    }
}

impl Default for StatePool {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for StatePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatePool")
            .field("options", &self.options)
            .field("idle", &self.idle_count())
            .field("created", &self.created_count())
            .finish()
    }
}

/// Raise a Lua error whenever a call would nest deeper than `max_depth`.
fn install_call_depth_limit(lua: &Lua, max_depth: usize) {
    lua.set_hook(HookTriggers::new().on_calls(), move |lua, _debug| {
        // Level 0 is the function being entered.
        if lua.inspect_stack(max_depth).is_some() {
            return Err(mlua::Error::runtime(format!(
                "stack overflow (call depth limit {max_depth} exceeded)"
            )));
        }
        Ok(VmState::Continue)
    });
}

// ── Process-wide pool ─────────────────────────────────────────────────────────

static GLOBAL: OnceLock<Arc<StatePool>> = OnceLock::new();

/// The shared pool used by [`VirtualMachine::new`](crate::vm::VirtualMachine::new).
///
/// Created on first use from [`VmOptions::from_env`].
pub fn global() -> Arc<StatePool> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(StatePool::new(VmOptions::from_env()))))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
