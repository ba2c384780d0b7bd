//! Live binding of host objects into Lua.
//!
//! A type implementing [`ScriptObject`] is wrapped in `Arc<Mutex<_>>` and
//! installed as a global with
//! [`VirtualMachine::bind_struct`](crate::vm::VirtualMachine::bind_struct).
//! The host keeps its own `Arc`, so:
//!
//! | Lua                  | Host                                     |
//! |----------------------|------------------------------------------|
//! | `obj.Field`          | [`ScriptObject::get_field`]              |
//! | `obj.Field = v`      | [`ScriptObject::set_field`]              |
//! | `obj:Method(a, b)`   | [`ScriptObject::call_method`]            |
//! | `obj.Method(a, b)`   | [`ScriptObject::call_method`]            |
//!
//! Both call forms reach the method with the same arguments.  A first
//! argument that is the object itself is taken as the `:` receiver and
//! dropped, so `obj.Method(obj)` passes no arguments.
//!
//! Field and method names are whatever the implementation answers to; there
//! is no schema.  The object's mutex is held for the duration of each access,
//! so the host must not hold its own lock while running script code that
//! touches the object.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mlua::prelude::*;
use mlua::{AnyUserData, MetaMethod, UserData, UserDataMethods};

use crate::error::VmError;
use crate::marshal::{from_lua, from_lua_multi, to_lua};
use crate::value::Dynamic;

/// A host object whose fields and methods are reachable by name from Lua.
pub trait ScriptObject: Send + 'static {
    /// Current value of field `name`, or `None` if there is no such field.
    fn get_field(&self, name: &str) -> Option<Dynamic>;

    /// Assign field `name`.  Unknown fields and unconvertible values are errors.
    fn set_field(&mut self, name: &str, value: Dynamic) -> Result<(), VmError>;

    fn has_method(&self, _name: &str) -> bool {
        false
    }

    /// Invoke method `name`.  Only called when [`has_method`](Self::has_method)
    /// returned `true`.  `args` never starts with the object itself.
    fn call_method(&mut self, name: &str, _args: Vec<Dynamic>) -> Result<Dynamic, VmError> {
        Err(VmError::Bind(format!("no method '{name}'")))
    }

    /// Label used by `tostring(obj)`.
    fn script_type(&self) -> &str {
        "object"
    }
}

/// Userdata wrapper shared between the host and Lua.
pub struct Bound<T>(pub Arc<Mutex<T>>);

impl<T> Bound<T> {
    pub fn new(inner: Arc<Mutex<T>>) -> Self {
        Self(inner)
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        lock(&self.0)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: ScriptObject> UserData for Bound<T> {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_function(MetaMethod::Index, |lua, (ud, key): (AnyUserData, String)| {
            let target = Arc::clone(&ud.borrow::<Bound<T>>()?.0);
            let guard = lock(&target);
            if let Some(value) = guard.get_field(&key) {
                return to_lua(lua, &value);
            }
            if !guard.has_method(&key) {
                return Ok(LuaValue::Nil);
            }
            drop(guard);

            // `obj:Method(...)` passes the object itself as the first argument.
            let self_ptr = ud.to_pointer() as usize;
            let method = lua.create_function(move |lua, args: LuaMultiValue| {
                let mut args = args.into_vec();
                if matches!(args.first(), Some(LuaValue::UserData(first)) if first.to_pointer() as usize == self_ptr)
                {
                    args.remove(0);
                }
                let args = from_lua_multi(args.into());
                let result = lock(&target).call_method(&key, args)?;
                to_lua(lua, &result)
            })?;
            Ok(LuaValue::Function(method))
        });

        methods.add_meta_method(
            MetaMethod::NewIndex,
            |_, this, (key, value): (String, LuaValue)| {
                this.lock().set_field(&key, from_lua(value))?;
                Ok(())
            },
        );

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(this.lock().script_type().to_owned())
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        count: i64,
        label: String,
    }

    impl ScriptObject for Counter {
        fn get_field(&self, name: &str) -> Option<Dynamic> {
            match name {
                "count" => Some(self.count.into()),
                "label" => Some(self.label.as_str().into()),
                _ => None,
            }
        }

        fn set_field(&mut self, name: &str, value: Dynamic) -> Result<(), VmError> {
            match (name, value) {
                ("count", v) => {
                    self.count = v
                        .as_i64()
                        .ok_or_else(|| VmError::Bind("count must be an integer".into()))?;
                }
                ("label", Dynamic::Str(s)) => self.label = s,
                (other, _) => return Err(VmError::Bind(format!("cannot set '{other}'"))),
            }
            Ok(())
        }

        fn has_method(&self, name: &str) -> bool {
            matches!(name, "add" | "reset")
        }

        fn call_method(&mut self, name: &str, args: Vec<Dynamic>) -> Result<Dynamic, VmError> {
            match name {
                "add" => {
                    let by = args.first().and_then(Dynamic::as_i64).unwrap_or(1);
                    self.count += by;
                    Ok(self.count.into())
                }
                "reset" => {
                    self.count = 0;
                    Ok(Dynamic::Nil)
                }
                _ => unreachable!(),
            }
        }

        fn script_type(&self) -> &str {
            "Counter"
        }
    }

    fn bind(lua: &Lua, c: &Arc<Mutex<Counter>>) {
        let ud = lua.create_userdata(Bound::new(Arc::clone(c))).unwrap();
        lua.globals().set("c", ud).unwrap();
    }

    #[test]
    fn reads_reflect_host_state() {
        let lua = Lua::new();
        let c = Arc::new(Mutex::new(Counter::default()));
        bind(&lua, &c);
        c.lock().unwrap().count = 41;
        let n: i64 = lua.load("return c.count").eval().unwrap();
        assert_eq!(n, 41);
    }

    #[test]
    fn writes_mutate_host() {
        let lua = Lua::new();
        let c = Arc::new(Mutex::new(Counter::default()));
        bind(&lua, &c);
        lua.load("c.count = 7 c.label = 'seven'").exec().unwrap();
        let guard = c.lock().unwrap();
        assert_eq!(guard.count, 7);
        assert_eq!(guard.label, "seven");
    }

    #[test]
    fn method_call_with_colon_syntax() {
        let lua = Lua::new();
        let c = Arc::new(Mutex::new(Counter::default()));
        bind(&lua, &c);
        let n: i64 = lua.load("c:add(5) return c:add(2)").eval().unwrap();
        assert_eq!(n, 7);
        assert_eq!(c.lock().unwrap().count, 7);
    }

    #[test]
    fn method_call_with_dot_syntax() {
        let lua = Lua::new();
        let c = Arc::new(Mutex::new(Counter { count: 3, ..Default::default() }));
        bind(&lua, &c);
        lua.load("c.reset()").exec().unwrap();
        assert_eq!(c.lock().unwrap().count, 0);
        let n: i64 = lua.load("return c.add(4)").eval().unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn receiver_argument_is_dropped() {
        let lua = Lua::new();
        let c = Arc::new(Mutex::new(Counter::default()));
        bind(&lua, &c);
        // Both forms see no arguments, so `add` falls back to 1.
        let n: i64 = lua.load("c:add() return c.add(c)").eval().unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn unknown_field_reads_nil_and_write_errors() {
        let lua = Lua::new();
        let c = Arc::new(Mutex::new(Counter::default()));
        bind(&lua, &c);
        let missing: LuaValue = lua.load("return c.nothing").eval().unwrap();
        assert!(missing.is_nil());
        let err = lua.load("c.nothing = 1").exec().unwrap_err();
        assert!(err.to_string().contains("cannot set 'nothing'"), "{err}");
    }

    #[test]
    fn tostring_uses_script_type() {
        let lua = Lua::new();
        let c = Arc::new(Mutex::new(Counter::default()));
        bind(&lua, &c);
        let s: String = lua.load("return tostring(c)").eval().unwrap();
        assert_eq!(s, "Counter");
    }
}
