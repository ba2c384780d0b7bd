//! Instance configuration.
//!
//! Every interpreter instance a [`StatePool`](crate::pool::StatePool) builds
//! uses the same [`VmOptions`].  Defaults are deliberately generous; the host
//! opts into Lua standard libraries explicitly.
//!
//! | Environment variable     | Field                          |
//! |--------------------------|--------------------------------|
//! | `LUAVM_MEMORY_LIMIT`     | [`VmOptions::memory_limit`] (bytes, `0` = unlimited) |
//! | `LUAVM_MAX_CALL_DEPTH`   | [`VmOptions::max_call_depth`] (`0` = unlimited)      |
//! | `LUAVM_SCRIPT_DIR`       | [`VmOptions::script_dir`]                           |

use std::path::{Path, PathBuf};

use mlua::StdLib;

/// Default ceiling on nested Lua calls per instance.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 4096;

/// Default Lua heap ceiling per instance (512 MiB).
pub const DEFAULT_MEMORY_LIMIT: usize = 512 * 1024 * 1024;

/// Options applied to each freshly created interpreter instance.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Standard libraries opened in new instances.  `StdLib::NONE` by default.
    pub stdlib: StdLib,
    /// Maximum Lua heap size in bytes, `None` for unlimited.
    pub memory_limit: Option<usize>,
    /// Maximum depth of nested Lua function calls, `None` for unlimited.
    pub max_call_depth: Option<usize>,
    /// Directory reported to scripts by `GetLuaPath()`.  Resolved from the
    /// executable location when unset.
    pub script_dir: Option<PathBuf>,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            stdlib: StdLib::NONE,
            memory_limit: Some(DEFAULT_MEMORY_LIMIT),
            max_call_depth: Some(DEFAULT_MAX_CALL_DEPTH),
            script_dir: None,
        }
    }
}

impl VmOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `LUAVM_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut opts = Self::default();
        if let Some(limit) = parse_limit(&lookup, "LUAVM_MEMORY_LIMIT") {
            opts.memory_limit = limit;
        }
        if let Some(depth) = parse_limit(&lookup, "LUAVM_MAX_CALL_DEPTH") {
            opts.max_call_depth = depth;
        }
        if let Some(dir) = lookup("LUAVM_SCRIPT_DIR").filter(|d| !d.is_empty()) {
            opts.script_dir = Some(PathBuf::from(dir));
        }
        opts
    }

    pub fn with_stdlib(mut self, libs: StdLib) -> Self {
        self.stdlib = libs;
        self
    }

    pub fn with_memory_limit(mut self, bytes: Option<usize>) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_max_call_depth(mut self, depth: Option<usize>) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_script_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.script_dir = Some(dir.into());
        self
    }

    /// The script directory: the configured one, or `<exe dir>/script`.
    pub fn resolve_script_dir(&self) -> PathBuf {
        match &self.script_dir {
            Some(dir) => dir.clone(),
            None => run_path().join("script"),
        }
    }
}

/// Absolute directory containing the running executable.
///
/// Falls back to the current directory when the executable path is not
/// available.
pub fn run_path() -> PathBuf {
    let exe = std::env::current_exe()
        .ok()
        .or_else(|| std::env::args_os().next().map(PathBuf::from));
    let dir = exe
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_default();
    if dir.is_absolute() {
        return dir;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&dir))
        .unwrap_or(dir)
}

/// `Some(None)` for an explicit `0` (unlimited), `Some(Some(n))` for a limit,
/// `None` when unset or invalid.
fn parse_limit(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Option<usize>> {
    let raw = lookup(key)?;
    match raw.trim().parse::<usize>() {
        Ok(0) => Some(None),
        Ok(n) => Some(Some(n)),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid setting");
            None
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let o = VmOptions::default();
        assert_eq!(o.stdlib, StdLib::NONE);
        assert_eq!(o.memory_limit, Some(DEFAULT_MEMORY_LIMIT));
        assert_eq!(o.max_call_depth, Some(DEFAULT_MAX_CALL_DEPTH));
        assert!(o.script_dir.is_none());
    }

    #[test]
    fn env_overrides() {
        let o = VmOptions::from_lookup(lookup(&[
            ("LUAVM_MEMORY_LIMIT", "1048576"),
            ("LUAVM_MAX_CALL_DEPTH", "0"),
            ("LUAVM_SCRIPT_DIR", "/opt/app/script"),
        ]));
        assert_eq!(o.memory_limit, Some(1_048_576));
        assert_eq!(o.max_call_depth, None);
        assert_eq!(o.script_dir, Some(PathBuf::from("/opt/app/script")));
    }

    #[test]
    fn invalid_env_value_keeps_default() {
        let o = VmOptions::from_lookup(lookup(&[("LUAVM_MAX_CALL_DEPTH", "lots")]));
        assert_eq!(o.max_call_depth, Some(DEFAULT_MAX_CALL_DEPTH));
    }

    #[test]
    fn script_dir_defaults_next_to_executable() {
        let dir = VmOptions::default().resolve_script_dir();
        assert!(dir.is_absolute());
        assert!(dir.ends_with("script"));
        assert_eq!(dir.parent(), Some(run_path().as_path()));
    }

    #[test]
    fn explicit_script_dir_wins() {
        let o = VmOptions::new().with_script_dir("/srv/lua");
        assert_eq!(o.resolve_script_dir(), PathBuf::from("/srv/lua"));
    }
}
