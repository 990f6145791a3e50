//! Ambient configuration carried into workers.
//!
//! Workers share nothing with the thread that started a run, so whatever
//! the caller's function needs from its environment travels as an
//! [`ExecutionContext`] snapshot. The engine captures the caller's current
//! context once per run, and every unit enters it right before the function
//! is called and leaves it right after.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

thread_local! {
    static CURRENT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
}

/// A snapshot of ambient settings, e.g. the active project root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Project root the run operates on, when known
    #[serde(default, with = "raw_path")]
    pub root: Option<PathBuf>,
    /// Free-form feature flags
    pub flags: BTreeMap<String, String>,
}

impl ExecutionContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the active root.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Set a flag.
    pub fn flag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.flags.insert(key.into(), value.into());
        self
    }

    /// Look up a flag.
    pub fn get_flag(&self, key: &str) -> Option<&str> {
        self.flags.get(key).map(String::as_str)
    }

    /// The active root, if any.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// The context active on this thread, or an empty one.
    pub fn current() -> Self {
        CURRENT.with(|current| current.borrow().clone().unwrap_or_default())
    }

    /// Make this context current on this thread until the guard is dropped.
    pub fn enter(self) -> ContextGuard {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(self));
        ContextGuard {
            previous,
            _not_send: PhantomData,
        }
    }

    /// Serialize for a trip across the worker boundary.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Rebuild a context from [`ExecutionContext::encode`] output.
    pub fn decode(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

/// Serde for `Option<PathBuf>` that keeps paths which are not valid UTF-8.
///
/// UTF-8 paths are written as plain strings, anything else as the platform's
/// native code units.
mod raw_path {
    use std::path::{Path, PathBuf};

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        #[cfg(unix)]
        Bytes(Vec<u8>),
        #[cfg(windows)]
        Wide(Vec<u16>),
    }

    #[cfg(unix)]
    fn native(path: &Path) -> Repr {
        use std::os::unix::ffi::OsStrExt;
        Repr::Bytes(path.as_os_str().as_bytes().to_vec())
    }

    #[cfg(windows)]
    fn native(path: &Path) -> Repr {
        use std::os::windows::ffi::OsStrExt;
        Repr::Wide(path.as_os_str().encode_wide().collect())
    }

    #[cfg(not(any(unix, windows)))]
    fn native(path: &Path) -> Repr {
        Repr::Text(path.to_string_lossy().into_owned())
    }

    fn encode(path: &Path) -> Repr {
        match path.to_str() {
            Some(text) => Repr::Text(text.to_string()),
            None => native(path),
        }
    }

    fn decode(repr: Repr) -> PathBuf {
        match repr {
            Repr::Text(text) => PathBuf::from(text),
            #[cfg(unix)]
            Repr::Bytes(bytes) => {
                use std::os::unix::ffi::OsStringExt;
                PathBuf::from(std::ffi::OsString::from_vec(bytes))
            }
            #[cfg(windows)]
            Repr::Wide(units) => {
                use std::os::windows::ffi::OsStringExt;
                PathBuf::from(std::ffi::OsString::from_wide(&units))
            }
        }
    }

    pub fn serialize<S: Serializer>(path: &Option<PathBuf>, serializer: S) -> Result<S::Ok, S::Error> {
        path.as_deref().map(encode).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<PathBuf>, D::Error> {
        Ok(Option::<Repr>::deserialize(deserializer)?.map(decode))
    }
}

/// Restores the previously active context when dropped.
#[must_use = "the context is left as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ContextGuard {
    previous: Option<ExecutionContext>,
    // Tied to the thread whose context it swapped.
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_current_defaults_to_empty() {
        let ctx = ExecutionContext::current();
        assert_eq!(ctx, ExecutionContext::new());
        assert_eq!(ctx.root(), None);
    }

    #[test]
    fn test_enter_and_exit_nest() {
        let outer = ExecutionContext::new().flag("mode", "outer");
        let inner = ExecutionContext::new().flag("mode", "inner").with_root("/project");

        let outer_guard = outer.enter();
        assert_eq!(ExecutionContext::current().get_flag("mode"), Some("outer"));
        {
            let _inner_guard = inner.enter();
            let current = ExecutionContext::current();
            assert_eq!(current.get_flag("mode"), Some("inner"));
            assert_eq!(current.root(), Some(Path::new("/project")));
        }
        assert_eq!(ExecutionContext::current().get_flag("mode"), Some("outer"));
        drop(outer_guard);
        assert_eq!(ExecutionContext::current(), ExecutionContext::new());
    }

    #[test]
    fn test_context_is_per_thread() {
        let _guard = ExecutionContext::new().flag("mode", "caller").enter();

        let seen = thread::spawn(|| ExecutionContext::current().get_flag("mode").map(String::from))
            .join()
            .unwrap();
        assert_eq!(seen, None);
    }

    #[test]
    fn test_encoded_snapshot_survives_the_trip() {
        let ctx = ExecutionContext::new()
            .with_root("/project")
            .flag("fix", "true");

        let payload = ctx.encode().unwrap();
        assert_eq!(ExecutionContext::decode(&payload).unwrap(), ctx);
        assert!(ExecutionContext::decode("not json").is_err());
        assert!(payload.contains(r#""root":"/project""#));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_root_survives_the_trip() {
        use std::ffi::OsString;
        use std::os::unix::ffi::OsStringExt;

        let root = PathBuf::from(OsString::from_vec(b"/work/proj\xff".to_vec()));
        let ctx = ExecutionContext::new().with_root(&root);

        let decoded = ExecutionContext::decode(&ctx.encode().unwrap()).unwrap();
        assert_eq!(decoded.root(), Some(root.as_path()));
    }

    #[test]
    fn test_missing_root_decodes_as_none() {
        let decoded = ExecutionContext::decode(r#"{"flags":{}}"#).unwrap();
        assert_eq!(decoded, ExecutionContext::new());
    }
}
