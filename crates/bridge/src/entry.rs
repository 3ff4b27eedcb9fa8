//! Named entry points the bridge resolves at startup.
//!
//! The evaluation side registers its operations under a namespace; the bridge
//! looks them up by name exactly once. A missing or mistyped entry point is a
//! hard initialization error, and nothing is consumed from the registry when
//! resolution fails.

use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use crate::bridge::InitError;
use crate::host::HostError;
use crate::queue::{DrainReport, QueueError};
use crate::server::ReplServer;

/// Namespace holding the bridge entry points.
pub const NAMESPACE: &str = "prepl.bridge";

pub const START_SERVER: &str = "start-server";
pub const RUN_CALLBACKS_HOOK: &str = "run-callbacks-hook";
pub const INIT_RUN_MODE: &str = "init-run-mode!";

pub type StartServerFn = Box<dyn FnOnce() -> io::Result<ReplServer>>;
pub type RunCallbacksFn<H> = Rc<dyn Fn(&mut H) -> Result<DrainReport, QueueError>>;
pub type InitRunModeFn<H> = Box<dyn FnOnce(&mut H) -> Result<(), HostError>>;

pub enum EntryPoint<H> {
    StartServer(StartServerFn),
    RunCallbacks(RunCallbacksFn<H>),
    InitRunMode(InitRunModeFn<H>),
}

impl<H> EntryPoint<H> {
    pub fn kind(&self) -> &'static str {
        match self {
            EntryPoint::StartServer(_) => "start-server",
            EntryPoint::RunCallbacks(_) => "run-callbacks",
            EntryPoint::InitRunMode(_) => "init-run-mode",
        }
    }
}

/// The three entry points, resolved.
pub struct ResolvedEntryPoints<H> {
    pub start_server: StartServerFn,
    pub run_callbacks: RunCallbacksFn<H>,
    pub init_run_mode: InitRunModeFn<H>,
}

pub struct EntryPointRegistry<H> {
    entries: HashMap<(String, String), EntryPoint<H>>,
}

impl<H> Default for EntryPointRegistry<H> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<H> EntryPointRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an entry point.
    pub fn register(&mut self, namespace: &str, name: &str, entry: EntryPoint<H>) {
        self.entries
            .insert((namespace.to_string(), name.to_string()), entry);
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.entries
            .contains_key(&(namespace.to_string(), name.to_string()))
    }

    /// Resolve the bridge entry points from [`NAMESPACE`].
    pub fn resolve(&mut self) -> Result<ResolvedEntryPoints<H>, InitError> {
        self.check(START_SERVER, "start-server")?;
        self.check(RUN_CALLBACKS_HOOK, "run-callbacks")?;
        self.check(INIT_RUN_MODE, "init-run-mode")?;

        let start_server = match self.take(START_SERVER) {
            Some(EntryPoint::StartServer(f)) => f,
            _ => return Err(unresolved(START_SERVER)),
        };
        let run_callbacks = match self.take(RUN_CALLBACKS_HOOK) {
            Some(EntryPoint::RunCallbacks(f)) => f,
            _ => return Err(unresolved(RUN_CALLBACKS_HOOK)),
        };
        let init_run_mode = match self.take(INIT_RUN_MODE) {
            Some(EntryPoint::InitRunMode(f)) => f,
            _ => return Err(unresolved(INIT_RUN_MODE)),
        };

        Ok(ResolvedEntryPoints {
            start_server,
            run_callbacks,
            init_run_mode,
        })
    }

    fn check(&self, name: &str, expected: &'static str) -> Result<(), InitError> {
        match self.entries.get(&(NAMESPACE.to_string(), name.to_string())) {
            None => Err(unresolved(name)),
            Some(entry) if entry.kind() != expected => Err(InitError::WrongKind {
                name: name.to_string(),
                expected,
                found: entry.kind(),
            }),
            Some(_) => Ok(()),
        }
    }

    fn take(&mut self, name: &str) -> Option<EntryPoint<H>> {
        self.entries
            .remove(&(NAMESPACE.to_string(), name.to_string()))
    }
}

fn unresolved(name: &str) -> InitError {
    InitError::Unresolved {
        namespace: NAMESPACE.to_string(),
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_registry() -> EntryPointRegistry<()> {
        let mut registry = EntryPointRegistry::new();
        registry.register(
            NAMESPACE,
            START_SERVER,
            EntryPoint::StartServer(Box::new(|| {
                Err(io::Error::new(io::ErrorKind::Other, "not used"))
            })),
        );
        registry.register(
            NAMESPACE,
            RUN_CALLBACKS_HOOK,
            EntryPoint::RunCallbacks(Rc::new(|_: &mut ()| Ok(DrainReport::default()))),
        );
        registry.register(
            NAMESPACE,
            INIT_RUN_MODE,
            EntryPoint::InitRunMode(Box::new(|_: &mut ()| Ok(()))),
        );
        registry
    }

    #[test]
    fn test_resolves_all_three() {
        let mut registry = full_registry();
        let resolved = registry.resolve().unwrap();
        assert!((resolved.run_callbacks)(&mut ()).unwrap().is_clean());
        assert!(!registry.contains(NAMESPACE, START_SERVER));
    }

    #[test]
    fn test_missing_entry_consumes_nothing() {
        let mut registry = full_registry();
        registry.take(INIT_RUN_MODE);

        match registry.resolve() {
            Err(InitError::Unresolved { namespace, name }) => {
                assert_eq!(namespace, NAMESPACE);
                assert_eq!(name, INIT_RUN_MODE);
            }
            other => panic!("Expected Unresolved, got {:?}", other.err()),
        }
        assert!(registry.contains(NAMESPACE, START_SERVER));
        assert!(registry.contains(NAMESPACE, RUN_CALLBACKS_HOOK));
    }

    #[test]
    fn test_wrong_namespace_does_not_resolve() {
        let mut registry = full_registry();
        registry.take(START_SERVER);
        registry.register(
            "other.ns",
            START_SERVER,
            EntryPoint::StartServer(Box::new(|| {
                Err(io::Error::new(io::ErrorKind::Other, "not used"))
            })),
        );
        assert!(matches!(
            registry.resolve(),
            Err(InitError::Unresolved { .. })
        ));
    }

    #[test]
    fn test_wrong_kind() {
        let mut registry = full_registry();
        registry.register(
            NAMESPACE,
            START_SERVER,
            EntryPoint::InitRunMode(Box::new(|_: &mut ()| Ok(()))),
        );
        match registry.resolve() {
            Err(InitError::WrongKind { name, expected, found }) => {
                assert_eq!(name, START_SERVER);
                assert_eq!(expected, "start-server");
                assert_eq!(found, "init-run-mode");
            }
            other => panic!("Expected WrongKind, got {:?}", other.err()),
        }
    }
}
