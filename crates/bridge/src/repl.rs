//! The evaluation side of the bridge: owns the queue and server config and
//! provides the `prepl.bridge` entry points.

use std::rc::Rc;

use prepl_config::Settings;

use crate::bridge::Mode;
use crate::entry::{
    EntryPoint, EntryPointRegistry, InitRunModeFn, INIT_RUN_MODE, NAMESPACE, RUN_CALLBACKS_HOOK,
    START_SERVER,
};
use crate::host::{HostError, HostState};
use crate::queue::CallbackQueue;
use crate::server::{ReplServer, ServerConfig};

pub struct ReplRuntime<H> {
    config: ServerConfig,
    queue: CallbackQueue<H>,
    run_mode_setup: Option<InitRunModeFn<H>>,
}

impl<H: HostState + 'static> ReplRuntime<H> {
    pub fn new(config: ServerConfig, queue: CallbackQueue<H>) -> Self {
        Self {
            config,
            queue,
            run_mode_setup: None,
        }
    }

    pub fn from_settings(settings: &Settings, mode: Mode, host_title: &str) -> Self {
        Self::new(
            ServerConfig::from_settings(settings, mode, host_title),
            CallbackQueue::with_warn_threshold(settings.queue_warn_threshold),
        )
    }

    /// Handle for enqueuing from host-side code or tests.
    pub fn queue(&self) -> CallbackQueue<H> {
        self.queue.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Extra host setup to run during run-mode init, before the first drain.
    pub fn on_run_mode_init<F>(mut self, setup: F) -> Self
    where
        F: FnOnce(&mut H) -> Result<(), HostError> + 'static,
    {
        self.run_mode_setup = Some(Box::new(setup));
        self
    }

    /// Register `start-server`, `run-callbacks-hook` and `init-run-mode!`.
    pub fn entry_points(self) -> EntryPointRegistry<H> {
        let Self {
            config,
            queue,
            run_mode_setup,
        } = self;
        let mut registry = EntryPointRegistry::new();

        let server_queue = queue.clone();
        registry.register(
            NAMESPACE,
            START_SERVER,
            EntryPoint::StartServer(Box::new(move || ReplServer::start(config, server_queue))),
        );

        let drain_queue = queue.clone();
        registry.register(
            NAMESPACE,
            RUN_CALLBACKS_HOOK,
            EntryPoint::RunCallbacks(Rc::new(move |host: &mut H| drain_queue.drain_and_run(host))),
        );

        registry.register(
            NAMESPACE,
            INIT_RUN_MODE,
            EntryPoint::InitRunMode(Box::new(move |host: &mut H| {
                // The thread running init is the host thread from now on.
                queue
                    .bind_consumer()
                    .map_err(|e| HostError::Other(e.to_string()))?;
                if let Some(setup) = run_mode_setup {
                    setup(&mut *host)?;
                }
                let report = queue
                    .drain_and_run(host)
                    .map_err(|e| HostError::Other(e.to_string()))?;
                log::info!(
                    "Run-mode init complete ({} startup callback(s) drained)",
                    report.ran
                );
                Ok(())
            })),
        );

        registry
    }
}
