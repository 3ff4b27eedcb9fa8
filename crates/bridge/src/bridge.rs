//! Host bridge: one-time startup and the drain hook.
//!
//! The host fires `initialize` from any of its startup hooks. The first call
//! resolves the entry points, starts the REPL server, and then continues
//! according to the mode:
//!
//! - **Edit**: subscribes one drain callback to the host's idle notification.
//! - **Run**: no recurring notification exists yet, so the one-shot run-mode
//!   init runs immediately; the host calls [`HostBridge::run_callbacks`] from
//!   its per-frame hook afterwards.
//!
//! Later calls (same bridge or another bridge sharing the guard) are no-ops.

use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::str::FromStr;

use crate::entry::{EntryPointRegistry, InitRunModeFn, RunCallbacksFn};
use crate::guard::{InitGuard, PROCESS_INIT};
use crate::queue::DrainReport;
use crate::server::ReplServer;

/// Which startup context the host is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Authoring context with a recurring idle notification.
    Edit,
    /// Play/run context; drains are driven by the host's frame hook.
    Run,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Edit => "edit",
            Mode::Run => "run",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "edit" => Ok(Mode::Edit),
            "run" => Ok(Mode::Run),
            other => Err(format!("unknown mode '{}' (expected edit or run)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    ServerStarting,
    /// Terminal.
    Bridged,
    /// Terminal for this bridge. The process guard was released.
    Failed,
}

/// Called by the host on each idle notification.
pub type IdleCallback<H> = Box<dyn FnMut(&mut H)>;

/// The host's recurring idle notification (edit mode).
pub trait TickScheduler<H> {
    /// Subscription lasts for the lifetime of the scheduler.
    fn subscribe_idle(&mut self, callback: IdleCallback<H>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// This call ran the startup sequence.
    Started { addr: SocketAddr },
    AlreadyInitialized,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InitError {
    /// A required entry point is not registered.
    Unresolved { namespace: String, name: String },
    /// An entry point is registered with the wrong signature.
    WrongKind {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
    ServerStart(String),
    RunModeInit(String),
    /// This bridge already failed; create a new one to retry.
    Failed,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Unresolved { namespace, name } => {
                write!(f, "could not resolve entry point {}/{}", namespace, name)
            }
            InitError::WrongKind { name, expected, found } => write!(
                f,
                "entry point {} is a {} entry point, expected {}",
                name, found, expected
            ),
            InitError::ServerStart(msg) => write!(f, "REPL server failed to start: {}", msg),
            InitError::RunModeInit(msg) => write!(f, "run-mode initialization failed: {}", msg),
            InitError::Failed => write!(f, "bridge initialization already failed"),
        }
    }
}

impl std::error::Error for InitError {}

/// What to do after the server is up.
trait StartupStrategy<H> {
    fn continue_startup(
        &self,
        run_callbacks: &RunCallbacksFn<H>,
        init_run_mode: InitRunModeFn<H>,
        host: &mut H,
        scheduler: &mut dyn TickScheduler<H>,
    ) -> Result<(), InitError>;
}

struct SubscribeToIdle;

impl<H: 'static> StartupStrategy<H> for SubscribeToIdle {
    fn continue_startup(
        &self,
        run_callbacks: &RunCallbacksFn<H>,
        _init_run_mode: InitRunModeFn<H>,
        _host: &mut H,
        scheduler: &mut dyn TickScheduler<H>,
    ) -> Result<(), InitError> {
        let drain = Rc::clone(run_callbacks);
        scheduler.subscribe_idle(Box::new(move |host: &mut H| match drain(host) {
            Ok(report) => log_drain(&report),
            Err(e) => log::warn!("Idle drain skipped: {}", e),
        }));
        log::debug!("Subscribed callback drain to host idle notification");
        Ok(())
    }
}

struct RunOneShotNow;

impl<H> StartupStrategy<H> for RunOneShotNow {
    fn continue_startup(
        &self,
        _run_callbacks: &RunCallbacksFn<H>,
        init_run_mode: InitRunModeFn<H>,
        host: &mut H,
        _scheduler: &mut dyn TickScheduler<H>,
    ) -> Result<(), InitError> {
        init_run_mode(host).map_err(|e| InitError::RunModeInit(e.to_string()))
    }
}

fn strategy_for<H: 'static>(mode: Mode) -> Box<dyn StartupStrategy<H>> {
    match mode {
        Mode::Edit => Box::new(SubscribeToIdle),
        Mode::Run => Box::new(RunOneShotNow),
    }
}

fn log_drain(report: &DrainReport) {
    if report.ran > 0 {
        log::debug!(
            "Drained {} host callback(s), {} failed, {} left",
            report.ran,
            report.failures.len(),
            report.remaining
        );
    }
}

/// Lives on the host thread.
pub struct HostBridge<H> {
    mode: Mode,
    state: BridgeState,
    guard: &'static InitGuard,
    registry: EntryPointRegistry<H>,
    server: Option<ReplServer>,
    run_callbacks: Option<RunCallbacksFn<H>>,
}

impl<H: 'static> HostBridge<H> {
    pub fn new(mode: Mode, registry: EntryPointRegistry<H>) -> Self {
        Self {
            mode,
            state: BridgeState::Uninitialized,
            guard: &PROCESS_INIT,
            registry,
            server: None,
            run_callbacks: None,
        }
    }

    /// Use a guard other than the process-wide one.
    pub fn with_guard(mut self, guard: &'static InitGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn server(&self) -> Option<&ReplServer> {
        self.server.as_ref()
    }

    /// Run the startup sequence if nobody has yet. Safe to call from every
    /// lifecycle hook.
    pub fn initialize(
        &mut self,
        host: &mut H,
        scheduler: &mut dyn TickScheduler<H>,
    ) -> Result<InitOutcome, InitError> {
        match self.state {
            BridgeState::Uninitialized => {}
            BridgeState::Failed => return Err(InitError::Failed),
            BridgeState::ServerStarting | BridgeState::Bridged => {
                return Ok(InitOutcome::AlreadyInitialized)
            }
        }

        let guard = self.guard;
        let Some(ticket) = guard.try_begin() else {
            log::debug!("REPL bridge already initialized in this process");
            return Ok(InitOutcome::AlreadyInitialized);
        };

        log::info!("Initializing REPL bridge ({} mode)", self.mode);

        match self.startup(host, scheduler) {
            Ok(addr) => {
                ticket.complete();
                self.state = BridgeState::Bridged;
                log::info!("REPL bridge ready on {}", addr);
                Ok(InitOutcome::Started { addr })
            }
            Err(e) => {
                // Dropping the ticket releases the guard.
                self.state = BridgeState::Failed;
                if let Some(mut server) = self.server.take() {
                    server.stop();
                }
                log::error!("REPL bridge initialization failed: {}", e);
                Err(e)
            }
        }
    }

    fn startup(
        &mut self,
        host: &mut H,
        scheduler: &mut dyn TickScheduler<H>,
    ) -> Result<SocketAddr, InitError> {
        let entries = self.registry.resolve()?;

        self.state = BridgeState::ServerStarting;
        let server =
            (entries.start_server)().map_err(|e| InitError::ServerStart(e.to_string()))?;
        let addr = server.bound_addr();
        self.server = Some(server);

        strategy_for::<H>(self.mode).continue_startup(
            &entries.run_callbacks,
            entries.init_run_mode,
            host,
            scheduler,
        )?;

        self.run_callbacks = Some(entries.run_callbacks);
        Ok(addr)
    }

    /// Per-frame drain for run mode. Returns `None` before the bridge is up
    /// or when called off the host thread.
    pub fn run_callbacks(&self, host: &mut H) -> Option<DrainReport> {
        if self.state != BridgeState::Bridged {
            return None;
        }
        let run = self.run_callbacks.as_ref()?;
        match run(host) {
            Ok(report) => {
                log_drain(&report);
                Some(report)
            }
            Err(e) => {
                log::warn!("Drain skipped: {}", e);
                None
            }
        }
    }

    /// Stop the server. The bridge stays in its current state.
    pub fn shutdown(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop();
        }
    }
}
