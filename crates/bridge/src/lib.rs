//! prepl-bridge: an embedded REPL server bridged onto a host's single-threaded
//! loop.
//!
//! Sessions run on their own threads and never touch host state. Anything that
//! must run on the host thread is pushed onto a [`CallbackQueue`], which the
//! host drains once per tick through the [`HostBridge`].
//!
//! ```ignore
//! let runtime = ReplRuntime::from_settings(&settings, Mode::Edit, "My Game");
//! let mut bridge = HostBridge::new(Mode::Edit, runtime.entry_points());
//! bridge.initialize(&mut world, &mut editor_loop)?;
//! ```

pub mod bridge;
pub mod entry;
pub mod guard;
pub mod host;
pub mod oneshot;
pub mod queue;
pub mod repl;
pub mod scripting;
pub mod server;

pub use bridge::{
    BridgeState, HostBridge, IdleCallback, InitError, InitOutcome, Mode, TickScheduler,
};
pub use entry::{EntryPoint, EntryPointRegistry, NAMESPACE};
pub use guard::{InitGuard, PROCESS_INIT};
pub use host::{HostError, HostState, HostValue, MapHost};
pub use queue::{CallbackFailure, CallbackQueue, DrainReport, QueueError};
pub use repl::ReplRuntime;
pub use server::{ReplServer, ServerConfig, ServerMetrics};
