//! The simulated host: a single-threaded frame loop with lifecycle hooks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use prepl_bridge::{HostBridge, IdleCallback, InitOutcome, Mode, TickScheduler};

use crate::world::World;

/// Editor idle notification. Subscribers run once per frame in edit mode.
#[derive(Default)]
pub struct EditorLoop {
    subscribers: Vec<IdleCallback<World>>,
}

impl EditorLoop {
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn notify_idle(&mut self, world: &mut World) {
        for callback in self.subscribers.iter_mut() {
            callback(world);
        }
    }
}

impl TickScheduler<World> for EditorLoop {
    fn subscribe_idle(&mut self, callback: IdleCallback<World>) {
        self.subscribers.push(callback);
    }
}

pub struct HostApp {
    mode: Mode,
    world: World,
    editor: EditorLoop,
    bridge: Option<HostBridge<World>>,
}

impl HostApp {
    /// `bridge` is `None` when the REPL server is disabled.
    pub fn new(mode: Mode, title: &str, bridge: Option<HostBridge<World>>) -> Self {
        Self {
            mode,
            world: World::new(title),
            editor: EditorLoop::default(),
            bridge,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn bridge(&self) -> Option<&HostBridge<World>> {
        self.bridge.as_ref()
    }

    pub fn editor(&self) -> &EditorLoop {
        &self.editor
    }

    // ========================================================================
    // Lifecycle hooks
    // ========================================================================

    /// Fired before the first scene loads, in both modes.
    pub fn before_scene_load(&mut self) {
        self.init_bridge("before_scene_load");
    }

    /// Fired when the editor finishes loading. Edit mode only.
    pub fn editor_load(&mut self) {
        if self.mode == Mode::Edit {
            self.init_bridge("editor_load");
        }
    }

    fn init_bridge(&mut self, hook: &str) {
        let Some(bridge) = self.bridge.as_mut() else {
            return;
        };
        match bridge.initialize(&mut self.world, &mut self.editor) {
            Ok(InitOutcome::Started { addr }) => {
                log::info!("{}: REPL server listening on {}", hook, addr);
            }
            Ok(InitOutcome::AlreadyInitialized) => {
                log::debug!("{}: REPL bridge already up", hook);
            }
            // Already logged by the bridge; the host keeps running without a REPL
            Err(_) => {}
        }
    }

    // ========================================================================
    // Frame loop
    // ========================================================================

    /// Advance one frame.
    pub fn tick(&mut self) {
        self.world.advance_frame();
        match self.mode {
            Mode::Edit => self.editor.notify_idle(&mut self.world),
            Mode::Run => {
                if let Some(bridge) = self.bridge.as_ref() {
                    bridge.run_callbacks(&mut self.world);
                }
            }
        }
    }

    /// Tick every `interval` until `shutdown` is set or `max_ticks` frames ran.
    pub fn run(&mut self, shutdown: &AtomicBool, max_ticks: Option<u64>, interval: Duration) {
        while !shutdown.load(Ordering::SeqCst) {
            if max_ticks.is_some_and(|max| self.world.frame() >= max) {
                break;
            }
            let started = Instant::now();
            self.tick();
            if let Some(rest) = interval.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
        log::info!("Host loop stopped after {} frame(s)", self.world.frame());
    }

    /// Stop the REPL server; its discovery file goes with it.
    pub fn shutdown(&mut self) {
        if let Some(bridge) = self.bridge.as_mut() {
            bridge.shutdown();
        }
    }
}
