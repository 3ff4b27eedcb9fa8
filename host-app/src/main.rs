// prepl-host - a single-threaded host loop with an embedded REPL server

mod app;
mod world;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use prepl_bridge::{HostBridge, Mode, ReplRuntime};
use prepl_config::Settings;

use app::HostApp;
use world::World;

#[derive(Parser, Debug)]
#[command(name = "prepl-host")]
#[command(about = "Simulated host application with an embedded REPL server")]
#[command(version)]
struct Args {
    /// Lifecycle mode: `edit` drains on editor idle, `run` drains every frame
    #[arg(long, default_value = "edit")]
    mode: Mode,

    /// Stop after this many frames (runs until Ctrl-C otherwise)
    #[arg(long)]
    ticks: Option<u64>,

    /// Frame interval in milliseconds
    #[arg(long, default_value = "16")]
    tick_ms: u64,

    /// REPL server port (overrides settings and PREPL_PORT; 0 picks a free port)
    #[arg(long)]
    port: Option<u16>,

    /// Title shown in discovery files
    #[arg(long, default_value = "prepl-host")]
    title: String,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let args = Args::parse();

    let mut settings = Settings::load();
    settings.apply_env_overrides();
    if let Some(port) = args.port {
        settings.port = port;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        if let Err(e) = ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst)) {
            log::warn!("Could not install Ctrl-C handler: {}", e);
        }
    }

    let bridge = if settings.server_enabled {
        let runtime = ReplRuntime::<World>::from_settings(&settings, args.mode, &args.title);
        Some(HostBridge::new(args.mode, runtime.entry_points()))
    } else {
        log::info!(
            "REPL server disabled (server.enabled = false in {})",
            Settings::config_path_display()
        );
        None
    };

    let mut app = HostApp::new(args.mode, &args.title, bridge);
    app.before_scene_load();
    app.editor_load();

    app.run(&shutdown, args.ticks, Duration::from_millis(args.tick_ms));
    app.shutdown();

    ExitCode::SUCCESS
}
