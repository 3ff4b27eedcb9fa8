// prepl - command-line client for a running prepl server

mod client;
mod discovery;
mod exit_codes;

use std::io::{self, BufRead, Write};
use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use client::{ClientError, ReplClient};
use discovery::RunningServer;
use exit_codes::{client_exit_code, EXIT_IO, EXIT_SUCCESS, EXIT_USAGE};
use prepl_protocol::EvalResultMessage;

#[derive(Parser)]
#[command(name = "prepl")]
#[command(about = "Talk to a REPL server embedded in a running host")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List running servers
    #[command(after_help = "\
Examples:
  prepl servers
  prepl servers --json")]
    Servers {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Evaluate one chunk of code and print the result
    #[command(after_help = "\
Examples:
  prepl eval '1 + 1'
  prepl eval \"host:set('score', 10)\" --server 3f2a
  prepl eval 'host:keys()' --port 7878")]
    Eval {
        /// Code to evaluate
        code: String,

        #[command(flatten)]
        target: Target,
    },

    /// Interactive loop: one line of input, one evaluation
    Repl {
        #[command(flatten)]
        target: Target,
    },

    /// Show server statistics
    Stats {
        #[command(flatten)]
        target: Target,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Which server to talk to.
#[derive(Args)]
struct Target {
    /// Connect to this port directly, skipping discovery
    #[arg(long, conflicts_with = "server")]
    port: Option<u16>,

    /// Server id (prefix match supported; defaults to the most recent server)
    #[arg(long)]
    server: Option<String>,

    /// Address the server listens on
    #[arg(long, env = "PREPL_BIND", default_value = "127.0.0.1")]
    host: IpAddr,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Servers { json } => cmd_servers(json),
        Commands::Eval { code, target } => cmd_eval(&code, &target),
        Commands::Repl { target } => cmd_repl(&target),
        Commands::Stats { target, json } => cmd_stats(&target, json),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
struct CliError {
    code: u8,
    message: String,
    hint: Option<String>,
}

impl CliError {
    fn usage(msg: impl Into<String>) -> Self {
        Self {
            code: EXIT_USAGE,
            message: msg.into(),
            hint: None,
        }
    }

    fn io(msg: impl Into<String>) -> Self {
        Self {
            code: EXIT_IO,
            message: msg.into(),
            hint: None,
        }
    }

    fn client(err: ClientError) -> Self {
        let hint = match &err {
            ClientError::ConnectionFailed(_) => {
                Some("is the host running with the REPL server enabled?".to_string())
            }
            _ => None,
        };
        Self {
            code: client_exit_code(&err),
            message: err.to_string(),
            hint,
        }
    }

    fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_servers(json: bool) -> Result<(), CliError> {
    let dir = prepl_config::discovery_dir();
    let servers = discovery::list_servers(&dir)
        .map_err(|e| CliError::io(format!("failed to list servers: {}", e)))?;

    if json {
        let files: Vec<_> = servers.iter().map(|s| &s.discovery).collect();
        let output =
            serde_json::to_string_pretty(&files).map_err(|e| CliError::io(e.to_string()))?;
        println!("{}", output);
        return Ok(());
    }

    if servers.is_empty() {
        eprintln!("No running prepl servers found.");
        return Ok(());
    }

    println!(
        "{:<10} {:>6} {:>8} {:<5} {:<20} {}",
        "SERVER", "PORT", "PID", "MODE", "CREATED", "HOST"
    );
    println!("{}", "-".repeat(72));
    for s in &servers {
        let created = s
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| s.discovery.created_at.clone());
        println!(
            "{:<10} {:>6} {:>8} {:<5} {:<20} {}",
            s.short_id(),
            s.discovery.port,
            s.discovery.pid,
            s.discovery.mode,
            created,
            s.discovery.host_title
        );
    }
    eprintln!();
    eprintln!("{} server(s) found", servers.len());

    Ok(())
}

fn cmd_eval(code: &str, target: &Target) -> Result<(), CliError> {
    let mut client = connect(target)?;
    let result = client.eval(code).map_err(CliError::client)?;
    print_eval_result(&result);
    Ok(())
}

fn cmd_repl(target: &Target) -> Result<(), CliError> {
    let mut client = connect(target)?;
    eprintln!(
        "Connected to server {} (session {}). Ctrl-D to exit.",
        client.welcome().server_id,
        client.welcome().session
    );

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        eprint!("> ");
        let _ = io::stderr().flush();

        let line = match lines.next() {
            None => break,
            Some(line) => line.map_err(|e| CliError::io(format!("failed to read stdin: {}", e)))?,
        };
        if line.trim().is_empty() {
            continue;
        }

        match client.eval(&line) {
            Ok(result) => print_eval_result(&result),
            // Evaluation errors leave the session usable
            Err(ClientError::ServerError { code, message }) => {
                eprintln!("{}: {}", code, message);
            }
            Err(e) => return Err(CliError::client(e)),
        }
    }

    Ok(())
}

fn cmd_stats(target: &Target, json: bool) -> Result<(), CliError> {
    let mut client = connect(target)?;
    let stats = client.stats().map_err(CliError::client)?;

    if json {
        let output =
            serde_json::to_string_pretty(&stats).map_err(|e| CliError::io(e.to_string()))?;
        println!("{}", output);
    } else {
        println!("Server Statistics");
        println!("-----------------");
        println!("Active sessions:       {}", stats.active_sessions);
        println!("Sessions opened:       {}", stats.sessions_opened);
        println!("Refused (limit):       {}", stats.sessions_refused_limit);
        println!("Parse failures:        {}", stats.sessions_closed_parse_failures);
        println!("Oversize messages:     {}", stats.sessions_closed_oversize);
        println!("Evaluations:           {}", stats.evals);
        println!("Evaluation errors:     {}", stats.eval_errors);
        println!("Queue depth:           {}", stats.queue_depth);
        println!("Callbacks enqueued:    {}", stats.callbacks_enqueued);
    }

    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn print_eval_result(result: &EvalResultMessage) {
    for line in &result.output {
        println!("{}", line);
    }
    if result.output_truncated {
        eprintln!("(output truncated)");
    }
    if let Some(value) = &result.value {
        println!("{}", value);
    }
    if result.deferred > 0 {
        eprintln!("({} host action(s) deferred to the next tick)", result.deferred);
    }
}

fn connect(target: &Target) -> Result<ReplClient, CliError> {
    let port = match target.port {
        Some(port) => port,
        None => resolve_server(target.server.as_deref())?.discovery.port,
    };
    ReplClient::connect(SocketAddr::new(target.host, port)).map_err(CliError::client)
}

/// Pick a server: by id prefix if given, otherwise the most recent one.
fn resolve_server(server_id: Option<&str>) -> Result<RunningServer, CliError> {
    let dir = prepl_config::discovery_dir();

    match server_id {
        Some(id) => discovery::find_server(&dir, id)
            .map_err(|e| CliError::usage(e.to_string()))?
            .ok_or_else(|| {
                CliError::usage(format!("server '{}' not found", id))
                    .with_hint("use 'prepl servers' to list running servers")
            }),
        None => {
            let servers = discovery::list_servers(&dir)
                .map_err(|e| CliError::io(format!("failed to list servers: {}", e)))?;
            if servers.len() > 1 {
                log::info!(
                    "{} servers running; using the most recent ({})",
                    servers.len(),
                    servers[0].short_id()
                );
            }
            servers.into_iter().next().ok_or_else(|| {
                CliError::usage("no running prepl servers found")
                    .with_hint("start the host with the REPL server enabled, or pass --port")
            })
        }
    }
}
