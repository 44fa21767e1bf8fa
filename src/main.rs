mod allocation;
mod config;
mod db;
mod export;
mod ipc;
mod seating;
mod store;

use config::{DaemonConfig, LogFormat};
use std::io::{self, BufRead, Write};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Logs go to stderr; stdout carries the protocol.
fn init_logging(config: &DaemonConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn main() {
    let config = DaemonConfig::from_env();
    init_logging(&config);
    info!(version = env!("CARGO_PKG_VERSION"), "examseatd starting");

    let mut state = ipc::AppState::default();
    if let Some(path) = config.workspace.as_ref() {
        if let Err(e) = ipc::open_workspace(&mut state, path) {
            // The caller can still pick a workspace over IPC.
            error!(workspace = %path.to_string_lossy(), error = %format!("{e:#}"), "startup workspace failed to open");
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "stdin closed with error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                let reply = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", reply);
                let _ = stdout.flush();
                continue;
            }
        };

        debug!(id = %req.id, method = %req.method, "request");
        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    info!("stdin closed; examseatd exiting");
}
