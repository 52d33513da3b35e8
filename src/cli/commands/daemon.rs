//! `bd daemon` — start/stop/status/run.

use std::time::{Duration, Instant};

use crate::cli::DaemonCommands;
use crate::config::{CliOverrides, Session};
use crate::daemon::client::{self, RpcClient, START_WAIT};
use crate::daemon::lifecycle::{self, process_alive, read_pid};
use crate::daemon::protocol::methods;
use crate::error::{BeadsError, Result};

pub fn execute(command: &DaemonCommands, json: bool, overrides: &CliOverrides) -> Result<()> {
    let session = Session::discover(overrides.clone())?;
    match command {
        DaemonCommands::Run => run_foreground(&session),
        DaemonCommands::Start => start(&session),
        DaemonCommands::Stop => stop(&session),
        DaemonCommands::Status => status(&session, json),
    }
}

fn run_foreground(session: &Session) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(lifecycle::run(session.paths.clone()))
}

fn start(session: &Session) -> Result<()> {
    if let Some(pid) = read_pid(&session.paths.pid_path()) {
        if process_alive(pid) {
            println!("Daemon already running (pid {pid})");
            return Ok(());
        }
    }

    client::spawn_detached(&session.paths)?;
    let rpc = RpcClient::new(session.paths.socket_path());
    let deadline = Instant::now() + START_WAIT;
    while Instant::now() < deadline {
        if rpc.probe() {
            let pid = read_pid(&session.paths.pid_path()).unwrap_or(0);
            println!("Daemon started (pid {pid})");
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Err(BeadsError::Rpc {
        reason: format!("daemon did not come up within {}s", START_WAIT.as_secs()),
    })
}

fn stop(session: &Session) -> Result<()> {
    let rpc = RpcClient::new(session.paths.socket_path());
    if rpc.probe() {
        rpc.call(methods::SHUTDOWN, serde_json::Value::Null)?;
        println!("Daemon stopping");
        return Ok(());
    }

    // socket dead; fall back to the PID file and a signal
    match read_pid(&session.paths.pid_path()) {
        Some(pid) if process_alive(pid) => {
            nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(i32::try_from(pid).unwrap_or(0)),
                nix::sys::signal::Signal::SIGTERM,
            )
            .map_err(|e| BeadsError::Rpc {
                reason: format!("failed to signal pid {pid}: {e}"),
            })?;
            println!("Sent SIGTERM to daemon (pid {pid})");
            Ok(())
        }
        _ => {
            println!("No daemon running");
            Ok(())
        }
    }
}

fn status(session: &Session, json: bool) -> Result<()> {
    let rpc = RpcClient::new(session.paths.socket_path());
    if rpc.probe() {
        let data = rpc.call(methods::STATUS, serde_json::Value::Null)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&data)?);
        } else {
            println!(
                "Daemon running: pid {}, {} issue(s), {} dirty, up {}s",
                data["pid"], data["issue_count"], data["dirty_count"], data["uptime_secs"]
            );
        }
        return Ok(());
    }

    let stale = read_pid(&session.paths.pid_path());
    if json {
        println!(
            "{}",
            serde_json::json!({"running": false, "stale_pid": stale})
        );
    } else {
        match stale {
            Some(pid) if process_alive(pid) => {
                println!("Daemon pid {pid} is alive but not answering on the socket");
            }
            Some(pid) => println!("Not running (stale pid file: {pid})"),
            None => println!("Not running"),
        }
    }
    Ok(())
}
