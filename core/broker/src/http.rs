//! Read-only HTTP status page plus `POST /` runtime commands.
//!
//! `GET /` renders the full report; `/s`, `/a`, `/c`, `/d` and `/dd` the
//! individual sections. `POST /` accepts `key=value` pairs joined with
//! `&`: `verbose=N`, `console=0|1`, `disconnect=m`, `shutdown`.

use std::net::SocketAddr;

use axum::extract::Path;
use axum::routing::get;
use axum::{Extension, Router};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::event::{BrokerEvent, DumpKind, EventSender};
use crate::logging::LogControl;

#[derive(Clone)]
pub struct HttpState {
    pub events: EventSender,
    pub log: LogControl,
}

/// Binds the status server and returns the address it listens on.
pub async fn serve(
    addr: SocketAddr,
    state: HttpState,
    shutdown: CancellationToken,
) -> anyhow::Result<SocketAddr> {
    let app = Router::new()
        .route("/", get(full_report).post(apply_commands))
        .route("/:section", get(section_report))
        .layer(Extension(state));

    let server = axum::Server::try_bind(&addr)?.serve(app.into_make_service());
    let local_addr = server.local_addr();

    tokio::spawn(async move {
        let graceful = server.with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        });
        if let Err(err) = graceful.await {
            tracing::error!("http server failed: {err}");
        }
    });

    Ok(local_addr)
}

async fn full_report(Extension(state): Extension<HttpState>) -> String {
    dump(&state, DumpKind::Full).await
}

async fn section_report(
    Extension(state): Extension<HttpState>,
    Path(section): Path<String>,
) -> String {
    let kind = match section.as_str() {
        "s" => DumpKind::Servers,
        "a" => DumpKind::Clients,
        "c" => DumpKind::ConnectNotifications,
        "d" => DumpKind::DisconnectNotifications,
        "dd" => DumpKind::DetachNotifications,
        "favicon.ico" => return String::new(),
        _ => DumpKind::Full,
    };
    dump(&state, kind).await
}

async fn dump(state: &HttpState, kind: DumpKind) -> String {
    let (tx, rx) = oneshot::channel();
    if state
        .events
        .send(BrokerEvent::Dump { kind, reply: tx })
        .is_err()
    {
        return String::new();
    }
    rx.await.unwrap_or_default()
}

async fn apply_commands(Extension(state): Extension<HttpState>, body: String) -> String {
    let mut ok = !body.trim().is_empty();
    for command in body.trim().split('&') {
        if !apply(&state, command.trim()) {
            ok = false;
        }
    }
    if ok {
        "OK".to_owned()
    } else {
        "FAIL".to_owned()
    }
}

fn apply(state: &HttpState, command: &str) -> bool {
    if let Some(level) = command.strip_prefix("verbose=") {
        let Ok(level) = level.parse::<usize>() else {
            return false;
        };
        state.log.set_verbosity(level);
        return true;
    }
    if let Some(value) = command.strip_prefix("console=") {
        let Ok(value) = value.parse::<u8>() else {
            return false;
        };
        state.log.set_console(value != 0);
        return true;
    }
    if command == "shutdown" {
        info!("RECEIVED SHUTDOWN COMMAND");
        return state.events.send(BrokerEvent::Shutdown).is_ok();
    }
    if let Some(target) = command.strip_prefix("disconnect=") {
        if target.starts_with('m') {
            info!("DISCONNECTING {target}");
            return state.events.send(BrokerEvent::DisconnectMaster).is_ok();
        }
        return false;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;

    fn state() -> (HttpState, event::EventReceiver) {
        let (events, rx) = event::channel();
        (
            HttpState {
                events,
                log: LogControl::disabled(),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn shutdown_command_reaches_the_broker() {
        let (state, mut rx) = state();
        assert!(apply(&state, "shutdown"));
        assert!(matches!(rx.recv().await, Some(BrokerEvent::Shutdown)));
    }

    #[tokio::test]
    async fn disconnect_master_command() {
        let (state, mut rx) = state();
        assert!(apply(&state, "disconnect=m"));
        assert!(matches!(
            rx.recv().await,
            Some(BrokerEvent::DisconnectMaster)
        ));
        assert!(!apply(&state, "disconnect=x"));
    }

    #[tokio::test]
    async fn malformed_commands_fail() {
        let (state, _rx) = state();
        assert!(!apply(&state, "verbose=loud"));
        assert!(!apply(&state, "unknown=1"));
        assert!(apply(&state, "verbose=2"));
        assert!(apply(&state, "console=0"));
    }
}
