use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::session::{Command, Frame, Session};

/// Binds the session endpoint and serves until SIGINT/SIGTERM. Each
/// WebSocket connection owns one session; closing the socket tears the
/// session down.
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let app = Router::new().route("/ws", get(upgrade));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "session endpoint listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => warn!(%err, "no terminate handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
    info!("shutting down");
}

async fn upgrade(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(run_connection)
}

async fn run_connection(socket: WebSocket) {
    let session = Arc::new(Mutex::new(Session::new()));
    let mut frames = session.lock().subscribe();
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let mut text = frame.to_value().to_string();
            // coalesce whatever else is pending into one newline-separated
            // write
            while let Ok(frame) = frames.try_recv() {
                text.push('\n');
                text.push_str(&frame.to_value().to_string());
            }
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(%err, "socket read failed");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                for line in text.lines().filter(|line| !line.trim().is_empty()) {
                    dispatch(&session, line)
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // the session token dominates every derived task
    session.lock().stop();
    writer.abort();
    debug!("connection closed");
}

/// Parses one command frame and applies it. Failures answer with an `error`
/// frame on the same session; the simulation keeps running.
fn dispatch(session: &Arc<Mutex<Session>>, line: &str) {
    let command: Command = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(err) => {
            warn!(%err, "malformed command");
            session.lock().broadcast(Frame::Error {
                code: "bad_command",
                message: err.to_string(),
            });
            return;
        }
    };
    let code = command.error_code();
    let mut session = session.lock();
    if let Err(err) = session.handle(command) {
        session.broadcast(Frame::Error {
            code,
            message: format!("{err:#}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frames_parse_with_wire_names() {
        let command: Command = serde_json::from_str(
            r#"{"type":"start_simulation","project":"clocks","config":{"nodeCount":4,"stepMode":true}}"#,
        )
        .unwrap();
        assert!(matches!(command, Command::StartSimulation { .. }));

        let command: Command =
            serde_json::from_str(r#"{"type":"inject_partition","from":"a","to":"b","bidirectional":true}"#)
                .unwrap();
        match command {
            Command::InjectPartition {
                from,
                to,
                bidirectional,
            } => {
                assert_eq!((from.as_str(), to.as_str(), bidirectional), ("a", "b", true));
            }
            other => panic!("parsed {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_surfaces_errors_without_killing_the_session() {
        let session = Arc::new(Mutex::new(Session::new()));
        let mut frames = session.lock().subscribe();
        let _ = frames.recv().await; // initial snapshot

        dispatch(&session, "{\"type\":\"definitely_not_a_command\"}");
        dispatch(&session, "{\"type\":\"inject_crash\",\"nodeId\":\"ghost\"}");

        let mut codes = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            if let Frame::Error { code, .. } = frame {
                codes.push(code);
            }
        }
        assert_eq!(codes, vec!["bad_command", "invalid_target"]);
    }
}
