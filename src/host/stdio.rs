//! Stdin/stdout JSON bridge between the extension and the heartbeat host.
//!
//! Reads newline-delimited JSON from stdin. A line is either a
//! `CommandEnvelope` from the extension or a `ReplyEnvelope` answering one of
//! our browser calls. Responses, events and outbound calls are written as
//! newline-delimited JSON to stdout.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.

use crate::config::PulseConfig;
use crate::error::{PulseError, Result};
use crate::host::channel::{HostCommandClient, command_channel_with_events};
use crate::host::contract::{
    CallEnvelope, CommandEnvelope, CommandName, EventEnvelope, InboundFrame, ResponseEnvelope,
};
use crate::host::remote::RemoteBrowser;
use crate::host::service::PulseRuntime;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

type SharedWriter<W> = Arc<Mutex<BufWriter<W>>>;

/// Run the bridge on the process's stdin and stdout.
///
/// # Errors
///
/// Returns an error if the stores cannot be opened or stdio fails.
pub async fn run_stdio_bridge(config: &PulseConfig) -> Result<()> {
    run_bridge(tokio::io::stdin(), tokio::io::stdout(), config).await
}

/// Run the bridge over an arbitrary byte stream pair until the input closes,
/// a `runtime.stop` command arrives, or the runtime shuts itself down.
///
/// Four concurrent tasks operate alongside the reader:
///
/// 1. **Server** -- routes each command through the handler on its own task.
/// 2. **Event forwarder** -- writes broadcast `EventEnvelope`s.
/// 3. **Call forwarder** -- writes the engine's outbound browser calls.
/// 4. **Heartbeat driver** -- owned by the [`PulseRuntime`].
///
/// The reader never waits on a command response: replies to browser calls
/// arrive on the same input, and a command such as `heartbeat.force` cannot
/// finish until they are read.
///
/// # Errors
///
/// Returns an error if the stores cannot be opened or reading input fails.
pub async fn run_bridge<R, W>(input: R, output: W, config: &PulseConfig) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (runtime, calls_rx) = PulseRuntime::start(config).await?;
    let (client, server) = command_channel_with_events(
        config.host.request_capacity,
        runtime.event_tx.clone(),
        Arc::clone(&runtime.service),
    );

    let writer: SharedWriter<W> = Arc::new(Mutex::new(BufWriter::new(output)));

    let server_handle = tokio::spawn(server.run());
    let event_handle = tokio::spawn(forward_events(
        client.subscribe_events(),
        Arc::clone(&writer),
    ));
    let call_handle = tokio::spawn(forward_calls(calls_rx, Arc::clone(&writer)));

    let reader_result = run_reader(
        input,
        client,
        Arc::clone(&runtime.remote),
        Arc::clone(&writer),
        runtime.shutdown.clone(),
    )
    .await;

    // Drop the call queue first so in-flight ticks fail fast instead of
    // waiting out their call timeout.
    call_handle.abort();
    let _ = call_handle.await;
    runtime.shutdown().await;
    event_handle.abort();
    let _ = event_handle.await;
    server_handle.abort();
    let _ = server_handle.await;

    tracing::info!("stdio bridge stopped");
    reader_result
}

async fn forward_events<W>(mut event_rx: broadcast::Receiver<EventEnvelope>, writer: SharedWriter<W>)
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        match event_rx.recv().await {
            Ok(event_envelope) => match serde_json::to_string(&event_envelope) {
                Ok(json) => {
                    if let Err(e) = write_shared(&writer, &json).await {
                        tracing::warn!(
                            error = %e,
                            "failed to write event envelope; stopping event forwarder"
                        );
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize event envelope; skipping");
                }
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(lagged = n, "event forwarder lagged; some events were dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::info!("event broadcast channel closed; stopping event forwarder");
                break;
            }
        }
    }
}

async fn forward_calls<W>(mut calls_rx: mpsc::Receiver<CallEnvelope>, writer: SharedWriter<W>)
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(call) = calls_rx.recv().await {
        let json = match serde_json::to_string(&call) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, call_id = %call.call_id, "failed to serialize call");
                continue;
            }
        };
        if let Err(e) = write_shared(&writer, &json).await {
            tracing::warn!(error = %e, "failed to write call envelope; stopping call forwarder");
            break;
        }
    }
}

/// Read input line-by-line, resolve replies and dispatch commands.
async fn run_reader<R, W>(
    input: R,
    client: HostCommandClient,
    remote: Arc<RemoteBrowser>,
    writer: SharedWriter<W>,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(input);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = tokio::select! {
            () = shutdown.cancelled() => {
                tracing::info!("runtime shut down; stopping stdio reader");
                break;
            }
            read = reader.read_line(&mut line) => read
                .map_err(|e| PulseError::Channel(format!("failed to read host input: {e}")))?,
        };

        // EOF
        if bytes_read == 0 {
            tracing::info!("host input closed (EOF); shutting down stdio bridge");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let envelope = match InboundFrame::parse(trimmed) {
            Ok(InboundFrame::Reply(reply)) => {
                remote.resolve(reply).await;
                continue;
            }
            Ok(InboundFrame::Command(envelope)) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, raw_line = %trimmed, "failed to parse host input");
                let response =
                    ResponseEnvelope::error("parse-error", format!("failed to parse input: {e}"));
                write_response(&writer, &response).await?;
                continue;
            }
        };

        if envelope.command == CommandName::RuntimeStop {
            let response = dispatch(&client, envelope).await;
            write_response(&writer, &response).await?;
            tracing::info!("runtime.stop received; shutting down stdio bridge");
            break;
        }

        let client = client.clone();
        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            let response = dispatch(&client, envelope).await;
            if let Err(e) = write_response(&writer, &response).await {
                tracing::warn!(error = %e, "failed to write response envelope");
            }
        });
    }

    Ok(())
}

async fn dispatch(client: &HostCommandClient, envelope: CommandEnvelope) -> ResponseEnvelope {
    let request_id = envelope.request_id.clone();
    let command = envelope.command;
    match client.send(envelope).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(error = %e, command = command.as_str(), "host command failed");
            ResponseEnvelope::error(request_id, e.to_string())
        }
    }
}

async fn write_response<W>(writer: &SharedWriter<W>, response: &ResponseEnvelope) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let json = serde_json::to_string(response)
        .map_err(|e| PulseError::Host(format!("failed to serialize response envelope: {e}")))?;
    write_shared(writer, &json).await
}

async fn write_shared<W>(writer: &SharedWriter<W>, json: &str) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut w = writer.lock().await;
    write_line(&mut w, json).await
}

/// Write a single JSON line to the buffered writer and flush.
async fn write_line<W>(writer: &mut BufWriter<W>, json: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| PulseError::Channel(format!("failed to write host output: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| PulseError::Channel(format!("failed to write newline: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| PulseError::Channel(format!("failed to flush host output: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::host::contract::EVENT_VERSION;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, DuplexStream};

    struct Harness {
        input: DuplexStream,
        output: tokio::io::Lines<BufReader<DuplexStream>>,
        bridge: tokio::task::JoinHandle<Result<()>>,
        _dir: tempfile::TempDir,
    }

    fn start() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = PulseConfig::default();
        config.storage.data_dir = Some(dir.path().to_path_buf());
        config.scheduler.first_tick_delay_secs = 3_600;
        config.scheduler.fallback_interval_secs = 0;
        config.host.call_timeout_ms = 2_000;

        let (input, bridge_in) = tokio::io::duplex(16 * 1024);
        let (bridge_out, output) = tokio::io::duplex(16 * 1024);
        let bridge = tokio::spawn(async move { run_bridge(bridge_in, bridge_out, &config).await });
        Harness {
            input,
            output: BufReader::new(output).lines(),
            bridge,
            _dir: dir,
        }
    }

    async fn send(h: &mut Harness, value: serde_json::Value) {
        let mut line = serde_json::to_string(&value).expect("encode");
        line.push('\n');
        h.input.write_all(line.as_bytes()).await.expect("write");
    }

    /// Read output lines until one satisfies `pred`.
    async fn next_matching(
        h: &mut Harness,
        pred: impl Fn(&serde_json::Value) -> bool,
    ) -> serde_json::Value {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let line = h.output.next_line().await.expect("read").expect("open");
                let value: serde_json::Value = serde_json::from_str(&line).expect("json line");
                if pred(&value) {
                    return value;
                }
            }
        })
        .await
        .expect("expected output line")
    }

    #[test]
    fn parse_error_response_is_well_formed() {
        let resp = ResponseEnvelope::error("parse-error", "bad json");
        assert!(!resp.ok);
        assert_eq!(resp.request_id, "parse-error");
        assert_eq!(resp.v, EVENT_VERSION);
        assert!(resp.error.is_some());
    }

    #[tokio::test]
    async fn ping_then_stop() {
        let mut h = start();
        send(
            &mut h,
            serde_json::json!({"v": 1, "request_id": "r1", "command": "host.ping", "payload": {}}),
        )
        .await;
        let resp = next_matching(&mut h, |v| v["request_id"] == "r1").await;
        assert_eq!(resp["ok"], true);
        assert_eq!(resp["payload"]["pong"], true);

        send(
            &mut h,
            serde_json::json!({"v": 1, "request_id": "r2", "command": "runtime.stop"}),
        )
        .await;
        let resp = next_matching(&mut h, |v| v["request_id"] == "r2").await;
        assert_eq!(resp["ok"], true);

        let result = tokio::time::timeout(Duration::from_secs(5), h.bridge)
            .await
            .expect("bridge stops")
            .expect("join");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn garbage_line_gets_parse_error() {
        let mut h = start();
        h.input.write_all(b"{not json\n").await.expect("write");
        let resp = next_matching(&mut h, |v| v["request_id"] == "parse-error").await;
        assert_eq!(resp["ok"], false);
    }

    #[tokio::test]
    async fn forced_heartbeat_calls_back_into_browser() {
        let mut h = start();
        send(
            &mut h,
            serde_json::json!({
                "v": 1,
                "request_id": "create",
                "command": "rules.create",
                "payload": {"name": "Docs", "pattern": "docs.test", "intervalMinutes": 1}
            }),
        )
        .await;
        let created = next_matching(&mut h, |v| v["request_id"] == "create").await;
        assert_eq!(created["ok"], true);

        // Creating a rule triggers a tick, which starts by listing tabs.
        let call = next_matching(&mut h, |v| v["call"] == "tabs.query").await;
        let call_id = call["call_id"].as_str().expect("call id").to_owned();
        send(
            &mut h,
            serde_json::json!({
                "v": 1,
                "call_id": call_id,
                "ok": true,
                "payload": [{"id": 3, "url": "https://example.org/"}]
            }),
        )
        .await;

        let event = next_matching(&mut h, |v| v["event"] == "heartbeat.completed").await;
        assert_eq!(event["payload"]["outcome"], "noMatch");
    }

    #[tokio::test]
    async fn input_eof_stops_bridge() {
        let h = start();
        drop(h.input);
        let result = tokio::time::timeout(Duration::from_secs(5), h.bridge)
            .await
            .expect("bridge stops")
            .expect("join");
        assert!(result.is_ok());
    }
}
