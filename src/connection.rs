//! Per-connection handling
//!
//!  Every read from the socket is one frame. Frames are trimmed, empty ones
//!  are skipped, the rest are decoded and reported as `track` or `fail`.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::config::ServerSettings;
use crate::decoder::Decoder;
use crate::event::{
    ConnectionInfo, DecodeFailure, ErrorContext, ErrorEvent, Event, EventSink, emit,
};

const READ_BUFFER_SIZE: usize = 4096;

/// Everything a connection task needs, shared by all connections of a server
#[derive(Clone)]
pub struct ConnectionContext {
    pub settings: Arc<ServerSettings>,
    pub decoder: Arc<Decoder>,
    pub sink: Arc<dyn EventSink>,
}

/// Serve one device connection until it closes, times out or fails.
pub async fn handle_connection(
    mut socket: TcpStream,
    connection: ConnectionInfo,
    ctx: ConnectionContext,
) {
    let sink = ctx.sink.as_ref();
    debug!("Device connected: {}", connection);
    emit(sink, Event::Connection(connection));

    let idle_timeout = ctx.settings.inactivity_timeout();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    let had_error = loop {
        buf.clear();

        let read = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, socket.read_buf(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    debug!("Device timed out: {}", connection);
                    emit(sink, Event::Timeout(connection));
                    break false;
                }
            },
            None => socket.read_buf(&mut buf).await,
        };

        match read {
            Ok(0) => break false,
            Ok(_) => {
                let frame = String::from_utf8_lossy(&buf);
                handle_frame(&frame, connection, &ctx.decoder, sink);
            }
            Err(e) => {
                error!("Socket error on {}: {}", connection, e);
                emit(
                    sink,
                    Event::Error(ErrorEvent {
                        message: "Socket error".to_string(),
                        reason: e.to_string(),
                        context: ErrorContext::Connection {
                            connection,
                            settings: ctx.settings.as_ref().clone(),
                        },
                    }),
                );
                break true;
            }
        }
    };

    drop(socket);
    debug!("Device disconnected: {}", connection);
    emit(
        sink,
        Event::Disconnect {
            connection,
            had_error,
        },
    );
}

/// Decode one frame and report the outcome.
///
/// Emits nothing for blank frames, otherwise `data` followed by exactly one
/// `track` or `fail`.
pub fn handle_frame(
    frame: &str,
    connection: ConnectionInfo,
    decoder: &Decoder,
    sink: &dyn EventSink,
) {
    let frame = frame.trim();
    if frame.is_empty() {
        return;
    }

    emit(
        sink,
        Event::Data {
            data: frame.to_string(),
            connection,
        },
    );

    match decoder.parse(frame) {
        Ok(reading) => emit(
            sink,
            Event::Track {
                reading: Box::new(reading),
                connection,
            },
        ),
        Err(e) => {
            warn!("Cannot decode frame from {}: {}", connection, e);
            emit(
                sink,
                Event::Fail(DecodeFailure {
                    reason: e.to_string(),
                    input: frame.to_string(),
                    error: e,
                    connection,
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpSocket};
    use tokio::sync::broadcast;

    use super::*;
    use crate::error::DecodeError;
    use crate::event::EventHub;

    const V1_MSG: &str = "*HQ,4209950057,V1,035522,A,1321.1457,N,10351.0798,E,000.00,000,240317,BFFFFBFF,456,06,0,0,6#";

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            local: "127.0.0.1:5000".parse().unwrap(),
            remote: "127.0.0.1:41000".parse().unwrap(),
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Accept one loopback connection and run the handler on it.
    async fn connected(timeout: u64) -> (TcpStream, broadcast::Receiver<Event>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let rx = serve_one(&listener, timeout).await;
        (client, rx)
    }

    async fn serve_one(listener: &TcpListener, timeout: u64) -> broadcast::Receiver<Event> {
        let addr = listener.local_addr().unwrap();
        let (socket, remote) = listener.accept().await.unwrap();

        let hub = EventHub::new();
        let rx = hub.subscribe();
        let ctx = ConnectionContext {
            settings: Arc::new(ServerSettings {
                timeout,
                ..Default::default()
            }),
            decoder: Arc::new(Decoder::default()),
            sink: Arc::new(hub),
        };
        let connection = ConnectionInfo {
            local: addr,
            remote,
        };
        tokio::spawn(handle_connection(socket, connection, ctx));
        rx
    }

    #[test]
    fn test_blank_frame_emits_nothing() {
        let (tx, rx) = crossbeam_channel::unbounded();
        handle_frame("  \r\n", info(), &Decoder::default(), &tx);
        handle_frame("", info(), &Decoder::default(), &tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_valid_frame_emits_data_then_track() {
        let (tx, rx) = crossbeam_channel::unbounded();
        handle_frame(&format!("{}\n", V1_MSG), info(), &Decoder::default(), &tx);

        assert!(matches!(rx.try_recv(), Ok(Event::Data { data, .. }) if data == V1_MSG));
        match rx.try_recv() {
            Ok(Event::Track { reading, connection }) => {
                assert_eq!(reading.imei, "4209950057");
                assert_eq!(connection, info());
            }
            other => panic!("expected track, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_malformed_frame_emits_fail() {
        let (tx, rx) = crossbeam_channel::unbounded();
        handle_frame("*HQ,4209950057,#", info(), &Decoder::default(), &tx);

        assert!(matches!(rx.try_recv(), Ok(Event::Data { .. })));
        match rx.try_recv() {
            Ok(Event::Fail(failure)) => {
                assert_eq!(failure.input, "*HQ,4209950057,#");
                assert_eq!(failure.error, DecodeError::Unrecognized);
                assert_eq!(failure.reason, "Cannot parse GPS data from device");
                assert_eq!(failure.connection, info());
            }
            other => panic!("expected fail, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connection_lifecycle() {
        let (mut client, mut rx) = connected(0).await;
        assert!(matches!(next_event(&mut rx).await, Event::Connection(_)));

        client.write_all(b"garbage\n").await.unwrap();
        assert!(matches!(next_event(&mut rx).await, Event::Data { .. }));
        assert!(matches!(next_event(&mut rx).await, Event::Fail(_)));

        // Still open after a failed frame
        client.write_all(V1_MSG.as_bytes()).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, Event::Data { .. }));
        assert!(matches!(next_event(&mut rx).await, Event::Track { .. }));

        drop(client);
        match next_event(&mut rx).await {
            Event::Disconnect { had_error, .. } => assert!(!had_error),
            other => panic!("expected disconnect, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_connection_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socket = TcpSocket::new_v4().unwrap();
        // Zero linger makes the close send RST instead of FIN
        socket.set_linger(Some(Duration::ZERO)).unwrap();
        let mut client = socket
            .connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let mut rx = serve_one(&listener, 0).await;
        assert!(matches!(next_event(&mut rx).await, Event::Connection(_)));

        client.write_all(b"x").await.unwrap();
        assert!(matches!(next_event(&mut rx).await, Event::Data { data, .. } if data == "x"));
        assert!(matches!(next_event(&mut rx).await, Event::Fail(_)));

        drop(client);
        match next_event(&mut rx).await {
            Event::Error(e) => {
                assert_eq!(e.message, "Socket error");
                assert!(matches!(e.context, ErrorContext::Connection { .. }));
            }
            other => panic!("expected error, got {:?}", other),
        }
        match next_event(&mut rx).await {
            Event::Disconnect { had_error, .. } => assert!(had_error),
            other => panic!("expected disconnect, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_connection_times_out() {
        let (mut client, mut rx) = connected(1).await;
        assert!(matches!(next_event(&mut rx).await, Event::Connection(_)));
        assert!(matches!(next_event(&mut rx).await, Event::Timeout(_)));
        match next_event(&mut rx).await {
            Event::Disconnect { had_error, .. } => assert!(!had_error),
            other => panic!("expected disconnect, got {:?}", other),
        }

        // Server side closed the socket
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
