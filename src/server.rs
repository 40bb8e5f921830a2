//! TCP server for H02 devices
//!
//!  One accept loop per server, one task per accepted connection.

use std::any::Any;
use std::future::Future;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ServerSettings, SettingsOverrides};
use crate::connection::{ConnectionContext, handle_connection};
use crate::decoder::Decoder;
use crate::error::ServerError;
use crate::event::{ConnectionInfo, ErrorContext, ErrorEvent, Event, EventSink, emit};

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct Running {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    accept_task: JoinHandle<()>,
}

enum State {
    Stopped,
    /// A `start` call holds the slot while it binds
    Starting,
    Running(Running),
}

/// Claim on the `Starting` slot. Puts `Stopped` back unless `finish` runs.
struct StartReservation<'a> {
    state: &'a Mutex<State>,
    done: bool,
}

impl StartReservation<'_> {
    fn finish(mut self, running: Running) {
        *self.state.lock() = State::Running(running);
        self.done = true;
    }
}

impl Drop for StartReservation<'_> {
    fn drop(&mut self) {
        if !self.done {
            *self.state.lock() = State::Stopped;
        }
    }
}

/// H02 tracking server
pub struct Server {
    settings: Arc<ServerSettings>,
    decoder: Arc<Decoder>,
    sink: Arc<dyn EventSink>,
    state: Mutex<State>,
}

impl Server {
    pub fn new(settings: ServerSettings, sink: impl EventSink + 'static) -> Self {
        Self {
            settings: Arc::new(settings),
            decoder: Arc::new(Decoder::default()),
            sink: Arc::new(sink),
            state: Mutex::new(State::Stopped),
        }
    }

    /// Use a decoder with additional message shapes
    pub fn with_decoder(mut self, decoder: Decoder) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Bound address while the server is running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock() {
            State::Running(running) => Some(running.local_addr),
            _ => None,
        }
    }

    /// Bind the listen socket and start accepting connections.
    ///
    /// Bind failures are reported as an `error` event and returned.
    /// Only one of several concurrent calls can succeed.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let reservation = self.reserve_start()?;

        let addr = self.settings.bind_addr();
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => return Err(self.bind_failed(addr, e)),
        };
        let local_addr = listener.local_addr()?;

        info!("H02 server listening on {}", local_addr);
        emit(self.sink.as_ref(), Event::Listening(local_addr));

        let (shutdown, shutdown_rx) = oneshot::channel();
        let ctx = ConnectionContext {
            settings: Arc::clone(&self.settings),
            decoder: Arc::clone(&self.decoder),
            sink: Arc::clone(&self.sink),
        };
        let accept_task = spawn_supervised(
            Arc::clone(&self.sink),
            accept_loop(listener, local_addr, ctx, shutdown_rx),
        );

        reservation.finish(Running {
            local_addr,
            shutdown,
            accept_task,
        });

        Ok(local_addr)
    }

    /// Stop accepting and release the listen socket.
    ///
    /// Resolves once the socket is closed. Open connections are left alone
    /// and finish on their own.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let running = {
            let mut state = self.state.lock();
            match mem::replace(&mut *state, State::Stopped) {
                State::Running(running) => running,
                other => {
                    *state = other;
                    return Err(ServerError::NotStarted);
                }
            }
        };

        let _ = running.shutdown.send(());
        // A panic in the loop was already reported by its supervisor
        let _ = running.accept_task.await;

        info!("H02 server on {} stopped", running.local_addr);
        Ok(())
    }

    fn reserve_start(&self) -> Result<StartReservation<'_>, ServerError> {
        let mut state = self.state.lock();
        match &*state {
            State::Running(running) => return Err(ServerError::AlreadyRunning(running.local_addr)),
            State::Starting => return Err(ServerError::Starting),
            State::Stopped => {}
        }
        *state = State::Starting;

        Ok(StartReservation {
            state: &self.state,
            done: false,
        })
    }

    fn bind_failed(&self, addr: SocketAddr, e: io::Error) -> ServerError {
        let message = if e.kind() == io::ErrorKind::AddrNotAvailable {
            "IP or port not available"
        } else {
            "Server error"
        };
        error!("{} ({}): {}", message, addr, e);

        emit(
            self.sink.as_ref(),
            Event::Error(ErrorEvent {
                message: message.to_string(),
                reason: e.to_string(),
                context: ErrorContext::Server(self.settings.as_ref().clone()),
            }),
        );

        let addr = addr.to_string();
        if e.kind() == io::ErrorKind::AddrNotAvailable {
            ServerError::AddrNotAvailable { addr, source: e }
        } else {
            ServerError::Bind { addr, source: e }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let State::Running(running) = mem::replace(self.state.get_mut(), State::Stopped) {
            let _ = running.shutdown.send(());
        }
    }
}

/// Build a server from defaults plus `overrides` and start it.
pub async fn create_server(
    overrides: &SettingsOverrides,
    sink: impl EventSink + 'static,
) -> Result<Server, ServerError> {
    let server = Server::new(ServerSettings::with_overrides(overrides), sink);
    server.start().await?;
    Ok(server)
}

async fn accept_loop(
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: ConnectionContext,
    mut shutdown: oneshot::Receiver<()>,
) {
    let slots = Arc::new(Semaphore::new(ctx.settings.max_connections));

    loop {
        let accepted = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, remote)) => {
                let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
                    warn!(
                        "Connection limit ({}) reached, refusing {}",
                        ctx.settings.max_connections, remote
                    );
                    drop(socket);
                    continue;
                };

                let connection = ConnectionInfo {
                    local: local_addr,
                    remote,
                };
                let ctx = ctx.clone();
                spawn_supervised(Arc::clone(&ctx.sink), async move {
                    let _permit = permit;
                    handle_connection(socket, connection, ctx).await;
                });
            }
            Err(e) => {
                error!("Accept failed on {}: {}", local_addr, e);
                emit(
                    ctx.sink.as_ref(),
                    Event::Error(ErrorEvent {
                        message: "Server error".to_string(),
                        reason: e.to_string(),
                        context: ErrorContext::Server(ctx.settings.as_ref().clone()),
                    }),
                );
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    debug!("Accept loop on {} finished", local_addr);
}

/// Spawn `task` and report a panic in it as an `error` event.
///
/// The returned handle completes after the task has.
fn spawn_supervised<F>(sink: Arc<dyn EventSink>, task: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(task);
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            if e.is_panic() {
                let reason = panic_message(e.into_panic());
                error!("Uncaught panic in server task: {}", reason);
                emit(
                    sink.as_ref(),
                    Event::Error(ErrorEvent {
                        message: "uncaught exception".to_string(),
                        reason,
                        context: ErrorContext::Fault,
                    }),
                );
            }
        }
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
