use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use anyhow::Context;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, warn, Instrument, Level};
use uuid::Uuid;
use crate::config::RpcConfig;
use crate::dispatch::interface::RpcInterface;
use crate::events::{ReleaseCounter, StopSignal};
use crate::server::stream_processor::ServerStreamProcessor;

/// Serves an [RpcInterface] on a TCP port: each accepted connection is served by its own
///  [ServerStreamProcessor], and a connection that fails is simply closed while the server keeps
///  accepting others.
pub struct RpcServer {
    local_addr: SocketAddr,
    shutdown: StopSignal,
    connections: ReleaseCounter,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    /// Binds the listening socket and starts accepting connections. Failing to bind is fatal
    ///  for a server, so it is logged as an error (and returned to the caller).
    pub async fn bind(addr: impl ToSocketAddrs, interface: Arc<RpcInterface>, config: RpcConfig) -> anyhow::Result<RpcServer> {
        config.validate()?;

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("failed to bind server socket: {}", e);
                return Err(e).context("failed to bind server socket");
            }
        };
        let local_addr = listener.local_addr()?;
        info!("serving interface {} on {}", interface.name(), local_addr);

        let shutdown = StopSignal::new();
        let connections = ReleaseCounter::new();
        let accept_loop = AcceptLoop {
            listener,
            interface,
            config: Arc::new(config),
            shutdown: shutdown.clone(),
            connections: connections.clone(),
            connection_stops: Default::default(),
        };
        let accept_task = tokio::spawn(accept_loop.run());

        Ok(RpcServer {
            local_addr,
            shutdown,
            connections,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn num_connections(&self) -> usize {
        self.connections.count()
    }

    /// Stops accepting connections, stops all connections, and waits until all of them are
    ///  closed
    pub async fn shutdown(&self) {
        info!("shutting down server on {}", self.local_addr);
        self.shutdown.stop();

        let accept_task = self.accept_task.lock().unwrap().take();
        if let Some(accept_task) = accept_task {
            if let Err(e) = accept_task.await {
                error!("accept loop failed: {}", e);
            }
        }
        self.connections.wait_all_released().await;
        debug!("server on {} is shut down", self.local_addr);
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown.stop();
    }
}

struct AcceptLoop {
    listener: TcpListener,
    interface: Arc<RpcInterface>,
    config: Arc<RpcConfig>,
    shutdown: StopSignal,
    connections: ReleaseCounter,
    connection_stops: Arc<Mutex<FxHashMap<Uuid, StopSignal>>>,
}

impl AcceptLoop {
    async fn run(self) {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = self.shutdown.stopped() => break,
            };

            match accepted {
                Ok((socket, peer_addr)) => self.on_accepted(socket, peer_addr),
                Err(e) => warn!("error accepting connection: {}", e),
            }
        }

        let connection_stops = self.connection_stops.lock().unwrap();
        debug!("accept loop stopped, stopping {} connections", connection_stops.len());
        for stop in connection_stops.values() {
            stop.stop();
        }
    }

    fn on_accepted(&self, socket: TcpStream, peer_addr: SocketAddr) {
        if self.connections.count() >= self.config.max_connections {
            warn!("refusing connection from {}: {} connections are open already", peer_addr, self.config.max_connections);
            return;
        }
        if let Err(e) = socket.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY for connection from {}: {}", peer_addr, e);
        }

        let connection_id = Uuid::new_v4();
        let processor = ServerStreamProcessor::new(self.interface.clone(), self.config.clone());
        self.connection_stops.lock().unwrap()
            .insert(connection_id, processor.stop_signal());

        let guard = self.connections.acquire();
        let connection_stops = self.connection_stops.clone();
        let span = span!(Level::INFO, "connection", %peer_addr, %connection_id);
        tokio::spawn(async move {
            info!("accepted connection");
            processor.run(socket).await;
            connection_stops.lock().unwrap().remove(&connection_id);
            info!("connection closed");
            drop(guard);
        }.instrument(span));
    }
}
