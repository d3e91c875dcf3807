use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::{anyhow, bail};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, span, warn, Instrument, Level, Span};
use uuid::Uuid;
use crate::client::connector::{RpcIo, StreamConnector};
use crate::client::stream_processor::{ClientConnection, ClientStreamProcessor};
use crate::config::RpcConfig;
use crate::dispatch::data::RpcData;
use crate::dispatch::interface::RpcInterface;
use crate::events::{ReleaseCounter, StopSignal};

/// A client for an [RpcInterface]. It keeps a connection open in the background, reconnecting
///  after a configurable interval whenever the connection is lost, and runs any number of
///  concurrent calls on the current connection.
///
/// Calls are not retried: a call that is in progress when the connection fails returns an
///  error, and calls are refused while there is no connection.
pub struct RpcClient {
    interface: Arc<RpcInterface>,
    inner: Arc<ClientInner>,
    connect_task: Mutex<Option<JoinHandle<()>>>,
}

struct ClientInner {
    config: Arc<RpcConfig>,
    shutdown: StopSignal,
    current: watch::Sender<Option<ClientConnection>>,
    calls: ReleaseCounter,
}

impl RpcClient {
    /// Starts connecting in the background. This returns immediately, use
    ///  [RpcClient::wait_connected] to wait for the first connection.
    pub fn start(connector: impl StreamConnector, interface: Arc<RpcInterface>, config: RpcConfig) -> anyhow::Result<RpcClient> {
        config.validate()?;

        let inner = Arc::new(ClientInner {
            config: Arc::new(config),
            shutdown: StopSignal::new(),
            current: watch::Sender::new(None),
            calls: ReleaseCounter::new(),
        });
        let connect_task = tokio::spawn(inner.clone().run_connect_loop(connector)
            .instrument(span!(Level::INFO, "rpc_client", interface = interface.name())));

        Ok(RpcClient {
            interface,
            inner,
            connect_task: Mutex::new(Some(connect_task)),
        })
    }

    pub fn interface(&self) -> &Arc<RpcInterface> {
        &self.interface
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current.borrow()
            .as_ref()
            .map(|c| !c.is_stopped())
            .unwrap_or(false)
    }

    /// Returns `true` as soon as there is a connection, or `false` if there is none within the
    ///  timeout
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut current = self.inner.current.subscribe();
        let connected = time::timeout(timeout, async move {
            current.wait_for(|c| c.as_ref().map(|c| !c.is_stopped()).unwrap_or(false)).await
                .is_ok()
        });
        connected.await.unwrap_or(false)
    }

    pub fn num_active_calls(&self) -> usize {
        self.inner.calls.count()
    }

    pub fn new_request(&self, method_name: &str) -> anyhow::Result<RpcData> {
        self.interface.new_request(method_name)
    }

    /// Sends a request and waits for the response. `data` must have been created for this
    ///  client's interface, see [RpcClient::new_request].
    pub async fn invoke_rpc(&self, mut data: RpcData) -> anyhow::Result<RpcData> {
        if self.inner.shutdown.is_stopped() {
            bail!("client is shut down");
        }
        let connection = self.inner.current.borrow().clone()
            .ok_or_else(|| anyhow!("not connected"))?;
        let request = connection.open_request()?;

        // NB: the call runs in a task of its own so that it is finished even if the caller
        //  drops this future
        let guard = self.inner.calls.acquire();
        let call = tokio::spawn(async move {
            let result = request.invoke_rpc(&mut data).await;
            drop(guard);
            result.map(|_| data)
        }.instrument(Span::current()));

        call.await?
    }

    /// Closes the connection and waits until all calls are finished. Calls that are in progress
    ///  return an error.
    pub async fn shutdown(&self) {
        debug!("shutting down client for {}", self.interface.name());
        self.inner.shutdown.stop();

        let connect_task = self.connect_task.lock().unwrap().take();
        if let Some(connect_task) = connect_task {
            if let Err(e) = connect_task.await {
                error!("connect loop failed: {}", e);
            }
        }
        self.inner.calls.wait_all_released().await;
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.inner.shutdown.stop();
    }
}

impl ClientInner {
    async fn run_connect_loop(self: Arc<Self>, connector: impl StreamConnector) {
        loop {
            let connected = tokio::select! {
                connected = connector.connect() => connected,
                _ = self.shutdown.stopped() => break,
            };

            match connected {
                Ok(socket) => {
                    let connection_id = Uuid::new_v4();
                    self.run_connection(socket)
                        .instrument(span!(Level::INFO, "connection", %connection_id))
                        .await;
                }
                Err(e) => warn!("failed to connect: {:#}", e),
            }

            if self.shutdown.wait_timeout(self.config.reconnect_interval).await {
                break;
            }
            debug!("reconnecting");
        }
        debug!("connect loop stopped");
    }

    async fn run_connection(&self, socket: Box<dyn RpcIo>) {
        let processor = ClientStreamProcessor::new(self.config.clone());
        let connection = processor.connection();

        info!("connected");
        self.current.send_replace(Some(connection.clone()));

        let run = processor.run(socket);
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => {}
            _ = self.shutdown.stopped() => {
                connection.stop();
                run.await;
            }
        }

        self.current.send_replace(None);
        info!("connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;
    use crate::client::connector::MockStreamConnector;
    use crate::dispatch::method::RpcMethod;
    use crate::dispatch::param::ParamType;
    use crate::server::stream_processor::ServerStreamProcessor;

    fn interface() -> Arc<RpcInterface> {
        Arc::new(RpcInterface::new("test", vec![
            RpcMethod::new("negate")
                .request("value", ParamType::Uint32)
                .response("result", ParamType::Int32)
                .handler_fn(|data| {
                    let value = data.request("value")?.as_u32().unwrap_or_default();
                    data.set_response("result", -(value as i32))
                }),
        ]).unwrap())
    }

    fn config() -> RpcConfig {
        RpcConfig {
            reconnect_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    /// returns the client side of a connection that is served by a [ServerStreamProcessor]
    fn serve() -> DuplexStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let processor = ServerStreamProcessor::new(interface(), Arc::new(config()));
        tokio::spawn(processor.run(server));
        client
    }

    fn connector(sockets: Vec<anyhow::Result<DuplexStream>>) -> (MockStreamConnector, Arc<AtomicUsize>) {
        let num_calls = Arc::new(AtomicUsize::new(0));
        let mut sockets: VecDeque<_> = sockets.into();

        let mut connector = MockStreamConnector::new();
        let counter = num_calls.clone();
        connector.expect_connect()
            .returning(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                match sockets.pop_front() {
                    Some(Ok(socket)) => Ok(Box::new(socket) as Box<dyn RpcIo>),
                    Some(Err(e)) => Err(e),
                    None => Err(anyhow!("connection refused")),
                }
            });
        (connector, num_calls)
    }

    async fn negate(client: &RpcClient, value: u32) -> anyhow::Result<i32> {
        let mut data = client.new_request("negate")?;
        data.set_request("value", value)?;
        let data = client.invoke_rpc(data).await?;
        Ok(data.response("result")?.as_i32().unwrap_or_default())
    }

    #[tokio::test]
    async fn test_invoke_rpc() {
        let (connector, num_calls) = connector(vec![Ok(serve())]);
        let client = RpcClient::start(connector, interface(), config()).unwrap();

        assert!(client.wait_connected(Duration::from_secs(5)).await);
        assert_eq!(negate(&client, 42).await.unwrap(), -42);
        assert_eq!(negate(&client, 7).await.unwrap(), -7);
        assert_eq!(client.num_active_calls(), 0);

        client.shutdown().await;
        assert!(!client.is_connected());
        assert_eq!(num_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_calls() {
        let (connector, _) = connector(vec![Ok(serve())]);
        let client = Arc::new(RpcClient::start(connector, interface(), config()).unwrap());
        assert!(client.wait_connected(Duration::from_secs(5)).await);

        let calls: Vec<_> = (0..50u32)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move { negate(&client, i).await })
            })
            .collect();
        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap().unwrap(), -(i as i32));
        }

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_not_connected() {
        let (connector, num_calls) = connector(vec![]);
        let client = RpcClient::start(connector, interface(), config()).unwrap();

        assert!(!client.wait_connected(Duration::from_millis(50)).await);
        let result = negate(&client, 1).await;
        assert!(result.unwrap_err().to_string().contains("not connected"));
        assert!(num_calls.load(Ordering::SeqCst) >= 2);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_loss() {
        let (lost, peer) = tokio::io::duplex(1024);
        drop(peer);
        let (connector, num_calls) = connector(vec![
            Err(anyhow!("connection refused")),
            Ok(lost),
            Ok(serve()),
        ]);
        let client = RpcClient::start(connector, interface(), config()).unwrap();

        let mut result = Err(anyhow!("no call"));
        for _ in 0..200 {
            result = negate(&client, 5).await;
            if result.is_ok() {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(result.unwrap(), -5);
        assert_eq!(num_calls.load(Ordering::SeqCst), 3);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (connector, _) = connector(vec![Ok(serve())]);
        let client = RpcClient::start(connector, interface(), config()).unwrap();
        assert!(client.wait_connected(Duration::from_secs(5)).await);

        time::timeout(Duration::from_secs(1), client.shutdown()).await
            .expect("shutdown should not wait for timeouts");
        assert!(!client.is_connected());
        assert!(negate(&client, 1).await.is_err());
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let config = RpcConfig {
            reader_queue_size: 1,
            ..Default::default()
        };
        let connector = MockStreamConnector::new();
        assert!(RpcClient::start(connector, interface(), config).is_err());
    }
}
