use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use muxrpc::client::connector::TcpConnector;
use muxrpc::client::rpc_client::RpcClient;
use muxrpc::config::RpcConfig;
use muxrpc::dispatch::interface::RpcInterface;
use muxrpc::dispatch::method::RpcMethod;
use muxrpc::dispatch::param::ParamType;
use muxrpc::server::rpc_server::RpcServer;
use tokio::time;
use tracing::Level;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

fn interface() -> Arc<RpcInterface> {
    Arc::new(RpcInterface::new("integration", vec![
        RpcMethod::new("zero"),
        RpcMethod::new("one"),
        RpcMethod::new("two"),
        RpcMethod::new("negate")
            .request("value", ParamType::Uint32)
            .response("result", ParamType::Int32)
            .handler_fn(|data| {
                let value = data.request("value")?.as_u32().unwrap_or_default();
                data.set_response("result", -(value as i32))
            }),
        RpcMethod::new("echo")
            .request("data", ParamType::Blob)
            .response("data", ParamType::Blob)
            .handler_fn(|data| {
                let payload = data.request("data")?.clone();
                data.set_response("data", payload)
            }),
    ]).unwrap())
}

fn config() -> RpcConfig {
    RpcConfig {
        reconnect_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

async fn start_server(addr: SocketAddr, config: RpcConfig) -> RpcServer {
    RpcServer::bind(addr, interface(), config).await.unwrap()
}

async fn start_client(addr: SocketAddr) -> RpcClient {
    let client = RpcClient::start(TcpConnector::new(addr), interface(), config()).unwrap();
    assert!(client.wait_connected(Duration::from_secs(5)).await);
    client
}

async fn negate(client: &RpcClient, value: u32) -> anyhow::Result<i32> {
    let mut data = client.new_request("negate")?;
    data.set_request("value", value)?;
    let data = client.invoke_rpc(data).await?;
    Ok(data.response("result")?.as_i32().unwrap_or_default())
}

async fn echo(client: &RpcClient, payload: Vec<u8>) -> anyhow::Result<Vec<u8>> {
    let mut data = client.new_request("echo")?;
    data.set_request("data", payload)?;
    let data = client.invoke_rpc(data).await?;
    Ok(data.response("data")?.as_blob().unwrap_or_default().to_vec())
}

#[tokio::test]
async fn test_call_over_tcp() {
    init_logging();
    let server = start_server("127.0.0.1:0".parse().unwrap(), config()).await;
    let client = start_client(server.local_addr()).await;

    assert_eq!(negate(&client, 42).await.unwrap(), -42);
    assert_eq!(echo(&client, b"abc".to_vec()).await.unwrap(), b"abc");
    assert_eq!(echo(&client, vec![]).await.unwrap(), Vec::<u8>::new());

    client.shutdown().await;
    server.shutdown().await;
    assert_eq!(server.num_connections(), 0);
}

#[tokio::test]
async fn test_concurrent_large_calls() {
    init_logging();
    let server = start_server("127.0.0.1:0".parse().unwrap(), config()).await;
    let client = Arc::new(start_client(server.local_addr()).await);

    let calls: Vec<_> = (0..20usize)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let payload: Vec<u8> = (0..i * 5000).map(|n| (n % 251) as u8).collect();
                let echoed = echo(&client, payload.clone()).await.unwrap();
                assert_eq!(echoed, payload);
                assert_eq!(negate(&client, i as u32).await.unwrap(), -(i as i32));
            })
        })
        .collect();
    for call in calls {
        call.await.unwrap();
    }

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_client_reconnects_after_server_restart() {
    init_logging();
    let server = start_server("127.0.0.1:0".parse().unwrap(), config()).await;
    let addr = server.local_addr();
    let client = start_client(addr).await;
    assert_eq!(negate(&client, 1).await.unwrap(), -1);

    server.shutdown().await;
    drop(server);
    let mut disconnected = false;
    for _ in 0..100 {
        if !client.is_connected() {
            disconnected = true;
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    assert!(disconnected);
    assert!(negate(&client, 2).await.is_err());

    let server = start_server(addr, config()).await;
    assert!(client.wait_connected(Duration::from_secs(5)).await);
    assert_eq!(negate(&client, 3).await.unwrap(), -3);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_server_refuses_connections_beyond_limit() {
    init_logging();
    let server_config = RpcConfig {
        max_connections: 1,
        ..config()
    };
    let server = start_server("127.0.0.1:0".parse().unwrap(), server_config).await;
    let first = start_client(server.local_addr()).await;
    assert_eq!(negate(&first, 1).await.unwrap(), -1);

    let second = RpcClient::start(TcpConnector::new(server.local_addr()), interface(), config()).unwrap();
    for _ in 0..10 {
        assert!(negate(&second, 2).await.is_err());
        time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.num_connections(), 1);
    assert_eq!(negate(&first, 3).await.unwrap(), -3);

    second.shutdown().await;
    first.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    init_logging();
    let server = start_server("127.0.0.1:0".parse().unwrap(), config()).await;
    assert!(RpcServer::bind(server.local_addr(), interface(), config()).await.is_err());
    server.shutdown().await;
}
