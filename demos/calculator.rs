use clap::Parser;
use clap_derive::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail};
use muxrpc::client::connector::TcpConnector;
use muxrpc::client::rpc_client::RpcClient;
use muxrpc::config::RpcConfig;
use muxrpc::dispatch::interface::RpcInterface;
use muxrpc::dispatch::method::RpcMethod;
use muxrpc::dispatch::param::ParamType;
use muxrpc::server::rpc_server::RpcServer;
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Serves the calculator interface until Ctrl-C is pressed
    Server {
        addr: String,
    },
    /// Calls all methods of a calculator server once
    Client {
        addr: String,
        a: u32,
        b: u32,
    },
}

fn calculator_interface() -> anyhow::Result<RpcInterface> {
    RpcInterface::new("calculator", vec![
        RpcMethod::new("add")
            .request("a", ParamType::Uint32)
            .request("b", ParamType::Uint32)
            .response("sum", ParamType::Uint64)
            .handler_fn(|data| {
                let a = data.request("a")?.as_u32().ok_or_else(|| anyhow!("a is not a uint32"))?;
                let b = data.request("b")?.as_u32().ok_or_else(|| anyhow!("b is not a uint32"))?;
                data.set_response("sum", a as u64 + b as u64)
            }),
        RpcMethod::new("echo")
            .request("data", ParamType::Blob)
            .response("data", ParamType::Blob)
            .handler_fn(|data| {
                let payload = data.request("data")?.clone();
                data.set_response("data", payload)
            }),
        RpcMethod::new("greet")
            .request("name", ParamType::String)
            .response("greeting", ParamType::String)
            .handler_fn(|data| {
                let greeting = format!("Hello, {}!", data.request("name")?.as_str().unwrap_or_default());
                data.set_response("greeting", greeting)
            }),
    ])
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let interface = Arc::new(calculator_interface()?);

    match args.command {
        Command::Server { addr } => {
            let server = RpcServer::bind(addr, interface, RpcConfig::default()).await?;
            tokio::signal::ctrl_c().await?;
            server.shutdown().await;
        }
        Command::Client { addr, a, b } => {
            let addr: SocketAddr = addr.parse()?;
            let client = RpcClient::start(TcpConnector::new(addr), interface, RpcConfig::default())?;
            if !client.wait_connected(Duration::from_secs(5)).await {
                bail!("could not connect to {}", addr);
            }

            let mut data = client.new_request("add")?;
            data.set_request("a", a)?;
            data.set_request("b", b)?;
            let data = client.invoke_rpc(data).await?;
            info!("{} + {} = {:?}", a, b, data.response("sum")?.as_u64());

            let mut data = client.new_request("echo")?;
            data.set_request("data", vec![7u8; 10_000])?;
            let data = client.invoke_rpc(data).await?;
            info!("echoed {} bytes", data.response("data")?.as_blob().map(|b| b.len()).unwrap_or_default());

            let mut data = client.new_request("greet")?;
            data.set_request("name", "calculator")?;
            let data = client.invoke_rpc(data).await?;
            info!("{}", data.response("greeting")?.as_str().unwrap_or_default());

            client.shutdown().await;
        }
    }
    Ok(())
}
