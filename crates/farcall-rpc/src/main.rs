//! farcall RPC demo - hosts or calls the `demo.Calculator` service over TCP.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use farcall::{ClientOptions, RpcClient, ServiceHost, ShareWithin};
use farcall_rpc::{Calculator, CalculatorAdapter};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "farcall-rpc")]
#[command(about = "Demo host and client for the farcall remoting runtime")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the Calculator service until Ctrl-C
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// How widely one Calculator instance is shared
        #[arg(long, value_enum, default_value = "session")]
        share: Share,
    },
    /// Call a running Calculator service and print the result
    Call {
        /// Address of the service host
        #[arg(long)]
        addr: String,

        #[arg(long, value_enum, default_value = "add")]
        op: Op,

        #[arg(allow_hyphen_values = true)]
        a: i64,

        #[arg(allow_hyphen_values = true)]
        b: i64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Share {
    None,
    Session,
    Host,
    Process,
}

impl From<Share> for ShareWithin {
    fn from(share: Share) -> Self {
        match share {
            Share::None => ShareWithin::None,
            Share::Session => ShareWithin::Session,
            Share::Host => ShareWithin::Host,
            Share::Process => ShareWithin::Process,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Op {
    Add,
    Divide,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the port and call results
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Serve { port, host, share } => serve(&host, port, share.into()).await,
        Command::Call { addr, op, a, b } => call(addr, op, a, b).await,
    }
}

async fn serve(bind_host: &str, port: u16, share: ShareWithin) -> Result<()> {
    info!("Starting farcall RPC demo host");

    let host = ServiceHost::new();
    host.register_service::<Calculator, _, _>(share, || Ok(CalculatorAdapter::default()))?;
    let addr = host.start(&format!("{}:{}", bind_host, port)).await?;

    // Machine-readable port for whoever launched us
    println!("RPC_PORT={}", addr.port());

    info!("Calculator service running on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    host.stop().await;

    Ok(())
}

async fn call(addr: String, op: Op, a: i64, b: i64) -> Result<()> {
    let ct = CancellationToken::new();
    let client = RpcClient::connect_tcp(addr, ClientOptions::new().with_auto_reopen(false));
    client.open(&ct).await?;

    let calculator = client.get_service::<Calculator>(&ct).await?;
    let result = match op {
        Op::Add => calculator.add(a, b, &ct).await?,
        Op::Divide => calculator.divide(a, b, &ct).await?,
    };
    println!("{}", result);

    drop(calculator);
    client.close(&ct).await?;
    Ok(())
}
