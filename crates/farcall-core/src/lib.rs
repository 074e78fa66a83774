//! farcall - remote object runtime.
//!
//! Services implemented in one process are called from another through
//! typed proxies. The layers, bottom up:
//!
//! - [`protocol`]: CRC-checked framing of byte payloads
//! - [`channel`]: packet channels with a lifecycle state machine, including
//!   a reconnecting [`RestorableChannel`]
//! - [`handler`]: request/response correlation, cancellation and timeouts
//! - [`session`]: per-connection instance registries and event forwarding
//! - [`host`] / [`client`]: the two ends a program actually uses
//!
//! # Example
//!
//! ```rust,ignore
//! use farcall::{RpcClient, ClientOptions, ServiceHost, ShareWithin};
//!
//! #[tokio::main]
//! async fn main() -> farcall::Result<()> {
//!     let host = ServiceHost::new();
//!     host.register_service::<Calculator, _, _>(ShareWithin::Session, || Ok(CalculatorAdapter::default()))?;
//!     let addr = host.start("127.0.0.1:0").await?;
//!
//!     let ct = farcall::CancellationToken::new();
//!     let client = RpcClient::connect_tcp(addr.to_string(), ClientOptions::default());
//!     client.open(&ct).await?;
//!     let calculator = client.get_service::<Calculator>(&ct).await?;
//!     println!("3 + 5 = {}", calculator.add(3, 5, &ct).await?);
//!     Ok(())
//! }
//! ```

pub mod call_target;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod host;
pub mod interface;
pub mod packet;
pub mod protocol;
pub mod proxy;
pub mod refcount;
pub mod registry;
pub mod rpc_packet;
pub mod runtime;
pub mod session;

// Re-export commonly used types
pub use call_target::{CallTarget, EventEmitter, EventListener, ListenerId, MethodOutcome};
pub use channel::{
    channel_factory, tcp_factory, BaseChannel, Channel, ChannelEvent, ChannelFactory, ChannelState,
    QueueChannel, RestorableChannel, StreamChannel, StreamTransport, TcpChannel, Transport,
};
pub use client::RpcClient;
pub use config::{ClientOptions, HandlerOptions, RestorableOptions};
pub use error::{ErrorCode, FramingError, RemoteException, Result, RpcError};
pub use events::{EventContext, EventContextGuard};
pub use handler::RpcHandler;
pub use host::ServiceHost;
pub use interface::{Interface, InterfaceId};
pub use packet::Packet;
pub use protocol::FramingProtocol;
pub use proxy::{EventSubscription, Proxy, RemoteInstance};
pub use refcount::RefCounter;
pub use registry::{ShareWithin, SharedTarget};
pub use rpc_packet::{EventId, MethodId, PacketKind, PropertyId, RpcPacket};
pub use runtime::RpcRuntime;
pub use session::{Session, SessionRef};

pub use tokio_util::sync::CancellationToken;
