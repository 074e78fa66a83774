//! Packet channels.
//!
//! A [`Channel`] moves whole [`Packet`]s and owns a small lifecycle state
//! machine (`Created -> Opening -> Opened -> Closing -> Closed`, with
//! `Faulted` reachable on I/O failure). Implementations:
//!
//! - [`BaseChannel`]: the state machine over any [`Transport`]
//! - [`StreamChannel`]: a `BaseChannel` over a framed byte stream
//! - [`QueueChannel`]: serializes concurrent sends on a wrapped channel
//! - [`RestorableChannel`]: reconnects through a list of factories

mod base;
mod queue;
mod restorable;
mod state;
mod stream;

pub use base::BaseChannel;
pub use queue::QueueChannel;
pub use restorable::{channel_factory, tcp_factory, ChannelFactory, RestorableChannel};
pub use state::{BoundSlot, ChannelEvent, ChannelState, StateMachine};
pub use stream::{StreamChannel, StreamTransport, TcpChannel};

use crate::error::Result;
use crate::packet::Packet;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Channel: Send + Sync {
    fn state(&self) -> ChannelState;

    /// Lifecycle events raised after this call.
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;

    async fn open(&self, ct: &CancellationToken) -> Result<()>;

    async fn close(&self, ct: &CancellationToken) -> Result<()>;

    /// Send one packet. Fails with `InvalidState` unless the channel is open.
    async fn send(&self, packet: Packet, ct: &CancellationToken) -> Result<()>;

    /// Receive the next packet. Fails with `InvalidState` unless the channel is open.
    async fn receive(&self, ct: &CancellationToken) -> Result<Packet>;

    /// Object associated with this channel by its owner.
    fn bound_object(&self) -> Option<Arc<dyn Any + Send + Sync>>;

    fn set_bound_object(&self, value: Option<Arc<dyn Any + Send + Sync>>);
}

/// The I/O underneath a [`BaseChannel`].
///
/// Implementations do not track lifecycle state; the channel does.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, ct: &CancellationToken) -> Result<()>;

    async fn disconnect(&self, ct: &CancellationToken) -> Result<()>;

    async fn write_packet(&self, packet: &Packet, ct: &CancellationToken) -> Result<()>;

    async fn read_packet(&self, ct: &CancellationToken) -> Result<Packet>;
}
