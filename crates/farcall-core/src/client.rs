//! Client end: a restorable channel plus the session riding on it.

use crate::channel::{tcp_factory, Channel, ChannelFactory, ChannelState, RestorableChannel};
use crate::config::ClientOptions;
use crate::error::Result;
use crate::interface::Interface;
use crate::session::Session;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Connects to a service host and hands out typed proxies.
///
/// The session outlives reconnects: after the channel is restored, proxies
/// keep their instance ids, and calls on ids the new server session does
/// not know fail with `InstanceNotFound`.
pub struct RpcClient {
    channel: Arc<RestorableChannel>,
    session: Session,
}

impl RpcClient {
    /// Client over `factories`, tried in order on every (re)connect.
    pub fn new(factories: Vec<ChannelFactory>, options: ClientOptions) -> Self {
        let channel = Arc::new(RestorableChannel::new(factories, options.restorable));
        let session = Session::client(channel.clone(), options.handler);
        Self { channel, session }
    }

    pub fn connect_tcp(addr: impl Into<String>, options: ClientOptions) -> Self {
        Self::new(vec![tcp_factory(addr)], options)
    }

    pub async fn open(&self, ct: &CancellationToken) -> Result<()> {
        self.channel.open(ct).await
    }

    pub async fn close(&self, ct: &CancellationToken) -> Result<()> {
        self.channel.close(ct).await
    }

    /// Acquire an instance of `I` from the host.
    pub async fn get_service<I: Interface>(&self, ct: &CancellationToken) -> Result<I::Proxy> {
        let proxy = self.session.acquire_remote(I::interface_id(), ct).await?;
        Ok(I::Proxy::from(proxy))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn channel(&self) -> &Arc<RestorableChannel> {
        &self.channel
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("state", &self.state())
            .field("session", &self.session.id())
            .finish()
    }
}
