//! The channel lifecycle over an arbitrary [`Transport`].

use super::state::{BoundSlot, ChannelEvent, ChannelState, StateMachine};
use super::{Channel, Transport};
use crate::error::{Result, RpcError};
use crate::packet::Packet;
use async_trait::async_trait;
use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ChannelState::*;

/// State machine wrapper that turns a [`Transport`] into a [`Channel`].
///
/// - `open` is only valid from `Created`; a channel that closed or faulted
///   stays that way and must be replaced.
/// - Transport failures while `Opened` move the channel to `Faulted`.
///   Framing and decode failures fail the single call and leave it open.
/// - `close` during `Opening` cancels the connect and waits for it to unwind.
pub struct BaseChannel<T: Transport> {
    transport: T,
    machine: StateMachine,
    open_token: Mutex<Option<CancellationToken>>,
    bound: BoundSlot,
}

impl<T: Transport> BaseChannel<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            machine: StateMachine::new(),
            open_token: Mutex::new(None),
            bound: BoundSlot::default(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn set_open_token(&self, token: Option<CancellationToken>) {
        *self
            .open_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn cancel_open(&self) {
        if let Some(token) = self
            .open_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            token.cancel();
        }
    }

    fn ensure_opened(&self, operation: &'static str) -> Result<()> {
        match self.machine.state() {
            Opened => Ok(()),
            state => Err(RpcError::InvalidState { operation, state }),
        }
    }

    fn fault(&self, err: &RpcError) {
        if self.machine.transition(&[Opened], Faulted) {
            warn!("Channel faulted: {}", err);
        }
    }

    /// Unwind an open that `close` interrupted.
    async fn close_interrupted_open(&self) {
        if self.machine.transition(&[Opening], Closing) {
            if let Err(e) = self.transport.disconnect(&CancellationToken::new()).await {
                debug!("Disconnect after interrupted open failed: {}", e);
            }
            self.machine.transition(&[Closing], Closed);
        }
    }
}

#[async_trait]
impl<T: Transport> Channel for BaseChannel<T> {
    fn state(&self) -> ChannelState {
        self.machine.state()
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.machine.subscribe()
    }

    async fn open(&self, ct: &CancellationToken) -> Result<()> {
        let open_ct = ct.child_token();
        {
            // Entering Opening and publishing the token under one lock means a
            // close that observes Opening always finds the token to cancel.
            let mut slot = self
                .open_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.machine.transition(&[Created], Opening) {
                drop(slot);
                return match self.machine.state() {
                    Opening | Opened => Ok(()),
                    state => Err(RpcError::InvalidState {
                        operation: "open",
                        state,
                    }),
                };
            }
            *slot = Some(open_ct.clone());
        }

        let result = tokio::select! {
            result = self.transport.connect(&open_ct) => result,
            _ = open_ct.cancelled() => Err(RpcError::Cancelled),
        };

        let closed_by_us = open_ct.is_cancelled() && !ct.is_cancelled();
        let outcome = if closed_by_us {
            debug!("Open interrupted by close");
            self.close_interrupted_open().await;
            Err(RpcError::Cancelled)
        } else {
            match result {
                Ok(()) => {
                    self.machine.transition(&[Opening], Opened);
                    Ok(())
                }
                Err(err) => {
                    debug!("Open failed: {}", err);
                    self.machine.transition(&[Opening], Faulted);
                    Err(err)
                }
            }
        };
        self.set_open_token(None);
        outcome
    }

    async fn close(&self, ct: &CancellationToken) -> Result<()> {
        loop {
            match self.machine.state() {
                Closed | Faulted => return Ok(()),
                Created => {
                    if self.machine.transition(&[Created], Closing) {
                        self.machine.transition(&[Closing], Closed);
                        return Ok(());
                    }
                }
                Opening => {
                    self.cancel_open();
                    tokio::select! {
                        _ = self.machine.wait_for(|s| s != Opening) => {}
                        _ = ct.cancelled() => return Err(RpcError::Cancelled),
                    }
                }
                Closing => {
                    tokio::select! {
                        _ = self.machine.wait_for(|s| s != Closing) => {}
                        _ = ct.cancelled() => return Err(RpcError::Cancelled),
                    }
                }
                Opened => {
                    if !self.machine.transition(&[Opened], Closing) {
                        continue;
                    }
                    return match self.transport.disconnect(ct).await {
                        Ok(()) => {
                            self.machine.transition(&[Closing], Closed);
                            Ok(())
                        }
                        Err(err) => {
                            warn!("Close failed: {}", err);
                            self.machine.transition(&[Closing], Faulted);
                            Err(err)
                        }
                    };
                }
            }
        }
    }

    async fn send(&self, packet: Packet, ct: &CancellationToken) -> Result<()> {
        self.ensure_opened("send")?;
        match self.transport.write_packet(&packet, ct).await {
            Err(err) if err.is_transport() => {
                self.fault(&err);
                Err(err)
            }
            other => other,
        }
    }

    async fn receive(&self, ct: &CancellationToken) -> Result<Packet> {
        self.ensure_opened("receive")?;
        match self.transport.read_packet(ct).await {
            Err(err) if err.is_transport() => {
                self.fault(&err);
                Err(err)
            }
            other => other,
        }
    }

    fn bound_object(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.bound.get()
    }

    fn set_bound_object(&self, value: Option<Arc<dyn Any + Send + Sync>>) {
        self.bound.set(value);
    }
}
