//! The `demo.Calculator` service.
//!
//! [`CalculatorAdapter`] and [`CalculatorProxy`] are what an interface
//! generator would emit for:
//!
//! ```text
//! interface Calculator {
//!     i64 Add(i64 a, i64 b);
//!     i64 Divide(i64 a, i64 b);
//!     i64 LastResult { get; set; }
//!     event Computed(i64 result);
//! }
//! ```
//!
//! Ids follow declaration order within each member kind.

use async_trait::async_trait;
use bytes::Bytes;
use farcall::codec;
use farcall::{
    CallTarget, EventEmitter, EventId, EventSubscription, Interface, MethodId, MethodOutcome, PropertyId, Proxy,
    RemoteException, Result, RpcError,
};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const ADD: MethodId = 0;
pub const DIVIDE: MethodId = 1;
pub const LAST_RESULT: PropertyId = 0;
pub const COMPUTED: EventId = 0;

/// Interface marker.
pub struct Calculator;

impl Interface for Calculator {
    const NAME: &'static str = "demo.Calculator";
    type Proxy = CalculatorProxy;
}

/// Server-side implementation.
#[derive(Default)]
pub struct CalculatorAdapter {
    last_result: AtomicI64,
    listeners: AtomicUsize,
    events: EventEmitter,
}

impl CalculatorAdapter {
    pub fn add(&self, a: i64, b: i64) -> i64 {
        self.computed(a.wrapping_add(b))
    }

    pub fn divide(&self, a: i64, b: i64) -> Result<i64> {
        if b == 0 {
            return Err(RemoteException::new("DivideByZero", "attempt to divide by zero").into());
        }
        Ok(self.computed(a.wrapping_div(b)))
    }

    pub fn last_result(&self) -> i64 {
        self.last_result.load(Ordering::SeqCst)
    }

    /// Sessions currently subscribed to `Computed`.
    pub fn listeners(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }

    fn computed(&self, result: i64) -> i64 {
        self.last_result.store(result, Ordering::SeqCst);
        match codec::encode(&result) {
            Ok(arg) => self.events.event_triggered(COMPUTED, &[arg]),
            Err(e) => debug!("Could not encode Computed event: {}", e),
        }
        result
    }
}

#[async_trait]
impl CallTarget for CalculatorAdapter {
    async fn invoke_method(
        &self,
        method_id: MethodId,
        args: Vec<Bytes>,
        _one_way: bool,
        _ct: &CancellationToken,
    ) -> Result<MethodOutcome> {
        let result = match method_id {
            ADD => self.add(codec::arg(&args, 0)?, codec::arg(&args, 1)?),
            DIVIDE => self.divide(codec::arg(&args, 0)?, codec::arg(&args, 1)?)?,
            other => return Err(RpcError::MethodNotFound(other)),
        };
        Ok(MethodOutcome::value(codec::encode(&result)?))
    }

    async fn get_property(&self, property_id: PropertyId, _ct: &CancellationToken) -> Result<Option<Bytes>> {
        match property_id {
            LAST_RESULT => Ok(Some(codec::encode(&self.last_result())?)),
            other => Err(RpcError::PropertyNotFound(other)),
        }
    }

    async fn set_property(
        &self,
        property_id: PropertyId,
        value: Option<Bytes>,
        _ct: &CancellationToken,
    ) -> Result<()> {
        match property_id {
            LAST_RESULT => {
                let value: i64 = codec::decode_or_default(value.as_ref())?;
                self.last_result.store(value, Ordering::SeqCst);
                Ok(())
            }
            other => Err(RpcError::PropertyNotFound(other)),
        }
    }

    async fn attach_event(&self, event_id: EventId, _ct: &CancellationToken) -> Result<()> {
        match event_id {
            COMPUTED => {
                self.listeners.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            other => Err(RpcError::EventNotFound(other)),
        }
    }

    async fn detach_event(&self, event_id: EventId, _ct: &CancellationToken) -> Result<()> {
        match event_id {
            COMPUTED => {
                self.listeners.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            other => Err(RpcError::EventNotFound(other)),
        }
    }

    fn event_emitter(&self) -> Option<&EventEmitter> {
        Some(&self.events)
    }

    fn dispose(&self) {
        debug!("Calculator disposed (last result {})", self.last_result());
    }
}

/// Client-side typed handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculatorProxy {
    proxy: Proxy,
}

impl From<Proxy> for CalculatorProxy {
    fn from(proxy: Proxy) -> Self {
        Self { proxy }
    }
}

impl CalculatorProxy {
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub async fn add(&self, a: i64, b: i64, ct: &CancellationToken) -> Result<i64> {
        self.proxy
            .call(ADD, vec![codec::encode(&a)?, codec::encode(&b)?], ct)
            .await
    }

    pub async fn divide(&self, a: i64, b: i64, ct: &CancellationToken) -> Result<i64> {
        self.proxy
            .call(DIVIDE, vec![codec::encode(&a)?, codec::encode(&b)?], ct)
            .await
    }

    pub async fn last_result(&self, ct: &CancellationToken) -> Result<i64> {
        let value = self.proxy.get_property(LAST_RESULT, ct).await?;
        codec::decode_or_default(value.as_ref())
    }

    pub async fn set_last_result(&self, value: i64, ct: &CancellationToken) -> Result<()> {
        self.proxy
            .set_property(LAST_RESULT, Some(codec::encode(&value)?), ct)
            .await
    }

    /// Subscribe to `Computed`.
    pub async fn on_computed<F>(&self, callback: F, ct: &CancellationToken) -> Result<EventSubscription>
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        self.proxy
            .subscribe(
                COMPUTED,
                move |args: &[Bytes]| match codec::arg::<i64>(args, 0) {
                    Ok(result) => callback(result),
                    Err(e) => debug!("Malformed Computed event: {}", e),
                },
                ct,
            )
            .await
    }

    pub async fn unsubscribe(&self, subscription: EventSubscription, ct: &CancellationToken) -> Result<()> {
        self.proxy.unsubscribe(subscription, ct).await
    }
}
