//! Shared fixtures for the integration tests: a small `test.Tally` service
//! and helpers that connect client sessions to a host over in-memory pipes.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use farcall::codec;
use farcall::{
    CallTarget, Channel, EventEmitter, EventId, EventSubscription, HandlerOptions, Interface, MethodId,
    MethodOutcome, PropertyId, Proxy, Result, RpcError, ServiceHost, Session, SessionRef, ShareWithin,
    StreamChannel,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::duplex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const ADD: MethodId = 0;
pub const TOTAL: PropertyId = 0;
pub const CHANGED: EventId = 0;

pub struct Tally;

impl Interface for Tally {
    const NAME: &'static str = "test.Tally";
    type Proxy = TallyProxy;
}

/// State behind one `Tally` instance, visible to the test after the host
/// took ownership of the adapter.
#[derive(Default)]
pub struct TallyState {
    total: Mutex<i64>,
    pub events: EventEmitter,
    disposals: AtomicUsize,
    sessions: Mutex<Vec<Uuid>>,
}

impl TallyState {
    pub fn total(&self) -> i64 {
        *self.total.lock().unwrap()
    }

    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    /// Ids of the sessions currently holding this instance.
    pub fn sessions(&self) -> Vec<Uuid> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn raise_changed(&self, value: i64) {
        self.events
            .event_triggered(CHANGED, &[codec::encode(&value).unwrap()]);
    }
}

/// Records every `TallyState` a factory creates.
#[derive(Default, Clone)]
pub struct Tracker {
    created: Arc<Mutex<Vec<Arc<TallyState>>>>,
}

impl Tracker {
    pub fn factory(&self) -> impl Fn() -> Result<TallyAdapter> + Send + Sync + 'static {
        let created = self.created.clone();
        move || {
            let state = Arc::new(TallyState::default());
            created.lock().unwrap().push(state.clone());
            Ok(TallyAdapter { state })
        }
    }

    pub fn created(&self) -> Vec<Arc<TallyState>> {
        self.created.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn disposals(&self) -> usize {
        self.created().iter().map(|state| state.disposals()).sum()
    }
}

pub struct TallyAdapter {
    state: Arc<TallyState>,
}

#[async_trait]
impl CallTarget for TallyAdapter {
    async fn invoke_method(
        &self,
        method_id: MethodId,
        args: Vec<Bytes>,
        _one_way: bool,
        _ct: &CancellationToken,
    ) -> Result<MethodOutcome> {
        match method_id {
            ADD => {
                let by: i64 = codec::arg(&args, 0)?;
                let total = {
                    let mut total = self.state.total.lock().unwrap();
                    *total += by;
                    *total
                };
                self.state.raise_changed(total);
                Ok(MethodOutcome::value(codec::encode(&total)?))
            }
            other => Err(RpcError::MethodNotFound(other)),
        }
    }

    async fn get_property(&self, property_id: PropertyId, _ct: &CancellationToken) -> Result<Option<Bytes>> {
        match property_id {
            TOTAL => Ok(Some(codec::encode(&self.state.total())?)),
            other => Err(RpcError::PropertyNotFound(other)),
        }
    }

    async fn set_property(
        &self,
        property_id: PropertyId,
        _value: Option<Bytes>,
        _ct: &CancellationToken,
    ) -> Result<()> {
        Err(RpcError::PropertyNotFound(property_id))
    }

    async fn attach_event(&self, event_id: EventId, _ct: &CancellationToken) -> Result<()> {
        match event_id {
            CHANGED => Ok(()),
            other => Err(RpcError::EventNotFound(other)),
        }
    }

    async fn detach_event(&self, event_id: EventId, _ct: &CancellationToken) -> Result<()> {
        match event_id {
            CHANGED => Ok(()),
            other => Err(RpcError::EventNotFound(other)),
        }
    }

    fn event_emitter(&self) -> Option<&EventEmitter> {
        Some(&self.state.events)
    }

    fn attach_session(&self, session: &SessionRef) {
        self.state.sessions.lock().unwrap().push(session.id());
    }

    fn detach_session(&self, session: &SessionRef) {
        self.state.sessions.lock().unwrap().retain(|id| *id != session.id());
    }

    fn dispose(&self) {
        self.state.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyProxy {
    proxy: Proxy,
}

impl From<Proxy> for TallyProxy {
    fn from(proxy: Proxy) -> Self {
        Self { proxy }
    }
}

impl TallyProxy {
    pub fn instance_id(&self) -> Uuid {
        self.proxy.instance_id()
    }

    pub async fn add(&self, by: i64, ct: &CancellationToken) -> Result<i64> {
        self.proxy.call(ADD, vec![codec::encode(&by)?], ct).await
    }

    pub async fn total(&self, ct: &CancellationToken) -> Result<i64> {
        let value = self.proxy.get_property(TOTAL, ct).await?;
        codec::decode_or_default(value.as_ref())
    }

    pub async fn on_changed(&self, seen: Arc<Mutex<Vec<i64>>>, ct: &CancellationToken) -> Result<EventSubscription> {
        self.proxy
            .subscribe(
                CHANGED,
                move |args: &[Bytes]| seen.lock().unwrap().push(codec::arg(args, 0).unwrap()),
                ct,
            )
            .await
    }

    pub async fn unsubscribe(&self, subscription: EventSubscription, ct: &CancellationToken) -> Result<()> {
        self.proxy.unsubscribe(subscription, ct).await
    }
}

pub fn host_with(share: ShareWithin, tracker: &Tracker) -> ServiceHost {
    let host = ServiceHost::with_runtime(farcall::RpcRuntime::new());
    host.register_service::<Tally, _, _>(share, tracker.factory())
        .unwrap();
    host
}

/// A client session connected to `host` over a duplex pipe, plus the
/// server-side session the host created for it.
pub async fn connect(host: &ServiceHost) -> (Session, Session) {
    let (a, b) = duplex(64 * 1024);
    let client_channel: Arc<dyn Channel> = Arc::new(StreamChannel::from_stream(a));
    let client = Session::client(client_channel.clone(), HandlerOptions::default());
    client_channel
        .open(&CancellationToken::new())
        .await
        .unwrap();
    let server = host
        .accept(Arc::new(StreamChannel::from_stream(b)))
        .await
        .unwrap();
    (client, server)
}

pub async fn tally(session: &Session) -> TallyProxy {
    TallyProxy::from(
        session
            .acquire_remote(Tally::interface_id(), &CancellationToken::new())
            .await
            .unwrap(),
    )
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
