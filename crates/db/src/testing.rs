//! Scripted remote store for exercising retry, pooling and batching without a
//! network. Wraps [`InMemoryStore`] and injects failures or stalls on demand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use bizdesk_core::errors::RemoteError;
use bizdesk_core::query::{Query, Row, WriteOp};
use bizdesk_core::scope::Scope;

use crate::remote::{InMemoryStore, RemoteSession, RemoteStore};

type WriteRule = Box<dyn Fn(&WriteOp) -> Option<RemoteError> + Send + Sync>;

#[derive(Default)]
struct Script {
    connect_failures: Mutex<VecDeque<RemoteError>>,
    select_failures: Mutex<VecDeque<RemoteError>>,
    write_failures: Mutex<VecDeque<RemoteError>>,
    lost_responses: Mutex<VecDeque<RemoteError>>,
    ping_failures: Mutex<VecDeque<RemoteError>>,
    write_rule: Mutex<Option<WriteRule>>,
    select_gate: Mutex<Option<Arc<Semaphore>>>,
    connects: AtomicUsize,
    selects: AtomicUsize,
    writes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedStore {
    inner: InMemoryStore,
    script: Arc<Script>,
}

impl ScriptedStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn memory(&self) -> &InMemoryStore {
        &self.inner
    }

    pub(crate) fn fail_next_connect(&self, error: RemoteError) {
        self.script.connect_failures.lock().expect("script lock").push_back(error);
    }

    pub(crate) fn fail_next_selects(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.script.select_failures.lock().expect("script lock").extend(errors);
    }

    pub(crate) fn fail_next_writes(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.script.write_failures.lock().expect("script lock").extend(errors);
    }

    /// Applies the next writes, then reports these errors as if the reply
    /// never arrived.
    pub(crate) fn lose_next_write_responses(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.script.lost_responses.lock().expect("script lock").extend(errors);
    }

    pub(crate) fn fail_next_ping(&self, error: RemoteError) {
        self.script.ping_failures.lock().expect("script lock").push_back(error);
    }

    /// Fails every write for which `rule` returns an error.
    pub(crate) fn fail_writes_where(
        &self,
        rule: impl Fn(&WriteOp) -> Option<RemoteError> + Send + Sync + 'static,
    ) {
        *self.script.write_rule.lock().expect("script lock") = Some(Box::new(rule));
    }

    /// Holds every select until a permit is added to the returned semaphore.
    pub(crate) fn gate_selects(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.script.select_gate.lock().expect("script lock") = Some(gate.clone());
        gate
    }

    pub(crate) fn connects(&self) -> usize {
        self.script.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn selects(&self) -> usize {
        self.script.selects.load(Ordering::SeqCst)
    }

    pub(crate) fn writes(&self) -> usize {
        self.script.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.script.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.script.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for ScriptedStore {
    async fn connect(&self, scope: &Scope) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.script.connect_failures.lock().expect("script lock").pop_front()
        {
            return Err(error);
        }
        let inner = self.inner.connect(scope).await?;
        Ok(Arc::new(ScriptedSession { inner, script: self.script.clone() }))
    }
}

struct ScriptedSession {
    inner: Arc<dyn RemoteSession>,
    script: Arc<Script>,
}

struct InFlight<'a>(&'a Script);

impl<'a> InFlight<'a> {
    fn enter(script: &'a Script) -> Self {
        let now = script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        script.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(script)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, RemoteError> {
        self.script.selects.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.script);
        let gate = self.script.select_gate.lock().expect("script lock").clone();
        if let Some(gate) = gate {
            let permit = gate.acquire().await.expect("gate open");
            permit.forget();
        }
        if let Some(error) = self.script.select_failures.lock().expect("script lock").pop_front() {
            return Err(error);
        }
        self.inner.select(query).await
    }

    async fn write(&self, op: &WriteOp) -> Result<Vec<Row>, RemoteError> {
        self.script.writes.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.script);
        if let Some(error) = self.script.write_failures.lock().expect("script lock").pop_front() {
            return Err(error);
        }
        let ruled = self.script.write_rule.lock().expect("script lock").as_ref().and_then(|rule| rule(op));
        if let Some(error) = ruled {
            return Err(error);
        }
        let written = self.inner.write(op).await?;
        if let Some(error) = self.script.lost_responses.lock().expect("script lock").pop_front() {
            return Err(error);
        }
        Ok(written)
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        if let Some(error) = self.script.ping_failures.lock().expect("script lock").pop_front() {
            return Err(error);
        }
        self.inner.ping().await
    }
}
