//! Forwarder registry: the single authority over live port-forwards.
//!
//! [`Forwarders`] maps a [`ForwarderKey`] (pod path + container) to the
//! batch of tunnels started by one operator confirmation. It enforces at
//! most one forwarder per key, owns every tunnel task, and is the only
//! place forwarder state changes.
//!
//! ## Lifecycle
//!
//! A forwarder is admitted as `Pending` once the key and its local
//! endpoints are free, becomes `Active` when every listener is bound and is
//! evicted on stop, on shutdown, or when a tunnel or the liveness monitor
//! reports failure. A failed bind evicts it immediately. The `on_stop`
//! hook runs exactly once for every admitted forwarder, with `None` for a
//! clean stop and the cause otherwise.
//!
//! ## Concurrency
//!
//! The map sits behind an `RwLock`. Queries take the read lock; admission
//! and eviction take the write lock, and admission performs the conflict
//! check and the `Pending` insert in one critical section. Binding and
//! waiting for tasks to exit happen outside the lock. Tunnel tasks never
//! touch the map: they report exits on a channel drained by a reaper task,
//! which evicts only the forwarder generation that produced the report.

pub mod dialer;
pub mod tunnel;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ForwardConfig;
use crate::error::ForwardError;
use crate::port::{PortTunnels, TunnelSpec};
use dialer::PortDialer;
use tunnel::{Tunnel, TunnelExit};

/// Identity a forwarder is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ForwarderKey {
    /// Namespace-qualified pod path, e.g. `default/web-1`.
    pub path: String,
    pub container: String,
}

impl ForwarderKey {
    pub fn new(path: &str, container: &str) -> Self {
        Self {
            path: path.to_string(),
            container: container.to_string(),
        }
    }
}

impl fmt::Display for ForwarderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.path, self.container)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    Pending,
    Active,
    Failed,
}

/// Read-only snapshot of a forwarder, safe to hold across redraws.
#[derive(Debug, Clone, Serialize)]
pub struct ForwarderView {
    pub id: String,
    pub key: ForwarderKey,
    pub tunnels: PortTunnels,
    pub status: ForwardStatus,
    /// Epoch milliseconds when the forwarder was admitted.
    pub started_at: u64,
    #[serde(skip)]
    pub age: Duration,
}

/// Lifecycle notifications for the presentation layer.
#[derive(Debug, Clone)]
pub enum ForwardEvent {
    Started(ForwarderView),
    Stopped(ForwarderKey),
    /// Bind or runtime failure. The view carries `ForwardStatus::Failed`.
    Failed { view: ForwarderView, error: String },
}

pub type StartHook = Box<dyn FnOnce(&ForwarderView) + Send>;
pub type StopHook = Box<dyn FnOnce(&ForwarderKey, Option<&ForwardError>) + Send + Sync>;

/// Callbacks attached to one start request.
#[derive(Default)]
pub struct ForwardHooks {
    on_start: Option<StartHook>,
    on_stop: Option<StopHook>,
}

impl ForwardHooks {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_start(mut self, f: impl FnOnce(&ForwarderView) + Send + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_stop(
        mut self,
        f: impl FnOnce(&ForwarderKey, Option<&ForwardError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_stop = Some(Box::new(f));
        self
    }
}

/// Internal bookkeeping for a forwarder.
struct Entry {
    /// Generation id; exit reports from older generations are ignored.
    id: String,
    tunnels: PortTunnels,
    status: ForwardStatus,
    started_at: u64,
    created: Instant,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<TunnelExit>>,
    /// Closed by a starting forwarder once its bound listeners are released
    /// or handed to tunnel tasks.
    binding: Option<oneshot::Receiver<()>>,
    on_stop: Option<StopHook>,
}

impl Entry {
    fn view(&self, key: &ForwarderKey) -> ForwarderView {
        ForwarderView {
            id: self.id.clone(),
            key: key.clone(),
            tunnels: self.tunnels.clone(),
            status: self.status,
            started_at: self.started_at,
            age: self.created.elapsed(),
        }
    }
}

/// Exit report from a tunnel or monitor task.
struct ExitNotice {
    key: ForwarderKey,
    id: String,
    reason: String,
}

/// Reports a task's exit when dropped, so a task that panics or is aborted
/// still reaches the reaper.
struct ExitReport {
    exits: mpsc::UnboundedSender<ExitNotice>,
    key: ForwarderKey,
    id: String,
    reason: Option<String>,
}

impl ExitReport {
    fn new(inner: &Inner, key: &ForwarderKey, id: &str) -> Self {
        Self {
            exits: inner.exits.clone(),
            key: key.clone(),
            id: id.to_string(),
            reason: Some("forwarding task ended unexpectedly".to_string()),
        }
    }

    fn settle(mut self, exit: &TunnelExit) {
        self.reason = match exit {
            TunnelExit::Closed => None,
            TunnelExit::Failed(reason) => Some(reason.clone()),
        };
    }
}

impl Drop for ExitReport {
    fn drop(&mut self) {
        if let Some(reason) = self.reason.take() {
            let _ = self.exits.send(ExitNotice {
                key: self.key.clone(),
                id: std::mem::take(&mut self.id),
                reason,
            });
        }
    }
}

/// Holds a start between its first bind and the rest of the batch.
#[cfg(test)]
struct BindPause {
    reached: oneshot::Sender<()>,
    resume: oneshot::Receiver<()>,
}

struct Inner {
    entries: RwLock<HashMap<ForwarderKey, Entry>>,
    dialer: Arc<dyn PortDialer>,
    max_forwarders: usize,
    stop_timeout: Duration,
    /// Parent of every forwarder's token; cancelled when the registry drops.
    shutdown: CancellationToken,
    exits: mpsc::UnboundedSender<ExitNotice>,
    events: broadcast::Sender<ForwardEvent>,
    #[cfg(test)]
    bind_pause: std::sync::Mutex<Option<BindPause>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Registry of live port-forwards.
///
/// Cloneable; all clones share the same inner state. Must be created
/// inside a Tokio runtime (it spawns its reaper task).
#[derive(Clone)]
pub struct Forwarders {
    inner: Arc<Inner>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Drain exit reports and evict the failed forwarders.
async fn reap(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<ExitNotice>) {
    while let Some(notice) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        Forwarders { inner }
            .fail(notice.key, &notice.id, notice.reason)
            .await;
    }
    debug!("forwarder reaper exiting");
}

impl Forwarders {
    pub fn new(config: &ForwardConfig, dialer: Arc<dyn PortDialer>) -> Self {
        let (exits, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(Inner {
            entries: RwLock::new(HashMap::new()),
            dialer,
            max_forwarders: config.max_forwarders,
            stop_timeout: config.stop_timeout(),
            shutdown: CancellationToken::new(),
            exits,
            events,
            #[cfg(test)]
            bind_pause: std::sync::Mutex::new(None),
        });
        tokio::spawn(reap(Arc::downgrade(&inner), rx));

        Self { inner }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ForwardEvent> {
        self.inner.events.subscribe()
    }

    /// Whether `container` of `path` currently has a forwarder.
    pub async fn is_forwarded(&self, path: &str, container: &str) -> bool {
        self.inner
            .entries
            .read()
            .await
            .contains_key(&ForwarderKey::new(path, container))
    }

    /// Whether any container of `path` is forwarded.
    pub async fn is_path_forwarded(&self, path: &str) -> bool {
        self.inner
            .entries
            .read()
            .await
            .keys()
            .any(|k| k.path == path)
    }

    pub async fn forwarder_for(&self, key: &ForwarderKey) -> Option<ForwarderView> {
        self.inner
            .entries
            .read()
            .await
            .get(key)
            .map(|e| e.view(key))
    }

    /// Snapshot of every forwarder, ordered by key.
    pub async fn list(&self) -> Vec<ForwarderView> {
        let entries = self.inner.entries.read().await;
        let mut views: Vec<ForwarderView> = entries.iter().map(|(k, e)| e.view(k)).collect();
        views.sort_by(|a, b| a.key.cmp(&b.key));
        views
    }

    pub async fn count(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    /// Start a single tunnel for `key`.
    pub async fn start(
        &self,
        key: ForwarderKey,
        spec: TunnelSpec,
        hooks: ForwardHooks,
    ) -> Result<ForwarderView, ForwardError> {
        self.start_batch(key, PortTunnels::new(vec![spec]), hooks)
            .await
    }

    /// Start every tunnel of one dialog confirmation as a single forwarder.
    ///
    /// The batch is all-or-nothing: a conflicting key or local endpoint
    /// rejects it before anything is bound, and a bind failure on any spec
    /// releases the others and evicts the forwarder.
    pub async fn start_tunnels(
        &self,
        path: &str,
        container: &str,
        tunnels: PortTunnels,
        hooks: ForwardHooks,
    ) -> Result<ForwarderView, ForwardError> {
        self.start_batch(ForwarderKey::new(path, container), tunnels, hooks)
            .await
    }

    async fn start_batch(
        &self,
        key: ForwarderKey,
        tunnels: PortTunnels,
        hooks: ForwardHooks,
    ) -> Result<ForwarderView, ForwardError> {
        if tunnels.is_empty() {
            return Err(ForwardError::Validation("no ports to forward".to_string()));
        }
        let ForwardHooks { on_start, on_stop } = hooks;
        let id = Uuid::new_v4().to_string();
        let cancel = self.inner.shutdown.child_token();
        // Declared before `bound` so it drops after the listeners do.
        let (released, binding) = oneshot::channel::<()>();

        {
            let mut entries = self.inner.entries.write().await;
            self.admit(&entries, &key, &tunnels)?;
            entries.insert(
                key.clone(),
                Entry {
                    id: id.clone(),
                    tunnels: tunnels.clone(),
                    status: ForwardStatus::Pending,
                    started_at: now_ms(),
                    created: Instant::now(),
                    cancel: cancel.clone(),
                    tasks: Vec::new(),
                    binding: Some(binding),
                    on_stop,
                },
            );
            debug!(key = %key, %tunnels, total = entries.len(), "port-forward pending");
        }

        let mut bound = Vec::with_capacity(tunnels.len());
        for spec in &tunnels {
            match Tunnel::bind(spec).await {
                Ok(t) => bound.push(t),
                Err(e) => {
                    drop(bound);
                    drop(released);
                    self.evict_failed_bind(&key, &id, &e).await;
                    return Err(e);
                }
            }
            #[cfg(test)]
            self.pause_after_bind().await;
        }

        let view = {
            let mut entries = self.inner.entries.write().await;
            let Some(entry) = entries.get_mut(&key).filter(|e| e.id == id) else {
                // A stop won the race while we were binding; it ran the stop
                // hook and waits for these listeners to close.
                drop(bound);
                drop(released);
                info!(key = %key, "port-forward cancelled while starting");
                return Err(ForwardError::Cancelled(key));
            };
            entry.binding = None;
            for tunnel in bound {
                entry.tasks.push(self.spawn_tunnel(&key, &id, tunnel, cancel.clone()));
            }
            entry.tasks.push(self.spawn_monitor(&key, &id, cancel));
            entry.status = ForwardStatus::Active;
            entry.view(&key)
        };

        info!(key = %key, tunnels = %view.tunnels, "port-forward active");
        if let Some(hook) = on_start {
            hook(&view);
        }
        let _ = self.inner.events.send(ForwardEvent::Started(view.clone()));

        Ok(view)
    }

    /// Conflict and limit checks. Caller holds the write lock.
    fn admit(
        &self,
        entries: &HashMap<ForwarderKey, Entry>,
        key: &ForwarderKey,
        tunnels: &PortTunnels,
    ) -> Result<(), ForwardError> {
        if entries.contains_key(key) {
            return Err(ForwardError::Conflict(key.clone()));
        }
        if self.inner.max_forwarders > 0 && entries.len() >= self.inner.max_forwarders {
            return Err(ForwardError::LimitReached(self.inner.max_forwarders));
        }

        let specs = tunnels.as_slice();
        for (i, spec) in specs.iter().enumerate() {
            if specs[..i].iter().any(|prev| prev.clashes_with(spec)) {
                return Err(ForwardError::LocalPortConflict {
                    address: spec.address.clone(),
                    port: spec.local_port,
                    owner: key.clone(),
                });
            }
            let owner = entries
                .iter()
                .find(|(_, e)| e.tunnels.iter().any(|t| t.clashes_with(spec)));
            if let Some((owner, _)) = owner {
                return Err(ForwardError::LocalPortConflict {
                    address: spec.address.clone(),
                    port: spec.local_port,
                    owner: owner.clone(),
                });
            }
        }

        Ok(())
    }

    fn spawn_tunnel(
        &self,
        key: &ForwarderKey,
        id: &str,
        tunnel: Tunnel,
        cancel: CancellationToken,
    ) -> JoinHandle<TunnelExit> {
        let dialer = Arc::clone(&self.inner.dialer);
        let report = ExitReport::new(&self.inner, key, id);
        let key = key.clone();
        tokio::spawn(async move {
            let exit = tunnel.run(key, dialer, cancel).await;
            report.settle(&exit);
            exit
        })
    }

    /// Watch the target itself; tunnels only notice a dead pod once a
    /// connection tries to reach it.
    fn spawn_monitor(
        &self,
        key: &ForwarderKey,
        id: &str,
        cancel: CancellationToken,
    ) -> JoinHandle<TunnelExit> {
        let dialer = Arc::clone(&self.inner.dialer);
        let report = ExitReport::new(&self.inner, key, id);
        let key = key.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                () = cancel.cancelled() => TunnelExit::Closed,
                reason = dialer.terminated(&key) => TunnelExit::Failed(reason),
            };
            report.settle(&exit);
            exit
        })
    }

    /// Cancel an evicted entry's tasks and wait, bounded, for them to exit.
    async fn shutdown_entry(&self, key: &ForwarderKey, entry: &mut Entry) {
        entry.cancel.cancel();
        let timeout = self.inner.stop_timeout;
        if let Some(binding) = entry.binding.take() {
            // Still starting: wait for the start to drop its listeners.
            if tokio::time::timeout(timeout, binding).await.is_err() {
                error!(key = %key, "starting port-forward did not release its listeners");
            }
        }
        let tasks = std::mem::take(&mut entry.tasks);
        if tasks.is_empty() {
            return;
        }
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            for handle in aborts {
                handle.abort();
            }
            error!(
                key = %key,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "tunnel tasks did not acknowledge stop, forcing eviction"
            );
        }
    }

    async fn evict_failed_bind(&self, key: &ForwarderKey, id: &str, err: &ForwardError) {
        let entry = {
            let mut entries = self.inner.entries.write().await;
            match entries.get(key) {
                Some(e) if e.id == id => entries.remove(key),
                _ => None,
            }
        };
        warn!(key = %key, kind = err.kind(), "port-forward failed to start: {err}");
        // Stopped meanwhile: the stop already ran the hook.
        let Some(mut entry) = entry else { return };
        entry.status = ForwardStatus::Failed;
        self.finish(key, entry, Some(err));
    }

    /// Evict `key` after a tunnel failure, unless it was already stopped or
    /// replaced by a newer forwarder.
    async fn fail(&self, key: ForwarderKey, id: &str, reason: String) {
        let entry = {
            let mut entries = self.inner.entries.write().await;
            match entries.get(&key) {
                Some(e) if e.id == id => entries.remove(&key),
                _ => None,
            }
        };
        let Some(mut entry) = entry else {
            debug!(key = %key, "ignoring exit of stale forwarder: {reason}");
            return;
        };

        let err = ForwardError::Runtime {
            key: key.clone(),
            reason,
        };
        warn!(key = %key, "port-forward terminated: {err}");
        self.shutdown_entry(&key, &mut entry).await;
        entry.status = ForwardStatus::Failed;
        self.finish(&key, entry, Some(&err));
    }

    /// Run the stop hook and publish the outcome of an evicted entry.
    fn finish(&self, key: &ForwarderKey, mut entry: Entry, cause: Option<&ForwardError>) {
        if let Some(hook) = entry.on_stop.take() {
            hook(key, cause);
        }
        let event = match cause {
            None => ForwardEvent::Stopped(key.clone()),
            Some(err) => ForwardEvent::Failed {
                view: entry.view(key),
                error: err.to_string(),
            },
        };
        let _ = self.inner.events.send(event);
    }

    #[cfg(test)]
    async fn pause_after_bind(&self) {
        let pause = self
            .inner
            .bind_pause
            .lock()
            .ok()
            .and_then(|mut p| p.take());
        if let Some(BindPause { reached, resume }) = pause {
            let _ = reached.send(());
            let _ = resume.await;
        }
    }

    /// Stop and evict one forwarder.
    pub async fn stop(&self, key: &ForwarderKey) -> Result<(), ForwardError> {
        let entry = self.inner.entries.write().await.remove(key);
        let Some(mut entry) = entry else {
            return Err(ForwardError::NotFound(key.clone()));
        };
        self.shutdown_entry(key, &mut entry).await;
        info!(key = %key, "port-forward stopped");
        self.finish(key, entry, None);
        Ok(())
    }

    /// Stop every forwarder of `path` (its view closed). Returns how many
    /// were stopped.
    pub async fn stop_all_for_path(&self, path: &str) -> usize {
        let removed: Vec<(ForwarderKey, Entry)> = {
            let mut entries = self.inner.entries.write().await;
            let keys: Vec<ForwarderKey> = entries.keys().filter(|k| k.path == path).cloned().collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e)))
                .collect()
        };
        self.stop_removed(removed).await
    }

    /// Stop every forwarder (used during shutdown).
    pub async fn stop_all(&self) {
        let removed: Vec<(ForwarderKey, Entry)> = self.inner.entries.write().await.drain().collect();
        let count = self.stop_removed(removed).await;
        if count > 0 {
            info!("Shut down {count} port-forward(s)");
        }
    }

    async fn stop_removed(&self, removed: Vec<(ForwarderKey, Entry)>) -> usize {
        let count = removed.len();
        let stopped = futures::future::join_all(removed.into_iter().map(|(key, mut entry)| async move {
            self.shutdown_entry(&key, &mut entry).await;
            (key, entry)
        }))
        .await;
        for (key, entry) in stopped {
            info!(key = %key, "port-forward stopped");
            self.finish(&key, entry, None);
        }
        count
    }
}


#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::dialer::BoxedStream;
    use super::testing::{free_port, EchoDialer};
    use super::*;

    fn registry() -> (Forwarders, Arc<EchoDialer>) {
        let dialer = Arc::new(EchoDialer::new());
        let config = ForwardConfig {
            stop_timeout_ms: 1000,
            ..ForwardConfig::default()
        };
        (Forwarders::new(&config, dialer.clone()), dialer)
    }

    fn spec(local: u16, remote: u16) -> TunnelSpec {
        TunnelSpec::new("127.0.0.1", local, remote)
    }

    fn key(path: &str, co: &str) -> ForwarderKey {
        ForwarderKey::new(path, co)
    }

    #[derive(Clone, Default)]
    struct StopLog(Arc<Mutex<Vec<Option<String>>>>);

    impl StopLog {
        fn hooks(&self) -> ForwardHooks {
            let log = self.0.clone();
            ForwardHooks::new().on_stop(move |_, cause| {
                log.lock().unwrap().push(cause.map(ForwardError::kind).map(str::to_string));
            })
        }

        fn calls(&self) -> Vec<Option<String>> {
            self.0.lock().unwrap().clone()
        }
    }

    async fn echo_roundtrip(port: u16) -> Vec<u8> {
        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_start_forwards_traffic() {
        let (fw, _) = registry();
        let port = free_port();
        let started = Arc::new(AtomicUsize::new(0));
        let s = started.clone();
        let hooks = ForwardHooks::new().on_start(move |view| {
            assert_eq!(view.status, ForwardStatus::Active);
            s.fetch_add(1, Ordering::SeqCst);
        });

        let view = fw.start(key("default/web-1", "web"), spec(port, 80), hooks).await.unwrap();
        assert_eq!(view.status, ForwardStatus::Active);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(fw.is_forwarded("default/web-1", "web").await);
        assert!(fw.is_path_forwarded("default/web-1").await);
        assert!(!fw.is_forwarded("default/web-1", "sidecar").await);

        assert_eq!(echo_roundtrip(port).await, b"ping");

        let found = fw.forwarder_for(&key("default/web-1", "web")).await.unwrap();
        assert_eq!(found.id, view.id);
        assert_eq!(found.tunnels.as_slice(), &[spec(port, 80)]);
    }

    #[tokio::test]
    async fn test_second_start_on_same_key_conflicts() {
        let (fw, _) = registry();
        let k = key("default/web-1", "web");
        let first = fw.start(k.clone(), spec(free_port(), 80), ForwardHooks::new()).await.unwrap();

        let err = fw.start(k.clone(), spec(free_port(), 9000), ForwardHooks::new()).await.unwrap_err();
        assert!(matches!(err, ForwardError::Conflict(_)));
        assert_eq!(fw.forwarder_for(&k).await.unwrap().id, first.id);
        assert_eq!(fw.count().await, 1);
    }

    #[tokio::test]
    async fn test_racing_starts_admit_exactly_one() {
        let (fw, _) = registry();
        let k = key("default/web-1", "web");
        let (a, b) = tokio::join!(
            fw.start(k.clone(), spec(free_port(), 80), ForwardHooks::new()),
            fw.start(k.clone(), spec(free_port(), 80), ForwardHooks::new()),
        );
        assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);
        let loser = a.err().or(b.err()).unwrap();
        assert!(matches!(loser, ForwardError::Conflict(_)));
        assert_eq!(fw.count().await, 1);
    }

    #[tokio::test]
    async fn test_stop_unknown_key_is_not_found() {
        let (fw, _) = registry();
        fw.start(key("default/a", "a"), spec(free_port(), 80), ForwardHooks::new()).await.unwrap();

        let err = fw.stop(&key("default/b", "b")).await.unwrap_err();
        assert!(matches!(err, ForwardError::NotFound(_)));
        assert_eq!(fw.count().await, 1);
    }

    #[tokio::test]
    async fn test_stop_releases_port_and_runs_hook_once() {
        let (fw, _) = registry();
        let mut events = fw.subscribe();
        let log = StopLog::default();
        let port = free_port();
        let k = key("default/web-1", "web");
        fw.start(k.clone(), spec(port, 80), log.hooks()).await.unwrap();

        fw.stop(&k).await.unwrap();
        assert!(!fw.is_forwarded("default/web-1", "web").await);
        assert_eq!(log.calls(), vec![None]);
        // The listener is gone once stop returns.
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();

        assert!(matches!(events.recv().await.unwrap(), ForwardEvent::Started(_)));
        assert!(matches!(events.recv().await.unwrap(), ForwardEvent::Stopped(s) if s == k));

        assert!(fw.stop(&k).await.is_err());
        assert_eq!(log.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_with_conflicting_local_port_registers_nothing() {
        let (fw, _) = registry();
        let (p1, p2, p3) = (free_port(), free_port(), free_port());
        fw.start(key("default/other", "db"), spec(p2, 5432), ForwardHooks::new()).await.unwrap();

        let batch = PortTunnels::new(vec![spec(p1, 80), spec(p2, 81), spec(p3, 82)]);
        let err = fw
            .start_tunnels("default/web-1", "web", batch, ForwardHooks::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::LocalPortConflict { port, .. } if port == p2));
        assert_eq!(fw.count().await, 1);
        assert!(!fw.is_forwarded("default/web-1", "web").await);
        std::net::TcpListener::bind(("127.0.0.1", p1)).unwrap();
    }

    #[tokio::test]
    async fn test_batch_repeating_a_local_port_is_rejected() {
        let (fw, _) = registry();
        let p = free_port();
        let batch = PortTunnels::new(vec![spec(p, 80), spec(p, 81)]);
        let err = fw
            .start_tunnels("default/web-1", "web", batch, ForwardHooks::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::LocalPortConflict { .. }));
        assert_eq!(fw.count().await, 0);
    }

    #[tokio::test]
    async fn test_batch_forwards_every_port() {
        let (fw, _) = registry();
        let (p1, p2) = (free_port(), free_port());
        let batch = PortTunnels::new(vec![spec(p1, 80), spec(p2, 9000)]);
        let view = fw
            .start_tunnels("default/web-1", "web", batch, ForwardHooks::new())
            .await
            .unwrap();
        assert_eq!(view.tunnels.len(), 2);
        assert_eq!(echo_roundtrip(p1).await, b"ping");
        assert_eq!(echo_roundtrip(p2).await, b"ping");
    }

    #[tokio::test]
    async fn test_bind_failure_evicts_and_reports_cause() {
        let (fw, _) = registry();
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let log = StopLog::default();

        let err = fw
            .start(key("default/web-1", "web"), spec(port, 80), log.hooks())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Bind { .. }));
        assert_eq!(fw.count().await, 0);
        assert_eq!(log.calls(), vec![Some("bind".to_string())]);
    }

    #[tokio::test]
    async fn test_dead_target_evicts_forwarder() {
        let (fw, dialer) = registry();
        let mut events = fw.subscribe();
        let log = StopLog::default();
        let port = free_port();
        fw.start(key("default/web-1", "web"), spec(port, 80), log.hooks()).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), ForwardEvent::Started(_)));

        dialer.kill();
        match events.recv().await.unwrap() {
            ForwardEvent::Failed { view, error } => {
                assert_eq!(view.status, ForwardStatus::Failed);
                assert!(error.contains("pod deleted"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!fw.is_forwarded("default/web-1", "web").await);
        assert_eq!(log.calls(), vec![Some("runtime".to_string())]);
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[tokio::test]
    async fn test_stop_all_for_path_leaves_other_pods() {
        let (fw, _) = registry();
        fw.start(key("default/web-1", "web"), spec(free_port(), 80), ForwardHooks::new()).await.unwrap();
        fw.start(key("default/web-1", "metrics"), spec(free_port(), 9090), ForwardHooks::new()).await.unwrap();
        fw.start(key("default/db-0", "db"), spec(free_port(), 5432), ForwardHooks::new()).await.unwrap();

        assert_eq!(fw.stop_all_for_path("default/web-1").await, 2);
        assert!(!fw.is_path_forwarded("default/web-1").await);
        assert!(fw.is_forwarded("default/db-0", "db").await);
    }

    #[tokio::test]
    async fn test_stop_all_drains_registry() {
        let (fw, _) = registry();
        let log = StopLog::default();
        let ports = [free_port(), free_port(), free_port()];
        for (i, port) in ports.iter().enumerate() {
            fw.start(key(&format!("default/web-{i}"), "web"), spec(*port, 80), log.hooks())
                .await
                .unwrap();
        }

        fw.stop_all().await;
        assert_eq!(fw.count().await, 0);
        for i in 0..ports.len() {
            assert!(!fw.is_forwarded(&format!("default/web-{i}"), "web").await);
        }
        for port in ports {
            std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
        }
        assert_eq!(log.calls(), vec![None, None, None]);
    }

    #[tokio::test]
    async fn test_limit_is_enforced() {
        let dialer = Arc::new(EchoDialer::new());
        let config = ForwardConfig {
            max_forwarders: 1,
            ..ForwardConfig::default()
        };
        let fw = Forwarders::new(&config, dialer);
        fw.start(key("default/a", "a"), spec(free_port(), 80), ForwardHooks::new()).await.unwrap();
        let err = fw
            .start(key("default/b", "b"), spec(free_port(), 80), ForwardHooks::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::LimitReached(1)));
    }

    #[tokio::test]
    async fn test_list_is_sorted_by_key() {
        let (fw, _) = registry();
        fw.start(key("default/b", "b"), spec(free_port(), 80), ForwardHooks::new()).await.unwrap();
        fw.start(key("default/a", "a"), spec(free_port(), 80), ForwardHooks::new()).await.unwrap();
        let paths: Vec<String> = fw.list().await.into_iter().map(|v| v.key.path).collect();
        assert_eq!(paths, vec!["default/a", "default/b"]);
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let (fw, _) = registry();
        let err = fw
            .start_tunnels("default/a", "a", PortTunnels::default(), ForwardHooks::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Validation(_)));
    }

    #[tokio::test]
    async fn test_stop_while_binding_wins_and_releases_port() {
        let (fw, _) = registry();
        let (reached_tx, reached) = oneshot::channel();
        let (resume, resume_rx) = oneshot::channel();
        *fw.inner.bind_pause.lock().unwrap() = Some(BindPause {
            reached: reached_tx,
            resume: resume_rx,
        });
        let log = StopLog::default();
        let port = free_port();
        let k = key("default/web-1", "web");

        let starting = tokio::spawn({
            let (fw, k, hooks) = (fw.clone(), k.clone(), log.hooks());
            async move { fw.start(k, spec(port, 80), hooks).await }
        });
        reached.await.unwrap();
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_err());

        let stopping = tokio::spawn({
            let (fw, k) = (fw.clone(), k.clone());
            async move { fw.stop(&k).await }
        });
        while fw.is_forwarded("default/web-1", "web").await {
            tokio::task::yield_now().await;
        }
        resume.send(()).unwrap();

        stopping.await.unwrap().unwrap();
        // Released by the time stop returns.
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();

        let err = starting.await.unwrap().unwrap_err();
        assert!(matches!(err, ForwardError::Cancelled(_)));
        assert_eq!(log.calls(), vec![None]);
        assert_eq!(fw.count().await, 0);
    }

    struct CrashingDialer;

    #[async_trait]
    impl PortDialer for CrashingDialer {
        async fn connect(&self, _key: &ForwarderKey, _remote_port: u16) -> io::Result<BoxedStream> {
            Err(io::Error::other("no route"))
        }

        async fn terminated(&self, _key: &ForwarderKey) -> String {
            panic!("liveness check crashed")
        }
    }

    #[tokio::test]
    async fn test_panicking_monitor_evicts_forwarder() {
        let fw = Forwarders::new(&ForwardConfig::default(), Arc::new(CrashingDialer));
        let mut events = fw.subscribe();
        let log = StopLog::default();
        let port = free_port();
        fw.start(key("default/web-1", "web"), spec(port, 80), log.hooks())
            .await
            .unwrap();

        loop {
            if let ForwardEvent::Failed { view, .. } = events.recv().await.unwrap() {
                assert_eq!(view.status, ForwardStatus::Failed);
                break;
            }
        }
        assert_eq!(fw.count().await, 0);
        assert_eq!(log.calls(), vec![Some("runtime".to_string())]);
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[tokio::test]
    async fn test_localhost_and_loopback_share_a_port() {
        let (fw, _) = registry();
        let port = free_port();
        fw.start(key("default/a", "a"), spec(port, 80), ForwardHooks::new())
            .await
            .unwrap();

        let err = fw
            .start(
                key("default/b", "b"),
                TunnelSpec::new("localhost", port, 80),
                ForwardHooks::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::LocalPortConflict { owner, .. } if owner == key("default/a", "a")));
        assert_eq!(fw.count().await, 1);
    }
}
