//! Watch-backed resource cache and change notifier.
//!
//! A [`Cache`] mirrors one resource collection from a remote API server:
//! initial population comes from the watcher's list pass, after which the
//! incremental watch stream keeps the mirror current. Every event is
//! translated into a key notification on the controller's [`WorkQueue`], and
//! a resync timer re-notifies every cached key on a fixed interval so
//! reconcilers level-trigger even when nothing changed. Watch disconnects are
//! retried inside `kube`'s watcher and never surface to consumers.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use kube::runtime::watcher;
use kube::Resource;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::engine::queue::WorkQueue;

/// Default resync interval used by every controller in this operator
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(10 * 60);

/// Unique key of a namespaced or cluster-scoped resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, or `None` for cluster-scoped resources
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced resource
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped resource
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of a cached object, taken from its metadata
    pub fn from_object<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.meta().namespace.clone(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Read handle over a cache.
///
/// Cheap to clone; the snapshot returned by [`Store::get`] is never older
/// than the last delivered event for that key, but may lag the true remote
/// state between events.
pub struct Store<K> {
    inner: Arc<DashMap<ObjectKey, Arc<K>>>,
    synced: watch::Receiver<bool>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            synced: self.synced.clone(),
        }
    }
}

impl<K> Store<K> {
    /// Latest cached snapshot for a key, or `None` if the object is unknown
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.inner.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Keys of every cached object
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.inner.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the cache holds no objects
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Readiness gate that turns true once the initial list has completed.
    ///
    /// Controllers wait on this before dispatching work (see
    /// [`Controller::wait_for`](crate::engine::Controller::wait_for)).
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.clone()
    }

    #[cfg(test)]
    pub(crate) fn insert(&self, key: ObjectKey, obj: K) {
        self.inner.insert(key, Arc::new(obj));
    }
}

/// Local, eventually-consistent mirror of one resource collection
pub struct Cache<K> {
    store: Store<K>,
    synced_tx: watch::Sender<bool>,
}

impl<K> Default for Cache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Cache<K> {
    /// Create an empty, not-yet-synced cache
    pub fn new() -> Self {
        let (synced_tx, synced_rx) = watch::channel(false);
        Self {
            store: Store {
                inner: Arc::new(DashMap::new()),
                synced: synced_rx,
            },
            synced_tx,
        }
    }

    /// Read handle shared with reconcilers
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }
}

impl<K> Cache<K>
where
    K: Resource + Send + Sync + 'static,
{
    /// Drive the cache from a watch stream until shutdown or stream end.
    ///
    /// Every applied or deleted object updates the mirror and enqueues its
    /// key on `queue`. A relist (watcher `Init`) prunes objects that
    /// disappeared while the watch was down, notifying their keys so
    /// reconcilers observe the deletion.
    pub async fn run<S>(
        self,
        mut events: S,
        queue: Arc<WorkQueue>,
        resync: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Unpin,
    {
        let mut resync_timer =
            tokio::time::interval_at(tokio::time::Instant::now() + resync, resync);
        resync_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Keys seen during an in-progress relist, used to prune stale entries
        let mut relist: Option<HashSet<ObjectKey>> = None;

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = resync_timer.tick() => {
                    let keys = self.store.keys();
                    debug!(count = keys.len(), "resync: re-notifying cached keys");
                    for key in keys {
                        queue.add(key);
                    }
                }
                event = events.next() => match event {
                    None => break,
                    Some(Err(e)) => {
                        // The watcher restarts internally with backoff; for
                        // consumers this is only increased staleness.
                        warn!(error = %e, "watch stream error, watcher will retry");
                    }
                    Some(Ok(event)) => self.apply(event, &queue, &mut relist),
                },
            }
        }
    }

    fn apply(
        &self,
        event: watcher::Event<K>,
        queue: &WorkQueue,
        relist: &mut Option<HashSet<ObjectKey>>,
    ) {
        match event {
            watcher::Event::Init => {
                *relist = Some(HashSet::new());
            }
            watcher::Event::InitApply(obj) => {
                let key = ObjectKey::from_object(&obj);
                if let Some(seen) = relist.as_mut() {
                    seen.insert(key.clone());
                }
                self.store.inner.insert(key.clone(), Arc::new(obj));
                queue.add(key);
            }
            watcher::Event::InitDone => {
                if let Some(seen) = relist.take() {
                    let stale: Vec<ObjectKey> = self
                        .store
                        .inner
                        .iter()
                        .map(|entry| entry.key().clone())
                        .filter(|key| !seen.contains(key))
                        .collect();
                    for key in stale {
                        debug!(key = %key, "pruning object gone during relist");
                        self.store.inner.remove(&key);
                        queue.add(key);
                    }
                }
                self.synced_tx.send_replace(true);
            }
            watcher::Event::Apply(obj) => {
                let key = ObjectKey::from_object(&obj);
                self.store.inner.insert(key.clone(), Arc::new(obj));
                queue.add(key);
            }
            watcher::Event::Delete(obj) => {
                let key = ObjectKey::from_object(&obj);
                self.store.inner.remove(&key);
                queue.add(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use tokio_stream::wrappers::ReceiverStream;

    fn config_map(namespace: &str, name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn drain(queue: &WorkQueue) -> Vec<ObjectKey> {
        let mut keys = Vec::new();
        while !queue.is_empty() {
            match queue.get().await {
                Some(key) => {
                    queue.done(&key);
                    keys.push(key);
                }
                None => break,
            }
        }
        keys
    }

    #[tokio::test]
    async fn initial_list_populates_store_and_notifies_keys() {
        let cache = Cache::<ConfigMap>::new();
        let store = cache.store();
        let queue = Arc::new(WorkQueue::default());
        let (_tx, shutdown) = watch::channel(false);

        let events = futures::stream::iter(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(config_map("ns", "a"))),
            Ok(watcher::Event::InitApply(config_map("ns", "b"))),
            Ok(watcher::Event::InitDone),
        ]);
        assert!(!*store.synced().borrow());
        cache.run(events, Arc::clone(&queue), DEFAULT_RESYNC, shutdown).await;

        assert!(*store.synced().borrow());
        assert_eq!(store.len(), 2);
        assert!(store.get(&ObjectKey::namespaced("ns", "a")).is_some());

        let notified = drain(&queue).await;
        assert!(notified.contains(&ObjectKey::namespaced("ns", "a")));
        assert!(notified.contains(&ObjectKey::namespaced("ns", "b")));
    }

    #[tokio::test]
    async fn delete_removes_entry_and_notifies() {
        let cache = Cache::<ConfigMap>::new();
        let store = cache.store();
        let queue = Arc::new(WorkQueue::default());
        let (_tx, shutdown) = watch::channel(false);

        let events = futures::stream::iter(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(config_map("ns", "a"))),
            Ok(watcher::Event::InitDone),
            Ok(watcher::Event::Delete(config_map("ns", "a"))),
        ]);
        cache.run(events, Arc::clone(&queue), DEFAULT_RESYNC, shutdown).await;

        assert!(store.is_empty());
        // One add for the apply (coalesced) plus the delete notification
        assert!(!queue.is_empty());
    }

    #[tokio::test]
    async fn relist_prunes_objects_gone_while_watch_was_down() {
        let cache = Cache::<ConfigMap>::new();
        let store = cache.store();
        let queue = Arc::new(WorkQueue::default());
        let (_tx, shutdown) = watch::channel(false);

        let events = futures::stream::iter(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(config_map("ns", "a"))),
            Ok(watcher::Event::InitDone),
            // Watch drops, relist no longer includes "a"
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(config_map("ns", "b"))),
            Ok(watcher::Event::InitDone),
        ]);
        cache.run(events, Arc::clone(&queue), DEFAULT_RESYNC, shutdown).await;

        assert!(store.get(&ObjectKey::namespaced("ns", "a")).is_none());
        assert!(store.get(&ObjectKey::namespaced("ns", "b")).is_some());
        let notified = drain(&queue).await;
        assert!(notified.contains(&ObjectKey::namespaced("ns", "a")));
    }

    #[tokio::test(start_paused = true)]
    async fn resync_renotifies_unchanged_keys() {
        let cache = Cache::<ConfigMap>::new();
        let queue = Arc::new(WorkQueue::default());
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (events_tx, events_rx) = tokio::sync::mpsc::channel(8);

        events_tx.send(Ok(watcher::Event::Init)).await.unwrap();
        events_tx
            .send(Ok(watcher::Event::InitApply(config_map("ns", "a"))))
            .await
            .unwrap();
        events_tx.send(Ok(watcher::Event::InitDone)).await.unwrap();

        let resync = Duration::from_secs(60);
        let handle = {
            let queue = Arc::clone(&queue);
            tokio::spawn(cache.run(ReceiverStream::new(events_rx), queue, resync, shutdown))
        };
        tokio::task::yield_now().await;

        // Drain the initial notification
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());

        // Two resync periods pass with no real changes
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert_eq!(queue.get().await, Some(ObjectKey::namespaced("ns", "a")));

        drop(events_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_the_cache_loop() {
        let cache = Cache::<ConfigMap>::new();
        let queue = Arc::new(WorkQueue::default());
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (_events_tx, events_rx) =
            tokio::sync::mpsc::channel::<Result<watcher::Event<ConfigMap>, watcher::Error>>(1);

        let handle = tokio::spawn(cache.run(
            ReceiverStream::new(events_rx),
            queue,
            DEFAULT_RESYNC,
            shutdown,
        ));
        tokio::task::yield_now().await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn object_key_display_formats() {
        assert_eq!(
            ObjectKey::namespaced("openshift-ingress", "router-certs-default").to_string(),
            "openshift-ingress/router-certs-default"
        );
        assert_eq!(ObjectKey::cluster_scoped("node-1").to_string(), "node-1");
    }
}
