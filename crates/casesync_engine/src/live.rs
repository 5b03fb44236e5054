//! Live subscription registry.
//!
//! One remote feed exists per distinct `(query, vars)` pair. Subscribers are
//! reference counted, and the remote feed is killed when the last one
//! leaves. After a reconnect every feed is opened again; when the remote
//! assigns a new id, the entry is re-keyed and client subscribers are told.

use crate::cache::CacheScope;
use crate::error::EngineResult;
use crate::hub::{ClientHub, ClientId};
use crate::remote::{LiveNotification, RemoteDatabase};
use crate::stats::EngineStats;
use casesync_protocol::{Event, Value};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Who receives a feed's changes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subscriber {
    /// A client tab.
    Client(ClientId),
    /// An engine-owned cached table.
    Cache {
        /// Cached table.
        table: String,
        /// Cache scope.
        scope: CacheScope,
    },
}

#[derive(Debug, Clone)]
struct Feed {
    query: String,
    vars: Value,
    subscribers: BTreeSet<Subscriber>,
}

impl Feed {
    fn clients(&self) -> Vec<ClientId> {
        self.subscribers
            .iter()
            .filter_map(|s| match s {
                Subscriber::Client(id) => Some(id.clone()),
                Subscriber::Cache { .. } => None,
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct Feeds {
    by_id: HashMap<String, Feed>,
    by_key: HashMap<String, String>,
}

impl Feeds {
    fn insert(&mut self, id: String, feed: Feed) {
        self.by_key.insert(dedupe_key(&feed.query, &feed.vars), id.clone());
        self.by_id.insert(id, feed);
    }
}

/// Summary of a resubscription pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResubscribeReport {
    /// Feeds opened again.
    pub reestablished: usize,
    /// Feeds whose id changed (a subset of `reestablished`).
    pub remapped: usize,
    /// Feeds that could not be opened; kept for the next pass.
    pub failed: usize,
}

/// A cached table targeted by a live change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedTarget {
    /// Cached table.
    pub table: String,
    /// Cache scope.
    pub scope: CacheScope,
}

/// Maps remote live feeds to their subscribers.
pub struct LiveRegistry {
    remote: Arc<dyn RemoteDatabase>,
    hub: Arc<ClientHub>,
    stats: Arc<EngineStats>,
    feeds: Mutex<Feeds>,
    ops: tokio::sync::Mutex<()>,
}

impl LiveRegistry {
    pub(crate) fn new(
        remote: Arc<dyn RemoteDatabase>,
        hub: Arc<ClientHub>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            remote,
            hub,
            stats,
            feeds: Mutex::new(Feeds::default()),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    /// Subscribes to `(query, vars)`, opening a remote feed only if none
    /// exists. Returns the feed id.
    pub async fn subscribe(
        &self,
        query: &str,
        vars: &Value,
        subscriber: Subscriber,
    ) -> EngineResult<String> {
        let _op = self.ops.lock().await;
        let key = dedupe_key(query, vars);
        {
            let mut feeds = self.feeds.lock();
            if let Some(id) = feeds.by_key.get(&key).cloned() {
                if let Some(feed) = feeds.by_id.get_mut(&id) {
                    feed.subscribers.insert(subscriber);
                    debug!(live_id = %id, subscribers = feed.subscribers.len(), "joined live feed");
                    return Ok(id);
                }
            }
        }

        let id = self.remote.live(query, vars).await?;
        self.feeds.lock().insert(
            id.clone(),
            Feed {
                query: query.to_string(),
                vars: vars.clone(),
                subscribers: BTreeSet::from([subscriber]),
            },
        );
        info!(live_id = %id, "opened live feed");
        Ok(id)
    }

    /// Removes a subscriber. Kills the remote feed when it was the last.
    ///
    /// Returns false if the feed or subscriber was unknown.
    pub async fn unsubscribe(&self, id: &str, subscriber: &Subscriber) -> EngineResult<bool> {
        let _op = self.ops.lock().await;
        self.unsubscribe_locked(id, subscriber).await
    }

    /// Removes a subscriber from every feed. Returns how many it left.
    pub async fn unsubscribe_all(&self, subscriber: &Subscriber) -> usize {
        let _op = self.ops.lock().await;
        let ids: Vec<String> = self
            .feeds
            .lock()
            .by_id
            .iter()
            .filter(|(_, feed)| feed.subscribers.contains(subscriber))
            .map(|(id, _)| id.clone())
            .collect();
        let mut left = 0;
        for id in ids {
            if matches!(self.unsubscribe_locked(&id, subscriber).await, Ok(true)) {
                left += 1;
            }
        }
        left
    }

    async fn unsubscribe_locked(&self, id: &str, subscriber: &Subscriber) -> EngineResult<bool> {
        let last = {
            let mut feeds = self.feeds.lock();
            let Some(feed) = feeds.by_id.get_mut(id) else {
                return Ok(false);
            };
            if !feed.subscribers.remove(subscriber) {
                return Ok(false);
            }
            if feed.subscribers.is_empty() {
                let key = dedupe_key(&feed.query, &feed.vars);
                feeds.by_id.remove(id);
                feeds.by_key.remove(&key);
                true
            } else {
                false
            }
        };
        if last {
            match self.remote.kill(id).await {
                Ok(()) => info!(live_id = %id, "killed live feed"),
                Err(e) => warn!(live_id = %id, error = %e, "failed to kill live feed"),
            }
        }
        Ok(true)
    }

    /// Fans a change out to the feed's client subscribers and returns its
    /// cache subscribers.
    pub fn dispatch(&self, notification: &LiveNotification) -> Vec<FeedTarget> {
        let (clients, targets) = {
            let feeds = self.feeds.lock();
            let Some(feed) = feeds.by_id.get(&notification.live_id) else {
                debug!(live_id = %notification.live_id, "change for unknown live feed");
                return Vec::new();
            };
            let targets = feed
                .subscribers
                .iter()
                .filter_map(|s| match s {
                    Subscriber::Cache { table, scope } => Some(FeedTarget {
                        table: table.clone(),
                        scope: scope.clone(),
                    }),
                    Subscriber::Client(_) => None,
                })
                .collect();
            (feed.clients(), targets)
        };
        self.stats.record_live_update();
        let event = Event::LiveUpdate {
            id: notification.live_id.clone(),
            action: notification.action.as_str().to_string(),
            result: notification.result.clone(),
        };
        self.hub.send_to(&clients, &event);
        targets
    }

    /// Opens every feed again on a fresh connection.
    ///
    /// The registry is rebuilt in one step once every feed was tried, so a
    /// new id may reuse an id the previous connection gave another feed. A
    /// new id already claimed in this pass is refused and the feed kept
    /// under its old id for the next pass.
    pub async fn resubscribe_all(&self) -> ResubscribeReport {
        let _op = self.ops.lock().await;
        let mut snapshot: Vec<(String, Feed)> = self
            .feeds
            .lock()
            .by_id
            .iter()
            .map(|(id, feed)| (id.clone(), feed.clone()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));

        let mut opened = Vec::new();
        let mut pending = Vec::new();
        for (old_id, feed) in snapshot {
            match self.remote.live(&feed.query, &feed.vars).await {
                Ok(new_id) => opened.push((old_id, new_id, feed)),
                Err(e) => {
                    warn!(live_id = %old_id, error = %e, "failed to resubscribe live feed");
                    self.notify_failed(&old_id, &feed, e.to_string());
                    pending.push((old_id, feed));
                }
            }
        }

        let mut report = ResubscribeReport::default();
        let mut rebuilt = Feeds::default();
        for (old_id, new_id, feed) in opened {
            if rebuilt.by_id.contains_key(&new_id) {
                warn!(old_id = %old_id, new_id = %new_id, "live id already taken by another feed");
                self.notify_failed(&old_id, &feed, format!("live id {new_id} already in use"));
                pending.push((old_id, feed));
                continue;
            }
            report.reestablished += 1;
            if new_id != old_id {
                report.remapped += 1;
                self.hub.send_to(
                    &feed.clients(),
                    &Event::LiveQueryUuidChanged {
                        old_id: old_id.clone(),
                        new_id: new_id.clone(),
                    },
                );
                debug!(old_id = %old_id, new_id = %new_id, "live feed remapped");
            }
            rebuilt.insert(new_id, feed);
        }
        for (old_id, feed) in pending {
            report.failed += 1;
            if rebuilt.by_id.contains_key(&old_id) {
                warn!(live_id = %old_id, "dropping live feed, its id now belongs to another");
                continue;
            }
            rebuilt.insert(old_id, feed);
        }
        *self.feeds.lock() = rebuilt;

        info!(
            reestablished = report.reestablished,
            remapped = report.remapped,
            failed = report.failed,
            "live feeds resubscribed"
        );
        report
    }

    fn notify_failed(&self, id: &str, feed: &Feed, error: String) {
        self.hub.send_to(
            &feed.clients(),
            &Event::LiveQueryResubscribeFailed {
                id: id.to_string(),
                error,
            },
        );
    }

    /// Returns the ids of every feed.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.feeds.lock().by_id.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the subscribers of a feed.
    pub fn subscribers(&self, id: &str) -> Vec<Subscriber> {
        self.feeds
            .lock()
            .by_id
            .get(id)
            .map(|feed| feed.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns true if `subscriber` is on any feed.
    pub fn is_subscribed(&self, subscriber: &Subscriber) -> bool {
        self.feeds
            .lock()
            .by_id
            .values()
            .any(|feed| feed.subscribers.contains(subscriber))
    }

    /// Returns the number of feeds.
    pub fn len(&self) -> usize {
        self.feeds.lock().by_id.len()
    }

    /// Returns true if no feed is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for LiveRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveRegistry")
            .field("feeds", &self.len())
            .finish()
    }
}

fn dedupe_key(query: &str, vars: &Value) -> String {
    format!("{}\u{0}{}", query.trim(), vars.to_json_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRemote;
    use crate::remote::LiveAction;
    use casesync_protocol::OutboundMessage;
    use tokio::sync::mpsc;

    const QUERY: &str = "LIVE SELECT * FROM case";

    async fn registry() -> (LiveRegistry, Arc<MockRemote>, Arc<ClientHub>) {
        let mock = Arc::new(MockRemote::new());
        mock.connect("mem://").await.unwrap();
        let hub = Arc::new(ClientHub::new());
        let registry = LiveRegistry::new(mock.clone(), hub.clone(), Arc::new(EngineStats::default()));
        (registry, mock, hub)
    }

    fn client(id: &str) -> Subscriber {
        Subscriber::Client(id.to_string())
    }

    fn kinds(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            kinds.push(msg.kind().to_string());
        }
        kinds
    }

    #[tokio::test]
    async fn one_remote_feed_per_query() {
        let (registry, mock, _hub) = registry().await;
        let a = registry.subscribe(QUERY, &Value::Null, client("a")).await.unwrap();
        let b = registry.subscribe(QUERY, &Value::Null, client("b")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(mock.calls("live"), 1);

        let vars = Value::object([("x", Value::from(1i64))]);
        let c = registry.subscribe(QUERY, &vars, client("a")).await.unwrap();
        assert_ne!(a, c);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn last_unsubscribe_kills_feed() {
        let (registry, mock, _hub) = registry().await;
        let id = registry.subscribe(QUERY, &Value::Null, client("a")).await.unwrap();
        registry.subscribe(QUERY, &Value::Null, client("b")).await.unwrap();

        assert!(registry.unsubscribe(&id, &client("a")).await.unwrap());
        assert!(mock.kills().is_empty());
        assert!(registry.unsubscribe(&id, &client("b")).await.unwrap());
        assert_eq!(mock.kills(), vec![id.clone()]);
        assert!(registry.is_empty());
        assert!(!registry.unsubscribe(&id, &client("b")).await.unwrap());
    }

    #[tokio::test]
    async fn changes_reach_only_subscribers() {
        let (registry, _mock, hub) = registry().await;
        let mut a = hub.register("a");
        let mut other = hub.register("other");
        let id = registry.subscribe(QUERY, &Value::Null, client("a")).await.unwrap();
        registry
            .subscribe(
                QUERY,
                &Value::Null,
                Subscriber::Cache {
                    table: "case".into(),
                    scope: CacheScope::global(),
                },
            )
            .await
            .unwrap();

        let targets = registry.dispatch(&LiveNotification {
            live_id: id,
            action: LiveAction::Update,
            result: Value::object([("name", Value::from("x"))]),
        });
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].table, "case");
        assert_eq!(kinds(&mut a), vec!["live_update"]);
        assert!(kinds(&mut other).is_empty());
    }

    #[tokio::test]
    async fn resubscribe_remaps_and_notifies_on_new_id() {
        let (registry, mock, hub) = registry().await;
        let mut a = hub.register("a");
        let old = registry.subscribe(QUERY, &Value::Null, client("a")).await.unwrap();

        let report = registry.resubscribe_all().await;
        assert_eq!(report.reestablished, 1);
        assert_eq!(report.remapped, 1);
        assert_eq!(mock.calls("live"), 2);

        let new = registry.ids().pop().unwrap();
        assert_ne!(old, new);
        assert_eq!(registry.subscribers(&new), vec![client("a")]);
        assert_eq!(kinds(&mut a), vec!["live_query_uuid_changed"]);

        // The new id is reused for new subscribers.
        let joined = registry.subscribe(QUERY, &Value::Null, client("b")).await.unwrap();
        assert_eq!(joined, new);
    }

    #[tokio::test]
    async fn resubscribe_with_same_id_is_silent() {
        let (registry, mock, hub) = registry().await;
        mock.set_stable_live_ids(true);
        let mut a = hub.register("a");
        registry.subscribe(QUERY, &Value::Null, client("a")).await.unwrap();

        let report = registry.resubscribe_all().await;
        assert_eq!(report.reestablished, 1);
        assert_eq!(report.remapped, 0);
        assert!(kinds(&mut a).is_empty());
    }

    #[tokio::test]
    async fn failed_resubscribe_keeps_entry_and_notifies() {
        let (registry, mock, hub) = registry().await;
        let mut a = hub.register("a");
        let id = registry.subscribe(QUERY, &Value::Null, client("a")).await.unwrap();

        mock.fail_live(true);
        let report = registry.resubscribe_all().await;
        assert_eq!(report.failed, 1);
        assert_eq!(registry.ids(), vec![id]);
        assert_eq!(kinds(&mut a), vec!["live_query_resubscribe_failed"]);

        mock.fail_live(false);
        assert_eq!(registry.resubscribe_all().await.reestablished, 1);
    }

    #[tokio::test]
    async fn new_id_of_one_feed_may_reuse_the_old_id_of_another() {
        let (registry, mock, _hub) = registry().await;
        let note = "LIVE SELECT * FROM note";
        mock.set_live_id(QUERY, "live-1");
        mock.set_live_id(note, "live-2");
        registry.subscribe(QUERY, &Value::Null, client("a")).await.unwrap();
        registry.subscribe(note, &Value::Null, client("b")).await.unwrap();

        mock.set_live_id(QUERY, "live-2");
        mock.set_live_id(note, "live-1");
        let report = registry.resubscribe_all().await;
        assert_eq!(report.reestablished, 2);
        assert_eq!(report.remapped, 2);
        assert_eq!(registry.subscribers("live-2"), vec![client("a")]);
        assert_eq!(registry.subscribers("live-1"), vec![client("b")]);
    }

    #[tokio::test]
    async fn colliding_new_id_is_refused() {
        let (registry, mock, hub) = registry().await;
        let mut b = hub.register("b");
        let note = "LIVE SELECT * FROM note";
        mock.set_live_id(QUERY, "live-1");
        mock.set_live_id(note, "live-2");
        registry.subscribe(QUERY, &Value::Null, client("a")).await.unwrap();
        registry.subscribe(note, &Value::Null, client("b")).await.unwrap();

        mock.set_live_id(QUERY, "live-9");
        mock.set_live_id(note, "live-9");
        let report = registry.resubscribe_all().await;
        assert_eq!(report.reestablished, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(registry.ids(), vec!["live-2".to_string(), "live-9".to_string()]);
        assert_eq!(registry.subscribers("live-9"), vec![client("a")]);
        assert_eq!(registry.subscribers("live-2"), vec![client("b")]);
        assert_eq!(kinds(&mut b), vec!["live_query_resubscribe_failed"]);

        // The refused feed still resolves by its query.
        let joined = registry.subscribe(note, &Value::Null, client("c")).await.unwrap();
        assert_eq!(joined, "live-2");
    }

    #[tokio::test]
    async fn unsubscribe_all_leaves_every_feed() {
        let (registry, mock, _hub) = registry().await;
        registry.subscribe(QUERY, &Value::Null, client("a")).await.unwrap();
        registry
            .subscribe("LIVE SELECT * FROM note", &Value::Null, client("a"))
            .await
            .unwrap();
        assert_eq!(registry.unsubscribe_all(&client("a")).await, 2);
        assert_eq!(mock.kills().len(), 2);
    }
}
