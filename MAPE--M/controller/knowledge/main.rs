//! Shared knowledge store reachable by every agent of the swarm.
//!
//! Each agent owns a [`KnowledgeBase`] handle. Local writes are tracked as
//! modifications until [`KnowledgeBase::send_modifieds`] publishes them to
//! the attached transport; peers fold those broadcasts back in through
//! [`KnowledgeBase::apply_remote`]. Keys starting with `.` are agent-local
//! and never leave the process.

/// Value type stored under each key.
pub mod value;

use std::{cell::RefCell, fmt, sync::Arc};

use anyhow::{bail, Context, Result};
use indexmap::{IndexMap, IndexSet};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use serde_json::json;
use shared_event_bus::{EventPublisher, EventRecord, EventSubscriber};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};

pub use value::KnowledgeValue;

/// Topic used for modification broadcasts.
pub const KNOWLEDGE_TOPIC: &str = "knowledge.update";

/// Key/value records plus the set of locally modified keys.
#[derive(Debug, Default, Clone)]
pub struct KnowledgeContext {
    records: IndexMap<String, KnowledgeValue>,
    modifieds: IndexSet<String>,
}

impl KnowledgeContext {
    fn write(&mut self, key: &str, value: KnowledgeValue, track: bool) {
        if track && !is_local_key(key) {
            self.modifieds.insert(key.to_owned());
        }
        self.records.insert(key.to_owned(), value);
    }
}

/// Returns true for keys that are never broadcast.
#[must_use]
pub fn is_local_key(key: &str) -> bool {
    key.starts_with('.')
}

/// Exclusive hold on a knowledge base.
///
/// While a hold is alive no other thread can read or write the store. The
/// holding thread can still use the [`KnowledgeBase`] API freely.
pub struct KnowledgeHold<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<KnowledgeContext>>,
}

impl fmt::Debug for KnowledgeHold<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KnowledgeHold")
    }
}

struct KnowledgeInner {
    origin: String,
    context: ReentrantMutex<RefCell<KnowledgeContext>>,
    transport: RwLock<Option<Arc<dyn EventPublisher>>>,
}

/// Cheap-to-clone handle to a shared knowledge store.
#[derive(Clone)]
pub struct KnowledgeBase {
    inner: Arc<KnowledgeInner>,
}

impl fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("origin", &self.inner.origin)
            .field("modified", &self.modified_count())
            .finish()
    }
}

impl KnowledgeBase {
    /// Creates an empty store identified by `origin` on the transport.
    #[must_use]
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(KnowledgeInner {
                origin: origin.into(),
                context: ReentrantMutex::new(RefCell::new(KnowledgeContext::default())),
                transport: RwLock::new(None),
            }),
        }
    }

    /// Identifier stamped on outgoing broadcasts.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// Routes future broadcasts to `publisher`.
    pub fn attach_transport(&self, publisher: Arc<dyn EventPublisher>) {
        *self.inner.transport.write() = Some(publisher);
    }

    /// Removes the transport; broadcasts then only clear the modified set.
    pub fn detach_transport(&self) {
        *self.inner.transport.write() = None;
    }

    /// Acquires the exclusive hold.
    pub fn lock(&self) -> KnowledgeHold<'_> {
        KnowledgeHold {
            _guard: self.inner.context.lock(),
        }
    }

    fn with_context<R>(&self, f: impl FnOnce(&mut KnowledgeContext) -> R) -> R {
        let guard = self.inner.context.lock();
        let mut context = guard.borrow_mut();
        f(&mut context)
    }

    /// Reads a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<KnowledgeValue> {
        self.with_context(|context| context.records.get(key).cloned())
    }

    /// Reads a value as an integer, zero when absent.
    #[must_use]
    pub fn integer(&self, key: &str) -> i64 {
        self.get(key).map_or(0, |value| value.to_integer())
    }

    /// Reads a value as a double, zero when absent.
    #[must_use]
    pub fn double(&self, key: &str) -> f64 {
        self.get(key).map_or(0.0, |value| value.to_double())
    }

    /// Reads a value as text, empty when absent.
    #[must_use]
    pub fn text(&self, key: &str) -> String {
        self.get(key).map(|value| value.to_string()).unwrap_or_default()
    }

    /// Returns true when the key holds a value.
    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.with_context(|context| context.records.contains_key(key))
    }

    /// Writes a value and marks it for the next broadcast.
    pub fn set(&self, key: &str, value: impl Into<KnowledgeValue>) {
        let value = value.into();
        self.with_context(|context| context.write(key, value, true));
    }

    /// Writes a value without marking it as modified.
    pub fn set_local(&self, key: &str, value: impl Into<KnowledgeValue>) {
        let value = value.into();
        self.with_context(|context| context.write(key, value, false));
    }

    /// Removes a key locally. Removals are not broadcast.
    pub fn erase(&self, key: &str) -> Option<KnowledgeValue> {
        self.with_context(|context| {
            context.modifieds.shift_remove(key);
            context.records.shift_remove(key)
        })
    }

    /// Keys under `prefix`, in insertion order.
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.with_context(|context| {
            context
                .records
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect()
        })
    }

    /// Number of keys awaiting broadcast.
    #[must_use]
    pub fn modified_count(&self) -> usize {
        self.with_context(|context| context.modifieds.len())
    }

    /// One `key = value` line per pending modification.
    #[must_use]
    pub fn debug_modifieds(&self) -> String {
        self.with_context(|context| {
            context
                .modifieds
                .iter()
                .map(|key| {
                    let value = context
                        .records
                        .get(key)
                        .map(ToString::to_string)
                        .unwrap_or_default();
                    format!("{key} = {value}")
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    /// Copy of the current records.
    #[must_use]
    pub fn snapshot(&self) -> IndexMap<String, KnowledgeValue> {
        self.with_context(|context| context.records.clone())
    }

    /// Takes the pending modifications and publishes them.
    ///
    /// Returns the number of keys sent. The modified set is cleared even
    /// when no transport is attached.
    pub async fn send_modifieds(&self) -> Result<usize> {
        let entries = self.with_context(|context| {
            let entries = context
                .modifieds
                .iter()
                .filter_map(|key| {
                    context
                        .records
                        .get(key)
                        .map(|value| (key.clone(), value.to_json()))
                })
                .collect::<serde_json::Map<_, _>>();
            context.modifieds.clear();
            entries
        });
        if entries.is_empty() {
            return Ok(0);
        }
        let count = entries.len();
        let transport = self.inner.transport.read().clone();
        if let Some(publisher) = transport {
            let event = EventRecord::new(
                self.origin(),
                KNOWLEDGE_TOPIC,
                json!({ "entries": entries }),
            );
            publisher
                .publish(event)
                .await
                .with_context(|| format!("broadcasting {count} modifications"))?;
        }
        Ok(count)
    }

    /// Applies a peer broadcast; own broadcasts and other topics are ignored.
    pub fn apply_remote(&self, event: &EventRecord) -> Result<usize> {
        if event.topic != KNOWLEDGE_TOPIC || event.source == self.inner.origin {
            return Ok(0);
        }
        let Some(entries) = event.payload.get("entries").and_then(|v| v.as_object()) else {
            bail!("knowledge update {} has no entries object", event.id);
        };
        let decoded = entries
            .iter()
            .filter_map(|(key, raw)| {
                KnowledgeValue::from_json(raw).map(|value| (key.clone(), value))
            })
            .collect::<Vec<_>>();
        let applied = decoded.len();
        self.with_context(|context| {
            for (key, value) in decoded {
                context.write(&key, value, false);
            }
        });
        Ok(applied)
    }

    /// Spawns a task folding peer broadcasts from `subscriber` into this store.
    ///
    /// The subscription is taken before returning, so nothing published after
    /// this call is missed. Updates wait for the store lock, which a running
    /// cycle holds, so each one is applied on the blocking pool and runtime
    /// workers stay free. Updates are still applied in arrival order.
    pub async fn spawn_listener(&self, subscriber: &dyn EventSubscriber) -> Result<JoinHandle<()>> {
        let mut receiver = subscriber.subscribe().await?;
        let knowledge = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let target = knowledge.clone();
                        let applied =
                            tokio::task::spawn_blocking(move || target.apply_remote(&event)).await;
                        match applied {
                            Ok(Ok(_)) => {}
                            Ok(Err(err)) => {
                                tracing::warn!(origin = knowledge.origin(), "dropping update: {err:#}");
                            }
                            Err(err) => {
                                tracing::warn!(origin = knowledge.origin(), "update task failed: {err}");
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(origin = knowledge.origin(), skipped, "listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use shared_event_bus::MemoryEventBus;

    #[test]
    fn tracks_modifications_except_local_keys() {
        let kb = KnowledgeBase::new("agent.0");
        kb.set("device.0.location", vec![1.0, 2.0, 0.0]);
        kb.set(".id", 0);
        kb.set_local("swarm.size", 4);
        assert_eq!(kb.modified_count(), 1);
        assert!(kb.debug_modifieds().contains("device.0.location = [1, 2, 0]"));
        assert_eq!(kb.integer("swarm.size"), 4);
    }

    #[test]
    fn hold_is_reentrant_for_the_holder() {
        let kb = KnowledgeBase::new("agent.0");
        let _hold = kb.lock();
        kb.set("a", 1);
        let nested = kb.lock();
        assert_eq!(kb.integer("a"), 1);
        drop(nested);
    }

    #[test]
    fn hold_blocks_other_writers() {
        let kb = KnowledgeBase::new("agent.0");
        let hold = kb.lock();
        let writer = {
            let kb = kb.clone();
            thread::spawn(move || kb.set("remote", 7))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!kb.exists("remote"));
        drop(hold);
        writer.join().unwrap();
        assert_eq!(kb.integer("remote"), 7);
    }

    #[tokio::test]
    async fn broadcasts_reach_peers_without_echo() {
        let bus = Arc::new(MemoryEventBus::new(16));
        let sender = KnowledgeBase::new("agent.0");
        let receiver = KnowledgeBase::new("agent.1");
        sender.attach_transport(bus.clone());

        sender.set("device.0.command", "debug");
        sender.set(".private", 1);
        assert_eq!(sender.send_modifieds().await.unwrap(), 1);
        assert_eq!(sender.modified_count(), 0);

        let event = bus.snapshot().pop().unwrap();
        assert_eq!(receiver.apply_remote(&event).unwrap(), 1);
        assert_eq!(receiver.text("device.0.command"), "debug");
        assert!(!receiver.exists(".private"));
        assert_eq!(receiver.modified_count(), 0);
        assert_eq!(sender.apply_remote(&event).unwrap(), 0);
    }

    #[tokio::test]
    async fn listener_applies_published_updates() {
        let bus = Arc::new(MemoryEventBus::new(16));
        let sender = KnowledgeBase::new("agent.0");
        let receiver = KnowledgeBase::new("agent.1");
        sender.attach_transport(bus.clone());
        let listener = receiver.spawn_listener(bus.as_ref()).await.unwrap();

        sender.set("swarm.command", "null");
        sender.send_modifieds().await.unwrap();
        for _ in 0..100 {
            if receiver.exists("swarm.command") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(receiver.text("swarm.command"), "null");
        listener.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn listener_waiting_on_hold_leaves_worker_free() {
        let bus = Arc::new(MemoryEventBus::new(16));
        let kb = KnowledgeBase::new("agent.0");
        let listener = kb.spawn_listener(bus.as_ref()).await.unwrap();

        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = {
            let kb = kb.clone();
            thread::spawn(move || {
                let _hold = kb.lock();
                held_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        };
        held_rx.recv().unwrap();

        let update = EventRecord::new(
            "agent.1",
            KNOWLEDGE_TOPIC,
            json!({ "entries": { "device.1.command": "debug" } }),
        );
        bus.publish(update).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let side_task = tokio::spawn(async { 7 });
        let value = tokio::time::timeout(Duration::from_secs(1), side_task)
            .await
            .expect("worker parked behind the store lock")
            .unwrap();
        assert_eq!(value, 7);
        assert!(!kb.exists("device.1.command"));

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        for _ in 0..100 {
            if kb.exists("device.1.command") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(kb.text("device.1.command"), "debug");
        listener.abort();
    }

    #[tokio::test]
    async fn empty_broadcast_publishes_nothing() {
        let bus = Arc::new(MemoryEventBus::new(4));
        let kb = KnowledgeBase::new("agent.0");
        kb.attach_transport(bus.clone());
        assert_eq!(kb.send_modifieds().await.unwrap(), 0);
        assert!(bus.snapshot().is_empty());
    }
}
