use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};

use vocalkit_observability::{safe_eprintln, trace};

use crate::events::Event;

/// Receives events from an [`EventBus`].
///
/// `receive` runs inline on the publishing thread, which is usually a worker.
/// Implementations that touch UI-owned state must hand the event over to the
/// UI thread themselves.
pub trait Subscriber: Send + Sync {
    fn receive(&self, event: Event);
}

impl<F> Subscriber for F
where
    F: Fn(Event) + Send + Sync,
{
    fn receive(&self, event: Event) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Entry {
    id: SubscriptionId,
    addr: usize,
    listener: Weak<dyn Subscriber>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.listener.strong_count() > 0
    }
}

fn addr_of<S: ?Sized>(listener: &Arc<S>) -> usize {
    Arc::as_ptr(listener).cast::<()>() as usize
}

/// Direct-dispatch publish/subscribe bus.
///
/// The bus only holds weak references: callers keep their listeners alive and
/// remove them explicitly. Nothing is buffered, so a late subscriber never sees
/// earlier events.
pub struct EventBus {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    trace_dir: Option<PathBuf>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("trace_dir", &self.trace_dir)
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            trace_dir: None,
        }
    }

    /// Listener failures are additionally written to the trace file in `data_dir`.
    pub fn with_trace_dir(data_dir: &Path) -> Self {
        Self {
            trace_dir: Some(data_dir.to_path_buf()),
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn insert(&self, addr: usize, listener: Weak<dyn Subscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.lock();
        entries.retain(Entry::is_live);
        entries.push(Entry { id, addr, listener });
        id
    }

    pub fn subscribe<S: Subscriber + 'static>(&self, listener: &Arc<S>) -> SubscriptionId {
        let weak: Weak<S> = Arc::downgrade(listener);
        self.insert(addr_of(listener), weak)
    }

    pub fn subscribe_dyn(&self, listener: &Arc<dyn Subscriber>) -> SubscriptionId {
        self.insert(addr_of(listener), Arc::downgrade(listener))
    }

    /// Removes one registration of `listener`. Safe to call from inside that
    /// listener's own `receive`; the publish in progress is not affected.
    pub fn unsubscribe<S: ?Sized>(&self, listener: &Arc<S>) -> bool {
        let addr = addr_of(listener);
        let mut entries = self.lock();
        match entries.iter().position(|e| e.addr == addr && e.is_live()) {
            Some(i) => {
                entries.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe_id(&self, id: SubscriptionId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().iter().filter(|e| e.is_live()).count()
    }

    /// Delivers `event` to every current subscriber, in subscription order,
    /// on the calling thread. A panicking listener is logged and skipped.
    /// Returns how many listeners completed `receive` normally.
    pub fn publish(&self, event: Event) -> usize {
        let snapshot: Vec<(SubscriptionId, Weak<dyn Subscriber>)> = {
            let mut entries = self.lock();
            entries.retain(Entry::is_live);
            entries.iter().map(|e| (e.id, e.listener.clone())).collect()
        };

        let mut delivered = 0;
        for (id, weak) in snapshot {
            let Some(listener) = weak.upgrade() else {
                continue;
            };
            let copy = event.clone();
            match catch_unwind(AssertUnwindSafe(|| listener.receive(copy))) {
                Ok(()) => delivered += 1,
                Err(payload) => self.report_listener_panic(id, &event, payload.as_ref()),
            }
        }
        delivered
    }

    fn report_listener_panic(
        &self,
        id: SubscriptionId,
        event: &Event,
        payload: &(dyn std::any::Any + Send),
    ) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        safe_eprintln!(
            "event bus: listener {} panicked on {}: {message}",
            id.0,
            event.kind().as_str()
        );
        if let Some(dir) = &self.trace_dir {
            trace::event(
                dir,
                event.task_id(),
                "EventBus",
                "BUS.listener_panic",
                "err",
                Some(serde_json::json!({
                    "subscription": id.0,
                    "event": event.kind().as_str(),
                    "message": message,
                })),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::sync::OnceLock;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<EventKind>>,
    }

    impl Subscriber for Recorder {
        fn receive(&self, event: Event) {
            self.seen.lock().unwrap().push(event.kind());
        }
    }

    impl Recorder {
        fn seen(&self) -> Vec<EventKind> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[test]
    fn publish_reaches_subscribers_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let first = Arc::new(move |_ev: Event| o1.lock().unwrap().push(1));
        let second = Arc::new(move |_ev: Event| o2.lock().unwrap().push(2));
        bus.subscribe(&first);
        bus.subscribe(&second);

        assert_eq!(bus.publish(Event::install_skipped()), 2);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn concrete_listener_subscribes_without_manual_coercion() {
        let bus = EventBus::new();
        let rec: Arc<Recorder> = Arc::new(Recorder::default());
        bus.subscribe(&rec);
        bus.publish(Event::install_started());
        assert!(bus.unsubscribe(&rec));
        bus.publish(Event::install_skipped());
        assert_eq!(rec.seen(), vec![EventKind::InstallStarted]);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn late_subscriber_does_not_see_earlier_events() {
        let bus = EventBus::new();
        bus.publish(Event::install_started());
        let rec = Arc::new(Recorder::default());
        bus.subscribe(&rec);
        bus.publish(Event::install_skipped());
        assert_eq!(rec.seen(), vec![EventKind::InstallSkipped]);
    }

    struct SelfRemoving {
        bus: Arc<EventBus>,
        me: OnceLock<Weak<SelfRemoving>>,
        calls: Mutex<u32>,
    }

    impl Subscriber for SelfRemoving {
        fn receive(&self, _event: Event) {
            *self.calls.lock().unwrap() += 1;
            if let Some(me) = self.me.get().and_then(Weak::upgrade) {
                self.bus.unsubscribe(&me);
            }
        }
    }

    #[test]
    fn unsubscribe_from_own_callback_applies_to_next_publish() {
        let bus = Arc::new(EventBus::new());
        let leaver = Arc::new(SelfRemoving {
            bus: bus.clone(),
            me: OnceLock::new(),
            calls: Mutex::new(0),
        });
        let _ = leaver.me.set(Arc::downgrade(&leaver));
        let stayer = Arc::new(Recorder::default());
        bus.subscribe(&leaver);
        bus.subscribe(&stayer);

        bus.publish(Event::install_started());
        bus.publish(Event::install_skipped());

        assert_eq!(*leaver.calls.lock().unwrap(), 1);
        assert_eq!(
            stayer.seen(),
            vec![EventKind::InstallStarted, EventKind::InstallSkipped]
        );
        assert_eq!(bus.subscriber_count(), 1);
    }

    fn exploding(_ev: Event) {
        panic!("listener exploded");
    }

    #[test]
    fn panicking_listener_does_not_block_the_rest() {
        let bus = EventBus::new();
        let bad = Arc::new(exploding);
        let good = Arc::new(Recorder::default());
        bus.subscribe(&bad);
        bus.subscribe(&good);

        let delivered = bus.publish(Event::install_skipped());
        assert_eq!(delivered, 1);
        assert_eq!(good.seen(), vec![EventKind::InstallSkipped]);
    }

    #[test]
    fn dropped_listener_is_pruned() {
        let bus = EventBus::new();
        let rec = Arc::new(Recorder::default());
        bus.subscribe(&rec);
        assert_eq!(bus.subscriber_count(), 1);
        drop(rec);
        assert_eq!(bus.publish(Event::install_skipped()), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_by_id_and_dyn_handle() {
        let bus = EventBus::new();
        let rec = Arc::new(Recorder::default());
        let id = bus.subscribe(&rec);
        assert!(bus.unsubscribe_id(id));
        assert!(!bus.unsubscribe_id(id));

        let dyn_rec: Arc<dyn Subscriber> = rec.clone();
        bus.subscribe_dyn(&dyn_rec);
        assert!(bus.unsubscribe(&dyn_rec));
        assert_eq!(bus.publish(Event::install_skipped()), 0);
        assert!(rec.seen().is_empty());
    }

    #[test]
    fn publish_from_many_threads_delivers_everything() {
        let bus = Arc::new(EventBus::new());
        let rec = Arc::new(Recorder::default());
        bus.subscribe(&rec);
        let joins: Vec<_> = (0..4)
            .map(|_| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        bus.publish(Event::progress("tick", 0.5));
                    }
                })
            })
            .collect();
        for j in joins {
            j.join().expect("join");
        }
        assert_eq!(rec.seen().len(), 100);
    }
}
