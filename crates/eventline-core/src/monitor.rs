//! Per-calendar background synchronization engine.
//!
//! A [`CalendarMonitor`] owns exactly one live view subscription against its
//! backend and keeps a deduplicated cache of the events visible in the
//! current query window. Range or filter changes tear the subscription down
//! and recreate it; raw components streamed by the backend are parsed,
//! recurrence masters are expanded into concrete instances, and the results
//! are republished to the owner context as add/update/remove notifications.
//!
//! ## Execution contexts
//!
//! Two contexts are active per monitor: the *owner context* — whatever
//! thread constructed the monitor and calls its public API — and a dedicated
//! *worker thread* spawned lazily on the first [`CalendarMonitor::set_range`].
//! All backend I/O happens on the worker; public calls never block on it.
//!
//! The worker drains a single ordered queue multiplexing control messages
//! and view events, completing each item before looking at the next, so no
//! two (re)subscriptions are ever in flight concurrently. Notifications
//! travel back on a second queue that the owner drains with
//! [`CalendarMonitor::process_notifications`] — a GUI shell would pump that
//! from its idle handler.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::backend::{
    CalendarBackend, CancellationToken, Subscription, ViewEvent, ViewEventSink, ViewFilter,
};
use crate::error::EventlineError;
use crate::event::{parse_event, ComponentId, Event, EventId, RawComponent};
use crate::range::{Overlap, Range};

/// Receives the monitor's cache-change notifications on the owner context.
pub trait MonitorListener: Send + Sync {
    fn on_event_added(&self, event: &Event);
    fn on_event_updated(&self, old: &Event, new: &Event);
    fn on_event_removed(&self, event: &Event);

    /// Initial backfill state changed: `true` once the first full result
    /// set of a fresh subscription has been applied, `false` when a new
    /// subscription starts loading.
    fn on_complete(&self, _complete: bool) {}
}

/// Control messages for the worker thread, processed strictly in send order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlMessage {
    CreateView,
    RemoveView,
    RangeUpdated,
    FilterUpdated,
    Quit,
}

/// Everything the worker's run loop multiplexes over.
enum WorkerInput {
    Control(ControlMessage),
    /// A view event tagged with the generation of the subscription that
    /// produced it; events from torn-down generations are dropped.
    View { generation: u64, event: ViewEvent },
}

/// Cache mutations marshaled from the worker to the owner context.
enum Notification {
    Add(Vec<Event>),
    Update(Vec<Event>),
    Remove(Vec<EventId>),
    Complete(bool),
}

/// State shared between the owner context and the worker. Lock scopes are
/// short: never held across a backend call or a listener callback.
struct SharedState {
    events: HashMap<EventId, Event>,
    range: Option<Range>,
    filter: Option<String>,
    visible: bool,
    /// Token of the in-flight (or most recent) subscription attempt; the
    /// owner cancels it before requesting a teardown/recreate.
    cancellable: Option<CancellationToken>,
}

struct Shared {
    calendar_id: String,
    backend: Arc<dyn CalendarBackend>,
    state: RwLock<SharedState>,
}

/// The per-calendar synchronization engine. See the module docs.
pub struct CalendarMonitor {
    shared: Arc<Shared>,
    listener: Arc<dyn MonitorListener>,
    worker_tx: Sender<WorkerInput>,
    /// Held until the worker thread is spawned; messages sent before that
    /// queue up and are processed in order once it starts.
    worker_rx: Option<Receiver<WorkerInput>>,
    notify_tx: Sender<Notification>,
    notify_rx: Receiver<Notification>,
    thread: Option<JoinHandle<()>>,
    complete: bool,
}

impl CalendarMonitor {
    pub fn new(
        calendar_id: impl Into<String>,
        backend: Arc<dyn CalendarBackend>,
        listener: Arc<dyn MonitorListener>,
    ) -> CalendarMonitor {
        let (worker_tx, worker_rx) = mpsc::channel();
        let (notify_tx, notify_rx) = mpsc::channel();

        CalendarMonitor {
            shared: Arc::new(Shared {
                calendar_id: calendar_id.into(),
                backend,
                state: RwLock::new(SharedState {
                    events: HashMap::new(),
                    range: None,
                    filter: None,
                    visible: true,
                    cancellable: None,
                }),
            }),
            listener,
            worker_tx,
            worker_rx: Some(worker_rx),
            notify_tx,
            notify_rx,
            thread: None,
            complete: false,
        }
    }

    pub fn calendar_id(&self) -> &str {
        &self.shared.calendar_id
    }

    /// Update the query window. This usually results in the monitor tearing
    /// down its view and gathering events for the new window from the
    /// backend. Events already cached that fall outside the new window are
    /// evicted synchronously, before any resubscription activity.
    pub fn set_range(&mut self, range: Range) {
        {
            let mut state = self.shared.state.write();
            let changed = match &state.range {
                Some(current) => current.overlap(&range).0 != Overlap::Equal,
                None => true,
            };
            if !changed {
                return;
            }
            state.range = Some(range);
        }

        self.maybe_spawn_worker();
        self.remove_events_outside_range(&range);
        self.cancel_inflight();

        if self.is_visible() {
            self.send_control(ControlMessage::RangeUpdated);
        }
    }

    /// Replace the user filter expression. The entire cache is cleared
    /// synchronously (one removal per entry) before the new subscription is
    /// opened.
    pub fn set_filter(&mut self, filter: Option<String>) {
        self.shared.state.write().filter = filter;

        self.remove_all_events();
        self.cancel_inflight();

        if self.is_visible() {
            self.send_control(ControlMessage::FilterUpdated);
        }
    }

    /// External visibility signal for the owning calendar. A hidden
    /// calendar keeps no subscription and no cached events.
    pub fn set_visible(&mut self, visible: bool) {
        self.shared.state.write().visible = visible;

        if visible {
            self.send_control(ControlMessage::CreateView);
        } else {
            self.remove_all_events();
            self.send_control(ControlMessage::RemoveView);
        }
    }

    /// Cache-only lookup; never touches the backend.
    pub fn get_cached_event(&self, id: &EventId) -> Option<Event> {
        self.shared.state.read().events.get(id).cloned()
    }

    /// Whether the initial backfill of the current subscription has been
    /// fully applied.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Apply all pending worker notifications to the cache, invoking the
    /// listener per resulting change. Must be called on the owner context;
    /// notifications are applied one at a time, in the order the worker
    /// scheduled them.
    pub fn process_notifications(&mut self) {
        while let Ok(notification) = self.notify_rx.try_recv() {
            self.apply_notification(notification);
        }
    }

    fn apply_notification(&mut self, notification: Notification) {
        match notification {
            Notification::Add(events) => {
                let mut added = Vec::with_capacity(events.len());
                {
                    let mut state = self.shared.state.write();
                    for event in events {
                        // A duplicate delivery for a cached id is a silent
                        // no-op, not an update.
                        if !state.events.contains_key(event.id()) {
                            state.events.insert(event.id().clone(), event.clone());
                            added.push(event);
                        }
                    }
                }
                for event in &added {
                    self.listener.on_event_added(event);
                }
            }

            Notification::Update(events) => {
                let mut updated = Vec::with_capacity(events.len());
                {
                    let mut state = self.shared.state.write();
                    for event in events {
                        // An update racing ahead of its add is dropped.
                        if let Entry::Occupied(mut slot) = state.events.entry(event.id().clone()) {
                            let old = slot.insert(event.clone());
                            updated.push((old, event));
                        }
                    }
                }
                for (old, new) in &updated {
                    self.listener.on_event_updated(old, new);
                }
            }

            Notification::Remove(ids) => {
                let mut removed = Vec::with_capacity(ids.len());
                {
                    let mut state = self.shared.state.write();
                    for id in &ids {
                        if let Some(event) = state.events.remove(id) {
                            removed.push(event);
                        }
                    }
                }
                for event in &removed {
                    self.listener.on_event_removed(event);
                }
            }

            Notification::Complete(complete) => {
                if self.complete != complete {
                    trace!(calendar = %self.shared.calendar_id, complete, "complete changed");
                    self.complete = complete;
                    self.listener.on_complete(complete);
                }
            }
        }
    }

    fn is_visible(&self) -> bool {
        self.shared.state.read().visible
    }

    fn send_control(&self, message: ControlMessage) {
        // The worker only disappears on Quit, so a send failure here can
        // only happen during teardown.
        let _ = self.worker_tx.send(WorkerInput::Control(message));
    }

    fn cancel_inflight(&self) {
        let token = self.shared.state.read().cancellable.clone();
        if let Some(token) = token {
            token.cancel();
        }
    }

    fn maybe_spawn_worker(&mut self) {
        let Some(rx) = self.worker_rx.take() else {
            return;
        };

        let worker = Worker {
            shared: Arc::clone(&self.shared),
            worker_tx: self.worker_tx.clone(),
            notify_tx: self.notify_tx.clone(),
            generation: 0,
            populated: false,
            backfill_started: false,
            pending: HashMap::new(),
            subscription: None,
        };

        let name = format!("calendar-monitor ({})", self.shared.calendar_id);
        debug!("spawning thread {name}");

        self.thread = Some(
            std::thread::Builder::new()
                .name(name)
                .spawn(move || worker.run(rx))
                .expect("failed to spawn calendar monitor thread"),
        );
    }

    /// Synchronously evict every cached event whose range no longer
    /// overlaps `range`, emitting one removal per eviction.
    fn remove_events_outside_range(&self, range: &Range) {
        trace!(calendar = %self.shared.calendar_id, "removing events outside range");

        let mut removed = Vec::new();
        {
            let mut state = self.shared.state.write();
            state.events.retain(|_, event| {
                if range.overlap(event.range()).0 != Overlap::NoOverlap {
                    return true;
                }
                removed.push(event.clone());
                false
            });
        }

        for event in &removed {
            self.listener.on_event_removed(event);
        }
    }

    /// Synchronously clear the cache, emitting one removal per entry.
    fn remove_all_events(&self) {
        trace!(calendar = %self.shared.calendar_id, "removing all events");

        let removed: Vec<Event> = {
            let mut state = self.shared.state.write();
            state.events.drain().map(|(_, event)| event).collect()
        };

        for event in &removed {
            self.listener.on_event_removed(event);
        }
    }
}

impl Drop for CalendarMonitor {
    fn drop(&mut self) {
        self.cancel_inflight();
        self.send_control(ControlMessage::Quit);

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }

        self.remove_all_events();
    }
}

/// Worker-thread half of the monitor. Every field here is only ever touched
/// on the worker thread.
struct Worker {
    shared: Arc<Shared>,
    worker_tx: Sender<WorkerInput>,
    notify_tx: Sender<Notification>,
    /// Bumped on every teardown so deliveries from stale sinks are ignored.
    generation: u64,
    /// True once the initial backfill has been flushed.
    populated: bool,
    /// True while backfill batches have started arriving but have not been
    /// flushed yet.
    backfill_started: bool,
    /// Backfill accumulation buffer, keyed by event id (last write wins).
    pending: HashMap<EventId, Event>,
    subscription: Option<Box<dyn Subscription>>,
}

impl Worker {
    fn run(mut self, rx: Receiver<WorkerInput>) {
        while let Ok(input) = rx.recv() {
            match input {
                WorkerInput::Control(message) => match message {
                    ControlMessage::RangeUpdated | ControlMessage::FilterUpdated => {
                        self.remove_view();
                        self.create_view();
                    }
                    ControlMessage::CreateView => self.create_view(),
                    ControlMessage::RemoveView => self.remove_view(),
                    ControlMessage::Quit => {
                        self.remove_view();
                        break;
                    }
                },

                WorkerInput::View { generation, event } => {
                    if generation != self.generation {
                        trace!(calendar = %self.shared.calendar_id, "dropping stale view event");
                        continue;
                    }
                    match event {
                        ViewEvent::Added(components) => self.on_objects_added(components),
                        ViewEvent::Modified(components) => self.on_objects_modified(components),
                        ViewEvent::Removed(ids) => self.on_objects_removed(ids),
                        ViewEvent::Complete => self.on_view_complete(),
                    }
                }
            }
        }
    }

    fn notify(&self, notification: Notification) {
        // The owner half owns the receiver for the monitor's lifetime.
        let _ = self.notify_tx.send(notification);
    }

    fn current_range(&self) -> Option<Range> {
        self.shared.state.read().range
    }

    fn current_token(&self) -> CancellationToken {
        self.shared
            .state
            .read()
            .cancellable
            .clone()
            .unwrap_or_default()
    }

    fn create_view(&mut self) {
        if self.subscription.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let (filter, visible) = {
            let mut state = self.shared.state.write();
            state.cancellable = Some(token.clone());

            let Some(range) = state.range else {
                return;
            };
            (
                ViewFilter::from_window(&range, state.filter.as_deref()),
                state.visible,
            )
        };

        // Do not open a view for an invisible calendar.
        if !visible {
            return;
        }

        let mut subscription = match self.shared.backend.open_filtered_view(&filter, &token) {
            Ok(subscription) => subscription,
            Err(EventlineError::Cancelled) => {
                trace!(calendar = %self.shared.calendar_id, "view creation cancelled");
                return;
            }
            Err(e) => {
                warn!(calendar = %self.shared.calendar_id, "error creating view: {e}");
                return;
            }
        };

        trace!(calendar = %self.shared.calendar_id, "initialized view with query \"{filter}\"");

        self.generation += 1;
        let generation = self.generation;
        let tx = self.worker_tx.clone();
        let sink = ViewEventSink::new(Arc::new(move |event| {
            let _ = tx.send(WorkerInput::View { generation, event });
        }));

        if token.is_cancelled() {
            self.discard(subscription);
            return;
        }

        debug!(calendar = %self.shared.calendar_id, "starting view");

        if let Err(e) = subscription.start(sink) {
            warn!(calendar = %self.shared.calendar_id, "error starting up view: {e}");
            self.discard(subscription);
            return;
        }

        self.subscription = Some(subscription);
        self.populated = false;
        self.backfill_started = false;
        self.pending.clear();

        self.notify(Notification::Complete(false));
    }

    /// Dispose of a subscription that never went live, so the backend can
    /// release whatever it allocated at open time.
    fn discard(&self, mut subscription: Box<dyn Subscription>) {
        if let Err(e) = subscription.stop() {
            warn!(calendar = %self.shared.calendar_id, "error stopping unstarted view: {e}");
        }
    }

    fn remove_view(&mut self) {
        self.shared.state.write().cancellable = None;

        // Invalidate any event still in flight from the old sink.
        self.generation += 1;

        if let Some(mut subscription) = self.subscription.take() {
            debug!(calendar = %self.shared.calendar_id, "tearing down view");

            if let Err(e) = subscription.stop() {
                warn!(calendar = %self.shared.calendar_id, "error stopping view: {e}");
            }
        }

        self.populated = false;
        self.backfill_started = false;
        self.pending.clear();
    }

    /// Accept a parsed, in-window event: buffered while backfilling,
    /// forwarded live once populated.
    fn accept(
        populated: bool,
        pending: &mut HashMap<EventId, Event>,
        live: &mut Vec<Event>,
        event: Event,
    ) {
        if populated {
            live.push(event);
        } else {
            pending.insert(event.id().clone(), event);
        }
    }

    fn on_objects_added(&mut self, components: Vec<RawComponent>) {
        let Some(range) = self.current_range() else {
            return;
        };
        let token = self.current_token();

        if !self.populated {
            self.backfill_started = true;
        }

        let calendar_id = self.shared.calendar_id.clone();
        let backend = Arc::clone(&self.shared.backend);
        let populated = self.populated;
        let pending = &mut self.pending;

        let mut components_to_expand = Vec::new();
        let mut events_to_add = Vec::new();

        for component in components {
            if token.is_cancelled() {
                return;
            }

            if component.uid.is_none() {
                continue;
            }

            // Recurrent events will be processed later.
            if component.is_recurrence_master() {
                trace!(
                    uid = component.uid.as_deref().unwrap_or_default(),
                    "component needs to be expanded"
                );
                components_to_expand.push(component);
                continue;
            }

            let event = match parse_event(&calendar_id, &component) {
                Ok(event) => event,
                Err(e) => {
                    warn!("error creating event: {e}");
                    continue;
                }
            };

            // Only keep events that still overlap the current window.
            if range.overlap(event.range()).0 == Overlap::NoOverlap {
                continue;
            }

            Self::accept(populated, pending, &mut events_to_add, event);
        }

        for master in &components_to_expand {
            if token.is_cancelled() {
                return;
            }

            let mut generated = 0usize;
            backend.generate_instances(
                master,
                range.start(),
                range.end(),
                &token,
                &mut |instance| {
                    let event = match parse_event(&calendar_id, &instance) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("error creating event instance: {e}");
                            return;
                        }
                    };

                    if range.overlap(event.range()).0 == Overlap::NoOverlap {
                        return;
                    }

                    generated += 1;
                    Self::accept(populated, pending, &mut events_to_add, event);
                },
            );

            trace!(
                uid = master.uid.as_deref().unwrap_or_default(),
                instances = generated,
                "expanded recurrences in {range}"
            );
        }

        if !events_to_add.is_empty() {
            self.notify(Notification::Add(events_to_add));
        }
    }

    fn on_objects_modified(&mut self, components: Vec<RawComponent>) {
        // A modification arriving mid-backfill resets the accumulation:
        // the buffer may hold stale versions of the modified components.
        // Deliberately conservative.
        if !self.populated && self.backfill_started {
            self.pending.clear();
            self.backfill_started = false;
            return;
        }

        let Some(range) = self.current_range() else {
            return;
        };
        let token = self.current_token();
        let calendar_id = self.shared.calendar_id.clone();
        let backend = Arc::clone(&self.shared.backend);

        let cached_ids: HashSet<EventId> = {
            let state = self.shared.state.read();
            state.events.keys().cloned().collect()
        };

        let mut components_to_expand = Vec::new();
        let mut events_to_update = Vec::new();
        let mut ids_to_remove: HashSet<EventId> = HashSet::new();

        for component in components {
            if token.is_cancelled() {
                return;
            }

            let Some(uid) = component.uid.clone() else {
                continue;
            };

            let recurrence_main = component.is_recurrence_master();

            /*
             * If the component has no recurrence id, it is either a
             * recurrence master or a plain non-recurring event. If it went
             * from recurring to non-recurring, the instances of the old
             * recurrence are still cached and need to be removed.
             */
            if component.recurrence_id.is_none() {
                let master_id = EventId::new(&calendar_id, &uid, None);

                for cached in &cached_ids {
                    if cached.is_instance_of(&master_id)
                        || (recurrence_main && *cached == master_id)
                    {
                        ids_to_remove.insert(cached.clone());
                    }
                }
            }

            // Recurrent events will be processed later.
            if recurrence_main {
                trace!(uid = uid.as_str(), "component needs to be expanded");
                components_to_expand.push(component);
                continue;
            }

            match parse_event(&calendar_id, &component) {
                Ok(event) => events_to_update.push(event),
                Err(e) => warn!("error creating event: {e}"),
            }
        }

        // Re-expand the modified masters; an expanded instance whose id is
        // already cached becomes an update, everything else is an add.
        let mut events_to_add = Vec::new();

        for master in &components_to_expand {
            if token.is_cancelled() {
                return;
            }

            backend.generate_instances(
                master,
                range.start(),
                range.end(),
                &token,
                &mut |instance| {
                    let event = match parse_event(&calendar_id, &instance) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("error creating event instance: {e}");
                            return;
                        }
                    };

                    if range.overlap(event.range()).0 == Overlap::NoOverlap {
                        return;
                    }

                    if cached_ids.contains(event.id()) {
                        ids_to_remove.remove(event.id());
                        events_to_update.push(event);
                    } else {
                        events_to_add.push(event);
                    }
                },
            );
        }

        if !events_to_add.is_empty() {
            self.notify(Notification::Add(events_to_add));
        }

        if !events_to_update.is_empty() {
            self.notify(Notification::Update(events_to_update));
        }

        // Now remove lingering events.
        if !ids_to_remove.is_empty() {
            self.notify(Notification::Remove(ids_to_remove.into_iter().collect()));
        }
    }

    fn on_objects_removed(&mut self, component_ids: Vec<ComponentId>) {
        let token = self.current_token();
        let calendar_id = self.shared.calendar_id.clone();
        let mut event_ids = Vec::new();

        for component_id in component_ids {
            if token.is_cancelled() {
                return;
            }

            match component_id.recurrence_id.as_deref() {
                Some(rid) => {
                    event_ids.push(EventId::new(&calendar_id, &component_id.uid, Some(rid)));
                }
                None => {
                    let master_id = EventId::new(&calendar_id, &component_id.uid, None);

                    // A removed master takes its expanded recurrence
                    // instances with it.
                    {
                        let state = self.shared.state.read();
                        for cached in state.events.keys() {
                            if cached.is_instance_of(&master_id) {
                                event_ids.push(cached.clone());
                            }
                        }
                    }

                    event_ids.push(master_id);
                }
            }
        }

        if !event_ids.is_empty() {
            self.notify(Notification::Remove(event_ids));
        }
    }

    fn on_view_complete(&mut self) {
        debug_assert!(!self.populated);

        let events_to_add: Vec<Event> = self.pending.drain().map(|(_, event)| event).collect();
        self.backfill_started = false;

        if !events_to_add.is_empty() {
            self.notify(Notification::Add(events_to_add));
        }

        self.populated = true;
        self.notify(Notification::Complete(true));

        debug!(calendar = %self.shared.calendar_id, "finished initial loading");
    }
}
