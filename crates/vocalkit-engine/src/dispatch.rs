//! Hand-off from worker-side bus callbacks to the thread that owns the UI.

use std::{
    sync::{mpsc, Arc},
    time::{Duration, Instant},
};

use vocalkit_core::{Event, EventKind, ResultGate, Subscriber, WorkflowResult};

/// Bus subscriber that only queues events. The UI thread drains the paired
/// [`UiInbox`].
pub struct UiMailbox {
    tx: mpsc::Sender<Event>,
}

impl Subscriber for UiMailbox {
    fn receive(&self, event: Event) {
        // A closed inbox means the UI is gone; dropping the event is fine.
        let _ = self.tx.send(event);
    }
}

pub struct UiInbox {
    rx: mpsc::Receiver<Event>,
}

impl UiInbox {
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        self.rx.recv_timeout(timeout).ok()
    }
}

pub fn ui_channel() -> (Arc<UiMailbox>, UiInbox) {
    let (tx, rx) = mpsc::channel();
    (
        Arc::new(UiMailbox { tx }),
        UiInbox { rx },
    )
}

/// UI-side reactions. Only `on_result` is mandatory.
pub trait WorkflowDispatcher {
    fn on_progress(&mut self, _status: &str, _fraction: f64) {}

    fn on_install(&mut self, _event: &Event) {}

    fn on_timer(&mut self, _kind: EventKind, _value: u64) {}

    fn on_result(&mut self, task_id: Option<&str>, result: WorkflowResult, detail: Option<&str>);
}

/// Routes queued events to a dispatcher on the UI thread, admitting at most
/// one terminal result per task.
pub struct UiLoop<D> {
    inbox: UiInbox,
    gate: ResultGate,
    dispatcher: D,
}

impl<D: WorkflowDispatcher> UiLoop<D> {
    pub fn new(inbox: UiInbox, dispatcher: D) -> Self {
        Self {
            inbox,
            gate: ResultGate::new(),
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn into_dispatcher(self) -> D {
        self.dispatcher
    }

    /// Returns the terminal result if this event delivered one.
    pub fn route(&mut self, event: &Event) -> Option<WorkflowResult> {
        match event.kind() {
            EventKind::UpdateProgress => {
                if let (Some(status), Some(fraction)) = (event.text(), event.fraction()) {
                    self.dispatcher.on_progress(status, fraction);
                }
                None
            }
            EventKind::InstallStarted
            | EventKind::InstallProgress
            | EventKind::InstallSkipped
            | EventKind::InstallFailed => {
                self.dispatcher.on_install(event);
                None
            }
            EventKind::TimerHour | EventKind::TimerMinute | EventKind::TimerSecond => {
                if let Some(n) = event.count() {
                    self.dispatcher.on_timer(event.kind(), n);
                }
                None
            }
            EventKind::WorkflowResult => {
                let result = self.gate.admit(event)?;
                self.dispatcher
                    .on_result(event.task_id(), result, event.text());
                Some(result)
            }
        }
    }

    /// Routes whatever is queued right now.
    pub fn pump(&mut self) -> usize {
        let events = self.inbox.drain();
        for ev in &events {
            self.route(ev);
        }
        events.len()
    }

    /// Routes events until one terminal result is admitted or `timeout` passes.
    pub fn pump_until_result(&mut self, timeout: Duration) -> Option<WorkflowResult> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.checked_duration_since(Instant::now())?;
            let ev = self.inbox.recv_timeout(left)?;
            if let Some(result) = self.route(&ev) {
                return Some(result);
            }
        }
    }
}
