//! Delivery of units and events to host callbacks.
//!
//! Readers never call host code. They post into a [`Mailbox`], and a
//! dedicated delivery thread ([`run_dispatcher`]) drains it and invokes the
//! callbacks, so a slow or blocking callback cannot stall socket reads.
//!
//! ```text
//! session worker ──push_unit──▶ ┌────────────────────────┐
//! UDP readers    ──push_unit──▶ │ video:  [newest]       │ ──next()──▶ delivery thread ──▶ on_video / ...
//!                ──push_event─▶ │ app:    [newest]       │
//!                               │ events: [..unbounded..]│
//!                               └────────────────────────┘
//! ```
//!
//! Unit queues are bounded (capacity 1 by default) and keep the newest
//! units; events are never dropped.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::{Condvar, Mutex};

use crate::error::{ErrorCode, RetrieverError};
use crate::media::{AssembledUnit, MediaKind, StreamDescriptor};
use crate::protocol::MediaDescription;

type Handler<T> = Box<dyn FnMut(T) + Send>;

/// Host callbacks, run on the delivery thread.
///
/// ```
/// use retriever::Callbacks;
///
/// let callbacks = Callbacks::new()
///     .on_video(|unit| println!("frame: {} bytes", unit.payload.len()))
///     .on_error(|event| eprintln!("{}: {}", event.code, event.message));
/// ```
#[derive(Default)]
pub struct Callbacks {
    on_video: Option<Handler<AssembledUnit>>,
    on_application_data: Option<Handler<AssembledUnit>>,
    on_session_start: Option<Handler<SessionStart>>,
    on_error: Option<Handler<ErrorEvent>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_video(mut self, f: impl FnMut(AssembledUnit) + Send + 'static) -> Self {
        self.on_video = Some(Box::new(f));
        self
    }

    pub fn on_application_data(mut self, f: impl FnMut(AssembledUnit) + Send + 'static) -> Self {
        self.on_application_data = Some(Box::new(f));
        self
    }

    /// Called once per established stream, before any of its units.
    pub fn on_session_start(mut self, f: impl FnMut(SessionStart) + Send + 'static) -> Self {
        self.on_session_start = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(ErrorEvent) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_video", &self.on_video.is_some())
            .field("on_application_data", &self.on_application_data.is_some())
            .field("on_session_start", &self.on_session_start.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Payload of the session-start callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStart {
    pub session_id: String,
    pub stream: StreamDescriptor,
    /// The SDP media section the stream was negotiated from.
    pub media: MediaDescription,
}

/// Payload of the error callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub code: ErrorCode,
    pub message: String,
    /// Stream the error concerns, when it is specific to one.
    pub media: Option<MediaKind>,
    /// The session ended because of this error.
    pub fatal: bool,
    /// Errors reported by this retriever so far, this one included.
    pub error_count: u64,
    pub timestamp: SystemTime,
}

impl ErrorEvent {
    pub fn new(
        error: &RetrieverError,
        media: Option<MediaKind>,
        fatal: bool,
        counter: &AtomicU64,
    ) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            media,
            fatal,
            error_count: counter.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: SystemTime::now(),
        }
    }
}

/// Non-unit messages; delivered in order, never dropped.
#[derive(Debug)]
pub enum Event {
    SessionStart(SessionStart),
    Error(ErrorEvent),
}

/// One item taken from the mailbox.
#[derive(Debug)]
pub enum Delivery {
    Unit(AssembledUnit),
    Event(Event),
}

#[derive(Debug, Default)]
struct Slots {
    video: VecDeque<AssembledUnit>,
    application: VecDeque<AssembledUnit>,
    events: VecDeque<Event>,
    /// Alternates between the unit queues so neither starves the other.
    prefer_application: bool,
    closed: bool,
}

impl Slots {
    fn queue(&mut self, kind: MediaKind) -> &mut VecDeque<AssembledUnit> {
        match kind {
            MediaKind::Video => &mut self.video,
            MediaKind::Application => &mut self.application,
        }
    }

    fn take(&mut self) -> Option<Delivery> {
        if let Some(event) = self.events.pop_front() {
            return Some(Delivery::Event(event));
        }
        let (first, second) = if self.prefer_application {
            (MediaKind::Application, MediaKind::Video)
        } else {
            (MediaKind::Video, MediaKind::Application)
        };
        self.prefer_application = !self.prefer_application;
        self.queue(first)
            .pop_front()
            .or_else(|| self.queue(second).pop_front())
            .map(Delivery::Unit)
    }
}

/// Bounded newest-wins handoff between readers and the delivery thread.
#[derive(Debug)]
pub struct Mailbox {
    slots: Mutex<Slots>,
    ready: Condvar,
    capacity: usize,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Queue a unit. When the stream's queue is full the oldest unit is
    /// replaced and `true` is returned. Never blocks on the consumer.
    pub fn push_unit(&self, unit: AssembledUnit) -> bool {
        let mut slots = self.slots.lock();
        if slots.closed {
            return false;
        }
        let capacity = self.capacity;
        let queue = slots.queue(unit.media_kind);
        let superseded = queue.len() >= capacity;
        if superseded {
            queue.pop_front();
        }
        queue.push_back(unit);
        drop(slots);
        self.ready.notify_one();
        superseded
    }

    pub fn push_event(&self, event: Event) {
        let mut slots = self.slots.lock();
        if slots.closed {
            tracing::debug!(?event, "event after close dropped");
            return;
        }
        slots.events.push_back(event);
        drop(slots);
        self.ready.notify_one();
    }

    /// Stop accepting items. Items already queued are still delivered.
    pub fn close(&self) {
        self.slots.lock().closed = true;
        self.ready.notify_all();
    }

    /// Block until an item is available. Returns `None` once the mailbox is
    /// closed and drained.
    pub fn next(&self) -> Option<Delivery> {
        let mut slots = self.slots.lock();
        loop {
            if let Some(delivery) = slots.take() {
                return Some(delivery);
            }
            if slots.closed {
                return None;
            }
            self.ready.wait(&mut slots);
        }
    }
}

/// Delivery loop. Runs until the mailbox is closed and drained, then hands
/// the callbacks back.
///
/// A panicking callback is reported through `on_error` as
/// [`ErrorCode::Callback`] once per panic; delivery continues with the next
/// item.
pub fn run_dispatcher(
    mailbox: Arc<Mailbox>,
    mut callbacks: Callbacks,
    error_count: Arc<AtomicU64>,
) -> Callbacks {
    tracing::debug!("delivery thread started");
    while let Some(delivery) = mailbox.next() {
        let (name, media, outcome) = match delivery {
            Delivery::Unit(unit) => {
                let kind = unit.media_kind;
                let (name, handler) = match kind {
                    MediaKind::Video => ("on_video", callbacks.on_video.as_mut()),
                    MediaKind::Application => {
                        ("on_application_data", callbacks.on_application_data.as_mut())
                    }
                };
                (name, Some(kind), invoke(handler, unit))
            }
            Delivery::Event(Event::SessionStart(start)) => {
                let kind = start.stream.media_kind;
                ("on_session_start", Some(kind), invoke(callbacks.on_session_start.as_mut(), start))
            }
            Delivery::Event(Event::Error(event)) => {
                if let Err(message) = invoke(callbacks.on_error.as_mut(), event) {
                    tracing::error!(message, "error callback panicked");
                }
                continue;
            }
        };

        if let Err(message) = outcome {
            let error = RetrieverError::Callback {
                callback: name,
                message,
            };
            tracing::warn!(error = %error, "callback panicked");
            let event = ErrorEvent::new(&error, media, false, &error_count);
            if let Err(message) = invoke(callbacks.on_error.as_mut(), event) {
                tracing::error!(message, "error callback panicked");
            }
        }
    }
    tracing::debug!("delivery thread finished");
    callbacks
}

fn invoke<T>(handler: Option<&mut Handler<T>>, value: T) -> Result<(), String> {
    let Some(handler) = handler else {
        return Ok(());
    };
    panic::catch_unwind(AssertUnwindSafe(|| handler(value))).map_err(|payload| {
        payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{DiagnosticsSnapshot, RtpInfo};
    use std::thread;

    fn unit(kind: MediaKind, tag: u8) -> AssembledUnit {
        AssembledUnit {
            media_kind: kind,
            payload: vec![tag],
            rtp_info: RtpInfo {
                sequence: tag as u16,
                timestamp: 0,
                extension: None,
                arrival: SystemTime::now(),
            },
            geometry: None,
            diagnostics: DiagnosticsSnapshot::default(),
        }
    }

    fn payload(delivery: Option<Delivery>) -> Vec<u8> {
        match delivery {
            Some(Delivery::Unit(unit)) => unit.payload,
            other => panic!("expected a unit, got {other:?}"),
        }
    }

    #[test]
    fn newest_unit_wins() {
        let mailbox = Mailbox::new(1);
        assert!(!mailbox.push_unit(unit(MediaKind::Video, 1)));
        assert!(mailbox.push_unit(unit(MediaKind::Video, 2)));
        assert!(mailbox.push_unit(unit(MediaKind::Video, 3)));
        mailbox.close();
        assert_eq!(payload(mailbox.next()), vec![3]);
        assert!(mailbox.next().is_none());
    }

    #[test]
    fn streams_do_not_supersede_each_other() {
        let mailbox = Mailbox::new(1);
        mailbox.push_unit(unit(MediaKind::Video, 1));
        assert!(!mailbox.push_unit(unit(MediaKind::Application, 2)));
        mailbox.close();
        let mut got = vec![payload(mailbox.next()), payload(mailbox.next())];
        got.sort();
        assert_eq!(got, vec![vec![1], vec![2]]);
    }

    #[test]
    fn events_are_never_dropped_and_come_first() {
        let counter = AtomicU64::new(0);
        let mailbox = Mailbox::new(1);
        mailbox.push_unit(unit(MediaKind::Video, 9));
        for _ in 0..5 {
            let event = ErrorEvent::new(&RetrieverError::Cancelled, None, false, &counter);
            mailbox.push_event(Event::Error(event));
        }
        mailbox.close();
        for expected in 1..=5 {
            match mailbox.next() {
                Some(Delivery::Event(Event::Error(e))) => assert_eq!(e.error_count, expected),
                other => panic!("expected error event, got {other:?}"),
            }
        }
        assert_eq!(payload(mailbox.next()), vec![9]);
    }

    #[test]
    fn larger_capacity_keeps_order() {
        let mailbox = Mailbox::new(3);
        for tag in 1..=4 {
            mailbox.push_unit(unit(MediaKind::Application, tag));
        }
        mailbox.close();
        let got: Vec<_> = (0..3).map(|_| payload(mailbox.next())).collect();
        assert_eq!(got, vec![vec![2], vec![3], vec![4]]);
    }

    #[test]
    fn panicking_callback_is_reported_once_and_delivery_continues() {
        let mailbox = Arc::new(Mailbox::new(4));
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));

        let seen = delivered.clone();
        let reported = errors.clone();
        let callbacks = Callbacks::new()
            .on_application_data(move |unit| {
                if unit.payload == [2] {
                    panic!("bad unit");
                }
                seen.lock().push(unit.payload[0]);
            })
            .on_error(move |event| reported.lock().push(event));

        for tag in 1..=3 {
            mailbox.push_unit(unit(MediaKind::Application, tag));
        }
        mailbox.close();

        let counter = Arc::new(AtomicU64::new(0));
        let m = mailbox.clone();
        let handle = thread::spawn(move || run_dispatcher(m, callbacks, counter));
        handle.join().unwrap();

        assert_eq!(*delivered.lock(), vec![1, 3]);
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, ErrorCode::Callback);
        assert!(errors[0].message.contains("bad unit"));
        assert_eq!(errors[0].media, Some(MediaKind::Application));
        assert!(!errors[0].fatal);
    }

    #[test]
    fn next_blocks_until_push() {
        let mailbox = Arc::new(Mailbox::new(1));
        let m = mailbox.clone();
        let consumer = thread::spawn(move || payload(m.next()));
        thread::sleep(std::time::Duration::from_millis(20));
        mailbox.push_unit(unit(MediaKind::Video, 7));
        assert_eq!(consumer.join().unwrap(), vec![7]);
    }
}
