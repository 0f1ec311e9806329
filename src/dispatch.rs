/// Typed event bus between the pipeline and its consumers.
///
/// Delivery is synchronous, on the publishing thread, in subscription
/// order. A failing listener is logged and the remaining listeners still
/// receive the event.
use crate::encounter::Encounter;
use crate::linker::Link;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A new observation, after it was folded into the tracker.
    Encounter(Encounter),
    /// The linker discovered a continuation.
    Linked(Link),
    /// The source stopped for good, with the reason.
    SourceClosed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Encounter,
    Linked,
    SourceClosed,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Encounter, EventKind::Linked, EventKind::SourceClosed];
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Encounter(_) => EventKind::Encounter,
            Event::Linked(_) => EventKind::Linked,
            Event::SourceClosed(_) => EventKind::SourceClosed,
        }
    }
}

/// A downstream consumer of pipeline events.
pub trait Listener {
    fn name(&self) -> &str {
        "listener"
    }

    fn handle(&mut self, event: &Event) -> anyhow::Result<()>;
}

impl<F> Listener for F
where
    F: FnMut(&Event) -> anyhow::Result<()>,
{
    fn handle(&mut self, event: &Event) -> anyhow::Result<()> {
        self(event)
    }
}

#[derive(Default)]
pub struct Dispatcher {
    listeners: Vec<Box<dyn Listener>>,
    /// `(kind, listener slot)` in subscription order.
    subscriptions: Vec<(EventKind, usize)>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, kind: EventKind, listener: impl Listener + 'static) {
        self.subscribe_many(&[kind], listener);
    }

    /// Subscribe one listener instance to several event kinds.
    pub fn subscribe_many(&mut self, kinds: &[EventKind], listener: impl Listener + 'static) {
        let slot = self.listeners.len();
        self.listeners.push(Box::new(listener));
        for &kind in kinds {
            self.subscriptions.push((kind, slot));
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscriptions.iter().filter(|(k, _)| *k == kind).count()
    }

    /// Deliver `event` to every subscriber of its kind. Returns how many
    /// listeners handled it without error.
    pub fn publish(&mut self, event: &Event) -> usize {
        let kind = event.kind();
        let mut delivered = 0;
        for &(sub_kind, slot) in &self.subscriptions {
            if sub_kind != kind {
                continue;
            }
            let listener = &mut self.listeners[slot];
            match listener.handle(event) {
                Ok(()) => delivered += 1,
                Err(e) => log::error!("Listener '{}' failed on {:?}: {:#}", listener.name(), kind, e),
            }
        }
        delivered
    }
}
