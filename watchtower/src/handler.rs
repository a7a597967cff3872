//! Handler dispatch: routing one dequeued event to the interested party.

use watchtower_types::Event;

/// A receiver of canonical events.
///
/// `dispatch` is the single non-reflective entry point the [`crate::Dispatcher`] calls; its
/// default implementation routes to the per-variant callbacks below by matching on
/// [`Event::label`], then always calls [`Handler::on_any_event`]. Implementors that only care
/// about one or two variants should override those callbacks and leave `dispatch` alone;
/// implementors that want full control over routing can override `dispatch` itself.
///
/// There is deliberately no reflective `on_<event>` name lookup here (the source this engine
/// is modeled on used one) — the match in the default `dispatch` is the whole mechanism.
pub trait Handler: Send + 'static {
    /// Non-blocking entry point called once per dequeued event.
    fn dispatch(&mut self, event: &Event) {
        match event.label() {
            "file_created" | "dir_created" => self.on_created(event),
            "file_deleted" | "dir_deleted" => self.on_deleted(event),
            "file_modified" | "dir_modified" => self.on_modified(event),
            "file_moved" | "dir_moved" => self.on_moved(event),
            "file_opened" => self.on_opened(event),
            "file_closed" | "file_closed_no_write" => self.on_closed(event),
            _ => {}
        }
        self.on_any_event(event);
    }

    /// Called for `file_created`/`dir_created` events. No-op by default.
    fn on_created(&mut self, _event: &Event) {}
    /// Called for `file_deleted`/`dir_deleted` events. No-op by default.
    fn on_deleted(&mut self, _event: &Event) {}
    /// Called for `file_modified`/`dir_modified` events. No-op by default.
    fn on_modified(&mut self, _event: &Event) {}
    /// Called for `file_moved`/`dir_moved` events. No-op by default.
    fn on_moved(&mut self, _event: &Event) {}
    /// Called for `file_opened` events. No-op by default.
    fn on_opened(&mut self, _event: &Event) {}
    /// Called for `file_closed`/`file_closed_no_write` events. No-op by default.
    fn on_closed(&mut self, _event: &Event) {}
    /// Called for every event, after the per-variant callback. No-op by default.
    fn on_any_event(&mut self, _event: &Event) {}
}

impl<F> Handler for F
where
    F: FnMut(&Event) + Send + 'static,
{
    fn dispatch(&mut self, event: &Event) {
        (self)(event)
    }
}
