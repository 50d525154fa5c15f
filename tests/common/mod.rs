use dagrun::{EventSink, JobEvent};
use std::sync::{Arc, Mutex};

/// Event sink that records every emitted event for later assertions.
pub fn capture_events() -> (EventSink, Arc<Mutex<Vec<JobEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::clone(&events);
    let sink: EventSink = Arc::new(move |event: &JobEvent| {
        store.lock().unwrap().push(event.clone());
    });
    (sink, events)
}

/// Index of the first event matching `pred`, or a panic naming the miss.
#[allow(dead_code)]
pub fn position_of(events: &[JobEvent], what: &str, pred: impl Fn(&JobEvent) -> bool) -> usize {
    events
        .iter()
        .position(pred)
        .unwrap_or_else(|| panic!("no {what} event in {events:?}"))
}
