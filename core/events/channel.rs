use super::event::Event;
use super::EventConsumer;
use crate::sync::Arc;
use crossbeam::deque::{Injector, Worker};

#[derive(Clone, Debug, Default)]
pub struct EventChannel {
    bus: Arc<Injector<Event>>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.bus.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bus.len()
    }

    pub fn send<E>(&self, event: E)
    where
        E: Into<Event>,
    {
        self.bus.push(event.into())
    }

    pub fn consumer(&self) -> EventConsumer {
        EventConsumer::new(self.bus.clone(), Worker::new_fifo())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event::JobEvent;
    use crate::model::JobState;

    #[test]
    fn new_event_channel_is_empty() {
        let ec = EventChannel::new();
        assert!(ec.is_empty());
        assert!(ec.consumer().is_empty());
    }

    #[quickcheck]
    fn event_consumer_needs_to_fetch_to_get_messages(event: Event) {
        let ec = EventChannel::new();
        let c = ec.consumer();
        ec.send(event);
        assert!(c.pop().is_none());
        c.fetch();
        assert!(c.pop().is_some());
    }

    #[quickcheck]
    fn events_are_received_in_the_order_they_are_sent(events: Vec<Event>) {
        let ec = EventChannel::new();
        let c = ec.consumer();

        for event in &events {
            ec.send(event.clone());
        }

        assert_eq!(c.drain(), events);
        assert!(ec.is_empty());
        assert!(c.pop().is_none());
    }

    #[test]
    fn job_events_are_wrapped_on_send() {
        let ec = EventChannel::new();
        let c = ec.consumer();
        ec.send(JobEvent::JobStateChanged {
            pipeline: "edges".into(),
            job: "j1".into(),
            state: JobState::Success,
            reason: None,
        });
        assert_eq!(ec.len(), 1);
        c.fetch();
        assert_matches!(
            c.pop(),
            Some(Event::JobEvent(JobEvent::JobStateChanged { state: JobState::Success, .. }))
        );
    }
}
