use super::event::Event;
use crate::sync::Arc;
use crossbeam::deque::{Injector, Worker};

/// A FIFO view over an [super::EventChannel]. Events are moved into the local queue on `fetch`,
/// so a consumer only sees what it has explicitly pulled.
pub struct EventConsumer {
    channel: Arc<Injector<Event>>,
    queue: Worker<Event>,
}

impl EventConsumer {
    pub fn new(channel: Arc<Injector<Event>>, queue: Worker<Event>) -> Self {
        Self { channel, queue }
    }

    pub fn fetch(&self) {
        let _steal = self.channel.steal_batch(&self.queue);
    }

    pub fn pop(&self) -> Option<Event> {
        self.queue.pop()
    }

    /// Fetch everything that is currently in the channel and return it in order.
    pub fn drain(&self) -> Vec<Event> {
        let mut events = vec![];
        loop {
            self.fetch();
            match self.pop() {
                Some(event) => events.push(event),
                None if self.channel.is_empty() => break,
                None => continue,
            }
        }
        events
    }

    pub fn is_empty(&self) -> bool {
        let _steal = self.channel.steal_batch(&self.queue);
        self.queue.is_empty()
    }
}

impl Iterator for &EventConsumer {
    type Item = Event;

    fn next(&mut self) -> Option<Self::Item> {
        self.pop()
    }
}
