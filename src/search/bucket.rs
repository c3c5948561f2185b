use std::collections::{BTreeMap, BTreeSet};

use tokio::time::Instant;

/// One retry tier of the search manager. A channel is either waiting to be sent in the next
///  tick, or waiting for a response to a search that was sent in the previous tick.
#[derive(Debug, Default)]
pub struct SearchBucket {
    awaiting_send: BTreeSet<u32>,
    /// channel id -> time the search was sent
    awaiting_response: BTreeMap<u32, Instant>,

    requests_sent: usize,
    responses: usize,
}

impl SearchBucket {
    pub fn insert(&mut self, cid: u32) {
        self.awaiting_response.remove(&cid);
        self.awaiting_send.insert(cid);
    }

    /// Returns the send time if the channel was awaiting a response
    pub fn remove(&mut self, cid: u32) -> Option<Instant> {
        self.awaiting_send.remove(&cid);
        self.awaiting_response.remove(&cid)
    }

    pub fn contains(&self, cid: u32) -> bool {
        self.awaiting_send.contains(&cid) || self.awaiting_response.contains_key(&cid)
    }

    pub fn is_awaiting_response(&self, cid: u32) -> bool {
        self.awaiting_response.contains_key(&cid)
    }

    pub fn awaiting_send(&self) -> impl Iterator<Item = u32> + '_ {
        self.awaiting_send.iter().copied()
    }

    pub fn mark_sent(&mut self, cid: u32, now: Instant) {
        if self.awaiting_send.remove(&cid) {
            self.awaiting_response.insert(cid, now);
            self.requests_sent += 1;
        }
    }

    pub fn on_response(&mut self) {
        self.responses += 1;
    }

    /// All channels that did not receive a response since the previous tick
    pub fn take_timed_out(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.awaiting_response).into_keys().collect()
    }

    pub fn take_all(&mut self) -> Vec<u32> {
        let mut result = self.take_timed_out();
        result.extend(std::mem::take(&mut self.awaiting_send));
        result
    }

    /// (requests sent, responses) since the previous call
    pub fn take_period_stats(&mut self) -> (usize, usize) {
        let result = (self.requests_sent, self.responses);
        self.requests_sent = 0;
        self.responses = 0;
        result
    }

    pub fn len(&self) -> usize {
        self.awaiting_send.len() + self.awaiting_response.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
