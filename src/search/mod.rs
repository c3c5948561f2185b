//! Channel name resolution over UDP.
//!
//! Channels waiting for resolution live in *buckets*: retry tiers with a timer period of
//!  `2^index * RTT`. A newly registered channel starts in bucket 0. When a bucket's timer fires,
//!  every channel that was sent in the previous tick and got no response moves on to the next
//!  slower bucket, and the bucket's waiting channels are batched into search frames. The
//!  number of frames per tick is limited by an adaptive budget (see [congestion]).
//!
//! A channel is in exactly one bucket at any time. All of this state is guarded by one lock, so
//!  moving a channel is atomic.

pub mod beacon;
pub mod bucket;
pub mod congestion;
pub mod udp;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

use crate::config::ClientConfig;
use crate::protocol::messages::{SearchFlags, SearchFrame, SearchResponse};
use crate::search::bucket::SearchBucket;
use crate::search::congestion::FramesPerTry;
use crate::search::udp::SearchSocket;

/// Something that can be searched for, i.e. a channel
pub trait Searchable: Send + Sync {
    fn search_id(&self) -> u32;
    fn search_name(&self) -> &str;
    /// Called without any search manager locks held
    fn search_response(&self, server_addr: SocketAddr);
}

/// number of recently sent frames whose sequence ids are accepted for RTT measurement
const SEQUENCE_WINDOW: usize = 128;

struct SearchEntry {
    channel: Arc<dyn Searchable>,
    bucket: usize,
}

struct SearchState {
    buckets: Vec<SearchBucket>,
    entries: FxHashMap<u32, SearchEntry>,
    budget: FramesPerTry,
    rtt: Duration,
    next_sequence_id: u32,
    /// (sequence id, send time) of recently sent frames
    sent_frames: VecDeque<(u32, Instant)>,
}

impl SearchState {
    fn move_to(&mut self, cid: u32, target: usize) {
        if let Some(entry) = self.entries.get_mut(&cid) {
            self.buckets[entry.bucket].remove(cid);
            self.buckets[target].insert(cid);
            entry.bucket = target;
        }
    }

    fn next_frame(&mut self, config: &ClientConfig, response_addr: SocketAddr, now: Instant) -> SearchFrame {
        let sequence_id = self.next_sequence_id;
        self.next_sequence_id = self.next_sequence_id.wrapping_add(1);

        if self.sent_frames.len() == SEQUENCE_WINDOW {
            self.sent_frames.pop_front();
        }
        self.sent_frames.push_back((sequence_id, now));

        SearchFrame::new(
            sequence_id,
            response_addr,
            SearchFlags::new(true, false),
            config.max_search_frame_size,
            config.max_search_entries_per_frame,
        )
    }

    fn on_rtt_sample(&mut self, sample: Duration, config: &ClientConfig) {
        let mean = self.rtt.as_nanos() as i128;
        let updated = mean + (sample.as_nanos() as i128 - mean) / 4;
        self.rtt = Duration::from_nanos(updated.clamp(0, u64::MAX as i128) as u64)
            .clamp(config.min_rtt, config.max_rtt);
        trace!("search RTT sample {:?}, estimate is now {:?}", sample, self.rtt);
    }
}

pub struct SearchManager {
    config: Arc<ClientConfig>,
    socket: Arc<dyn SearchSocket>,
    destinations: Vec<SocketAddr>,
    state: Mutex<SearchState>,
}

impl SearchManager {
    pub fn new(config: Arc<ClientConfig>, socket: Arc<dyn SearchSocket>) -> SearchManager {
        let destinations = config.search_destinations();
        let num_buckets = config.num_search_buckets.max(1);

        let state = SearchState {
            buckets: (0..num_buckets).map(|_| SearchBucket::default()).collect(),
            entries: Default::default(),
            budget: FramesPerTry::new(config.initial_frames_per_try, config.max_frames_per_try),
            rtt: config.min_rtt,
            next_sequence_id: rand::random(),
            sent_frames: VecDeque::with_capacity(SEQUENCE_WINDOW),
        };

        SearchManager {
            config,
            socket,
            destinations,
            state: Mutex::new(state),
        }
    }

    /// Spawns one timer task per bucket. The tasks terminate when the manager is dropped.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let num_buckets = self.state.lock().buckets.len();
        (0..num_buckets)
            .map(|index| tokio::spawn(bucket_timer(Arc::downgrade(self), index)))
            .collect()
    }

    pub fn destinations(&self) -> &[SocketAddr] {
        &self.destinations
    }

    /// Starts searching for a channel in bucket 0. Registering a channel that is already
    ///  registered restarts its search.
    pub fn register(&self, channel: Arc<dyn Searchable>) {
        let cid = channel.search_id();
        debug!("searching channel {:?} (cid {})", channel.search_name(), cid);

        let mut state = self.state.lock();
        if let Some(previous) = state.entries.insert(cid, SearchEntry { channel, bucket: 0 }) {
            state.buckets[previous.bucket].remove(cid);
        }
        state.buckets[0].insert(cid);
    }

    pub fn unregister(&self, cid: u32) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.remove(&cid) {
            state.buckets[entry.bucket].remove(cid);
        }
    }

    pub fn is_registered(&self, cid: u32) -> bool {
        self.state.lock().entries.contains_key(&cid)
    }

    pub fn registered_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn bucket_of(&self, cid: u32) -> Option<usize> {
        self.state.lock().entries.get(&cid).map(|e| e.bucket)
    }

    pub fn is_awaiting_response(&self, cid: u32) -> bool {
        let state = self.state.lock();
        state.entries.get(&cid)
            .map(|e| state.buckets[e.bucket].is_awaiting_response(cid))
            .unwrap_or(false)
    }

    pub fn rtt_estimate(&self) -> Duration {
        self.state.lock().rtt
    }

    pub fn frames_per_try(&self) -> usize {
        self.state.lock().budget.frames_per_try()
    }

    /// `2^index * RTT`, capped at the slowest bucket
    pub fn period(&self, bucket_index: usize) -> Duration {
        let state = self.state.lock();
        let index = bucket_index.min(state.buckets.len() - 1);
        state.rtt.saturating_mul(1u32 << index.min(31))
    }

    /// Handles all channels of a search response datagram
    pub fn on_search_response(&self, response: &SearchResponse, from: SocketAddr) {
        if !response.found {
            trace!("negative search response from {} - ignoring", from);
            return;
        }
        let server_addr = response.resolved_server_addr(from);
        for &cid in &response.cids {
            self.search_response(cid, response.sequence_id, server_addr);
        }
    }

    /// Completes the search for a channel and hands it the server address. Responses for
    ///  channels that are not (or no longer) registered are ignored. Returns `true` if the
    ///  response was for a registered channel.
    pub fn search_response(&self, cid: u32, sequence_id: u32, server_addr: SocketAddr) -> bool {
        let channel = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.remove(&cid) else {
                trace!("late or duplicate search response for cid {} - ignoring", cid);
                return false;
            };
            let bucket = &mut state.buckets[entry.bucket];
            let was_awaiting = bucket.remove(cid).is_some();
            if was_awaiting {
                bucket.on_response();
            }

            let sent_at = state.sent_frames.iter()
                .find(|(seq, _)| *seq == sequence_id)
                .map(|(_, sent_at)| *sent_at);
            match sent_at {
                Some(sent_at) => state.on_rtt_sample(sent_at.elapsed(), &self.config),
                None => debug!("search response with unknown sequence id {} - not using it for RTT", sequence_id),
            }
            entry.channel
        };

        debug!("found channel {:?} (cid {}) on {}", channel.search_name(), cid, server_addr);
        channel.search_response(server_addr);
        true
    }

    /// A server appeared or restarted: channels in buckets slower than the anomaly bucket are
    ///  moved back to it so that they are searched again soon.
    #[instrument(skip(self))]
    pub fn beacon_anomaly_notify(&self) {
        let mut state = self.state.lock();
        let anomaly_bucket = self.config.beacon_anomaly_bucket.min(state.buckets.len() - 1);

        let mut boosted = Vec::new();
        for index in anomaly_bucket + 1..state.buckets.len() {
            boosted.extend(state.buckets[index].take_all());
        }
        debug!("boosting {} channels to bucket {}", boosted.len(), anomaly_bucket);
        for cid in boosted {
            if let Some(entry) = state.entries.get_mut(&cid) {
                entry.bucket = anomaly_bucket;
            }
            state.buckets[anomaly_bucket].insert(cid);
        }
    }

    /// One timer tick of a bucket. Returns the search frames to send to all destinations.
    pub fn fire_bucket(&self, index: usize, now: Instant) -> Vec<Bytes> {
        let response_addr = self.socket.local_addr();

        let mut state = self.state.lock();
        let state = &mut *state;
        let slowest = state.buckets.len() - 1;
        if index > slowest {
            return Vec::new();
        }

        let timed_out = state.buckets[index].take_timed_out();
        let (requests_sent, responses) = state.buckets[index].take_period_stats();
        state.budget.on_period(requests_sent, responses);

        let target = (index + 1).min(slowest);
        if !timed_out.is_empty() {
            trace!("{} channels without search response in bucket {} - moving them to bucket {}", timed_out.len(), index, target);
        }
        for cid in timed_out {
            state.move_to(cid, target);
        }

        let budget = state.budget.frames_per_try();
        let candidates = state.buckets[index].awaiting_send().collect::<Vec<_>>();

        let mut frames = Vec::new();
        let mut current: Option<SearchFrame> = None;
        'channels: for cid in candidates {
            let Some(entry) = state.entries.get(&cid) else {
                continue;
            };
            let channel = entry.channel.clone();
            loop {
                if current.is_none() {
                    if frames.len() >= budget {
                        break 'channels;
                    }
                    current = Some(state.next_frame(&self.config, response_addr, now));
                }
                let Some(frame) = current.as_mut() else {
                    break;
                };
                if frame.try_add(cid, channel.search_name()) {
                    state.buckets[index].mark_sent(cid, now);
                    break;
                }
                // a fresh frame always accepts its first entry, so this terminates
                if let Some(full) = current.take() {
                    frames.push(full.finish());
                }
            }
        }
        if let Some(frame) = current {
            if !frame.is_empty() {
                frames.push(frame.finish());
            }
        }

        if !frames.is_empty() {
            trace!("bucket {}: sending {} search frames", index, frames.len());
        }
        frames
    }

    async fn send_frames(&self, frames: Vec<Bytes>) {
        for frame in frames {
            for destination in &self.destinations {
                self.socket.send_search(*destination, &frame).await;
            }
        }
    }
}

async fn bucket_timer(manager: Weak<SearchManager>, index: usize) {
    loop {
        let Some(period) = manager.upgrade().map(|m| m.period(index)) else {
            return;
        };
        tokio::time::sleep(period).await;

        let Some(manager) = manager.upgrade() else {
            return;
        };
        let frames = manager.fire_bucket(index, Instant::now());
        manager.send_frames(frames).await;
    }
}
