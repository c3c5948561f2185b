use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bit_set::BitSet;
use tracing::{trace, warn};

use crate::codec::{deserialize_bitset, FieldDesc, PvValue};
use crate::protocol::wire::WireBuf;

/// One snapshot of a monitored value. `changed` holds the fields that changed since the
///  previous element, `overrun` the fields that changed more than once in between.
#[derive(Debug)]
pub struct MonitorElement {
    pub value: Box<dyn PvValue>,
    pub changed: BitSet,
    pub overrun: BitSet,
    /// id of the queue the element belongs to
    queue: u64,
}

impl MonitorElement {
    fn new(field: &Arc<dyn FieldDesc>, queue: u64) -> MonitorElement {
        MonitorElement {
            value: field.clone().create_value(),
            changed: BitSet::new(),
            overrun: BitSet::new(),
            queue,
        }
    }

    fn merge(&mut self, field: &dyn FieldDesc, changed: &BitSet, overrun: &BitSet) {
        let mut changed_twice = self.changed.clone();
        changed_twice.intersect_with(changed);
        self.overrun.union_with(&changed_twice);
        self.overrun.union_with(overrun);
        self.changed.union_with(changed);
        field.compress(&mut self.changed);
        field.compress(&mut self.overrun);
    }
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// The client side queue of a subscription: a fixed number of preallocated elements that
///  cycle between the queue and the consumer.
///
/// Incoming deltas are applied to a private copy of the latest value, which is then copied
///  into a free element. When there is no free element, the delta is merged into the newest
///  queued element instead (OR-ing the change bits), so the consumer still sees every change
///  without the queue growing. If the consumer holds all elements, deltas are accumulated
///  until an element is released.
///
/// The number of elements never changes: elements of other queues (e.g. from before a
///  reconnect) are rejected on release.
pub struct MonitorQueue {
    id: u64,
    field: Arc<dyn FieldDesc>,
    size: usize,
    latest: Box<dyn PvValue>,
    free: VecDeque<MonitorElement>,
    used: VecDeque<MonitorElement>,
    /// changes accumulated while the consumer held every element
    pending: Option<(BitSet, BitSet)>,
}

impl MonitorQueue {
    pub const MIN_SIZE: usize = 2;

    pub fn new(field: Arc<dyn FieldDesc>, size: usize) -> MonitorQueue {
        let size = size.max(Self::MIN_SIZE);
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        MonitorQueue {
            id,
            latest: field.clone().create_value(),
            free: (0..size).map(|_| MonitorElement::new(&field, id)).collect(),
            used: VecDeque::with_capacity(size),
            pending: None,
            field,
            size,
        }
    }

    pub fn field(&self) -> &Arc<dyn FieldDesc> {
        &self.field
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    pub fn used_count(&self) -> usize {
        self.used.len()
    }

    /// Reads a monitor update (changed bits, value delta, overrun bits). Returns `true` if a new
    ///  element became available, i.e. the consumer should be notified.
    pub fn on_data(&mut self, buf: &mut WireBuf) -> anyhow::Result<bool> {
        let changed = deserialize_bitset(buf)?;
        self.latest.deserialize(buf, Some(&changed))?;
        let overrun = deserialize_bitset(buf)?;
        self.apply(changed, overrun)
    }

    fn apply(&mut self, mut changed: BitSet, mut overrun: BitSet) -> anyhow::Result<bool> {
        if let Some(mut element) = self.free.pop_front() {
            if let Err(e) = element.value.copy_from(self.latest.as_ref()) {
                self.free.push_front(element);
                return Err(e);
            }
            self.field.compress(&mut changed);
            self.field.compress(&mut overrun);
            element.changed = changed;
            element.overrun = overrun;
            self.used.push_back(element);
            return Ok(true);
        }

        if let Some(newest) = self.used.back_mut() {
            trace!("monitor queue full - merging into the newest element");
            newest.value.copy_from(self.latest.as_ref())?;
            newest.merge(self.field.as_ref(), &changed, &overrun);
            return Ok(false);
        }

        trace!("consumer holds all monitor elements - accumulating changes");
        match &mut self.pending {
            Some((pending_changed, pending_overrun)) => {
                let mut changed_twice = pending_changed.clone();
                changed_twice.intersect_with(&changed);
                pending_overrun.union_with(&changed_twice);
                pending_overrun.union_with(&overrun);
                pending_changed.union_with(&changed);
            }
            None => self.pending = Some((changed, overrun)),
        }
        Ok(false)
    }

    /// the oldest queued element, if any
    pub fn poll(&mut self) -> Option<MonitorElement> {
        self.used.pop_front()
    }

    /// Returns an element to the queue. Returns `true` if this made accumulated changes
    ///  available as a new element.
    pub fn release(&mut self, mut element: MonitorElement) -> anyhow::Result<bool> {
        if element.queue != self.id {
            warn!("released monitor element does not belong to this queue - dropping it");
            return Ok(false);
        }
        if self.free.len() + self.used.len() >= self.size {
            warn!("monitor element released twice - dropping it");
            return Ok(false);
        }
        element.changed.clear();
        element.overrun.clear();
        self.free.push_back(element);

        match self.pending.take() {
            Some((changed, overrun)) => self.apply(changed, overrun),
            None => Ok(false),
        }
    }
}
