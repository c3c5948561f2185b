//! Servers announce themselves with periodic beacons. A client tracks the beacons it sees per
//!  server to detect servers that appeared or restarted, which is a good moment to repeat
//!  searches for unresolved channels.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::protocol::messages::{Beacon, Guid};
use crate::search::SearchManager;
use crate::transport::registry::TransportRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconEvent {
    NewServer,
    /// the server's GUID changed, i.e. it is a new process on the same address
    Restarted,
    /// same server, but its change count moved: it may have lost or gained channels
    Changed,
    Unchanged,
}

#[derive(Debug, Clone, Copy)]
struct ServerRecord {
    guid: Guid,
    change_count: u16,
}

#[derive(Default)]
pub struct BeaconTracker {
    servers: Mutex<FxHashMap<SocketAddr, ServerRecord>>,
}

impl BeaconTracker {
    pub fn classify(&self, server_addr: SocketAddr, beacon: &Beacon) -> BeaconEvent {
        let record = ServerRecord {
            guid: beacon.guid,
            change_count: beacon.change_count,
        };
        match self.servers.lock().insert(server_addr, record) {
            None => BeaconEvent::NewServer,
            Some(previous) if previous.guid != beacon.guid => BeaconEvent::Restarted,
            Some(previous) if previous.change_count != beacon.change_count => BeaconEvent::Changed,
            Some(_) => BeaconEvent::Unchanged,
        }
    }

    pub fn known_servers(&self) -> usize {
        self.servers.lock().len()
    }
}

/// Turns beacons into search boosts and transport notifications
pub struct BeaconHandler {
    tracker: BeaconTracker,
    search: Arc<SearchManager>,
    transports: Arc<TransportRegistry>,
}

impl BeaconHandler {
    pub fn new(search: Arc<SearchManager>, transports: Arc<TransportRegistry>) -> BeaconHandler {
        BeaconHandler {
            tracker: BeaconTracker::default(),
            search,
            transports,
        }
    }

    pub fn on_beacon(&self, beacon: &Beacon, from: SocketAddr) -> BeaconEvent {
        let server_addr = beacon.resolved_server_addr(from);
        let event = self.tracker.classify(server_addr, beacon);

        let transport = self.transports.get(server_addr);
        if let Some(transport) = &transport {
            transport.alive_notification();
        }

        match event {
            BeaconEvent::NewServer => {
                debug!("new server {}", server_addr);
                self.search.beacon_anomaly_notify();
            }
            BeaconEvent::Restarted => {
                info!("server {} restarted", server_addr);
                self.search.beacon_anomaly_notify();
                if let Some(transport) = transport {
                    transport.close();
                }
            }
            BeaconEvent::Changed => {
                if let Some(transport) = transport {
                    transport.changed_transport();
                }
            }
            BeaconEvent::Unchanged => {}
        }
        event
    }
}
