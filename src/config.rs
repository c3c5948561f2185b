use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, bail};
use tracing::warn;

pub const DEFAULT_BROADCAST_PORT: u16 = 5076;
pub const DEFAULT_SERVER_PORT: u16 = 5075;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Destinations for search requests (unicast or broadcast). Entries without an explicit
    ///  port use [ClientConfig::broadcast_port].
    pub search_addresses: Vec<SocketAddr>,
    /// If set, search requests are sent to the limited broadcast address in addition to
    ///  [ClientConfig::search_addresses]
    pub auto_broadcast: bool,
    /// Port for search requests, and the port on which beacons are received
    pub broadcast_port: u16,
    /// Default TCP port for servers in static address lists if no port is given
    pub server_port: u16,

    /// Size of a single buffer fill on the sending side. Messages that do not fit into the
    ///  remaining space are segmented.
    pub send_buffer_size: usize,
    /// Advertised to the server during connection validation, and the read chunk size
    pub receive_buffer_size: usize,
    /// Reassembled messages bigger than this are dropped as a protocol fault
    pub max_message_size: usize,
    /// A flow control marker is interleaved roughly every this many bytes sent
    pub marker_period_bytes: u64,

    /// Time allowed for establishing a TCP connection including the validation handshake.
    ///  Also the time without any received data after which a transport is considered
    ///  unresponsive.
    pub connection_timeout: Duration,
    /// An echo request is sent after this long without received data
    pub echo_period: Duration,
    /// Time after which a create-channel request without response is abandoned and the
    ///  channel searched again
    pub create_channel_timeout: Duration,

    /// initial round trip estimate for search requests, and the lower bound for it
    pub min_rtt: Duration,
    pub max_rtt: Duration,
    pub num_search_buckets: usize,
    /// Channels in slower buckets are moved back to this bucket when a server appears or
    ///  restarts
    pub beacon_anomaly_bucket: usize,
    pub max_search_entries_per_frame: usize,
    /// UDP payload limit for search frames
    pub max_search_frame_size: usize,
    pub initial_frames_per_try: f64,
    pub max_frames_per_try: f64,

    /// Retry interval for channels created with a static address list
    pub static_address_backoff: Duration,

    /// default number of elements in a monitor's queue. Values below 2 are raised to 2.
    pub monitor_queue_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            search_addresses: Vec::new(),
            auto_broadcast: true,
            broadcast_port: DEFAULT_BROADCAST_PORT,
            server_port: DEFAULT_SERVER_PORT,
            send_buffer_size: 16 * 1024,
            receive_buffer_size: 16 * 1024,
            max_message_size: 64 * 1024 * 1024,
            marker_period_bytes: 16 * 1024,
            connection_timeout: Duration::from_secs(30),
            echo_period: Duration::from_secs(15),
            create_channel_timeout: Duration::from_secs(30),
            min_rtt: Duration::from_millis(32),
            max_rtt: Duration::from_secs(2),
            num_search_buckets: 14,
            beacon_anomaly_bucket: 5,
            max_search_entries_per_frame: 64,
            max_search_frame_size: 1400,
            initial_frames_per_try: 1.0,
            max_frames_per_try: 32.0,
            static_address_backoff: Duration::from_secs(1),
            monitor_queue_size: 4,
        }
    }
}

impl ClientConfig {
    /// The default configuration with overrides from `EPICS_PVA_*` environment variables
    pub fn from_env() -> anyhow::Result<ClientConfig> {
        let mut result = ClientConfig::default();
        result.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(result)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(port) = lookup("EPICS_PVA_BROADCAST_PORT") {
            self.broadcast_port = port.trim().parse()
                .map_err(|e| anyhow!("invalid EPICS_PVA_BROADCAST_PORT {:?}: {}", port, e))?;
        }
        if let Some(port) = lookup("EPICS_PVA_SERVER_PORT") {
            self.server_port = port.trim().parse()
                .map_err(|e| anyhow!("invalid EPICS_PVA_SERVER_PORT {:?}: {}", port, e))?;
        }
        if let Some(list) = lookup("EPICS_PVA_ADDR_LIST") {
            self.search_addresses = parse_address_list(&list, self.broadcast_port)?;
        }
        if let Some(auto) = lookup("EPICS_PVA_AUTO_ADDR_LIST") {
            self.auto_broadcast = match auto.trim().to_ascii_uppercase().as_str() {
                "YES" | "TRUE" | "1" => true,
                "NO" | "FALSE" | "0" => false,
                other => bail!("invalid EPICS_PVA_AUTO_ADDR_LIST {:?}", other),
            };
        }
        if let Some(tmo) = lookup("EPICS_PVA_CONN_TMO") {
            let secs: f64 = tmo.trim().parse()
                .map_err(|e| anyhow!("invalid EPICS_PVA_CONN_TMO {:?}: {}", tmo, e))?;
            if !secs.is_finite() || secs <= 0.0 {
                bail!("invalid EPICS_PVA_CONN_TMO {:?}", tmo);
            }
            self.connection_timeout = Duration::from_secs_f64(secs);
            self.echo_period = Duration::from_secs_f64(secs / 2.0);
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_buffer_size < 1024 {
            bail!("send buffer size must be at least 1024 bytes");
        }
        if self.receive_buffer_size < 1024 {
            bail!("receive buffer size must be at least 1024 bytes");
        }
        if self.marker_period_bytes == 0 {
            bail!("marker period must be positive");
        }
        if self.num_search_buckets == 0 {
            bail!("at least one search bucket is required");
        }
        if self.beacon_anomaly_bucket >= self.num_search_buckets {
            bail!("beacon anomaly bucket {} does not exist - there are only {} buckets", self.beacon_anomaly_bucket, self.num_search_buckets);
        }
        if self.min_rtt.is_zero() || self.min_rtt > self.max_rtt {
            bail!("RTT bounds must satisfy 0 < min <= max");
        }
        if self.max_search_entries_per_frame == 0 {
            bail!("search frames must have room for at least one entry");
        }
        if self.max_search_frame_size < 256 {
            bail!("search frame size is too small");
        }
        if self.initial_frames_per_try < 1.0 || self.max_frames_per_try < self.initial_frames_per_try {
            bail!("frames per try must satisfy 1 <= initial <= max");
        }
        if self.echo_period >= self.connection_timeout {
            warn!("echo period {:?} is not shorter than the connection timeout {:?} - transports may be reported unresponsive without an echo being sent", self.echo_period, self.connection_timeout);
        }
        Ok(())
    }

    /// all destinations for search requests
    pub fn search_destinations(&self) -> Vec<SocketAddr> {
        let mut result = self.search_addresses.clone();
        if self.auto_broadcast {
            let broadcast = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.broadcast_port);
            if !result.contains(&broadcast) {
                result.push(broadcast);
            }
        }
        result
    }
}

/// Parses a whitespace separated list of `host[:port]` entries, using `default_port` for
///  entries without a port.
pub fn parse_address_list(list: &str, default_port: u16) -> anyhow::Result<Vec<SocketAddr>> {
    list.split_whitespace()
        .map(|entry| {
            if let Ok(addr) = entry.parse::<SocketAddr>() {
                return Ok(addr);
            }
            entry.parse::<IpAddr>()
                .map(|ip| SocketAddr::new(ip, default_port))
                .map_err(|_| anyhow!("invalid address {:?} in address list", entry))
        })
        .collect()
}
