use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::codec::ValueCodec;
use crate::config::ClientConfig;
use crate::protocol::messages::PROTOCOL_TCP;
use crate::transport::{connection, ResponseHandler, Transport, TransportClient};

/// Establishes new transports. This is the seam between connection sharing and actual I/O.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, remote_addr: SocketAddr, priority: i16, handler: Arc<dyn ResponseHandler>) -> anyhow::Result<Arc<Transport>>;
}

pub struct TcpConnector {
    config: Arc<ClientConfig>,
    codec: Arc<dyn ValueCodec>,
}
impl TcpConnector {
    pub fn new(config: Arc<ClientConfig>, codec: Arc<dyn ValueCodec>) -> TcpConnector {
        TcpConnector { config, codec }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, remote_addr: SocketAddr, priority: i16, handler: Arc<dyn ResponseHandler>) -> anyhow::Result<Arc<Transport>> {
        connection::connect(remote_addr, priority, self.config.clone(), self.codec.as_ref(), handler).await
    }
}

type TransportKey = (&'static str, SocketAddr);

/// All transports of a client context by `(protocol, server address)`, so that channels on the
///  same server share a connection. A transport's registered clients are its reference count:
///  when the last client is released, the transport is closed and removed.
pub struct TransportRegistry {
    connector: Arc<dyn Connector>,
    transports: Mutex<FxHashMap<TransportKey, Arc<Transport>>>,
}

impl TransportRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> TransportRegistry {
        TransportRegistry {
            connector,
            transports: Default::default(),
        }
    }

    /// Returns the transport to a server, connecting if there is none yet, and registers the
    ///  client with it.
    pub async fn acquire(
        &self,
        remote_addr: SocketAddr,
        priority: i16,
        handler: Arc<dyn ResponseHandler>,
        cid: u32,
        client: Weak<dyn TransportClient>,
    ) -> anyhow::Result<Arc<Transport>> {
        let key = (PROTOCOL_TCP, remote_addr);
        {
            let transports = self.transports.lock();
            if let Some(existing) = transports.get(&key) {
                if existing.register_client(cid, client.clone()).is_ok() {
                    debug!("reusing connection to {}", remote_addr);
                    return Ok(existing.clone());
                }
            }
        }

        let connected = self.connector.connect(remote_addr, priority, handler).await?;

        let mut transports = self.transports.lock();
        let (transport, redundant) = match transports.get(&key) {
            Some(existing) if !existing.is_closed() => {
                debug!("concurrent connect to {} - keeping the existing connection", remote_addr);
                (existing.clone(), Some(connected))
            }
            _ => {
                transports.insert(key, connected.clone());
                (connected, None)
            }
        };
        let registered = transport.register_client(cid, client);
        drop(transports);

        if let Some(redundant) = redundant {
            redundant.close();
        }
        registered?;
        Ok(transport)
    }

    /// Unregisters a client, closing the transport if it was the last one
    pub fn release(&self, transport: &Arc<Transport>, cid: u32) {
        let key = (PROTOCOL_TCP, transport.remote_addr());
        let mut transports = self.transports.lock();
        if transport.unregister_client(cid) > 0 {
            return;
        }
        if transports.get(&key).map(|t| Arc::ptr_eq(t, transport)).unwrap_or(false) {
            transports.remove(&key);
        }
        drop(transports);

        debug!("no more channels on the connection to {}", transport.remote_addr());
        transport.close();
    }

    /// the live transport to a server, if any
    pub fn get(&self, remote_addr: SocketAddr) -> Option<Arc<Transport>> {
        self.transports.lock().get(&(PROTOCOL_TCP, remote_addr))
            .filter(|t| !t.is_closed())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.transports.lock().values()
            .filter(|t| !t.is_closed())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close_all(&self) {
        let transports = std::mem::take(&mut *self.transports.lock());
        for transport in transports.into_values() {
            transport.close();
        }
    }
}
