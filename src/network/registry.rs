use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::Connection;

/// Every live connection, keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    /// set while `clear` tears everything down, removals are ignored meanwhile
    clearing: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry::default()
    }

    pub fn add(&self, conn: Arc<Connection>) {
        let conn_id = conn.conn_id();
        let len = {
            let mut connections = self.connections.lock();
            connections.insert(conn_id, conn);
            connections.len()
        };
        debug!("connection {} added to registry: conn num = {}", conn_id, len);
    }

    pub fn remove(&self, conn: &Connection) {
        if self.clearing.load(Ordering::Acquire) {
            return;
        }
        let len = {
            let mut connections = self.connections.lock();
            connections.remove(&conn.conn_id());
            connections.len()
        };
        debug!(
            "connection {} removed from registry: conn num = {}",
            conn.conn_id(),
            len
        );
    }

    pub fn get(&self, conn_id: u64) -> Option<Arc<Connection>> {
        self.connections.lock().get(&conn_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Snapshot of the current connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().values().cloned().collect()
    }

    /// Stops every connection and waits until all of their sockets are closed.
    ///
    /// The map is drained before any connection is stopped, so stop hooks never run while
    /// the registry lock is held. Connections registered while a round is in flight are
    /// picked up by the next round; the registry is empty once this returns.
    pub async fn clear(&self) {
        self.clearing.store(true, Ordering::Release);

        let mut closed = 0;
        loop {
            let drained: Vec<Arc<Connection>> = self
                .connections
                .lock()
                .drain()
                .map(|(_, conn)| conn)
                .collect();
            if drained.is_empty() {
                break;
            }
            for conn in &drained {
                conn.stop();
            }
            for conn in &drained {
                conn.wait_closed().await;
            }
            closed += drained.len();
        }

        self.clearing.store(false, Ordering::Release);
        // a connection stopped between the last drain and the reset had its removal ignored
        self.connections.lock().retain(|_, conn| !conn.is_closed());
        info!("connection registry cleared, {} connections closed", closed);
    }
}
