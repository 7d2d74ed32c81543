//! Connection registry
//!
//! Process-wide table of connections that reached full feature phase, keyed
//! by (ISID, TSIH, CID). Every operation runs under one lock, so a
//! registration is either fully visible to a lookup or not at all.

use crate::connection::Connection;
use crate::session::Session;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct Entry {
    cid: u16,
    session: Arc<Session>,
    connection: Arc<Connection>,
}

impl Entry {
    fn matches(&self, isid: &[u8; 6], tsih: u16) -> bool {
        let (entry_isid, entry_tsih) = self.session.identity();
        entry_tsih == tsih && &entry_isid == isid
    }
}

/// Live connections by (ISID, TSIH, CID)
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection of `session` under `cid` unless the session
    /// already has `max_connections` registered. Returns false when full.
    pub fn add(
        &self,
        cid: u16,
        session: Arc<Session>,
        connection: Arc<Connection>,
        max_connections: usize,
    ) -> bool {
        let mut entries = self.lock();
        let registered = entries
            .iter()
            .filter(|e| Arc::ptr_eq(&e.session, &session))
            .count();
        if registered >= max_connections.max(1) {
            return false;
        }
        entries.push(Entry {
            cid,
            session,
            connection,
        });
        true
    }

    /// Deregister a connection. Returns false if it was not registered.
    pub fn remove(&self, connection: &Arc<Connection>) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| !Arc::ptr_eq(&e.connection, connection));
        entries.len() != before
    }

    pub fn find(&self, isid: &[u8; 6], tsih: u16, cid: u16) -> Option<Arc<Connection>> {
        self.lock()
            .iter()
            .find(|e| e.cid == cid && e.matches(isid, tsih))
            .map(|e| e.connection.clone())
    }

    /// Like [`find`](Self::find), also returning the session the connection
    /// belongs to
    pub fn find_with_session(
        &self,
        isid: &[u8; 6],
        tsih: u16,
        cid: u16,
    ) -> Option<(Arc<Session>, Arc<Connection>)> {
        self.lock()
            .iter()
            .find(|e| e.cid == cid && e.matches(isid, tsih))
            .map(|e| (e.session.clone(), e.connection.clone()))
    }

    /// Every connection of the session (ISID, TSIH)
    pub fn session_connections(&self, isid: &[u8; 6], tsih: u16) -> Vec<Arc<Connection>> {
        self.lock()
            .iter()
            .filter(|e| e.matches(isid, tsih))
            .map(|e| e.connection.clone())
            .collect()
    }

    /// The live session (ISID, TSIH), if any of its connections is registered
    pub fn find_session(&self, isid: &[u8; 6], tsih: u16) -> Option<Arc<Session>> {
        self.lock()
            .iter()
            .find(|e| e.matches(isid, tsih))
            .map(|e| e.session.clone())
    }

    /// Whether any registered session uses `tsih`
    pub fn tsih_in_use(&self, tsih: u16) -> bool {
        self.lock().iter().any(|e| e.session.identity().1 == tsih)
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionParameters;
    use std::net::{TcpListener, TcpStream};

    fn connection_pair(listener: &TcpListener) -> (TcpStream, Arc<Connection>) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        (client, Arc::new(Connection::new(server_side).unwrap()))
    }

    fn session(isid: [u8; 6], tsih: u16) -> Arc<Session> {
        Arc::new(Session::new(SessionParameters {
            isid,
            tsih,
            ..Default::default()
        }))
    }

    #[test]
    fn test_add_find_remove() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (_c1, conn1) = connection_pair(&listener);
        let (_c2, conn2) = connection_pair(&listener);
        let isid = [0x80, 0, 0, 0, 0, 1];
        let s = session(isid, 7);

        let registry = ConnectionRegistry::new();
        assert!(registry.add(1, s.clone(), conn1.clone(), 2));
        assert!(registry.add(2, s.clone(), conn2.clone(), 2));

        assert!(Arc::ptr_eq(&registry.find(&isid, 7, 1).unwrap(), &conn1));
        assert!(Arc::ptr_eq(&registry.find(&isid, 7, 2).unwrap(), &conn2));
        assert!(registry.find(&isid, 7, 3).is_none());
        let (found_session, _) = registry.find_with_session(&isid, 7, 2).unwrap();
        assert!(Arc::ptr_eq(&found_session, &s));
        assert!(registry.find(&isid, 8, 1).is_none());
        assert_eq!(registry.session_connections(&isid, 7).len(), 2);
        assert!(Arc::ptr_eq(&registry.find_session(&isid, 7).unwrap(), &s));
        assert!(registry.tsih_in_use(7));

        assert!(registry.remove(&conn1));
        assert!(!registry.remove(&conn1));
        assert!(registry.find(&isid, 7, 1).is_none());
        assert_eq!(registry.connection_count(), 1);
        assert!(registry.find(&isid, 7, 2).is_some());
    }

    #[test]
    fn test_sessions_are_isolated() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (_c1, conn1) = connection_pair(&listener);
        let (_c2, conn2) = connection_pair(&listener);

        let registry = ConnectionRegistry::new();
        assert!(registry.add(0, session([1; 6], 1), conn1, 1));
        assert!(registry.add(0, session([2; 6], 1), conn2.clone(), 1));

        let found = registry.session_connections(&[2; 6], 1);
        assert_eq!(found.len(), 1);
        assert!(Arc::ptr_eq(&found[0], &conn2));
        assert!(registry.find_session(&[3; 6], 1).is_none());
    }

    #[test]
    fn test_add_enforces_max_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (_c1, conn1) = connection_pair(&listener);
        let (_c2, conn2) = connection_pair(&listener);
        let (_c3, conn3) = connection_pair(&listener);
        let isid = [0x80, 0, 0, 0, 0, 2];
        let s = session(isid, 3);

        let registry = ConnectionRegistry::new();
        assert!(registry.add(0, s.clone(), conn1.clone(), 2));
        assert!(registry.add(1, s.clone(), conn2, 2));
        assert!(!registry.add(2, s.clone(), conn3.clone(), 2));
        assert!(registry.find(&isid, 3, 2).is_none());
        assert_eq!(registry.connection_count(), 2);

        // A freed slot can be taken again
        assert!(registry.remove(&conn1));
        assert!(registry.add(2, s, conn3, 2));
        assert_eq!(registry.session_connections(&isid, 3).len(), 2);
    }
}
