use std::{
    collections::{BTreeMap, HashMap},
    io::ErrorKind,
    net::TcpListener,
    ops::Range,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use berth_process::WorkspacePath;

use crate::error::SupervisorError;

/// Whether some other process on this host already listens on `port`.
///
/// Only `AddrInUse` counts; other bind errors (e.g. permissions) leave the port eligible
/// and the server will report its own failure.
fn bound_by_host(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(_) => false,
        Err(e) => e.kind() == ErrorKind::AddrInUse,
    }
}

#[derive(Debug, Default)]
struct Table {
    by_key: HashMap<WorkspacePath, u16>,
    by_port: BTreeMap<u16, WorkspacePath>,
}

/// Hands out ports from `[low, high)`, one per workspace key.
#[derive(Clone, Debug)]
pub struct PortAllocator {
    range: Range<u16>,
    probe_host: bool,
    table: Arc<Mutex<Table>>,
}

impl PortAllocator {
    pub fn new(range: Range<u16>) -> Self {
        Self {
            range,
            probe_host: false,
            table: Arc::new(Mutex::new(Table::default())),
        }
    }

    pub fn with_host_probe(mut self, probe_host: bool) -> Self {
        self.probe_host = probe_host;
        self
    }

    pub fn range(&self) -> Range<u16> {
        self.range.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the port held by `key`, claiming the lowest free one if it holds none.
    pub fn claim(&self, key: &WorkspacePath) -> Result<u16, SupervisorError> {
        let mut table = self.lock();
        if let Some(port) = table.by_key.get(key) {
            return Ok(*port);
        }

        let port = self
            .range
            .clone()
            .filter(|p| !table.by_port.contains_key(p))
            .find(|p| !self.probe_host || !bound_by_host(*p))
            .ok_or(SupervisorError::ExhaustedRange {
                low: self.range.start,
                high: self.range.end,
            })?;

        table.by_key.insert(key.clone(), port);
        table.by_port.insert(port, key.clone());
        tracing::debug!(path = %key, port, "port claimed");
        Ok(port)
    }

    /// Like [`claim`](Self::claim), but the association is dropped again with the returned
    /// guard unless [`PortClaim::keep`] is called.
    pub fn claim_scoped(&self, key: &WorkspacePath) -> Result<PortClaim, SupervisorError> {
        let port = self.claim(key)?;
        Ok(PortClaim {
            allocator: self.clone(),
            key: key.clone(),
            port,
            kept: false,
        })
    }

    /// Frees the port held by `key`. Returns the freed port, if any.
    pub fn release(&self, key: &WorkspacePath) -> Option<u16> {
        let mut table = self.lock();
        let port = table.by_key.remove(key)?;
        table.by_port.remove(&port);
        tracing::debug!(path = %key, port, "port released");
        Some(port)
    }

    pub fn port_of(&self, key: &WorkspacePath) -> Option<u16> {
        self.lock().by_key.get(key).copied()
    }

    pub fn holder(&self, port: u16) -> Option<WorkspacePath> {
        self.lock().by_port.get(&port).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A claimed port that is released on drop unless kept.
#[derive(Debug)]
pub struct PortClaim {
    allocator: PortAllocator,
    key: WorkspacePath,
    port: u16,
    kept: bool,
}

impl PortClaim {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Keeps the association alive past this guard.
    pub fn keep(mut self) -> u16 {
        self.kept = true;
        self.port
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        if !self.kept {
            self.allocator.release(&self.key);
        }
    }
}
