use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::circuit::Circuit;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("circuit directory is full")]
    Full,
    #[error("circuit code {0} is already in use")]
    DuplicateCode(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("no pending circuit with code {0}")]
    UnknownCode(u32),
    #[error("session id does not match circuit {0}")]
    SessionMismatch(u32),
    #[error("agent id does not match circuit {0}")]
    AgentMismatch(u32),
    #[error("endpoint {0} is already bound")]
    AlreadyBound(SocketAddr),
}

/// Circuits awaiting their handshake, keyed by code, and bound circuits
/// reachable by remote endpoint.
pub struct CircuitDirectory {
    pending: HashMap<u32, Arc<Circuit>>,
    circuits: HashMap<u32, Arc<Circuit>>,
    clients_by_addr: HashMap<SocketAddr, u32>,
    max_circuits: usize,
}

impl CircuitDirectory {
    pub fn new(max_circuits: usize) -> Self {
        Self {
            pending: HashMap::new(),
            circuits: HashMap::new(),
            clients_by_addr: HashMap::new(),
            max_circuits,
        }
    }

    /// Fails if a circuit with `code` could not be inserted right now.
    pub fn check_insert(&self, code: u32) -> Result<(), DirectoryError> {
        if self.pending.contains_key(&code) || self.circuits.contains_key(&code) {
            return Err(DirectoryError::DuplicateCode(code));
        }
        if self.total_count() >= self.max_circuits {
            return Err(DirectoryError::Full);
        }
        Ok(())
    }

    pub fn insert_pending(&mut self, circuit: Arc<Circuit>) -> Result<(), DirectoryError> {
        self.check_insert(circuit.code())?;
        self.pending.insert(circuit.code(), circuit);
        Ok(())
    }

    /// Moves a pending circuit to the endpoint-keyed map once the handshake
    /// identity matches. On any mismatch the circuit stays pending and unbound.
    pub fn bind(
        &mut self,
        code: u32,
        session_id: Uuid,
        agent_id: Uuid,
        addr: SocketAddr,
    ) -> Result<Arc<Circuit>, BindError> {
        if self.clients_by_addr.contains_key(&addr) {
            return Err(BindError::AlreadyBound(addr));
        }
        let circuit = self.pending.get(&code).ok_or(BindError::UnknownCode(code))?;
        if circuit.session_id() != session_id {
            return Err(BindError::SessionMismatch(code));
        }
        if circuit.agent_id() != agent_id {
            return Err(BindError::AgentMismatch(code));
        }
        if !circuit.bind_remote(addr) {
            return Err(BindError::AlreadyBound(addr));
        }

        let circuit = self
            .pending
            .remove(&code)
            .ok_or(BindError::UnknownCode(code))?;
        self.clients_by_addr.insert(addr, code);
        self.circuits.insert(code, circuit.clone());
        Ok(circuit)
    }

    pub fn get(&self, code: u32) -> Option<&Arc<Circuit>> {
        self.circuits.get(&code).or_else(|| self.pending.get(&code))
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&Arc<Circuit>> {
        self.clients_by_addr
            .get(addr)
            .and_then(|code| self.circuits.get(code))
    }

    pub fn remove(&mut self, code: u32) -> Option<Arc<Circuit>> {
        if let Some(circuit) = self.circuits.remove(&code) {
            if let Some(addr) = circuit.remote_addr() {
                self.clients_by_addr.remove(&addr);
            }
            return Some(circuit);
        }
        self.pending.remove(&code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Circuit>> {
        self.circuits.values().chain(self.pending.values())
    }

    /// Circuits, pending or bound, silent for longer than `timeout`.
    pub fn idle_circuits(&self, now: Instant, timeout: Duration) -> Vec<Arc<Circuit>> {
        self.iter()
            .filter(|circuit| !circuit.is_closed() && circuit.idle_for(now) > timeout)
            .cloned()
            .collect()
    }

    pub fn cleanup_closed(&mut self) -> Vec<Arc<Circuit>> {
        let closed: Vec<u32> = self
            .iter()
            .filter(|circuit| circuit.is_closed())
            .map(|circuit| circuit.code())
            .collect();

        closed.into_iter().filter_map(|code| self.remove(code)).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn bound_count(&self) -> usize {
        self.circuits.len()
    }

    pub fn total_count(&self) -> usize {
        self.pending.len() + self.circuits.len()
    }
}
