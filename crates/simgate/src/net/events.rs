use std::net::SocketAddr;

use uuid::Uuid;

use super::directory::BindError;
use crate::circuit::CloseReason;

/// Circuit lifecycle changes observed by a dispatcher.
#[derive(Debug, Clone)]
pub enum DispatcherEvent {
    CircuitBound {
        code: u32,
        agent_id: Uuid,
        addr: SocketAddr,
    },
    CircuitClosed {
        code: u32,
        agent_id: Uuid,
        reason: CloseReason,
    },
    HandshakeRejected {
        addr: SocketAddr,
        reason: BindError,
    },
}
