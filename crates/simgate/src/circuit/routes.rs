use std::collections::HashMap;
use std::sync::OnceLock;

use log::{debug, trace};

use super::{Circuit, CircuitError};
use crate::net::{Message, MessageKind};

pub type InboundHandler = fn(&Circuit, Message) -> Result<(), CircuitError>;

static ROUTES: OnceLock<HashMap<MessageKind, InboundHandler>> = OnceLock::new();

/// Message kinds the circuit handles itself. Anything else goes to the scene.
pub fn inbound_routes() -> &'static HashMap<MessageKind, InboundHandler> {
    ROUTES.get_or_init(|| {
        let routes: &[(MessageKind, InboundHandler)] = &[
            (MessageKind::PacketAck, handle_packet_ack),
            (MessageKind::StartPingCheck, handle_start_ping),
            (MessageKind::CompletePingCheck, handle_complete_ping),
            (MessageKind::UseCircuitCode, handle_use_circuit_code),
            (MessageKind::LogoutRequest, handle_logout_request),
            (MessageKind::RequestImage, handle_request_image),
            (MessageKind::TransferRequest, to_inventory_worker),
            (MessageKind::FetchInventory, to_inventory_worker),
            (MessageKind::FetchInventoryDescendents, to_inventory_worker),
            (MessageKind::CreateInventoryItem, to_inventory_worker),
            (MessageKind::UpdateInventoryItem, to_inventory_worker),
            (MessageKind::RemoveInventoryItem, to_inventory_worker),
            (MessageKind::CreateInventoryFolder, to_inventory_worker),
            (MessageKind::RemoveInventoryFolder, to_inventory_worker),
        ];
        routes.iter().copied().collect()
    })
}

pub fn dispatch(circuit: &Circuit, message: Message) -> Result<(), CircuitError> {
    match inbound_routes().get(&message.kind()) {
        Some(handler) => handler(circuit, message),
        None => deliver_to_scene(circuit, message),
    }
}

fn handle_packet_ack(circuit: &Circuit, message: Message) -> Result<(), CircuitError> {
    if let Message::PacketAck { ids } = message {
        for id in ids {
            circuit.acknowledge(id);
        }
    }
    Ok(())
}

fn handle_start_ping(circuit: &Circuit, message: Message) -> Result<(), CircuitError> {
    if let Message::StartPingCheck { ping_id, .. } = message {
        circuit.queue_message(Message::CompletePingCheck { ping_id }, false)?;
    }
    Ok(())
}

fn handle_complete_ping(circuit: &Circuit, message: Message) -> Result<(), CircuitError> {
    if let Message::CompletePingCheck { ping_id } = message {
        if let Some(latency) = circuit.complete_ping(ping_id) {
            trace!("circuit {} latency {:?}", circuit.code(), latency);
        }
    }
    Ok(())
}

// Repeats of the handshake after binding carry nothing new.
fn handle_use_circuit_code(_circuit: &Circuit, _message: Message) -> Result<(), CircuitError> {
    Ok(())
}

fn handle_logout_request(circuit: &Circuit, message: Message) -> Result<(), CircuitError> {
    if let Message::LogoutRequest {
        agent_id,
        session_id,
    } = message
    {
        if agent_id != circuit.agent_id() || session_id != circuit.session_id() {
            debug!(
                "circuit {} ignoring logout for foreign session",
                circuit.code()
            );
            return Ok(());
        }
        circuit.begin_logout()?;
    }
    Ok(())
}

fn handle_request_image(circuit: &Circuit, message: Message) -> Result<(), CircuitError> {
    if let Message::RequestImage { requests, .. } = message {
        for request in requests {
            circuit.enqueue_texture(request)?;
        }
    }
    Ok(())
}

fn to_inventory_worker(circuit: &Circuit, message: Message) -> Result<(), CircuitError> {
    circuit.enqueue_inventory(message)
}

fn deliver_to_scene(circuit: &Circuit, message: Message) -> Result<(), CircuitError> {
    match circuit.scene() {
        Some(scene) => scene.deliver(circuit.agent_id(), message),
        None => trace!(
            "circuit {} has no scene for {}",
            circuit.code(),
            message.kind().name()
        ),
    }
    Ok(())
}
