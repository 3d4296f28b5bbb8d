use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::directory::{CircuitDirectory, DirectoryError};
use super::events::DispatcherEvent;
use super::message::{Message, MessageKind};
use super::protocol::Packet;
use super::stats::NetworkStats;
use super::transport::{BufferPool, DatagramSink};
use crate::caps::{CapabilityRouter, CapsError};
use crate::circuit::{Circuit, CircuitContext, CircuitInfo, CircuitState, CloseReason};
use crate::config::CircuitConfig;
use crate::services::{AgentServices, Scene};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);
const RECEIVE_BUFFERS: usize = 64;
const CODE_ATTEMPTS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Caps(#[from] CapsError),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Owns the UDP socket and routes every datagram to its circuit.
pub struct SocketDispatcher {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: Arc<CircuitConfig>,
    router: Arc<dyn CapabilityRouter>,
    services: Arc<dyn AgentServices>,
    directory: RwLock<CircuitDirectory>,
    buffers: BufferPool,
    events: mpsc::UnboundedSender<DispatcherEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<DispatcherEvent>>>,
    update_signal: mpsc::UnboundedSender<u32>,
    update_rx: Mutex<Option<mpsc::UnboundedReceiver<u32>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SocketDispatcher {
    pub async fn bind(
        addr: SocketAddr,
        config: Arc<CircuitConfig>,
        max_circuits: usize,
        router: Arc<dyn CapabilityRouter>,
        services: Arc<dyn AgentServices>,
    ) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let (events, event_rx) = mpsc::unbounded_channel();
        let (update_signal, update_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            local_addr,
            config,
            router,
            services,
            directory: RwLock::new(CircuitDirectory::new(max_circuits)),
            buffers: BufferPool::new(RECEIVE_BUFFERS),
            events,
            event_rx: Mutex::new(Some(event_rx)),
            update_signal,
            update_rx: Mutex::new(Some(update_rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn router(&self) -> &Arc<dyn CapabilityRouter> {
        &self.router
    }

    /// Lifecycle event stream. Only the first caller receives it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DispatcherEvent>> {
        self.event_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    fn context(&self) -> CircuitContext {
        CircuitContext {
            config: self.config.clone(),
            sink: self.socket.clone() as Arc<dyn DatagramSink>,
            router: self.router.clone(),
            services: self.services.clone(),
            update_signal: Some(self.update_signal.clone()),
            cancel: self.cancel.clone(),
        }
    }

    /// Creates a pending circuit that waits for its UseCircuitCode handshake.
    pub fn register_pending(&self, info: CircuitInfo) -> Result<Arc<Circuit>, DispatchError> {
        let mut directory = self
            .directory
            .write()
            .map_err(|_| io::Error::other("circuit directory poisoned"))?;
        directory.check_insert(info.code)?;

        let circuit = Circuit::new(info, self.context())?;
        directory.insert_pending(circuit.clone())?;
        debug!(
            "registered pending circuit {} for agent {}",
            info.code, info.agent_id
        );
        Ok(circuit)
    }

    /// Registers a pending circuit and attaches it to `scene`. A code is
    /// generated when none is given.
    pub fn open_session(
        &self,
        agent_id: Uuid,
        session_id: Uuid,
        code: Option<u32>,
        scene: Arc<dyn Scene>,
    ) -> Result<Arc<Circuit>, DispatchError> {
        let circuit = match code {
            Some(code) => self.register_pending(CircuitInfo {
                code,
                agent_id,
                session_id,
            })?,
            None => self.register_generated(agent_id, session_id)?,
        };

        if let Err(err) = circuit.attach_scene(scene) {
            circuit.close(CloseReason::Shutdown);
            self.remove_circuit(circuit.code());
            return Err(err.into());
        }
        Ok(circuit)
    }

    fn register_generated(
        &self,
        agent_id: Uuid,
        session_id: Uuid,
    ) -> Result<Arc<Circuit>, DispatchError> {
        let mut last_err = DispatchError::Directory(DirectoryError::Full);
        for _ in 0..CODE_ATTEMPTS {
            let info = CircuitInfo {
                code: Uuid::new_v4().as_fields().0,
                agent_id,
                session_id,
            };
            match self.register_pending(info) {
                Err(DispatchError::Directory(err @ DirectoryError::DuplicateCode(_))) => {
                    last_err = err.into();
                }
                result => return result,
            }
        }
        Err(last_err)
    }

    pub fn circuit(&self, code: u32) -> Option<Arc<Circuit>> {
        self.directory
            .read()
            .ok()
            .and_then(|directory| directory.get(code).cloned())
    }

    pub fn circuit_by_addr(&self, addr: &SocketAddr) -> Option<Arc<Circuit>> {
        self.directory
            .read()
            .ok()
            .and_then(|directory| directory.get_by_addr(addr).cloned())
    }

    fn remove_circuit(&self, code: u32) -> Option<Arc<Circuit>> {
        self.directory
            .write()
            .ok()
            .and_then(|mut directory| directory.remove(code))
    }

    pub fn circuit_counts(&self) -> (usize, usize) {
        self.directory
            .read()
            .map(|directory| (directory.pending_count(), directory.bound_count()))
            .unwrap_or_default()
    }

    /// Aggregate traffic over every live circuit.
    pub fn stats(&self) -> NetworkStats {
        let mut total = NetworkStats::default();
        if let Ok(directory) = self.directory.read() {
            for circuit in directory.iter() {
                total.merge(&circuit.stats());
            }
        }
        total
    }

    /// Spawns the receive loop, the housekeeping task and the object update
    /// pump.
    pub fn spawn(self: &Arc<Self>) {
        let mut handles = vec![
            tokio::spawn(self.clone().run_receive()),
            tokio::spawn(self.clone().run_housekeeping()),
        ];
        if let Some(updates) = self.update_rx.lock().ok().and_then(|mut rx| rx.take()) {
            handles.push(tokio::spawn(self.clone().run_update_pump(updates)));
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
        info!("dispatcher listening on {}", self.local_addr);
    }

    /// Routes one datagram. Nothing here may fail the receive loop.
    pub fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        if let Some(circuit) = self.circuit_by_addr(&from) {
            match Packet::deserialize(data) {
                Ok(packet) => circuit.receive(packet, data.len()),
                Err(err) => {
                    trace!("dropped datagram from {}: {}", from, err);
                }
            }
            return;
        }

        match Packet::peek_kind(data) {
            Ok(MessageKind::UseCircuitCode) => {}
            Ok(kind) => {
                trace!("dropped {} from unknown endpoint {}", kind.name(), from);
                return;
            }
            Err(err) => {
                trace!("dropped datagram from unknown endpoint {}: {}", from, err);
                return;
            }
        }

        let packet = match Packet::deserialize(data) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("malformed handshake from {}: {}", from, err);
                return;
            }
        };
        let Message::UseCircuitCode {
            code,
            session_id,
            agent_id,
        } = packet.message.clone()
        else {
            return;
        };

        let bound = self
            .directory
            .write()
            .map_err(|_| None)
            .and_then(|mut directory| {
                directory
                    .bind(code, session_id, agent_id, from)
                    .map_err(Some)
            });

        match bound {
            Ok(circuit) => {
                circuit.start();
                let _ = self.events.send(DispatcherEvent::CircuitBound {
                    code,
                    agent_id,
                    addr: from,
                });
                circuit.receive(packet, data.len());
            }
            Err(Some(reason)) => {
                debug!("rejected handshake from {}: {}", from, reason);
                let _ = self.events.send(DispatcherEvent::HandshakeRejected {
                    addr: from,
                    reason,
                });
            }
            Err(None) => warn!("circuit directory poisoned, handshake from {} dropped", from),
        }
    }

    /// Closes circuits idle past the inactivity timeout and forgets closed
    /// ones.
    pub fn housekeeping(&self, now: Instant) -> Vec<Arc<Circuit>> {
        let idle = self
            .directory
            .read()
            .map(|directory| directory.idle_circuits(now, self.config.inactivity_timeout()))
            .unwrap_or_default();
        for circuit in idle {
            circuit.close(CloseReason::Inactivity);
        }

        let removed = self
            .directory
            .write()
            .map(|mut directory| directory.cleanup_closed())
            .unwrap_or_default();
        for circuit in &removed {
            let _ = self.events.send(DispatcherEvent::CircuitClosed {
                code: circuit.code(),
                agent_id: circuit.agent_id(),
                reason: circuit.close_reason().unwrap_or(CloseReason::Shutdown),
            });
        }
        removed
    }

    /// Closes every circuit and waits for all tasks to end.
    pub async fn shutdown(&self) {
        let circuits: Vec<Arc<Circuit>> = self
            .directory
            .read()
            .map(|directory| directory.iter().cloned().collect())
            .unwrap_or_default();
        for circuit in &circuits {
            circuit.close(CloseReason::Shutdown);
        }
        self.cancel.cancel();

        for circuit in &circuits {
            circuit.join().await;
        }
        self.housekeeping(Instant::now());

        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut tasks| tasks.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!("dispatcher task ended abnormally: {}", err);
            }
        }
        info!("dispatcher on {} shut down", self.local_addr);
    }

    async fn run_receive(self: Arc<Self>) {
        loop {
            let mut buffer = self.buffers.acquire();
            let received = tokio::select! {
                _ = self.cancel.cancelled() => None,
                result = self.socket.recv_from(&mut buffer) => Some(result),
            };

            match received {
                None => {
                    self.buffers.release(buffer);
                    break;
                }
                Some(Ok((size, from))) => self.handle_datagram(&buffer[..size], from),
                Some(Err(err)) => debug!("receive failed: {}", err),
            }
            self.buffers.release(buffer);
        }
    }

    async fn run_housekeeping(self: Arc<Self>) {
        let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.housekeeping(Instant::now());
                }
            }
        }
    }

    async fn run_update_pump(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<u32>) {
        loop {
            let code = tokio::select! {
                _ = self.cancel.cancelled() => break,
                code = signals.recv() => code,
            };
            let Some(code) = code else {
                break;
            };
            match self.circuit(code) {
                Some(circuit) if circuit.state() == CircuitState::Running => {
                    let sent = circuit.drain_updates().await;
                    trace!("circuit {} sent {} object updates", code, sent);
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::CapsRegistry;
    use crate::net::PacketHeader;
    use crate::services::{LocalScene, MemoryInventory, ServiceUrls, StaticAgentServices};
    use crate::update::{ObjectState, ObjectUpdate};

    async fn dispatcher(max_circuits: usize) -> Arc<SocketDispatcher> {
        let services = Arc::new(StaticAgentServices::new(
            None,
            Arc::new(MemoryInventory::new()),
            ServiceUrls::default(),
        ));
        SocketDispatcher::bind(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            Arc::new(CircuitConfig::default()),
            max_circuits,
            Arc::new(CapsRegistry::new()),
            services,
        )
        .await
        .unwrap()
    }

    fn datagram(sequence: u32, message: Message) -> Vec<u8> {
        Packet::new(PacketHeader::new(sequence, true), message)
            .serialize()
            .unwrap()
    }

    fn client() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 45_000))
    }

    fn object(local_id: u32) -> ObjectUpdate {
        ObjectUpdate::new(Arc::new(ObjectState::new(local_id, Uuid::new_v4())), 1)
    }

    async fn wait_until(condition: impl Fn() -> bool) -> bool {
        for _ in 0..300 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    async fn handshake(dispatcher: &SocketDispatcher, circuit: &Circuit) -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let message = Message::UseCircuitCode {
            code: circuit.code(),
            session_id: circuit.session_id(),
            agent_id: circuit.agent_id(),
        };
        dispatcher.handle_datagram(&datagram(1, message), socket.local_addr().unwrap());
        socket
    }

    #[tokio::test]
    async fn test_handshake_binds_and_starts_circuit() {
        let dispatcher = dispatcher(8).await;
        let mut events = dispatcher.take_events().unwrap();
        let circuit = dispatcher
            .open_session(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Some(77),
                Arc::new(LocalScene::new("a", (1000, 1000))),
            )
            .unwrap();

        let handshake = Message::UseCircuitCode {
            code: 77,
            session_id: circuit.session_id(),
            agent_id: circuit.agent_id(),
        };
        dispatcher.handle_datagram(&datagram(1, handshake), client());

        assert_eq!(circuit.state(), CircuitState::Running);
        assert_eq!(circuit.remote_addr(), Some(client()));
        assert_eq!(dispatcher.circuit_counts(), (0, 1));
        assert!(matches!(
            events.try_recv(),
            Ok(DispatcherEvent::CircuitBound { code: 77, .. })
        ));
        assert_eq!(circuit.stats().packets_received, 1);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_endpoint_traffic_is_dropped() {
        let dispatcher = dispatcher(8).await;
        let mut events = dispatcher.take_events().unwrap();
        let circuit = dispatcher
            .register_pending(CircuitInfo {
                code: 5,
                agent_id: Uuid::new_v4(),
                session_id: Uuid::new_v4(),
            })
            .unwrap();

        let ping = Message::StartPingCheck {
            ping_id: 1,
            oldest_unacked: 0,
        };
        dispatcher.handle_datagram(&datagram(1, ping), client());
        dispatcher.handle_datagram(&[0u8; 3], client());

        let wrong_session = Message::UseCircuitCode {
            code: 5,
            session_id: Uuid::new_v4(),
            agent_id: circuit.agent_id(),
        };
        dispatcher.handle_datagram(&datagram(1, wrong_session), client());

        assert_eq!(circuit.state(), CircuitState::Pending);
        assert!(circuit.remote_addr().is_none());
        assert!(matches!(
            events.try_recv(),
            Ok(DispatcherEvent::HandshakeRejected { .. })
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_overflow() {
        let dispatcher = dispatcher(1).await;
        let info = CircuitInfo {
            code: 9,
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
        };
        dispatcher.register_pending(info).unwrap();

        assert!(matches!(
            dispatcher.register_pending(info),
            Err(DispatchError::Directory(DirectoryError::DuplicateCode(9)))
        ));
        assert!(matches!(
            dispatcher.register_pending(CircuitInfo { code: 10, ..info }),
            Err(DispatchError::Directory(DirectoryError::Full))
        ));
    }

    #[tokio::test]
    async fn test_housekeeping_reports_closed_circuits() {
        let dispatcher = dispatcher(8).await;
        let mut events = dispatcher.take_events().unwrap();
        let circuit = dispatcher
            .register_pending(CircuitInfo {
                code: 3,
                agent_id: Uuid::new_v4(),
                session_id: Uuid::new_v4(),
            })
            .unwrap();

        let later = Instant::now() + Duration::from_secs(61);
        let removed = dispatcher.housekeeping(later);

        assert_eq!(removed.len(), 1);
        assert_eq!(circuit.close_reason(), Some(CloseReason::Inactivity));
        assert!(matches!(
            events.try_recv(),
            Ok(DispatcherEvent::CircuitClosed {
                code: 3,
                reason: CloseReason::Inactivity,
                ..
            })
        ));
        assert!(dispatcher.circuit(3).is_none());
    }

    #[tokio::test]
    async fn test_pending_circuit_does_not_stall_update_pump() {
        let dispatcher = dispatcher(8).await;
        dispatcher.spawn();
        let info = |code| CircuitInfo {
            code,
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
        };
        let pending = dispatcher.register_pending(info(20)).unwrap();
        let running = dispatcher.register_pending(info(21)).unwrap();
        let _running_client = handshake(&dispatcher, &running).await;
        assert_eq!(running.state(), CircuitState::Running);

        for local_id in 0..1100 {
            pending.schedule_update(object(local_id));
        }
        running.schedule_update(object(1));

        assert!(wait_until(|| running.updates().is_empty()).await);
        assert_eq!(pending.updates().nonphysical_len(), 1100);

        let _pending_client = handshake(&dispatcher, &pending).await;
        assert_eq!(pending.state(), CircuitState::Running);
        assert!(wait_until(|| pending.updates().is_empty()).await);

        running.schedule_update(object(2));
        assert!(wait_until(|| running.updates().is_empty()).await);

        dispatcher.shutdown().await;
    }
}
