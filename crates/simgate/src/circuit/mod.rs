mod attachment;
mod logout;
mod outbox;
mod ping;
mod queue;
mod routes;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::caps::{
    CapabilityBinding, CapabilityRoute, CapabilityRouter, CapabilityTable, CapsError, CapsHandler,
};
use crate::config::CircuitConfig;
use crate::net::{
    CircuitStats, DatagramSink, Delivery, ImageRequest, Message, NetworkStats, Packet,
    PacketError, PacketHeader, PendingAcks, ReceiveTracker, Tier, UnackedPackets,
};
use crate::services::AgentServices;
use crate::update::{ObjectUpdate, Scheduled, UpdateScheduler};

pub use attachment::Attachment;
pub use logout::LogoutState;
pub use outbox::{Dequeued, EventOutbox};
pub use ping::PingTracker;
pub use queue::{Outbound, TransmitQueue, TransmitReceiver, transmit_queue};
pub use routes::{InboundHandler, dispatch, inbound_routes};

#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    #[error("circuit is closed")]
    Closed,
    #[error("remote endpoint is not bound yet")]
    NotBound,
    #[error("{0:?} transmit queue is full")]
    QueueFull(Tier),
    #[error("event queue is full")]
    EventQueueFull,
    #[error("{0} worker queue is full")]
    WorkerQueueFull(&'static str),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("send failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Pending,
    Running,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Logout,
    LogoutTimeout,
    Inactivity,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::LogoutTimeout => "logout timeout",
            Self::Inactivity => "inactivity",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Identity negotiated for the session before any datagram arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitInfo {
    pub code: u32,
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

/// Shared collaborators handed to every circuit by its dispatcher.
#[derive(Clone)]
pub struct CircuitContext {
    pub config: Arc<CircuitConfig>,
    pub sink: Arc<dyn DatagramSink>,
    pub router: Arc<dyn CapabilityRouter>,
    pub services: Arc<dyn AgentServices>,
    pub update_signal: Option<mpsc::UnboundedSender<u32>>,
    pub cancel: CancellationToken,
}

struct WorkerChannels {
    transmit: TransmitReceiver,
    textures: mpsc::Receiver<ImageRequest>,
    inventory: mpsc::Receiver<Message>,
}

pub struct Circuit {
    info: CircuitInfo,
    config: Arc<CircuitConfig>,
    sink: Arc<dyn DatagramSink>,
    router: Arc<dyn CapabilityRouter>,
    services: Arc<dyn AgentServices>,
    update_signal: Option<mpsc::UnboundedSender<u32>>,
    self_ref: Weak<Circuit>,

    remote: OnceLock<SocketAddr>,
    state: Mutex<CircuitState>,
    close_reason: OnceLock<CloseReason>,
    cancel: CancellationToken,

    next_sequence: AtomicU32,
    unacked: UnackedPackets,
    pending_acks: PendingAcks,
    received: Mutex<ReceiveTracker>,
    ping: Mutex<PingTracker>,
    logout: Mutex<LogoutState>,
    last_receive: Mutex<Instant>,
    stats: CircuitStats,

    transmit: TransmitQueue,
    textures: mpsc::Sender<ImageRequest>,
    inventory: mpsc::Sender<Message>,
    channels: Mutex<Option<WorkerChannels>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    events: EventOutbox,
    updates: UpdateScheduler,
    capabilities: CapabilityTable,
    attachment: Mutex<Attachment>,
}

impl Circuit {
    /// Creates a pending circuit and registers its Seed and EventQueueGet
    /// capabilities.
    pub fn new(info: CircuitInfo, context: CircuitContext) -> Result<Arc<Self>, CapsError> {
        let config = context.config;
        let now = Instant::now();
        let (transmit, transmit_rx) = transmit_queue(config.transmit_queue_capacity);
        let (textures, textures_rx) = mpsc::channel(config.worker_queue_capacity.max(1));
        let (inventory, inventory_rx) = mpsc::channel(config.worker_queue_capacity.max(1));

        let circuit = Arc::new_cyclic(|self_ref| Self {
            info,
            sink: context.sink,
            router: context.router,
            services: context.services,
            update_signal: context.update_signal,
            self_ref: self_ref.clone(),

            remote: OnceLock::new(),
            state: Mutex::new(CircuitState::Pending),
            close_reason: OnceLock::new(),
            cancel: context.cancel.child_token(),

            next_sequence: AtomicU32::new(1),
            unacked: UnackedPackets::new(),
            pending_acks: PendingAcks::new(
                config.ack_flush_interval(),
                config.max_acks_per_message,
            ),
            received: Mutex::new(ReceiveTracker::with_window(config.duplicate_window)),
            ping: Mutex::new(PingTracker::new(now)),
            logout: Mutex::new(LogoutState::default()),
            last_receive: Mutex::new(now),
            stats: CircuitStats::default(),

            transmit,
            textures,
            inventory,
            channels: Mutex::new(Some(WorkerChannels {
                transmit: transmit_rx,
                textures: textures_rx,
                inventory: inventory_rx,
            })),
            tasks: Mutex::new(Vec::new()),

            events: EventOutbox::new(config.event_queue_capacity),
            updates: UpdateScheduler::new(config.kill_batch_size),
            capabilities: CapabilityTable::new(),
            attachment: Mutex::new(Attachment::Detached),
            config,
        });

        for handler in [CapsHandler::Seed, CapsHandler::EventQueueGet] {
            if let Err(err) = circuit.add_capability(handler.type_name(), Uuid::new_v4(), handler)
            {
                circuit.router.unregister_circuit(info.code);
                return Err(err);
            }
        }

        Ok(circuit)
    }

    pub fn code(&self) -> u32 {
        self.info.code
    }

    pub fn agent_id(&self) -> Uuid {
        self.info.agent_id
    }

    pub fn session_id(&self) -> Uuid {
        self.info.session_id
    }

    pub fn info(&self) -> CircuitInfo {
        self.info
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    pub fn services(&self) -> &Arc<dyn AgentServices> {
        &self.services
    }

    pub fn router(&self) -> &Arc<dyn CapabilityRouter> {
        &self.router
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    pub fn events(&self) -> &EventOutbox {
        &self.events
    }

    pub fn updates(&self) -> &UpdateScheduler {
        &self.updates
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote.get().copied()
    }

    /// Binds the remote endpoint. Only the first call has any effect.
    pub fn bind_remote(&self, addr: SocketAddr) -> bool {
        self.remote.set(addr).is_ok()
    }

    pub fn state(&self) -> CircuitState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn latency(&self) -> Duration {
        self.ping
            .lock()
            .map(|ping| ping.latency())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> NetworkStats {
        let mut stats = self.stats.snapshot();
        stats.unacked = self.unacked.unacked_count() as u64;
        stats.latency_ms = self.latency().as_secs_f32() * 1000.0;
        stats
    }

    pub fn unacked(&self) -> &UnackedPackets {
        &self.unacked
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        self.last_receive
            .lock()
            .map(|last| now.saturating_duration_since(*last))
            .unwrap_or_default()
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_receive.lock() {
            *last = Instant::now();
        }
    }

    /// Moves a pending circuit to running and spawns its transmit and
    /// worker tasks. Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> bool {
        {
            let Ok(mut state) = self.state.lock() else {
                return false;
            };
            if *state != CircuitState::Pending {
                return false;
            }
            *state = CircuitState::Running;
        }

        let Some(channels) = self.channels.lock().ok().and_then(|mut c| c.take()) else {
            return false;
        };

        let handles = vec![
            tokio::spawn(run_transmit(self.clone(), channels.transmit)),
            tokio::spawn(crate::worker::run_texture_worker(
                self.clone(),
                channels.textures,
            )),
            tokio::spawn(crate::worker::run_inventory_worker(
                self.clone(),
                channels.inventory,
            )),
        ];
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
        self.updates.clear_signal();
        if !self.updates.is_empty() {
            self.signal_updates();
        }

        info!(
            "circuit {} started for agent {} at {:?}",
            self.code(),
            self.agent_id(),
            self.remote_addr()
        );
        true
    }

    /// Waits for the circuit's tasks to finish after `close`.
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut tasks| tasks.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!("circuit {} task ended abnormally: {}", self.code(), err);
            }
        }
    }

    /// Handles one decoded inbound packet.
    pub fn receive(&self, packet: Packet, size: usize) {
        if self.is_closed() {
            return;
        }
        self.stats.record_received(size);
        self.touch();

        for ack in &packet.header.acks {
            self.acknowledge(*ack);
        }

        if packet.header.is_reliable() {
            let sequence = packet.header.sequence;
            self.pending_acks.push(sequence);
            let fresh = self
                .received
                .lock()
                .map(|mut received| received.record_received(sequence))
                .unwrap_or(true);
            if !fresh {
                self.stats.record_duplicate();
                trace!("circuit {} dropped duplicate {}", self.code(), sequence);
                return;
            }
        }

        let kind = packet.kind();
        if let Err(err) = dispatch(self, packet.message) {
            debug!(
                "circuit {} failed to handle {}: {}",
                self.code(),
                kind.name(),
                err
            );
        }
    }

    pub fn acknowledge(&self, sequence: u32) {
        if self.unacked.process_ack(sequence).is_some() {
            trace!("circuit {} acked {}", self.code(), sequence);
        }

        let logout_acked = self
            .logout
            .lock()
            .map(|logout| logout.is_reply_ack(sequence))
            .unwrap_or(false);
        if logout_acked {
            self.close(CloseReason::Logout);
        }
    }

    pub fn complete_ping(&self, ping_id: u8) -> Option<Duration> {
        self.ping
            .lock()
            .ok()
            .and_then(|mut ping| ping.complete(ping_id, Instant::now()))
    }

    /// Queues a message, waiting for room in its transmit tier.
    pub async fn send_message(&self, message: Message, reliable: bool) -> Result<(), CircuitError> {
        if self.is_closed() {
            return Err(CircuitError::Closed);
        }
        match message.kind().delivery() {
            Delivery::EventQueue => self.events.push(message),
            Delivery::Udp => {
                self.transmit
                    .send(Outbound::Message { message, reliable })
                    .await
            }
        }
    }

    /// Non-blocking variant of `send_message` for the receive path.
    pub fn queue_message(&self, message: Message, reliable: bool) -> Result<(), CircuitError> {
        if self.is_closed() {
            return Err(CircuitError::Closed);
        }
        match message.kind().delivery() {
            Delivery::EventQueue => self.events.push(message),
            Delivery::Udp => self
                .transmit
                .try_send(Outbound::Message { message, reliable }),
        }
    }

    pub fn enqueue_texture(&self, request: ImageRequest) -> Result<(), CircuitError> {
        self.textures
            .try_send(request)
            .map_err(|_| CircuitError::WorkerQueueFull("texture"))
    }

    pub fn enqueue_inventory(&self, message: Message) -> Result<(), CircuitError> {
        self.inventory
            .try_send(message)
            .map_err(|_| CircuitError::WorkerQueueFull("inventory"))
    }

    /// Assigns a sequence number and serializes. Reliable packets are
    /// retained until acknowledged.
    fn encode(&self, message: Message, reliable: bool) -> Result<(u32, Vec<u8>), CircuitError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let data = Packet::new(PacketHeader::new(sequence, reliable), message).serialize()?;
        if reliable {
            self.unacked.track_packet(sequence, data.clone());
        }
        Ok((sequence, data))
    }

    fn send_raw(&self, data: &[u8], addr: SocketAddr) -> Result<(), CircuitError> {
        match self.sink.send_datagram(data, addr) {
            Ok(sent) => {
                self.stats.record_sent(sent);
                Ok(())
            }
            Err(err) => {
                self.stats.record_dropped();
                Err(err.into())
            }
        }
    }

    /// Serializes and sends immediately, bypassing the transmit queue.
    pub fn transmit(&self, message: Message, reliable: bool) -> Result<u32, CircuitError> {
        let remote = self.remote_addr().ok_or(CircuitError::NotBound)?;
        let (sequence, data) = self.encode(message, reliable)?;
        self.send_raw(&data, remote)?;
        Ok(sequence)
    }

    /// Sends the LogoutReply and arms the logout timeout.
    pub fn begin_logout(&self) -> Result<(), CircuitError> {
        let remote = self.remote_addr().ok_or(CircuitError::NotBound)?;
        let reply = Message::LogoutReply {
            agent_id: self.agent_id(),
            session_id: self.session_id(),
        };
        let (sequence, data) = self.encode(reply, true)?;
        if let Ok(mut logout) = self.logout.lock() {
            logout.begin(sequence, Instant::now());
        }
        info!(
            "circuit {} logging out agent {}",
            self.code(),
            self.agent_id()
        );
        self.send_raw(&data, remote)
    }

    /// Periodic work run by the transmit task after every pass: ack flush,
    /// ping, and the logout timeout.
    pub fn housekeeping(&self, now: Instant) {
        if self.state() != CircuitState::Running {
            return;
        }

        for batch in self.pending_acks.flush(now) {
            if let Err(err) = self.transmit(Message::PacketAck { ids: batch }, false) {
                debug!("circuit {} ack flush failed: {}", self.code(), err);
            }
        }

        let ping_id = self.ping.lock().ok().and_then(|mut ping| {
            ping.is_due(now, self.config.ping_interval())
                .then(|| ping.start(now))
        });
        if let Some(ping_id) = ping_id {
            let ping = Message::StartPingCheck {
                ping_id,
                oldest_unacked: self.unacked.oldest_sequence().unwrap_or(0),
            };
            if let Err(err) = self.transmit(ping, false) {
                debug!("circuit {} ping failed: {}", self.code(), err);
            }
        }

        let timed_out = self
            .logout
            .lock()
            .map(|logout| logout.timed_out(now, self.config.logout_timeout()))
            .unwrap_or(false);
        if timed_out {
            warn!(
                "circuit {} logout reply never acknowledged, closing",
                self.code()
            );
            self.close(CloseReason::LogoutTimeout);
        }
    }

    /// Tears the circuit down. Returns false if it was already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let Ok(mut state) = self.state.lock() else {
                return false;
            };
            if *state == CircuitState::Closed {
                return false;
            }
            *state = CircuitState::Closed;
        }
        let _ = self.close_reason.set(reason);

        let _ = self.transmit.try_send(Outbound::Stop);
        if let Ok(mut channels) = self.channels.lock() {
            channels.take();
        }
        self.cancel.cancel();
        self.events.set_enabled(false);
        self.detach_scene();
        let removed = self.router.unregister_circuit(self.code());
        self.capabilities.clear();
        self.unacked.clear();

        info!(
            "circuit {} for agent {} closed ({}), {} capabilities released",
            self.code(),
            self.agent_id(),
            reason.as_str(),
            removed
        );
        true
    }

    pub fn add_capability(
        &self,
        cap_type: &str,
        id: Uuid,
        handler: CapsHandler,
    ) -> Result<(), CapsError> {
        if self.is_closed() {
            return Err(CapsError::CircuitClosed(self.code()));
        }

        let previous = self
            .capabilities
            .insert(cap_type, CapabilityBinding { id, handler });
        let route = CapabilityRoute {
            id,
            cap_type: cap_type.to_string(),
            handler,
            circuit_code: self.code(),
            circuit: self.self_ref.clone(),
        };

        if let Err(err) = self.router.register(route) {
            self.capabilities.restore(cap_type, previous);
            return Err(err);
        }
        Ok(())
    }

    pub fn remove_capability(&self, cap_type: &str) -> Option<CapabilityBinding> {
        let binding = self.capabilities.remove(cap_type)?;
        self.router.unregister(binding.id);
        Some(binding)
    }

    /// Hands an object change to the scheduler and wakes the update pump.
    pub fn schedule_update(&self, update: ObjectUpdate) -> Scheduled {
        let outcome = self.updates.schedule(update);
        if outcome != Scheduled::Dropped {
            self.signal_updates();
        }
        outcome
    }

    fn signal_updates(&self) {
        if !self.updates.mark_signaled() {
            return;
        }
        let signaled = self
            .update_signal
            .as_ref()
            .is_some_and(|signal| signal.send(self.code()).is_ok());
        if !signaled {
            self.updates.clear_signal();
        }
    }

    /// Drains pending object updates into the transmit queue. A circuit that
    /// is not running keeps its updates and its signal until `start`. The
    /// whole drain waits at most one queue wait for transmit room.
    pub async fn drain_updates(&self) -> usize {
        if self.state() != CircuitState::Running {
            return 0;
        }
        self.updates.clear_signal();
        let region_handle = self.scene().map(|scene| scene.region_handle()).unwrap_or(0);
        let deadline = tokio::time::Instant::now() + self.config.queue_wait();

        let messages = self.updates.drain(region_handle);
        let total = messages.len();
        let mut sent = 0;
        for message in messages {
            let reliable = !matches!(message, Message::ImprovedTerseObjectUpdate { .. });
            match tokio::time::timeout_at(deadline, self.send_message(message, reliable)).await {
                Ok(Ok(())) => sent += 1,
                Ok(Err(err)) => {
                    debug!("circuit {} dropped object updates: {}", self.code(), err);
                    break;
                }
                Err(_) => {
                    warn!(
                        "circuit {} transmit queue stalled, dropped {} object updates",
                        self.code(),
                        total - sent
                    );
                    break;
                }
            }
        }
        sent
    }
}

async fn run_transmit(circuit: Arc<Circuit>, mut queue: TransmitReceiver) {
    let wait = circuit.config.queue_wait();
    let cancel = circuit.cancellation();

    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = queue.next_pass(wait) => batch,
        };

        for item in batch {
            match item {
                Outbound::Stop => {
                    debug!("circuit {} transmit task stopping", circuit.code());
                    return;
                }
                Outbound::Message { message, reliable } => {
                    let kind = message.kind();
                    match circuit.transmit(message, reliable) {
                        Ok(_) => {}
                        Err(err @ CircuitError::Packet(_)) => warn!(
                            "circuit {} could not encode {}: {}",
                            circuit.code(),
                            kind.name(),
                            err
                        ),
                        Err(err) => debug!(
                            "circuit {} failed to send {}: {}",
                            circuit.code(),
                            kind.name(),
                            err
                        ),
                    }
                }
            }
        }

        circuit.housekeeping(Instant::now());
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::{Circuit, CircuitContext, CircuitInfo, TransmitReceiver};
    use crate::caps::CapsRegistry;
    use crate::config::CircuitConfig;
    use crate::net::RecordingSink;
    use crate::services::{AgentServices, MemoryInventory, ServiceUrls, StaticAgentServices};

    pub fn test_services() -> Arc<dyn AgentServices> {
        Arc::new(StaticAgentServices::new(
            None,
            Arc::new(MemoryInventory::new()),
            ServiceUrls::default(),
        ))
    }

    pub fn test_context(
        sink: Arc<RecordingSink>,
        registry: Arc<CapsRegistry>,
    ) -> CircuitContext {
        CircuitContext {
            config: Arc::new(CircuitConfig::default()),
            sink,
            router: registry,
            services: test_services(),
            update_signal: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn test_info() -> CircuitInfo {
        CircuitInfo {
            code: 1234,
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
        }
    }

    /// A pending circuit already bound to 127.0.0.1:5000.
    pub fn test_circuit() -> (Arc<Circuit>, Arc<RecordingSink>, Arc<CapsRegistry>) {
        test_circuit_with(test_services())
    }

    pub fn test_circuit_with(
        services: Arc<dyn AgentServices>,
    ) -> (Arc<Circuit>, Arc<RecordingSink>, Arc<CapsRegistry>) {
        let sink = Arc::new(RecordingSink::default());
        let registry = Arc::new(CapsRegistry::new());
        let mut context = test_context(sink.clone(), registry.clone());
        context.services = services;
        let circuit = Circuit::new(test_info(), context)
            .expect("fresh registry accepts circuit capabilities");
        circuit.bind_remote("127.0.0.1:5000".parse().expect("valid address"));
        (circuit, sink, registry)
    }

    /// Takes the transmit queue's consumer side so a test can inspect what
    /// was queued.
    pub fn take_transmit(circuit: &Circuit) -> TransmitReceiver {
        circuit
            .channels
            .lock()
            .expect("channels lock")
            .take()
            .expect("circuit not started")
            .transmit
    }

    pub fn queued_messages(receiver: &mut TransmitReceiver) -> Vec<crate::net::Message> {
        receiver
            .drain()
            .into_iter()
            .filter_map(|item| match item {
                super::Outbound::Message { message, .. } => Some(message),
                super::Outbound::Stop => None,
            })
            .collect()
    }

    /// Marks the circuit running without spawning its tasks.
    pub fn mark_running(circuit: &Circuit) {
        *circuit.state.lock().expect("state lock") = super::CircuitState::Running;
    }
}
