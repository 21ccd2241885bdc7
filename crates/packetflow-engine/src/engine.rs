//! The simulation context
//!
//! `FlowSim` owns everything for one lesson attempt: the entity registry,
//! the slot topology, the timer queue, the connection, the broadcast state
//! and the event queue. The driver mutates slot membership through
//! `place_entity`/`remove_entity`; `advance` observes those moves in one
//! diff pass, applies the protocol rules, then pumps due timers in
//! deterministic order. Nothing mutates protocol state outside `advance`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use packetflow_core::{
    ClientId, ConnPhase, EngineEvent, FileKey, LessonPhase, NodeId, Packet, PacketId, PacketKind,
    RejectReason, SimError, SimResult, SimTime, StatusUpdate, TransitStatus,
};

use crate::connection::{Connection, DataEvent, DataOutcome};
use crate::hint::{hint as narrate, HintInputs};
use crate::sched::{PhaseTag, TimerAction, TimerHandle, TimerQueue};
use crate::slots::{SlotCapacities, SlotKind, Topology};
use crate::{BroadcastState, DeliveryMatrix, DeliveryPlan, PacketRegistry, Scenario, SendOutcome,
    SimConfig};

/// Counters for one lesson attempt
#[derive(Clone, Debug, Default)]
pub struct SimStats {
    pub placements: u64,
    pub removals: u64,
    pub rejections: u64,
    pub invalid_transitions: u64,
    pub losses: u64,
    pub retransmit_signals: u64,
    pub timers_fired: u64,
    pub timers_cancelled: u64,
    pub stale_timers: u64,
    pub frames_delivered: u64,
    pub frames_missed: u64,
}

/// One lesson attempt
pub struct FlowSim {
    config: SimConfig,
    scenario: Scenario,
    now: SimTime,
    phase: LessonPhase,
    registry: PacketRegistry,
    topology: Topology,
    timers: TimerQueue,
    /// The single reliable-phase connection, created on SYN arrival
    conn: Option<Connection>,
    broadcast: Option<BroadcastState>,
    events: Vec<EngineEvent>,
    stats: SimStats,
    file: FileKey,
    /// Pending timers per packet, cancelled when the driver lifts it
    packet_timers: HashMap<PacketId, Vec<TimerHandle>>,
    /// Buffered sequences awaiting their staggered visible release
    release_queue: VecDeque<u32>,
    /// Accepted frames whose fan-out has not resolved yet. Lets an
    /// interrupted original re-launch instead of bouncing as a duplicate.
    pending_fanouts: HashMap<PacketId, u32>,
    complete: bool,
}

impl FlowSim {
    /// Builds one lesson attempt. The scenario is validated up front:
    /// a lesson that could never finish must not start.
    pub fn new(scenario: Scenario, config: SimConfig) -> SimResult<Self> {
        if config.mtu == 0 {
            return Err(SimError::InvalidScenario("mtu must be at least 1 byte"));
        }
        if scenario.payload.is_empty() {
            return Err(SimError::InvalidScenario("file payload is empty"));
        }
        if scenario.frame_count == 0 {
            return Err(SimError::InvalidScenario(
                "broadcast needs at least one frame",
            ));
        }
        // Slots are sized to the scenario so seeding can never overflow.
        let caps = SlotCapacities::for_lesson(
            scenario.fragment_count(config.mtu),
            scenario.frame_count,
        );
        let topology =
            Topology::build(scenario.reliable_client, &scenario.broadcast_clients, caps);
        let file = FileKey::new(1);
        let mut sim = FlowSim {
            config,
            scenario,
            now: SimTime::ZERO,
            phase: LessonPhase::Fragmentation,
            registry: PacketRegistry::new(),
            topology,
            timers: TimerQueue::new(),
            conn: None,
            broadcast: None,
            events: Vec::new(),
            stats: SimStats::default(),
            file,
            packet_timers: HashMap::new(),
            release_queue: VecDeque::new(),
            pending_fanouts: HashMap::new(),
            complete: false,
        };
        sim.seed_sender();
        Ok(sim)
    }

    /// Seed the sender tray: the whole file and the SYN.
    fn seed_sender(&mut self) {
        let sender = self.topology.sender_id();
        let file_packet = self
            .registry
            .create_file(self.file, self.scenario.payload.clone());
        let syn = self.registry.create_control(PacketKind::Syn, self.file);
        self.spawn_at(file_packet, sender);
        self.spawn_at(syn, sender);
    }

    // ------------------------------------------------------------------
    // Driver surface
    // ------------------------------------------------------------------

    /// Driver drops a held entity onto a node. Protocol interpretation
    /// happens in the next `advance`.
    pub fn place_entity(&mut self, packet: PacketId, node: NodeId) -> SimResult<()> {
        if !self.registry.contains(packet) {
            return Err(SimError::UnknownPacket(packet));
        }
        self.topology.place(packet, node)?;
        self.stats.placements += 1;
        Ok(())
    }

    /// Driver lifts an entity out of a node. Its pending timers are
    /// cancelled in the observation pass of the next `advance`.
    pub fn remove_entity(&mut self, packet: PacketId, node: NodeId) -> SimResult<()> {
        if !self.registry.contains(packet) {
            return Err(SimError::UnknownPacket(packet));
        }
        self.topology.remove(packet, node)?;
        self.set_status(packet, TransitStatus::Held);
        self.stats.removals += 1;
        Ok(())
    }

    /// One evaluation pass: observe driver moves, then pump timers up to
    /// `now + dt` in `(fire_at, handle)` order.
    pub fn advance(&mut self, dt: Duration) {
        let target = self.now + dt;
        self.observe_placements();
        while let Some(entry) = self.timers.pop_due(target) {
            self.now = entry.fire_at;
            self.stats.timers_fired += 1;
            self.apply(entry.action);
        }
        self.now = target;
    }

    /// Take everything that happened since the last drain.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Tear down the reliable phase and re-seed the handshake.
    /// Timers are cancelled as a batch before any state is discarded.
    pub fn reset_connection(&mut self) {
        if !self.phase.is_reliable() {
            return;
        }
        let cancelled = self.timers.cancel_phase(PhaseTag::Reliable);
        self.stats.timers_cancelled += cancelled as u64;
        self.release_queue.clear();

        if let Some(conn) = self.conn.take() {
            let from = conn.phase();
            if from != ConnPhase::Closed {
                self.events.push(EngineEvent::ConnectionPhase {
                    client: conn.client,
                    from,
                    to: ConnPhase::Closed,
                });
            }
        }

        // Control packets belong to the old connection.
        let stale_controls: Vec<PacketId> = self
            .registry
            .iter()
            .filter(|(_, p)| p.kind.is_control())
            .map(|(id, _)| *id)
            .collect();
        for id in stale_controls {
            self.consume(id);
        }

        // Every fragment becomes draggable again at the sender.
        let fragments: Vec<PacketId> = self
            .registry
            .iter()
            .filter(|(_, p)| p.kind == PacketKind::Data)
            .map(|(id, _)| *id)
            .collect();
        for id in fragments {
            self.consume(id);
        }
        if self.phase != LessonPhase::Fragmentation {
            self.spawn_fragments();
            self.change_phase(LessonPhase::Handshake);
        }

        let sender = self.topology.sender_id();
        let syn = self.registry.create_control(PacketKind::Syn, self.file);
        self.spawn_at(syn, sender);
        tracing::debug!(cancelled, "connection reset");
    }

    // ------------------------------------------------------------------
    // Read surface
    // ------------------------------------------------------------------

    #[inline]
    pub fn now(&self) -> SimTime {
        self.now
    }

    #[inline]
    pub fn phase(&self) -> LessonPhase {
        self.phase
    }

    pub fn connection_phase(&self) -> Option<ConnPhase> {
        self.conn.as_ref().map(|c| c.phase())
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn packet(&self, id: PacketId) -> Option<&Packet> {
        self.registry.get(id)
    }

    pub fn packets(&self) -> impl Iterator<Item = &Packet> {
        self.registry.iter().map(|(_, p)| p)
    }

    /// Pending timers, for quiescence checks
    pub fn pending_timers(&self) -> usize {
        self.timers.pending()
    }

    /// Narration for the current state
    pub fn hint(&self) -> String {
        let conn = self.conn.as_ref();
        let inputs = HintInputs {
            conn_phase: conn.map(|c| c.phase()),
            fragments_total: self.fragment_total(),
            fragments_received: conn.map(|c| c.received_count()).unwrap_or(0),
            fragments_buffered: conn.map(|c| c.buffered_count()).unwrap_or(0),
            dup_acks: conn.map(|c| c.dup_acks()).unwrap_or(0),
            pending_retransmit: conn.and_then(|c| c.pending_retransmit()),
            losses: self.stats.losses,
            frames_sent: self.broadcast.as_ref().map(|b| b.frames_sent()).unwrap_or(0),
            frames_total: self.scenario.frame_count,
        };
        narrate(self.phase, &inputs)
    }

    // ------------------------------------------------------------------
    // Observation pass
    // ------------------------------------------------------------------

    fn observe_placements(&mut self) {
        let observations = self.topology.observe();
        // Process every departure before any arrival: a lift and a drop
        // can land in the same pass, and an arrival may schedule timers
        // the departure sweep must not cancel. The departure slot is
        // also the origin a rejected arrival bounces back to.
        let mut origins: HashMap<PacketId, NodeId> = HashMap::new();
        for (node, _, obs) in &observations {
            for &packet in &obs.departures {
                // Driver lifted it; nothing it was waiting on may fire.
                self.cancel_packet_timers(packet);
                origins.insert(packet, *node);
            }
        }
        for (node, kind, obs) in observations {
            for packet in obs.arrivals {
                self.on_arrival(packet, node, kind, origins.get(&packet).copied());
            }
        }
    }

    fn on_arrival(
        &mut self,
        packet: PacketId,
        node: NodeId,
        kind: SlotKind,
        origin: Option<NodeId>,
    ) {
        let Some(p) = self.registry.get(packet) else {
            return;
        };
        let pkind = p.kind;
        let seq = p.seq;
        tracing::debug!(?packet, ?node, kind = %pkind, "arrival");

        match kind {
            // Returning an entity home is always allowed.
            SlotKind::Sender => self.set_status(packet, TransitStatus::Ready),
            // Skipping the wire never works.
            SlotKind::Receiver(_) => self.reject(packet, RejectReason::WrongDestination, origin),
            SlotKind::Wire => self.on_wire_arrival(packet, pkind, seq, origin),
        }
    }

    fn on_wire_arrival(
        &mut self,
        packet: PacketId,
        kind: PacketKind,
        seq: Option<u32>,
        origin: Option<NodeId>,
    ) {
        match kind {
            // The fragmentation gate: a whole file never fits the wire.
            PacketKind::File => {
                self.set_status(packet, TransitStatus::Rejected);
                self.events.push(EngineEvent::Rejected {
                    id: packet,
                    reason: RejectReason::PayloadTooLarge,
                });
                self.stats.rejections += 1;
                self.schedule_for_packet(
                    packet,
                    self.config.processing,
                    PhaseTag::Reliable,
                    TimerAction::FragmentFile { file: self.file },
                );
            }
            PacketKind::Syn => {
                if self.phase == LessonPhase::Handshake && self.conn.is_none() {
                    self.launch(packet, self.reliable_receiver());
                } else if self.phase == LessonPhase::Handshake {
                    self.reject(packet, RejectReason::InvalidTransition, origin);
                } else {
                    self.reject(packet, RejectReason::WrongPhase, origin);
                }
            }
            PacketKind::Ack => {
                let awaiting = self.connection_phase() == Some(ConnPhase::SynReceived);
                if self.phase == LessonPhase::Handshake && awaiting {
                    self.launch(packet, self.reliable_receiver());
                } else {
                    self.reject(packet, RejectReason::InvalidTransition, origin);
                }
            }
            PacketKind::Data => self.on_wire_data(packet, seq, origin),
            PacketKind::Fin => match self.connection_phase() {
                Some(ConnPhase::Established) if self.phase == LessonPhase::Teardown => {
                    self.launch(packet, self.reliable_receiver());
                }
                Some(ConnPhase::Closing) => {
                    self.reject(packet, RejectReason::InvalidTransition, origin)
                }
                _ => self.reject(packet, RejectReason::WrongPhase, origin),
            },
            // Engine responses are not for the learner to send.
            PacketKind::SynAck | PacketKind::FinAck => {
                self.reject(packet, RejectReason::WrongDestination, origin)
            }
            PacketKind::Frame => self.on_wire_frame(packet, seq, origin),
        }
    }

    fn on_wire_data(&mut self, packet: PacketId, seq: Option<u32>, origin: Option<NodeId>) {
        match self.connection_phase() {
            Some(ConnPhase::Established)
                if self.phase == LessonPhase::Transfer || self.phase == LessonPhase::Teardown =>
            {
                let dropped = match (self.scenario.drop_seq, seq) {
                    (Some(drop), Some(s)) => {
                        drop == s
                            && !self
                                .conn
                                .as_ref()
                                .map(|c| c.retransmit_allowed())
                                .unwrap_or(false)
                    }
                    _ => false,
                };
                if dropped {
                    // Scripted loss: the fragment fades out mid-wire.
                    self.set_status(packet, TransitStatus::InFlight);
                    self.schedule_for_packet(
                        packet,
                        self.config.fade,
                        PhaseTag::Reliable,
                        TimerAction::FadeOut { packet },
                    );
                } else {
                    self.launch(packet, self.reliable_receiver());
                }
            }
            Some(ConnPhase::Closing) | None if self.phase == LessonPhase::Broadcast => {
                self.reject(packet, RejectReason::ConnectionClosed, origin)
            }
            Some(ConnPhase::Closing) => {
                self.reject(packet, RejectReason::ConnectionClosed, origin)
            }
            _ => self.reject(packet, RejectReason::WrongPhase, origin),
        }
    }

    fn on_wire_frame(&mut self, packet: PacketId, seq: Option<u32>, origin: Option<NodeId>) {
        if self.phase != LessonPhase::Broadcast {
            self.reject(packet, RejectReason::WrongPhase, origin);
            return;
        }
        let Some(number) = seq else {
            self.reject(packet, RejectReason::WrongPhase, origin);
            return;
        };
        // An accepted frame the driver lifted mid-wire re-launches its
        // fan-out; only genuinely new sends go through the order gate.
        if self.pending_fanouts.get(&packet) == Some(&number) {
            self.launch_fanout(packet, number);
            return;
        }
        let Some(state) = self.broadcast.as_mut() else {
            self.reject(packet, RejectReason::WrongPhase, origin);
            return;
        };
        match state.try_send(number) {
            SendOutcome::Accepted => {
                self.pending_fanouts.insert(packet, number);
                self.launch_fanout(packet, number);
            }
            SendOutcome::Bounced { expected } => self.reject(
                packet,
                RejectReason::OutOfOrderFrame {
                    sent: number,
                    expected,
                },
                origin,
            ),
        }
    }

    fn launch_fanout(&mut self, packet: PacketId, number: u32) {
        self.set_status(packet, TransitStatus::InFlight);
        self.schedule_for_packet(
            packet,
            self.config.propagation,
            PhaseTag::Broadcast,
            TimerAction::FrameFanout { number },
        );
    }

    /// Put a packet in flight towards a destination slot.
    fn launch(&mut self, packet: PacketId, to: NodeId) {
        self.set_status(packet, TransitStatus::InFlight);
        self.schedule_for_packet(
            packet,
            self.config.propagation,
            PhaseTag::Reliable,
            TimerAction::TransitArrive { packet, to },
        );
    }

    /// Refuse a placement and bounce the entity back to the slot it was
    /// lifted from, or to the sender tray when the origin is unknown.
    fn reject(&mut self, packet: PacketId, reason: RejectReason, origin: Option<NodeId>) {
        self.set_status(packet, TransitStatus::Rejected);
        self.events.push(EngineEvent::Rejected { id: packet, reason });
        self.stats.rejections += 1;
        if matches!(
            reason,
            RejectReason::InvalidTransition | RejectReason::ConnectionClosed
        ) {
            self.stats.invalid_transitions += 1;
        }
        let tag = if self.phase.is_reliable() {
            PhaseTag::Reliable
        } else {
            PhaseTag::Broadcast
        };
        // A wire origin would park the entity on the transit medium.
        let home = origin
            .filter(|&node| node != self.topology.wire_id())
            .unwrap_or_else(|| self.topology.sender_id());
        self.schedule_for_packet(
            packet,
            self.config.bounce,
            tag,
            TimerAction::BounceBack { packet, to: home },
        );
        tracing::debug!(?packet, %reason, "placement rejected");
    }

    // ------------------------------------------------------------------
    // Timer interpretation
    // ------------------------------------------------------------------

    /// Interpret one due timer against current state. Every handler
    /// re-verifies its target by id; a vanished target is a stale hit.
    fn apply(&mut self, action: TimerAction) {
        match action {
            TimerAction::TransitArrive { packet, to } => self.on_transit_arrive(packet, to),
            TimerAction::BounceBack { packet, to } => self.on_bounce_back(packet, to),
            TimerAction::FadeOut { packet } => self.on_fade_out(packet),
            TimerAction::FragmentFile { file } => self.on_fragment_file(file),
            TimerAction::ResponseLaunch { packet } => self.on_response_launch(packet),
            TimerAction::ReleaseStep { client } => self.on_release_step(client),
            TimerAction::ReleaseRetry { client } => self.on_release_retry(client),
            TimerAction::AssembleFile { file } => self.on_assemble_file(file),
            TimerAction::FrameFanout { number } => self.on_frame_fanout(number),
        }
    }

    fn on_transit_arrive(&mut self, packet: PacketId, to: NodeId) {
        if !self.registry.contains(packet) || self.topology.slot_of(packet).is_none() {
            self.stale_hit("transit target gone");
            return;
        }
        if self.topology.transfer(packet, to).is_err() {
            self.stale_hit("transit destination gone");
            return;
        }
        self.forget_packet_timers(packet);

        let Some(p) = self.registry.get(packet) else {
            return;
        };
        let kind = p.kind;
        let seq = p.seq;

        match self.topology.get(to).map(|s| s.kind) {
            Some(SlotKind::Receiver(client)) => {
                self.on_receiver_arrival(packet, kind, seq, client)
            }
            Some(SlotKind::Sender) => self.on_sender_response(packet, kind),
            _ => self.stale_hit("unexpected transit destination"),
        }
    }

    fn on_receiver_arrival(
        &mut self,
        packet: PacketId,
        kind: PacketKind,
        seq: Option<u32>,
        client: ClientId,
    ) {
        match kind {
            PacketKind::Syn => {
                if self.conn.is_none() {
                    let mut conn =
                        Connection::new(client, self.fragment_total(), self.config.dup_ack_threshold);
                    conn.open();
                    self.conn = Some(conn);
                    self.events.push(EngineEvent::ConnectionPhase {
                        client,
                        from: ConnPhase::Closed,
                        to: ConnPhase::SynReceived,
                    });
                    tracing::debug!(%client, "connection opened");
                }
                self.consume(packet);
                self.spawn_response(PacketKind::SynAck, client);
            }
            PacketKind::Ack => {
                let transitioned = self
                    .conn
                    .as_mut()
                    .map(|c| c.establish())
                    .unwrap_or(false);
                if transitioned {
                    self.events.push(EngineEvent::ConnectionPhase {
                        client,
                        from: ConnPhase::SynReceived,
                        to: ConnPhase::Established,
                    });
                    self.change_phase(LessonPhase::Transfer);
                } else {
                    self.stats.invalid_transitions += 1;
                }
                self.consume(packet);
            }
            PacketKind::Data => self.on_data_arrival(packet, seq, client),
            PacketKind::Fin => {
                let transitioned = self
                    .conn
                    .as_mut()
                    .map(|c| c.begin_close())
                    .unwrap_or(false);
                if transitioned {
                    self.events.push(EngineEvent::ConnectionPhase {
                        client,
                        from: ConnPhase::Established,
                        to: ConnPhase::Closing,
                    });
                } else {
                    self.stats.invalid_transitions += 1;
                }
                self.consume(packet);
                self.spawn_response(PacketKind::FinAck, client);
            }
            _ => self.stale_hit("unexpected kind at receiver"),
        }
    }

    fn on_data_arrival(&mut self, packet: PacketId, seq: Option<u32>, client: ClientId) {
        let Some(seq) = seq else {
            self.stale_hit("data without sequence");
            return;
        };
        let Some(conn) = self.conn.as_mut() else {
            self.stale_hit("data without connection");
            return;
        };
        if !conn.phase().accepts_data() {
            // FIN landed while this fragment was still in flight.
            self.consume(packet);
            return;
        }
        let event = conn.on_data(seq);
        let complete = conn.is_complete();
        self.handle_data_event(packet, client, event, complete);
    }

    fn handle_data_event(
        &mut self,
        packet: PacketId,
        client: ClientId,
        event: DataEvent,
        complete: bool,
    ) {
        let made_progress = matches!(event.outcome, DataOutcome::Delivered { .. });
        let DataEvent {
            outcome,
            ack,
            retransmit,
        } = event;

        let mut release_delay = Duration::ZERO;
        match outcome {
            DataOutcome::Delivered { flushed } => {
                self.set_status_ack(packet, TransitStatus::Delivered, ack);
                // The gap fill is logical at once; the visible releases
                // are staggered one buffer step apart.
                for run in &flushed {
                    release_delay += self.config.buffer_step;
                    self.release_queue.push_back(*run);
                    self.timers.schedule(
                        self.now + release_delay,
                        PhaseTag::Reliable,
                        TimerAction::ReleaseStep { client },
                    );
                }
            }
            DataOutcome::Buffered => {
                self.set_status_ack(packet, TransitStatus::Buffered, ack);
                self.timers.schedule(
                    self.now + self.config.buffer_step,
                    PhaseTag::Reliable,
                    TimerAction::ReleaseRetry { client },
                );
            }
            DataOutcome::Duplicate => {
                self.set_status_ack(packet, TransitStatus::Consumed, ack);
                self.consume_silent(packet);
            }
        }

        if let Some(missing) = retransmit {
            self.signal_retransmit(client, missing);
        }

        // Assembly waits for the last visible release; a duplicate after
        // completion must not schedule a second one.
        if complete && made_progress {
            self.timers.schedule(
                self.now + release_delay + self.config.assembly,
                PhaseTag::Reliable,
                TimerAction::AssembleFile { file: self.file },
            );
        }
    }

    fn signal_retransmit(&mut self, client: ClientId, seq: u32) {
        self.events
            .push(EngineEvent::RetransmitNeeded { client, seq });
        self.stats.retransmit_signals += 1;
        tracing::debug!(%client, seq, "fast retransmit signalled");

        // Re-admit the lost fragment if nothing alive carries it.
        if self.registry.find_data(self.file, seq).is_none() {
            let payload = self.fragment_payload(seq);
            let id = self.registry.create_data(self.file, seq, payload);
            let sender = self.topology.sender_id();
            self.spawn_at(id, sender);
        }
    }

    fn on_sender_response(&mut self, packet: PacketId, kind: PacketKind) {
        match kind {
            PacketKind::SynAck => {
                // The learner's ACK becomes draggable.
                self.consume(packet);
                let ack = self.registry.create_control(PacketKind::Ack, self.file);
                let sender = self.topology.sender_id();
                self.spawn_at(ack, sender);
            }
            PacketKind::FinAck => {
                self.consume(packet);
                self.finish_teardown();
            }
            _ => self.stale_hit("unexpected kind at sender"),
        }
    }

    /// FIN-ACK landed: cancel the reliable batch, destroy the connection,
    /// then open the broadcast phase.
    fn finish_teardown(&mut self) {
        let cancelled = self.timers.cancel_phase(PhaseTag::Reliable);
        self.stats.timers_cancelled += cancelled as u64;
        self.release_queue.clear();

        if let Some(conn) = self.conn.as_mut() {
            let client = conn.client;
            if conn.close() {
                self.events.push(EngineEvent::ConnectionPhase {
                    client,
                    from: ConnPhase::Closing,
                    to: ConnPhase::Closed,
                });
            }
        }
        self.conn = None;

        // Leftover reliable entities have no further role.
        let leftovers: Vec<PacketId> = self
            .registry
            .iter()
            .filter(|(_, p)| p.kind != PacketKind::Frame)
            .map(|(id, _)| *id)
            .collect();
        for id in leftovers {
            self.consume_silent(id);
        }

        self.change_phase(LessonPhase::Broadcast);
        self.seed_broadcast();
    }

    fn seed_broadcast(&mut self) {
        let clients = self.scenario.broadcast_clients.clone();
        let frames = self.scenario.frame_count;
        let matrix = match &self.scenario.delivery {
            DeliveryPlan::Seeded { seed, rate } => {
                DeliveryMatrix::seeded(clients, frames, *rate, *seed)
            }
            DeliveryPlan::Explicit(rows) => DeliveryMatrix::from_rows(clients, rows.clone()),
        };
        self.broadcast = Some(BroadcastState::new(matrix, frames));

        let sender = self.topology.sender_id();
        for number in 1..=frames {
            let id = self
                .registry
                .create_frame(self.file, number, self.scenario.frame_payload.clone());
            self.spawn_at(id, sender);
        }
        tracing::debug!(frames, "broadcast phase seeded");
    }

    fn on_bounce_back(&mut self, packet: PacketId, to: NodeId) {
        if !self.registry.contains(packet) {
            self.stale_hit("bounce target gone");
            return;
        }
        if self.topology.transfer(packet, to).is_err() {
            self.stale_hit("bounce home gone");
            return;
        }
        self.forget_packet_timers(packet);
        self.set_status(packet, TransitStatus::Ready);
    }

    fn on_fade_out(&mut self, packet: PacketId) {
        let Some(p) = self.registry.get(packet) else {
            self.stale_hit("fade target gone");
            return;
        };
        let seq = p.seq.unwrap_or(0);
        self.set_status(packet, TransitStatus::Lost);
        self.events.push(EngineEvent::SimulatedLoss { id: packet, seq });
        self.stats.losses += 1;
        self.consume_silent(packet);
        tracing::debug!(?packet, seq, "scripted loss");

        // If the signal already fired while this copy was fading, the
        // respawn was skipped; re-admit the fragment now.
        let signalled = self
            .conn
            .as_ref()
            .and_then(|c| c.pending_retransmit())
            .map_or(false, |s| s == seq);
        if signalled && self.registry.find_data(self.file, seq).is_none() {
            let payload = self.fragment_payload(seq);
            let id = self.registry.create_data(self.file, seq, payload);
            let sender = self.topology.sender_id();
            self.spawn_at(id, sender);
        }
    }

    fn on_fragment_file(&mut self, file: FileKey) {
        let Some(whole) = self
            .registry
            .iter()
            .find(|(_, p)| p.kind == PacketKind::File && p.file == file)
            .map(|(id, _)| *id)
        else {
            self.stale_hit("file gone before fragmentation");
            return;
        };
        self.consume(whole);
        self.spawn_fragments();
        if self.phase == LessonPhase::Fragmentation {
            self.change_phase(LessonPhase::Handshake);
        }
    }

    fn spawn_fragments(&mut self) {
        let sender = self.topology.sender_id();
        for seq in 1..=self.fragment_total() {
            let payload = self.fragment_payload(seq);
            let id = self.registry.create_data(self.file, seq, payload);
            self.spawn_at(id, sender);
        }
    }

    fn spawn_response(&mut self, kind: PacketKind, client: ClientId) {
        let Some(receiver) = self.topology.receiver_id(client) else {
            return;
        };
        let id = self.registry.create_control(kind, self.file);
        if !self.spawn_at(id, receiver) {
            return;
        }
        self.schedule_for_packet(
            id,
            self.config.processing,
            PhaseTag::Reliable,
            TimerAction::ResponseLaunch { packet: id },
        );
    }

    fn on_response_launch(&mut self, packet: PacketId) {
        if !self.registry.contains(packet) {
            self.stale_hit("response gone before launch");
            return;
        }
        let wire = self.topology.wire_id();
        if self.topology.transfer(packet, wire).is_err() {
            self.stale_hit("wire unavailable for response");
            return;
        }
        self.forget_packet_timers(packet);
        self.set_status(packet, TransitStatus::InFlight);
        let home = self.topology.sender_id();
        self.schedule_for_packet(
            packet,
            self.config.propagation,
            PhaseTag::Reliable,
            TimerAction::TransitArrive { packet, to: home },
        );
    }

    fn on_release_step(&mut self, _client: ClientId) {
        let Some(seq) = self.release_queue.pop_front() else {
            self.stale_hit("release queue drained");
            return;
        };
        let Some(packet) = self.registry.find_data(self.file, seq) else {
            self.stale_hit("released fragment gone");
            return;
        };
        let receiver = self.reliable_receiver();
        if self.topology.slot_of(packet) != Some(receiver) {
            self.stale_hit("released fragment not at receiver");
            return;
        }
        let ack = self.conn.as_ref().map(|c| c.ack_number());
        match ack {
            Some(ack) => self.set_status_ack(packet, TransitStatus::Delivered, ack),
            None => self.set_status(packet, TransitStatus::Delivered),
        }
    }

    fn on_release_retry(&mut self, client: ClientId) {
        let Some(conn) = self.conn.as_mut() else {
            self.stale_hit("retry without connection");
            return;
        };
        if !conn.phase().accepts_data() {
            return;
        }
        let Some(event) = conn.flush_buffered() else {
            return;
        };
        let complete = conn.is_complete();
        // A late flush releases like a gap fill, one step per fragment.
        let mut release_delay = Duration::ZERO;
        if let DataOutcome::Delivered { flushed } = &event.outcome {
            for seq in flushed {
                release_delay += self.config.buffer_step;
                self.release_queue.push_back(*seq);
                self.timers.schedule(
                    self.now + release_delay,
                    PhaseTag::Reliable,
                    TimerAction::ReleaseStep { client },
                );
            }
        }
        if let Some(missing) = event.retransmit {
            self.signal_retransmit(client, missing);
        }
        if complete {
            self.timers.schedule(
                self.now + release_delay + self.config.assembly,
                PhaseTag::Reliable,
                TimerAction::AssembleFile { file: self.file },
            );
        }
    }

    fn on_assemble_file(&mut self, file: FileKey) {
        let assembled = self
            .conn
            .as_ref()
            .map(|c| c.is_complete() && c.phase() == ConnPhase::Established)
            .unwrap_or(false);
        if !assembled || self.phase != LessonPhase::Transfer {
            self.stale_hit("assembly without complete transfer");
            return;
        }
        self.events.push(EngineEvent::FileComplete { file });
        self.change_phase(LessonPhase::Teardown);

        // The polite goodbye becomes draggable.
        let fin = self.registry.create_control(PacketKind::Fin, self.file);
        let sender = self.topology.sender_id();
        self.spawn_at(fin, sender);
        tracing::debug!("file assembled");
    }

    fn on_frame_fanout(&mut self, number: u32) {
        let Some(state) = self.broadcast.as_mut() else {
            self.stale_hit("fanout without broadcast state");
            return;
        };
        let (delivered, missed) = state.matrix().outcomes(number);
        let final_frame = state.on_fanout(number);

        // The sent frame is consumed at the wire.
        let sent = self
            .pending_fanouts
            .iter()
            .find(|(_, &n)| n == number)
            .map(|(&id, _)| id);
        if let Some(id) = sent {
            self.pending_fanouts.remove(&id);
            self.consume(id);
        }

        // Fresh copies appear in each reached inbox.
        for &client in &delivered {
            let Some(inbox) = self.topology.receiver_id(client) else {
                continue;
            };
            let id = self
                .registry
                .create_frame(self.file, number, self.scenario.frame_payload.clone());
            if self.topology.place_synced(id, inbox).is_ok() {
                self.set_status(id, TransitStatus::Delivered);
            } else {
                self.registry.remove(id);
            }
        }

        self.stats.frames_delivered += delivered.len() as u64;
        self.stats.frames_missed += missed.len() as u64;
        self.events.push(EngineEvent::FrameDelivered {
            number,
            delivered,
            missed,
        });

        if final_frame && !self.complete {
            self.complete = true;
            self.change_phase(LessonPhase::Complete);
            self.events.push(EngineEvent::LessonComplete);
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn fragment_total(&self) -> u32 {
        self.scenario.fragment_count(self.config.mtu)
    }

    fn fragment_payload(&self, seq: u32) -> Bytes {
        let mtu = self.config.mtu;
        let start = ((seq - 1) as usize) * mtu;
        let end = (start + mtu).min(self.scenario.payload.len());
        self.scenario.payload.slice(start..end)
    }

    fn reliable_receiver(&self) -> NodeId {
        self.topology
            .receiver_id(self.scenario.reliable_client)
            .unwrap_or_else(|| self.topology.wire_id())
    }

    /// Place a freshly created entity in a slot. A packet no slot can
    /// hold is not allowed to exist; capacities are sized so this only
    /// trips if the slot math is wrong.
    fn spawn_at(&mut self, packet: PacketId, node: NodeId) -> bool {
        if self.topology.place_synced(packet, node).is_ok() {
            self.push_status(packet);
            true
        } else {
            self.registry.remove(packet);
            self.stale_hit("spawn slot full");
            false
        }
    }

    fn change_phase(&mut self, to: LessonPhase) {
        if self.phase == to {
            return;
        }
        let from = self.phase;
        self.phase = to;
        self.events.push(EngineEvent::PhaseChanged { from, to });
        tracing::debug!(%from, %to, "lesson phase change");
    }

    /// Emit Consumed and destroy the entity.
    fn consume(&mut self, packet: PacketId) {
        self.set_status(packet, TransitStatus::Consumed);
        self.consume_silent(packet);
    }

    /// Destroy the entity without a status event.
    fn consume_silent(&mut self, packet: PacketId) {
        if let Some(slot) = self.topology.slot_of(packet) {
            let _ = self.topology.remove_synced(packet, slot);
        }
        self.cancel_packet_timers(packet);
        self.registry.remove(packet);
    }

    fn set_status(&mut self, packet: PacketId, status: TransitStatus) {
        if let Some(p) = self.registry.get_mut(packet) {
            p.status = status;
        }
        self.push_status(packet);
    }

    fn set_status_ack(&mut self, packet: PacketId, status: TransitStatus, ack: u32) {
        if let Some(p) = self.registry.get_mut(packet) {
            p.status = status;
        }
        if let Some(p) = self.registry.get(packet) {
            let mut update = StatusUpdate::new(packet, p.status).with_ack(ack);
            if let Some(seq) = p.seq {
                update = update.with_seq(seq);
            }
            self.events.push(EngineEvent::StatusChanged(update));
        }
    }

    fn push_status(&mut self, packet: PacketId) {
        if let Some(p) = self.registry.get(packet) {
            let mut update = StatusUpdate::new(packet, p.status);
            if let Some(seq) = p.seq {
                update = update.with_seq(seq);
            }
            self.events.push(EngineEvent::StatusChanged(update));
        }
    }

    fn schedule_for_packet(
        &mut self,
        packet: PacketId,
        delay: Duration,
        tag: PhaseTag,
        action: TimerAction,
    ) {
        let handle = self.timers.schedule(self.now + delay, tag, action);
        self.packet_timers.entry(packet).or_default().push(handle);
    }

    fn cancel_packet_timers(&mut self, packet: PacketId) {
        if let Some(handles) = self.packet_timers.remove(&packet) {
            for handle in handles {
                if self.timers.cancel(handle) {
                    self.stats.timers_cancelled += 1;
                }
            }
        }
    }

    /// Drop bookkeeping for timers that just resolved.
    fn forget_packet_timers(&mut self, packet: PacketId) {
        self.packet_timers.remove(&packet);
    }

    fn stale_hit(&mut self, what: &'static str) {
        self.stats.stale_timers += 1;
        tracing::debug!(what, "stale timer skipped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> Scenario {
        Scenario::new(Bytes::from_static(b"0123456789ab"))
            .with_delivery(DeliveryPlan::Explicit(vec![
                vec![true, true, true],
                vec![true, false, true],
                vec![false, true, false],
            ]))
    }

    fn sim() -> FlowSim {
        FlowSim::new(scenario(), SimConfig::fast()).unwrap()
    }

    fn ready_kind(sim: &FlowSim, kind: PacketKind) -> Option<PacketId> {
        let sender = sim.topology().sender_id();
        sim.topology()
            .get(sender)?
            .members()
            .iter()
            .copied()
            .find(|&id| sim.packet(id).map(|p| p.kind) == Some(kind))
    }

    fn ready_data(sim: &FlowSim, seq: u32) -> Option<PacketId> {
        let sender = sim.topology().sender_id();
        sim.topology()
            .get(sender)?
            .members()
            .iter()
            .copied()
            .find(|&id| {
                sim.packet(id)
                    .map(|p| p.kind == PacketKind::Data && p.seq == Some(seq))
                    .unwrap_or(false)
            })
    }

    fn drag_to_wire(sim: &mut FlowSim, packet: PacketId) {
        let sender = sim.topology().sender_id();
        let wire = sim.topology().wire_id();
        sim.remove_entity(packet, sender).unwrap();
        sim.place_entity(packet, wire).unwrap();
    }

    fn settle(sim: &mut FlowSim) {
        // Generous for the fast config: every chain fits well inside it.
        sim.advance(Duration::from_millis(2000));
    }

    fn run_fragmentation(sim: &mut FlowSim) {
        let file = ready_kind(sim, PacketKind::File).unwrap();
        drag_to_wire(sim, file);
        settle(sim);
        assert_eq!(sim.phase(), LessonPhase::Handshake);
    }

    fn run_handshake(sim: &mut FlowSim) {
        let syn = ready_kind(sim, PacketKind::Syn).unwrap();
        drag_to_wire(sim, syn);
        settle(sim);
        let ack = ready_kind(sim, PacketKind::Ack).unwrap();
        drag_to_wire(sim, ack);
        settle(sim);
        assert_eq!(sim.phase(), LessonPhase::Transfer);
        assert_eq!(sim.connection_phase(), Some(ConnPhase::Established));
    }

    fn send_seq(sim: &mut FlowSim, seq: u32) {
        let packet = ready_data(sim, seq).unwrap();
        drag_to_wire(sim, packet);
        settle(sim);
    }

    #[test]
    fn test_initial_seed() {
        let sim = sim();
        assert_eq!(sim.phase(), LessonPhase::Fragmentation);
        assert!(ready_kind(&sim, PacketKind::File).is_some());
        assert!(ready_kind(&sim, PacketKind::Syn).is_some());
    }

    #[test]
    fn test_invalid_scenarios_refused() {
        let empty = FlowSim::new(Scenario::new(&b""[..]), SimConfig::fast());
        assert!(matches!(empty, Err(SimError::InvalidScenario(_))));

        let no_frames = FlowSim::new(
            Scenario::new(&b"abcd"[..]).with_frame_count(0),
            SimConfig::fast(),
        );
        assert!(matches!(no_frames, Err(SimError::InvalidScenario(_))));

        let mut config = SimConfig::fast();
        config.mtu = 0;
        let zero_mtu = FlowSim::new(Scenario::new(&b"abcd"[..]), config);
        assert!(matches!(zero_mtu, Err(SimError::InvalidScenario(_))));
    }

    #[test]
    fn test_large_file_fragments_all_draggable() {
        // 80 bytes at mtu 4 split into 20 fragments, more than the slot
        // floor of 16; every one of them must land in the sender tray.
        let mut sim =
            FlowSim::new(Scenario::new(Bytes::from(vec![7u8; 80])), SimConfig::fast()).unwrap();
        let file = ready_kind(&sim, PacketKind::File).unwrap();
        drag_to_wire(&mut sim, file);
        settle(&mut sim);

        assert_eq!(sim.phase(), LessonPhase::Handshake);
        for seq in 1..=20 {
            assert!(ready_data(&sim, seq).is_some(), "fragment {} missing", seq);
        }
    }

    #[test]
    fn test_fragmentation_gate() {
        let mut sim = sim();
        let file = ready_kind(&sim, PacketKind::File).unwrap();
        drag_to_wire(&mut sim, file);
        settle(&mut sim);

        let events = sim.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::Rejected {
                reason: RejectReason::PayloadTooLarge,
                ..
            }
        )));
        assert_eq!(sim.phase(), LessonPhase::Handshake);
        // 12 payload bytes at mtu 4 split into 3 fragments.
        for seq in 1..=3 {
            assert!(ready_data(&sim, seq).is_some());
        }
        assert!(sim.packet(file).is_none());
    }

    #[test]
    fn test_data_before_handshake_bounces() {
        let mut sim = sim();
        run_fragmentation(&mut sim);

        let fragment = ready_data(&sim, 1).unwrap();
        drag_to_wire(&mut sim, fragment);
        settle(&mut sim);

        let events = sim.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::Rejected {
                reason: RejectReason::WrongPhase,
                ..
            }
        )));
        // Bounced home, still draggable.
        assert!(ready_data(&sim, 1).is_some());
    }

    #[test]
    fn test_handshake_flow() {
        let mut sim = sim();
        run_fragmentation(&mut sim);

        let syn = ready_kind(&sim, PacketKind::Syn).unwrap();
        drag_to_wire(&mut sim, syn);
        settle(&mut sim);

        assert_eq!(sim.connection_phase(), Some(ConnPhase::SynReceived));
        // SYN-ACK travelled back and exposed the draggable ACK.
        let ack = ready_kind(&sim, PacketKind::Ack).unwrap();
        drag_to_wire(&mut sim, ack);
        settle(&mut sim);

        assert_eq!(sim.connection_phase(), Some(ConnPhase::Established));
        assert_eq!(sim.phase(), LessonPhase::Transfer);
    }

    #[test]
    fn test_direct_receiver_placement_rejected() {
        let mut sim = sim();
        run_fragmentation(&mut sim);
        let syn = ready_kind(&sim, PacketKind::Syn).unwrap();
        let sender = sim.topology().sender_id();
        let receiver = sim.topology().receiver_id(ClientId::new(1)).unwrap();

        sim.remove_entity(syn, sender).unwrap();
        sim.place_entity(syn, receiver).unwrap();
        settle(&mut sim);

        let events = sim.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::Rejected {
                reason: RejectReason::WrongDestination,
                ..
            }
        )));
        assert!(ready_kind(&sim, PacketKind::Syn).is_some());
        assert_eq!(sim.connection_phase(), None);
    }

    #[test]
    fn test_out_of_order_buffered_then_flushed() {
        let mut sim = sim();
        run_fragmentation(&mut sim);
        run_handshake(&mut sim);
        sim.drain_events();

        send_seq(&mut sim, 1);
        send_seq(&mut sim, 3);

        let events = sim.drain_events();
        let buffered = events.iter().any(|e| matches!(
            e,
            EngineEvent::StatusChanged(StatusUpdate {
                status: TransitStatus::Buffered,
                seq: Some(3),
                ack: Some(2),
                ..
            })
        ));
        assert!(buffered);

        send_seq(&mut sim, 2);
        settle(&mut sim);

        let events = sim.drain_events();
        // Sequence 2 delivered with the post-flush ack.
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::StatusChanged(StatusUpdate {
                status: TransitStatus::Delivered,
                seq: Some(2),
                ack: Some(4),
                ..
            })
        )));
        // The buffered 3 visibly released afterwards.
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::StatusChanged(StatusUpdate {
                status: TransitStatus::Delivered,
                seq: Some(3),
                ..
            })
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::FileComplete { .. })));
        assert_eq!(sim.phase(), LessonPhase::Teardown);
        assert!(ready_kind(&sim, PacketKind::Fin).is_some());
    }

    #[test]
    fn test_interruption_mid_flight_stays_consistent() {
        let mut sim = sim();
        run_fragmentation(&mut sim);
        run_handshake(&mut sim);

        let fragment = ready_data(&sim, 1).unwrap();
        drag_to_wire(&mut sim, fragment);
        // Let the transit start but not land.
        sim.advance(Duration::from_millis(10));

        let wire = sim.topology().wire_id();
        sim.remove_entity(fragment, wire).unwrap();
        settle(&mut sim);

        // Nothing arrived, no ghost timers fired against it.
        assert_eq!(sim.connection_phase(), Some(ConnPhase::Established));
        let conn_received: Vec<EngineEvent> = sim
            .drain_events()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    EngineEvent::StatusChanged(StatusUpdate {
                        status: TransitStatus::Delivered,
                        ..
                    })
                )
            })
            .collect();
        assert!(conn_received.is_empty());

        // Replacing it afterwards still works.
        sim.place_entity(fragment, wire).unwrap();
        settle(&mut sim);
        assert!(sim.drain_events().iter().any(|e| matches!(
            e,
            EngineEvent::StatusChanged(StatusUpdate {
                status: TransitStatus::Delivered,
                seq: Some(1),
                ..
            })
        )));
    }

    #[test]
    fn test_reset_connection_reseeds_handshake() {
        let mut sim = sim();
        run_fragmentation(&mut sim);
        run_handshake(&mut sim);
        send_seq(&mut sim, 1);

        sim.reset_connection();
        assert_eq!(sim.phase(), LessonPhase::Handshake);
        assert_eq!(sim.connection_phase(), None);
        assert!(ready_kind(&sim, PacketKind::Syn).is_some());
        for seq in 1..=3 {
            assert!(ready_data(&sim, seq).is_some());
        }

        // The lesson replays cleanly.
        let syn = ready_kind(&sim, PacketKind::Syn).unwrap();
        drag_to_wire(&mut sim, syn);
        settle(&mut sim);
        assert_eq!(sim.connection_phase(), Some(ConnPhase::SynReceived));
    }

    #[test]
    fn test_hint_follows_phase() {
        let mut sim = sim();
        assert!(sim.hint().contains("MTU"));
        run_fragmentation(&mut sim);
        assert!(sim.hint().contains("SYN"));
        run_handshake(&mut sim);
        assert!(sim.hint().contains("fragments"));
    }
}
