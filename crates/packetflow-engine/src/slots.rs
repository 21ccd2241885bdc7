//! Node slots and membership observation
//!
//! Slots are the droppable locations of a lesson: the sender tray, the
//! wire, and one inbox per client. Each slot keeps the member list the
//! driver mutates plus a `seen` snapshot; `observe` diffs the two so the
//! engine classifies exactly the placements the driver made since the
//! last pass. Engine-internal moves call `sync` instead, so they are
//! never re-classified as driver actions.

use packetflow_core::{ClientId, NodeId, PacketId, SimError, SimResult};

/// Slot sizes for one lesson
///
/// Derived from the scenario so engine seeding can never overflow a
/// slot: every fragment and frame must fit at the sender and in each
/// inbox, with headroom for the control packets alive alongside them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotCapacities {
    pub sender: usize,
    pub wire: usize,
    pub receiver: usize,
}

impl SlotCapacities {
    const SENDER_FLOOR: usize = 16;
    const WIRE_FLOOR: usize = 4;
    const RECEIVER_FLOOR: usize = 16;

    /// Capacities for a lesson with the given fragment and frame counts.
    pub fn for_lesson(fragments: u32, frames: u32) -> Self {
        // At most the whole file, one learner control and one engine
        // response exist alongside the fragments and frames.
        let entities = fragments as usize + frames as usize + 4;
        SlotCapacities {
            sender: entities.max(Self::SENDER_FLOOR),
            wire: entities.max(Self::WIRE_FLOOR),
            receiver: entities.max(Self::RECEIVER_FLOOR),
        }
    }
}

/// What a slot represents in the lesson topology
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotKind {
    /// The learner's tray of draggable packets
    Sender,
    /// The shared transit medium
    Wire,
    /// One client's inbox
    Receiver(ClientId),
}

/// Driver-made membership changes since the last observation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotObservation {
    pub arrivals: Vec<PacketId>,
    pub departures: Vec<PacketId>,
}

impl SlotObservation {
    pub fn is_empty(&self) -> bool {
        self.arrivals.is_empty() && self.departures.is_empty()
    }
}

/// One droppable location
#[derive(Clone, Debug)]
pub struct NodeSlot {
    pub id: NodeId,
    pub kind: SlotKind,
    pub capacity: usize,
    /// Current members, in arrival order
    members: Vec<PacketId>,
    /// Membership as of the last observation
    seen: Vec<PacketId>,
}

impl NodeSlot {
    fn new(id: NodeId, kind: SlotKind, capacity: usize) -> Self {
        NodeSlot {
            id,
            kind,
            capacity,
            members: Vec::new(),
            seen: Vec::new(),
        }
    }

    pub fn contains(&self, packet: PacketId) -> bool {
        self.members.contains(&packet)
    }

    pub fn members(&self) -> &[PacketId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn insert(&mut self, packet: PacketId) -> SimResult<()> {
        if self.members.contains(&packet) {
            return Err(SimError::AlreadyPlaced {
                packet,
                node: self.id,
            });
        }
        if self.members.len() >= self.capacity {
            return Err(SimError::SlotFull {
                node: self.id,
                capacity: self.capacity,
            });
        }
        self.members.push(packet);
        Ok(())
    }

    fn remove(&mut self, packet: PacketId) -> SimResult<()> {
        let pos = self
            .members
            .iter()
            .position(|&p| p == packet)
            .ok_or(SimError::NotInSlot {
                packet,
                node: self.id,
            })?;
        self.members.remove(pos);
        Ok(())
    }

    /// Diff members against the snapshot, then advance the snapshot.
    fn take_observation(&mut self) -> SlotObservation {
        let arrivals = self
            .members
            .iter()
            .copied()
            .filter(|p| !self.seen.contains(p))
            .collect();
        let departures = self
            .seen
            .iter()
            .copied()
            .filter(|p| !self.members.contains(p))
            .collect();
        self.seen = self.members.clone();
        SlotObservation {
            arrivals,
            departures,
        }
    }

    /// Advance the snapshot without reporting a diff.
    fn sync(&mut self) {
        self.seen = self.members.clone();
    }
}

/// The lesson topology: sender, wire, and one inbox per client
#[derive(Clone, Debug)]
pub struct Topology {
    slots: Vec<NodeSlot>,
    sender: NodeId,
    wire: NodeId,
}

impl Topology {
    /// Sender + wire + inboxes for the reliable peer and every broadcast
    /// client. Node ids are stable across runs: sender 1, wire 2,
    /// receivers 10 upward in client order.
    pub fn build(
        reliable_client: ClientId,
        broadcast_clients: &[ClientId],
        caps: SlotCapacities,
    ) -> Self {
        let sender = NodeId::new(1);
        let wire = NodeId::new(2);
        let mut slots = vec![
            NodeSlot::new(sender, SlotKind::Sender, caps.sender),
            NodeSlot::new(wire, SlotKind::Wire, caps.wire),
        ];

        let mut next = 10u64;
        let mut add_receiver = |slots: &mut Vec<NodeSlot>, client: ClientId| {
            if slots
                .iter()
                .any(|s| s.kind == SlotKind::Receiver(client))
            {
                return;
            }
            slots.push(NodeSlot::new(
                NodeId::new(next),
                SlotKind::Receiver(client),
                caps.receiver,
            ));
            next += 1;
        };

        add_receiver(&mut slots, reliable_client);
        for &client in broadcast_clients {
            add_receiver(&mut slots, client);
        }

        Topology {
            slots,
            sender,
            wire,
        }
    }

    #[inline]
    pub fn sender_id(&self) -> NodeId {
        self.sender
    }

    #[inline]
    pub fn wire_id(&self) -> NodeId {
        self.wire
    }

    pub fn receiver_id(&self, client: ClientId) -> Option<NodeId> {
        self.slots
            .iter()
            .find(|s| s.kind == SlotKind::Receiver(client))
            .map(|s| s.id)
    }

    pub fn get(&self, node: NodeId) -> Option<&NodeSlot> {
        self.slots.iter().find(|s| s.id == node)
    }

    fn get_mut(&mut self, node: NodeId) -> SimResult<&mut NodeSlot> {
        self.slots
            .iter_mut()
            .find(|s| s.id == node)
            .ok_or(SimError::UnknownNode(node))
    }

    /// Slot currently holding the packet, if any
    pub fn slot_of(&self, packet: PacketId) -> Option<NodeId> {
        self.slots
            .iter()
            .find(|s| s.contains(packet))
            .map(|s| s.id)
    }

    /// Driver-facing placement: the packet must not be in any slot.
    pub fn place(&mut self, packet: PacketId, node: NodeId) -> SimResult<()> {
        if let Some(holder) = self.slot_of(packet) {
            return Err(SimError::AlreadyPlaced {
                packet,
                node: holder,
            });
        }
        self.get_mut(node)?.insert(packet)
    }

    /// Driver-facing removal from a named slot.
    pub fn remove(&mut self, packet: PacketId, node: NodeId) -> SimResult<()> {
        self.get_mut(node)?.remove(packet)
    }

    /// Engine-internal placement: updates the snapshot in the same step
    /// so the move is never observed as a driver action.
    pub fn place_synced(&mut self, packet: PacketId, node: NodeId) -> SimResult<()> {
        let slot = self.get_mut(node)?;
        slot.insert(packet)?;
        slot.sync();
        Ok(())
    }

    /// Engine-internal removal, snapshot updated in the same step.
    pub fn remove_synced(&mut self, packet: PacketId, node: NodeId) -> SimResult<()> {
        let slot = self.get_mut(node)?;
        slot.remove(packet)?;
        slot.sync();
        Ok(())
    }

    /// Engine-internal move between slots. Atomic: when the destination
    /// refuses the packet it returns to its source slot.
    pub fn transfer(&mut self, packet: PacketId, to: NodeId) -> SimResult<()> {
        let from = self.slot_of(packet);
        if let Some(from) = from {
            self.remove_synced(packet, from)?;
        }
        match self.place_synced(packet, to) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(from) = from {
                    let _ = self.place_synced(packet, from);
                }
                Err(err)
            }
        }
    }

    /// Diff every slot against its snapshot, in stable slot order.
    pub fn observe(&mut self) -> Vec<(NodeId, SlotKind, SlotObservation)> {
        self.slots
            .iter_mut()
            .map(|s| (s.id, s.kind, s.take_observation()))
            .filter(|(_, _, obs)| !obs.is_empty())
            .collect()
    }

    pub fn slots(&self) -> &[NodeSlot] {
        &self.slots
    }
}
