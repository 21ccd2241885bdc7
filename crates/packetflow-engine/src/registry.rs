//! Packet registry - every live entity in one lesson attempt

use std::collections::BTreeMap;

use bytes::Bytes;
use packetflow_core::{FileKey, Packet, PacketId, PacketKind};

/// Entity store with monotonic id allocation. Iteration is in id order,
/// which keeps every registry sweep deterministic.
#[derive(Debug, Default)]
pub struct PacketRegistry {
    /// Live packets indexed by id
    packets: BTreeMap<PacketId, Packet>,
    next_id: u64,
}

impl PacketRegistry {
    pub fn new() -> Self {
        PacketRegistry {
            packets: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn alloc_id(&mut self) -> PacketId {
        let id = PacketId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Create a whole-file entity
    pub fn create_file(&mut self, file: FileKey, payload: Bytes) -> PacketId {
        let id = self.alloc_id();
        self.packets.insert(id, Packet::file(id, file, payload));
        id
    }

    /// Create one data fragment
    pub fn create_data(&mut self, file: FileKey, seq: u32, payload: Bytes) -> PacketId {
        let id = self.alloc_id();
        self.packets.insert(id, Packet::data(id, file, seq, payload));
        id
    }

    /// Create a control packet
    pub fn create_control(&mut self, kind: PacketKind, file: FileKey) -> PacketId {
        let id = self.alloc_id();
        self.packets.insert(id, Packet::control(id, kind, file));
        id
    }

    /// Create a broadcast frame
    pub fn create_frame(&mut self, file: FileKey, number: u32, payload: Bytes) -> PacketId {
        let id = self.alloc_id();
        self.packets.insert(id, Packet::frame(id, file, number, payload));
        id
    }

    pub fn get(&self, id: PacketId) -> Option<&Packet> {
        self.packets.get(&id)
    }

    pub fn get_mut(&mut self, id: PacketId) -> Option<&mut Packet> {
        self.packets.get_mut(&id)
    }

    /// Destroy a consumed entity
    pub fn remove(&mut self, id: PacketId) -> Option<Packet> {
        self.packets.remove(&id)
    }

    pub fn contains(&self, id: PacketId) -> bool {
        self.packets.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PacketId, &Packet)> {
        self.packets.iter()
    }

    /// Live data fragment carrying the given sequence, if any
    pub fn find_data(&self, file: FileKey, seq: u32) -> Option<PacketId> {
        self.packets
            .values()
            .find(|p| p.kind == PacketKind::Data && p.file == file && p.seq == Some(seq))
            .map(|p| p.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packetflow_core::TransitStatus;

    #[test]
    fn test_ids_monotonic() {
        let mut reg = PacketRegistry::new();
        let a = reg.create_control(PacketKind::Syn, FileKey::new(1));
        let b = reg.create_control(PacketKind::Fin, FileKey::new(1));
        assert!(a < b);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_remove_destroys() {
        let mut reg = PacketRegistry::new();
        let id = reg.create_data(FileKey::new(1), 1, Bytes::from_static(b"ab"));
        assert!(reg.contains(id));
        let packet = reg.remove(id).unwrap();
        assert_eq!(packet.seq, Some(1));
        assert!(!reg.contains(id));
        assert!(reg.get(id).is_none());
    }

    #[test]
    fn test_find_data_by_seq() {
        let mut reg = PacketRegistry::new();
        let file = FileKey::new(1);
        reg.create_data(file, 1, Bytes::from_static(b"aa"));
        let two = reg.create_data(file, 2, Bytes::from_static(b"bb"));
        reg.create_frame(file, 2, Bytes::from_static(b"xx"));

        assert_eq!(reg.find_data(file, 2), Some(two));
        assert_eq!(reg.find_data(file, 9), None);
        assert_eq!(reg.find_data(FileKey::new(2), 2), None);
    }

    #[test]
    fn test_status_mutation() {
        let mut reg = PacketRegistry::new();
        let id = reg.create_control(PacketKind::Syn, FileKey::new(1));
        reg.get_mut(id).unwrap().status = TransitStatus::InFlight;
        assert_eq!(reg.get(id).unwrap().status, TransitStatus::InFlight);
    }
}
