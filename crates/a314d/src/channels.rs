//! Logical channels and the send queue toward the Amiga.
//!
//! A channel exists from the moment the Amiga connects on a fresh id until
//! it is neither associated with a client nor holding packets to send. The
//! send queue holds channel ids, not packets: packets drain round-robin,
//! one per pass, and a channel is queued exactly when its packet queue is
//! non-empty.

use std::collections::{HashMap, VecDeque};

use a314_wire::packet::{Packet, PacketBody, PACKET_HEADER_LEN};

use crate::clients::ClientId;

/// One logical channel. The Amiga picks the 8-bit `channel_id`; the daemon
/// picks the 32-bit `stream_id` the associated client sees.
pub struct LogicalChannel {
    pub channel_id: u8,
    pub association: Option<ClientId>,
    pub stream_id: u32,
    pub got_eos_from_amiga: bool,
    pub got_eos_from_client: bool,
    packet_queue: VecDeque<PacketBody>,
}

impl LogicalChannel {
    fn new(channel_id: u8) -> Self {
        LogicalChannel {
            channel_id,
            association: None,
            stream_id: 0,
            got_eos_from_amiga: false,
            got_eos_from_client: false,
            packet_queue: VecDeque::new(),
        }
    }

    pub fn has_queued_packets(&self) -> bool {
        !self.packet_queue.is_empty()
    }
}

/// All live channels plus the global send queue.
#[derive(Default)]
pub struct ChannelTable {
    channels: HashMap<u8, LogicalChannel>,
    send_queue: VecDeque<u8>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn contains(&self, channel_id: u8) -> bool {
        self.channels.contains_key(&channel_id)
    }

    pub fn get(&self, channel_id: u8) -> Option<&LogicalChannel> {
        self.channels.get(&channel_id)
    }

    pub fn get_mut(&mut self, channel_id: u8) -> Option<&mut LogicalChannel> {
        self.channels.get_mut(&channel_id)
    }

    /// Create a fresh, unassociated channel. The caller checks for reuse
    /// first; connecting on a live id is a peer protocol violation.
    pub fn create(&mut self, channel_id: u8) -> &mut LogicalChannel {
        self.channels
            .entry(channel_id)
            .or_insert_with(|| LogicalChannel::new(channel_id))
    }

    /// Queue a packet for the Amiga and link the channel into the send
    /// queue if this is its first pending packet.
    pub fn enqueue_packet(&mut self, channel_id: u8, body: PacketBody) {
        let Some(ch) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if ch.packet_queue.is_empty() {
            self.send_queue.push_back(channel_id);
        }
        ch.packet_queue.push_back(body);
    }

    /// Drop everything queued on the channel and unlink it from the send
    /// queue.
    pub fn clear_packet_queue(&mut self, channel_id: u8) {
        let Some(ch) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if !ch.packet_queue.is_empty() {
            ch.packet_queue.clear();
            self.send_queue.retain(|&id| id != channel_id);
        }
    }

    /// Take the next packet off the head of the send queue if its encoding
    /// fits in `space` ring bytes. Channels with more packets pending move
    /// to the back of the queue. Returns `None` when the queue is empty or
    /// the front packet does not fit; flushing stops there and resumes once
    /// the Amiga frees ring space.
    pub fn pop_fitting(&mut self, space: usize) -> Option<Packet> {
        let channel_id = *self.send_queue.front()?;
        let ch = self.channels.get_mut(&channel_id)?;

        let need = PACKET_HEADER_LEN + ch.packet_queue.front()?.payload().len();
        if need > space {
            return None;
        }

        let body = ch.packet_queue.pop_front()?;
        self.send_queue.pop_front();
        if !ch.packet_queue.is_empty() {
            self.send_queue.push_back(channel_id);
        }
        Some(Packet::new(channel_id, body))
    }

    /// Remove the channel if it is no longer associated and has nothing to
    /// send. Returns whether it was removed.
    pub fn remove_if_idle(&mut self, channel_id: u8) -> bool {
        if let Some(ch) = self.channels.get(&channel_id) {
            if ch.association.is_none() && ch.packet_queue.is_empty() {
                self.channels.remove(&channel_id);
                return true;
            }
        }
        false
    }

    /// Tear out every channel and empty the send queue. Used when the
    /// Amiga republishes its base address (firmware restart).
    pub fn take_all(&mut self) -> Vec<LogicalChannel> {
        self.send_queue.clear();
        self.channels.drain().map(|(_, ch)| ch).collect()
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> Vec<u8> {
        self.send_queue.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariants(table: &ChannelTable) {
        // No duplicates in the send queue, and everything queued has
        // packets pending.
        let queued = table.queued();
        let mut seen = std::collections::HashSet::new();
        for id in &queued {
            assert!(seen.insert(*id), "channel {id} queued twice");
            assert!(table.get(*id).is_some_and(|ch| ch.has_queued_packets()));
        }
        // And the converse: packets pending implies queued.
        for (&id, ch) in &table.channels {
            assert_eq!(ch.has_queued_packets(), queued.contains(&id));
        }
    }

    #[test]
    fn enqueue_links_channel_once() {
        let mut table = ChannelTable::new();
        table.create(7);
        table.enqueue_packet(7, PacketBody::Eos);
        table.enqueue_packet(7, PacketBody::Reset);
        assert_eq!(table.queued(), vec![7]);
        assert_invariants(&table);
    }

    #[test]
    fn pop_rotates_channels_round_robin() {
        let mut table = ChannelTable::new();
        table.create(1);
        table.create(2);
        table.enqueue_packet(1, PacketBody::Data(vec![0; 4]));
        table.enqueue_packet(1, PacketBody::Eos);
        table.enqueue_packet(2, PacketBody::Data(vec![0; 4]));

        let order: Vec<u8> = std::iter::from_fn(|| table.pop_fitting(255))
            .map(|p| p.channel_id)
            .collect();
        assert_eq!(order, vec![1, 2, 1]);
        assert_invariants(&table);
    }

    #[test]
    fn pop_stops_at_first_packet_that_does_not_fit() {
        let mut table = ChannelTable::new();
        table.create(1);
        table.create(2);
        table.enqueue_packet(1, PacketBody::Data(vec![0; 100]));
        table.enqueue_packet(2, PacketBody::Data(vec![0; 2]));

        // 50 bytes of space: the 103-byte front packet blocks the queue
        // even though channel 2's packet would fit. Packets never reorder
        // past each other and never split.
        assert!(table.pop_fitting(50).is_none());
        assert_eq!(table.queued(), vec![1, 2]);

        let p = table.pop_fitting(255).unwrap();
        assert_eq!(p.channel_id, 1);
        assert_invariants(&table);
    }

    #[test]
    fn clear_packet_queue_unlinks() {
        let mut table = ChannelTable::new();
        table.create(5);
        table.enqueue_packet(5, PacketBody::Eos);
        table.clear_packet_queue(5);
        assert!(table.queued().is_empty());
        assert!(!table.get(5).unwrap().has_queued_packets());
        assert_invariants(&table);
    }

    #[test]
    fn remove_if_idle_respects_association_and_queue() {
        let mut table = ChannelTable::new();
        table.create(3).association = Some(ClientId::test(1));
        assert!(!table.remove_if_idle(3));

        table.get_mut(3).unwrap().association = None;
        table.enqueue_packet(3, PacketBody::Reset);
        assert!(!table.remove_if_idle(3));

        assert!(table.pop_fitting(255).is_some());
        assert!(table.remove_if_idle(3));
        assert!(!table.contains(3));
    }

    #[test]
    fn take_all_empties_everything() {
        let mut table = ChannelTable::new();
        table.create(1);
        table.create(2);
        table.enqueue_packet(1, PacketBody::Eos);
        let taken = table.take_all();
        assert_eq!(taken.len(), 2);
        assert!(table.is_empty());
        assert!(table.queued().is_empty());
    }
}
