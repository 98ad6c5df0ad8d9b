//! The communication area in the board's SRAM.
//!
//! Tracks the discovered base address, the four queue pointers, and the
//! event bits that still have to be posted back to the Amiga. The in-memory
//! status quad always equals the last value read from SRAM plus any head or
//! tail advances applied locally since.

use std::io;

use a314_wire::layout::{self, a_event, cmem};

use crate::bus::BusTransport;

/// Base address discovery plus the ring windows that live behind it.
pub struct CommArea {
    base_address: Option<u32>,
    status: [u8; 4],
    updated: u8,
}

impl Default for CommArea {
    fn default() -> Self {
        Self::new()
    }
}

impl CommArea {
    pub fn new() -> Self {
        CommArea {
            base_address: None,
            status: [0; 4],
            updated: 0,
        }
    }

    pub fn has_base_address(&self) -> bool {
        self.base_address.is_some()
    }

    pub fn base_address(&self) -> Option<u32> {
        self.base_address
    }

    fn base(&self) -> io::Result<u32> {
        self.base_address.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "base address not discovered")
        })
    }

    /// Read the event register, which acknowledges the interrupt.
    pub fn ack_events<B: BusTransport>(&self, bus: &mut B) -> io::Result<u8> {
        bus.read_cmem(cmem::R_EVENTS)
    }

    /// Re-read the base address the firmware published in CMEM. The value
    /// is read twice and accepted only if both reads agree and the valid
    /// bit is set; otherwise the address stays unknown until the next IRQ.
    pub fn rediscover<B: BusTransport>(&mut self, bus: &mut B) -> io::Result<()> {
        self.base_address = None;

        let first = read_base_nibbles(bus)?;
        if first & 1 == 1 {
            let second = read_base_nibbles(bus)?;
            if first == second {
                self.base_address = Some(first & !1);
            }
        }
        Ok(())
    }

    /// Refresh the status quad from SRAM. Pending event bits are cleared:
    /// everything posted so far has been observed by the firmware or is
    /// superseded by this snapshot.
    pub fn read_status<B: BusTransport>(&mut self, bus: &mut B) -> io::Result<()> {
        let base = self.base()?;
        let bytes = bus.read_sram(base, 4)?;
        self.status.copy_from_slice(&bytes);
        self.updated = 0;
        Ok(())
    }

    /// Publish the daemon-owned pointers and post the accumulated event
    /// bits. No-op when nothing changed since the last read.
    pub fn write_status<B: BusTransport>(&mut self, bus: &mut B) -> io::Result<()> {
        if self.updated == 0 {
            return Ok(());
        }
        let base = self.base()?;
        bus.write_sram(
            base + layout::R2A_TAIL as u32,
            &self.status[layout::R2A_TAIL..=layout::A2R_HEAD],
        )?;
        bus.write_cmem(cmem::A_EVENTS, self.updated)?;
        self.updated = 0;
        Ok(())
    }

    /// Pull everything the Amiga queued in the A2R ring, honoring the wrap
    /// at the ring boundary. Returns `None` when the ring is empty.
    /// Advances the head over the drained bytes.
    pub fn drain_a2r<B: BusTransport>(&mut self, bus: &mut B) -> io::Result<Option<Vec<u8>>> {
        let base = self.base()?;
        let head = self.status[layout::A2R_HEAD] as usize;
        let tail = self.status[layout::A2R_TAIL] as usize;
        let len = tail.wrapping_sub(head) & 0xFF;
        if len == 0 {
            return Ok(None);
        }

        let ring = base + layout::A2R_RING_OFFSET;
        let data = if head < tail {
            bus.read_sram(ring + head as u32, len)?
        } else {
            let mut data = bus.read_sram(ring + head as u32, layout::RING_SIZE - head)?;
            if tail != 0 {
                data.extend(bus.read_sram(ring, tail)?);
            }
            data
        };

        self.status[layout::A2R_HEAD] = self.status[layout::A2R_TAIL];
        self.updated |= a_event::A2R_HEAD;
        Ok(Some(data))
    }

    /// Free bytes in the R2A ring under the current pointers.
    pub fn r2a_space(&self) -> usize {
        let head = self.status[layout::R2A_HEAD] as usize;
        let tail = self.status[layout::R2A_TAIL] as usize;
        layout::RING_CAPACITY - (tail.wrapping_sub(head) & 0xFF)
    }

    /// Append `chunk` to the R2A ring, splitting at the wrap if needed,
    /// and advance the tail. The caller must have checked [`r2a_space`].
    ///
    /// [`r2a_space`]: CommArea::r2a_space
    pub fn write_r2a<B: BusTransport>(&mut self, bus: &mut B, chunk: &[u8]) -> io::Result<()> {
        debug_assert!(chunk.len() <= self.r2a_space());
        if chunk.is_empty() {
            return Ok(());
        }

        let base = self.base()?;
        let ring = base + layout::R2A_RING_OFFSET;
        let mut tail = self.status[layout::R2A_TAIL] as usize;
        let mut rest = chunk;

        let until_wrap = layout::RING_SIZE - tail;
        if until_wrap < rest.len() {
            bus.write_sram(ring + tail as u32, &rest[..until_wrap])?;
            rest = &rest[until_wrap..];
            tail = 0;
        }

        bus.write_sram(ring + tail as u32, rest)?;
        tail = (tail + rest.len()) & 0xFF;

        self.status[layout::R2A_TAIL] = tail as u8;
        self.updated |= a_event::R2A_TAIL;
        Ok(())
    }
}

fn read_base_nibbles<B: BusTransport>(bus: &mut B) -> io::Result<u32> {
    let mut value = 0u32;
    for i in 0..cmem::BASE_ADDRESS_NIBBLES {
        value |= (bus.read_cmem(i)? as u32) << (i * 4);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeBus;
    use a314_wire::packet::{decode_all, Packet, PacketBody};

    const BASE: u32 = 0x1_0000;

    fn discovered(bus: &mut FakeBus) -> CommArea {
        bus.publish_base(BASE);
        let mut comm = CommArea::new();
        comm.rediscover(bus).unwrap();
        assert_eq!(comm.base_address(), Some(BASE));
        comm
    }

    #[test]
    fn rediscover_rejects_clear_valid_bit() {
        let mut bus = FakeBus::new();
        // Valid bit clear: the firmware has not published yet.
        let mut comm = CommArea::new();
        comm.rediscover(&mut bus).unwrap();
        assert!(!comm.has_base_address());
    }

    #[test]
    fn rediscover_accepts_stable_value() {
        let mut bus = FakeBus::new();
        let comm = discovered(&mut bus);
        assert_eq!(comm.base_address(), Some(BASE));
    }

    #[test]
    fn status_roundtrip_and_event_posting() {
        let mut bus = FakeBus::new();
        let mut comm = discovered(&mut bus);

        bus.set_status(BASE, [10, 20, 30, 40]);
        comm.read_status(&mut bus).unwrap();

        // Nothing pending yet, so writing is a no-op.
        comm.write_status(&mut bus).unwrap();
        assert!(bus.posted_events.is_empty());

        comm.write_r2a(&mut bus, &[1, 2, 3]).unwrap();
        comm.write_status(&mut bus).unwrap();
        assert_eq!(bus.posted_events, vec![a_event::R2A_TAIL]);
        // R2A_TAIL advanced from 30 by three bytes.
        assert_eq!(bus.status(BASE)[layout::R2A_TAIL], 33);
    }

    #[test]
    fn drain_empty_ring_is_none() {
        let mut bus = FakeBus::new();
        let mut comm = discovered(&mut bus);
        comm.read_status(&mut bus).unwrap();
        assert!(comm.drain_a2r(&mut bus).unwrap().is_none());
    }

    #[test]
    fn drain_contiguous_window() {
        let mut bus = FakeBus::new();
        let mut comm = discovered(&mut bus);

        bus.load_a2r(BASE, &[5, 6, 7, 8]);
        comm.read_status(&mut bus).unwrap();

        let data = comm.drain_a2r(&mut bus).unwrap().unwrap();
        assert_eq!(data, vec![5, 6, 7, 8]);
        // Head caught up with tail; ring reads empty now.
        assert!(comm.drain_a2r(&mut bus).unwrap().is_none());
    }

    #[test]
    fn drain_wrapped_window() {
        let mut bus = FakeBus::new();
        let mut comm = discovered(&mut bus);

        // Start both pointers near the end so the payload wraps.
        bus.set_status(BASE, [250, 0, 0, 250]);
        let payload: Vec<u8> = (0..20).collect();
        bus.load_a2r(BASE, &payload);
        comm.read_status(&mut bus).unwrap();

        let data = comm.drain_a2r(&mut bus).unwrap().unwrap();
        assert_eq!(data, payload);
    }

    #[test]
    fn wrap_decode_reconstructs_packets_for_any_head() {
        // Encoded packets pushed through the ring at every offset decode
        // back to the same sequence.
        let packets = vec![
            Packet::new(1, PacketBody::Data((0..100).collect())),
            Packet::new(2, PacketBody::Eos),
            Packet::new(3, PacketBody::Data((100..220).map(|b| b as u8).collect())),
        ];
        let mut encoded = Vec::new();
        for p in &packets {
            p.encode_into(&mut encoded);
        }

        for head in (0..=255u8).step_by(13) {
            let mut bus = FakeBus::new();
            let mut comm = discovered(&mut bus);
            bus.set_status(BASE, [head, 0, 0, head]);
            bus.load_a2r(BASE, &encoded);
            comm.read_status(&mut bus).unwrap();

            let data = comm.drain_a2r(&mut bus).unwrap().unwrap();
            assert_eq!(decode_all(&data).unwrap(), packets, "head={head}");
        }
    }

    #[test]
    fn r2a_space_accounts_for_reserved_byte() {
        let mut bus = FakeBus::new();
        let mut comm = discovered(&mut bus);
        comm.read_status(&mut bus).unwrap();
        assert_eq!(comm.r2a_space(), layout::RING_CAPACITY);

        comm.write_r2a(&mut bus, &[0; 100]).unwrap();
        assert_eq!(comm.r2a_space(), layout::RING_CAPACITY - 100);
    }

    #[test]
    fn write_splits_across_the_wrap() {
        // Pointers parked at 200, 150 bytes to write: 56 land at the end
        // of the ring, 94 wrap to the start, and the tail ends up at 94.
        let mut bus = FakeBus::new();
        let mut comm = discovered(&mut bus);
        bus.set_status(BASE, [0, 200, 200, 0]);
        comm.read_status(&mut bus).unwrap();

        let chunk: Vec<u8> = (0..150u8).collect();
        comm.write_r2a(&mut bus, &chunk).unwrap();
        comm.write_status(&mut bus).unwrap();

        let ring = (BASE + layout::R2A_RING_OFFSET) as usize;
        assert_eq!(&bus.sram[ring + 200..ring + 256], &chunk[..56]);
        assert_eq!(&bus.sram[ring..ring + 94], &chunk[56..]);
        assert_eq!(bus.status(BASE)[layout::R2A_TAIL], 94);
        assert_eq!(bus.posted_events, vec![a_event::R2A_TAIL]);
    }

    #[test]
    fn ring_length_never_exceeds_capacity() {
        let mut bus = FakeBus::new();
        let mut comm = discovered(&mut bus);

        for (head, tail) in [(0u8, 0u8), (10, 9), (200, 199), (0, 255), (255, 254)] {
            bus.set_status(BASE, [0, head, tail, 0]);
            comm.read_status(&mut bus).unwrap();
            let used = (tail.wrapping_sub(head)) as usize & 0xFF;
            assert!(used <= layout::RING_CAPACITY);
            assert_eq!(comm.r2a_space(), layout::RING_CAPACITY - used);
        }
    }
}
