//! In-memory bus double used across the test modules.

use std::collections::VecDeque;
use std::io;

use a314_wire::layout::{self, cmem};

use crate::bus::{BusTransport, MAX_TRANSFER, READ_SRAM_HDR_LEN, WRITE_SRAM_HDR_LEN};

/// SRAM and CMEM images plus a scripted event register, playing the role
/// of board, firmware, and Amiga at once.
pub struct FakeBus {
    pub sram: Vec<u8>,
    pub cmem: [u8; 16],
    /// Values returned by successive reads of the event register.
    pub pending_events: VecDeque<u8>,
    /// Every value written to the A_EVENTS register, in order.
    pub posted_events: Vec<u8>,
}

impl FakeBus {
    pub fn new() -> Self {
        FakeBus {
            sram: vec![0; 1 << 20],
            cmem: [0; 16],
            pending_events: VecDeque::new(),
            posted_events: Vec::new(),
        }
    }

    /// Publish `base` in CMEM the way the firmware does: five nibbles,
    /// low nibble first, valid bit set.
    pub fn publish_base(&mut self, base: u32) {
        let value = base | 1;
        for i in 0..cmem::BASE_ADDRESS_NIBBLES as usize {
            self.cmem[i] = ((value >> (i * 4)) & 0xF) as u8;
        }
    }

    /// Queue an event register value for the next IRQ acknowledgement.
    pub fn push_event(&mut self, events: u8) {
        self.pending_events.push_back(events);
    }

    pub fn status(&self, base: u32) -> [u8; 4] {
        let b = base as usize;
        [
            self.sram[b],
            self.sram[b + 1],
            self.sram[b + 2],
            self.sram[b + 3],
        ]
    }

    pub fn set_status(&mut self, base: u32, status: [u8; 4]) {
        self.sram[base as usize..base as usize + 4].copy_from_slice(&status);
    }

    /// Append bytes to the A2R ring at the current tail, wrapping like the
    /// firmware would, and advance the tail pointer.
    pub fn load_a2r(&mut self, base: u32, bytes: &[u8]) {
        let ring = (base + layout::A2R_RING_OFFSET) as usize;
        let mut tail = self.sram[base as usize + layout::A2R_TAIL];
        for &b in bytes {
            self.sram[ring + tail as usize] = b;
            tail = tail.wrapping_add(1);
        }
        self.sram[base as usize + layout::A2R_TAIL] = tail;
    }

    /// The R2A ring contents from the Amiga's head up to the daemon's
    /// tail, unwrapped, and the head advanced past them.
    pub fn consume_r2a(&mut self, base: u32) -> Vec<u8> {
        let ring = (base + layout::R2A_RING_OFFSET) as usize;
        let mut head = self.sram[base as usize + layout::R2A_HEAD];
        let tail = self.sram[base as usize + layout::R2A_TAIL];
        let mut out = Vec::new();
        while head != tail {
            out.push(self.sram[ring + head as usize]);
            head = head.wrapping_add(1);
        }
        self.sram[base as usize + layout::R2A_HEAD] = head;
        out
    }
}

impl BusTransport for FakeBus {
    fn read_sram(&mut self, address: u32, length: usize) -> io::Result<Vec<u8>> {
        assert!(length + READ_SRAM_HDR_LEN <= MAX_TRANSFER);
        let start = address as usize;
        Ok(self.sram[start..start + length].to_vec())
    }

    fn write_sram(&mut self, address: u32, data: &[u8]) -> io::Result<()> {
        assert!(data.len() + WRITE_SRAM_HDR_LEN <= MAX_TRANSFER);
        let start = address as usize;
        self.sram[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_cmem(&mut self, address: u8) -> io::Result<u8> {
        if address == cmem::R_EVENTS {
            return Ok(self.pending_events.pop_front().unwrap_or(0));
        }
        Ok(self.cmem[address as usize] & 0xF)
    }

    fn write_cmem(&mut self, address: u8, value: u8) -> io::Result<()> {
        self.cmem[address as usize] = value & 0xF;
        if address == cmem::A_EVENTS {
            self.posted_events.push(value & 0xF);
        }
        Ok(())
    }
}
