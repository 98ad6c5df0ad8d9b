//! Layout of the communication area shared with the Amiga-side firmware.
//!
//! The firmware publishes a 20-bit base address in CMEM. At that address in
//! SRAM live four queue pointers followed by the two rings:
//!
//! ```text
//! base+0    A2R_TAIL   written by the Amiga
//! base+1    R2A_HEAD   written by the Amiga
//! base+2    R2A_TAIL   written by the daemon
//! base+3    A2R_HEAD   written by the daemon
//! base+4    A2R ring, 256 bytes
//! base+260  R2A ring, 256 bytes
//! ```

/// CMEM register addresses. CMEM is 16 four-bit registers reachable with
/// their own bus commands, distinct from SRAM.
pub mod cmem {
    /// Registers 0..5 hold the base address as five nibbles, low nibble
    /// first. Bit 0 of the assembled value is the valid flag.
    pub const BASE_ADDRESS_NIBBLES: u8 = 5;
    /// Events signalled toward the daemon; reading acknowledges.
    pub const R_EVENTS: u8 = 12;
    /// Enable mask for events toward the daemon.
    pub const R_ENABLE: u8 = 13;
    /// Events posted by the daemon toward the Amiga.
    pub const A_EVENTS: u8 = 14;
    /// Enable mask for events toward the Amiga.
    pub const A_ENABLE: u8 = 15;
}

/// Event bits delivered with the IRQ, Amiga to daemon.
pub mod r_event {
    /// The Amiga appended bytes to the A2R ring.
    pub const A2R_TAIL: u8 = 1;
    /// The Amiga consumed bytes from the R2A ring.
    pub const R2A_HEAD: u8 = 2;
    /// The base address was republished; the firmware restarted.
    pub const BASE_ADDRESS: u8 = 4;
}

/// Event bits posted by the daemon, daemon to Amiga.
pub mod a_event {
    /// The daemon appended bytes to the R2A ring.
    pub const R2A_TAIL: u8 = 1;
    /// The daemon consumed bytes from the A2R ring.
    pub const A2R_HEAD: u8 = 2;
}

/// Indices of the queue pointers within the four-byte status quad.
pub const A2R_TAIL: usize = 0;
pub const R2A_HEAD: usize = 1;
pub const R2A_TAIL: usize = 2;
pub const A2R_HEAD: usize = 3;

/// Offset of the A2R ring relative to the base address.
pub const A2R_RING_OFFSET: u32 = 4;
/// Offset of the R2A ring relative to the base address.
pub const R2A_RING_OFFSET: u32 = 260;
/// Size of each ring.
pub const RING_SIZE: usize = 256;
/// Usable bytes per ring; one byte is reserved so that head == tail always
/// means empty, never full.
pub const RING_CAPACITY: usize = 255;
