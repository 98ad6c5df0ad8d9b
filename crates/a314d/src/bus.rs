//! The SPI bus to the A314 board.
//!
//! Four framed commands reach the board's shifter: SRAM reads and writes
//! carry a 20-bit address packed with the command into three header bytes;
//! CMEM reads and writes address one of sixteen four-bit registers with a
//! single command byte. Every command runs as one full-duplex transfer.

use std::io;

use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};

const READ_SRAM_CMD: u32 = 0;
const WRITE_SRAM_CMD: u32 = 1;
const READ_CMEM_CMD: u8 = 2;
const WRITE_CMEM_CMD: u8 = 3;

/// Bytes in front of SRAM read data: three command bytes plus one dummy
/// byte while the shifter turns the bus around.
pub const READ_SRAM_HDR_LEN: usize = 4;
/// Bytes in front of SRAM write data.
pub const WRITE_SRAM_HDR_LEN: usize = 3;

/// Largest single transfer, header included.
pub const MAX_TRANSFER: usize = 65536;

/// The four bus primitives. The daemon is written against this trait so
/// the whole protocol stack can run against an in-memory bus in tests.
///
/// A failure from any of these leaves the peer state unknowable, so
/// callers treat bus errors as fatal.
pub trait BusTransport {
    fn read_sram(&mut self, address: u32, length: usize) -> io::Result<Vec<u8>>;
    fn write_sram(&mut self, address: u32, data: &[u8]) -> io::Result<()>;
    fn read_cmem(&mut self, address: u8) -> io::Result<u8>;
    fn write_cmem(&mut self, address: u8, value: u8) -> io::Result<()>;
}

fn sram_header(command: u32, address: u32) -> [u8; WRITE_SRAM_HDR_LEN] {
    let header = (command << 20) | (address & 0xF_FFFF);
    [
        ((header >> 16) & 0xFF) as u8,
        ((header >> 8) & 0xFF) as u8,
        (header & 0xFF) as u8,
    ]
}

fn oversized(length: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("transfer of {length} bytes exceeds {MAX_TRANSFER}"),
    )
}

/// The real bus over `/dev/spidev0.0`.
pub struct SpiBus {
    spi: Spidev,
    tx: Vec<u8>,
    rx: Vec<u8>,
}

impl SpiBus {
    pub const DEVICE: &'static str = "/dev/spidev0.0";
    pub const SPEED_HZ: u32 = 67_000_000;

    pub fn open(path: &str) -> io::Result<Self> {
        let mut spi = Spidev::open(path)?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(Self::SPEED_HZ)
            .mode(SpiModeFlags::SPI_CS_HIGH)
            .build();
        spi.configure(&options)?;

        Ok(SpiBus {
            spi,
            tx: vec![0; MAX_TRANSFER],
            rx: vec![0; MAX_TRANSFER],
        })
    }

    fn transfer(&mut self, len: usize) -> io::Result<()> {
        let mut tr = SpidevTransfer::read_write(&self.tx[..len], &mut self.rx[..len]);
        self.spi.transfer(&mut tr)
    }
}

impl BusTransport for SpiBus {
    fn read_sram(&mut self, address: u32, length: usize) -> io::Result<Vec<u8>> {
        tracing::trace!(address, length, "sram read");
        let total = length + READ_SRAM_HDR_LEN;
        if total > MAX_TRANSFER {
            return Err(oversized(total));
        }

        self.tx[..WRITE_SRAM_HDR_LEN].copy_from_slice(&sram_header(READ_SRAM_CMD, address));
        self.tx[WRITE_SRAM_HDR_LEN] = 0;
        self.transfer(total)?;

        Ok(self.rx[READ_SRAM_HDR_LEN..total].to_vec())
    }

    fn write_sram(&mut self, address: u32, data: &[u8]) -> io::Result<()> {
        tracing::trace!(address, length = data.len(), "sram write");
        let total = data.len() + WRITE_SRAM_HDR_LEN;
        if total > MAX_TRANSFER {
            return Err(oversized(total));
        }

        self.tx[..WRITE_SRAM_HDR_LEN].copy_from_slice(&sram_header(WRITE_SRAM_CMD, address));
        self.tx[WRITE_SRAM_HDR_LEN..total].copy_from_slice(data);
        self.transfer(total)
    }

    fn read_cmem(&mut self, address: u8) -> io::Result<u8> {
        self.tx[0] = (READ_CMEM_CMD << 4) | (address & 0xF);
        self.tx[1] = 0;
        self.transfer(2)?;
        let value = self.rx[1] & 0xF;
        tracing::trace!(address, value, "cmem read");
        Ok(value)
    }

    fn write_cmem(&mut self, address: u8, value: u8) -> io::Result<()> {
        tracing::trace!(address, value, "cmem write");
        self.tx[0] = (WRITE_CMEM_CMD << 4) | (address & 0xF);
        self.tx[1] = value & 0xF;
        self.transfer(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sram_read_header_packs_command_and_address() {
        assert_eq!(sram_header(READ_SRAM_CMD, 0x0002_0404), [0x02, 0x04, 0x04]);
    }

    #[test]
    fn sram_write_header_sets_command_nibble() {
        assert_eq!(sram_header(WRITE_SRAM_CMD, 0), [0x10, 0x00, 0x00]);
    }

    #[test]
    fn address_is_masked_to_twenty_bits() {
        assert_eq!(
            sram_header(READ_SRAM_CMD, 0xFFF0_0001),
            sram_header(READ_SRAM_CMD, 0x0000_0001)
        );
    }
}
