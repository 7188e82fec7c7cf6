//! MS/TP frame check sequences (ASHRAE 135 Annex G)
//!
//! MS/TP protects the five header octets with an 8-bit CRC and the data
//! portion with a 16-bit CRC. Both are transmitted one's-complemented; the
//! receiver can either recompute and compare, or accumulate the check octets
//! as well and test for the fixed residue.
//!
//! The 16-bit data CRC is the reflected CCITT polynomial with 0xFFFF initial
//! value and complemented output, which the `crc` crate catalogs as
//! CRC-16/IBM-SDLC. The 8-bit header CRC (x⁸ + x⁷ + 1) has no catalog entry
//! and is computed here octet by octet.

use crc::{Crc, CRC_16_IBM_SDLC};

/// Residue left in the header CRC accumulator after processing the five
/// header octets followed by the transmitted (complemented) check octet.
pub const HEADER_CRC_RESIDUE: u8 = 0x55;

/// Initial value for the header CRC accumulator.
pub const HEADER_CRC_INITIAL: u8 = 0xFF;

/// Annex G.2 data CRC: poly 0x1021 reflected, init 0xFFFF, output
/// complemented. Transmitted low octet first.
pub const DATA_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// Accumulate one octet into the header CRC (Annex G.1).
///
/// The loop over the polynomial terms is unrolled into the shift-XOR ladder
/// used by the reference implementation; both forms divide by x⁸ + x⁷ + 1.
#[must_use]
pub fn header_crc_update(crc: u8, octet: u8) -> u8 {
    let mut acc = u16::from(crc ^ octet);
    acc = acc
        ^ (acc << 1)
        ^ (acc << 2)
        ^ (acc << 3)
        ^ (acc << 4)
        ^ (acc << 5)
        ^ (acc << 6)
        ^ (acc << 7);
    ((acc & 0x00FE) ^ ((acc >> 8) & 0x0001)) as u8
}

/// Compute the header check octet for the five octets following the preamble
/// (frame type, destination, source, length MSB, length LSB).
#[must_use]
pub fn header_crc(header: &[u8]) -> u8 {
    let crc = header
        .iter()
        .fold(HEADER_CRC_INITIAL, |crc, &octet| header_crc_update(crc, octet));
    !crc
}

/// Verify a header by accumulating the five header octets plus the received
/// check octet and testing for the Annex G residue.
#[must_use]
pub fn header_crc_valid(header_with_check: &[u8]) -> bool {
    let crc = header_with_check
        .iter()
        .fold(HEADER_CRC_INITIAL, |crc, &octet| header_crc_update(crc, octet));
    crc == HEADER_CRC_RESIDUE
}

/// Compute the data check sequence over a frame's data portion.
///
/// The returned value is already complemented; the encoder appends it low
/// octet first.
#[must_use]
pub fn data_crc(data: &[u8]) -> u16 {
    DATA_CRC.checksum(data)
}
