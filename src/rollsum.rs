//! Rolling (weak) checksums in the rsync family.
//!
//! The checksum keeps two accumulators over the current window:
//!
//! a = s[i] + ... + s[i+w-1]
//! b = w*s[i] + (w-1)*s[i+1] + ... + 1*s[i+w-1]
//!
//! sum = (a & 0xFFFF) | ((b & 0xFFFF) << 16), little-endian
//!
//! Advancing the window by one byte is O(1). `Rollsum32` (32-bit internal
//! accumulators) is the variant the index format is built with; `Rollsum16`
//! reproduces the older 16-bit internal layout and is kept for reading
//! material produced by legacy tools. The two produce different sums and are
//! not interchangeable.

/// Number of bytes in the serialized weak sum.
pub const WEAK_SIZE: usize = 4;

/// Serialized weak checksum.
pub type WeakSum = [u8; WEAK_SIZE];

const LOW_16: u32 = (1 << 16) - 1;

/// Rolling checksum with 32-bit internal accumulators. This is the
/// authoritative variant used by the checksum generator and the scanner.
#[derive(Debug, Default, Clone)]
pub struct Rollsum32 {
    a: u32,
    b: u32,
}

impl Rollsum32 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single byte to the end of the window.
    #[inline]
    pub fn add_byte(&mut self, byte: u8) {
        self.a = self.a.wrapping_add(u32::from(byte));
        self.b = self.b.wrapping_add(self.a);
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.add_byte(byte);
        }
    }

    /// Remove a byte from the front of the window. `length` is the window
    /// length before the removal; `b` carries length-weighted terms, so the
    /// order of interleaved add/remove calls matters.
    #[inline]
    pub fn remove_byte(&mut self, byte: u8, length: usize) {
        self.a = self.a.wrapping_sub(u32::from(byte));
        self.b = self
            .b
            .wrapping_sub((length as u32).wrapping_mul(u32::from(byte)));
    }

    pub fn remove_bytes(&mut self, bytes: &[u8], mut length: usize) {
        for &byte in bytes {
            self.remove_byte(byte, length);
            length -= 1;
        }
    }

    /// Slide the window: append `add`, evicting `remove` from the front.
    /// `length` is the window length before the write. `add` must be at
    /// least as long as `remove`; the surplus grows the window.
    pub fn add_and_remove_bytes(&mut self, add: &[u8], remove: &[u8], length: usize) {
        let start_evicted = add.len() - remove.len();
        self.add_bytes(&add[..start_evicted]);
        let length = length + start_evicted;

        for i in start_evicted..add.len() {
            self.remove_byte(remove[i - start_evicted], length);
            self.add_byte(add[i]);
        }
    }

    /// Reset and absorb a whole block.
    pub fn set_block(&mut self, block: &[u8]) {
        self.reset();
        self.add_bytes(block);
    }

    pub fn reset(&mut self) {
        self.a = 0;
        self.b = 0;
    }

    /// The 4-byte sum for the current window.
    pub fn sum(&self) -> WeakSum {
        let value = (self.a & LOW_16) | ((self.b & LOW_16) << 16);
        value.to_le_bytes()
    }
}

/// Legacy rolling checksum with 16-bit internal accumulators.
///
/// Removal weights every evicted byte by the configured block size, so this
/// variant is only correct while the window is exactly one block long.
#[derive(Debug, Clone)]
pub struct Rollsum16 {
    block_size: usize,
    a: u16,
    b: u16,
}

impl Rollsum16 {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            a: 0,
            b: 0,
        }
    }

    #[inline]
    pub fn add_byte(&mut self, byte: u8) {
        self.a = self.a.wrapping_add(u16::from(byte));
        self.b = self.b.wrapping_add(self.a);
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.add_byte(byte);
        }
    }

    #[inline]
    pub fn remove_byte(&mut self, byte: u8) {
        self.a = self.a.wrapping_sub(u16::from(byte));
        self.b = self
            .b
            .wrapping_sub((self.block_size as u16).wrapping_mul(u16::from(byte)));
    }

    pub fn remove_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.remove_byte(byte);
        }
    }

    pub fn set_block(&mut self, block: &[u8]) {
        self.reset();
        self.add_bytes(block);
    }

    pub fn reset(&mut self) {
        self.a = 0;
        self.b = 0;
    }

    pub fn sum(&self) -> WeakSum {
        let value = u32::from(self.a) | (u32::from(self.b) << 16);
        value.to_le_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn known_accumulator_values() {
        let mut rs = Rollsum32::new();
        rs.set_block(b"abcd");

        // a = 97+98+99+100, b = 4*97 + 3*98 + 2*99 + 1*100
        assert_eq!(rs.a, 394);
        assert_eq!(rs.b, 980);
    }

    #[test]
    fn roll_equals_fresh_sum() {
        let data = b"abcdefgh";

        let mut rolled = Rollsum32::new();
        rolled.set_block(&data[0..4]);
        rolled.add_and_remove_bytes(&data[4..5], &data[0..1], 4);

        let mut fresh = Rollsum32::new();
        fresh.set_block(&data[1..5]);

        assert_eq!(rolled.sum(), fresh.sum());
    }

    #[test]
    fn set_block_equals_byte_at_a_time() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(17);

        for len in [1usize, 2, 7, 64, 255] {
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();

            let mut whole = Rollsum32::new();
            whole.set_block(&data);

            let mut stepped = Rollsum32::new();
            for &byte in &data {
                stepped.add_byte(byte);
            }

            assert_eq!(whole.sum(), stepped.sum(), "length {}", len);
        }
    }

    #[test]
    fn sliding_equals_last_window() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(99);
        const BLOCK: usize = 16;

        let data: Vec<u8> = (0..200).map(|_| rng.gen()).collect();

        let mut slid = Rollsum32::new();
        slid.set_block(&data[..BLOCK]);
        for i in BLOCK..data.len() {
            slid.add_and_remove_bytes(&data[i..i + 1], &data[i - BLOCK..i - BLOCK + 1], BLOCK);
        }

        let mut fresh = Rollsum32::new();
        fresh.set_block(&data[data.len() - BLOCK..]);

        assert_eq!(slid.sum(), fresh.sum());
    }

    #[test]
    fn remove_bytes_matches_single_removals() {
        let data = b"0123456789";

        let mut bulk = Rollsum32::new();
        bulk.set_block(data);
        bulk.remove_bytes(&data[..3], data.len());

        let mut single = Rollsum32::new();
        single.set_block(data);
        single.remove_byte(data[0], 10);
        single.remove_byte(data[1], 9);
        single.remove_byte(data[2], 8);

        assert_eq!(bulk.sum(), single.sum());
    }

    #[test]
    fn legacy_16_bit_rolls() {
        let data = b"abcdefgh";

        let mut rolled = Rollsum16::new(4);
        rolled.set_block(&data[0..4]);
        rolled.remove_byte(data[0]);
        rolled.add_byte(data[4]);

        let mut fresh = Rollsum16::new(4);
        fresh.set_block(&data[1..5]);

        assert_eq!(rolled.sum(), fresh.sum());
    }

    #[test]
    fn legacy_removal_weights_by_block_size() {
        // the legacy variant weights every removal by the configured block
        // size, so the variants agree only while the window is exactly one
        // block long
        let mut wide = Rollsum32::new();
        wide.set_block(b"abcdef");
        let mut narrow = Rollsum16::new(4);
        narrow.set_block(b"abcdef");
        assert_eq!(wide.sum(), narrow.sum());

        wide.remove_byte(b'a', 6);
        narrow.remove_byte(b'a');
        assert_ne!(wide.sum(), narrow.sum());
    }
}
