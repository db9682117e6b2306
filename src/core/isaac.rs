//! ISAAC Stream Cipher
//!
//! The session cipher used to obfuscate frame opcodes. Each side keeps one
//! instance per direction, seeded from the session keys exchanged at login.
//! Given the same seed, both ends produce the identical sequence.

use std::fmt;

const SIZE: usize = 256;
const GOLDEN_RATIO: u32 = 0x9e37_79b9;

/// ISAAC pseudo-random generator, as used by the legacy client.
///
/// Values are handed out from the end of each 256-word result block.
#[derive(Clone)]
pub struct IsaacCipher {
    results: [u32; SIZE],
    memory: [u32; SIZE],
    accumulator: u32,
    last_result: u32,
    counter: u32,
    count: usize,
}

impl IsaacCipher {
    /// Seed a cipher. Words past the first 256 are ignored.
    pub fn new(seed: &[u32]) -> Self {
        let mut cipher = Self {
            results: [0; SIZE],
            memory: [0; SIZE],
            accumulator: 0,
            last_result: 0,
            counter: 0,
            count: 0,
        };
        for (slot, &word) in cipher.results.iter_mut().zip(seed) {
            *slot = word;
        }
        cipher.init();
        cipher
    }

    /// Next keystream word.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        if self.count == 0 {
            self.isaac();
            self.count = SIZE;
        }
        self.count -= 1;
        self.results[self.count]
    }

    fn init(&mut self) {
        let mut s = [GOLDEN_RATIO; 8];
        for _ in 0..4 {
            mix(&mut s);
        }

        for i in (0..SIZE).step_by(8) {
            for (j, word) in s.iter_mut().enumerate() {
                *word = word.wrapping_add(self.results[i + j]);
            }
            mix(&mut s);
            self.memory[i..i + 8].copy_from_slice(&s);
        }

        // Second pass so every seed word affects every memory word.
        for i in (0..SIZE).step_by(8) {
            for (j, word) in s.iter_mut().enumerate() {
                *word = word.wrapping_add(self.memory[i + j]);
            }
            mix(&mut s);
            self.memory[i..i + 8].copy_from_slice(&s);
        }

        self.isaac();
        self.count = SIZE;
    }

    fn isaac(&mut self) {
        self.counter = self.counter.wrapping_add(1);
        self.last_result = self.last_result.wrapping_add(self.counter);

        for i in 0..SIZE {
            let x = self.memory[i];
            self.accumulator ^= match i & 3 {
                0 => self.accumulator << 13,
                1 => self.accumulator >> 6,
                2 => self.accumulator << 2,
                _ => self.accumulator >> 16,
            };
            self.accumulator = self.accumulator.wrapping_add(self.memory[(i + 128) & 0xff]);

            let y = self.memory[((x >> 2) & 0xff) as usize]
                .wrapping_add(self.accumulator)
                .wrapping_add(self.last_result);
            self.memory[i] = y;

            self.last_result = self.memory[((y >> 10) & 0xff) as usize].wrapping_add(x);
            self.results[i] = self.last_result;
        }
    }
}

impl fmt::Debug for IsaacCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsaacCipher").finish_non_exhaustive()
    }
}

#[inline]
fn mix(s: &mut [u32; 8]) {
    s[0] ^= s[1] << 11;
    s[3] = s[3].wrapping_add(s[0]);
    s[1] = s[1].wrapping_add(s[2]);
    s[1] ^= s[2] >> 2;
    s[4] = s[4].wrapping_add(s[1]);
    s[2] = s[2].wrapping_add(s[3]);
    s[2] ^= s[3] << 8;
    s[5] = s[5].wrapping_add(s[2]);
    s[3] = s[3].wrapping_add(s[4]);
    s[3] ^= s[4] >> 16;
    s[6] = s[6].wrapping_add(s[3]);
    s[4] = s[4].wrapping_add(s[5]);
    s[4] ^= s[5] << 10;
    s[7] = s[7].wrapping_add(s[4]);
    s[5] = s[5].wrapping_add(s[6]);
    s[5] ^= s[6] >> 4;
    s[0] = s[0].wrapping_add(s[5]);
    s[6] = s[6].wrapping_add(s[7]);
    s[6] ^= s[7] << 8;
    s[1] = s[1].wrapping_add(s[6]);
    s[7] = s[7].wrapping_add(s[0]);
    s[7] ^= s[0] >> 9;
    s[2] = s[2].wrapping_add(s[7]);
    s[0] = s[0].wrapping_add(s[1]);
}
