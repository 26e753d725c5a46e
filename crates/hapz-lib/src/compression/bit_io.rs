//! MSB-first bit packing over byte buffers.
//!
//! `BitWriter` appends into a growable buffer; `BitReader` reads from an
//! existing slice with a settable bit position. Reads past the end return
//! `None` instead of panicking. Field widths are validated by callers.

/// Minimum number of bytes added when the write buffer runs out of room.
const MIN_GROWTH: usize = 256;

/// Number of bits needed to represent `x` (0 for 0).
#[inline]
pub fn bits_used(x: u64) -> u32 {
    64 - x.leading_zeros()
}

/// `floor(log2(x)) + 1`, i.e. the width needed to hold any value in `0..=x`.
#[inline]
pub fn width_for(x: u64) -> u32 {
    bits_used(x).max(1)
}

#[inline]
fn low_mask(n: u32) -> u64 {
    if n >= 64 {
        u64::MAX
    } else {
        (1u64 << n) - 1
    }
}

/// Append-only bit writer.
#[derive(Debug, Default)]
pub struct BitWriter {
    buf: Vec<u8>,
    /// Pending bits not yet spilled into `buf`, right-aligned.
    acc: u64,
    acc_bits: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(bytes),
            acc: 0,
            acc_bits: 0,
        }
    }

    /// Total number of bits written so far.
    #[inline]
    pub fn bit_len(&self) -> usize {
        self.buf.len() * 8 + self.acc_bits as usize
    }

    /// Current position in whole bytes. Only meaningful after `flush_to_byte`.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.buf.len() + (self.acc_bits as usize).div_ceil(8)
    }

    #[inline]
    fn push_byte(&mut self, b: u8) {
        if self.buf.len() == self.buf.capacity() {
            // grow by at least half of the current size
            let extra = (self.buf.capacity() / 2).max(MIN_GROWTH);
            self.buf.reserve(extra);
        }
        self.buf.push(b);
    }

    /// Write the low `n` bits of `value`, most significant first. `n <= 32`.
    #[inline]
    pub fn put_bits(&mut self, value: u32, n: u32) {
        debug_assert!(n <= 32);
        if n == 0 {
            return;
        }
        self.acc = (self.acc << n) | (u64::from(value) & low_mask(n));
        self.acc_bits += n;
        while self.acc_bits >= 8 {
            self.acc_bits -= 8;
            self.push_byte((self.acc >> self.acc_bits) as u8);
        }
        self.acc &= low_mask(self.acc_bits);
    }

    #[inline]
    pub fn put_bit(&mut self, bit: bool) {
        self.put_bits(u32::from(bit), 1);
    }

    #[inline]
    pub fn put_2bits(&mut self, value: u32) {
        self.put_bits(value, 2);
    }

    #[inline]
    pub fn put_byte(&mut self, value: u8) {
        self.put_bits(u32::from(value), 8);
    }

    #[inline]
    pub fn put_u32(&mut self, value: u32) {
        self.put_bits(value, 32);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.put_bits((value >> 32) as u32, 32);
        self.put_bits(value as u32, 32);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        if self.acc_bits == 0 {
            self.buf.extend_from_slice(bytes);
        } else {
            for &b in bytes {
                self.put_byte(b);
            }
        }
    }

    /// Pad with zero bits up to the next byte boundary.
    pub fn flush_to_byte(&mut self) {
        if self.acc_bits > 0 {
            let pad = 8 - self.acc_bits;
            self.put_bits(0, pad);
        }
    }

    /// Retract the last `n` written bits. `n` must not exceed `bit_len()`.
    pub fn discard_bits(&mut self, n: usize) {
        debug_assert!(n <= self.bit_len());
        let target = self.bit_len() - n;

        // Spill the pending bits so the whole stream is byte-addressable,
        // then reload the partial byte that straddles the new end.
        if self.acc_bits > 0 {
            let pad = 8 - self.acc_bits;
            let byte = (self.acc << pad) as u8;
            self.buf.push(byte);
            self.acc = 0;
            self.acc_bits = 0;
        }

        let full = target / 8;
        let rem = (target % 8) as u32;
        let partial = if rem > 0 { self.buf[full] >> (8 - rem) } else { 0 };
        self.buf.truncate(full);
        self.acc = u64::from(partial);
        self.acc_bits = rem;
    }

    /// Finish the stream, zero-padding the last partial byte.
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.flush_to_byte();
        self.buf
    }
}

/// Random-access bit reader over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[inline]
    pub fn bit_pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn set_bit_pos(&mut self, pos: usize) {
        self.pos = pos;
    }

    #[inline]
    pub fn set_byte_pos(&mut self, pos: usize) {
        self.pos = pos * 8;
    }

    #[inline]
    pub fn bit_len(&self) -> usize {
        self.data.len() * 8
    }

    #[inline]
    pub fn remaining_bits(&self) -> usize {
        self.bit_len().saturating_sub(self.pos)
    }

    /// True once a `peek_bits`/`consume` sequence ran past the end of data.
    #[inline]
    pub fn is_overrun(&self) -> bool {
        self.pos > self.bit_len()
    }

    /// Eight bytes starting at the byte containing `pos`, big-endian,
    /// zero-padded past the end of data.
    #[inline]
    fn window(&self, pos: usize) -> u64 {
        let start = pos / 8;
        let mut word = [0u8; 8];
        if start < self.data.len() {
            let end = (start + 8).min(self.data.len());
            word[..end - start].copy_from_slice(&self.data[start..end]);
        }
        u64::from_be_bytes(word)
    }

    /// Next `n` bits (`n <= 32`) without advancing; zero bits past the end.
    #[inline]
    pub fn peek_bits(&self, n: u32) -> u32 {
        debug_assert!(n <= 32);
        if n == 0 {
            return 0;
        }
        let w = self.window(self.pos) << (self.pos % 8);
        (w >> (64 - n)) as u32
    }

    /// Advance without bounds checking; pair with `is_overrun`.
    #[inline]
    pub fn consume(&mut self, n: u32) {
        self.pos += n as usize;
    }

    #[inline]
    pub fn get_bits(&mut self, n: u32) -> Option<u32> {
        if self.pos + n as usize > self.bit_len() {
            return None;
        }
        let v = self.peek_bits(n);
        self.pos += n as usize;
        Some(v)
    }

    #[inline]
    pub fn get_bit(&mut self) -> Option<bool> {
        self.get_bits(1).map(|b| b != 0)
    }

    #[inline]
    pub fn get_2bits(&mut self) -> Option<u32> {
        self.get_bits(2)
    }

    #[inline]
    pub fn get_byte(&mut self) -> Option<u8> {
        self.get_bits(8).map(|b| b as u8)
    }

    #[inline]
    pub fn get_u32(&mut self) -> Option<u32> {
        self.get_bits(32)
    }

    pub fn get_u64(&mut self) -> Option<u64> {
        let hi = self.get_bits(32)?;
        let lo = self.get_bits(32)?;
        Some((u64::from(hi) << 32) | u64::from(lo))
    }

    /// Skip `n` bits, failing if that would pass the end of data.
    #[inline]
    pub fn skip_bits(&mut self, n: usize) -> Option<()> {
        if self.pos + n > self.bit_len() {
            return None;
        }
        self.pos += n;
        Some(())
    }

    #[inline]
    pub fn align_to_byte(&mut self) {
        self.pos = self.pos.div_ceil(8) * 8;
    }
}
