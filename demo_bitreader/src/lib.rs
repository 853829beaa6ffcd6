use std::io::{Read, Seek, SeekFrom};

use lazy_static::lazy_static;
use parking_lot::Mutex;

const SMALL_BUFFER: usize = 512;
const LARGE_BUFFER: usize = 1024 * 128;

const SLED: usize = 8;
const SLED_MASK: usize = SLED - 1;
const SLED_BITS: usize = SLED << 3;

const MIN_STRING_BUFFER_LENGTH: usize = 256;
const VALVE_MAX_STRING_LENGTH: usize = 4096;

const MAX_VARINT32_BYTES: usize = 5;
const MAX_VARINT64_BYTES: usize = 10;

#[derive(thiserror::Error, Debug)]
pub enum BitError {
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("invalid encoding: {0}")]
    InvalidEncoding(&'static str),
    #[error("integer overflow: cannot read {0} bits into a single value")]
    IntegerOverflow(usize),
    #[error("chunk boundary mismatch: expected bit {expected_bit}, got {actual_bit}")]
    MalformedChunk {
        expected_bit: usize,
        actual_bit: usize,
    },
    #[error("buffer does not belong to the pool")]
    PoolRelease,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BitError>;

lazy_static! {
    // Process-wide backing-buffer pool, size-classed by reader variant.
    static ref BUFFER_POOL: Mutex<BufferPool> = Mutex::new(BufferPool::default());
}

#[derive(Default)]
struct BufferPool {
    small: Vec<Vec<u8>>,
    large: Vec<Vec<u8>>,
}

fn acquire_buffer(size: usize) -> Vec<u8> {
    let mut pool = BUFFER_POOL.lock();
    let slot = match size {
        SMALL_BUFFER => pool.small.pop(),
        LARGE_BUFFER => pool.large.pop(),
        _ => None,
    };
    match slot {
        Some(mut buf) => {
            buf.clear();
            buf.resize(size, 0);
            buf
        }
        None => vec![0; size],
    }
}

fn release_buffer(buf: Vec<u8>) -> Result<()> {
    let mut pool = BUFFER_POOL.lock();
    match buf.capacity() {
        c if c >= LARGE_BUFFER => pool.large.push(buf),
        c if c >= SMALL_BUFFER => pool.small.push(buf),
        _ => return Err(BitError::PoolRelease),
    }
    Ok(())
}

/// Sentinel-marked chunk boundaries, innermost last.
#[derive(Clone, Default)]
struct ChunkStack(Vec<usize>);

impl ChunkStack {
    fn push(&mut self, v: usize) {
        self.0.push(v);
    }

    fn pop(&mut self) -> Option<usize> {
        self.0.pop()
    }

    fn top(&self) -> Option<usize> {
        self.0.last().copied()
    }
}

/// Reader with bit-level positioning over a seekable byte stream.
///
/// The buffer keeps a sled of `SLED` bytes past the logical end so the
/// word-at-a-time integer path never indexes outside the allocation.
pub struct BitReader<T>
where
    T: Read + Seek + Send,
{
    underlying: T,
    buffer: Vec<u8>,
    offset: usize,
    bits_in_buffer: usize,
    lazy_position: usize,
    chunk_targets: ChunkStack,
    end_reached: bool,
}

impl<T> BitReader<T>
where
    T: Read + Seek + Send,
{
    /// In-memory variant for embedded payloads (entity data, string tables).
    pub fn new_small_bit_reader(underlying: T) -> Result<Self> {
        Self::open_with_buffer(underlying, acquire_buffer(SMALL_BUFFER))
    }

    /// Buffered variant for whole demo files.
    pub fn new_large_bit_reader(underlying: T) -> Result<Self> {
        Self::open_with_buffer(underlying, acquire_buffer(LARGE_BUFFER))
    }

    fn open_with_buffer(mut underlying: T, mut buffer: Vec<u8>) -> Result<Self> {
        let filled = read_to_fill(&mut underlying, &mut buffer)?;
        let bits_in_buffer = if filled <= SLED {
            filled << 3
        } else {
            (filled << 3) - SLED_BITS
        };
        Ok(Self {
            underlying,
            buffer,
            offset: 0,
            bits_in_buffer,
            lazy_position: 0,
            chunk_targets: ChunkStack::default(),
            end_reached: filled <= SLED,
        })
    }

    /// Consumes the reader and returns its backing buffer to the pool.
    pub fn pool(self) -> Result<()> {
        release_buffer(self.buffer)
    }

    pub fn actual_position(&self) -> usize {
        self.lazy_position + self.offset
    }

    fn advance(&mut self, bits: usize) -> Result<()> {
        self.offset += bits;
        while self.offset > self.bits_in_buffer {
            self.refill_buffer()?;
        }
        Ok(())
    }

    fn refill_buffer(&mut self) -> Result<()> {
        if self.end_reached {
            return Err(BitError::UnexpectedEof);
        }

        let sled_start = self.bits_in_buffer >> 3;
        self.buffer.copy_within(sled_start..sled_start + SLED, 0);

        self.offset -= self.bits_in_buffer;
        self.lazy_position += self.bits_in_buffer;

        let bytes = read_to_fill(&mut self.underlying, &mut self.buffer[SLED..])?;
        self.bits_in_buffer = bytes << 3;

        if bytes == 0 {
            // Only the sled remains readable.
            self.bits_in_buffer = SLED_BITS;
            self.end_reached = true;
        }
        Ok(())
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        let res = (self.buffer[self.offset >> 3] & (1 << (self.offset & 7))) != 0;
        self.advance(1)?;
        Ok(res)
    }

    pub fn read_single_byte(&mut self) -> Result<u8> {
        if self.offset & 7 == 0 {
            let res = self.buffer[self.offset >> 3];
            self.advance(8)?;
            return Ok(res);
        }
        Ok(self.read_int(8)? as u8)
    }

    /// Reads `n <= 32` bits as an unsigned value.
    pub fn read_int(&mut self, n: usize) -> Result<usize> {
        if n > 32 {
            return Err(BitError::IntegerOverflow(n));
        }
        if n == 0 {
            return Ok(0);
        }
        let val = uint64(&self.buffer[(self.offset >> 3) & !3..]);
        let res = (val << (64 - (self.offset & 31) - n) >> (64 - n)) as usize;
        self.advance(n)?;
        Ok(res)
    }

    /// Reads `n <= 32` bits as a sign-extended value.
    pub fn read_signed_int(&mut self, n: usize) -> Result<isize> {
        if n > 32 {
            return Err(BitError::IntegerOverflow(n));
        }
        if n == 0 {
            return Ok(0);
        }
        let val = int64(&self.buffer[(self.offset >> 3) & !3..]);
        let res = (val << (64 - (self.offset & 31) - n) >> (64 - n)) as isize;
        self.advance(n)?;
        Ok(res)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut res = vec![0; n];
        self.read_bytes_into(&mut res)?;
        Ok(res)
    }

    pub fn read_bytes_into(&mut self, out: &mut [u8]) -> Result<()> {
        let n = out.len();
        if self.offset & 7 == 0 && self.offset + (n << 3) <= self.bits_in_buffer {
            out.copy_from_slice(&self.buffer[self.offset >> 3..(self.offset >> 3) + n]);
            self.advance(n << 3)?;
        } else {
            for item in out.iter_mut() {
                *item = self.read_single_byte()?;
            }
        }
        Ok(())
    }

    /// Reads exactly `n` bytes and cuts the result at the first nul.
    pub fn read_cstring(&mut self, n: usize) -> Result<String> {
        let b = self.read_bytes(n)?;
        let end = b.iter().position(|v| *v == 0).unwrap_or(n);
        Ok(String::from_utf8_lossy(&b[..end]).into_owned())
    }

    /// Reads a nul-terminated string of at most `limit` bytes.
    pub fn read_string_limited(&mut self, limit: usize) -> Result<String> {
        let mut result = Vec::with_capacity(MIN_STRING_BUFFER_LENGTH.min(limit));
        for _ in 0..limit {
            let b = self.read_single_byte()?;
            if b == 0 {
                break;
            }
            result.push(b);
        }
        Ok(String::from_utf8_lossy(&result).into_owned())
    }

    pub fn read_string(&mut self) -> Result<String> {
        self.read_string_limited(VALVE_MAX_STRING_LENGTH)
    }

    pub fn read_float(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_int(32)? as u32))
    }

    pub fn read_varint32(&mut self) -> Result<u32> {
        let mut result = 0_u32;
        for i in 0..MAX_VARINT32_BYTES {
            let b = self.read_single_byte()? as u32;
            result |= (b & 0x7F) << (7 * i);
            if (b & 0x80) == 0 {
                break;
            }
        }
        Ok(result)
    }

    pub fn read_varint64(&mut self) -> Result<u64> {
        let mut result = 0_u64;
        for i in 0..MAX_VARINT64_BYTES {
            let b = self.read_single_byte()? as u64;
            result |= (b & 0x7F) << (7 * i);
            if (b & 0x80) == 0 {
                return Ok(result);
            }
        }
        Err(BitError::InvalidEncoding("varint64 exceeds 10 bytes"))
    }

    pub fn read_signed_varint32(&mut self) -> Result<i32> {
        let res = self.read_varint32()? as i32;
        Ok((res >> 1) ^ -(res & 1))
    }

    /// 6-bit prefixed variable integer used by embedded-message framing.
    pub fn read_ubitint(&mut self) -> Result<usize> {
        let res = self.read_int(6)?;
        Ok(match res & (16 | 32) {
            16 => (res & 15) | (self.read_int(4)? << 4),
            32 => (res & 15) | (self.read_int(8)? << 4),
            48 => (res & 15) | (self.read_int(28)? << 4),
            _ => res,
        })
    }

    /// Field-path flavored variable integer (2/4/10/17/31-bit ladder).
    pub fn read_ubitvar_fp(&mut self) -> Result<usize> {
        if self.read_bit()? {
            return self.read_int(2);
        }
        if self.read_bit()? {
            return self.read_int(4);
        }
        if self.read_bit()? {
            return self.read_int(10);
        }
        if self.read_bit()? {
            return self.read_int(17);
        }
        self.read_int(31)
    }

    /// Legacy delta-encoded property index. Returns -1 on the end marker.
    pub fn read_field_index(&mut self, last_idx: isize, new_way: bool) -> Result<isize> {
        if new_way && self.read_bit()? {
            return Ok(last_idx + 1);
        }

        let mut ret: usize;
        if new_way && self.read_bit()? {
            ret = self.read_int(3)?;
        } else {
            ret = self.read_int(7)?;
            match ret & (32 | 64) {
                32 => ret = (ret & !96) | (self.read_int(2)? << 5),
                64 => ret = (ret & !96) | (self.read_int(4)? << 5),
                96 => ret = (ret & !96) | (self.read_int(7)? << 5),
                _ => {}
            }
        }

        if ret == 0xfff {
            return Ok(-1);
        }

        Ok(last_idx + 1 + ret as isize)
    }

    pub fn read_bitcoord(&mut self) -> Result<f32> {
        let mut is_neg = false;
        let mut res = 0.0_f32;

        let mut int_val = self.read_int(1)?;
        let mut fract_val = self.read_int(1)?;

        if int_val | fract_val != 0 {
            is_neg = self.read_bit()?;

            if int_val == 1 {
                int_val = self.read_int(14)? + 1;
            }

            if fract_val == 1 {
                fract_val = self.read_int(5)?;
            }

            res = int_val as f32 + (fract_val as f32 * (1.0 / (1 << 5) as f32));
        }

        Ok(if is_neg { -res } else { res })
    }

    pub fn read_bitcoordmp(&mut self, is_integral: bool, is_low_precision: bool) -> Result<f32> {
        let mut res = 0.0_f32;
        let mut is_neg = false;

        let in_bounds = self.read_bit()?;

        if is_integral {
            if self.read_bit()? {
                is_neg = self.read_bit()?;
                res = match in_bounds {
                    true => (self.read_int(11)? + 1) as f32,
                    false => (self.read_int(14)? + 1) as f32,
                };
            }
        } else {
            let has_int_val = self.read_bit()?;
            is_neg = self.read_bit()?;

            let mut int_val = 0_usize;
            if has_int_val {
                int_val = match in_bounds {
                    true => self.read_int(11)? + 1,
                    false => self.read_int(14)? + 1,
                };
            }

            res = int_val as f32
                + match is_low_precision {
                    true => (self.read_int(3)? as f32) * 0.125,
                    false => (self.read_int(5)? as f32) * 0.03125,
                };
        }

        Ok(if is_neg { -res } else { res })
    }

    pub fn read_bitnormal(&mut self) -> Result<f32> {
        let is_neg = self.read_bit()?;
        let fract_val = self.read_int(11)?;
        let res = fract_val as f32 * 0.000976562;
        Ok(if is_neg { -res } else { res })
    }

    pub fn read_bitcellcoord(
        &mut self,
        bits: usize,
        is_integral: bool,
        is_low_precision: bool,
    ) -> Result<f32> {
        Ok(match is_integral {
            true => self.read_int(bits)? as f32,
            false => match is_low_precision {
                true => self.read_int(bits)? as f32 + (self.read_int(3)? as f32 * 0.125),
                false => self.read_int(bits)? as f32 + (self.read_int(5)? as f32 * 0.03125),
            },
        })
    }

    pub fn begin_chunk(&mut self, bits: usize) {
        self.chunk_targets.push(self.actual_position() + bits);
    }

    /// Verifies the inner decoder consumed exactly the declared length,
    /// skipping any declared-but-unread remainder.
    pub fn end_chunk(&mut self) -> Result<()> {
        let target = self
            .chunk_targets
            .pop()
            .ok_or(BitError::InvalidEncoding("end_chunk without begin_chunk"))?;
        let actual = self.actual_position();

        if actual > target {
            return Err(BitError::MalformedChunk {
                expected_bit: target,
                actual_bit: actual,
            });
        }
        if actual < target {
            self.skip(target - actual)?;
        }

        let actual = self.actual_position();
        if actual != target {
            return Err(BitError::MalformedChunk {
                expected_bit: target,
                actual_bit: actual,
            });
        }
        Ok(())
    }

    pub fn chunk_finished(&self) -> Result<bool> {
        match self.chunk_targets.top() {
            Some(target) => Ok(target <= self.actual_position()),
            None => Err(BitError::InvalidEncoding("chunk_finished without chunk")),
        }
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        let buffer_bits = self.bits_in_buffer as isize - self.offset as isize;
        if n as isize > buffer_bits + SLED_BITS as isize {
            let unbuffered_skip_bits = n - buffer_bits as usize;
            let global_offset =
                self.underlying.stream_position()? + ((unbuffered_skip_bits >> 3) - SLED) as u64;

            self.lazy_position = (global_offset << 3) as usize;
            self.underlying.seek(SeekFrom::Start(global_offset))?;

            let bytes = read_to_fill(&mut self.underlying, &mut self.buffer)?;

            self.offset = unbuffered_skip_bits & SLED_MASK;
            if bytes <= SLED {
                self.bits_in_buffer = bytes << 3;
                self.end_reached = true;
            } else {
                self.bits_in_buffer = (bytes << 3) - SLED_BITS;
                self.end_reached = false;
            }
            if self.offset > self.bits_in_buffer {
                return Err(BitError::UnexpectedEof);
            }
            Ok(())
        } else {
            self.advance(n)
        }
    }
}

fn read_to_fill<R: Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn uint64(b: &[u8]) -> u64 {
    let mut le = [0_u8; 8];
    let n = b.len().min(8);
    le[..n].copy_from_slice(&b[..n]);
    u64::from_le_bytes(le)
}

fn int64(b: &[u8]) -> i64 {
    uint64(b) as i64
}
