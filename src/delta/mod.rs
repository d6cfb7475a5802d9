//! The Git delta instruction language: size-header varints, copy and insert
//! instructions, and a bounded applier that reconstructs a target buffer
//! from a base.
//!
//! Opcode layout:
//! * `0x80..=0xff` is a copy; the low 7 bits select which of
//!   {off0..off3, sz0..sz2} bytes follow, absent bytes default to 0 and an
//!   absent size means 0x10000.
//! * `0x01..=0x7f` is an insert; the opcode is the literal length.
//! * `0x00` is reserved and always an error.

use std::io::{ErrorKind, Read};

use crate::errors::GitError;

const COPY_INSTRUCTION_FLAG: u8 = 1 << 7;
const COPY_OFFSET_BYTES: u8 = 4;
const COPY_SIZE_BYTES: u8 = 3;
const COPY_ZERO_SIZE: usize = 0x10000;

const VAR_INT_ENCODING_BITS: u8 = 7;
const VAR_INT_CONTINUE_FLAG: u8 = 1 << VAR_INT_ENCODING_BITS;

/// Read exactly `N` bytes from the stream into a fixed array.
#[inline]
pub fn read_bytes<R: Read, const N: usize>(stream: &mut R) -> std::io::Result<[u8; N]> {
    let mut bytes = [0; N];
    stream.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Read one varint byte, returning (7-bit value, has_more flag).
pub fn read_var_int_byte<R: Read>(stream: &mut R) -> std::io::Result<(u8, bool)> {
    let [byte] = read_bytes(stream)?;
    Ok((byte & !VAR_INT_CONTINUE_FLAG, byte & VAR_INT_CONTINUE_FLAG != 0))
}

/// Read a Git-style varint (little-endian 7-bit chunks, msb continues).
pub fn read_size_encoding<R: Read>(stream: &mut R) -> Result<usize, GitError> {
    let mut value = 0usize;
    let mut length = 0u32;
    loop {
        let (byte_value, more_bytes) = read_var_int_byte(stream)
            .map_err(|e| GitError::InvalidDelta(format!("truncated size varint: {e}")))?;
        value |= (byte_value as usize) << length;
        if !more_bytes {
            return Ok(value);
        }
        length += VAR_INT_ENCODING_BITS as u32;
        if length > 63 {
            return Err(GitError::InvalidDelta("size varint overflows".to_string()));
        }
    }
}

/// Append a Git-style varint to `out`.
pub fn write_size_encoding(out: &mut Vec<u8>, mut value: usize) {
    loop {
        let mut byte = (value as u8) & !VAR_INT_CONTINUE_FLAG;
        value >>= VAR_INT_ENCODING_BITS;
        if value != 0 {
            byte |= VAR_INT_CONTINUE_FLAG;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Read a partial little-endian integer according to presence bits: for each
/// set bit in `present_bytes` one byte follows and lands at its byte index.
fn read_partial_int<R: Read>(
    stream: &mut R,
    bytes: u8,
    present_bytes: &mut u8,
) -> Result<usize, GitError> {
    let mut value: usize = 0;
    for byte_index in 0..bytes {
        if *present_bytes & 1 != 0 {
            let [byte] = read_bytes(stream)
                .map_err(|e| GitError::InvalidDelta(format!("truncated copy operand: {e}")))?;
            value |= (byte as usize) << (byte_index * 8);
        }
        *present_bytes >>= 1;
    }
    Ok(value)
}

/// Apply a delta stream to `base`, returning the reconstructed target.
///
/// Fails on a base-size mismatch, opcode 0, a copy that reaches past the
/// base, or when the produced output does not equal the declared target
/// size.
pub fn apply(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, GitError> {
    let mut stream = std::io::Cursor::new(delta);

    let base_size = read_size_encoding(&mut stream)?;
    if base.len() != base_size {
        return Err(GitError::InvalidDelta(format!(
            "base is {} bytes, delta declares {base_size}",
            base.len()
        )));
    }
    let target_size = read_size_encoding(&mut stream)?;

    let mut buffer = Vec::with_capacity(target_size);
    loop {
        let instruction = match read_bytes(&mut stream) {
            Ok([instruction]) => instruction,
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => {
                return Err(GitError::InvalidDelta(format!(
                    "failed reading instruction: {err}"
                )));
            }
        };

        if instruction & COPY_INSTRUCTION_FLAG == 0 {
            // Insert; opcode 0 is reserved.
            if instruction == 0 {
                return Err(GitError::InvalidDelta(
                    "reserved opcode 0x00 in delta stream".to_string(),
                ));
            }
            let mut data = vec![0; instruction as usize];
            stream
                .read_exact(&mut data)
                .map_err(|e| GitError::InvalidDelta(format!("truncated insert data: {e}")))?;
            if buffer.len() + data.len() > target_size {
                return Err(GitError::Corruption(
                    "delta insert overflows declared target size".to_string(),
                ));
            }
            buffer.extend_from_slice(&data);
        } else {
            let mut nonzero_bytes = instruction;
            let offset = read_partial_int(&mut stream, COPY_OFFSET_BYTES, &mut nonzero_bytes)?;
            let mut size = read_partial_int(&mut stream, COPY_SIZE_BYTES, &mut nonzero_bytes)?;
            if size == 0 {
                size = COPY_ZERO_SIZE;
            }
            let data = base
                .get(offset..offset + size)
                .ok_or_else(|| GitError::InvalidDelta("copy reaches past base".to_string()))?;
            if buffer.len() + size > target_size {
                return Err(GitError::Corruption(
                    "delta copy overflows declared target size".to_string(),
                ));
            }
            buffer.extend_from_slice(data);
        }
    }

    if buffer.len() != target_size {
        return Err(GitError::Corruption(format!(
            "delta produced {} bytes, declared {target_size}",
            buffer.len()
        )));
    }
    Ok(buffer)
}

/// Minimal delta builder emitting copy and insert instructions verbatim.
/// The pack emitter never delta-compresses; this exists for thin-pack and
/// resolver tests and for synthesizing fixtures.
pub struct DeltaBuilder {
    base_size: usize,
    target_size: usize,
    ops: Vec<u8>,
}

impl DeltaBuilder {
    pub fn new(base_size: usize) -> Self {
        Self {
            base_size,
            target_size: 0,
            ops: Vec::new(),
        }
    }

    /// Copy `size` bytes from `offset` in the base.
    pub fn copy(mut self, offset: usize, size: usize) -> Self {
        let mut opcode = COPY_INSTRUCTION_FLAG;
        let mut operands = Vec::new();
        for i in 0..COPY_OFFSET_BYTES {
            let byte = ((offset >> (i * 8)) & 0xff) as u8;
            if byte != 0 {
                opcode |= 1 << i;
                operands.push(byte);
            }
        }
        if size != COPY_ZERO_SIZE {
            for i in 0..COPY_SIZE_BYTES {
                let byte = ((size >> (i * 8)) & 0xff) as u8;
                if byte != 0 {
                    opcode |= 1 << (4 + i);
                    operands.push(byte);
                }
            }
        }
        self.ops.push(opcode);
        self.ops.extend(operands);
        self.target_size += size;
        self
    }

    /// Insert literal bytes (split into 127-byte instructions).
    pub fn insert(mut self, data: &[u8]) -> Self {
        for chunk in data.chunks(0x7f) {
            self.ops.push(chunk.len() as u8);
            self.ops.extend_from_slice(chunk);
            self.target_size += chunk.len();
        }
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.ops.len() + 8);
        write_size_encoding(&mut out, self.base_size);
        write_size_encoding(&mut out, self.target_size);
        out.extend(self.ops);
        out
    }
}
