//! The wire protocol spoken between the emulator and the broker.
//!
//! A connection carries a sequence of frames. Each frame is a 4-byte
//! little-endian payload length followed by that many payload bytes. The
//! payload is a tagged union of the three message kinds below. Decoding a
//! payload *is* the verification step: a frame that does not parse exactly
//! (unknown tag, truncated field, trailing bytes) terminates the connection
//! it arrived on.

use crate::errors::ProtoError;
use crate::tb::RawBytes;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use strum::FromRepr;

/// `ExecTb` index value that, together with [`END_OF_STREAM_PC`], marks the
/// end of the execution stream.
pub const END_OF_STREAM_INDEX: u32 = u32::MAX;
/// See [`END_OF_STREAM_INDEX`].
pub const END_OF_STREAM_PC: u64 = u64::MAX;

/// Upper bound on the payload size of a single frame. Anything larger is
/// rejected before buffer allocation.
pub const MAX_FRAME_LEN: u32 = 1 << 20;

#[derive(Clone, Copy, Debug, Eq, FromRepr, PartialEq)]
#[repr(u8)]
enum MessageTag {
    Metadata = 0,
    TranslatedBlock = 1,
    ExecTb = 2,
}

/// One memory operation observed by the emulator while executing a
/// translation block. `inst_index` refers to the raw (emulator-visible)
/// instruction within the block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemAccessRecord {
    pub inst_index: u32,
    pub is_store: bool,
    pub vaddr: u64,
    pub size: u32,
}

/// A verified wire message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    /// The emulator's base load address for the guest binary.
    Metadata { load_addr: u64 },
    /// Registers (or replaces) the translation block at `index`.
    TranslatedBlock { index: u32, insts: Vec<RawBytes> },
    /// The block at `index` was executed starting at `pc`.
    ExecTb {
        index: u32,
        pc: u64,
        mem_accesses: Vec<MemAccessRecord>,
    },
}

impl Message {
    /// The sentinel `ExecTb` that ends the stream.
    pub fn end_of_stream() -> Message {
        Message::ExecTb {
            index: END_OF_STREAM_INDEX,
            pc: END_OF_STREAM_PC,
            mem_accesses: Vec::new(),
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(
            self,
            Message::ExecTb { index, pc, .. }
                if *index == END_OF_STREAM_INDEX && *pc == END_OF_STREAM_PC
        )
    }

    /// Decode and verify one frame payload.
    pub fn decode(payload: &[u8]) -> Result<Message, ProtoError> {
        let mut c = Cursor::new(payload);
        let tag = c.read_u8()?;
        let tag = MessageTag::from_repr(tag).ok_or(ProtoError::UnknownTag(tag))?;
        let msg = match tag {
            MessageTag::Metadata => Message::Metadata {
                load_addr: c.read_u64::<LittleEndian>()?,
            },
            MessageTag::TranslatedBlock => {
                let index = c.read_u32::<LittleEndian>()?;
                let count = c.read_u32::<LittleEndian>()?;
                // Sized by what is actually read, not by the claimed count:
                // a lying count fails on the first short read.
                let mut insts = Vec::new();
                for _ in 0..count {
                    let len = usize::from(c.read_u8()?);
                    let mut data = RawBytes::new();
                    data.resize(len, 0);
                    c.read_exact(&mut data)?;
                    insts.push(data);
                }
                Message::TranslatedBlock { index, insts }
            }
            MessageTag::ExecTb => {
                let index = c.read_u32::<LittleEndian>()?;
                let pc = c.read_u64::<LittleEndian>()?;
                let count = c.read_u32::<LittleEndian>()?;
                let mut mem_accesses = Vec::new();
                for _ in 0..count {
                    mem_accesses.push(MemAccessRecord {
                        inst_index: c.read_u32::<LittleEndian>()?,
                        is_store: c.read_u8()? != 0,
                        vaddr: c.read_u64::<LittleEndian>()?,
                        size: c.read_u32::<LittleEndian>()?,
                    });
                }
                Message::ExecTb {
                    index,
                    pc,
                    mem_accesses,
                }
            }
        };
        let rest = payload.len() - usize::try_from(c.position()).unwrap();
        if rest != 0 {
            return Err(ProtoError::TrailingBytes(rest));
        }
        Ok(msg)
    }

    /// Encode the message as a complete frame (length prefix included). This
    /// is the emulator-plugin side of the protocol; the broker itself only
    /// decodes.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::Metadata { load_addr } => {
                payload.push(MessageTag::Metadata as u8);
                payload.extend_from_slice(&load_addr.to_le_bytes());
            }
            Message::TranslatedBlock { index, insts } => {
                payload.push(MessageTag::TranslatedBlock as u8);
                payload.extend_from_slice(&index.to_le_bytes());
                payload.extend_from_slice(&(insts.len() as u32).to_le_bytes());
                for inst in insts {
                    debug_assert!(inst.len() <= usize::from(u8::MAX));
                    payload.push(inst.len() as u8);
                    payload.extend_from_slice(inst);
                }
            }
            Message::ExecTb {
                index,
                pc,
                mem_accesses,
            } => {
                payload.push(MessageTag::ExecTb as u8);
                payload.extend_from_slice(&index.to_le_bytes());
                payload.extend_from_slice(&pc.to_le_bytes());
                payload.extend_from_slice(&(mem_accesses.len() as u32).to_le_bytes());
                for ma in mem_accesses {
                    payload.extend_from_slice(&ma.inst_index.to_le_bytes());
                    payload.push(u8::from(ma.is_store));
                    payload.extend_from_slice(&ma.vaddr.to_le_bytes());
                    payload.extend_from_slice(&ma.size.to_le_bytes());
                }
            }
        }
        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame
    }
}

/// Read one frame payload into `buf`.
///
/// Returns `Ok(None)` on a clean end-of-stream (EOF at a frame boundary). A
/// short read inside a frame is an error: the peer hung up mid-message.
pub fn read_frame<R: Read>(r: &mut R, buf: &mut Vec<u8>) -> Result<Option<usize>, ProtoError> {
    let mut prefix = [0u8; 4];
    let n = loop {
        match r.read(&mut prefix) {
            Ok(n) => break n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    };
    if n == 0 {
        return Ok(None);
    }
    r.read_exact(&mut prefix[n..])?;
    let len = u32::from_le_bytes(prefix);
    if len == 0 {
        return Err(ProtoError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::Oversized(len));
    }
    buf.clear();
    buf.resize(len as usize, 0);
    r.read_exact(buf)?;
    Ok(Some(len as usize))
}
