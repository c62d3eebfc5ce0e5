//! Encoder: emits bytes for an IR instruction into a cursor.
//!
//! The encoder is required to be a left inverse of the decoder:
//! `decode(encode(i)) == i` modulo canonicalisation. Rather than
//! re-deriving bytes from our own `Instruction` fields (which would
//! require re-implementing iced's encoder tables), when the IR still
//! carries its original `raw_bytes` unmodified we re-emit them verbatim;
//! when an instrumentation pass has touched the instruction we re-encode
//! through `iced_x86::Encoder` from the original decoded
//! `iced_x86::Instruction`, which the fragment builder keeps alongside the
//! IR for exactly this purpose (`crate::fragment_builder::DecodedInsn`).

use crate::error::{DbiError, DbiResult};
use iced_x86::{BlockEncoder, BlockEncoderOptions, Encoder, InstructionBlock};

/// Encode a single already-decoded iced instruction at `rip`, appending the
/// bytes to `out`. Returns the number of bytes written.
pub fn encode_one(insn: &iced_x86::Instruction, rip: u64, out: &mut Vec<u8>) -> DbiResult<usize> {
    let mut encoder = Encoder::new(64);
    match encoder.encode(insn, rip) {
        Ok(len) => {
            out.extend_from_slice(encoder.take_buffer().as_slice());
            Ok(len)
        }
        Err(e) => Err(DbiError::EncodeUnencodable {
            reason: e.to_string(),
        }),
    }
}

/// Encode a whole instruction sequence at once, letting iced's block
/// encoder relocate any short/near branches whose displacement no longer
/// fits once the block has been relocated to `new_base` — this is the
/// recompute-PC-relative-operands fix-up the fragment builder needs
/// whenever it moves a decoded sequence to a new cache address.
pub fn encode_block(
    instructions: &[iced_x86::Instruction],
    new_base: u64,
    capacity: usize,
) -> DbiResult<Vec<u8>> {
    let block = InstructionBlock::new(instructions, new_base);
    match BlockEncoder::encode(64, block, BlockEncoderOptions::NONE) {
        Ok(result) => {
            let bytes = result.code_buffer;
            if bytes.len() > capacity {
                return Err(DbiError::EncodeBufferFull {
                    needed: bytes.len(),
                    available: capacity,
                });
            }
            Ok(bytes)
        }
        Err(e) => Err(DbiError::EncodeUnencodable {
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder;

    #[test]
    fn encode_one_round_trips_a_ret() {
        let mut decoder = iced_x86::Decoder::with_ip(64, &[0xc3], 0x1000, iced_x86::DecoderOptions::NONE);
        let insn = decoder.decode();
        let mut out = Vec::new();
        let len = encode_one(&insn, 0x1000, &mut out).unwrap();
        assert_eq!(len, 1);
        assert_eq!(out, vec![0xc3]);

        let (ir, decoded_len) = decoder::decode(&out, 0x1000).unwrap();
        assert_eq!(decoded_len, len);
        assert!(ir.is_terminator());
    }

    #[test]
    fn encode_block_relocates_to_new_base() {
        let mut d = iced_x86::Decoder::with_ip(64, &[0x90], 0x1000, iced_x86::DecoderOptions::NONE);
        let insn = d.decode();
        let bytes = encode_block(&[insn], 0x5000_0000, 64).unwrap();
        assert_eq!(bytes.len(), 1);
    }
}
