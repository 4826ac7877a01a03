//! Bytecode decoding: code arrays to index-addressed instructions
//!
//! The code attribute addresses instructions by byte offset; the analysis
//! addresses them by index. Decoding runs in two passes: first the raw
//! instruction stream with byte-offset targets, then a rewrite of every
//! branch/switch target through the offset-to-index map. Exception-table
//! and line-table offsets go through the same map.

use crate::parser::{class_name, invoke_dynamic_ref, loadable_const, member_ref, CpEntry};
use classflow_core::error::DecodeError;
use classflow_core::ir::{
    CallKind, ConstValue, FieldRef, Insn, InsnKind, JvmType, MethodRef, StackOp,
};
use std::collections::HashMap;

/// Decoded instruction stream plus the offset map used to convert the
/// surrounding tables.
pub(crate) struct DecodedCode {
    pub insns: Vec<Insn>,
    offsets: HashMap<usize, usize>,
    code_len: usize,
}

impl DecodedCode {
    /// Index of the instruction starting at `offset`.
    pub(crate) fn index_of(&self, offset: usize) -> Result<usize, DecodeError> {
        self.offsets
            .get(&offset)
            .copied()
            .ok_or_else(|| DecodeError::new(format!("offset {offset} is not an instruction start")))
    }

    /// Like [`index_of`](Self::index_of), but accepts the end-of-code
    /// offset exception ranges may use as their exclusive bound.
    pub(crate) fn boundary_of(&self, offset: usize) -> Result<usize, DecodeError> {
        if offset == self.code_len {
            return Ok(self.insns.len());
        }
        self.index_of(offset)
    }
}

struct CodeReader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> CodeReader<'a> {
    fn eof(&self) -> DecodeError {
        DecodeError::new("truncated bytecode")
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        let v = *self.code.get(self.pos).ok_or_else(|| self.eof())?;
        self.pos += 1;
        Ok(v)
    }

    fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(self.u16()? as i16)
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes([self.u8()?, self.u8()?, self.u8()?, self.u8()?]))
    }

    /// Switch payloads are aligned to four bytes from the code start.
    fn align4(&mut self) -> Result<(), DecodeError> {
        while self.pos % 4 != 0 {
            self.u8()?;
        }
        Ok(())
    }
}

fn rel_target(base: usize, delta: i32) -> Result<usize, DecodeError> {
    let target = base as i64 + delta as i64;
    usize::try_from(target).map_err(|_| DecodeError::new("branch target before code start"))
}

fn newarray_element(atype: u8) -> Result<JvmType, DecodeError> {
    Ok(match atype {
        4 => JvmType::Boolean,
        5 => JvmType::Char,
        6 => JvmType::Float,
        7 => JvmType::Double,
        8 => JvmType::Byte,
        9 => JvmType::Short,
        10 => JvmType::Int,
        11 => JvmType::Long,
        _ => return Err(DecodeError::new(format!("invalid newarray type {atype}"))),
    })
}

/// An `anewarray`/`multianewarray`/`checkcast` class operand may name a
/// plain class or an array descriptor.
fn type_operand(name: &str) -> JvmType {
    if name.starts_with('[') {
        JvmType::parse(name).unwrap_or_else(|| JvmType::Reference(name.to_string()))
    } else {
        JvmType::Reference(name.to_string())
    }
}

/// Decode one method's code array. Branch targets inside the returned
/// instructions are instruction indices.
pub(crate) fn decode(code: &[u8], pool: &[CpEntry]) -> Result<DecodedCode, DecodeError> {
    let mut r = CodeReader { code, pos: 0 };
    let mut insns = Vec::new();
    let mut offsets = HashMap::new();

    while r.pos < code.len() {
        let at = r.pos;
        let opcode = r.u8()?;
        let kind = decode_insn(&mut r, opcode, at, pool)?;
        offsets.insert(at, insns.len());
        insns.push(Insn { opcode, kind });
    }

    for insn in &mut insns {
        match &mut insn.kind {
            InsnKind::Goto { target } | InsnKind::If { target } | InsnKind::Jsr { target } => {
                *target = index_for(&offsets, *target)?;
            }
            InsnKind::Switch { default, targets } => {
                *default = index_for(&offsets, *default)?;
                for target in targets {
                    *target = index_for(&offsets, *target)?;
                }
            }
            _ => {}
        }
    }
    Ok(DecodedCode {
        insns,
        offsets,
        code_len: code.len(),
    })
}

fn index_for(offsets: &HashMap<usize, usize>, offset: usize) -> Result<usize, DecodeError> {
    offsets
        .get(&offset)
        .copied()
        .ok_or_else(|| DecodeError::new(format!("branch into the middle of an instruction at {offset}")))
}

fn decode_insn(
    r: &mut CodeReader<'_>,
    opcode: u8,
    at: usize,
    pool: &[CpEntry],
) -> Result<InsnKind, DecodeError> {
    let kind = match opcode {
        0x00 => InsnKind::Stack(StackOp::Nop),
        0x01 => InsnKind::Const(ConstValue::Null),
        0x02..=0x08 => InsnKind::Const(ConstValue::Int(opcode as i32 - 0x03)),
        0x09 | 0x0a => InsnKind::Const(ConstValue::Long((opcode - 0x09) as i64)),
        0x0b..=0x0d => InsnKind::Const(ConstValue::Float((opcode - 0x0b) as f32)),
        0x0e | 0x0f => InsnKind::Const(ConstValue::Double((opcode - 0x0e) as f64)),
        0x10 => InsnKind::Const(ConstValue::Int(r.i8()? as i32)),
        0x11 => InsnKind::Const(ConstValue::Int(r.i16()? as i32)),
        0x12 => InsnKind::Const(loadable_const(pool, r.u8()? as u16)?),
        0x13 | 0x14 => InsnKind::Const(loadable_const(pool, r.u16()?)?),
        0x15..=0x19 => InsnKind::Load { slot: r.u8()? as usize },
        0x1a..=0x1d => InsnKind::Load { slot: (opcode - 0x1a) as usize },
        0x1e..=0x21 => InsnKind::Load { slot: (opcode - 0x1e) as usize },
        0x22..=0x25 => InsnKind::Load { slot: (opcode - 0x22) as usize },
        0x26..=0x29 => InsnKind::Load { slot: (opcode - 0x26) as usize },
        0x2a..=0x2d => InsnKind::Load { slot: (opcode - 0x2a) as usize },
        0x2e..=0x35 => InsnKind::ArrayLoad,
        0x36..=0x3a => InsnKind::Store { slot: r.u8()? as usize },
        0x3b..=0x3e => InsnKind::Store { slot: (opcode - 0x3b) as usize },
        0x3f..=0x42 => InsnKind::Store { slot: (opcode - 0x3f) as usize },
        0x43..=0x46 => InsnKind::Store { slot: (opcode - 0x43) as usize },
        0x47..=0x4a => InsnKind::Store { slot: (opcode - 0x47) as usize },
        0x4b..=0x4e => InsnKind::Store { slot: (opcode - 0x4b) as usize },
        0x4f..=0x56 => InsnKind::ArrayStore,
        0x57 => InsnKind::Stack(StackOp::Pop),
        0x58 => InsnKind::Stack(StackOp::Pop2),
        0x59 => InsnKind::Stack(StackOp::Dup),
        0x5a => InsnKind::Stack(StackOp::DupX1),
        0x5b => InsnKind::Stack(StackOp::DupX2),
        0x5c => InsnKind::Stack(StackOp::Dup2),
        0x5d => InsnKind::Stack(StackOp::Dup2X1),
        0x5e => InsnKind::Stack(StackOp::Dup2X2),
        0x5f => InsnKind::Stack(StackOp::Swap),
        0x60..=0x73 => InsnKind::Binary,
        0x74..=0x77 => InsnKind::Unary,
        0x78..=0x83 => InsnKind::Binary,
        0x84 => InsnKind::Iinc {
            slot: r.u8()? as usize,
            delta: r.i8()? as i32,
        },
        0x85..=0x93 => InsnKind::Unary,
        0x94..=0x98 => InsnKind::Binary,
        0x99..=0xa6 => InsnKind::If {
            target: rel_target(at, r.i16()? as i32)?,
        },
        0xa7 => InsnKind::Goto {
            target: rel_target(at, r.i16()? as i32)?,
        },
        0xa8 => InsnKind::Jsr {
            target: rel_target(at, r.i16()? as i32)?,
        },
        0xa9 => InsnKind::Ret { slot: r.u8()? as usize },
        0xaa => {
            r.align4()?;
            let default = rel_target(at, r.i32()?)?;
            let low = r.i32()?;
            let high = r.i32()?;
            if high < low {
                return Err(DecodeError::new("tableswitch bounds out of order"));
            }
            let count = (high as i64 - low as i64 + 1) as usize;
            let mut targets = Vec::with_capacity(count);
            for _ in 0..count {
                targets.push(rel_target(at, r.i32()?)?);
            }
            InsnKind::Switch { default, targets }
        }
        0xab => {
            r.align4()?;
            let default = rel_target(at, r.i32()?)?;
            let npairs = r.i32()?;
            if npairs < 0 {
                return Err(DecodeError::new("negative lookupswitch pair count"));
            }
            let mut targets = Vec::with_capacity(npairs as usize);
            for _ in 0..npairs {
                let _match = r.i32()?;
                targets.push(rel_target(at, r.i32()?)?);
            }
            InsnKind::Switch { default, targets }
        }
        0xac..=0xb1 => InsnKind::Return,
        0xb2..=0xb5 => {
            let (owner, name, descriptor) = member_ref(pool, r.u16()?)?;
            InsnKind::Field(FieldRef { owner, name, descriptor })
        }
        0xb6..=0xb8 => {
            let (owner, name, descriptor) = member_ref(pool, r.u16()?)?;
            let kind = match opcode {
                0xb6 => CallKind::Virtual,
                0xb7 => CallKind::Special,
                _ => CallKind::Static,
            };
            InsnKind::Invoke {
                kind,
                target: MethodRef { owner, name, descriptor },
            }
        }
        0xb9 => {
            let (owner, name, descriptor) = member_ref(pool, r.u16()?)?;
            let _count = r.u8()?;
            let _zero = r.u8()?;
            InsnKind::Invoke {
                kind: CallKind::Interface,
                target: MethodRef { owner, name, descriptor },
            }
        }
        0xba => {
            let (name, descriptor) = invoke_dynamic_ref(pool, r.u16()?)?;
            let _zero = r.u16()?;
            InsnKind::Invoke {
                kind: CallKind::Dynamic,
                target: MethodRef {
                    owner: String::new(),
                    name,
                    descriptor,
                },
            }
        }
        0xbb => InsnKind::New(class_name(pool, r.u16()?)?.to_string()),
        0xbc => InsnKind::NewArray {
            element: newarray_element(r.u8()?)?,
        },
        0xbd => InsnKind::NewArray {
            element: type_operand(class_name(pool, r.u16()?)?),
        },
        0xbe => InsnKind::ArrayLength,
        0xbf => InsnKind::Athrow,
        0xc0 => InsnKind::CheckCast(class_name(pool, r.u16()?)?.to_string()),
        0xc1 => InsnKind::InstanceOf(class_name(pool, r.u16()?)?.to_string()),
        0xc2 | 0xc3 => InsnKind::Monitor,
        0xc4 => {
            let wide = r.u8()?;
            match wide {
                0x15..=0x19 => InsnKind::Load { slot: r.u16()? as usize },
                0x36..=0x3a => InsnKind::Store { slot: r.u16()? as usize },
                0x84 => InsnKind::Iinc {
                    slot: r.u16()? as usize,
                    delta: r.i16()? as i32,
                },
                0xa9 => InsnKind::Ret { slot: r.u16()? as usize },
                _ => {
                    return Err(DecodeError::new(format!(
                        "invalid wide-prefixed opcode {wide:#04x}"
                    )))
                }
            }
        }
        0xc5 => {
            let ty = type_operand(class_name(pool, r.u16()?)?);
            let dims = r.u8()?;
            if dims == 0 {
                return Err(DecodeError::new("multianewarray with zero dimensions"));
            }
            InsnKind::MultiNewArray { ty, dims }
        }
        0xc6 | 0xc7 => InsnKind::If {
            target: rel_target(at, r.i16()? as i32)?,
        },
        0xc8 => InsnKind::Goto {
            target: rel_target(at, r.i32()?)?,
        },
        0xc9 => InsnKind::Jsr {
            target: rel_target(at, r.i32()?)?,
        },
        _ => return Err(DecodeError::new(format!("unknown opcode {opcode:#04x}"))),
    };
    Ok(kind)
}
