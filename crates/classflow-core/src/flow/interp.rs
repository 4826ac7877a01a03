//! Per-opcode transfer functions
//!
//! Pure mapping from instruction category to the value it produces. The
//! engine owns the stack discipline (what gets popped and pushed); this
//! module owns the result typing and the provenance bookkeeping, including
//! registering a typeless value for control/void instructions so that later
//! lookups still find "the value consumed here".
//!
//! An opcode that reaches a typing table it does not belong to is an
//! internal error: the decoder and the interpreter disagree about the
//! instruction set, which is never a property of the analysed input.

use super::value::{ValueArena, ValueId};
use crate::error::{AnalysisError, AnalysisResult};
use crate::ir::{opcodes, ConstValue, FieldRef, JvmType};

/// Leaf value for a constant push.
pub(crate) fn const_leaf(arena: &mut ValueArena, at: usize, literal: &ConstValue) -> ValueId {
    let ty = match literal {
        ConstValue::Int(_) => JvmType::Int,
        ConstValue::Long(_) => JvmType::Long,
        ConstValue::Float(_) => JvmType::Float,
        ConstValue::Double(_) => JvmType::Double,
        ConstValue::Str(_) => JvmType::Reference("java/lang/String".to_string()),
        ConstValue::Class(_) => JvmType::Reference("java/lang/Class".to_string()),
        ConstValue::MethodType(_) => JvmType::Reference("java/lang/invoke/MethodType".to_string()),
        ConstValue::MethodHandle(_) => {
            JvmType::Reference("java/lang/invoke/MethodHandle".to_string())
        }
        ConstValue::Null => JvmType::Reference("null".to_string()),
    };
    arena.new_leaf(Some(ty), Some(at))
}

/// Result of `ineg`/`fneg`/`lneg`/`dneg` and the primitive conversions.
pub(crate) fn unary(
    arena: &mut ValueArena,
    at: usize,
    opcode: u8,
    operand: ValueId,
) -> AnalysisResult<ValueId> {
    use opcodes::*;
    let ty = match opcode {
        INEG | L2I | F2I | D2I | I2B | I2C | I2S => JvmType::Int,
        FNEG | I2F | L2F | D2F => JvmType::Float,
        LNEG | I2L | F2L | D2L => JvmType::Long,
        DNEG | I2D | L2D | F2D => JvmType::Double,
        _ => {
            return Err(AnalysisError::internal(format!(
                "opcode {opcode:#04x} is not a unary operation"
            )))
        }
    };
    Ok(arena.new_derived(Some(ty), at, [Some(operand)]))
}

/// Result of `iinc`, applied to the local slot value.
pub(crate) fn iinc(arena: &mut ValueArena, at: usize, operand: ValueId) -> ValueId {
    arena.new_derived(Some(JvmType::Int), at, [Some(operand)])
}

/// Result of two-operand arithmetic, shifts, logic and the `cmp` family.
pub(crate) fn binary(
    arena: &mut ValueArena,
    at: usize,
    opcode: u8,
    left: ValueId,
    right: ValueId,
) -> AnalysisResult<ValueId> {
    use opcodes::*;
    let ty = match opcode {
        IADD | ISUB | IMUL | IDIV | IREM | ISHL | ISHR | IUSHR | IAND | IOR | IXOR => JvmType::Int,
        LCMP | FCMPL | FCMPG | DCMPL | DCMPG => JvmType::Int,
        FADD | FSUB | FMUL | FDIV | FREM => JvmType::Float,
        LADD | LSUB | LMUL | LDIV | LREM | LSHL | LSHR | LUSHR | LAND | LOR | LXOR => JvmType::Long,
        DADD | DSUB | DMUL | DDIV | DREM => JvmType::Double,
        _ => {
            return Err(AnalysisError::internal(format!(
                "opcode {opcode:#04x} is not a binary operation"
            )))
        }
    };
    Ok(arena.new_derived(Some(ty), at, [Some(left), Some(right)]))
}

/// Result of an array load; element type from the opcode, `aaload` widens
/// to `java/lang/Object`.
pub(crate) fn array_load(
    arena: &mut ValueArena,
    at: usize,
    opcode: u8,
    array: ValueId,
    index: ValueId,
) -> AnalysisResult<ValueId> {
    use opcodes::*;
    let ty = match opcode {
        IALOAD | BALOAD | CALOAD | SALOAD => JvmType::Int,
        FALOAD => JvmType::Float,
        LALOAD => JvmType::Long,
        DALOAD => JvmType::Double,
        AALOAD => JvmType::Reference("java/lang/Object".to_string()),
        _ => {
            return Err(AnalysisError::internal(format!(
                "opcode {opcode:#04x} is not an array load"
            )))
        }
    };
    Ok(arena.new_derived(Some(ty), at, [Some(array), Some(index)]))
}

/// Register the operands a control/void instruction consumed, producing
/// nothing. Branches, value returns, `athrow`, monitors, switches and
/// array/field stores all come through here.
pub(crate) fn consumed(arena: &mut ValueArena, at: usize, operands: &[ValueId]) {
    arena.new_derived(None, at, operands.iter().map(|&v| Some(v)));
}

/// Field accesses. `getstatic` is a typed leaf, `getfield` a typed unary;
/// the put forms only record their operands.
pub(crate) fn field(
    arena: &mut ValueArena,
    at: usize,
    opcode: u8,
    field: &FieldRef,
    operands: &[ValueId],
) -> AnalysisResult<Option<ValueId>> {
    use opcodes::*;
    let ty = JvmType::parse(&field.descriptor);
    match opcode {
        GETSTATIC => Ok(Some(arena.new_derived(ty, at, std::iter::empty()))),
        GETFIELD => Ok(Some(arena.new_derived(ty, at, operands.iter().map(|&v| Some(v))))),
        PUTSTATIC | PUTFIELD => {
            consumed(arena, at, operands);
            Ok(None)
        }
        _ => Err(AnalysisError::internal(format!(
            "opcode {opcode:#04x} is not a field access"
        ))),
    }
}

/// `new`: a typed leaf for the uninitialised instance.
pub(crate) fn new_object(arena: &mut ValueArena, at: usize, class: &str) -> ValueId {
    arena.new_leaf(Some(JvmType::Reference(class.to_string())), Some(at))
}

/// `newarray`/`anewarray`: array of the decoded element type from a length.
pub(crate) fn new_array(
    arena: &mut ValueArena,
    at: usize,
    element: &JvmType,
    length: ValueId,
) -> ValueId {
    arena.new_derived(Some(JvmType::Array(Box::new(element.clone()))), at, [Some(length)])
}

/// `multianewarray`: the array type from one length per dimension.
pub(crate) fn multi_new_array(
    arena: &mut ValueArena,
    at: usize,
    ty: &JvmType,
    lengths: &[ValueId],
) -> ValueId {
    arena.new_derived(Some(ty.clone()), at, lengths.iter().map(|&v| Some(v)))
}

pub(crate) fn array_length(arena: &mut ValueArena, at: usize, array: ValueId) -> ValueId {
    arena.new_derived(Some(JvmType::Int), at, [Some(array)])
}

pub(crate) fn check_cast(arena: &mut ValueArena, at: usize, class: &str, v: ValueId) -> ValueId {
    arena.new_derived(Some(JvmType::Reference(class.to_string())), at, [Some(v)])
}

pub(crate) fn instance_of(arena: &mut ValueArena, at: usize, v: ValueId) -> ValueId {
    arena.new_derived(Some(JvmType::Int), at, [Some(v)])
}

/// A call: value typed by the callee's return type with the full ordered
/// operand list (receiver first for instance calls) as inputs. Void calls
/// register the value but the engine pushes nothing.
pub(crate) fn invoke(
    arena: &mut ValueArena,
    at: usize,
    ret: &JvmType,
    args: &[ValueId],
) -> ValueId {
    arena.new_derived(Some(ret.clone()), at, args.iter().map(|&v| Some(v)))
}
