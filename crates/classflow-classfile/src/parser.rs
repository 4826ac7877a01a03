//! Classfile decoding: constant pool, method bodies, code attributes
//!
//! Self-contained big-endian parsing of the classfile container down to the
//! pieces the analysis needs: the class's internal name and, per method,
//! name, descriptor, static flag, decoded instruction sequence, exception
//! table and line-number table. Everything else (fields, annotations,
//! stack-map frames) is skipped over.

use crate::bytecode;
use classflow_core::error::DecodeError;
use classflow_core::ir::{ClassDef, ConstValue, ExceptionHandler, LineEntry, MethodDef};
use classflow_core::ClassDecoder;

const MAGIC: u32 = 0xCAFE_BABE;
const ACC_STATIC: u16 = 0x0008;

/// Decoder for raw `.class` bytes, usable wherever the driver expects a
/// [`ClassDecoder`].
#[derive(Debug, Default)]
pub struct ClassFileDecoder;

impl ClassFileDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl ClassDecoder for ClassFileDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<ClassDef, DecodeError> {
        decode_class(bytes)
    }
}

/// Cursor over big-endian classfile bytes.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn eof(&self) -> DecodeError {
        DecodeError::new("unexpected end of class file")
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or_else(|| self.eof())?;
        if end > self.data.len() {
            return Err(self.eof());
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.bytes(n).map(|_| ())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Constant-pool entry; unreferenced kinds keep only what resolution needs.
#[derive(Debug, Clone)]
pub(crate) enum CpEntry {
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name: u16 },
    Str { utf8: u16 },
    MemberRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { reference: u16 },
    MethodType { descriptor: u16 },
    InvokeDynamic { name_and_type: u16 },
    /// Second slot of long/double, or a kind resolution never touches.
    Unusable,
}

pub(crate) fn utf8(pool: &[CpEntry], index: u16) -> Result<&str, DecodeError> {
    match pool.get(index as usize) {
        Some(CpEntry::Utf8(s)) => Ok(s),
        _ => Err(DecodeError::new(format!("constant #{index} is not utf8"))),
    }
}

pub(crate) fn class_name(pool: &[CpEntry], index: u16) -> Result<&str, DecodeError> {
    match pool.get(index as usize) {
        Some(CpEntry::Class { name }) => utf8(pool, *name),
        _ => Err(DecodeError::new(format!("constant #{index} is not a class"))),
    }
}

fn name_and_type(pool: &[CpEntry], index: u16) -> Result<(&str, &str), DecodeError> {
    match pool.get(index as usize) {
        Some(CpEntry::NameAndType { name, descriptor }) => {
            Ok((utf8(pool, *name)?, utf8(pool, *descriptor)?))
        }
        _ => Err(DecodeError::new(format!(
            "constant #{index} is not a name-and-type"
        ))),
    }
}

/// Resolve a field/method/interface-method reference to
/// `(owner, name, descriptor)`.
pub(crate) fn member_ref(
    pool: &[CpEntry],
    index: u16,
) -> Result<(String, String, String), DecodeError> {
    match pool.get(index as usize) {
        Some(CpEntry::MemberRef { class, name_and_type: nat }) => {
            let owner = class_name(pool, *class)?.to_string();
            let (name, descriptor) = name_and_type(pool, *nat)?;
            Ok((owner, name.to_string(), descriptor.to_string()))
        }
        _ => Err(DecodeError::new(format!(
            "constant #{index} is not a member reference"
        ))),
    }
}

/// Resolve the name-and-type half of an `invokedynamic` operand.
pub(crate) fn invoke_dynamic_ref(
    pool: &[CpEntry],
    index: u16,
) -> Result<(String, String), DecodeError> {
    match pool.get(index as usize) {
        Some(CpEntry::InvokeDynamic { name_and_type: nat }) => {
            let (name, descriptor) = name_and_type(pool, *nat)?;
            Ok((name.to_string(), descriptor.to_string()))
        }
        _ => Err(DecodeError::new(format!(
            "constant #{index} is not an invokedynamic site"
        ))),
    }
}

/// Resolve an `ldc`/`ldc_w`/`ldc2_w` operand to its literal.
pub(crate) fn loadable_const(pool: &[CpEntry], index: u16) -> Result<ConstValue, DecodeError> {
    match pool.get(index as usize) {
        Some(CpEntry::Integer(v)) => Ok(ConstValue::Int(*v)),
        Some(CpEntry::Float(v)) => Ok(ConstValue::Float(*v)),
        Some(CpEntry::Long(v)) => Ok(ConstValue::Long(*v)),
        Some(CpEntry::Double(v)) => Ok(ConstValue::Double(*v)),
        Some(CpEntry::Str { utf8: s }) => Ok(ConstValue::Str(utf8(pool, *s)?.to_string())),
        Some(CpEntry::Class { name }) => Ok(ConstValue::Class(utf8(pool, *name)?.to_string())),
        Some(CpEntry::MethodType { descriptor }) => {
            Ok(ConstValue::MethodType(utf8(pool, *descriptor)?.to_string()))
        }
        Some(CpEntry::MethodHandle { reference }) => {
            let (owner, name, descriptor) = member_ref(pool, *reference)?;
            Ok(ConstValue::MethodHandle(format!("{owner}.{name}[{descriptor}]")))
        }
        _ => Err(DecodeError::new(format!(
            "constant #{index} is not a loadable constant"
        ))),
    }
}

fn parse_constant_pool(r: &mut Reader<'_>) -> Result<Vec<CpEntry>, DecodeError> {
    let count = r.u16()? as usize;
    let mut pool = Vec::with_capacity(count);
    pool.push(CpEntry::Unusable); // the pool is 1-based
    while pool.len() < count {
        let tag = r.u8()?;
        let entry = match tag {
            1 => {
                let len = r.u16()? as usize;
                CpEntry::Utf8(String::from_utf8_lossy(r.bytes(len)?).into_owned())
            }
            3 => CpEntry::Integer(r.u32()? as i32),
            4 => CpEntry::Float(f32::from_bits(r.u32()?)),
            5 => {
                let high = r.u32()? as u64;
                let low = r.u32()? as u64;
                CpEntry::Long(((high << 32) | low) as i64)
            }
            6 => {
                let high = r.u32()? as u64;
                let low = r.u32()? as u64;
                CpEntry::Double(f64::from_bits((high << 32) | low))
            }
            7 => CpEntry::Class { name: r.u16()? },
            8 => CpEntry::Str { utf8: r.u16()? },
            9 | 10 | 11 => CpEntry::MemberRef {
                class: r.u16()?,
                name_and_type: r.u16()?,
            },
            12 => CpEntry::NameAndType {
                name: r.u16()?,
                descriptor: r.u16()?,
            },
            15 => {
                let _kind = r.u8()?;
                CpEntry::MethodHandle { reference: r.u16()? }
            }
            16 => CpEntry::MethodType { descriptor: r.u16()? },
            17 => {
                // Constant_Dynamic: not loadable by this decoder.
                r.skip(4)?;
                CpEntry::Unusable
            }
            18 => {
                let _bootstrap = r.u16()?;
                CpEntry::InvokeDynamic { name_and_type: r.u16()? }
            }
            19 | 20 => {
                // Module / Package
                r.skip(2)?;
                CpEntry::Unusable
            }
            _ => return Err(DecodeError::new(format!("unknown constant tag {tag}"))),
        };
        let two_slots = matches!(entry, CpEntry::Long(_) | CpEntry::Double(_));
        pool.push(entry);
        if two_slots {
            pool.push(CpEntry::Unusable);
        }
    }
    Ok(pool)
}

fn skip_attributes(r: &mut Reader<'_>) -> Result<(), DecodeError> {
    let count = r.u16()?;
    for _ in 0..count {
        r.skip(2)?;
        let len = r.u32()? as usize;
        r.skip(len)?;
    }
    Ok(())
}

struct RawCode {
    max_locals: usize,
    code: Vec<u8>,
    /// (start_pc, end_pc, handler_pc, catch_type)
    handlers: Vec<(u16, u16, u16, u16)>,
    /// (start_pc, line)
    lines: Vec<(u16, u16)>,
}

fn parse_code_attribute(r: &mut Reader<'_>, pool: &[CpEntry]) -> Result<RawCode, DecodeError> {
    let _max_stack = r.u16()?;
    let max_locals = r.u16()? as usize;
    let code_len = r.u32()? as usize;
    let code = r.bytes(code_len)?.to_vec();
    let handler_count = r.u16()?;
    let mut handlers = Vec::with_capacity(handler_count as usize);
    for _ in 0..handler_count {
        handlers.push((r.u16()?, r.u16()?, r.u16()?, r.u16()?));
    }
    let attr_count = r.u16()?;
    let mut lines = Vec::new();
    for _ in 0..attr_count {
        let name = utf8(pool, r.u16()?)?.to_string();
        let len = r.u32()? as usize;
        if name == "LineNumberTable" {
            let entry_count = r.u16()?;
            for _ in 0..entry_count {
                lines.push((r.u16()?, r.u16()?));
            }
        } else {
            r.skip(len)?;
        }
    }
    Ok(RawCode {
        max_locals,
        code,
        handlers,
        lines,
    })
}

fn parse_method(r: &mut Reader<'_>, pool: &[CpEntry]) -> Result<MethodDef, DecodeError> {
    let access = r.u16()?;
    let name = utf8(pool, r.u16()?)?.to_string();
    let descriptor = utf8(pool, r.u16()?)?.to_string();
    let attr_count = r.u16()?;
    let mut raw_code = None;
    for _ in 0..attr_count {
        let attr_name = utf8(pool, r.u16()?)?.to_string();
        let len = r.u32()? as usize;
        if attr_name == "Code" && raw_code.is_none() {
            raw_code = Some(parse_code_attribute(r, pool)?);
        } else {
            r.skip(len)?;
        }
    }

    let mut method = MethodDef {
        name,
        descriptor,
        is_static: access & ACC_STATIC != 0,
        max_locals: 0,
        insns: Vec::new(),
        handlers: Vec::new(),
        line_table: Vec::new(),
    };
    let raw = match raw_code {
        // Abstract and native methods carry no code; the analysis rejects
        // them downstream, matching how missing frames are treated.
        None => return Ok(method),
        Some(raw) => raw,
    };

    let decoded = bytecode::decode(&raw.code, pool)?;
    method.max_locals = raw.max_locals;
    for (start, end, handler, catch) in raw.handlers {
        method.handlers.push(ExceptionHandler {
            start: decoded.index_of(start as usize)?,
            end: decoded.boundary_of(end as usize)?,
            handler: decoded.index_of(handler as usize)?,
            catch_type: if catch == 0 {
                None
            } else {
                Some(class_name(pool, catch)?.to_string())
            },
        });
    }
    for (start_pc, line) in raw.lines {
        // A marker can sit on an offset no instruction starts at (dead
        // padding); such entries are dropped.
        if let Ok(index) = decoded.index_of(start_pc as usize) {
            method.line_table.push(LineEntry {
                index,
                line: line as i32,
            });
        }
    }
    method.insns = decoded.insns;
    Ok(method)
}

/// Decode a classfile into the structured representation.
pub fn decode_class(bytes: &[u8]) -> Result<ClassDef, DecodeError> {
    let mut r = Reader::new(bytes);
    if r.u32()? != MAGIC {
        return Err(DecodeError::new("bad magic number"));
    }
    let _minor = r.u16()?;
    let _major = r.u16()?;
    let pool = parse_constant_pool(&mut r)?;

    let _access = r.u16()?;
    let this_class = r.u16()?;
    let _super_class = r.u16()?;
    let interface_count = r.u16()? as usize;
    r.skip(interface_count * 2)?;

    let field_count = r.u16()?;
    for _ in 0..field_count {
        r.skip(6)?;
        skip_attributes(&mut r)?;
    }

    let method_count = r.u16()?;
    let mut methods = Vec::with_capacity(method_count as usize);
    for _ in 0..method_count {
        methods.push(parse_method(&mut r, &pool)?);
    }
    skip_attributes(&mut r)?;

    Ok(ClassDef {
        name: class_name(&pool, this_class)?.to_string(),
        methods,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use classflow_core::ir::{ConstValue, InsnKind};

    /// Byte-level builder for minimal classfiles.
    struct ClassBytes {
        out: Vec<u8>,
    }

    impl ClassBytes {
        fn new() -> Self {
            Self { out: Vec::new() }
        }

        fn u8(&mut self, v: u8) -> &mut Self {
            self.out.push(v);
            self
        }

        fn u16(&mut self, v: u16) -> &mut Self {
            self.out.extend_from_slice(&v.to_be_bytes());
            self
        }

        fn u32(&mut self, v: u32) -> &mut Self {
            self.out.extend_from_slice(&v.to_be_bytes());
            self
        }

        fn raw(&mut self, bytes: &[u8]) -> &mut Self {
            self.out.extend_from_slice(bytes);
            self
        }

        fn utf8(&mut self, s: &str) -> &mut Self {
            self.u8(1).u16(s.len() as u16).raw(s.as_bytes())
        }
    }

    /// One public class `pkg/Demo` with a single static method `run()I`
    /// whose body is `iconst_1; ireturn`, line table mapping pc 0 to 42.
    fn minimal_class() -> Vec<u8> {
        let mut b = ClassBytes::new();
        b.u32(0xCAFE_BABE).u16(0).u16(52);
        b.u16(9); // constant pool count (8 entries)
        b.utf8("pkg/Demo"); // 1
        b.u8(7).u16(1); // 2 Class -> #1
        b.utf8("java/lang/Object"); // 3
        b.u8(7).u16(3); // 4 Class -> #3
        b.utf8("run"); // 5
        b.utf8("()I"); // 6
        b.utf8("Code"); // 7
        b.utf8("LineNumberTable"); // 8
        b.u16(0x0021); // access: public super
        b.u16(2).u16(4); // this, super
        b.u16(0); // interfaces
        b.u16(0); // fields
        b.u16(1); // methods
        b.u16(0x0009).u16(5).u16(6); // public static, name, descriptor
        b.u16(1); // one attribute
        b.u16(7).u32(26); // Code, attribute length
        b.u16(1).u16(0); // max_stack, max_locals
        b.u32(2).raw(&[0x04, 0xac]); // iconst_1; ireturn
        b.u16(0); // no exception handlers
        b.u16(1); // one code attribute
        b.u16(8).u32(6); // LineNumberTable, length
        b.u16(1).u16(0).u16(42); // one entry: pc 0 -> line 42
        b.u16(0); // class attributes
        b.out
    }

    #[test]
    fn test_decode_minimal_class() {
        let class = decode_class(&minimal_class()).unwrap();
        assert_eq!(class.name, "pkg/Demo");
        assert_eq!(class.methods.len(), 1);
        let method = &class.methods[0];
        assert_eq!(method.name, "run");
        assert_eq!(method.descriptor, "()I");
        assert!(method.is_static);
        assert_eq!(method.max_locals, 0);
        assert_eq!(
            method.insns.iter().map(|i| &i.kind).collect::<Vec<_>>(),
            vec![&InsnKind::Const(ConstValue::Int(1)), &InsnKind::Return]
        );
        assert_eq!(method.line_table.len(), 1);
        assert_eq!(method.line_table[0].index, 0);
        assert_eq!(method.line_table[0].line, 42);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let err = decode_class(&[0u8; 16]).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_truncated_class_rejected() {
        let bytes = minimal_class();
        assert!(decode_class(&bytes[..bytes.len() - 6]).is_err());
    }

    #[test]
    fn test_constant_pool_long_takes_two_slots() {
        let mut b = ClassBytes::new();
        b.u32(0xCAFE_BABE).u16(0).u16(52);
        b.u16(5); // 4 entries: long (2 slots), utf8, class
        b.u8(5).u32(0).u32(7); // 1-2: Long(7)
        b.utf8("pkg/L"); // 3
        b.u8(7).u16(3); // 4 Class -> #3
        b.u16(0x0021).u16(4).u16(0).u16(0).u16(0).u16(0).u16(0);
        let class = decode_class(&b.out).unwrap();
        assert_eq!(class.name, "pkg/L");
        assert!(class.methods.is_empty());
    }

    #[test]
    fn test_method_without_code_has_no_instructions() {
        // Same as the minimal class but with the Code attribute replaced by
        // an unknown one the parser skips.
        let mut b = ClassBytes::new();
        b.u32(0xCAFE_BABE).u16(0).u16(52);
        b.u16(7);
        b.utf8("pkg/Abs"); // 1
        b.u8(7).u16(1); // 2
        b.utf8("java/lang/Object"); // 3
        b.u8(7).u16(3); // 4
        b.utf8("run"); // 5
        b.utf8("()V"); // 6
        b.u16(0x0421); // abstract
        b.u16(2).u16(4).u16(0).u16(0);
        b.u16(1);
        b.u16(0x0401).u16(5).u16(6).u16(0); // abstract method, no attributes
        b.u16(0);
        let class = decode_class(&b.out).unwrap();
        assert!(class.methods[0].insns.is_empty());
    }
}
