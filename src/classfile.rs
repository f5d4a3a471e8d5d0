//! Offset-oriented class-file decoder.
//!
//! Unlike a general-purpose parser, this decoder keeps the original byte
//! buffer around and records *offsets* into it: the planner re-reads method
//! bodies many times during a profiling session, and the bytecode editor
//! splices probes into `method_info` blobs in place, so materializing every
//! attribute into owned structures would be wasted work. Only the constant
//! pool is fully decoded; the method table is a vector of offsets plus the
//! few fields (name, signature, access flags) the planner matches on.

use std::fmt;

/// Access flag bits the planner cares about.
pub mod access_flags {
    pub const ACC_PUBLIC: u16 = 0x0001;
    pub const ACC_STATIC: u16 = 0x0008;
    pub const ACC_NATIVE: u16 = 0x0100;
    pub const ACC_INTERFACE: u16 = 0x0200;
    pub const ACC_ABSTRACT: u16 = 0x0400;
}

/// A tagged constant-pool entry.
#[derive(Debug, Clone)]
pub enum CpEntry {
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

/// The constant pool as found in the original class file.
///
/// Index 0 and the slots shadowed by `Long`/`Double` entries are `None`,
/// exactly as the class-file format numbers them.
#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<Option<CpEntry>>,
}

impl ConstantPool {
    pub fn get(&self, index: u16) -> Option<&CpEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize).and_then(|e| e.as_ref())
    }

    pub fn utf8(&self, index: u16) -> Option<&str> {
        match self.get(index)? {
            CpEntry::Utf8(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Name of the class referenced by a `Class` entry at `index`.
    pub fn class_name(&self, index: u16) -> Option<&str> {
        match self.get(index)? {
            CpEntry::Class { name_index } => self.utf8(*name_index),
            _ => None,
        }
    }

    /// Index of the first `Class` entry naming `name`, if any.
    pub fn index_of_class(&self, name: &str) -> Option<u16> {
        for (i, entry) in self.entries.iter().enumerate() {
            if let Some(CpEntry::Class { name_index }) = entry {
                if self.utf8(*name_index) == Some(name) {
                    return Some(i as u16);
                }
            }
        }
        None
    }

    /// Index of the first `Utf8` entry equal to `s`, if any.
    pub fn index_of_utf8(&self, s: &str) -> Option<u16> {
        for (i, entry) in self.entries.iter().enumerate() {
            if let Some(CpEntry::Utf8(v)) = entry {
                if v == s {
                    return Some(i as u16);
                }
            }
        }
        None
    }

    /// The entry count as written in the class-file header.
    pub fn entry_count(&self) -> u16 {
        self.entries.len() as u16
    }
}

/// One row of the method table: identity plus offsets into the file bytes.
///
/// `bc_off` and `exc_table_off` are relative to the start of the
/// `method_info`, so they stay valid when accessors are routed to a
/// rewritten copy of the blob whose header layout the editor preserves.
#[derive(Debug, Clone)]
pub struct MethodEntry {
    pub name: String,
    pub signature: String,
    pub access_flags: u16,
    /// Absolute offset of this `method_info` in the original file.
    pub info_off: usize,
    pub info_len: usize,
    /// Offset of the bytecode inside the `method_info`; 0 when there is no
    /// `Code` attribute (native and abstract methods).
    pub bc_off: usize,
    pub bc_len: usize,
    /// Offset of the `exception_table_length` field inside the
    /// `method_info`; 0 when there is no `Code` attribute.
    pub exc_table_off: usize,
}

/// Everything the decoder extracts from one class file.
#[derive(Debug)]
pub struct ParsedClass {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub this_name: String,
    pub super_name: Option<String>,
    pub interface_names: Vec<String>,
    pub methods: Vec<MethodEntry>,
    /// CP index of the `LocalVariableTable` attribute name (0 = absent).
    pub lvt_name_index: u16,
    /// CP index of the `LocalVariableTypeTable` attribute name (0 = absent).
    pub lvtt_name_index: u16,
    /// CP index of the `StackMapTable` attribute name (0 = absent).
    pub smt_name_index: u16,
}

#[derive(Debug)]
pub enum ClassParseError {
    UnexpectedEof { offset: usize },
    BadMagic { magic: u32 },
    UnknownCpTag { tag: u8, offset: usize },
    BadCpIndex { index: u16, offset: usize },
    AttributeOverflow { offset: usize },
    /// The class file names a different class than the one the repository
    /// expected to find at this location.
    NameMismatch { expected: String, found: String },
}

impl fmt::Display for ClassParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassParseError::UnexpectedEof { offset } => {
                write!(f, "unexpected end of class file at offset {offset}")
            }
            ClassParseError::BadMagic { magic } => write!(f, "bad magic: {magic:#x}"),
            ClassParseError::UnknownCpTag { tag, offset } => {
                write!(f, "unknown constant pool tag {tag} at offset {offset}")
            }
            ClassParseError::BadCpIndex { index, offset } => {
                write!(f, "bad constant pool index {index} at offset {offset}")
            }
            ClassParseError::AttributeOverflow { offset } => {
                write!(f, "attribute length overflows enclosing structure at offset {offset}")
            }
            ClassParseError::NameMismatch { expected, found } => write!(
                f,
                "class file names {found} but was loaded for {expected}; \
                 the class path setting may be incorrect"
            ),
        }
    }
}

impl std::error::Error for ClassParseError {}

/// Big-endian u16 at `pos`. Offsets come from the decoder and are in bounds.
pub(crate) fn get_u2(bytes: &[u8], pos: usize) -> usize {
    ((bytes[pos] as usize) << 8) | (bytes[pos + 1] as usize)
}

/// Big-endian u32 at `pos`.
pub(crate) fn get_u4(bytes: &[u8], pos: usize) -> usize {
    ((bytes[pos] as usize) << 24)
        | ((bytes[pos + 1] as usize) << 16)
        | ((bytes[pos + 2] as usize) << 8)
        | (bytes[pos + 3] as usize)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn eof(&self) -> ClassParseError {
        ClassParseError::UnexpectedEof { offset: self.pos }
    }

    fn read_u1(&mut self) -> Result<u8, ClassParseError> {
        if self.remaining() < 1 {
            return Err(self.eof());
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u2(&mut self) -> Result<u16, ClassParseError> {
        if self.remaining() < 2 {
            return Err(self.eof());
        }
        let v = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn read_u4(&mut self) -> Result<u32, ClassParseError> {
        if self.remaining() < 4 {
            return Err(self.eof());
        }
        let v = u32::from_be_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ClassParseError> {
        if self.remaining() < len {
            return Err(self.eof());
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<(), ClassParseError> {
        if self.remaining() < len {
            return Err(self.eof());
        }
        self.pos += len;
        Ok(())
    }
}

/// Parse `bytes` as a class file expected to define `expected_name`
/// (slash form).
pub fn parse(expected_name: &str, bytes: &[u8]) -> Result<ParsedClass, ClassParseError> {
    let mut r = Reader::new(bytes);

    let magic = r.read_u4()?;
    if magic != 0xCAFEBABE {
        return Err(ClassParseError::BadMagic { magic });
    }
    let minor_version = r.read_u2()?;
    let major_version = r.read_u2()?;

    let constant_pool = parse_constant_pool(&mut r)?;

    let access_flags = r.read_u2()?;
    let this_class = r.read_u2()?;
    let super_class = r.read_u2()?;

    let this_name = constant_pool
        .class_name(this_class)
        .ok_or(ClassParseError::BadCpIndex { index: this_class, offset: r.pos() })?
        .to_string();
    let super_name = if super_class == 0 {
        None
    } else {
        Some(
            constant_pool
                .class_name(super_class)
                .ok_or(ClassParseError::BadCpIndex { index: super_class, offset: r.pos() })?
                .to_string(),
        )
    };

    let interfaces_count = r.read_u2()? as usize;
    let mut interface_names = Vec::with_capacity(interfaces_count);
    for _ in 0..interfaces_count {
        let idx = r.read_u2()?;
        let name = constant_pool
            .class_name(idx)
            .ok_or(ClassParseError::BadCpIndex { index: idx, offset: r.pos() })?;
        interface_names.push(name.to_string());
    }

    let fields_count = r.read_u2()? as usize;
    for _ in 0..fields_count {
        r.skip(6)?; // access_flags, name_index, descriptor_index
        skip_attributes(&mut r)?;
    }

    let methods_count = r.read_u2()? as usize;
    let mut methods = Vec::with_capacity(methods_count);
    for _ in 0..methods_count {
        methods.push(parse_method(&mut r, &constant_pool)?);
    }

    skip_attributes(&mut r)?;

    if this_name != expected_name {
        return Err(ClassParseError::NameMismatch {
            expected: expected_name.to_string(),
            found: this_name,
        });
    }

    let lvt_name_index = constant_pool.index_of_utf8("LocalVariableTable").unwrap_or(0);
    let lvtt_name_index = constant_pool.index_of_utf8("LocalVariableTypeTable").unwrap_or(0);
    let smt_name_index = constant_pool.index_of_utf8("StackMapTable").unwrap_or(0);

    Ok(ParsedClass {
        minor_version,
        major_version,
        constant_pool,
        access_flags,
        this_class,
        this_name,
        super_name,
        interface_names,
        methods,
        lvt_name_index,
        lvtt_name_index,
        smt_name_index,
    })
}

fn parse_constant_pool(r: &mut Reader) -> Result<ConstantPool, ClassParseError> {
    let count = r.read_u2()? as usize;
    let mut entries: Vec<Option<CpEntry>> = Vec::with_capacity(count);
    entries.push(None); // index 0 is unused

    let mut i = 1;
    while i < count {
        let tag_offset = r.pos();
        let tag = r.read_u1()?;
        let entry = match tag {
            1 => {
                let len = r.read_u2()? as usize;
                let bytes = r.read_bytes(len)?;
                CpEntry::Utf8(String::from_utf8_lossy(bytes).to_string())
            }
            3 => CpEntry::Integer(r.read_u4()? as i32),
            4 => CpEntry::Float(f32::from_bits(r.read_u4()?)),
            5 => {
                let high = r.read_u4()? as u64;
                let low = r.read_u4()? as u64;
                entries.push(Some(CpEntry::Long(((high << 32) | low) as i64)));
                entries.push(None);
                i += 2;
                continue;
            }
            6 => {
                let high = r.read_u4()? as u64;
                let low = r.read_u4()? as u64;
                entries.push(Some(CpEntry::Double(f64::from_bits((high << 32) | low))));
                entries.push(None);
                i += 2;
                continue;
            }
            7 => CpEntry::Class { name_index: r.read_u2()? },
            8 => CpEntry::String { string_index: r.read_u2()? },
            9 => CpEntry::Fieldref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            10 => CpEntry::Methodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            11 => CpEntry::InterfaceMethodref {
                class_index: r.read_u2()?,
                name_and_type_index: r.read_u2()?,
            },
            12 => CpEntry::NameAndType { name_index: r.read_u2()?, descriptor_index: r.read_u2()? },
            15 => {
                CpEntry::MethodHandle { reference_kind: r.read_u1()?, reference_index: r.read_u2()? }
            }
            16 => CpEntry::MethodType { descriptor_index: r.read_u2()? },
            17 => CpEntry::Dynamic {
                bootstrap_method_attr_index: r.read_u2()?,
                name_and_type_index: r.read_u2()?,
            },
            18 => CpEntry::InvokeDynamic {
                bootstrap_method_attr_index: r.read_u2()?,
                name_and_type_index: r.read_u2()?,
            },
            19 => CpEntry::Module { name_index: r.read_u2()? },
            20 => CpEntry::Package { name_index: r.read_u2()? },
            _ => return Err(ClassParseError::UnknownCpTag { tag, offset: tag_offset }),
        };

        entries.push(Some(entry));
        i += 1;
    }

    Ok(ConstantPool { entries })
}

fn parse_method(r: &mut Reader, cp: &ConstantPool) -> Result<MethodEntry, ClassParseError> {
    let info_off = r.pos();

    let access_flags = r.read_u2()?;
    let name_index = r.read_u2()?;
    let descriptor_index = r.read_u2()?;
    let name = cp
        .utf8(name_index)
        .ok_or(ClassParseError::BadCpIndex { index: name_index, offset: r.pos() })?
        .to_string();
    let signature = cp
        .utf8(descriptor_index)
        .ok_or(ClassParseError::BadCpIndex { index: descriptor_index, offset: r.pos() })?
        .to_string();

    let mut bc_off = 0;
    let mut bc_len = 0;
    let mut exc_table_off = 0;

    let attr_count = r.read_u2()? as usize;
    for _ in 0..attr_count {
        let attr_name_index = r.read_u2()?;
        let attr_len = r.read_u4()? as usize;
        let attr_start = r.pos();
        let attr_end = attr_start + attr_len;

        if cp.utf8(attr_name_index) == Some("Code") {
            r.skip(4)?; // max_stack, max_locals
            let code_len = r.read_u4()? as usize;
            bc_off = r.pos() - info_off;
            bc_len = code_len;
            r.skip(code_len)?;
            exc_table_off = r.pos() - info_off;
            let exc_count = r.read_u2()? as usize;
            r.skip(exc_count * 8)?;
            // Sub-attributes are located lazily on demand; just bounds-check.
            if r.pos() > attr_end || attr_end > r.data.len() {
                return Err(ClassParseError::AttributeOverflow { offset: attr_start });
            }
            r.pos = attr_end;
        } else {
            r.skip(attr_len)
                .map_err(|_| ClassParseError::AttributeOverflow { offset: attr_start })?;
        }
    }

    Ok(MethodEntry {
        name,
        signature,
        access_flags,
        info_off,
        info_len: r.pos() - info_off,
        bc_off,
        bc_len,
        exc_table_off,
    })
}

fn skip_attributes(r: &mut Reader) -> Result<(), ClassParseError> {
    let count = r.read_u2()? as usize;
    for _ in 0..count {
        r.skip(2)?; // attribute_name_index
        let len = r.read_u4()? as usize;
        let offset = r.pos();
        r.skip(len).map_err(|_| ClassParseError::AttributeOverflow { offset })?;
    }
    Ok(())
}
