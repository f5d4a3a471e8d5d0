//! Shared fixtures: a byte-level class-file builder, a map-backed bytes
//! provider, and mock editors.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io;

use probeplan::{
    BytecodeEditor, ClassBytesProvider, ClassRecord, EditedMethod, EditorVeto, InjKind, Planner,
    PlannerSettings,
};

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_ABSTRACT: u16 = 0x0400;

pub const RETURN: u8 = 0xb1;

pub fn u1(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn u2(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn u4(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn push_attr(out: &mut Vec<u8>, name_index: u16, info: &[u8]) {
    u2(out, name_index);
    u4(out, info.len() as u32);
    out.extend_from_slice(info);
}

pub struct CpBuilder {
    pub entries: Vec<Vec<u8>>,
}

impl CpBuilder {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, entry: Vec<u8>) -> u16 {
        self.entries.push(entry);
        self.entries.len() as u16
    }

    pub fn utf8(&mut self, s: &str) -> u16 {
        let mut entry = Vec::new();
        entry.push(1);
        entry.extend_from_slice(&(s.len() as u16).to_be_bytes());
        entry.extend_from_slice(s.as_bytes());
        self.push(entry)
    }

    pub fn class(&mut self, name_index: u16) -> u16 {
        let mut entry = Vec::new();
        entry.push(7);
        entry.extend_from_slice(&name_index.to_be_bytes());
        self.push(entry)
    }

    pub fn class_named(&mut self, name: &str) -> u16 {
        let utf = self.utf8(name);
        self.class(utf)
    }

    pub fn count(&self) -> u16 {
        (self.entries.len() + 1) as u16
    }
}

pub struct MethodSpec {
    pub name: String,
    pub signature: String,
    pub access_flags: u16,
    pub code: Option<Vec<u8>>,
    pub with_lvt: bool,
    pub with_lvtt: bool,
    pub with_smt: bool,
}

pub struct ClassBuilder {
    name: String,
    super_name: Option<String>,
    interfaces: Vec<String>,
    access_flags: u16,
    major_version: u16,
    fields: Vec<(String, String)>,
    methods: Vec<MethodSpec>,
    with_throwable_cp: bool,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            super_name: Some("java/lang/Object".to_string()),
            interfaces: Vec::new(),
            access_flags: ACC_PUBLIC | ACC_SUPER,
            major_version: 52,
            fields: Vec::new(),
            methods: Vec::new(),
            with_throwable_cp: false,
        }
    }

    pub fn super_class(mut self, name: &str) -> Self {
        self.super_name = Some(name.to_string());
        self
    }

    pub fn no_super_class(mut self) -> Self {
        self.super_name = None;
        self
    }

    pub fn interface(mut self) -> Self {
        self.access_flags = ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT;
        self
    }

    pub fn implements(mut self, name: &str) -> Self {
        self.interfaces.push(name.to_string());
        self
    }

    pub fn major_version(mut self, v: u16) -> Self {
        self.major_version = v;
        self
    }

    pub fn field(mut self, name: &str, descriptor: &str) -> Self {
        self.fields.push((name.to_string(), descriptor.to_string()));
        self
    }

    pub fn with_throwable_cp(mut self) -> Self {
        self.with_throwable_cp = true;
        self
    }

    pub fn method(self, name: &str, signature: &str, access_flags: u16, code: &[u8]) -> Self {
        self.method_spec(MethodSpec {
            name: name.to_string(),
            signature: signature.to_string(),
            access_flags,
            code: Some(code.to_vec()),
            with_lvt: false,
            with_lvtt: false,
            with_smt: false,
        })
    }

    /// A method with no `Code` attribute (native or abstract).
    pub fn method_no_code(self, name: &str, signature: &str, access_flags: u16) -> Self {
        self.method_spec(MethodSpec {
            name: name.to_string(),
            signature: signature.to_string(),
            access_flags,
            code: None,
            with_lvt: false,
            with_lvtt: false,
            with_smt: false,
        })
    }

    /// A method whose `Code` attribute carries LVT, LVTT and StackMapTable
    /// sub-attributes.
    pub fn method_with_tables(
        self,
        name: &str,
        signature: &str,
        access_flags: u16,
        code: &[u8],
    ) -> Self {
        self.method_spec(MethodSpec {
            name: name.to_string(),
            signature: signature.to_string(),
            access_flags,
            code: Some(code.to_vec()),
            with_lvt: true,
            with_lvtt: true,
            with_smt: true,
        })
    }

    pub fn method_spec(mut self, spec: MethodSpec) -> Self {
        self.methods.push(spec);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut cp = CpBuilder::new();

        let utf_this = cp.utf8(&self.name);
        let class_this = cp.class(utf_this);
        let class_super = match &self.super_name {
            Some(name) => cp.class_named(name),
            None => 0,
        };
        let class_interfaces: Vec<u16> =
            self.interfaces.iter().map(|name| cp.class_named(name)).collect();

        let has_code = self.methods.iter().any(|m| m.code.is_some());
        let utf_code = if has_code { cp.utf8("Code") } else { 0 };
        let utf_lvt = if self.methods.iter().any(|m| m.with_lvt) {
            cp.utf8("LocalVariableTable")
        } else {
            0
        };
        let utf_lvtt = if self.methods.iter().any(|m| m.with_lvtt) {
            cp.utf8("LocalVariableTypeTable")
        } else {
            0
        };
        let utf_smt = if self.methods.iter().any(|m| m.with_smt) {
            cp.utf8("StackMapTable")
        } else {
            0
        };
        let needs_locals = self.methods.iter().any(|m| m.with_lvt || m.with_lvtt);
        let (utf_local_name, utf_local_desc) = if needs_locals {
            (cp.utf8("this"), cp.utf8("I"))
        } else {
            (0, 0)
        };
        if self.with_throwable_cp {
            cp.class_named("java/lang/Throwable");
        }

        let method_refs: Vec<(u16, u16)> = self
            .methods
            .iter()
            .map(|m| (cp.utf8(&m.name), cp.utf8(&m.signature)))
            .collect();
        let field_refs: Vec<(u16, u16)> = self
            .fields
            .iter()
            .map(|(name, desc)| (cp.utf8(name), cp.utf8(desc)))
            .collect();

        let mut bytes = Vec::new();
        u4(&mut bytes, 0xCAFEBABE);
        u2(&mut bytes, 0);
        u2(&mut bytes, self.major_version);
        u2(&mut bytes, cp.count());
        for entry in &cp.entries {
            bytes.extend_from_slice(entry);
        }

        u2(&mut bytes, self.access_flags);
        u2(&mut bytes, class_this);
        u2(&mut bytes, class_super);

        u2(&mut bytes, class_interfaces.len() as u16);
        for idx in &class_interfaces {
            u2(&mut bytes, *idx);
        }

        u2(&mut bytes, self.fields.len() as u16);
        for (name_idx, desc_idx) in &field_refs {
            u2(&mut bytes, ACC_PRIVATE);
            u2(&mut bytes, *name_idx);
            u2(&mut bytes, *desc_idx);
            u2(&mut bytes, 0); // no field attributes
        }

        u2(&mut bytes, self.methods.len() as u16);
        for (spec, (name_idx, desc_idx)) in self.methods.iter().zip(&method_refs) {
            u2(&mut bytes, spec.access_flags);
            u2(&mut bytes, *name_idx);
            u2(&mut bytes, *desc_idx);
            match &spec.code {
                None => u2(&mut bytes, 0),
                Some(code) => {
                    u2(&mut bytes, 1);
                    let mut payload = Vec::new();
                    u2(&mut payload, 2); // max_stack
                    u2(&mut payload, 2); // max_locals
                    u4(&mut payload, code.len() as u32);
                    payload.extend_from_slice(code);
                    u2(&mut payload, 0); // exception_table_length

                    let mut subs = Vec::new();
                    let mut n_subs = 0u16;
                    if spec.with_lvt {
                        let mut lvt = Vec::new();
                        u2(&mut lvt, 1);
                        u2(&mut lvt, 0);
                        u2(&mut lvt, code.len() as u16);
                        u2(&mut lvt, utf_local_name);
                        u2(&mut lvt, utf_local_desc);
                        u2(&mut lvt, 0);
                        push_attr(&mut subs, utf_lvt, &lvt);
                        n_subs += 1;
                    }
                    if spec.with_lvtt {
                        let mut lvtt = Vec::new();
                        u2(&mut lvtt, 1);
                        u2(&mut lvtt, 0);
                        u2(&mut lvtt, code.len() as u16);
                        u2(&mut lvtt, utf_local_name);
                        u2(&mut lvtt, utf_local_desc);
                        u2(&mut lvtt, 0);
                        push_attr(&mut subs, utf_lvtt, &lvtt);
                        n_subs += 1;
                    }
                    if spec.with_smt {
                        let mut smt = Vec::new();
                        u2(&mut smt, 1);
                        u1(&mut smt, 0); // same_frame
                        push_attr(&mut subs, utf_smt, &smt);
                        n_subs += 1;
                    }

                    u2(&mut payload, n_subs);
                    payload.extend_from_slice(&subs);
                    push_attr(&mut bytes, utf_code, &payload);
                }
            }
        }

        u2(&mut bytes, 0); // no class attributes

        bytes
    }
}

/// Provider over a name -> bytes map.
#[derive(Default)]
pub struct MapProvider {
    classes: HashMap<String, Vec<u8>>,
}

impl MapProvider {
    pub fn insert(&mut self, name: &str, bytes: Vec<u8>) {
        self.classes.insert(name.to_string(), bytes);
    }
}

impl ClassBytesProvider for MapProvider {
    fn fetch(&mut self, name: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.classes.get(name).cloned())
    }
}

/// Editor that prepends `probe` bytes to the bytecode and fixes up the
/// `Code` attribute and `code_length` fields, leaving every other offset
/// in the `method_info` header layout intact.
pub struct ProbeEditor {
    pub probe: Vec<u8>,
    /// CP entries "appended" the first time each kind touches a class.
    pub cp_block: u16,
}

impl Default for ProbeEditor {
    fn default() -> Self {
        Self { probe: vec![0x00, 0x00], cp_block: 3 }
    }
}

fn patch_u4_add(bytes: &mut [u8], pos: usize, add: u32) {
    let v = u32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]) + add;
    bytes[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
}

impl BytecodeEditor for ProbeEditor {
    fn instrument(
        &mut self,
        class: &mut ClassRecord,
        method_idx: usize,
        kind: InjKind,
        _method_id: u16,
    ) -> Result<EditedMethod, EditorVeto> {
        let bc_off = class.method_bytecode_offset(method_idx);
        if bc_off == 0 {
            return Err(EditorVeto { reason: "method has no code".to_string() });
        }
        let mut info = class.orig_method_info(method_idx).to_vec();
        let grow = self.probe.len() as u32;
        patch_u4_add(&mut info, bc_off - 12, grow); // Code attribute_length
        patch_u4_add(&mut info, bc_off - 4, grow); // code_length
        info.splice(bc_off..bc_off, self.probe.iter().copied());

        let appended = if class.base_cp_count(kind) < 0 { self.cp_block } else { 0 };
        Ok(EditedMethod { method_info: info, appended_cp_entries: appended })
    }
}

/// Editor that refuses every method.
pub struct VetoEditor;

impl BytecodeEditor for VetoEditor {
    fn instrument(
        &mut self,
        _class: &mut ClassRecord,
        _method_idx: usize,
        _kind: InjKind,
        _method_id: u16,
    ) -> Result<EditedMethod, EditorVeto> {
        Err(EditorVeto { reason: "refused".to_string() })
    }
}

pub fn object_class() -> Vec<u8> {
    ClassBuilder::new("java/lang/Object")
        .no_super_class()
        .method("<init>", "()V", ACC_PUBLIC, &[RETURN])
        .method("toString", "()Ljava/lang/String;", ACC_PUBLIC, &[0x01, 0xb0])
        .build()
}

pub fn runnable_interface() -> Vec<u8> {
    ClassBuilder::new("java/lang/Runnable")
        .interface()
        .method_no_code("run", "()V", ACC_PUBLIC | ACC_ABSTRACT)
        .build()
}

pub fn thread_class() -> Vec<u8> {
    ClassBuilder::new("java/lang/Thread")
        .implements("java/lang/Runnable")
        .method("<init>", "()V", ACC_PUBLIC, &[RETURN])
        .method("run", "()V", ACC_PUBLIC, &[0x00, RETURN])
        .build()
}

pub fn class_loader_class() -> Vec<u8> {
    ClassBuilder::new("java/lang/ClassLoader")
        .method(
            "loadClass",
            "(Ljava/lang/String;)Ljava/lang/Class;",
            ACC_PUBLIC,
            &[0x01, 0xb0],
        )
        .build()
}

/// Planner over a map provider and a probe editor, pre-seeded with the
/// bootstrap classes every test needs.
pub fn planner_with(classes: &[(&str, Vec<u8>)], settings: PlannerSettings) -> Planner {
    planner_with_editor(classes, settings, Box::new(ProbeEditor::default()))
}

pub fn planner_with_editor(
    classes: &[(&str, Vec<u8>)],
    settings: PlannerSettings,
    editor: Box<dyn BytecodeEditor>,
) -> Planner {
    let mut provider = MapProvider::default();
    provider.insert("java/lang/Object", object_class());
    provider.insert("java/lang/Runnable", runnable_interface());
    for (name, bytes) in classes {
        provider.insert(name, bytes.clone());
    }
    Planner::new(Box::new(provider), editor, settings)
}
