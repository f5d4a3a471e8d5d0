//! Per-class instrumentation state.
//!
//! A [`ClassRecord`] is the planner's view of one `(class, loader)` pair:
//! the parsed skeleton of the class file, the scan/instrumentation state of
//! every method, the saved rewritten `method_info` blobs, and the
//! constant-pool growth bookkeeping the bytecode editor shares. Records are
//! created once per class and mutated for the rest of the session.

use std::sync::Arc;

use crate::classfile::{access_flags, get_u2, get_u4, ConstantPool, MethodEntry, ParsedClass};
use crate::repository::ClassId;
use crate::stackmap::StackMapTables;

/// Slash-form name of the class every super chain terminates at.
pub const OBJECT_SLASHED_CLASS_NAME: &str = "java/lang/Object";

const THROWABLE_SLASHED_CLASS_NAME: &str = "java/lang/Throwable";
const CONSTRUCTOR_NAME: &str = "<init>";

/// Per-method scan-state bits.
///
/// The layout is shared with the bytecode editor, which reads the same
/// words when it regenerates probes; do not renumber.
pub mod scan_flags {
    pub const REACHABLE: u16 = 1;
    pub const UNSCANNABLE: u16 = 2;
    pub const SCANNED: u16 = 4;
    pub const INSTRUMENTED: u16 = 8;
    pub const LEAF: u16 = 16;
    pub const VIRTUAL: u16 = 32;
    pub const ROOT: u16 = 64;
    pub const SPECIAL: u16 = 128;
    pub const MARKER: u16 = 256;
}

/// Probe injection categories. Each kind owns one slot of the per-class
/// base constant-pool counts, so the editor can append its CP block once
/// per class and reuse it for every method of that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjKind {
    RecursiveNormalMethod = 0,
    RecursiveRootMethod = 1,
    RecursiveMarkerMethod = 2,
    CodeRegion = 3,
    StackMap = 4,
    Throwable = 5,
}

/// Number of injection kinds; sizes the base-count table.
pub const INJ_MAXNUMBER: usize = 6;

impl InjKind {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// One `(internal name, loader id)` class and all its profiling state.
#[derive(Debug)]
pub struct ClassRecord {
    name: Arc<str>,
    loader_id: u32,
    file_bytes: Vec<u8>,

    minor_version: u16,
    major_version: u16,
    access_flags: u16,
    this_class_cp_index: u16,
    super_name: Option<String>,
    interface_names: Vec<String>,
    constant_pool: ConstantPool,
    orig_cp_count: u16,
    methods: Vec<MethodEntry>,

    // Resolved supertype graph; filled in lazily as referenced classes
    // become available.
    super_ref: Option<ClassId>,
    interfaces_ref: Vec<Option<ClassId>>,
    subclasses: Option<Vec<ClassId>>,

    scan_bits: Vec<u16>,
    instr_ids: Vec<u16>,

    // Rewritten method_info blobs; when a slot is present, every offset
    // accessor for that method routes here instead of `file_bytes`.
    modified_infos: Vec<Option<Vec<u8>>>,
    mod_bc_len: Vec<usize>,
    mod_lvt_off: Vec<usize>,
    mod_lvtt_off: Vec<usize>,
    mod_smt_off: Vec<usize>,

    // Lazy caches for the original file; 0 = not yet computed.
    orig_lvt_off: Vec<usize>,
    orig_lvtt_off: Vec<usize>,
    orig_smt_off: Vec<usize>,

    lvt_cp_index: u16,
    lvtt_cp_index: u16,
    smt_cp_index: u16,
    throwable_cp_index: u16,

    current_cp_count: u16,
    base_cp_count: [i32; INJ_MAXNUMBER],

    loaded: bool,
    all_methods_markers: bool,
    all_methods_roots: bool,
    has_uninstrumented_marker_methods: bool,
    has_uninstrumented_root_methods: bool,
    has_method_reachable: bool,
    servlet_do_scanned: bool,

    n_instrumented_methods: usize,

    stack_maps: StackMapTables,
}

impl ClassRecord {
    pub(crate) fn from_parsed(
        name: Arc<str>,
        loader_id: u32,
        file_bytes: Vec<u8>,
        parsed: ParsedClass,
    ) -> Self {
        let m = parsed.methods.len();
        let orig_cp_count = parsed.constant_pool.entry_count();
        Self {
            name,
            loader_id,
            file_bytes,
            minor_version: parsed.minor_version,
            major_version: parsed.major_version,
            access_flags: parsed.access_flags,
            this_class_cp_index: parsed.this_class,
            super_name: parsed.super_name,
            interfaces_ref: vec![None; parsed.interface_names.len()],
            interface_names: parsed.interface_names,
            constant_pool: parsed.constant_pool,
            orig_cp_count,
            methods: parsed.methods,
            super_ref: None,
            subclasses: None,
            scan_bits: vec![0; m],
            instr_ids: vec![0; m],
            modified_infos: vec![None; m],
            mod_bc_len: Vec::new(),
            mod_lvt_off: Vec::new(),
            mod_lvtt_off: Vec::new(),
            mod_smt_off: Vec::new(),
            orig_lvt_off: vec![0; m],
            orig_lvtt_off: vec![0; m],
            orig_smt_off: vec![0; m],
            lvt_cp_index: parsed.lvt_name_index,
            lvtt_cp_index: parsed.lvtt_name_index,
            smt_cp_index: parsed.smt_name_index,
            throwable_cp_index: 0,
            current_cp_count: orig_cp_count,
            base_cp_count: [-1; INJ_MAXNUMBER],
            loaded: false,
            all_methods_markers: false,
            all_methods_roots: false,
            has_uninstrumented_marker_methods: false,
            has_uninstrumented_root_methods: false,
            has_method_reachable: false,
            servlet_do_scanned: false,
            n_instrumented_methods: 0,
            stack_maps: StackMapTables::new(m),
        }
    }

    // ---------------------------------------------------------------- identity

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_handle(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub fn loader_id(&self) -> u32 {
        self.loader_id
    }

    pub fn major_version(&self) -> u16 {
        self.major_version
    }

    pub fn minor_version(&self) -> u16 {
        self.minor_version
    }

    pub fn access_flags(&self) -> u16 {
        self.access_flags
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & access_flags::ACC_INTERFACE != 0
    }

    /// CP index of this class's own `Class` entry.
    pub fn class_cp_index(&self) -> u16 {
        self.this_class_cp_index
    }

    pub fn constant_pool(&self) -> &ConstantPool {
        &self.constant_pool
    }

    pub fn super_name(&self) -> Option<&str> {
        self.super_name.as_deref()
    }

    pub fn interface_names(&self) -> &[String] {
        &self.interface_names
    }

    // ------------------------------------------------------------ method table

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn method_entry(&self, idx: usize) -> &MethodEntry {
        &self.methods[idx]
    }

    pub fn method_name(&self, idx: usize) -> &str {
        &self.methods[idx].name
    }

    pub fn method_signature(&self, idx: usize) -> &str {
        &self.methods[idx].signature
    }

    pub fn method_access_flags(&self, idx: usize) -> u16 {
        self.methods[idx].access_flags
    }

    pub fn is_method_public(&self, idx: usize) -> bool {
        self.methods[idx].access_flags & access_flags::ACC_PUBLIC != 0
    }

    pub fn is_method_static(&self, idx: usize) -> bool {
        self.methods[idx].access_flags & access_flags::ACC_STATIC != 0
    }

    pub fn is_method_native(&self, idx: usize) -> bool {
        self.methods[idx].access_flags & access_flags::ACC_NATIVE != 0
    }

    pub fn is_method_abstract(&self, idx: usize) -> bool {
        self.methods[idx].access_flags & access_flags::ACC_ABSTRACT != 0
    }

    /// Index of the method with the given name and signature, if present.
    pub fn method_index(&self, name: &str, signature: &str) -> Option<usize> {
        self.methods
            .iter()
            .position(|m| m.name == name && m.signature == signature)
    }

    /// Offset of the bytecode inside the `method_info` blob (original or
    /// rewritten; the editor preserves the header layout).
    pub fn method_bytecode_offset(&self, idx: usize) -> usize {
        self.methods[idx].bc_off
    }

    // ---------------------------------------------------------- supertype graph

    pub fn set_super(&mut self, super_ref: ClassId) {
        self.super_ref = Some(super_ref);
    }

    pub fn super_ref(&self) -> Option<ClassId> {
        self.super_ref
    }

    pub fn set_super_interface(&mut self, intf: ClassId, idx: usize) {
        self.interfaces_ref[idx] = Some(intf);
    }

    pub fn interfaces_ref(&self) -> &[Option<ClassId>] {
        &self.interfaces_ref
    }

    /// Register a direct or transitive subclass (or implementor, for
    /// interface receivers). Interface lists reject duplicates; class lists
    /// take the entries as they come, one load per class.
    pub fn add_subclass(&mut self, sub: ClassId) {
        let subclasses = self.subclasses.get_or_insert_with(|| {
            if &*self.name == OBJECT_SLASHED_CLASS_NAME {
                Vec::with_capacity(500)
            } else {
                Vec::new()
            }
        });
        if self.access_flags & access_flags::ACC_INTERFACE != 0 && subclasses.contains(&sub) {
            return;
        }
        subclasses.push(sub);
    }

    pub fn subclasses(&self) -> &[ClassId] {
        self.subclasses.as_deref().unwrap_or(&[])
    }

    // ------------------------------------------------------------- scan state

    pub fn set_method_reachable(&mut self, idx: usize) {
        self.has_method_reachable = true;
        self.scan_bits[idx] |= scan_flags::REACHABLE;
    }

    pub fn is_method_reachable(&self, idx: usize) -> bool {
        self.scan_bits[idx] & scan_flags::REACHABLE != 0
    }

    pub fn set_method_unscannable(&mut self, idx: usize) {
        self.scan_bits[idx] |= scan_flags::UNSCANNABLE;
    }

    pub fn is_method_unscannable(&self, idx: usize) -> bool {
        self.scan_bits[idx] & scan_flags::UNSCANNABLE != 0
    }

    pub fn set_method_scanned(&mut self, idx: usize) {
        self.scan_bits[idx] |= scan_flags::SCANNED;
    }

    pub fn is_method_scanned(&self, idx: usize) -> bool {
        self.scan_bits[idx] & scan_flags::SCANNED != 0
    }

    pub fn set_method_instrumented(&mut self, idx: usize) {
        self.scan_bits[idx] |= scan_flags::INSTRUMENTED;
        self.n_instrumented_methods += 1;
    }

    pub fn unset_method_instrumented(&mut self, idx: usize) {
        self.scan_bits[idx] &= !scan_flags::INSTRUMENTED;
        self.n_instrumented_methods -= 1;
    }

    pub fn is_method_instrumented(&self, idx: usize) -> bool {
        self.scan_bits[idx] & scan_flags::INSTRUMENTED != 0
    }

    pub fn set_method_leaf(&mut self, idx: usize) {
        self.scan_bits[idx] |= scan_flags::LEAF;
    }

    pub fn is_method_leaf(&self, idx: usize) -> bool {
        self.scan_bits[idx] & scan_flags::LEAF != 0
    }

    pub fn set_method_virtual(&mut self, idx: usize) {
        self.scan_bits[idx] |= scan_flags::VIRTUAL;
    }

    pub fn is_method_virtual(&self, idx: usize) -> bool {
        self.scan_bits[idx] & scan_flags::VIRTUAL != 0
    }

    pub fn set_method_root(&mut self, idx: usize) {
        self.scan_bits[idx] |= scan_flags::ROOT;
        self.has_uninstrumented_root_methods = true;
    }

    pub fn is_method_root(&self, idx: usize) -> bool {
        self.all_methods_roots || self.scan_bits[idx] & scan_flags::ROOT != 0
    }

    pub fn set_method_special(&mut self, idx: usize) {
        self.scan_bits[idx] |= scan_flags::SPECIAL;
    }

    pub fn unset_method_special(&mut self, idx: usize) {
        self.scan_bits[idx] &= !scan_flags::SPECIAL;
    }

    pub fn is_method_special(&self, idx: usize) -> bool {
        self.scan_bits[idx] & scan_flags::SPECIAL != 0
    }

    pub fn set_method_marker(&mut self, idx: usize) {
        self.scan_bits[idx] |= scan_flags::MARKER;
        self.has_uninstrumented_marker_methods = true;
    }

    pub fn is_method_marker(&self, idx: usize) -> bool {
        self.all_methods_markers || self.scan_bits[idx] & scan_flags::MARKER != 0
    }

    pub fn method_scan_bits(&self, idx: usize) -> u16 {
        self.scan_bits[idx]
    }

    // ------------------------------------------------------------- class flags

    pub fn set_loaded(&mut self, loaded: bool) {
        self.loaded = loaded;
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn set_all_methods_markers(&mut self) {
        self.all_methods_markers = true;
        self.has_uninstrumented_marker_methods = true;
    }

    pub fn all_methods_markers(&self) -> bool {
        self.all_methods_markers
    }

    pub fn set_all_methods_roots(&mut self) {
        self.all_methods_roots = true;
        self.has_uninstrumented_root_methods = true;
    }

    pub fn all_methods_roots(&self) -> bool {
        self.all_methods_roots
    }

    pub fn set_has_uninstrumented_marker_methods(&mut self, v: bool) {
        self.has_uninstrumented_marker_methods = v;
    }

    pub fn has_uninstrumented_marker_methods(&self) -> bool {
        self.has_uninstrumented_marker_methods
    }

    pub fn set_has_uninstrumented_root_methods(&mut self, v: bool) {
        self.has_uninstrumented_root_methods = v;
    }

    pub fn has_uninstrumented_root_methods(&self) -> bool {
        self.has_uninstrumented_root_methods
    }

    pub fn has_method_reachable(&self) -> bool {
        self.has_method_reachable
    }

    pub fn set_servlet_do_scanned(&mut self) {
        self.servlet_do_scanned = true;
    }

    pub fn is_servlet_do_scanned(&self) -> bool {
        self.servlet_do_scanned
    }

    // ---------------------------------------------------------- instrumentation

    pub fn set_instr_method_id(&mut self, idx: usize, id: u16) {
        self.instr_ids[idx] = id;
    }

    pub fn instr_method_id(&self, idx: usize) -> u16 {
        self.instr_ids[idx]
    }

    pub fn n_instrumented_methods(&self) -> usize {
        self.n_instrumented_methods
    }

    pub fn has_instrumented_methods(&self) -> bool {
        self.n_instrumented_methods > 0
    }

    // ------------------------------------------------------ constant-pool growth

    pub fn orig_cp_count(&self) -> u16 {
        self.orig_cp_count
    }

    pub fn set_current_cp_count(&mut self, v: u16) {
        self.current_cp_count = v;
    }

    pub fn current_cp_count(&self) -> u16 {
        self.current_cp_count
    }

    pub fn set_base_cp_count(&mut self, kind: InjKind, v: i32) {
        self.base_cp_count[kind.index()] = v;
    }

    /// Base CP count for an injection kind; -1 until the editor sizes it.
    pub fn base_cp_count(&self, kind: InjKind) -> i32 {
        self.base_cp_count[kind.index()]
    }

    // -------------------------------------------------- method_info routing

    fn has_modified(&self, idx: usize) -> bool {
        self.modified_infos[idx].is_some()
    }

    /// The `method_info` bytes for a method: the saved rewritten blob when
    /// one exists, the original file region otherwise.
    pub fn method_info(&self, idx: usize) -> &[u8] {
        match &self.modified_infos[idx] {
            Some(info) => info,
            None => self.orig_method_info(idx),
        }
    }

    pub fn method_info_len(&self, idx: usize) -> usize {
        match &self.modified_infos[idx] {
            Some(info) => info.len(),
            None => self.methods[idx].info_len,
        }
    }

    /// The `method_info` region of the original class file, regardless of
    /// any saved rewrite.
    pub fn orig_method_info(&self, idx: usize) -> &[u8] {
        let m = &self.methods[idx];
        &self.file_bytes[m.info_off..m.info_off + m.info_len]
    }

    pub fn orig_method_info_len(&self, idx: usize) -> usize {
        self.methods[idx].info_len
    }

    fn modified_bc_len(&mut self, idx: usize) -> usize {
        if self.mod_bc_len[idx] == 0 {
            if let Some(info) = &self.modified_infos[idx] {
                // code_length is the u4 right before the bytecode.
                self.mod_bc_len[idx] = get_u4(info, self.methods[idx].bc_off - 4);
            }
        }
        self.mod_bc_len[idx]
    }

    pub fn method_bytecode_len(&mut self, idx: usize) -> usize {
        if self.has_modified(idx) {
            self.modified_bc_len(idx)
        } else {
            self.methods[idx].bc_len
        }
    }

    pub fn method_bytecode(&mut self, idx: usize) -> &[u8] {
        if self.has_modified(idx) {
            let len = self.modified_bc_len(idx);
            let bc_off = self.methods[idx].bc_off;
            match &self.modified_infos[idx] {
                Some(info) => &info[bc_off..bc_off + len],
                None => &[],
            }
        } else {
            let m = &self.methods[idx];
            &self.file_bytes[m.info_off + m.bc_off..m.info_off + m.bc_off + m.bc_len]
        }
    }

    /// Offset of the `exception_table_length` field inside the routed
    /// `method_info`; 0 for methods without code.
    pub fn exception_table_start(&mut self, idx: usize) -> usize {
        if self.has_modified(idx) {
            self.methods[idx].bc_off + self.modified_bc_len(idx)
        } else {
            self.methods[idx].exc_table_off
        }
    }

    pub fn exception_table_count(&mut self, idx: usize) -> usize {
        let start = self.exception_table_start(idx);
        if start == 0 {
            return 0;
        }
        get_u2(self.method_info(idx), start)
    }

    /// Offset of the first `LocalVariableTable` entry inside the routed
    /// `method_info`; 0 when the method has no such attribute.
    pub fn local_variable_table_start(&mut self, idx: usize) -> usize {
        let target = self.lvt_cp_index;
        if self.has_modified(idx) {
            if self.mod_lvt_off[idx] == 0 {
                self.mod_lvt_off[idx] = self.find_sub_attr_offset(idx, target);
            }
            self.mod_lvt_off[idx]
        } else {
            if self.orig_lvt_off[idx] == 0 {
                self.orig_lvt_off[idx] = self.find_sub_attr_offset(idx, target);
            }
            self.orig_lvt_off[idx]
        }
    }

    /// Same as [`Self::local_variable_table_start`] for the
    /// `LocalVariableTypeTable` attribute.
    pub fn local_variable_type_table_start(&mut self, idx: usize) -> usize {
        let target = self.lvtt_cp_index;
        if self.has_modified(idx) {
            if self.mod_lvtt_off[idx] == 0 {
                self.mod_lvtt_off[idx] = self.find_sub_attr_offset(idx, target);
            }
            self.mod_lvtt_off[idx]
        } else {
            if self.orig_lvtt_off[idx] == 0 {
                self.orig_lvtt_off[idx] = self.find_sub_attr_offset(idx, target);
            }
            self.orig_lvtt_off[idx]
        }
    }

    /// Same as [`Self::local_variable_table_start`] for the `StackMapTable`
    /// attribute.
    pub fn stack_map_table_start(&mut self, idx: usize) -> usize {
        let target = self.smt_cp_index;
        if self.has_modified(idx) {
            if self.mod_smt_off[idx] == 0 {
                self.mod_smt_off[idx] = self.find_sub_attr_offset(idx, target);
            }
            self.mod_smt_off[idx]
        } else {
            if self.orig_smt_off[idx] == 0 {
                self.orig_smt_off[idx] = self.find_sub_attr_offset(idx, target);
            }
            self.orig_smt_off[idx]
        }
    }

    /// Walk the `Code` sub-attribute table of a method and return the
    /// payload offset (+2, past the entry-count prefix) of the attribute
    /// whose name sits at `attr_name_index` in the constant pool.
    fn find_sub_attr_offset(&mut self, idx: usize, attr_name_index: u16) -> usize {
        if attr_name_index == 0 {
            return 0;
        }
        let exc_start = self.exception_table_start(idx);
        if exc_start == 0 {
            return 0;
        }
        let exc_count = self.exception_table_count(idx);
        let info = self.method_info(idx);
        let mut off = exc_start + 2 + exc_count * 8;
        if off + 2 > info.len() {
            return 0;
        }
        let attr_count = get_u2(info, off);
        off += 2;
        for _ in 0..attr_count {
            if off + 6 > info.len() {
                return 0;
            }
            let name_idx = get_u2(info, off);
            off += 2;
            let attr_len = get_u4(info, off);
            off += 4;
            if name_idx == attr_name_index as usize {
                return off + 2;
            }
            off += attr_len;
        }
        0
    }

    /// Save the rewritten `method_info` for one method. All four
    /// modified-offset caches are reallocated, discarding cached offsets
    /// for every other method as well; they are recomputed against the
    /// buffers on the next access.
    pub fn save_method_info(&mut self, idx: usize, method_info: Vec<u8>) {
        let m = self.methods.len();
        self.modified_infos[idx] = Some(method_info);
        self.mod_bc_len = vec![0; m];
        self.mod_lvt_off = vec![0; m];
        self.mod_lvtt_off = vec![0; m];
        self.mod_smt_off = vec![0; m];
    }

    /// Drop the lazily computed original-file offset caches. A no-op once
    /// any method carries a rewritten blob, since the modified path keeps
    /// its own caches.
    pub fn reset_tables(&mut self) {
        if self.modified_infos.iter().any(Option::is_some) {
            return;
        }
        self.orig_lvt_off.fill(0);
        self.orig_lvtt_off.fill(0);
        self.orig_smt_off.fill(0);
    }

    // ---------------------------------------------------------- stack maps

    pub fn stack_maps(&self) -> &StackMapTables {
        &self.stack_maps
    }

    pub fn stack_maps_mut(&mut self) -> &mut StackMapTables {
        &mut self.stack_maps
    }

    /// Queue the full stack-map frame for a global catch handler ending at
    /// `end_pc`. Locals are empty for static methods, `uninitialized_this`
    /// for constructors, the receiver class otherwise; the stack is a
    /// single `Throwable`. Class files older than major 50 carry no
    /// `StackMapTable`, so nothing is queued for them.
    ///
    /// The editor must have sized `InjKind::StackMap` and
    /// `InjKind::Throwable` base counts before calling this for a class
    /// whose constant pool lacks the corresponding entries.
    pub fn add_global_catch_stack_map_entry(&mut self, method_idx: usize, end_pc: u16) {
        if self.major_version < 50 {
            return;
        }
        let is_static = self.is_method_static(method_idx);
        let constructor = self.method_name(method_idx) == CONSTRUCTOR_NAME;

        if self.smt_cp_index == 0 {
            self.smt_cp_index = self.base_cp_count[InjKind::StackMap.index()] as u16;
        }
        if self.throwable_cp_index == 0 {
            self.throwable_cp_index =
                match self.constant_pool.index_of_class(THROWABLE_SLASHED_CLASS_NAME) {
                    Some(idx) => idx,
                    None => self.base_cp_count[InjKind::Throwable.index()] as u16,
                };
        }

        let stack = vec![self.throwable_cp_index];
        let locals = if is_static {
            Vec::new()
        } else if constructor {
            vec![0]
        } else {
            vec![self.this_class_cp_index]
        };
        self.stack_maps.add_full_frame_entry(method_idx, end_pc, locals, stack);
    }

    /// CP index of the `StackMapTable` attribute name as currently known
    /// (parsed from the file or allocated from the injection base counts).
    pub fn stack_map_table_cp_index(&self) -> u16 {
        self.smt_cp_index
    }
}
