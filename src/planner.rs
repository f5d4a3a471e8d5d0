//! The instrumentation planner.
//!
//! One [`Planner`] drives a profiling session: [`Planner::initial`] replays
//! the classes that were already loaded when the agent attached, and
//! [`Planner::on_class_load`] handles every class-load event after that.
//! Both decide, per method, whether a probe belongs there (walking roots,
//! wildcards, the instrumentation filter, and the implicit-root heuristics)
//! and return the rewritten methods as a [`MethodPack`].
//!
//! This is the total-instrumentation flavour: everything eligible is
//! instrumented at class load, so the per-invocation entry points exist
//! only for API parity and return empty packs.
//!
//! All entry points must run under one lock together with the repository;
//! see the crate docs for the threading model.

use std::fmt;
use std::mem;
use std::sync::Arc;

use log::{debug, warn};

use crate::classfile::ClassParseError;
use crate::record::{ClassRecord, InjKind, OBJECT_SLASHED_CLASS_NAME};
use crate::repository::{ClassBytesProvider, ClassId, ClassRepository};
use crate::roots::{self, InstrFilter, RootSet};

const RUNNABLE_SLASHED_CLASS_NAME: &str = "java/lang/Runnable";
const THREAD_SLASHED_CLASS_NAME: &str = "java/lang/Thread";
const CLASS_LOADER_SLASHED_CLASS_NAME: &str = "java/lang/ClassLoader";
const LOAD_CLASS_METHOD_NAME: &str = "loadClass";
const LOAD_CLASS_METHOD_SIGNATURE: &str = "(Ljava/lang/String;)Ljava/lang/Class;";
const MAIN_METHOD_NAME: &str = "main";
const MAIN_METHOD_SIGNATURE: &str = "([Ljava/lang/String;)V";
const RUN_METHOD_NAME: &str = "run";
const RUN_METHOD_SIGNATURE: &str = "()V";
const CONSTRUCTOR_NAME: &str = "<init>";

// The launcher shim also has a conforming main; a class under this prefix
// must not consume the one-shot main capture.
const SUN_LAUNCHER_PREFIX: &str = "sun/launcher/Launcher";

const OPC_RETURN: u8 = 0xb1;
const OPC_ALOAD_0: u8 = 0x2a;
const OPC_GETFIELD: u8 = 0xb4;
const OPC_PUTFIELD: u8 = 0xb5;

/// A method pinned by a configured profile point; instrumented even in
/// classes the filter rejects.
#[derive(Debug, Clone)]
pub struct ProfilePoint {
    pub class_name: String,
    pub method_name: String,
    pub method_signature: String,
}

impl ProfilePoint {
    pub fn new(class_name: &str, method_name: &str, method_signature: &str) -> Self {
        Self {
            class_name: class_name.replace('.', "/"),
            method_name: method_name.to_string(),
            method_signature: method_signature.to_string(),
        }
    }
}

/// Session-wide knobs; one value per planner.
#[derive(Debug)]
pub struct PlannerSettings {
    /// Auto-root `run()V` of every `Runnable` implementor.
    pub instrument_spawned_threads: bool,
    /// When false, constructors of classes newer than major 50 are left
    /// alone.
    pub instrument_constructors: bool,
    pub dont_instrument_empty_methods: bool,
    pub dont_scan_getter_setter_methods: bool,
    pub instr_filter: InstrFilter,
    pub profile_points: Vec<ProfilePoint>,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            instrument_spawned_threads: false,
            instrument_constructors: true,
            dont_instrument_empty_methods: true,
            dont_scan_getter_setter_methods: true,
            instr_filter: InstrFilter::pass_all(),
            profile_points: Vec::new(),
        }
    }
}

/// The external bytecode editor's answer for one method.
#[derive(Debug)]
pub struct EditedMethod {
    /// The rewritten `method_info`, header layout preserved.
    pub method_info: Vec<u8>,
    /// Constant-pool entries the editor appended for this injection kind;
    /// non-zero only the first time a kind touches a class.
    pub appended_cp_entries: u16,
}

/// An editor's refusal to touch a method. The method is demoted to
/// unscannable; nothing else is rolled back.
#[derive(Debug)]
pub struct EditorVeto {
    pub reason: String,
}

impl fmt::Display for EditorVeto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "editor refused method: {}", self.reason)
    }
}

impl std::error::Error for EditorVeto {}

/// The collaborator that physically splices probes into method bodies.
///
/// Implementations may mutate the record: setting injection base counts
/// and queueing stack-map frames is their job. The planner applies the
/// returned blob and CP delta afterwards.
pub trait BytecodeEditor {
    fn instrument(
        &mut self,
        class: &mut ClassRecord,
        method_idx: usize,
        kind: InjKind,
        method_id: u16,
    ) -> Result<EditedMethod, EditorVeto>;
}

/// The root-classes-loaded command: what the agent saw at attach time.
#[derive(Debug, Default)]
pub struct LoadSnapshot {
    /// `(class name, loader id)` of every class already loaded.
    pub loaded_classes: Vec<(String, u32)>,
    /// Class bytes for custom-loader classes the provider cannot see.
    pub custom_loader_bytes: Vec<(String, u32, Vec<u8>)>,
}

/// Newly instrumented methods, packed as parallel arrays for the wire.
#[derive(Debug, Default)]
pub struct MethodPack {
    pub class_names: Vec<Arc<str>>,
    pub loader_ids: Vec<u32>,
    pub method_indices: Vec<u16>,
    pub method_infos: Vec<Vec<u8>>,
}

impl MethodPack {
    pub fn len(&self) -> usize {
        self.class_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.class_names.is_empty()
    }
}

/// A class-load the planner had to skip over a malformed class file.
#[derive(Debug)]
pub struct ClassLoadFault {
    pub class_name: String,
    pub loader_id: u32,
    pub error: ClassParseError,
}

struct PendingMethod {
    name: Arc<str>,
    loader_id: u32,
    class: ClassId,
    method_idx: u16,
}

pub struct Planner {
    repo: ClassRepository,
    settings: PlannerSettings,
    editor: Box<dyn BytecodeEditor>,
    roots: RootSet,
    no_explicit_roots: bool,
    main_instrumented: bool,
    next_method_id: u16,
    pending: Vec<PendingMethod>,
    faults: Vec<ClassLoadFault>,
}

impl Planner {
    pub fn new(
        provider: Box<dyn ClassBytesProvider>,
        editor: Box<dyn BytecodeEditor>,
        settings: PlannerSettings,
    ) -> Self {
        Self {
            repo: ClassRepository::new(provider),
            settings,
            editor,
            roots: RootSet::new(),
            no_explicit_roots: true,
            main_instrumented: false,
            next_method_id: 1,
            pending: Vec::new(),
            faults: Vec::new(),
        }
    }

    pub fn repository(&self) -> &ClassRepository {
        &self.repo
    }

    pub fn repository_mut(&mut self) -> &mut ClassRepository {
        &mut self.repo
    }

    pub fn settings(&self) -> &PlannerSettings {
        &self.settings
    }

    /// Malformed-class diagnostics accumulated since the last call.
    pub fn take_faults(&mut self) -> Vec<ClassLoadFault> {
        mem::take(&mut self.faults)
    }

    /// Replay the attach-time snapshot: seed custom-loader bytes, link
    /// every already-loaded class into the subclass graph, mark roots, and
    /// instrument everything eligible. Runs once, before any
    /// [`Self::on_class_load`].
    pub fn initial(&mut self, snapshot: &LoadSnapshot, roots: RootSet) -> MethodPack {
        for (name, loader_id, bytes) in &snapshot.custom_loader_bytes {
            self.repo.seed_class_bytes(name, *loader_id, bytes.clone());
        }

        self.roots = roots;
        self.no_explicit_roots = self.roots.no_explicit_roots();

        let mut loaded = Vec::with_capacity(snapshot.loaded_classes.len());
        for (name, loader_id) in &snapshot.loaded_classes {
            let Some(id) = self.lookup_class(name, *loader_id) else { continue };
            self.repo[id].set_loaded(true);
            self.repo.add_to_subclass_lists(id, id);
            loaded.push(id);
        }

        for id in loaded {
            self.mark_profile_points(id);
            self.try_instrument_spawned_threads(id);
            self.apply_root_marks(id);
            self.mark_all_methods_instrumentable(id);
        }

        // So that class loading is measured correctly from the beginning.
        if let Some(cl) = self.lookup_class(CLASS_LOADER_SLASHED_CLASS_NAME, 0) {
            self.check_and_mark_named(cl, LOAD_CLASS_METHOD_NAME, LOAD_CLASS_METHOD_SIGNATURE);
        }

        self.pack()
    }

    /// Handle one class-load event and return the methods to instrument.
    pub fn on_class_load(&mut self, class_name: &str, loader_id: u32) -> MethodPack {
        let Some(id) = self.lookup_class(class_name, loader_id) else {
            return self.pack();
        };

        self.repo[id].set_loaded(true);
        // Link into the subclass graph up front so the Runnable check sees
        // this class's own interfaces.
        self.repo.add_to_subclass_lists(id, id);

        if self.repo[id].is_interface() {
            return self.pack();
        }

        self.mark_profile_points(id);

        let mut is_root_class = self.try_instrument_spawned_threads(id);

        if self.no_explicit_roots && !self.main_instrumented {
            // The first loaded class with a conforming main is taken for
            // the main class.
            if self.try_main_method_instrumentation(id) {
                is_root_class = true;
                if !self.repo[id].name().starts_with(SUN_LAUNCHER_PREFIX) {
                    self.main_instrumented = true;
                }
            }
        }

        if !is_root_class {
            for r in 0..self.roots.len() {
                if self.root_matches(r, id) {
                    is_root_class = true;
                    break;
                }
            }
        }

        let normally_filtered_out = !self.settings.instr_filter.passes(self.repo[id].name());
        if !is_root_class && normally_filtered_out {
            return self.pack(); // profile points only
        }

        self.apply_root_marks(id);

        if !normally_filtered_out
            || self.repo[id].all_methods_markers()
            || self.repo[id].all_methods_roots()
        {
            self.mark_all_methods_instrumentable(id);
        }

        self.pack()
    }

    /// Not used by the total-instrumentation scheme; everything is decided
    /// at class load.
    pub fn on_method_invoke(
        &mut self,
        _class_name: &str,
        _loader_id: u32,
        _method_name: &str,
        _method_signature: &str,
    ) -> MethodPack {
        MethodPack::default()
    }

    /// Not used by the total-instrumentation scheme.
    pub fn on_reflect_invoke(
        &mut self,
        _class_name: &str,
        _loader_id: u32,
        _method_name: &str,
        _method_signature: &str,
    ) -> MethodPack {
        MethodPack::default()
    }

    /// Drain everything instrumented since the last drain into the wire
    /// tuple. Destructive: a second call returns only newer work.
    pub fn pack(&mut self) -> MethodPack {
        let pending = mem::take(&mut self.pending);
        let mut pack = MethodPack {
            class_names: Vec::with_capacity(pending.len()),
            loader_ids: Vec::with_capacity(pending.len()),
            method_indices: Vec::with_capacity(pending.len()),
            method_infos: Vec::with_capacity(pending.len()),
        };
        for p in pending {
            pack.method_infos.push(self.repo[p.class].method_info(p.method_idx as usize).to_vec());
            pack.class_names.push(p.name);
            pack.loader_ids.push(p.loader_id);
            pack.method_indices.push(p.method_idx);
        }
        pack
    }

    // ------------------------------------------------------------------ marking

    fn lookup_class(&mut self, name: &str, loader_id: u32) -> Option<ClassId> {
        match self.repo.lookup_or_create(name, loader_id) {
            Ok(found) => found,
            Err(error) => {
                warn!("skipping malformed class {name} (loader {loader_id}): {error}");
                self.faults.push(ClassLoadFault {
                    class_name: name.to_string(),
                    loader_id,
                    error,
                });
                None
            }
        }
    }

    fn root_matches(&self, r: usize, id: ClassId) -> bool {
        let class_name = self.repo[id].name();
        let pattern = &self.roots.class_names[r];
        if self.roots.class_wildcards[r] {
            roots::matches_wildcard(pattern, class_name)
        } else {
            class_name == pattern
        }
    }

    /// Second root pass: mark every matching entry on the class: the whole
    /// class for package/method wildcards, a single named method otherwise.
    fn apply_root_marks(&mut self, id: ClassId) {
        for r in 0..self.roots.len() {
            if !self.root_matches(r, id) {
                continue;
            }
            let package_or_method_wildcard = roots::is_package_wildcard(&self.roots.class_names[r])
                || roots::is_method_wildcard(&self.roots.method_names[r]);
            if package_or_method_wildcard {
                if self.roots.marker_methods[r] {
                    self.repo[id].set_all_methods_markers();
                } else {
                    self.repo[id].set_all_methods_roots();
                }
            } else {
                self.mark_root_entry(id, r);
                let method_name = self.roots.method_names[r].clone();
                let method_signature = self.roots.method_signatures[r].clone();
                self.check_and_mark_named(id, &method_name, &method_signature);
            }
        }
    }

    /// Set the ROOT or MARKER bit for the method a root entry names.
    /// A root naming a method the class does not have simply never fires.
    fn mark_root_entry(&mut self, id: ClassId, r: usize) {
        let record = &mut self.repo[id];
        if let Some(idx) =
            record.method_index(&self.roots.method_names[r], &self.roots.method_signatures[r])
        {
            if self.roots.marker_methods[r] {
                record.set_method_marker(idx);
            } else {
                record.set_method_root(idx);
            }
        }
    }

    /// Auto-root `run()V` when spawned-thread instrumentation applies.
    /// `java/lang/Thread` itself is exempt.
    fn try_instrument_spawned_threads(&mut self, id: ClassId) -> bool {
        if !(self.settings.instrument_spawned_threads || self.no_explicit_roots) {
            return false;
        }
        if self.repo[id].name() == THREAD_SLASHED_CLASS_NAME
            || !self.repo.implements_interface(id, RUNNABLE_SLASHED_CLASS_NAME)
        {
            return false;
        }
        let record = &mut self.repo[id];
        let marked = match record.method_index(RUN_METHOD_NAME, RUN_METHOD_SIGNATURE) {
            Some(idx) => {
                record.set_method_root(idx);
                true
            }
            None => false,
        };
        self.check_and_mark_named(id, RUN_METHOD_NAME, RUN_METHOD_SIGNATURE);
        marked
    }

    /// Take a `public static void main(String[])` as an implicit root.
    fn try_main_method_instrumentation(&mut self, id: ClassId) -> bool {
        let record = &mut self.repo[id];
        let Some(idx) = record.method_index(MAIN_METHOD_NAME, MAIN_METHOD_SIGNATURE) else {
            return false;
        };
        if !(record.is_method_static(idx) && record.is_method_public(idx)) {
            return false;
        }
        record.set_method_root(idx);
        self.check_and_mark(id, idx);
        true
    }

    /// Profile-point methods skip the filter: they are pinned reachable and
    /// instrumented wherever they live.
    fn mark_profile_points(&mut self, id: ClassId) {
        if self.settings.profile_points.is_empty() {
            return;
        }
        let targets: Vec<(String, String)> = self
            .settings
            .profile_points
            .iter()
            .filter(|p| p.class_name == self.repo[id].name())
            .map(|p| (p.method_name.clone(), p.method_signature.clone()))
            .collect();
        for (method_name, method_signature) in targets {
            let record = &mut self.repo[id];
            let Some(idx) = record.method_index(&method_name, &method_signature) else {
                continue;
            };
            if record.is_method_reachable(idx) {
                continue;
            }
            record.set_method_reachable(idx);
            if record.is_method_native(idx) || record.is_method_abstract(idx) {
                record.set_method_unscannable(idx);
                continue;
            }
            record.set_method_leaf(idx);
            self.instrument_method(id, idx);
        }
    }

    fn mark_all_methods_instrumentable(&mut self, id: ClassId) {
        if self.repo[id].is_interface() {
            return;
        }
        for idx in 0..self.repo[id].method_count() {
            self.check_and_mark(id, idx);
        }
    }

    fn check_and_mark_named(&mut self, id: ClassId, method_name: &str, method_signature: &str) {
        if let Some(idx) = self.repo[id].method_index(method_name, method_signature) {
            self.check_and_mark(id, idx);
        }
    }

    /// The per-method reachability check: mark the method reachable, then
    /// decide unscannable vs. leaf, and instrument leaves.
    fn check_and_mark(&mut self, id: ClassId, idx: usize) {
        if self.repo[id].is_method_reachable(idx) {
            return;
        }

        let filter_passes = self.settings.instr_filter.passes(self.repo[id].name());
        let record = &mut self.repo[id];
        record.set_method_reachable(idx);

        let mut unscannable = record.is_method_native(idx)
            || record.is_method_abstract(idx)
            || (!record.is_method_root(idx) && !record.is_method_marker(idx) && !filter_passes)
            || record.name() == OBJECT_SLASHED_CLASS_NAME;

        if !unscannable
            && record.method_name(idx) == CONSTRUCTOR_NAME
            && !self.settings.instrument_constructors
            && record.major_version() > 50
        {
            unscannable = true;
        }

        if !unscannable {
            let bytecode = record.method_bytecode(idx);
            if (self.settings.dont_instrument_empty_methods && is_empty_method(bytecode))
                || (self.settings.dont_scan_getter_setter_methods
                    && is_getter_setter_method(bytecode))
            {
                unscannable = true;
            }
        }

        if unscannable {
            record.set_method_unscannable(idx);
        } else {
            record.set_method_leaf(idx);
        }

        // Loaded + reachable + scannable is all it takes in this scheme.
        if !self.repo[id].is_method_unscannable(idx) {
            self.instrument_method(id, idx);
        }
    }

    /// Hand one method to the editor and account for the result.
    fn instrument_method(&mut self, id: ClassId, idx: usize) {
        if self.repo[id].is_method_instrumented(idx) {
            return;
        }

        let kind = {
            let record = &self.repo[id];
            if record.is_method_root(idx) {
                InjKind::RecursiveRootMethod
            } else if record.is_method_marker(idx) {
                InjKind::RecursiveMarkerMethod
            } else {
                InjKind::RecursiveNormalMethod
            }
        };

        let method_id = self.next_method_id;
        let base_was_unset = self.repo[id].base_cp_count(kind) < 0;

        match self.editor.instrument(&mut self.repo[id], idx, kind, method_id) {
            Ok(edited) => {
                let record = &mut self.repo[id];
                if base_was_unset && edited.appended_cp_entries > 0 {
                    let current = record.current_cp_count();
                    record.set_base_cp_count(kind, i32::from(current));
                }
                let grown = record.current_cp_count() + edited.appended_cp_entries;
                record.set_current_cp_count(grown);
                record.save_method_info(idx, edited.method_info);
                record.set_instr_method_id(idx, method_id);
                record.set_method_instrumented(idx);
                self.next_method_id = self.next_method_id.wrapping_add(1);
                self.pending.push(PendingMethod {
                    name: record.name_handle(),
                    loader_id: record.loader_id(),
                    class: id,
                    method_idx: idx as u16,
                });
            }
            Err(veto) => {
                debug!(
                    "editor vetoed {}.{}{}: {}",
                    self.repo[id].name(),
                    self.repo[id].method_name(idx),
                    self.repo[id].method_signature(idx),
                    veto
                );
                self.repo[id].set_method_unscannable(idx);
            }
        }
    }
}

impl fmt::Debug for Planner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Planner")
            .field("repo", &self.repo)
            .field("roots", &self.roots.len())
            .field("no_explicit_roots", &self.no_explicit_roots)
            .field("main_instrumented", &self.main_instrumented)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// A body that is a single `return` and nothing else.
fn is_empty_method(bytecode: &[u8]) -> bool {
    bytecode.len() == 1 && bytecode[0] == OPC_RETURN
}

/// The two trivial field-accessor shapes: `aload_0; getfield; <x>return`
/// and `aload_0; <x>load_1; putfield; return`.
fn is_getter_setter_method(bytecode: &[u8]) -> bool {
    match bytecode.len() {
        5 => {
            bytecode[0] == OPC_ALOAD_0
                && bytecode[1] == OPC_GETFIELD
                && (0xac..=0xb0).contains(&bytecode[4]) // ireturn..areturn
        }
        6 => {
            bytecode[0] == OPC_ALOAD_0
                && matches!(bytecode[1], 0x1b | 0x1f | 0x23 | 0x27 | 0x2b) // iload_1..aload_1
                && bytecode[2] == OPC_PUTFIELD
                && bytecode[5] == OPC_RETURN
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_method_is_a_lone_return() {
        assert!(is_empty_method(&[OPC_RETURN]));
        assert!(!is_empty_method(&[0x00, OPC_RETURN]));
        assert!(!is_empty_method(&[0xb0])); // areturn alone is not "empty"
    }

    #[test]
    fn recognizes_getter_shape() {
        // aload_0; getfield #4; ireturn
        assert!(is_getter_setter_method(&[0x2a, 0xb4, 0x00, 0x04, 0xac]));
        // aload_0; getfield #4; areturn
        assert!(is_getter_setter_method(&[0x2a, 0xb4, 0x00, 0x04, 0xb0]));
        // getstatic is not a getter
        assert!(!is_getter_setter_method(&[0x2a, 0xb2, 0x00, 0x04, 0xac]));
    }

    #[test]
    fn recognizes_setter_shape() {
        // aload_0; iload_1; putfield #4; return
        assert!(is_getter_setter_method(&[0x2a, 0x1b, 0xb5, 0x00, 0x04, 0xb1]));
        // aload_0; aload_1; putfield #4; return
        assert!(is_getter_setter_method(&[0x2a, 0x2b, 0xb5, 0x00, 0x04, 0xb1]));
        assert!(!is_getter_setter_method(&[0x2a, 0x1b, 0xb5, 0x00, 0x04, 0xb0]));
    }
}
