//! # probeplan
//!
//! Class-instrumentation planning for call-graph profilers.
//!
//! A CPU profiler that rewrites bytecode has to answer one question over
//! and over, for every class the target VM loads: *which methods of this
//! class get probes?* This crate is that decision engine. It parses class
//! files into per-class state records, tracks the user's root and marker
//! patterns, walks the implicit-root heuristics (`main`, `Runnable.run`),
//! applies the instrumentation filter, and hands an external bytecode
//! editor exactly the methods that need rewriting. It remembers the
//! rewritten `method_info` blobs so later passes never re-derive offsets.
//!
//! What this crate does **not** do: splice probes (the [`BytecodeEditor`]
//! trait is the seam), speak the agent wire protocol, or install redefined
//! classes into a VM. Those live in the surrounding agent.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Agent event dispatch                    │
//! │        initial(snapshot, roots) / on_class_load(...)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Planner (planner)                                          │
//! │    roots & filter (roots)     implicit-root heuristics      │
//! │    per-method reachability    -> BytecodeEditor (trait)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ClassRepository (repository)                               │
//! │    (name, loader) -> ClassRecord arena, supertype graph     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ClassRecord (record)          classfile decoder (classfile)│
//! │    scan bits, instr ids,       offset-oriented parse,       │
//! │    modified method_info,       constant pool                │
//! │    CP growth, stack maps       ClassBytesProvider (trait)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use probeplan::{LoadSnapshot, Planner, PlannerSettings, RootSet};
//! use probeplan::classpath::ClasspathProvider;
//!
//! let mut provider = ClasspathProvider::new();
//! provider.add_jar(std::path::Path::new("app.jar"))?;
//!
//! let mut planner = Planner::new(
//!     Box::new(provider),
//!     Box::new(my_editor),          // your BytecodeEditor
//!     PlannerSettings::default(),
//! );
//!
//! let mut roots = RootSet::new();
//! roots.add_root("com.app.*", "*", "");
//!
//! let pack = planner.initial(&LoadSnapshot::default(), roots);
//! // ... per class-load event:
//! let pack = planner.on_class_load("com/app/Svc", 0);
//! for i in 0..pack.len() {
//!     redefine(&pack.class_names[i], pack.loader_ids[i],
//!              pack.method_indices[i], &pack.method_infos[i]);
//! }
//! ```
//!
//! ## Threading model
//!
//! The planner is single-threaded by design: every entry point mutates the
//! repository, so the agent must serialize calls; in practice one
//! `Mutex<Planner>` around the event-dispatch path. Packs returned from
//! entry points are owned snapshots and may be serialized from any thread.

pub mod classfile;
pub mod classpath;
pub mod planner;
pub mod record;
pub mod repository;
pub mod roots;
pub mod stackmap;

pub use crate::classfile::{ClassParseError, ConstantPool, CpEntry, MethodEntry};
pub use crate::planner::{
    BytecodeEditor, ClassLoadFault, EditedMethod, EditorVeto, LoadSnapshot, MethodPack, Planner,
    PlannerSettings, ProfilePoint,
};
pub use crate::record::{
    scan_flags, ClassRecord, InjKind, INJ_MAXNUMBER, OBJECT_SLASHED_CLASS_NAME,
};
pub use crate::repository::{ClassBytesProvider, ClassId, ClassRepository, NullProvider};
pub use crate::roots::{InstrFilter, RootSet};
pub use crate::stackmap::{FullFrame, StackMapTables};
