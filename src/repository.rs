//! Class repository: the identity map from `(internal name, loader id)` to
//! [`ClassRecord`], and the supertype graph queries built on it.
//!
//! Records live in an arena owned by the repository and reference each
//! other through [`ClassId`] handles, so the upward `super`/interface
//! links and the downward subclass lists never form an ownership cycle.

use std::collections::{HashMap, HashSet};
use std::io;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

use log::{debug, warn};

use crate::classfile::{self, ClassParseError};
use crate::record::{ClassRecord, OBJECT_SLASHED_CLASS_NAME};

/// Handle to a [`ClassRecord`] in the repository arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(u32);

impl ClassId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Source of class-file bytes, consulted on first reference to a class.
///
/// The fetch may hit disk or a jar; the repository holds the planner lock
/// for exactly that long, so implementations should not block beyond the
/// read itself.
pub trait ClassBytesProvider {
    /// Class-file bytes for `name` (slash form), or `None` when the class
    /// resolves nowhere on the class path.
    fn fetch(&mut self, name: &str) -> io::Result<Option<Vec<u8>>>;
}

/// Provider with no backing storage; only pre-seeded bytes resolve.
#[derive(Debug, Default)]
pub struct NullProvider;

impl ClassBytesProvider for NullProvider {
    fn fetch(&mut self, _name: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

pub struct ClassRepository {
    classes: Vec<ClassRecord>,
    by_name: HashMap<(Arc<str>, u32), ClassId>,
    interned: HashSet<Arc<str>>,
    seeded_bytes: HashMap<(Arc<str>, u32), Vec<u8>>,
    provider: Box<dyn ClassBytesProvider>,
}

impl ClassRepository {
    pub fn new(provider: Box<dyn ClassBytesProvider>) -> Self {
        Self {
            classes: Vec::new(),
            by_name: HashMap::new(),
            interned: HashSet::new(),
            seeded_bytes: HashMap::new(),
            provider,
        }
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn get(&self, id: ClassId) -> &ClassRecord {
        &self.classes[id.index()]
    }

    pub fn get_mut(&mut self, id: ClassId) -> &mut ClassRecord {
        &mut self.classes[id.index()]
    }

    /// Intern a slash-form name; hot-path matching clones the `Arc`
    /// instead of the string.
    pub fn intern(&mut self, name: &str) -> Arc<str> {
        match self.interned.get(name) {
            Some(interned) => Arc::clone(interned),
            None => {
                let interned: Arc<str> = Arc::from(name);
                self.interned.insert(Arc::clone(&interned));
                interned
            }
        }
    }

    /// Store class bytes delivered by the agent for a custom-loader class;
    /// these take priority over the provider.
    pub fn seed_class_bytes(&mut self, name: &str, loader_id: u32, bytes: Vec<u8>) {
        let name = self.intern(&name.replace('.', "/"));
        self.seeded_bytes.insert((name, loader_id), bytes);
    }

    /// Look up an already-created record without creating one.
    pub fn lookup(&self, name: &str, loader_id: u32) -> Option<ClassId> {
        let slashed = name.replace('.', "/");
        let interned = self.interned.get(slashed.as_str())?;
        self.by_name.get(&(Arc::clone(interned), loader_id)).copied()
    }

    /// Look up the record for `(name, loader_id)`, creating and parsing it
    /// on first reference. `Ok(None)` means the class resolves nowhere;
    /// callers tolerate that silently. A malformed class file is the one
    /// fatal outcome and is returned as an error.
    pub fn lookup_or_create(
        &mut self,
        name: &str,
        loader_id: u32,
    ) -> Result<Option<ClassId>, ClassParseError> {
        let slashed = name.replace('.', "/");
        let interned = self.intern(&slashed);

        if let Some(&id) = self.by_name.get(&(Arc::clone(&interned), loader_id)) {
            return Ok(Some(id));
        }

        let bytes = match self.class_bytes(&interned, loader_id) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("class {interned} (loader {loader_id}) resolves nowhere");
                return Ok(None);
            }
            Err(err) => {
                warn!("failed to fetch class file for {interned}: {err}");
                return Ok(None);
            }
        };

        let parsed = classfile::parse(&interned, &bytes)?;
        let record = ClassRecord::from_parsed(Arc::clone(&interned), loader_id, bytes, parsed);
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(record);
        self.by_name.insert((interned, loader_id), id);
        Ok(Some(id))
    }

    fn class_bytes(&mut self, name: &Arc<str>, loader_id: u32) -> io::Result<Option<Vec<u8>>> {
        if let Some(bytes) = self.seeded_bytes.get(&(Arc::clone(name), loader_id)) {
            return Ok(Some(bytes.clone()));
        }
        if loader_id != 0 {
            if let Some(bytes) = self.seeded_bytes.get(&(Arc::clone(name), 0)) {
                return Ok(Some(bytes.clone()));
            }
        }
        self.provider.fetch(name)
    }

    /// True iff `name` is the record's own name or appears on its resolved
    /// super chain. `name` must be slash-form, like every name the
    /// repository hands out; a self-referential super link terminates the
    /// walk.
    pub fn is_subclass_of(&self, id: ClassId, name: &str) -> bool {
        let mut cur = id;
        loop {
            let record = &self.classes[cur.index()];
            if record.name() == name {
                return true;
            }
            match record.super_ref() {
                None => return false,
                Some(sup) if sup == cur => return false,
                Some(sup) => cur = sup,
            }
        }
    }

    /// Transitive closure over declared interfaces, their resolved
    /// super-interfaces, and the super chain, stopping at
    /// `java/lang/Object`.
    pub fn implements_interface(&self, id: ClassId, intf_name: &str) -> bool {
        let record = &self.classes[id.index()];
        for declared in record.interface_names() {
            if declared == intf_name {
                return true;
            }
        }
        for resolved in record.interfaces_ref() {
            if let Some(intf) = resolved {
                if self.implements_interface(*intf, intf_name) {
                    return true;
                }
            }
        }
        match record.super_ref() {
            None => false,
            Some(sup) => {
                if self.classes[sup.index()].name() == OBJECT_SLASHED_CLASS_NAME {
                    false
                } else {
                    self.implements_interface(sup, intf_name)
                }
            }
        }
    }

    /// Register `added` in the subclass lists of every resolvable ancestor
    /// of `id`, wiring super/interface references on the way up. Ancestors
    /// that have not been seen yet are created from their class files even
    /// though they are not loaded, so interface queries work from the
    /// first event that mentions them.
    pub fn add_to_subclass_lists(&mut self, id: ClassId, added: ClassId) {
        let loader_id = self.classes[id.index()].loader_id();

        if let Some(super_name) = self.classes[id.index()].super_name().map(str::to_owned) {
            if let Ok(Some(sup)) = self.lookup_or_create(&super_name, loader_id) {
                if sup != id {
                    self.classes[id.index()].set_super(sup);
                    self.classes[sup.index()].add_subclass(added);
                    self.add_to_subclass_lists(sup, added);
                }
            }
        }

        let interface_count = self.classes[id.index()].interface_names().len();
        for slot in 0..interface_count {
            let intf_name = self.classes[id.index()].interface_names()[slot].clone();
            if let Ok(Some(intf)) = self.lookup_or_create(&intf_name, loader_id) {
                if intf != id {
                    self.classes[id.index()].set_super_interface(intf, slot);
                    self.classes[intf.index()].add_subclass(added);
                    self.add_to_subclass_lists(intf, added);
                }
            }
        }
    }
}

impl Index<ClassId> for ClassRepository {
    type Output = ClassRecord;

    fn index(&self, id: ClassId) -> &ClassRecord {
        &self.classes[id.index()]
    }
}

impl IndexMut<ClassId> for ClassRepository {
    fn index_mut(&mut self, id: ClassId) -> &mut ClassRecord {
        &mut self.classes[id.index()]
    }
}

impl std::fmt::Debug for ClassRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassRepository")
            .field("classes", &self.classes.len())
            .field("seeded_bytes", &self.seeded_bytes.len())
            .finish()
    }
}
