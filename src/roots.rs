//! User-declared root patterns and the instrumentation filter.

/// The match-everything pattern.
pub const ALL_WILDCARD: &str = "*";

/// Compiled set of root-method declarations, kept as parallel arrays so
/// the planner's two matching passes can iterate by index.
#[derive(Debug, Clone, Default)]
pub struct RootSet {
    pub class_names: Vec<String>,
    pub class_wildcards: Vec<bool>,
    pub method_names: Vec<String>,
    pub method_signatures: Vec<String>,
    /// `true` marks a marker method, `false` a plain root.
    pub marker_methods: Vec<bool>,
}

impl RootSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a root method. `class` may be dotted or slashed and may end
    /// in `*`; a method name of `*` (or empty) covers the whole class.
    pub fn add_root(&mut self, class: &str, method: &str, signature: &str) {
        self.push(class, method, signature, false);
    }

    /// Declare a marker method; same pattern syntax as [`Self::add_root`].
    pub fn add_marker(&mut self, class: &str, method: &str, signature: &str) {
        self.push(class, method, signature, true);
    }

    fn push(&mut self, class: &str, method: &str, signature: &str, marker: bool) {
        let class = class.replace('.', "/");
        self.class_wildcards.push(is_class_wildcard(&class));
        self.class_names.push(class);
        self.method_names.push(method.to_string());
        self.method_signatures.push(signature.to_string());
        self.marker_methods.push(marker);
    }

    pub fn len(&self) -> usize {
        self.class_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.class_names.is_empty()
    }

    /// True when nothing was declared or every declaration is a marker.
    /// The planner then falls back to the implicit-root heuristics
    /// (`main` and `Runnable.run`).
    pub fn no_explicit_roots(&self) -> bool {
        self.marker_methods.iter().all(|&marker| marker)
    }
}

/// True for class patterns with a terminal `*`.
pub fn is_class_wildcard(pattern: &str) -> bool {
    pattern.ends_with('*')
}

/// True for patterns covering a whole package subtree (`com/app/*`, `*`).
pub fn is_package_wildcard(pattern: &str) -> bool {
    pattern == ALL_WILDCARD || pattern.ends_with("/*")
}

/// True for method names standing for "every method of the class".
pub fn is_method_wildcard(method_name: &str) -> bool {
    method_name.is_empty() || method_name == ALL_WILDCARD
}

/// Match a terminal-`*` pattern against a slash-form class name.
pub fn matches_wildcard(pattern: &str, class_name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => class_name.starts_with(prefix),
        None => false,
    }
}

fn pattern_matches(pattern: &str, class_name: &str) -> bool {
    if is_class_wildcard(pattern) {
        matches_wildcard(pattern, class_name)
    } else {
        pattern == class_name
    }
}

/// Include/exclude predicate deciding which classes get instrumented at
/// all. Root and marker methods bypass it; everything else in a rejected
/// class stays untouched.
#[derive(Debug, Clone, Default)]
pub struct InstrFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl InstrFilter {
    /// A filter that passes every class.
    pub fn pass_all() -> Self {
        Self::default()
    }

    /// Add an include pattern; with at least one include, only matching
    /// classes pass.
    pub fn allow(&mut self, pattern: &str) {
        self.include.push(pattern.replace('.', "/"));
    }

    /// Add an exclude pattern; matches are rejected even when included.
    pub fn deny(&mut self, pattern: &str) {
        self.exclude.push(pattern.replace('.', "/"));
    }

    pub fn passes(&self, class_name: &str) -> bool {
        if self.exclude.iter().any(|p| pattern_matches(p, class_name)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| pattern_matches(p, class_name))
    }
}
