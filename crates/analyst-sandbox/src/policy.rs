//! Compiled sandbox policy
//!
//! One lookup structure shared by the static scanner and the harness
//! context, so both sides block exactly the same names.

use analyst_core::{SandboxPolicy, Violation, ViolationCategory};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Builtins whose purpose is namespace introspection
const REFLECTIVE_BUILTINS: &[&str] =
    &["getattr", "setattr", "delattr", "globals", "locals", "vars"];

const NETWORK_ATTRIBUTES: &[&str] = &["urlopen", "urlretrieve", "create_connection"];

const FILESYSTEM_ATTRIBUTES: &[&str] = &["rmtree"];

/// Bare names that only serve to escape the namespace
const REFLECTIVE_NAMES: &[&str] = &[
    "__builtins__",
    "__loader__",
    "__spec__",
    "__globals__",
    "__subclasses__",
    "__code__",
    "__dict__",
];

/// Attributes that reach the interpreter's own module table
const INTERPRETER_ATTRIBUTES: &[&str] = &["sys", "modules", "builtins"];

/// Dunder attributes analysis code legitimately reads
const HARMLESS_DUNDERS: &[&str] = &["__name__", "__doc__", "__version__"];

/// Policy prepared for lookups
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    allowed_modules: HashSet<String>,
    builtins: HashMap<String, ViolationCategory>,
    attributes: HashMap<String, ViolationCategory>,
}

impl CompiledPolicy {
    /// Compile from configuration
    #[must_use]
    pub fn new(policy: &SandboxPolicy) -> Self {
        let builtins = policy
            .blocked_builtins
            .iter()
            .map(|name| (name.clone(), builtin_category(name)))
            .collect();
        let attributes = policy
            .blocked_attributes
            .iter()
            .map(|name| (name.clone(), attribute_category(name)))
            .collect();
        Self {
            allowed_modules: policy.allowed_modules.iter().cloned().collect(),
            builtins,
            attributes,
        }
    }

    /// Violation for importing `module`, if it is not whitelisted
    #[must_use]
    pub fn check_import(&self, module: &str) -> Option<Violation> {
        let module = module.trim();
        if module.starts_with('.') {
            return Some(Violation::new(ViolationCategory::Import, module));
        }
        let root = module.split('.').next().unwrap_or(module).trim();
        if self.allowed_modules.contains(root) {
            None
        } else {
            Some(Violation::new(ViolationCategory::Import, module))
        }
    }

    /// Names blocked even where the script binds them itself
    #[must_use]
    pub fn is_escape_name(name: &str) -> bool {
        REFLECTIVE_NAMES.contains(&name)
    }

    /// Category of a blocked builtin name
    #[must_use]
    pub fn check_name(&self, name: &str) -> Option<ViolationCategory> {
        if REFLECTIVE_NAMES.contains(&name) {
            return Some(ViolationCategory::Reflection);
        }
        self.builtins.get(name).copied()
    }

    /// Category of a blocked attribute name
    #[must_use]
    pub fn check_attribute(&self, name: &str) -> Option<ViolationCategory> {
        if INTERPRETER_ATTRIBUTES.contains(&name)
            || (is_dunder(name) && !HARMLESS_DUNDERS.contains(&name))
        {
            return Some(ViolationCategory::Reflection);
        }
        self.attributes.get(name).copied()
    }

    /// Whitelisted modules, sorted
    #[must_use]
    pub fn allowed_modules(&self) -> Vec<&str> {
        let mut modules: Vec<&str> = self.allowed_modules.iter().map(String::as_str).collect();
        modules.sort_unstable();
        modules
    }

    /// Blocked builtins with their categories, for the runtime harness
    #[must_use]
    pub fn blocked_builtins(&self) -> BTreeMap<&str, ViolationCategory> {
        self.builtins.iter().map(|(k, v)| (k.as_str(), *v)).collect()
    }
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

fn builtin_category(name: &str) -> ViolationCategory {
    if REFLECTIVE_BUILTINS.contains(&name) {
        ViolationCategory::Reflection
    } else {
        ViolationCategory::Call
    }
}

fn attribute_category(name: &str) -> ViolationCategory {
    if NETWORK_ATTRIBUTES.contains(&name) {
        ViolationCategory::Network
    } else if FILESYSTEM_ATTRIBUTES.contains(&name) {
        ViolationCategory::FileSystem
    } else {
        ViolationCategory::Process
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CompiledPolicy {
        CompiledPolicy::new(&SandboxPolicy::default())
    }

    #[test]
    fn imports_are_checked_by_root() {
        let p = policy();
        assert!(p.check_import("pandas").is_none());
        assert!(p.check_import("matplotlib.pyplot").is_none());
        assert_eq!(
            p.check_import("subprocess"),
            Some(Violation::new(ViolationCategory::Import, "subprocess"))
        );
        assert!(p.check_import("os.path").is_some());
        assert!(p.check_import(".sibling").is_some());
    }

    #[test]
    fn builtins_are_categorized() {
        let p = policy();
        assert_eq!(p.check_name("eval"), Some(ViolationCategory::Call));
        assert_eq!(p.check_name("getattr"), Some(ViolationCategory::Reflection));
        assert_eq!(p.check_name("__builtins__"), Some(ViolationCategory::Reflection));
        assert_eq!(p.check_name("print"), None);
        assert_eq!(p.check_name("open"), None);
    }

    #[test]
    fn attributes_are_categorized() {
        let p = policy();
        assert_eq!(p.check_attribute("system"), Some(ViolationCategory::Process));
        assert_eq!(p.check_attribute("urlopen"), Some(ViolationCategory::Network));
        assert_eq!(p.check_attribute("rmtree"), Some(ViolationCategory::FileSystem));
        assert_eq!(p.check_attribute("__class__"), Some(ViolationCategory::Reflection));
        assert_eq!(p.check_attribute("sys"), Some(ViolationCategory::Reflection));
        assert_eq!(p.check_attribute("modules"), Some(ViolationCategory::Reflection));
        assert_eq!(p.check_attribute("builtins"), Some(ViolationCategory::Reflection));
        assert_eq!(p.check_attribute("__version__"), None);
        assert_eq!(p.check_attribute("groupby"), None);
    }

    #[test]
    fn harness_view_matches_config() {
        let p = policy();
        let builtins = p.blocked_builtins();
        assert_eq!(builtins.get("vars"), Some(&ViolationCategory::Reflection));
        assert!(p.allowed_modules().windows(2).all(|w| w[0] <= w[1]));
    }
}
