//! The per-run global symbol table.
//!
//! A [`Namespace`] is never patched in place across compiles: it is built from a
//! [`NamespaceTemplate`] (host-provided values and built-in function names), then
//! the compiled script's functions are layered on top. Variables created by the
//! script's global scope land in the underlying Rhai [`Scope`].

use std::collections::{BTreeMap, BTreeSet};

use rhai::{Dynamic, Scope, AST};

/// Host-supplied starting point for every run's namespace.
#[derive(Debug, Clone, Default)]
pub struct NamespaceTemplate {
    globals: BTreeMap<String, Dynamic>,
    builtins: BTreeSet<String>,
}

impl NamespaceTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a global value (pushed into every fresh scope).
    pub fn with_global(mut self, name: impl Into<String>, value: impl Into<Dynamic>) -> Self {
        self.globals.insert(name.into(), value.into());
        self
    }

    /// Record the name of a natively registered function.
    pub fn with_builtin(mut self, name: impl Into<String>) -> Self {
        self.builtins.insert(name.into());
        self
    }

    pub fn with_builtins<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.builtins.extend(names.into_iter().map(Into::into));
        self
    }

    /// Merge another template into this one; entries in `other` win.
    pub fn merge(mut self, other: NamespaceTemplate) -> Self {
        self.globals.extend(other.globals);
        self.builtins.extend(other.builtins);
        self
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.globals
            .keys()
            .chain(self.builtins.iter())
            .cloned()
            .collect()
    }
}

/// Signature summary of a function defined by the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFunction {
    pub name: String,
    pub arity: usize,
}

pub struct Namespace {
    scope: Scope<'static>,
    builtins: BTreeSet<String>,
    functions: BTreeMap<String, ScriptFunction>,
}

impl Namespace {
    pub fn from_template(template: &NamespaceTemplate) -> Self {
        let mut scope = Scope::new();
        for (name, value) in &template.globals {
            scope.push_dynamic(name.clone(), value.clone());
        }
        Self {
            scope,
            builtins: template.builtins.clone(),
            functions: BTreeMap::new(),
        }
    }

    /// Register the functions defined in `ast` (user hooks and helpers).
    pub fn with_script_functions(mut self, ast: &AST) -> Self {
        for f in ast.iter_functions() {
            self.functions.insert(
                f.name.to_string(),
                ScriptFunction {
                    name: f.name.to_string(),
                    arity: f.params.len(),
                },
            );
        }
        self
    }

    /// Every name visible to the script: globals, built-ins and script functions.
    pub fn keys(&self) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = self
            .scope
            .iter()
            .map(|(name, _, _)| name.to_string())
            .collect();
        keys.extend(self.builtins.iter().cloned());
        keys.extend(self.functions.keys().cloned());
        keys
    }

    /// Current value of every global, for lookups from inside script functions.
    pub fn snapshot(&self) -> BTreeMap<String, Dynamic> {
        self.scope
            .iter()
            .map(|(name, _, value)| (name.to_string(), value))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Dynamic> {
        self.scope.get_value::<Dynamic>(name)
    }

    /// Set (or add) a global. Script-declared constants are left untouched.
    pub fn set(&mut self, name: &str, value: impl Into<Dynamic>) {
        if self.scope.is_constant(name) == Some(true) {
            return;
        }
        self.scope.set_value(name.to_string(), value.into());
    }

    pub fn function(&self, name: &str) -> Option<&ScriptFunction> {
        self.functions.get(name)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn scope_mut(&mut self) -> &mut Scope<'static> {
        &mut self.scope
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> NamespaceTemplate {
        NamespaceTemplate::new()
            .with_global("WIDTH", 512_i64)
            .with_builtins(["rect", "oval"])
    }

    #[test]
    fn test_fresh_namespace_matches_template() {
        let t = template();
        let ns = Namespace::from_template(&t);
        assert_eq!(ns.keys(), t.names());
        assert_eq!(ns.get("WIDTH").unwrap().as_int().unwrap(), 512);
    }

    #[test]
    fn test_script_functions_are_added() {
        let ast = rhai::Engine::new()
            .compile("fn setup() {} fn draw(x) { x }")
            .unwrap();
        let ns = Namespace::from_template(&template()).with_script_functions(&ast);
        assert!(ns.has_function("setup"));
        assert_eq!(ns.function("draw").unwrap().arity, 1);
        assert!(!ns.has_function("stop"));
        assert!(ns.keys().contains("draw"));
    }

    #[test]
    fn test_set_skips_constants() {
        let mut ns = Namespace::from_template(&template());
        ns.scope_mut().push_constant("FRAME", 1_i64);
        ns.set("FRAME", 5_i64);
        assert_eq!(ns.get("FRAME").unwrap().as_int().unwrap(), 1);
        ns.set("MOUSEX", 3.5 as rhai::FLOAT);
        assert!(ns.keys().contains("MOUSEX"));
    }
}
