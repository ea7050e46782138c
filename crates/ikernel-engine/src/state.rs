//! State tracked across submissions.

use std::collections::BTreeMap;

use serde_json::Value;

/// A variable tracked across submissions.
#[derive(Debug, Clone)]
pub struct TrackedVariable {
    pub name: String,
    /// The type the variable was declared with.
    pub type_descriptor: String,
    /// Most recently stored value.
    pub value: Value,
}

/// The persistent evaluation state: tracked variables and declared
/// methods.
#[derive(Default)]
pub struct ShellState {
    variables: BTreeMap<String, TrackedVariable>,
    methods: BTreeMap<String, String>,
}

impl ShellState {
    /// Create empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a declared field. Redeclaration replaces the
    /// descriptor and resets the value.
    pub fn declare_field(&mut self, name: impl Into<String>, type_descriptor: impl Into<String>) {
        let name = name.into();
        self.variables.insert(
            name.clone(),
            TrackedVariable {
                name,
                type_descriptor: type_descriptor.into(),
                value: Value::Null,
            },
        );
    }

    /// Record a declared method's source.
    pub fn declare_method(&mut self, name: impl Into<String>, code: impl Into<String>) {
        self.methods.insert(name.into(), code.into());
    }

    /// Stop tracking a variable, removing it whole.
    pub fn undeclare_field(&mut self, name: &str) -> Option<TrackedVariable> {
        self.variables.remove(name)
    }

    /// Store a variable's latest value.
    pub fn set_value(&mut self, name: &str, value: Value) {
        if let Some(variable) = self.variables.get_mut(name) {
            variable.value = value;
        }
    }

    /// Look up a tracked variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TrackedVariable> {
        self.variables.get(name)
    }

    /// Names of all tracked variables.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.variables.keys().cloned().collect()
    }

    /// Iterate tracked variables.
    pub fn variables(&self) -> impl Iterator<Item = &TrackedVariable> {
        self.variables.values()
    }

    /// Declared methods as (name, source) pairs.
    #[must_use]
    pub fn methods(&self) -> Vec<(String, String)> {
        self.methods
            .iter()
            .map(|(name, code)| (name.clone(), code.clone()))
            .collect()
    }

    /// Whether a method with this name was declared.
    #[must_use]
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }
}
