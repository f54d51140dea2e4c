use std::collections::BTreeMap;
use std::process::Command;

/// Variables layered over the inherited environment of a launched process.
///
/// A variable can either be set or removed. Anything not mentioned is inherited from the
/// test process unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment(BTreeMap<String, Option<String>>);

impl Environment {
    /// Creates an empty set of overrides.
    ///
    /// # Returns
    /// * `Self` - Overrides that leave the inherited environment untouched
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Sets `key` to `value` for the launched process
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), Some(value.into()));
    }

    /// Hides `key` from the launched process even if the test process has it
    pub fn remove(&mut self, key: impl Into<String>) {
        self.0.insert(key.into(), None);
    }

    /// Merges `other` into this set; entries of `other` win.
    pub fn extend(&mut self, other: Environment) {
        self.0.extend(other.0);
    }

    /// Value that will be set for `key`, if this set sets it
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.as_deref())
    }

    /// True when `key` is scheduled for removal from the child environment
    pub fn is_removed(&self, key: &str) -> bool {
        matches!(self.0.get(key), Some(None))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Applies the overrides on top of whatever `command` inherits
    pub fn apply(&self, command: &mut Command) {
        for (key, value) in &self.0 {
            match value {
                Some(value) => command.env(key, value),
                None => command.env_remove(key),
            };
        }
    }
}

impl<K, V> FromIterator<(K, V)> for Environment
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = Environment::new();
        for (key, value) in iter {
            env.set(key, value);
        }
        env
    }
}
