use std::collections::{hash_map, HashMap};

use crate::plugin::Plugin;

/// Plugins from one discovery scan, keyed by name.
#[derive(Debug, Default)]
pub struct Registry {
    plugins: HashMap<String, Plugin>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `plugin`, returning any record it replaced under the same name.
    pub fn insert(&mut self, plugin: Plugin) -> Option<Plugin> {
        self.plugins.insert(plugin.name().to_string(), plugin)
    }

    pub fn get(&self, name: &str) -> Option<&Plugin> {
        self.plugins.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Plugin> {
        self.plugins.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Plugin> {
        self.plugins.remove(name)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> hash_map::Values<'_, String, Plugin> {
        self.plugins.values()
    }
}

impl IntoIterator for Registry {
    type Item = (String, Plugin);
    type IntoIter = hash_map::IntoIter<String, Plugin>;

    fn into_iter(self) -> Self::IntoIter {
        self.plugins.into_iter()
    }
}
