use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
};

use crate::{
    config::DEFAULT_HOST,
    error::{PluginError, Result},
    plugin::Plugin,
    port::{EphemeralPorts, PortAllocator},
    registry::Registry,
};

/// Attempts to draw a port not already handed out during the same scan.
const MAX_ALLOCATION_ATTEMPTS: usize = 8;

/// Builds plugin records from executables on disk, giving each a fresh port.
#[derive(Debug, Clone)]
pub struct Loader<A = EphemeralPorts> {
    allocator: A,
    host: String,
}

impl Default for Loader<EphemeralPorts> {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader<EphemeralPorts> {
    pub fn new() -> Self {
        Self::with_allocator(EphemeralPorts)
    }
}

impl<A: PortAllocator> Loader<A> {
    pub fn with_allocator(allocator: A) -> Self {
        Self {
            allocator,
            host: DEFAULT_HOST.into(),
        }
    }

    /// Overrides the host records are dialed on.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Builds a record for a single executable.
    pub fn load_one(&self, path: impl AsRef<Path>) -> Result<Plugin> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let name = plugin_name(&file_name);
        let port = self.allocate(name, &HashSet::new())?;
        let plugin = Plugin::new(name, path, self.host.clone(), port);
        tracing::debug!(plugin = %name, port, path = %path.display(), "loaded plugin");
        metrics::counter!("warden_plugins_loaded_total").increment(1);
        Ok(plugin)
    }

    /// Builds a registry from every entry of `dir` (non-recursive).
    ///
    /// Entries are visited in file-name order. Entries that derive the same
    /// name replace each other, so the last one in that order wins. The first
    /// read or allocation failure aborts the scan.
    pub fn load_directory(&self, dir: impl AsRef<Path>) -> Result<Registry> {
        let dir = dir.as_ref();
        let discovery_err = |source: io::Error| PluginError::Discovery {
            path: dir.to_path_buf(),
            source,
        };

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(discovery_err)? {
            entries.push(entry.map_err(discovery_err)?.file_name());
        }
        entries.sort();

        let mut registry = Registry::new();
        let mut taken = HashSet::new();
        for file_name in entries {
            let file_name_str = file_name.to_string_lossy();
            if file_name_str.is_empty() {
                continue;
            }
            let name = plugin_name(&file_name_str);
            let port = self.allocate(name, &taken)?;
            taken.insert(port);

            let path: PathBuf = dir.join(&file_name);
            let plugin = Plugin::new(name, path, self.host.clone(), port);
            if let Some(previous) = registry.insert(plugin) {
                tracing::warn!(
                    plugin = %name,
                    replaced = %previous.executable().display(),
                    "plugin name collision; keeping the later entry"
                );
                metrics::counter!("warden_plugin_name_collisions_total").increment(1);
            }
        }

        tracing::info!(dir = %dir.display(), count = registry.len(), "loaded plugin directory");
        metrics::counter!("warden_plugins_loaded_total").increment(registry.len() as u64);
        Ok(registry)
    }

    fn allocate(&self, name: &str, taken: &HashSet<u16>) -> Result<u16> {
        let alloc_err = |source| PluginError::Allocation {
            name: name.to_string(),
            source,
        };
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let port = self.allocator.allocate().map_err(alloc_err)?;
            if !taken.contains(&port) {
                return Ok(port);
            }
        }
        Err(alloc_err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "allocator kept returning ports already assigned in this scan",
        )))
    }
}

/// Plugin name for a file name: the text before the first `.`.
pub fn plugin_name(file_name: &str) -> &str {
    file_name.split('.').next().unwrap_or(file_name)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    struct Sequential(Cell<u16>);

    impl PortAllocator for Sequential {
        fn allocate(&self) -> io::Result<u16> {
            let port = self.0.get();
            self.0.set(port + 1);
            Ok(port)
        }
    }

    struct Exhausted;

    impl PortAllocator for Exhausted {
        fn allocate(&self) -> io::Result<u16> {
            Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "no ports left"))
        }
    }

    struct Stuck;

    impl PortAllocator for Stuck {
        fn allocate(&self) -> io::Result<u16> {
            Ok(5000)
        }
    }

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(name), b"").unwrap();
        }
    }

    #[test]
    fn name_is_text_before_first_dot() {
        assert_eq!(plugin_name("echo.tar.gz"), "echo");
        assert_eq!(plugin_name("echo"), "echo");
        assert_eq!(plugin_name(".hidden"), "");
    }

    #[test]
    fn load_one_uses_loopback_host_and_allocated_port() {
        let loader = Loader::with_allocator(Sequential(Cell::new(4100)));
        let plugin = loader.load_one("bin/echo.plugin").unwrap();
        assert_eq!(plugin.name(), "echo");
        assert_eq!(plugin.host(), "localhost");
        assert_eq!(plugin.port(), 4100);
        assert_eq!(plugin.executable(), Path::new("bin/echo.plugin"));
    }

    #[test]
    fn load_one_propagates_allocation_failure() {
        let err = Loader::with_allocator(Exhausted).load_one("echo").unwrap_err();
        match err {
            PluginError::Allocation { name, source } => {
                assert_eq!(name, "echo");
                assert_eq!(source.kind(), io::ErrorKind::AddrNotAvailable);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn directory_yields_one_record_per_entry_with_distinct_ports() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["alpha", "beta.sh", "gamma.bin"]);

        let registry = Loader::new().load_directory(dir.path()).unwrap();
        assert_eq!(registry.names(), vec!["alpha", "beta", "gamma"]);
        let ports: HashSet<u16> = registry.iter().map(Plugin::port).collect();
        assert_eq!(ports.len(), 3);
        assert_eq!(
            registry.get("beta").unwrap().executable(),
            dir.path().join("beta.sh")
        );
    }

    #[test]
    fn colliding_names_keep_the_last_entry() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["foo.bin", "foo.sh"]);

        let registry = Loader::new().load_directory(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("foo").unwrap().executable(),
            dir.path().join("foo.sh")
        );
    }

    #[test]
    fn directory_load_stops_on_allocation_failure() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["alpha"]);
        let err = Loader::with_allocator(Exhausted)
            .load_directory(dir.path())
            .unwrap_err();
        assert!(matches!(err, PluginError::Allocation { .. }));
    }

    #[test]
    fn allocator_repeating_ports_is_an_allocation_error() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["alpha", "beta"]);
        let err = Loader::with_allocator(Stuck)
            .load_directory(dir.path())
            .unwrap_err();
        assert!(matches!(err, PluginError::Allocation { ref name, .. } if name == "beta"));
    }

    #[test]
    fn missing_directory_is_a_discovery_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Loader::new()
            .load_directory(dir.path().join("absent"))
            .unwrap_err();
        assert!(matches!(err, PluginError::Discovery { .. }));
    }

    #[test]
    fn host_override_applies_to_every_record() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["alpha", "beta"]);
        let registry = Loader::with_allocator(Sequential(Cell::new(6000)))
            .with_host("127.0.0.1")
            .load_directory(dir.path())
            .unwrap();
        assert!(registry.iter().all(|plugin| plugin.host() == "127.0.0.1"));
    }
}
