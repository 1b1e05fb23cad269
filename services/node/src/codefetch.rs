//! Code module resolution.
//!
//! Every container can serve code modules from its local store; a container
//! materializing a foreign agent resolves that agent's modules through a
//! remote source bound to the agent's class site. Bindings are cached per
//! (agent, class site) pair and dropped when the agent leaves, and each
//! binding caches fetched modules so one module crosses the wire at most
//! once per materialization.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::debug;

use caravan_id::{AgentName, ContainerName};
use caravan_wire::{Command, MobilityError, Reply};

use crate::transport::{call_with_retry, Transport};

/// File extension of a stored code module.
const MODULE_EXT: &str = "mod";

// =============================================================================
// Local store
// =============================================================================

/// This container's local code store: a registry directory plus optional
/// extra search paths, each either a directory or a `.tar.gz` bundle.
pub struct CodeStore {
    registry_dir: PathBuf,
    search_paths: Vec<PathBuf>,
}

impl CodeStore {
    pub fn new(registry_dir: PathBuf, search_paths: Vec<PathBuf>) -> Self {
        Self {
            registry_dir,
            search_paths,
        }
    }

    /// Resolves a module's bytes, scanning the registry first and the extra
    /// paths in configuration order.
    pub fn fetch(&self, module: &str, agent: &AgentName) -> Result<Vec<u8>, MobilityError> {
        let rel = module_rel_path(module).ok_or_else(|| MobilityError::CodeNotFound {
            module: module.to_string(),
            agent: agent.clone(),
        })?;

        if let Some(bytes) = read_from_dir(&self.registry_dir, &rel) {
            return Ok(bytes);
        }

        for path in &self.search_paths {
            let found = if is_archive(path) {
                read_from_archive(path, &rel)
            } else {
                read_from_dir(path, &rel)
            };
            if let Some(bytes) = found {
                debug!(module, path = %path.display(), "code module resolved from search path");
                return Ok(bytes);
            }
        }

        Err(MobilityError::CodeNotFound {
            module: module.to_string(),
            agent: agent.clone(),
        })
    }
}

/// Maps a module name to its relative file path: dots become directory
/// separators. Returns None for names that would escape the store.
fn module_rel_path(module: &str) -> Option<PathBuf> {
    if module.is_empty() || module.contains(['/', '\\']) {
        return None;
    }
    if module.split('.').any(|seg| seg.is_empty()) {
        return None;
    }
    let mut path: PathBuf = module.split('.').collect();
    path.set_extension(MODULE_EXT);
    Some(path)
}

fn is_archive(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

fn read_from_dir(dir: &Path, rel: &Path) -> Option<Vec<u8>> {
    std::fs::read(dir.join(rel)).ok()
}

fn read_from_archive(archive_path: &Path, rel: &Path) -> Option<Vec<u8>> {
    let file = std::fs::File::open(archive_path).ok()?;
    let mut archive = Archive::new(GzDecoder::new(file));
    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        let matches = entry.path().map(|p| p == rel).unwrap_or(false);
        if matches {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).ok()?;
            return Some(bytes);
        }
    }
    None
}

// =============================================================================
// Remote sources
// =============================================================================

/// Resolves code modules for one foreign agent against its class site,
/// caching each fetched module for the lifetime of the binding.
pub struct RemoteCodeSource {
    agent: AgentName,
    class_site: ContainerName,
    transport: Arc<dyn Transport>,
    fetched: Mutex<HashMap<String, Vec<u8>>>,
}

impl RemoteCodeSource {
    pub fn new(agent: AgentName, class_site: ContainerName, transport: Arc<dyn Transport>) -> Self {
        Self {
            agent,
            class_site,
            transport,
            fetched: Mutex::new(HashMap::new()),
        }
    }

    pub fn class_site(&self) -> &ContainerName {
        &self.class_site
    }

    /// Fetches one module from the class site, retrying once on link failure
    /// against a refreshed handle.
    pub async fn resolve(&self, module: &str) -> Result<Vec<u8>, MobilityError> {
        if let Some(bytes) = self.lock_fetched().get(module).cloned() {
            return Ok(bytes);
        }

        let reply = call_with_retry(
            self.transport.as_ref(),
            &self.class_site,
            Command::FetchCodeModule {
                module: module.to_string(),
                agent: self.agent.clone(),
            },
        )
        .await?;

        let bytes = match reply {
            Reply::Code { bytes } => bytes,
            other => {
                return Err(MobilityError::link(
                    &self.class_site,
                    format!("unexpected reply {:?} to code fetch", other),
                ))
            }
        };
        debug!(
            agent = %self.agent,
            class_site = %self.class_site,
            module,
            size = bytes.len(),
            "code module fetched"
        );
        self.lock_fetched().insert(module.to_string(), bytes.clone());
        Ok(bytes)
    }

    fn lock_fetched(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        match self.fetched.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Cache of remote source bindings, keyed by agent and class site.
#[derive(Default)]
pub struct CodeSourceCache {
    sources: Mutex<HashMap<(AgentName, ContainerName), Arc<RemoteCodeSource>>>,
}

impl CodeSourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the binding for this agent and class site, creating it on
    /// first use.
    pub fn source_for(
        &self,
        agent: &AgentName,
        class_site: &ContainerName,
        transport: &Arc<dyn Transport>,
    ) -> Arc<RemoteCodeSource> {
        let key = (agent.clone(), class_site.clone());
        let mut sources = self.lock_sources();
        Arc::clone(sources.entry(key).or_insert_with(|| {
            Arc::new(RemoteCodeSource::new(
                agent.clone(),
                class_site.clone(),
                Arc::clone(transport),
            ))
        }))
    }

    /// Drops every binding of an agent that left this container.
    pub fn remove_agent(&self, agent: &AgentName) {
        self.lock_sources().retain(|(a, _), _| a != agent);
    }

    fn lock_sources(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(AgentName, ContainerName), Arc<RemoteCodeSource>>> {
        match self.sources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
