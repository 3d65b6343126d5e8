//! Coordinate registry - the single source of truth for agent addressing.
//!
//! The registry document is parsed into an immutable [`RegistrySnapshot`].
//! Readers clone the current `Arc<RegistrySnapshot>` and work on that value;
//! `reload` builds a complete replacement and swaps the pointer, so a reader
//! sees either the old or the new snapshot, never a mix.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::message::ALL_RECIPIENTS;
use crate::types::{AgentId, Error, Result, ScreenBounds};

/// Screen position the actuator clicks to focus an agent's input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 2]", into = "[i32; 2]")]
pub struct Address {
    pub x: i32,
    pub y: i32,
}

impl From<[i32; 2]> for Address {
    fn from([x, y]: [i32; 2]) -> Self {
        Self { x, y }
    }
}

impl From<Address> for [i32; 2] {
    fn from(a: Address) -> Self {
        [a.x, a.y]
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// What an agent is for, resolved once from its registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRole {
    pub id: AgentId,
    pub capabilities: BTreeSet<String>,
}

impl AgentRole {
    pub fn can(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// One registered agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    pub id: AgentId,
    pub primary: Address,
    pub onboarding: Address,
    pub description: String,
    pub active: bool,
    pub role: AgentRole,
}

/// On-disk entry shape.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AgentEntry {
    id: String,
    primary_coordinates: Address,
    onboarding_coordinates: Address,
    #[serde(default)]
    description: String,
    #[serde(default = "default_active")]
    active: bool,
    #[serde(default)]
    capabilities: BTreeSet<String>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    agents: Vec<AgentEntry>,
}

/// Immutable view of the registry at one point in time.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    agents: BTreeMap<AgentId, Agent>,
}

impl RegistrySnapshot {
    /// Parse and validate a registry document.
    pub fn parse(raw: &str, bounds: &ScreenBounds) -> Result<Self> {
        let doc: RegistryDocument = serde_json::from_str(raw)
            .map_err(|e| Error::config(format!("malformed registry: {}", e)))?;

        let mut agents = BTreeMap::new();
        for entry in doc.agents {
            if entry.id.eq_ignore_ascii_case(ALL_RECIPIENTS) {
                return Err(Error::config(format!(
                    "agent id {:?} is reserved for broadcast",
                    entry.id
                )));
            }
            let id = AgentId::from_string(entry.id.clone())
                .map_err(|e| Error::config(format!("agent id {:?}: {}", entry.id, e)))?;

            for (label, addr) in [
                ("primary_coordinates", entry.primary_coordinates),
                ("onboarding_coordinates", entry.onboarding_coordinates),
            ] {
                if !bounds.contains(addr.x, addr.y) {
                    return Err(Error::config(format!(
                        "{} of {} at {} is outside screen bounds",
                        label, id, addr
                    )));
                }
            }

            let agent = Agent {
                role: AgentRole {
                    id: id.clone(),
                    capabilities: entry.capabilities,
                },
                id: id.clone(),
                primary: entry.primary_coordinates,
                onboarding: entry.onboarding_coordinates,
                description: entry.description,
                active: entry.active,
            };
            if agents.insert(id.clone(), agent).is_some() {
                return Err(Error::config(format!("duplicate agent id: {}", id)));
            }
        }

        Ok(Self { agents })
    }

    pub fn get(&self, id: &AgentId) -> Option<&Agent> {
        self.agents.get(id)
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }

    /// Active agent ids in stable (sorted) order.
    pub fn active_ids(&self) -> Vec<AgentId> {
        self.agents
            .values()
            .filter(|a| a.active)
            .map(|a| a.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Registry handle shared by the router and the delivery worker.
#[derive(Debug)]
pub struct CoordinateRegistry {
    path: PathBuf,
    bounds: ScreenBounds,
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl CoordinateRegistry {
    /// Load the registry document at `path`. The path must be absolute.
    pub fn load(path: &Path, bounds: ScreenBounds) -> Result<Self> {
        if !path.is_absolute() {
            return Err(Error::config(format!(
                "registry path must be absolute: {}",
                path.display()
            )));
        }
        let snapshot = read_snapshot(path, &bounds)?;
        tracing::info!(
            path = %path.display(),
            agents = snapshot.len(),
            "registry_loaded"
        );
        Ok(Self {
            path: path.to_path_buf(),
            bounds,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Registry backed by an in-memory snapshot. `reload` re-reads `path`.
    pub fn from_snapshot(path: PathBuf, bounds: ScreenBounds, snapshot: RegistrySnapshot) -> Self {
        Self {
            path,
            bounds,
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Re-read the document and swap it in. On error the old snapshot stays.
    pub fn reload(&self) -> Result<()> {
        let snapshot = Arc::new(read_snapshot(&self.path, &self.bounds)?);
        let agents = snapshot.len();
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
        tracing::info!(path = %self.path.display(), agents, "registry_reloaded");
        Ok(())
    }

    /// Current snapshot. Cheap; hold it for a consistent multi-lookup view.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Primary address of a registered agent (active or not).
    pub fn resolve(&self, id: &AgentId) -> Result<Address> {
        self.snapshot()
            .get(id)
            .map(|a| a.primary)
            .ok_or_else(|| Error::unknown_recipient(id.as_str()))
    }

    pub fn agent(&self, id: &AgentId) -> Result<Agent> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::unknown_recipient(id.as_str()))
    }

    pub fn is_active(&self, id: &AgentId) -> bool {
        self.snapshot().get(id).is_some_and(|a| a.active)
    }

    pub fn list_active(&self) -> Vec<AgentId> {
        self.snapshot().active_ids()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_snapshot(path: &Path, bounds: &ScreenBounds) -> Result<RegistrySnapshot> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("registry {}: {}", path.display(), e)))?;
    RegistrySnapshot::parse(&raw, bounds).map_err(|e| match e {
        Error::Config(msg) => Error::config(format!("registry {}: {}", path.display(), msg)),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "agents": [
            { "id": "Agent-1", "primary_coordinates": [100, 200], "onboarding_coordinates": [110, 260],
              "description": "Integration specialist", "active": true, "capabilities": ["deploy"] },
            { "id": "Agent-2", "primary_coordinates": [-1200, 400], "onboarding_coordinates": [-1190, 460],
              "description": "Quality", "active": false }
        ]
    }"#;

    fn write_registry(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("agents.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_registry(dir.path(), DOC);
        let registry = CoordinateRegistry::load(&path, ScreenBounds::default()).unwrap();

        assert_eq!(
            registry.resolve(&AgentId::must("Agent-1")).unwrap(),
            Address { x: 100, y: 200 }
        );
        assert_eq!(
            registry.resolve(&AgentId::must("Agent-2")).unwrap(),
            Address { x: -1200, y: 400 }
        );
        assert_eq!(registry.list_active(), vec![AgentId::must("Agent-1")]);

        let agent = registry.agent(&AgentId::must("Agent-1")).unwrap();
        assert!(agent.role.can("deploy"));
        assert_eq!(agent.onboarding, Address { x: 110, y: 260 });
    }

    #[test]
    fn test_resolve_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_registry(dir.path(), DOC);
        let registry = CoordinateRegistry::load(&path, ScreenBounds::default()).unwrap();

        let err = registry.resolve(&AgentId::must("Agent-9")).unwrap_err();
        assert!(matches!(err, Error::UnknownRecipient(_)));
    }

    #[test]
    fn test_relative_path_rejected() {
        let err = CoordinateRegistry::load(Path::new("agents.json"), ScreenBounds::default())
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CoordinateRegistry::load(&dir.path().join("nope.json"), ScreenBounds::default())
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let doc = r#"{ "agents": [ { "id": "Agent-1", "primary_coordinates": [99999, 0],
                       "onboarding_coordinates": [0, 0] } ] }"#;
        let err = RegistrySnapshot::parse(doc, &ScreenBounds::default()).unwrap_err();
        assert!(err.to_string().contains("outside screen bounds"));
    }

    #[test]
    fn test_duplicate_and_reserved_ids_rejected() {
        let dup = r#"{ "agents": [
            { "id": "Agent-1", "primary_coordinates": [0, 0], "onboarding_coordinates": [0, 0] },
            { "id": "Agent-1", "primary_coordinates": [5, 5], "onboarding_coordinates": [5, 5] } ] }"#;
        assert!(RegistrySnapshot::parse(dup, &ScreenBounds::default()).is_err());

        let reserved = r#"{ "agents": [
            { "id": "all", "primary_coordinates": [0, 0], "onboarding_coordinates": [0, 0] } ] }"#;
        assert!(RegistrySnapshot::parse(reserved, &ScreenBounds::default()).is_err());
    }

    #[test]
    fn test_malformed_json_rejected() {
        let err = RegistrySnapshot::parse("{ \"agents\": [", &ScreenBounds::default()).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_reload_swaps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_registry(dir.path(), DOC);
        let registry = CoordinateRegistry::load(&path, ScreenBounds::default()).unwrap();
        let before = registry.snapshot();

        std::fs::write(
            &path,
            r#"{ "agents": [ { "id": "Agent-1", "primary_coordinates": [300, 300],
                 "onboarding_coordinates": [300, 360], "active": false } ] }"#,
        )
        .unwrap();
        registry.reload().unwrap();

        // Old snapshot is untouched; new lookups see the reload.
        assert_eq!(before.len(), 2);
        assert!(!registry.is_active(&AgentId::must("Agent-1")));
        assert_eq!(
            registry.resolve(&AgentId::must("Agent-1")).unwrap(),
            Address { x: 300, y: 300 }
        );
    }

    #[test]
    fn test_failed_reload_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_registry(dir.path(), DOC);
        let registry = CoordinateRegistry::load(&path, ScreenBounds::default()).unwrap();

        std::fs::write(&path, "not json").unwrap();
        assert!(registry.reload().unwrap_err().is_config());
        assert!(registry.is_active(&AgentId::must("Agent-1")));
    }
}
