use onio_core::config::{parse_document, validate_agents};
use onio_core::{AgentDefinition, Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Supplies agent definitions to the registry.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<Vec<AgentDefinition>>;

    /// Human-readable origin, for logs.
    fn describe(&self) -> String;
}

/// Definitions held in memory, typically taken from the main config file.
pub struct StaticSource(pub Vec<AgentDefinition>);

impl ConfigSource for StaticSource {
    fn load(&self) -> Result<Vec<AgentDefinition>> {
        Ok(self.0.clone())
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AgentsDocument {
    List(Vec<AgentDefinition>),
    Wrapped { agents: Vec<AgentDefinition> },
}

/// Definitions read from a JSON, JSON5 or YAML file on every load.
///
/// The file holds either a bare list of agents or a document with an `agents` field.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<Vec<AgentDefinition>> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let doc: AgentsDocument = parse_document(&self.path, &content)
            .map_err(|e| Error::Config(format!("invalid agents file {}: {}", self.path.display(), e)))?;
        Ok(match doc {
            AgentsDocument::List(agents) => agents,
            AgentsDocument::Wrapped { agents } => agents,
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Immutable view of the agents active at one point in time.
#[derive(Debug)]
pub struct Snapshot {
    generation: u64,
    agents: HashMap<String, Arc<AgentDefinition>>,
    order: Vec<String>,
}

impl Snapshot {
    fn build(generation: u64, defs: Vec<AgentDefinition>) -> Self {
        let order = defs.iter().map(|a| a.id.clone()).collect();
        let agents = defs
            .into_iter()
            .map(|a| (a.id.clone(), Arc::new(a)))
            .collect();
        Self {
            generation,
            agents,
            order,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, id: &str) -> Option<Arc<AgentDefinition>> {
        self.agents.get(id).cloned()
    }

    /// Agents in configuration order.
    pub fn agents(&self) -> Vec<Arc<AgentDefinition>> {
        self.order.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn same_definitions(&self, defs: &[AgentDefinition]) -> bool {
        self.order.len() == defs.len()
            && defs
                .iter()
                .zip(&self.order)
                .all(|(d, id)| &d.id == id && self.agents.get(id).map_or(false, |a| a.as_ref() == d))
    }
}

/// Agent lookup table, swapped wholesale on reload.
pub struct AgentRegistry {
    current: RwLock<Arc<Snapshot>>,
    max_agents: usize,
}

impl AgentRegistry {
    pub fn new(agents: Vec<AgentDefinition>, max_agents: usize) -> Result<Self> {
        validate_agents(&agents, max_agents)?;
        info!(agents = agents.len(), "Agent registry initialized");
        Ok(Self {
            current: RwLock::new(Arc::new(Snapshot::build(1, agents))),
            max_agents,
        })
    }

    pub fn from_source(source: &dyn ConfigSource, max_agents: usize) -> Result<Self> {
        Self::new(source.load()?, max_agents)
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn lookup(&self, agent_id: &str) -> Result<Arc<AgentDefinition>> {
        self.snapshot()
            .get(agent_id)
            .ok_or_else(|| Error::UnknownAgent(agent_id.to_string()))
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.snapshot().order.clone()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    /// Load, validate and swap in new definitions. On any error the previous
    /// snapshot stays active. Returns the generation now in effect.
    pub fn reload(&self, source: &dyn ConfigSource) -> Result<u64> {
        let defs = match source.load().and_then(|defs| {
            validate_agents(&defs, self.max_agents)?;
            Ok(defs)
        }) {
            Ok(defs) => defs,
            Err(e) => {
                warn!(source = %source.describe(), error = %e, "Agent reload rejected, keeping previous definitions");
                return Err(match e {
                    e @ Error::Config(_) => e,
                    other => Error::Config(other.to_string()),
                });
            }
        };

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if current.same_definitions(&defs) {
            debug!(source = %source.describe(), generation = current.generation, "Agent definitions unchanged");
            return Ok(current.generation);
        }
        let generation = current.generation + 1;
        *current = Arc::new(Snapshot::build(generation, defs));
        info!(source = %source.describe(), generation, agents = current.len(), "Agent definitions reloaded");
        Ok(generation)
    }
}
