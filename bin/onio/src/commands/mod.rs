pub mod agents;
pub mod check;
pub mod run;

use anyhow::Context;
use onio_core::{Config, Paths};
use onio_dispatch::{ConfigSource, FileSource, StaticSource};
use std::path::PathBuf;

/// Configuration after file loading, environment overrides and validation.
pub struct LoadedConfig {
    pub config: Config,
    /// File the configuration was read from; `None` when running on defaults.
    pub config_file: Option<PathBuf>,
    /// Standalone agents file that replaced `config.agents`, if present.
    pub agents_file: Option<PathBuf>,
}

impl LoadedConfig {
    /// Where SIGHUP reloads read agent definitions from.
    pub fn reload_source(&self) -> Box<dyn ConfigSource> {
        match (&self.agents_file, &self.config_file) {
            (Some(path), _) | (None, Some(path)) => Box::new(FileSource::new(path.clone())),
            (None, None) => Box::new(StaticSource(self.config.agents.clone())),
        }
    }
}

pub fn load(config_path: Option<PathBuf>) -> anyhow::Result<LoadedConfig> {
    load_with(&Paths::new(), config_path, |name| std::env::var(name).ok())
}

fn load_with<F>(paths: &Paths, config_path: Option<PathBuf>, env: F) -> anyhow::Result<LoadedConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let config_file = match config_path {
        Some(path) => Some(path),
        None => Some(paths.config_file()).filter(|p| p.exists()),
    };

    let mut config = match &config_file {
        Some(path) => Config::load(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env_overrides(env).context("invalid environment override")?;

    let agents_file = Some(paths.agents_file()).filter(|p| p.exists());
    if let Some(path) = &agents_file {
        config.agents = FileSource::new(path.clone()).load()?;
    }

    config.validate().context("invalid configuration")?;
    Ok(LoadedConfig {
        config,
        config_file,
        agents_file,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use onio_core::TaskKind;

    const CONFIG: &str = r#"{
        "dispatch": { "maxConcurrentTasks": 4 },
        "agents": [{ "id": "onio", "tasks": ["greeting", "help", "calculation"] }],
        "routing": { "defaultAgent": "onio" }
    }"#;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let loaded = load_with(&paths, None, no_env).unwrap();
        assert!(loaded.config_file.is_none());
        assert!(loaded.agents_file.is_none());
        assert_eq!(loaded.reload_source().describe(), "static");
    }

    #[test]
    fn test_explicit_config_and_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("onio.json");
        std::fs::write(&path, CONFIG).unwrap();
        let paths = Paths::with_base(dir.path().join("home"));

        let loaded = load_with(&paths, Some(path.clone()), |name| {
            (name == "TASK_TIMEOUT").then(|| "2s".to_string())
        })
        .unwrap();
        assert_eq!(loaded.config.dispatch.max_concurrent_tasks, 4);
        assert_eq!(loaded.config.dispatch.task_timeout_ms, 2000);
        assert_eq!(loaded.config.agents[0].tasks.len(), 3);
        assert_eq!(loaded.reload_source().describe(), path.display().to_string());
    }

    #[test]
    fn test_agents_file_replaces_config_agents() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        std::fs::write(paths.config_file(), CONFIG).unwrap();
        std::fs::write(
            paths.agents_file(),
            r#"[{ "id": "onio", "tasks": ["joke"] }, { "id": "helper", "tasks": ["help"] }]"#,
        )
        .unwrap();

        let loaded = load_with(&paths, None, no_env).unwrap();
        assert_eq!(loaded.config.agents.len(), 2);
        assert_eq!(loaded.config.agents[0].tasks, vec![TaskKind::Joke]);
        assert_eq!(
            loaded.reload_source().describe(),
            paths.agents_file().display().to_string()
        );
    }

    #[test]
    fn test_invalid_configuration_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "routing": { "defaultAgent": "ghost" } }"#).unwrap();
        let err = load_with(&Paths::with_base(dir.path().to_path_buf()), Some(path), no_env)
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("ghost"));

        let missing = dir.path().join("missing.json");
        assert!(load_with(&Paths::with_base(dir.path().to_path_buf()), Some(missing), no_env).is_err());
    }
}
