use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".onio"))
            .unwrap_or_else(|| PathBuf::from(".onio"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// Optional standalone agent definitions, reloadable without a restart.
    pub fn agents_file(&self) -> PathBuf {
        self.base.join("agents.json")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_under_base() {
        let paths = Paths::with_base(PathBuf::from("/tmp/onio-test"));
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/onio-test/config.json"));
        assert_eq!(paths.agents_file(), PathBuf::from("/tmp/onio-test/agents.json"));
    }
}
