use std::path::PathBuf;

pub fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let loaded = super::load(config_path)?;
    let config = &loaded.config;

    if config.agents.is_empty() {
        println!("No agents configured.");
        return Ok(());
    }

    let default_agent = config.routing.default_agent.as_deref();
    for agent in &config.agents {
        let marker = if Some(agent.id.as_str()) == default_agent { " (default)" } else { "" };
        println!("{}{}  {}", agent.id, marker, agent.display_name());
        if let Some(description) = &agent.description {
            println!("  {}", description);
        }
        println!("  max concurrency: {}", agent.max_concurrency);
        for kind in &agent.tasks {
            match kind.command() {
                Some(command) => println!("  - {:<12} /{}", kind.as_str(), command),
                None => println!("  - {}", kind.as_str()),
            }
        }
        println!();
    }
    Ok(())
}
