use onio_core::Config;
use serde_json::Value;
use std::path::PathBuf;

const SECRET_KEYS: [&str; 4] = ["apiKey", "token", "botToken", "apiToken"];

fn mark(on: bool) -> &'static str {
    if on {
        "✓"
    } else {
        "✗"
    }
}

/// Blank out credentials before printing a configuration.
fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if SECRET_KEYS.contains(&key.as_str()) {
                    if let Value::String(s) = v {
                        if !s.is_empty() {
                            *s = "***".to_string();
                        }
                    }
                } else {
                    redact(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

pub fn run(config_path: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let loaded = match super::load(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            println!("✗ {:#}", e);
            return Err(e);
        }
    };
    let config = &loaded.config;

    if json {
        let mut value = serde_json::to_value(config)?;
        redact(&mut value);
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("onio check");
    println!("==========");
    println!();
    match &loaded.config_file {
        Some(path) => println!("Config:    {} ✓", path.display()),
        None => println!("Config:    (built-in defaults, no config file)"),
    }
    match &loaded.agents_file {
        Some(path) => println!("Agents:    {} from {}", config.agents.len(), path.display()),
        None => println!("Agents:    {}", config.agents.len()),
    }
    print_dispatch(config);
    println!();

    let provider = &config.provider;
    if provider.api_key.trim().is_empty() {
        println!("Provider:  offline generator (no API key)");
    } else {
        println!("Provider:  {} ✓", provider.model);
    }

    let channels = &config.channels;
    println!("Channels:");
    println!("  telegram  {}", mark(channels.telegram.enabled));
    println!("  discord   {}", mark(channels.discord.enabled));
    println!(
        "  api       {}{}",
        mark(channels.api.enabled),
        if channels.api.enabled {
            format!(" {}:{}", channels.api.host, channels.api.port)
        } else {
            String::new()
        }
    );

    if !config.schedule.is_empty() {
        println!("Jobs:");
        for job in &config.schedule {
            let interval = job.interval_ms.unwrap_or(config.dispatch.task_interval_ms);
            println!(
                "  {:<16} {} -> {} every {} ms{}",
                job.name,
                mark(job.enabled),
                job.agent,
                interval,
                if job.depends_on.is_empty() {
                    String::new()
                } else {
                    format!(" after {}", job.depends_on.join(", "))
                }
            );
        }
    }

    println!();
    if config.dispatch.distributed_tasks {
        println!("✗ FEATURE_DISTRIBUTED_TASKS is set but no external queue backend is available; `onio run` will refuse to start");
        anyhow::bail!("distributed task queue is not supported");
    }
    println!("✓ Configuration is valid");
    Ok(())
}

fn print_dispatch(config: &Config) {
    let d = &config.dispatch;
    println!(
        "Dispatch:  {} slots, backlog {}, timeout {} ms, {} retries from {} ms",
        d.max_concurrent_tasks, d.backlog_capacity, d.task_timeout_ms, d.task_retry_limit, d.task_retry_delay_ms
    );
    println!(
        "Limits:    {} requests per {} ms per {:?}",
        d.rate_limit_requests, d.rate_limit_period_ms, d.rate_limit_key
    );
}
