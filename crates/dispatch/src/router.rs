use onio_core::config::RoutingConfig;
use onio_core::{Error, InboundEvent, Result, TaskKind};

use crate::registry::Snapshot;

/// Where an event goes and what it asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub agent_id: String,
    pub kind: TaskKind,
    /// Command name without prefix or `@bot` suffix. `None` for free text.
    pub command: Option<String>,
    pub args: String,
}

/// Split `"/calc@my_bot 2+2"` into `("calc", "2+2")`.
///
/// Returns `None` when the text does not start with one of `prefixes`
/// immediately followed by a command word.
pub fn parse_command(text: &str, prefixes: &[String]) -> Option<(String, String)> {
    let text = text.trim_start();
    let rest = prefixes
        .iter()
        .filter(|p| !p.is_empty())
        .find_map(|p| text.strip_prefix(p.as_str()))?;
    if !rest.chars().next().map_or(false, |c| c.is_alphanumeric()) {
        return None;
    }
    let (word, args) = match rest.find(char::is_whitespace) {
        Some(idx) => (&rest[..idx], rest[idx..].trim()),
        None => (rest, ""),
    };
    let name = word.split('@').next().unwrap_or(word).to_lowercase();
    Some((name, args.to_string()))
}

pub struct Router {
    config: RoutingConfig,
}

impl Router {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    /// Agent precedence: explicit `agentId` in event metadata, first matching
    /// binding, configured default, then the first registered agent.
    fn select_agent(&self, event: &InboundEvent, snapshot: &Snapshot) -> Result<String> {
        if let Some(id) = event.metadata.get("agentId").and_then(|v| v.as_str()) {
            return Ok(id.to_string());
        }
        if let Some(binding) = self
            .config
            .bindings
            .iter()
            .find(|b| b.matches(&event.platform, &event.conversation_id))
        {
            return Ok(binding.agent.clone());
        }
        if let Some(default) = &self.config.default_agent {
            return Ok(default.clone());
        }
        snapshot
            .agents()
            .first()
            .map(|a| a.id.clone())
            .ok_or_else(|| Error::UnknownAgent("no agents configured".to_string()))
    }

    pub fn route(&self, event: &InboundEvent, snapshot: &Snapshot) -> Result<Route> {
        let text = event.text.trim();
        if text.is_empty() {
            return Err(Error::Validation("empty message".to_string()));
        }
        let agent_id = self.select_agent(event, snapshot)?;
        let route = match parse_command(text, &self.config.command_prefixes) {
            Some((name, args)) => Route {
                agent_id,
                kind: TaskKind::from_command(&name),
                command: Some(name),
                args,
            },
            None => Route {
                agent_id,
                kind: TaskKind::Chat,
                command: None,
                args: text.to_string(),
            },
        };
        Ok(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentRegistry;
    use onio_core::config::RouteBinding;
    use onio_core::AgentDefinition;

    fn prefixes() -> Vec<String> {
        vec!["/".to_string(), "!".to_string()]
    }

    fn registry() -> AgentRegistry {
        let def = |id: &str| AgentDefinition {
            id: id.to_string(),
            description: None,
            personality: serde_json::Value::Null,
            tasks: TaskKind::ALL.to_vec(),
            max_concurrency: 1,
        };
        AgentRegistry::new(vec![def("first"), def("support"), def("fun")], 10).unwrap()
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("/start", &prefixes()), Some(("start".into(), "".into())));
        assert_eq!(
            parse_command("/calc@onio_bot  2 + 2 ", &prefixes()),
            Some(("calc".into(), "2 + 2".into()))
        );
        assert_eq!(parse_command("!JOKE cats", &prefixes()), Some(("joke".into(), "cats".into())));
        assert_eq!(parse_command("hello /start", &prefixes()), None);
        assert_eq!(parse_command("/ help", &prefixes()), None);
        assert_eq!(parse_command("!!", &prefixes()), None);
    }

    #[test]
    fn test_route_kinds() {
        let router = Router::new(RoutingConfig::default());
        let snap = registry().snapshot();
        let r = router.route(&InboundEvent::new("telegram", "1", "u", "/help"), &snap).unwrap();
        assert_eq!(r.kind, TaskKind::Help);
        assert_eq!(r.agent_id, "first");
        let r = router.route(&InboundEvent::new("telegram", "1", "u", "how are you"), &snap).unwrap();
        assert_eq!(r.kind, TaskKind::Chat);
        assert_eq!(r.args, "how are you");
        let r = router.route(&InboundEvent::new("telegram", "1", "u", "/weather Paris"), &snap).unwrap();
        assert_eq!(r.kind, TaskKind::Custom);
        assert_eq!(r.command.as_deref(), Some("weather"));

        let err = router.route(&InboundEvent::new("telegram", "1", "u", "   "), &snap).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_agent_selection_precedence() {
        let router = Router::new(RoutingConfig {
            default_agent: Some("fun".to_string()),
            bindings: vec![RouteBinding {
                platform: Some("discord".to_string()),
                conversation_id: Some("support-chan".to_string()),
                agent: "support".to_string(),
            }],
            command_prefixes: prefixes(),
        });
        let snap = registry().snapshot();

        let ev = InboundEvent::new("discord", "support-chan", "u", "/help");
        assert_eq!(router.route(&ev, &snap).unwrap().agent_id, "support");

        let ev = InboundEvent::new("discord", "general", "u", "/help");
        assert_eq!(router.route(&ev, &snap).unwrap().agent_id, "fun");

        let ev = InboundEvent::new("discord", "support-chan", "u", "/help")
            .with_metadata(serde_json::json!({"agentId": "first"}));
        assert_eq!(router.route(&ev, &snap).unwrap().agent_id, "first");
    }
}
