use std::path::PathBuf;
use switchboard_channels::manager::config_detail;
use switchboard_core::config::ChannelsConfig;
use switchboard_core::Config;

use super::{resolve, Resolved};

fn mark(ok: bool) -> &'static str {
    if ok {
        "✓"
    } else {
        "✗"
    }
}

/// Human-readable report; kept separate from printing for tests.
pub fn render(resolved: &Resolved, config_exists: bool) -> String {
    let config: &Config = &resolved.config;
    let workspace = resolved.workspace();
    let mut out = Vec::new();

    out.push("switchboard status".to_string());
    out.push("==================".to_string());
    out.push(format!(
        "Config:    {} {}",
        resolved.config_path.display(),
        if config_exists { "✓" } else { "✗ (not found, using defaults)" }
    ));
    out.push(format!(
        "Workspace: {} {}",
        workspace.root().display(),
        mark(workspace.root().exists())
    ));
    out.push(format!("Model:     {}", config.agents.defaults.model));
    out.push(format!("Admin API: http://{}:{}", config.gateway.host, config.gateway.port));
    if let Err(e) = config.validate() {
        out.push(format!("⚠ {}", e));
    }

    out.push(String::new());
    out.push("Providers:".to_string());
    let mut providers: Vec<_> = config.providers.iter().collect();
    providers.sort_by(|a, b| a.0.cmp(b.0));
    for (name, provider) in providers {
        let state = if provider.api_key.is_empty() { "✗ no key" } else { "✓ configured" };
        out.push(format!("  {:<12} {}", name, state));
    }

    out.push(String::new());
    out.push("Channels:".to_string());
    for name in ChannelsConfig::NAMES {
        let enabled = config.channels.is_enabled(name).unwrap_or(false);
        let allowed = config
            .channels
            .allow_from(name)
            .map(|l| l.iter().len())
            .unwrap_or(0);
        out.push(format!(
            "  {:<10} {:<9} {}{}",
            name,
            if enabled { "enabled" } else { "disabled" },
            config_detail(&config.channels, name),
            if allowed > 0 { format!(", {} allowed senders", allowed) } else { String::new() }
        ));
    }
    out.join("\n")
}

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = resolve(config_path)?;
    let exists = resolved.config_path.exists();
    println!("{}", render(&resolved, exists));
    if !exists {
        println!();
        println!("Run `switchboard onboard` to initialize.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::Paths;
    use tempfile::TempDir;

    #[test]
    fn test_render_lists_channels_and_warnings() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.workspace_path = Some(dir.path().join("ws").display().to_string());
        config.channels.telegram.enabled = true;
        config.channels.telegram.allow_from.push("42".into());
        let resolved = Resolved {
            paths: Paths::with_base(dir.path().to_path_buf()),
            config_path: dir.path().join("config.json"),
            config,
        };
        let text = render(&resolved, false);
        assert!(text.contains("not found"));
        assert!(text.contains("telegram   enabled   token not set, 1 allowed senders"));
        assert!(text.contains("slack      disabled"));
        assert!(text.contains("⚠ Config error: channels.telegram.token is required"));
    }
}
