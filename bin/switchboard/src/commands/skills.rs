use std::path::PathBuf;
use switchboard_skills::{install_from_github, uninstall, SkillDescriptor, SkillRegistry};

use super::resolve;

fn registry(resolved: &super::Resolved) -> SkillRegistry {
    SkillRegistry::new(
        resolved.workspace().skills_dir(),
        resolved.paths.global_skills_dir(),
        resolved.paths.builtin_skills_dir(),
    )
}

fn describe(skill: &SkillDescriptor) -> String {
    let mut flags = Vec::new();
    if skill.shadowed {
        flags.push("shadowed".to_string());
    }
    if !skill.available {
        flags.push(format!(
            "unavailable: {}",
            skill.unavailable_reason.as_deref().unwrap_or("unknown")
        ));
    }
    let flags = if flags.is_empty() { String::new() } else { format!(" [{}]", flags.join(", ")) };
    format!(
        "  {:<20} {:<10} {}{}",
        skill.name,
        skill.source_root.as_str(),
        skill.description,
        flags
    )
}

pub async fn list(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = resolve(config_path)?;
    let skills = registry(&resolved).list_skills();
    if skills.is_empty() {
        println!("No skills installed.");
        println!("Install one with `switchboard skills install <owner/repo>`.");
        return Ok(());
    }
    println!("Skills ({}):", skills.len());
    for skill in &skills {
        println!("{}", describe(skill));
    }
    Ok(())
}

pub async fn install(config_path: Option<PathBuf>, repository: &str) -> anyhow::Result<()> {
    let resolved = resolve(config_path)?;
    let dir = resolved.workspace().skills_dir();
    std::fs::create_dir_all(&dir)?;
    let name = install_from_github(repository, &dir).await?;
    println!("✓ Installed skill '{}' into {}", name, dir.join(&name).display());
    println!("  A running gateway picks it up on its next reload or restart.");
    Ok(())
}

pub async fn remove(config_path: Option<PathBuf>, name: &str) -> anyhow::Result<()> {
    let resolved = resolve(config_path)?;
    uninstall(name, &resolved.workspace().skills_dir())?;
    println!("✓ Removed skill '{}'", name);
    Ok(())
}
