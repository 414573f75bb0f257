use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use switchboard_core::{Error, Result};
use tokio::process::Command;
use tracing::{info, warn};

use crate::manifest::{is_valid_skill_name, MANIFEST_JSON, MANIFEST_YAML};

pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Accepts `owner/repo`, `github.com/owner/repo` or a full https URL and
/// returns `(owner/repo, repo)`.
pub fn parse_repository(input: &str) -> Result<(String, String)> {
    let trimmed = input.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let path = trimmed
        .strip_prefix("https://github.com/")
        .or_else(|| trimmed.strip_prefix("http://github.com/"))
        .or_else(|| trimmed.strip_prefix("github.com/"))
        .unwrap_or(trimmed);

    let parts: Vec<&str> = path.split('/').collect();
    let valid_part = |p: &str| {
        !p.is_empty()
            && p != "."
            && p != ".."
            && p.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    };
    if parts.len() != 2 || !parts.iter().all(|p| valid_part(p)) {
        return Err(Error::Validation(format!(
            "repository must look like 'owner/name', got '{}'",
            input
        )));
    }

    let repo = parts[1].to_string();
    if !is_valid_skill_name(&repo) {
        return Err(Error::Validation(format!("'{}' is not a valid skill name", repo)));
    }
    Ok((format!("{}/{}", parts[0], parts[1]), repo))
}

/// Shallow-clones a GitHub repository into `skills_dir/<repo>`.
///
/// The clone is abandoned (and the partial directory removed) after
/// [`INSTALL_TIMEOUT`]. A repository without a skill manifest is removed
/// again and reported as a validation error.
pub async fn install_from_github(repository: &str, skills_dir: &Path) -> Result<String> {
    install_from_url(repository, skills_dir, "https://github.com", INSTALL_TIMEOUT).await
}

async fn install_from_url(
    repository: &str,
    skills_dir: &Path,
    host: &str,
    timeout: Duration,
) -> Result<String> {
    let (slug, name) = parse_repository(repository)?;
    let target = skills_dir.join(&name);
    if target.exists() {
        return Err(Error::Validation(format!("skill '{}' is already installed", name)));
    }
    std::fs::create_dir_all(skills_dir)?;

    let url = format!("{}/{}.git", host.trim_end_matches('/'), slug);
    info!(url = %url, target = %target.display(), "Installing skill");

    let mut cmd = Command::new("git");
    cmd.args(["clone", "--depth", "1", &url])
        .arg(&target)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            return Err(Error::Resource(format!("failed to run git: {}", e)));
        }
        Err(_) => {
            remove_partial(&target);
            return Err(Error::Timeout(format!(
                "cloning {} exceeded {}s",
                slug,
                timeout.as_secs()
            )));
        }
    };

    if !output.status.success() {
        remove_partial(&target);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Resource(format!("git clone failed: {}", stderr.trim())));
    }

    if !target.join(MANIFEST_JSON).exists() && !target.join(MANIFEST_YAML).exists() {
        remove_partial(&target);
        return Err(Error::Validation(format!("{} has no skill manifest", slug)));
    }

    info!(skill = %name, "Skill installed");
    Ok(name)
}

fn remove_partial(target: &Path) {
    if target.exists() {
        if let Err(e) = std::fs::remove_dir_all(target) {
            warn!(path = %target.display(), error = %e, "Failed to clean up partial skill checkout");
        }
    }
}

/// Removes `skills_dir/<name>`.
pub fn uninstall(name: &str, skills_dir: &Path) -> Result<()> {
    if !is_valid_skill_name(name) {
        return Err(Error::Validation(format!("invalid skill name '{}'", name)));
    }
    let target = skills_dir.join(name);
    if !target.is_dir() {
        return Err(Error::NotFound(format!("skill '{}'", name)));
    }
    std::fs::remove_dir_all(&target)?;
    info!(skill = %name, "Skill removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_repository_forms() {
        assert_eq!(
            parse_repository("acme/weather").unwrap(),
            ("acme/weather".to_string(), "weather".to_string())
        );
        assert_eq!(
            parse_repository("https://github.com/acme/weather.git").unwrap().0,
            "acme/weather"
        );
        assert_eq!(parse_repository("github.com/acme/weather/").unwrap().1, "weather");
        assert!(parse_repository("acme").is_err());
        assert!(parse_repository("acme/../etc").is_err());
        assert!(parse_repository("acme/we ather").is_err());
    }

    #[test]
    fn test_uninstall() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("weather")).unwrap();
        uninstall("weather", dir.path()).unwrap();
        assert!(!dir.path().join("weather").exists());

        assert!(matches!(uninstall("weather", dir.path()), Err(Error::NotFound(_))));
        assert!(matches!(uninstall("../x", dir.path()), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_install_refuses_existing() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("weather")).unwrap();
        let err = install_from_github("acme/weather", dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_from_local_repository() {
        if which::which("git").is_err() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let origin = tmp.path().join("host").join("acme").join("greet.git");
        std::fs::create_dir_all(&origin).unwrap();
        std::fs::write(
            origin.join(MANIFEST_JSON),
            r#"{"name":"greet","entrypoint":{"type":"handler","name":"echo"}}"#,
        )
        .unwrap();
        let git = |args: &[&str]| {
            std::process::Command::new("git")
                .args(args)
                .current_dir(&origin)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@example.com")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@example.com")
                .output()
                .unwrap()
        };
        git(&["init", "-q"]);
        git(&["add", "."]);
        git(&["commit", "-q", "-m", "init"]);
        let host = format!("file://{}", tmp.path().join("host").display());
        let skills = tmp.path().join("skills");

        let name = install_from_url("acme/greet", &skills, &host, Duration::from_secs(20))
            .await
            .unwrap();
        assert_eq!(name, "greet");
        assert!(skills.join("greet").join(MANIFEST_JSON).exists());
    }
}
