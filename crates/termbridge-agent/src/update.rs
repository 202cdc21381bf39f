//! Release check against GitHub. The actual download and install are
//! handled by the platform packaging, not the agent.

use anyhow::{Context, Result};

const REPO: &str = "termbridge/agent";
const GITHUB_API: &str = "https://api.github.com";

/// Whether `latest` names a higher version than `current`. Plain
/// lexicographic compare of the `v`-stripped tags, which is how releases
/// have always been compared here; fine for single-digit components.
pub fn is_newer(current: &str, latest: &str) -> bool {
    let current = current.trim_start_matches('v');
    let latest = latest.trim_start_matches('v');
    latest > current
}

/// Run `termbridge-agent check-update`.
pub async fn check(current_version: &str) -> Result<()> {
    println!("Current version : v{current_version}");
    println!("Checking GitHub releases…");

    let client = reqwest::Client::builder()
        .user_agent(format!("termbridge-agent/{current_version}"))
        .build()?;

    let release: serde_json::Value = client
        .get(format!("{GITHUB_API}/repos/{REPO}/releases/latest"))
        .send()
        .await
        .context("failed to reach GitHub API")?
        .error_for_status()
        .context("GitHub API returned an error")?
        .json()
        .await
        .context("failed to parse GitHub API response")?;

    let tag = release["tag_name"]
        .as_str()
        .context("missing tag_name in release")?;
    println!("Latest version  : {tag}");

    if is_newer(current_version, tag) {
        println!("Update available: https://github.com/{REPO}/releases/latest");
    } else {
        println!("Already up to date.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_versions_are_not_newer() {
        assert!(!is_newer("1.2.0", "1.2.0"));
        assert!(!is_newer("v1.2.0", "v1.2.0"));
    }

    #[test]
    fn higher_patch_is_newer() {
        assert!(is_newer("1.2.0", "1.2.1"));
        assert!(is_newer("0.1.0", "0.2.0"));
    }

    #[test]
    fn lower_version_is_not_newer() {
        assert!(!is_newer("1.2.1", "1.2.0"));
    }

    #[test]
    fn v_prefix_is_ignored() {
        assert!(is_newer("1.2.0", "v1.2.1"));
        assert!(is_newer("v1.2.0", "1.2.1"));
    }
}
