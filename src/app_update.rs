//! Self-update check against the project's latest release.

use crate::error::{LivecapError, Result};
use crate::transport::Transport;
use serde_json::Value;
use std::cmp::Ordering;
use std::time::Duration;

/// Outcome of a release lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseCheck {
    pub latest_tag: String,
    pub latest_url: String,
    pub current_version: String,
    /// Latest release is newer than the running build
    pub newer: bool,
}

/// Look up the latest release and compare it with `current_version`
pub async fn check_latest_release(
    transport: &dyn Transport,
    release_url: &str,
    current_version: &str,
    timeout: Duration,
) -> Result<ReleaseCheck> {
    let body = transport
        .get_text(release_url, timeout)
        .await
        .map_err(|e| match e {
            LivecapError::Network(reason) => {
                LivecapError::Network(format!("Unable to reach releases: {reason}"))
            }
            other => other,
        })?;

    let (latest_tag, latest_url) = parse_release(&body)?;
    let newer = compare_versions(&latest_tag, current_version) == Ordering::Greater;

    if newer {
        tracing::info!("New release available: {latest_tag} (running {current_version})");
    } else {
        tracing::debug!("Up to date ({current_version}, latest {latest_tag})");
    }

    Ok(ReleaseCheck {
        latest_tag,
        latest_url,
        current_version: current_version.to_string(),
        newer,
    })
}

/// Extract `tag_name` and `html_url` from a release document
pub fn parse_release(body: &str) -> Result<(String, String)> {
    let invalid = || LivecapError::ManifestInvalid("unable to parse release response".to_string());

    let doc: Value = serde_json::from_str(body).map_err(|_| invalid())?;
    let field = |key: &str| {
        doc.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    match (field("tag_name"), field("html_url")) {
        (Some(tag), Some(url)) => Ok((tag, url)),
        _ => Err(invalid()),
    }
}

/// Compare dotted version strings numerically
///
/// A leading `v` is ignored, non-digit characters inside a component are
/// dropped, and missing components count as zero (`1.2` == `1.2.0`).
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let va = version_parts(a);
    let vb = version_parts(b);
    let count = va.len().max(vb.len());

    (0..count)
        .map(|i| {
            let x = va.get(i).copied().unwrap_or(0);
            let y = vb.get(i).copied().unwrap_or(0);
            x.cmp(&y)
        })
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

fn version_parts(version: &str) -> Vec<u64> {
    let trimmed = version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version);

    trimmed
        .split('.')
        .map(|part| part.chars().filter(char::is_ascii_digit).collect::<String>())
        .filter(|digits| !digits.is_empty())
        .map(|digits| digits.parse().unwrap_or(u64::MAX))
        .collect()
}
