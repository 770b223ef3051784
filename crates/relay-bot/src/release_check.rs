use std::cmp::Ordering;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use relay_contract::{CollaboratorError, UpdateChecker, UpdateStatus};
use serde::Deserialize;

pub(crate) const RELEASE_LOOKUP_USER_AGENT: &str = "relay-bot/update-check";
pub(crate) const RELEASE_LOOKUP_TIMEOUT_MS: u64 = 8_000;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
/// Public struct `ReleaseManifest` used across Relay components.
pub(crate) struct ReleaseManifest {
    #[serde(alias = "version", alias = "tag_name")]
    pub(crate) latest_version: String,
}

fn parse_version_segments(raw: &str) -> Option<Vec<u64>> {
    let trimmed = raw.trim().trim_start_matches(['v', 'V']);
    let core = trimmed
        .split_once('-')
        .map(|(left, _)| left)
        .unwrap_or(trimmed);
    if core.is_empty() {
        return None;
    }
    core.split('.')
        .map(|token| token.parse::<u64>().ok())
        .collect()
}

/// Compares dotted numeric versions, ignoring a `v` prefix and any
/// pre-release suffix. `None` when either side does not parse.
pub(crate) fn compare_versions(current: &str, latest: &str) -> Option<Ordering> {
    let current_segments = parse_version_segments(current)?;
    let latest_segments = parse_version_segments(latest)?;
    let max_len = current_segments.len().max(latest_segments.len());
    for index in 0..max_len {
        let current_value = current_segments.get(index).copied().unwrap_or(0);
        let latest_value = latest_segments.get(index).copied().unwrap_or(0);
        match current_value.cmp(&latest_value) {
            Ordering::Equal => {}
            other => return Some(other),
        }
    }
    Some(Ordering::Equal)
}

pub(crate) fn update_status_for(current: &str, manifest: &ReleaseManifest) -> Result<UpdateStatus> {
    let latest = manifest.latest_version.trim();
    match compare_versions(current, latest) {
        Some(Ordering::Less) => Ok(UpdateStatus::Available {
            current: current.to_string(),
            latest: latest.to_string(),
        }),
        Some(_) => Ok(UpdateStatus::UpToDate {
            current: current.to_string(),
        }),
        None => bail!("cannot compare version '{current}' with release '{latest}'"),
    }
}

/// Fetches a JSON release manifest over HTTP. Disabled when no URL is configured.
pub(crate) struct ReleaseManifestChecker {
    url: Option<String>,
    current_version: String,
}

impl ReleaseManifestChecker {
    pub(crate) fn new(url: Option<String>, current_version: impl Into<String>) -> Self {
        Self {
            url: url.filter(|url| !url.trim().is_empty()),
            current_version: current_version.into(),
        }
    }

    async fn fetch_manifest(url: &str) -> Result<ReleaseManifest> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(RELEASE_LOOKUP_TIMEOUT_MS))
            .build()
            .context("failed to construct HTTP client for update check")?;
        let response = client
            .get(url)
            .header(reqwest::header::USER_AGENT, RELEASE_LOOKUP_USER_AGENT)
            .send()
            .await
            .with_context(|| format!("failed to fetch release manifest from '{url}'"))?;
        if !response.status().is_success() {
            bail!(
                "release manifest request to '{}' returned status {}",
                url,
                response.status()
            );
        }
        response
            .json::<ReleaseManifest>()
            .await
            .with_context(|| format!("failed to parse release manifest from '{url}'"))
    }
}

#[async_trait]
impl UpdateChecker for ReleaseManifestChecker {
    async fn check_for_updates(&self) -> Result<UpdateStatus, CollaboratorError> {
        let Some(url) = &self.url else {
            return Ok(UpdateStatus::Disabled);
        };
        let manifest = Self::fetch_manifest(url)
            .await
            .map_err(|error| CollaboratorError::new("update checker", format!("{error:#}")))?;
        update_status_for(&self.current_version, &manifest)
            .map_err(|error| CollaboratorError::new("update checker", format!("{error:#}")))
    }
}
