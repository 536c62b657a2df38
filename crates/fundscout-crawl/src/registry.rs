use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fundscout_core::CrawlTarget;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{error, info};
use url::Url;

use crate::error::RegistryError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub targets: Vec<CrawlTarget>,
}

/// Registered crawl targets. Targets are deactivated, never removed.
///
/// With a state path set, every change is written back to that file so
/// added, discovered and deactivated targets survive a restart.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: RwLock<BTreeMap<String, CrawlTarget>>,
    state_path: Option<PathBuf>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_targets(targets: Vec<CrawlTarget>) -> Result<Self, RegistryError> {
        let mut map = BTreeMap::new();
        for target in targets {
            validate_url(&target.url)?;
            if map.contains_key(&target.target_id) {
                return Err(RegistryError::Duplicate(target.target_id));
            }
            map.insert(target.target_id.clone(), target);
        }
        Ok(Self {
            targets: RwLock::new(map),
            state_path: None,
        })
    }

    /// Writes every later change to `path`.
    pub fn persist_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    /// Opens the saved registry at `state` when there is one, adding any
    /// target from the `seed` file it does not know yet, and keeps saving
    /// to `state` from then on. Without a saved registry the seed is used.
    pub async fn open(seed: &Path, state: &Path) -> Result<Self> {
        let seeded = Self::load(seed).await?;
        if !tokio::fs::try_exists(state).await.unwrap_or(false) {
            return Ok(seeded.persist_to(state));
        }
        let saved = Self::load(state).await?;
        {
            let mut targets = saved.targets.write().await;
            for (id, target) in seeded.targets.into_inner() {
                targets.entry(id).or_insert(target);
            }
            info!(path = %state.display(), targets = targets.len(), "restored target registry");
        }
        Ok(saved.persist_to(state))
    }

    /// Loads `targets.yaml`; a missing file yields an empty registry.
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            tracing::warn!(path = %path.display(), "target registry file not found; starting empty");
            return Ok(Self::new());
        }
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let file: RegistryFile =
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Self::from_targets(file.targets).with_context(|| format!("loading {}", path.display()))
    }

    pub async fn add(&self, target: CrawlTarget) -> Result<CrawlTarget, RegistryError> {
        validate_url(&target.url)?;
        let mut targets = self.targets.write().await;
        if targets.contains_key(&target.target_id) {
            return Err(RegistryError::Duplicate(target.target_id));
        }
        targets.insert(target.target_id.clone(), target.clone());
        self.save(&targets).await?;
        Ok(target)
    }

    pub async fn get(&self, target_id: &str) -> Option<CrawlTarget> {
        self.targets.read().await.get(target_id).cloned()
    }

    pub async fn list(&self) -> Vec<CrawlTarget> {
        self.targets.read().await.values().cloned().collect()
    }

    pub async fn list_active(&self) -> Vec<CrawlTarget> {
        self.targets
            .read()
            .await
            .values()
            .filter(|t| t.active)
            .cloned()
            .collect()
    }

    pub async fn deactivate(&self, target_id: &str) -> Result<CrawlTarget, RegistryError> {
        self.set_active(target_id, false).await
    }

    pub async fn set_active(&self, target_id: &str, active: bool) -> Result<CrawlTarget, RegistryError> {
        let (target, saved) = self.update(target_id, |t| t.active = active).await?;
        saved?;
        Ok(target)
    }

    pub async fn set_priority(&self, target_id: &str, priority: i32) -> Result<CrawlTarget, RegistryError> {
        let (target, saved) = self.update(target_id, |t| t.priority = priority).await?;
        saved?;
        Ok(target)
    }

    /// Records a visit. A failed save is logged; the visit still counts.
    pub async fn mark_visited(
        &self,
        target_id: &str,
        at: DateTime<Utc>,
    ) -> Result<CrawlTarget, RegistryError> {
        let (target, saved) = self.update(target_id, |t| t.last_visited = Some(at)).await?;
        if let Err(err) = saved {
            error!(error = %err, "visit time not saved");
        }
        Ok(target)
    }

    async fn update(
        &self,
        target_id: &str,
        apply: impl FnOnce(&mut CrawlTarget),
    ) -> Result<(CrawlTarget, Result<(), RegistryError>), RegistryError> {
        let mut targets = self.targets.write().await;
        let target = targets
            .get_mut(target_id)
            .ok_or_else(|| RegistryError::Unknown(target_id.to_string()))?;
        apply(target);
        let target = target.clone();
        let saved = self.save(&targets).await;
        Ok((target, saved))
    }

    /// Replaces the state file through a temp file and rename.
    async fn save(&self, targets: &BTreeMap<String, CrawlTarget>) -> Result<(), RegistryError> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let persist_err = |reason: String| RegistryError::Persist {
            path: path.clone(),
            reason,
        };
        let file = RegistryFile {
            targets: targets.values().cloned().collect(),
        };
        let yaml = serde_yaml::to_string(&file).map_err(|e| persist_err(e.to_string()))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| persist_err(e.to_string()))?;
        }
        let tmp = path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, yaml)
            .await
            .map_err(|e| persist_err(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| persist_err(e.to_string()))
    }

    /// Registers discovered links as children of `parent_id`, skipping URLs
    /// already known and stopping once the parent has `cap` children.
    pub async fn register_discovered(
        &self,
        parent_id: &str,
        urls: &[String],
        cap: usize,
    ) -> Result<Vec<CrawlTarget>, RegistryError> {
        let mut targets = self.targets.write().await;
        let parent = targets
            .get(parent_id)
            .cloned()
            .ok_or_else(|| RegistryError::Unknown(parent_id.to_string()))?;

        let mut children = targets
            .values()
            .filter(|t| t.parent_id.as_deref() == Some(parent_id))
            .count();
        let mut known = targets
            .values()
            .map(|t| normalize_url(&t.url))
            .collect::<std::collections::HashSet<_>>();

        let mut added = Vec::new();
        for url in urls {
            if children >= cap {
                break;
            }
            if validate_url(url).is_err() || !known.insert(normalize_url(url)) {
                continue;
            }
            let child_id = child_target_id(parent_id, url);
            if targets.contains_key(&child_id) {
                continue;
            }
            let child = CrawlTarget {
                target_id: child_id.clone(),
                url: url.clone(),
                display_name: parent.display_name.clone(),
                country: parent.country.clone(),
                sectors: parent.sectors.clone(),
                keywords: parent.keywords.clone(),
                priority: parent.priority.saturating_sub(1),
                rate_limit_secs: parent.rate_limit_secs,
                active: true,
                last_visited: None,
                selectors: Default::default(),
                parent_id: Some(parent_id.to_string()),
            };
            targets.insert(child_id, child.clone());
            added.push(child);
            children += 1;
        }
        if !added.is_empty() {
            if let Err(err) = self.save(&targets).await {
                error!(error = %err, parent_id, "discovered targets not saved");
            }
        }
        Ok(added)
    }

    pub async fn len(&self) -> usize {
        self.targets.read().await.len()
    }
}

fn validate_url(url: &str) -> Result<(), RegistryError> {
    let parsed = Url::parse(url).map_err(|e| RegistryError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RegistryError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {}", parsed.scheme()),
        });
    }
    Ok(())
}

fn normalize_url(url: &str) -> String {
    crate::dedup::normalize_url(url)
}

fn child_target_id(parent_id: &str, url: &str) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    format!("{parent_id}~{}", &digest[..10])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str, url: &str) -> CrawlTarget {
        CrawlTarget::new(id, url, id.to_uppercase())
    }

    #[tokio::test]
    async fn rejects_duplicates_and_bad_urls() {
        let registry = TargetRegistry::new();
        registry.add(target("a", "https://a.example.org")).await.unwrap();
        assert_eq!(
            registry.add(target("a", "https://other.example.org")).await,
            Err(RegistryError::Duplicate("a".into()))
        );
        assert!(matches!(
            registry.add(target("b", "ftp://files.example.org")).await,
            Err(RegistryError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn deactivation_keeps_target_registered() {
        let registry = TargetRegistry::from_targets(vec![
            target("a", "https://a.example.org"),
            target("b", "https://b.example.org"),
        ])
        .unwrap();
        registry.deactivate("a").await.unwrap();
        assert_eq!(registry.len().await, 2);
        let active = registry.list_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].target_id, "b");
        assert_eq!(
            registry.deactivate("zzz").await,
            Err(RegistryError::Unknown("zzz".into()))
        );
    }

    #[tokio::test]
    async fn discovered_links_become_capped_children() {
        let mut parent = target("fund", "https://fund.example.org/grants");
        parent.priority = 7;
        parent.sectors = vec!["health".into()];
        let registry = TargetRegistry::from_targets(vec![parent]).unwrap();

        let urls = vec![
            "https://fund.example.org/grants/a".to_string(),
            "https://fund.example.org/grants/a/".to_string(),
            "https://fund.example.org/grants".to_string(),
            "https://fund.example.org/grants/b".to_string(),
            "https://fund.example.org/grants/c".to_string(),
        ];
        let added = registry.register_discovered("fund", &urls, 2).await.unwrap();
        assert_eq!(added.len(), 2);
        assert!(added.iter().all(|c| c.priority == 6 && c.sectors == vec!["health"]));
        assert_eq!(added[0].url, "https://fund.example.org/grants/a");
        assert_eq!(added[1].url, "https://fund.example.org/grants/b");

        let again = registry.register_discovered("fund", &urls, 5).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].url, "https://fund.example.org/grants/c");
    }

    #[tokio::test]
    async fn yaml_registry_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.yaml");
        std::fs::write(
            &path,
            "targets:\n  - target_id: undp-ss\n    url: https://www.undp.org/south-sudan\n    display_name: UNDP South Sudan\n    country: South Sudan\n    sectors: [governance]\n    priority: 9\n",
        )
        .unwrap();
        let registry = TargetRegistry::load(&path).await.unwrap();
        let t = registry.get("undp-ss").await.unwrap();
        assert_eq!(t.priority, 9);
        assert!(t.active);
        assert_eq!(t.rate_limit_secs, 3600);

        let missing = TargetRegistry::load(&dir.path().join("nope.yaml")).await.unwrap();
        assert_eq!(missing.len().await, 0);
    }

    #[tokio::test]
    async fn saved_registry_survives_reopen_and_merges_new_seed_targets() {
        let dir = tempfile::tempdir().unwrap();
        let seed = dir.path().join("targets.yaml");
        let state = dir.path().join("state/targets.yaml");
        std::fs::write(
            &seed,
            "targets:\n  - target_id: a\n    url: https://a.example.org\n    display_name: A\n",
        )
        .unwrap();

        let first = TargetRegistry::open(&seed, &state).await.unwrap();
        first.add(target("b", "https://b.example.org")).await.unwrap();
        first.deactivate("a").await.unwrap();
        first.set_priority("b", 8).await.unwrap();
        let at = Utc::now();
        first.mark_visited("b", at).await.unwrap();
        first
            .register_discovered("b", &["https://b.example.org/grants/x".to_string()], 5)
            .await
            .unwrap();
        assert!(state.exists());

        std::fs::write(
            &seed,
            "targets:\n  - target_id: a\n    url: https://a.example.org\n    display_name: A\n  - target_id: c\n    url: https://c.example.org\n    display_name: C\n",
        )
        .unwrap();
        let second = TargetRegistry::open(&seed, &state).await.unwrap();
        assert_eq!(second.len().await, 4);
        assert!(!second.get("a").await.unwrap().active);
        let b = second.get("b").await.unwrap();
        assert_eq!(b.priority, 8);
        assert_eq!(b.last_visited, Some(at));
        assert!(second.get("c").await.unwrap().active);
        assert!(second
            .list()
            .await
            .iter()
            .any(|t| t.parent_id.as_deref() == Some("b")));
    }
}
