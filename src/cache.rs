use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::catalog::FormatIndex;

const CATALOG_TTL_SECONDS: i64 = 30 * 60;
const MAX_CACHED_CATALOGS: usize = 5_000;

#[derive(Debug, Clone)]
struct CachedCatalog {
    formats: FormatIndex,
    created_at: DateTime<Utc>,
}

type CatalogMap = HashMap<String, CachedCatalog>;

/// Stream identifiers recently reported for each normalized URL.
#[derive(Debug, Clone, Default)]
pub struct CatalogCache {
    entries: Arc<Mutex<CatalogMap>>,
}

impl CatalogCache {
    pub async fn insert(&self, url: &str, formats: FormatIndex) {
        self.insert_at(url, formats, Utc::now()).await;
    }

    pub async fn get(&self, url: &str) -> Option<FormatIndex> {
        self.get_at(url, Utc::now()).await
    }

    async fn insert_at(&self, url: &str, formats: FormatIndex, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().await;
        prune_catalogs(&mut entries, now);
        entries.insert(
            url.to_string(),
            CachedCatalog {
                formats,
                created_at: now,
            },
        );
        trim_catalogs(&mut entries);
    }

    async fn get_at(&self, url: &str, now: DateTime<Utc>) -> Option<FormatIndex> {
        let mut entries = self.entries.lock().await;
        prune_catalogs(&mut entries, now);
        entries.get(url).map(|entry| entry.formats.clone())
    }
}

fn prune_catalogs(entries: &mut CatalogMap, now: DateTime<Utc>) {
    entries.retain(|_, entry| (now - entry.created_at).num_seconds() <= CATALOG_TTL_SECONDS);
}

fn trim_catalogs(entries: &mut CatalogMap) {
    if entries.len() <= MAX_CACHED_CATALOGS {
        return;
    }

    let overflow = entries.len() - MAX_CACHED_CATALOGS;
    let mut oldest = entries
        .iter()
        .map(|(url, entry)| (url.clone(), entry.created_at))
        .collect::<Vec<_>>();
    oldest.sort_by_key(|(_, created_at)| *created_at);

    for (url, _) in oldest.into_iter().take(overflow) {
        entries.remove(&url);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::catalog::StreamDescriptor;

    fn formats(id: &str) -> FormatIndex {
        FormatIndex::from_descriptors(&[StreamDescriptor {
            id: id.to_string(),
            has_video: true,
            ..StreamDescriptor::default()
        }])
    }

    #[tokio::test]
    async fn returns_fresh_entries_and_expires_old_ones() {
        let cache = CatalogCache::default();
        let now = Utc::now();
        cache.insert_at("https://a", formats("137"), now).await;

        let fresh = cache.get_at("https://a", now + Duration::minutes(5)).await;
        assert!(fresh.is_some_and(|index| index.category("137").is_some()));

        let expired = cache
            .get_at("https://a", now + Duration::seconds(CATALOG_TTL_SECONDS + 1))
            .await;
        assert!(expired.is_none());
        assert!(cache.get_at("https://b", now).await.is_none());
    }

    #[test]
    fn trims_oldest_entries_first() {
        let now = Utc::now();
        let mut entries: CatalogMap = (0..MAX_CACHED_CATALOGS + 2)
            .map(|n| {
                (
                    format!("https://v/{n}"),
                    CachedCatalog {
                        formats: FormatIndex::default(),
                        created_at: now + Duration::seconds(n as i64),
                    },
                )
            })
            .collect();

        trim_catalogs(&mut entries);

        assert_eq!(entries.len(), MAX_CACHED_CATALOGS);
        assert!(!entries.contains_key("https://v/0"));
        assert!(!entries.contains_key("https://v/1"));
        assert!(entries.contains_key("https://v/2"));
    }
}
