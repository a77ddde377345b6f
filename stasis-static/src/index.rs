//! Asset index
//!
//! A [`Snapshot`] is one complete generation of the index. The
//! [`Catalog`] holds the current snapshot behind an atomically swappable
//! pointer: readers load an `Arc` once per request and keep it, so a
//! rebuild never changes what an in-flight request sees.

use crate::record::AssetRecord;
use arc_swap::ArcSwapOption;
use http::StatusCode;
use stasis_core::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A key that answers with a redirect instead of content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// `Location`, absolute or relative to the request path
    pub location: String,
    pub status: StatusCode,
}

impl Redirect {
    /// 302 Found
    pub fn found(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            status: StatusCode::FOUND,
        }
    }
}

/// What a key resolves to
#[derive(Debug, Clone, Copy)]
pub enum Resolved<'a> {
    /// The key is the record's own key
    Asset(&'a Arc<AssetRecord>),
    /// The key is an alias of `canonical`
    Alias {
        record: &'a Arc<AssetRecord>,
        canonical: &'a str,
    },
    Redirect(&'a Redirect),
}

/// One immutable generation of the index
#[derive(Debug, Default)]
pub struct Snapshot {
    generation: u64,
    assets: HashMap<String, Arc<AssetRecord>>,
    aliases: HashMap<String, String>,
    redirects: HashMap<String, Redirect>,
}

impl Snapshot {
    /// Index finished records
    ///
    /// The first record seen for a key wins. Aliases and redirects never
    /// shadow a real key.
    pub fn build(
        records: impl IntoIterator<Item = AssetRecord>,
        redirects: impl IntoIterator<Item = (String, Redirect)>,
    ) -> Self {
        let mut assets: HashMap<String, Arc<AssetRecord>> = HashMap::new();
        for record in records {
            if assets.contains_key(record.key()) {
                tracing::warn!("⚠️ Duplicate key {}, keeping the first", record.key());
                continue;
            }
            assets.insert(record.key().to_string(), Arc::new(record));
        }

        let mut aliases = HashMap::new();
        let mut keys: Vec<&String> = assets.keys().collect();
        keys.sort();
        for key in keys {
            for alias in assets[key].aliases() {
                if assets.contains_key(alias) {
                    tracing::warn!("⚠️ Alias {} shadows a file, ignoring", alias);
                    continue;
                }
                aliases.entry(alias.clone()).or_insert_with(|| key.clone());
            }
        }

        let mut redirect_map = HashMap::new();
        for (from, redirect) in redirects {
            if assets.contains_key(&from) || aliases.contains_key(&from) {
                continue;
            }
            redirect_map.entry(from).or_insert(redirect);
        }

        Self {
            generation: 0,
            assets,
            aliases,
            redirects: redirect_map,
        }
    }

    /// Set when the snapshot is published; 0 before that
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Record for a key, trying the key itself and then aliases
    pub fn lookup(&self, key: &str) -> Option<&Arc<AssetRecord>> {
        self.assets.get(key).or_else(|| {
            self.aliases
                .get(key)
                .and_then(|canonical| self.assets.get(canonical))
        })
    }

    /// Full resolution of a key, redirects included
    pub fn resolve(&self, key: &str) -> Option<Resolved<'_>> {
        if let Some(record) = self.assets.get(key) {
            return Some(Resolved::Asset(record));
        }
        if let Some((canonical, record)) = self
            .aliases
            .get(key)
            .and_then(|c| self.assets.get(c).map(|r| (c.as_str(), r)))
        {
            return Some(Resolved::Alias { record, canonical });
        }
        self.redirects.get(key).map(Resolved::Redirect)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    pub fn redirect_count(&self) -> usize {
        self.redirects.len()
    }

    /// All records, in no particular order
    pub fn records(&self) -> impl Iterator<Item = &Arc<AssetRecord>> {
        self.assets.values()
    }
}

/// Holder of the current snapshot
#[derive(Debug, Default)]
pub struct Catalog {
    current: ArcSwapOption<Snapshot>,
    generation: AtomicU64,
    writer: tokio::sync::Mutex<()>,
}

impl Catalog {
    /// An empty catalog; lookups fail with `IndexNotReady` until the first publish
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current snapshot
    pub fn publish(&self, mut snapshot: Snapshot) -> Arc<Snapshot> {
        snapshot.generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(snapshot);
        self.current.store(Some(snapshot.clone()));
        tracing::info!(
            "📦 Published generation {} ({} assets, {} aliases, {} redirects)",
            snapshot.generation,
            snapshot.len(),
            snapshot.alias_count(),
            snapshot.redirect_count()
        );
        snapshot
    }

    /// The snapshot to use for one request
    pub fn snapshot(&self) -> Result<Arc<Snapshot>> {
        self.current.load_full().ok_or(Error::IndexNotReady)
    }

    /// Look a key up in the current snapshot
    pub fn lookup(&self, key: &str) -> Result<Option<Arc<AssetRecord>>> {
        Ok(self.snapshot()?.lookup(key).cloned())
    }

    /// Build a new snapshot and publish it once the build succeeds
    ///
    /// Builds are serialized. A failed build leaves the current snapshot
    /// in place.
    pub async fn rebuild<F, Fut, R>(&self, build: F) -> Result<(Arc<Snapshot>, R)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Snapshot, R)>>,
    {
        let _writer = self.writer.lock().await;
        let (snapshot, extra) = build().await?;
        Ok((self.publish(snapshot), extra))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AssetKind, RecordMeta, Storage, Variant, etag_for};
    use bytes::Bytes;
    use std::path::PathBuf;

    fn record(key: &str, content: &'static [u8], aliases: &[&str]) -> AssetRecord {
        AssetRecord::new(
            RecordMeta {
                key: key.to_string(),
                source: PathBuf::from(key.trim_start_matches('/')),
                etag: etag_for(content),
                modified: None,
                mime_type: "application/javascript".to_string(),
                content_type: "text/javascript; charset=utf-8".to_string(),
                kind: AssetKind::Immutable,
                aliases: aliases.iter().map(|a| a.to_string()).collect(),
            },
            Variant::identity(content.len() as u64, Storage::Memory(Bytes::from_static(content))),
            Vec::new(),
        )
    }

    #[test]
    fn test_lookup_direct_then_alias() {
        let snapshot = Snapshot::build(
            vec![record("/app.abc123.js", b"one", &["/app.js"])],
            Vec::new(),
        );
        let direct = snapshot.lookup("/app.abc123.js").unwrap();
        let alias = snapshot.lookup("/app.js").unwrap();
        assert!(Arc::ptr_eq(direct, alias));
        assert!(alias.is_immutable());
        assert!(snapshot.lookup("/missing.js").is_none());

        match snapshot.resolve("/app.js") {
            Some(Resolved::Alias { canonical, .. }) => assert_eq!(canonical, "/app.abc123.js"),
            other => panic!("expected alias, got {:?}", other),
        }
    }

    #[test]
    fn test_first_key_wins_and_aliases_never_shadow() {
        let snapshot = Snapshot::build(
            vec![
                record("/app.js", b"first", &[]),
                record("/app.js", b"second", &[]),
                record("/app.abc123.js", b"hashed", &["/app.js", "/main.js"]),
            ],
            vec![
                ("/main.js".to_string(), Redirect::found("/elsewhere")),
                ("/docs".to_string(), Redirect::found("docs/")),
            ],
        );
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.lookup("/app.js").unwrap().etag_str(), etag_for(b"first"));
        assert_eq!(snapshot.alias_count(), 1);
        assert!(matches!(snapshot.resolve("/main.js"), Some(Resolved::Alias { .. })));
        match snapshot.resolve("/docs") {
            Some(Resolved::Redirect(r)) => {
                assert_eq!(r.location, "docs/");
                assert_eq!(r.status, StatusCode::FOUND);
            }
            other => panic!("expected redirect, got {:?}", other),
        }
    }

    #[test]
    fn test_not_ready_before_publish() {
        let catalog = Catalog::new();
        assert!(matches!(catalog.snapshot(), Err(Error::IndexNotReady)));
        assert!(matches!(catalog.lookup("/app.js"), Err(Error::IndexNotReady)));
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let catalog = Catalog::new();
        catalog.publish(Snapshot::build(vec![record("/app.js", b"old", &[])], Vec::new()));
        let in_flight = catalog.snapshot().unwrap();

        catalog.publish(Snapshot::build(vec![record("/app.js", b"new", &[])], Vec::new()));

        assert_eq!(in_flight.generation(), 1);
        assert_eq!(in_flight.lookup("/app.js").unwrap().etag_str(), etag_for(b"old"));
        let current = catalog.snapshot().unwrap();
        assert_eq!(current.generation(), 2);
        assert_eq!(current.lookup("/app.js").unwrap().etag_str(), etag_for(b"new"));
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_current() {
        let catalog = Catalog::new();
        catalog.publish(Snapshot::build(vec![record("/app.js", b"old", &[])], Vec::new()));

        let failed = catalog
            .rebuild(|| async { Err::<(Snapshot, ()), _>(Error::Manifest("broken".to_string())) })
            .await;
        assert!(failed.is_err());
        assert_eq!(catalog.snapshot().unwrap().generation(), 1);

        let (snapshot, count) = catalog
            .rebuild(|| async {
                Ok((Snapshot::build(vec![record("/app.js", b"new", &[])], Vec::new()), 1usize))
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(snapshot.generation(), 2);
    }
}
