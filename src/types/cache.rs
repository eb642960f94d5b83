//! Column type cache.
//!
//! Maps a statement fingerprint to the column types its results carry, so
//! the catalog is consulted once per statement shape. Shared by every
//! Protocol through an `Arc<TypeCache>` created at startup.
//!
//! Entries are never evicted, so only [`Resolved::Durable`] types are
//! stored. Concurrent misses on the same fingerprint may each run their
//! resolver; the first stored entry wins.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use super::ColumnType;
use crate::error::Result;

/// Outcome of a column type lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// Valid for every result of the statement shape. Stored.
    Durable(Vec<ColumnType>),
    /// Valid for the result at hand only, e.g. a guess made after a failed
    /// catalog lookup. Returned but not stored.
    Transient(Vec<ColumnType>),
}

/// Process-wide column type store.
#[derive(Debug, Default)]
pub struct TypeCache {
    entries: DashMap<String, Arc<[ColumnType]>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize statement text into a cache key.
    ///
    /// Runs of whitespace outside quoted literals and identifiers collapse
    /// to one space; surrounding whitespace and trailing semicolons are
    /// dropped. Case is kept, since quoted identifiers are case-sensitive.
    pub fn key_from_statement(statement: &str) -> String {
        let mut key = String::with_capacity(statement.len());
        let mut quote: Option<char> = None;
        let mut pending_space = false;

        for c in statement.trim().chars() {
            match quote {
                Some(q) => {
                    key.push(c);
                    if c == q {
                        quote = None;
                    }
                }
                None if c.is_whitespace() => pending_space = true,
                None => {
                    if pending_space && !key.is_empty() {
                        key.push(' ');
                    }
                    pending_space = false;
                    if c == '\'' || c == '"' {
                        quote = Some(c);
                    }
                    key.push(c);
                }
            }
        }

        while key.ends_with(';') || key.ends_with(' ') {
            key.pop();
        }
        key
    }

    /// Cached column types for `key`, if any.
    pub fn get_column_types(&self, key: &str) -> Option<Arc<[ColumnType]>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Return the cached types for `key`, or run `resolver` and store a
    /// durable result. Resolver errors are returned and nothing is stored.
    pub async fn fetch_column_types<F, Fut>(&self, key: &str, resolver: F) -> Result<Arc<[ColumnType]>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Resolved>>,
    {
        if let Some(types) = self.get_column_types(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(types);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let resolved: Arc<[ColumnType]> = match resolver().await? {
            Resolved::Durable(types) => types.into(),
            Resolved::Transient(types) => {
                tracing::debug!("not caching provisional column types for '{}'", key);
                return Ok(types.into());
            }
        };
        let stored = self
            .entries
            .entry(key.to_string())
            .or_insert(resolved)
            .value()
            .clone();
        tracing::debug!(columns = stored.len(), "cached column types for '{}'", key);
        Ok(stored)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::TypeKind;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_key_from_statement() {
        assert_eq!(
            TypeCache::key_from_statement("  SELECT  *\n\tFROM users ;; "),
            "SELECT * FROM users"
        );
        assert_eq!(
            TypeCache::key_from_statement("SELECT 'a  b' FROM \"My  Table\""),
            "SELECT 'a  b' FROM \"My  Table\""
        );
        assert_ne!(
            TypeCache::key_from_statement("select * from t"),
            TypeCache::key_from_statement("SELECT * FROM t")
        );
    }

    #[tokio::test]
    async fn test_fetch_is_idempotent() {
        let cache = TypeCache::new();
        let calls = AtomicUsize::new(0);
        let resolve = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Resolved::Durable(vec![ColumnType::new("ID", TypeKind::Integer)]))
        };

        let first = cache.fetch_column_types("SELECT id FROM t", resolve).await.unwrap();
        let second = cache.fetch_column_types("SELECT id FROM t", resolve).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 1,
                hits: 1,
                misses: 1
            }
        );
    }

    #[tokio::test]
    async fn test_resolver_error_not_cached() {
        let cache = TypeCache::new();
        let failed = cache
            .fetch_column_types("SELECT 1", || async { Err(Error::decode("catalog down")) })
            .await;
        assert!(failed.is_err());
        assert!(cache.is_empty());

        let types = cache
            .fetch_column_types("SELECT 1", || async {
                Ok(Resolved::Durable(vec![ColumnType::new("1", TypeKind::Integer)]))
            })
            .await
            .unwrap();
        assert_eq!(types.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_types_not_cached() {
        let cache = TypeCache::new();
        let guessed = cache
            .fetch_column_types("SELECT d FROM t", || async {
                Ok(Resolved::Transient(vec![ColumnType::new("D", TypeKind::TEXT)]))
            })
            .await
            .unwrap();
        assert_eq!(guessed[0].kind, TypeKind::TEXT);
        assert!(cache.get_column_types("SELECT d FROM t").is_none());

        let durable = cache
            .fetch_column_types("SELECT d FROM t", || async {
                Ok(Resolved::Durable(vec![ColumnType::new("D", TypeKind::Date)]))
            })
            .await
            .unwrap();
        assert_eq!(durable[0].kind, TypeKind::Date);
        assert_eq!(cache.stats().misses, 2);
        assert_eq!(cache.stats().entries, 1);
    }
}
