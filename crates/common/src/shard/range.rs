//! Range-filtered traversal of the shard tree.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::block::Fetcher;
use crate::linked_data::Link;

use super::ops::load_shard;
use super::{Shard, ShardError, ShardValue};

/// Key range selecting entries to yield. A range is either a prefix or an
/// optional lower + optional upper bound; combining a prefix with bounds is
/// rejected at construction.
#[derive(Debug, Clone, Default)]
pub struct EntryRange {
    prefix: Option<String>,
    /// bound key and whether it is inclusive
    lower: Option<(String, bool)>,
    upper: Option<(String, bool)>,
}

impl EntryRange {
    pub fn all() -> Self {
        EntryRange::default()
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        EntryRange {
            prefix: Some(prefix.into()),
            ..Default::default()
        }
    }

    pub fn greater_than(key: impl Into<String>) -> Self {
        EntryRange {
            lower: Some((key.into(), false)),
            ..Default::default()
        }
    }

    pub fn greater_than_or_equal(key: impl Into<String>) -> Self {
        EntryRange {
            lower: Some((key.into(), true)),
            ..Default::default()
        }
    }

    pub fn less_than(key: impl Into<String>) -> Self {
        EntryRange {
            upper: Some((key.into(), false)),
            ..Default::default()
        }
    }

    pub fn less_than_or_equal(key: impl Into<String>) -> Self {
        EntryRange {
            upper: Some((key.into(), true)),
            ..Default::default()
        }
    }

    /// Build a range from individual options, the way the CLI collects them.
    /// A prefix combined with any bound, or two bounds on the same side, is
    /// invalid.
    pub fn try_new(
        prefix: Option<String>,
        gt: Option<String>,
        gte: Option<String>,
        lt: Option<String>,
        lte: Option<String>,
    ) -> Result<Self, ShardError> {
        if prefix.is_some() && (gt.is_some() || gte.is_some() || lt.is_some() || lte.is_some()) {
            return Err(ShardError::InvalidRange(
                "prefix is mutually exclusive with bounds".to_string(),
            ));
        }
        if gt.is_some() && gte.is_some() {
            return Err(ShardError::InvalidRange(
                "at most one lower bound".to_string(),
            ));
        }
        if lt.is_some() && lte.is_some() {
            return Err(ShardError::InvalidRange(
                "at most one upper bound".to_string(),
            ));
        }
        let lower = gt.map(|k| (k, false)).or(gte.map(|k| (k, true)));
        let upper = lt.map(|k| (k, false)).or(lte.map(|k| (k, true)));
        Ok(EntryRange {
            prefix,
            lower,
            upper,
        })
    }

    pub(super) fn contains(&self, key: &str) -> bool {
        if let Some(prefix) = &self.prefix {
            return key.starts_with(prefix.as_str());
        }
        if let Some((bound, inclusive)) = &self.lower {
            let ok = if *inclusive {
                key >= bound.as_str()
            } else {
                key > bound.as_str()
            };
            if !ok {
                return false;
            }
        }
        if let Some((bound, inclusive)) = &self.upper {
            let ok = if *inclusive {
                key <= bound.as_str()
            } else {
                key < bound.as_str()
            };
            if !ok {
                return false;
            }
        }
        true
    }

    /// Whether a subtree whose keys all start with `subtree` can contain a
    /// key in this range. Used to prune traversal.
    pub(super) fn may_intersect(&self, subtree: &str) -> bool {
        if subtree.is_empty() {
            return true;
        }
        if let Some(prefix) = &self.prefix {
            return subtree.starts_with(prefix.as_str()) || prefix.starts_with(subtree);
        }
        if let Some((bound, inclusive)) = &self.upper {
            // the smallest key in the subtree is `subtree` itself
            let out = if *inclusive {
                subtree > bound.as_str()
            } else {
                subtree >= bound.as_str()
            };
            if out {
                return false;
            }
        }
        if let Some((bound, _)) = &self.lower {
            // every key in the subtree sorts below the bound exactly when
            // the bound neither extends the subtree prefix nor sorts
            // below it
            if !bound.starts_with(subtree) && subtree < bound.as_str() {
                return false;
            }
        }
        true
    }
}

enum Visit {
    Load { base: String, link: Link },
    Walk { base: String, shard: Shard, idx: usize },
}

struct TraverseState {
    blocks: Arc<dyn Fetcher>,
    range: EntryRange,
    cancel: CancellationToken,
    stack: Vec<Visit>,
}

/// Lazily yield `(key, link)` pairs under `root` in ascending key order,
/// visiting only shards whose prefix span intersects the range.
pub fn entries(
    blocks: Arc<dyn Fetcher>,
    root: Link,
    range: EntryRange,
    cancel: CancellationToken,
) -> BoxStream<'static, Result<(String, Link), ShardError>> {
    let state = TraverseState {
        blocks,
        range,
        cancel,
        stack: vec![Visit::Load {
            base: String::new(),
            link: root,
        }],
    };
    futures::stream::try_unfold(state, |mut st| async move {
        loop {
            if st.cancel.is_cancelled() {
                return Err(ShardError::Cancelled);
            }
            let Some(visit) = st.stack.pop() else {
                return Ok(None);
            };
            match visit {
                Visit::Load { base, link } => {
                    if !st.range.may_intersect(&base) {
                        continue;
                    }
                    let (_, shard) = load_shard(st.blocks.as_ref(), &link).await?;
                    st.stack.push(Visit::Walk {
                        base,
                        shard,
                        idx: 0,
                    });
                }
                Visit::Walk { base, shard, idx } => {
                    if idx >= shard.entries.len() {
                        continue;
                    }
                    let entry = shard.entries[idx].clone();
                    let key = format!("{}{}", base, entry.prefix);
                    st.stack.push(Visit::Walk {
                        base,
                        shard,
                        idx: idx + 1,
                    });
                    match entry.value {
                        ShardValue::Value(value) => {
                            if st.range.contains(&key) {
                                return Ok(Some(((key, value), st)));
                            }
                        }
                        ShardValue::Branch { child, value } => {
                            st.stack.push(Visit::Load {
                                base: key.clone(),
                                link: child,
                            });
                            if let Some(value) = value {
                                if st.range.contains(&key) {
                                    return Ok(Some(((key, value), st)));
                                }
                            }
                        }
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::super::{put, ShardConfig};
    use super::*;
    use crate::block::{Blockstore, MemoryBlockstore};
    use futures::TryStreamExt;

    async fn seeded(pairs: &[&str]) -> (MemoryBlockstore, Link) {
        let blocks = MemoryBlockstore::new();
        let block = Shard::empty_root_block().unwrap();
        let mut root = *block.link();
        blocks.put(&block).await.unwrap();
        let cfg = ShardConfig { max_entries: 3 };
        let cancel = CancellationToken::new();
        for key in pairs {
            let (next, diff) = put(
                &blocks,
                &root,
                key,
                Link::of_raw(key.as_bytes()),
                &cfg,
                &cancel,
            )
            .await
            .unwrap();
            blocks.put_batch(&diff.additions).await.unwrap();
            for removal in &diff.removals {
                blocks.del(removal.link()).await.unwrap();
            }
            root = next;
        }
        (blocks, root)
    }

    async fn keys(blocks: &MemoryBlockstore, root: Link, range: EntryRange) -> Vec<String> {
        let listed: Vec<(String, Link)> =
            entries(Arc::new(blocks.clone()), root, range, CancellationToken::new())
                .try_collect()
                .await
                .unwrap();
        listed.into_iter().map(|(k, _)| k).collect()
    }

    #[tokio::test]
    async fn test_all_yields_ascending() {
        let (blocks, root) = seeded(&["c", "a", "ba", "b", "ab"]).await;
        assert_eq!(
            keys(&blocks, root, EntryRange::all()).await,
            vec!["a", "ab", "b", "ba", "c"]
        );
    }

    #[tokio::test]
    async fn test_prefix_range() {
        let (blocks, root) = seeded(&["a", "b", "ba", "c"]).await;
        assert_eq!(
            keys(&blocks, root, EntryRange::prefix("b")).await,
            vec!["b", "ba"]
        );
    }

    #[tokio::test]
    async fn test_bounded_range() {
        let (blocks, root) = seeded(&["a", "b", "ba", "c"]).await;
        let range = EntryRange::try_new(
            None,
            Some("a".to_string()),
            None,
            None,
            Some("b".to_string()),
        )
        .unwrap();
        assert_eq!(keys(&blocks, root, range).await, vec!["b"]);
    }

    #[tokio::test]
    async fn test_crossed_bounds_yield_nothing() {
        let (blocks, root) = seeded(&["a", "b", "c"]).await;
        let range = EntryRange::try_new(
            None,
            Some("z".to_string()),
            None,
            Some("a".to_string()),
            None,
        )
        .unwrap();
        assert!(keys(&blocks, root, range).await.is_empty());
    }

    #[tokio::test]
    async fn test_prefix_with_bounds_rejected() {
        let result = EntryRange::try_new(
            Some("p".to_string()),
            Some("a".to_string()),
            None,
            None,
            None,
        );
        assert!(matches!(result, Err(ShardError::InvalidRange(_))));
    }

    #[tokio::test]
    async fn test_double_lower_bound_rejected() {
        let result = EntryRange::try_new(
            None,
            Some("a".to_string()),
            Some("b".to_string()),
            None,
            None,
        );
        assert!(matches!(result, Err(ShardError::InvalidRange(_))));
    }

    #[test]
    fn test_may_intersect_prunes_disjoint_subtrees() {
        let range = EntryRange::prefix("b");
        assert!(!range.may_intersect("a"));
        assert!(range.may_intersect("b"));
        assert!(range.may_intersect("ba"));

        let range = EntryRange::less_than("b");
        assert!(range.may_intersect("a"));
        assert!(!range.may_intersect("b"));

        let range = EntryRange::greater_than("b");
        assert!(!range.may_intersect("a"));
        // keys under "b" can still exceed the bound
        assert!(range.may_intersect("b"));
        assert!(range.may_intersect("c"));
    }
}
