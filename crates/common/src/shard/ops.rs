//! Shard tree mutations.
//!
//! `put` and `del` descend from the root collecting the shards they pass
//! through, mutate the shard the key lands in, then rebuild the path bottom
//! up. Every rebuilt shard is emitted as an addition and every shard it
//! replaces as a removal, so callers can keep a block store exactly in sync
//! with what the new root reaches.

use tokio_util::sync::CancellationToken;

use crate::block::Fetcher;
use crate::linked_data::{Block, Link};

use super::{Shard, ShardConfig, ShardDiff, ShardEntry, ShardError, ShardValue};

pub(super) async fn load_shard(
    blocks: &dyn Fetcher,
    link: &Link,
) -> Result<(Block, Shard), ShardError> {
    let block = blocks.get(link).await?;
    let shard = Shard::unmarshal(&block)?;
    Ok((block, shard))
}

/// Get the value for `key`, or [`ShardError::NotFound`].
pub async fn get(blocks: &dyn Fetcher, root: &Link, key: &str) -> Result<Link, ShardError> {
    if key.is_empty() {
        return Err(ShardError::InvalidKey);
    }
    let mut link = *root;
    let mut rest = key.to_string();
    loop {
        let (_, shard) = load_shard(blocks, &link).await?;
        let Some(entry) = shard
            .entries
            .iter()
            .find(|e| rest == e.prefix || rest.starts_with(e.prefix.as_str()))
        else {
            return Err(ShardError::NotFound);
        };
        if entry.prefix == rest {
            return match &entry.value {
                ShardValue::Value(v) => Ok(*v),
                ShardValue::Branch { value: Some(v), .. } => Ok(*v),
                ShardValue::Branch { value: None, .. } => Err(ShardError::NotFound),
            };
        }
        match &entry.value {
            ShardValue::Branch { child, .. } => {
                rest = rest[entry.prefix.len()..].to_string();
                link = *child;
            }
            ShardValue::Value(_) => return Err(ShardError::NotFound),
        }
    }
}

enum Plan {
    Descend {
        idx: usize,
        child: Link,
        consumed: usize,
    },
    SetValueEntry {
        idx: usize,
    },
    SetBranchValue {
        idx: usize,
    },
    NestUnder {
        idx: usize,
    },
    FactorAbove {
        start: usize,
        end: usize,
    },
    Insert,
}

fn plan_insert(shard: &Shard, key: &str) -> Plan {
    if let Ok(idx) = shard
        .entries
        .binary_search_by(|e| e.prefix.as_str().cmp(key))
    {
        return match shard.entries[idx].value {
            ShardValue::Value(_) => Plan::SetValueEntry { idx },
            ShardValue::Branch { .. } => Plan::SetBranchValue { idx },
        };
    }
    // a single entry at most can be a proper prefix of the key, because
    // sibling prefixes never contain one another
    for (idx, entry) in shard.entries.iter().enumerate() {
        if key.starts_with(entry.prefix.as_str()) {
            return match &entry.value {
                ShardValue::Branch { child, .. } => Plan::Descend {
                    idx,
                    child: *child,
                    consumed: entry.prefix.len(),
                },
                ShardValue::Value(_) => Plan::NestUnder { idx },
            };
        }
    }
    // entries extending the key sort contiguously
    let start = shard
        .entries
        .partition_point(|e| e.prefix.as_str() < key);
    let mut end = start;
    while end < shard.entries.len() && shard.entries[end].prefix.starts_with(key) {
        end += 1;
    }
    if end > start {
        return Plan::FactorAbove { start, end };
    }
    Plan::Insert
}

/// Put `value` at `key`, returning the new root and the block diff.
pub async fn put(
    blocks: &dyn Fetcher,
    root: &Link,
    key: &str,
    value: Link,
    cfg: &ShardConfig,
    cancel: &CancellationToken,
) -> Result<(Link, ShardDiff), ShardError> {
    if key.is_empty() {
        return Err(ShardError::InvalidKey);
    }

    let mut path: Vec<(Block, Shard, usize)> = Vec::new();
    let mut current_link = *root;
    let (mut current_block, mut current) = load_shard(blocks, &current_link).await?;
    let mut rest = key.to_string();

    let mut new_blocks: Vec<Block> = Vec::new();
    loop {
        if cancel.is_cancelled() {
            return Err(ShardError::Cancelled);
        }
        match plan_insert(&current, &rest) {
            Plan::Descend {
                idx,
                child,
                consumed,
            } => {
                path.push((current_block, current, idx));
                rest = rest[consumed..].to_string();
                current_link = child;
                let loaded = load_shard(blocks, &current_link).await?;
                current_block = loaded.0;
                current = loaded.1;
            }
            Plan::SetValueEntry { idx } => {
                current.entries[idx].value = ShardValue::Value(value);
                break;
            }
            Plan::SetBranchValue { idx } => {
                if let ShardValue::Branch { child, .. } = current.entries[idx].value {
                    current.entries[idx].value = ShardValue::Branch {
                        child,
                        value: Some(value),
                    };
                }
                break;
            }
            Plan::NestUnder { idx } => {
                // the key extends an existing value entry; push the new key
                // down into a child shard and keep the old value at the branch
                let entry = &current.entries[idx];
                let suffix = rest[entry.prefix.len()..].to_string();
                let ShardValue::Value(old) = entry.value else {
                    unreachable!("NestUnder only targets value entries");
                };
                let child = Shard {
                    entries: vec![ShardEntry {
                        prefix: suffix,
                        value: ShardValue::Value(value),
                    }],
                };
                let block = child.marshal()?;
                current.entries[idx].value = ShardValue::Branch {
                    child: *block.link(),
                    value: Some(old),
                };
                new_blocks.push(block);
                break;
            }
            Plan::FactorAbove { start, end } => {
                // the key is a proper prefix of one or more entries; factor
                // them into a child shard under a branch at the key
                let group: Vec<ShardEntry> = current.entries.drain(start..end).collect();
                let child_entries = group
                    .into_iter()
                    .map(|e| ShardEntry {
                        prefix: e.prefix[rest.len()..].to_string(),
                        value: e.value,
                    })
                    .collect();
                let child = Shard {
                    entries: child_entries,
                };
                let block = child.marshal()?;
                current.entries.insert(
                    start,
                    ShardEntry {
                        prefix: rest.clone(),
                        value: ShardValue::Branch {
                            child: *block.link(),
                            value: Some(value),
                        },
                    },
                );
                new_blocks.push(block);
                break;
            }
            Plan::Insert => {
                let at = current
                    .entries
                    .partition_point(|e| e.prefix.as_str() < rest.as_str());
                current.entries.insert(
                    at,
                    ShardEntry {
                        prefix: rest.clone(),
                        value: ShardValue::Value(value),
                    },
                );
                split_overflow(&mut current, cfg, &mut new_blocks)?;
                break;
            }
        }
    }

    // rebuild the path bottom up
    let leaf_block = current.marshal()?;
    if leaf_block.link() == current_block.link() {
        // same value written again; nothing changed anywhere
        return Ok((*root, ShardDiff::default()));
    }

    let mut diff = ShardDiff {
        additions: new_blocks,
        removals: vec![current_block],
    };
    let mut top = leaf_block;
    for (old_block, mut parent, idx) in path.into_iter().rev() {
        if let ShardValue::Branch { value, .. } = parent.entries[idx].value {
            parent.entries[idx].value = ShardValue::Branch {
                child: *top.link(),
                value,
            };
        }
        diff.additions.push(top);
        diff.removals.push(old_block);
        top = parent.marshal()?;
    }
    let new_root = *top.link();
    diff.additions.push(top);
    Ok((new_root, diff))
}

/// Push common-prefix groups down into child shards until the shard fits
/// within the configured width. Entries with pairwise distinct leading
/// characters cannot be grouped and may leave the shard oversized.
fn split_overflow(
    shard: &mut Shard,
    cfg: &ShardConfig,
    new_blocks: &mut Vec<Block>,
) -> Result<(), ShardError> {
    while shard.entries.len() > cfg.max_entries {
        let Some((start, end)) = widest_leading_group(shard) else {
            break;
        };
        let group: Vec<ShardEntry> = shard.entries.drain(start..end).collect();
        let prefix = longest_common_prefix(&group);
        let mut slot = None;
        let mut child_entries = Vec::with_capacity(group.len());
        for entry in group {
            if entry.prefix == prefix {
                match entry.value {
                    ShardValue::Value(v) => slot = Some(v),
                    ShardValue::Branch { .. } => {
                        return Err(ShardError::Malformed(
                            "branch prefix contained in a sibling prefix".to_string(),
                        ))
                    }
                }
            } else {
                child_entries.push(ShardEntry {
                    prefix: entry.prefix[prefix.len()..].to_string(),
                    value: entry.value,
                });
            }
        }
        let mut child = Shard {
            entries: child_entries,
        };
        split_overflow(&mut child, cfg, new_blocks)?;
        let block = child.marshal()?;
        shard.entries.insert(
            start,
            ShardEntry {
                prefix,
                value: ShardValue::Branch {
                    child: *block.link(),
                    value: slot,
                },
            },
        );
        new_blocks.push(block);
    }
    Ok(())
}

/// Largest run of entries sharing a leading character, ties broken towards
/// the lexicographically smallest. Runs of one cannot be split.
fn widest_leading_group(shard: &Shard) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    let mut start = 0;
    while start < shard.entries.len() {
        let lead = shard.entries[start].prefix.chars().next();
        let mut end = start + 1;
        while end < shard.entries.len() && shard.entries[end].prefix.chars().next() == lead {
            end += 1;
        }
        if end - start >= 2 && best.map_or(true, |(s, e)| end - start > e - s) {
            best = Some((start, end));
        }
        start = end;
    }
    best
}

fn longest_common_prefix(entries: &[ShardEntry]) -> String {
    let first = entries[0].prefix.as_str();
    let mut len = first.len();
    for entry in &entries[1..] {
        let mut common = 0;
        for (a, b) in first.bytes().zip(entry.prefix.bytes()) {
            if a != b {
                break;
            }
            common += 1;
        }
        len = len.min(common);
    }
    // stay on a char boundary
    while !first.is_char_boundary(len) {
        len -= 1;
    }
    first[..len].to_string()
}

enum Removal {
    /// Remove the value entry at `idx`.
    Entry(usize),
    /// Clear the value slot of the branch entry at `idx`.
    BranchValue(usize),
}

/// Delete `key`, returning the new root and the block diff. Deleting an
/// absent key returns the unchanged root with an empty diff.
pub async fn del(
    blocks: &dyn Fetcher,
    root: &Link,
    key: &str,
    cancel: &CancellationToken,
) -> Result<(Link, ShardDiff), ShardError> {
    if key.is_empty() {
        return Err(ShardError::InvalidKey);
    }

    let mut path: Vec<(Block, Shard, usize)> = Vec::new();
    let mut current_link = *root;
    let (mut current_block, mut current) = load_shard(blocks, &current_link).await?;
    let mut rest = key.to_string();

    let removal = loop {
        if cancel.is_cancelled() {
            return Err(ShardError::Cancelled);
        }
        let exact = current
            .entries
            .binary_search_by(|e| e.prefix.as_str().cmp(rest.as_str()));
        if let Ok(idx) = exact {
            match current.entries[idx].value {
                ShardValue::Value(_) => break Removal::Entry(idx),
                ShardValue::Branch { value: Some(_), .. } => break Removal::BranchValue(idx),
                ShardValue::Branch { value: None, .. } => {
                    return Ok((*root, ShardDiff::default()))
                }
            }
        }
        let descend = current.entries.iter().enumerate().find_map(|(idx, e)| {
            if rest.starts_with(e.prefix.as_str()) {
                match &e.value {
                    ShardValue::Branch { child, .. } => Some((idx, *child, e.prefix.len())),
                    ShardValue::Value(_) => None,
                }
            } else {
                None
            }
        });
        let Some((idx, child, consumed)) = descend else {
            return Ok((*root, ShardDiff::default()));
        };
        path.push((current_block, current, idx));
        rest = rest[consumed..].to_string();
        current_link = child;
        let loaded = load_shard(blocks, &current_link).await?;
        current_block = loaded.0;
        current = loaded.1;
    };

    match removal {
        Removal::Entry(idx) => {
            current.entries.remove(idx);
        }
        Removal::BranchValue(idx) => {
            if let ShardValue::Branch { child, .. } = current.entries[idx].value {
                current.entries[idx].value = ShardValue::Branch { child, value: None };
            }
        }
    }

    let mut diff = ShardDiff {
        additions: Vec::new(),
        removals: vec![current_block],
    };

    // rebuild bottom up, compacting children that emptied or shrank to a
    // single inlinable entry
    let mut child_shard = current;
    for (old_block, mut parent, idx) in path.into_iter().rev() {
        diff.removals.push(old_block);
        let branch_value = match &parent.entries[idx].value {
            ShardValue::Branch { value, .. } => *value,
            ShardValue::Value(_) => None,
        };
        if child_shard.entries.is_empty() {
            match branch_value {
                Some(v) => parent.entries[idx].value = ShardValue::Value(v),
                None => {
                    parent.entries.remove(idx);
                }
            }
        } else if child_shard.entries.len() == 1 && branch_value.is_none() {
            let only = child_shard.entries.into_iter().next().expect("one entry");
            parent.entries[idx] = ShardEntry {
                prefix: format!("{}{}", parent.entries[idx].prefix, only.prefix),
                value: only.value,
            };
        } else {
            let block = child_shard.marshal()?;
            parent.entries[idx].value = ShardValue::Branch {
                child: *block.link(),
                value: branch_value,
            };
            diff.additions.push(block);
        }
        child_shard = parent;
    }

    let root_block = child_shard.marshal()?;
    let new_root = *root_block.link();
    diff.additions.push(root_block);
    Ok((new_root, diff))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::entries;
    use super::super::EntryRange;
    use super::*;
    use crate::block::{Blockstore, MemoryBlockstore};
    use futures::TryStreamExt;

    async fn fresh_root(blocks: &MemoryBlockstore) -> Link {
        let block = Shard::empty_root_block().unwrap();
        let link = *block.link();
        blocks.put(&block).await.unwrap();
        link
    }

    /// Apply a diff the way a bucket would.
    async fn apply(blocks: &MemoryBlockstore, diff: &ShardDiff) {
        blocks.put_batch(&diff.additions).await.unwrap();
        for removal in &diff.removals {
            blocks.del(removal.link()).await.unwrap();
        }
    }

    async fn put_all(
        blocks: &MemoryBlockstore,
        root: Link,
        cfg: &ShardConfig,
        pairs: &[(&str, Link)],
    ) -> Link {
        let cancel = CancellationToken::new();
        let mut root = root;
        for (key, value) in pairs {
            let (next, diff) = put(blocks, &root, key, *value, cfg, &cancel).await.unwrap();
            apply(blocks, &diff).await;
            root = next;
        }
        root
    }

    async fn collect(blocks: &MemoryBlockstore, root: Link) -> Vec<(String, Link)> {
        entries(
            Arc::new(blocks.clone()),
            root,
            EntryRange::all(),
            CancellationToken::new(),
        )
        .try_collect()
        .await
        .unwrap()
    }

    fn value(tag: &str) -> Link {
        Link::of_raw(tag.as_bytes())
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let blocks = MemoryBlockstore::new();
        let root = fresh_root(&blocks).await;
        let cfg = ShardConfig::default();
        let root = put_all(&blocks, root, &cfg, &[("a", value("v1"))]).await;
        assert_eq!(get(&blocks, &root, "a").await.unwrap(), value("v1"));
        assert!(matches!(
            get(&blocks, &root, "b").await,
            Err(ShardError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_overwrite() {
        let blocks = MemoryBlockstore::new();
        let root = fresh_root(&blocks).await;
        let cfg = ShardConfig::default();
        let root = put_all(
            &blocks,
            root,
            &cfg,
            &[("a", value("v1")), ("a", value("v2"))],
        )
        .await;
        assert_eq!(get(&blocks, &root, "a").await.unwrap(), value("v2"));
        assert_eq!(collect(&blocks, root).await.len(), 1);
    }

    #[tokio::test]
    async fn test_put_same_value_is_no_op() {
        let blocks = MemoryBlockstore::new();
        let root = fresh_root(&blocks).await;
        let cfg = ShardConfig::default();
        let cancel = CancellationToken::new();
        let root = put_all(&blocks, root, &cfg, &[("a", value("v1"))]).await;
        let (next, diff) = put(&blocks, &root, "a", value("v1"), &cfg, &cancel)
            .await
            .unwrap();
        assert_eq!(next, root);
        assert!(diff.additions.is_empty());
        assert!(diff.removals.is_empty());
    }

    #[tokio::test]
    async fn test_key_extending_existing_key() {
        let blocks = MemoryBlockstore::new();
        let root = fresh_root(&blocks).await;
        let cfg = ShardConfig::default();
        let root = put_all(
            &blocks,
            root,
            &cfg,
            &[("ab", value("1")), ("abc", value("2")), ("a", value("3"))],
        )
        .await;
        assert_eq!(get(&blocks, &root, "ab").await.unwrap(), value("1"));
        assert_eq!(get(&blocks, &root, "abc").await.unwrap(), value("2"));
        assert_eq!(get(&blocks, &root, "a").await.unwrap(), value("3"));
        let listed = collect(&blocks, root).await;
        assert_eq!(
            listed.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["a", "ab", "abc"]
        );
    }

    #[tokio::test]
    async fn test_split_at_max_entries() {
        let blocks = MemoryBlockstore::new();
        let root = fresh_root(&blocks).await;
        let cfg = ShardConfig { max_entries: 4 };
        let keys = [
            "car", "cat", "cow", "dog", "door", "duck", "deer", "crow", "d",
        ];
        let pairs: Vec<(&str, Link)> = keys.iter().map(|k| (*k, value(k))).collect();
        let root = put_all(&blocks, root, &cfg, &pairs).await;
        for key in keys {
            assert_eq!(get(&blocks, &root, key).await.unwrap(), value(key));
        }
        let listed = collect(&blocks, root).await;
        let mut expected: Vec<&str> = keys.to_vec();
        expected.sort();
        assert_eq!(
            listed.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            expected
        );
    }

    #[tokio::test]
    async fn test_del() {
        let blocks = MemoryBlockstore::new();
        let root = fresh_root(&blocks).await;
        let cfg = ShardConfig::default();
        let cancel = CancellationToken::new();
        let root = put_all(
            &blocks,
            root,
            &cfg,
            &[("a", value("1")), ("ab", value("2"))],
        )
        .await;

        let (root, diff) = del(&blocks, &root, "ab", &cancel).await.unwrap();
        apply(&blocks, &diff).await;
        assert!(matches!(
            get(&blocks, &root, "ab").await,
            Err(ShardError::NotFound)
        ));
        assert_eq!(get(&blocks, &root, "a").await.unwrap(), value("1"));

        // deleting an absent key is a no-op
        let (same, diff) = del(&blocks, &root, "ab", &cancel).await.unwrap();
        assert_eq!(same, root);
        assert!(diff.additions.is_empty() && diff.removals.is_empty());
    }

    #[tokio::test]
    async fn test_del_everything_restores_empty_root() {
        let blocks = MemoryBlockstore::new();
        let empty = fresh_root(&blocks).await;
        let cfg = ShardConfig { max_entries: 2 };
        let cancel = CancellationToken::new();
        let keys = ["alpha", "alpine", "beta", "bet", "gamma"];
        let pairs: Vec<(&str, Link)> = keys.iter().map(|k| (*k, value(k))).collect();
        let mut root = put_all(&blocks, empty, &cfg, &pairs).await;
        for key in keys {
            let (next, diff) = del(&blocks, &root, key, &cancel).await.unwrap();
            apply(&blocks, &diff).await;
            root = next;
        }
        assert_eq!(root, empty);
        assert!(collect(&blocks, root).await.is_empty());
    }

    #[tokio::test]
    async fn test_same_sequence_produces_identical_roots() {
        let cfg = ShardConfig { max_entries: 3 };
        let ops = [
            ("letter/a", Some(value("1"))),
            ("letter/b", Some(value("2"))),
            ("letter", Some(value("3"))),
            ("number/1", Some(value("4"))),
            ("letter/b", None),
            ("letter/ab", Some(value("5"))),
        ];
        let mut roots = Vec::new();
        for _ in 0..2 {
            let blocks = MemoryBlockstore::new();
            let mut root = fresh_root(&blocks).await;
            let cancel = CancellationToken::new();
            for (key, v) in &ops {
                let (next, diff) = match v {
                    Some(v) => put(&blocks, &root, key, *v, &cfg, &cancel).await.unwrap(),
                    None => del(&blocks, &root, key, &cancel).await.unwrap(),
                };
                apply(&blocks, &diff).await;
                root = next;
            }
            roots.push(root);
        }
        assert_eq!(roots[0], roots[1]);
    }

    #[tokio::test]
    async fn test_removals_leave_only_reachable_blocks() {
        let blocks = MemoryBlockstore::new();
        let root = fresh_root(&blocks).await;
        let cfg = ShardConfig { max_entries: 2 };
        let keys = ["aa", "ab", "ac", "ba", "bb"];
        let pairs: Vec<(&str, Link)> = keys.iter().map(|k| (*k, value(k))).collect();
        let root = put_all(&blocks, root, &cfg, &pairs).await;
        // every key is still resolvable through what remains in the store
        for key in keys {
            assert_eq!(get(&blocks, &root, key).await.unwrap(), value(key));
        }
    }

    #[tokio::test]
    async fn test_cancelled_put() {
        let blocks = MemoryBlockstore::new();
        let root = fresh_root(&blocks).await;
        let cfg = ShardConfig::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            put(&blocks, &root, "a", value("1"), &cfg, &cancel).await,
            Err(ShardError::Cancelled)
        ));
    }
}
