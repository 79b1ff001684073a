//! Prefix-sharded persistent key → link map.
//!
//! A tree of shards addressed by the root shard's link. Each shard is an
//! ordered list of entries; an entry binds a string prefix to either a value
//! link or a branch into a child shard (optionally carrying a value for the
//! key that ends exactly at the branch). Traversing branches spells out the
//! key one prefix at a time.
//!
//! Mutations are stateless over `(root link, block source)` and return the
//! new root plus a [`ShardDiff`] naming every block created and every block
//! no longer reachable.

mod ops;
mod range;

pub use ops::{del, get, put};
pub use range::{entries, EntryRange};

use ipld_core::ipld::Ipld;

use crate::block::BlockError;
use crate::linked_data::{Block, CodecError, Link};

/// Width a shard may grow to before a common-prefix group is pushed down
/// into a child shard.
pub const MAX_SHARD_ENTRIES: usize = 48;

#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub max_entries: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        ShardConfig {
            max_entries: MAX_SHARD_ENTRIES,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("not found")]
    NotFound,
    #[error("invalid key")]
    InvalidKey,
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("malformed shard: {0}")]
    Malformed(String),
    #[error("block error: {0}")]
    Block(#[from] BlockError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("operation cancelled")]
    Cancelled,
}

/// Blocks created by a mutation and blocks that ceased to be reachable
/// from the new root.
#[derive(Debug, Default, Clone)]
pub struct ShardDiff {
    pub additions: Vec<Block>,
    pub removals: Vec<Block>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardValue {
    /// The prefix spells a complete key bound to this link.
    Value(Link),
    /// The prefix continues into a child shard. `value` is set when a key
    /// ends exactly at this prefix.
    Branch { child: Link, value: Option<Link> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardEntry {
    pub prefix: String,
    pub value: ShardValue,
}

/// One node of the shard tree. Entries are sorted by prefix and no entry's
/// prefix is a prefix of a sibling's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shard {
    pub(crate) entries: Vec<ShardEntry>,
}

impl Shard {
    pub fn empty() -> Self {
        Shard::default()
    }

    pub fn entries(&self) -> &[ShardEntry] {
        &self.entries
    }

    /// The canonical block for the empty tree.
    pub fn empty_root_block() -> Result<Block, ShardError> {
        Shard::empty().marshal()
    }

    /// Serialize to a deterministic DAG-CBOR block. The block's link is the
    /// shard's identity.
    pub fn marshal(&self) -> Result<Block, ShardError> {
        let entries = self
            .entries
            .iter()
            .map(|e| {
                let value = match &e.value {
                    ShardValue::Value(v) => Ipld::Link(*v.cid()),
                    ShardValue::Branch { child, value: None } => {
                        Ipld::List(vec![Ipld::Link(*child.cid())])
                    }
                    ShardValue::Branch {
                        child,
                        value: Some(v),
                    } => Ipld::List(vec![Ipld::Link(*child.cid()), Ipld::Link(*v.cid())]),
                };
                Ipld::List(vec![Ipld::String(e.prefix.clone()), value])
            })
            .collect();
        Ok(Block::encode_cbor(&Ipld::List(entries))?)
    }

    pub fn unmarshal(block: &Block) -> Result<Self, ShardError> {
        let ipld = block.decode_cbor()?;
        let Ipld::List(items) = ipld else {
            return Err(ShardError::Malformed(format!(
                "{}: shard is not a list",
                block.link()
            )));
        };
        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let Ipld::List(pair) = item else {
                return Err(ShardError::Malformed(format!(
                    "{}: entry is not a list",
                    block.link()
                )));
            };
            let mut pair = pair.into_iter();
            let (Some(Ipld::String(prefix)), Some(value)) = (pair.next(), pair.next()) else {
                return Err(ShardError::Malformed(format!(
                    "{}: entry is not a [prefix, value] pair",
                    block.link()
                )));
            };
            let value = match value {
                Ipld::Link(cid) => ShardValue::Value(Link::new(cid)),
                Ipld::List(links) => {
                    let mut links = links.into_iter();
                    match (links.next(), links.next()) {
                        (Some(Ipld::Link(child)), None) => ShardValue::Branch {
                            child: Link::new(child),
                            value: None,
                        },
                        (Some(Ipld::Link(child)), Some(Ipld::Link(v))) => ShardValue::Branch {
                            child: Link::new(child),
                            value: Some(Link::new(v)),
                        },
                        _ => {
                            return Err(ShardError::Malformed(format!(
                                "{}: branch is not a list of links",
                                block.link()
                            )))
                        }
                    }
                }
                _ => {
                    return Err(ShardError::Malformed(format!(
                        "{}: entry value is neither a link nor a branch",
                        block.link()
                    )))
                }
            };
            entries.push(ShardEntry { prefix, value });
        }
        Ok(Shard { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_root_is_canonical() {
        let a = Shard::empty_root_block().unwrap();
        let b = Shard::empty_root_block().unwrap();
        assert_eq!(a.link(), b.link());
    }

    #[test]
    fn test_marshal_round_trip() {
        let child = Link::of_cbor(b"child");
        let value = Link::of_cbor(b"value");
        let shard = Shard {
            entries: vec![
                ShardEntry {
                    prefix: "a".to_string(),
                    value: ShardValue::Value(value),
                },
                ShardEntry {
                    prefix: "b".to_string(),
                    value: ShardValue::Branch { child, value: None },
                },
                ShardEntry {
                    prefix: "c".to_string(),
                    value: ShardValue::Branch {
                        child,
                        value: Some(value),
                    },
                },
            ],
        };
        let block = shard.marshal().unwrap();
        let decoded = Shard::unmarshal(&block).unwrap();
        assert_eq!(decoded, shard);
    }

    #[test]
    fn test_marshal_is_deterministic() {
        let value = Link::of_cbor(b"value");
        let shard = Shard {
            entries: vec![ShardEntry {
                prefix: "key".to_string(),
                value: ShardValue::Value(value),
            }],
        };
        assert_eq!(
            shard.marshal().unwrap().link(),
            shard.marshal().unwrap().link()
        );
    }
}
