//! Merkle clock: a DAG of causally linked events.
//!
//! Each event is a block carrying one mutating operation and the links of
//! the events that causally precede it. The head is the frontier of the
//! DAG in canonical order (ascending binary link). Events are append-only
//! and are only ever loaded from the block layer; traversal keeps a
//! visited set so malformed reference graphs cannot loop it.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use ipld_core::ipld::Ipld;
use tokio_util::sync::CancellationToken;

use crate::block::{BlockError, Fetcher};
use crate::linked_data::{decode_ipld, encode_ipld, Block, CodecError, Link};

#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    #[error("missing event: {0}")]
    MissingEvent(Link),
    #[error("malformed event: {0}: {1}")]
    MalformedEvent(Link, String),
    #[error("block error: {0}")]
    Block(#[from] BlockError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("operation cancelled")]
    Cancelled,
}

/// A mutating operation carried by an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Put { key: String, value: Link },
    Del { key: String },
}

impl Operation {
    pub fn key(&self) -> &str {
        match self {
            Operation::Put { key, .. } => key,
            Operation::Del { key } => key,
        }
    }
}

/// An event: one operation plus the links of its causal predecessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub op: Operation,
    pub parents: Vec<Link>,
}

impl Event {
    pub fn new(op: Operation, parents: Vec<Link>) -> Self {
        Event { op, parents }
    }

    fn to_ipld(&self) -> Ipld {
        let mut op = BTreeMap::new();
        match &self.op {
            Operation::Put { key, value } => {
                op.insert("key".to_string(), Ipld::String(key.clone()));
                op.insert("type".to_string(), Ipld::String("put".to_string()));
                op.insert("value".to_string(), Ipld::Link(*value.cid()));
            }
            Operation::Del { key } => {
                op.insert("key".to_string(), Ipld::String(key.clone()));
                op.insert("type".to_string(), Ipld::String("del".to_string()));
            }
        }
        let parents = self
            .parents
            .iter()
            .map(|l| Ipld::Link(*l.cid()))
            .collect();
        let mut map = BTreeMap::new();
        map.insert("op".to_string(), Ipld::Map(op));
        map.insert("parents".to_string(), Ipld::List(parents));
        Ipld::Map(map)
    }

    /// Serialize to a deterministic DAG-CBOR block; the block's link is the
    /// event's identity.
    pub fn encode(&self) -> Result<Block, ClockError> {
        Ok(Block::encode_cbor(&self.to_ipld())?)
    }

    pub fn decode(block: &Block) -> Result<Self, ClockError> {
        let link = *block.link();
        let malformed = |msg: &str| ClockError::MalformedEvent(link, msg.to_string());

        let Ipld::Map(mut map) = block.decode_cbor()? else {
            return Err(malformed("event is not a map"));
        };
        let Some(Ipld::Map(mut op)) = map.remove("op") else {
            return Err(malformed("missing op"));
        };
        let Some(Ipld::List(parent_items)) = map.remove("parents") else {
            return Err(malformed("missing parents"));
        };

        let Some(Ipld::String(kind)) = op.remove("type") else {
            return Err(malformed("missing op type"));
        };
        let Some(Ipld::String(key)) = op.remove("key") else {
            return Err(malformed("missing op key"));
        };
        let op = match kind.as_str() {
            "put" => match op.remove("value") {
                Some(Ipld::Link(value)) => Operation::Put {
                    key,
                    value: Link::new(value),
                },
                _ => return Err(malformed("put without value link")),
            },
            "del" => Operation::Del { key },
            other => {
                return Err(ClockError::MalformedEvent(
                    link,
                    format!("unknown op type: {other}"),
                ))
            }
        };

        let mut parents = Vec::with_capacity(parent_items.len());
        for item in parent_items {
            let Ipld::Link(parent) = item else {
                return Err(malformed("parent is not a link"));
            };
            parents.push(Link::new(parent));
        }
        // an event cannot precede itself
        if parents.contains(&link) {
            return Err(malformed("event lists itself as a parent"));
        }

        Ok(Event { op, parents })
    }
}

/// Head slot codec and canonical ordering.
pub mod head {
    use super::*;

    /// Sort ascending by binary link and drop duplicates.
    pub fn canonical(mut head: Vec<Link>) -> Vec<Link> {
        head.sort();
        head.dedup();
        head
    }

    /// Deterministic encoding of a head: a DAG-CBOR list of links. An empty
    /// list encodes a fresh bucket.
    pub fn encode(head: &[Link]) -> Result<Vec<u8>, CodecError> {
        let items = head.iter().map(|l| Ipld::Link(*l.cid())).collect();
        encode_ipld(&Ipld::List(items))
    }

    pub fn decode(bytes: &[u8]) -> Result<Vec<Link>, CodecError> {
        let Ipld::List(items) = decode_ipld(bytes)? else {
            return Err(CodecError::Decode("head is not a list".to_string()));
        };
        let mut head = Vec::with_capacity(items.len());
        for item in items {
            let Ipld::Link(link) = item else {
                return Err(CodecError::Decode("head item is not a link".to_string()));
            };
            head.push(Link::new(link));
        }
        Ok(head)
    }
}

/// Load and decode the event at `link`. A block-level `NotFound` surfaces
/// as the retriable [`ClockError::MissingEvent`].
pub async fn load_event(blocks: &dyn Fetcher, link: &Link) -> Result<Event, ClockError> {
    match blocks.get(link).await {
        Ok(block) => Event::decode(&block),
        Err(BlockError::NotFound(_)) => Err(ClockError::MissingEvent(*link)),
        Err(err) => Err(err.into()),
    }
}

/// Collect every event link reachable from `from` through parents,
/// excluding the starting links themselves.
async fn ancestors(
    blocks: &dyn Fetcher,
    from: &[Link],
    cancel: &CancellationToken,
) -> Result<HashSet<Link>, ClockError> {
    let mut seen: HashSet<Link> = HashSet::new();
    let mut queue: VecDeque<Link> = VecDeque::new();
    for link in from {
        let event = load_event(blocks, link).await?;
        queue.extend(event.parents);
    }
    while let Some(link) = queue.pop_front() {
        if cancel.is_cancelled() {
            return Err(ClockError::Cancelled);
        }
        if !seen.insert(link) {
            continue;
        }
        let event = load_event(blocks, &link).await?;
        queue.extend(event.parents);
    }
    Ok(seen)
}

/// Advance the head with a candidate event.
///
/// Idempotent: an event already in the head, or already an ancestor of a
/// head element, leaves the head unchanged. Head elements that turn out to
/// be ancestors of the event are dropped. The result is in canonical order.
pub async fn advance(
    blocks: &dyn Fetcher,
    head: &[Link],
    event: Link,
    cancel: &CancellationToken,
) -> Result<Vec<Link>, ClockError> {
    if head.contains(&event) {
        tracing::debug!("event {} already in head", event);
        return Ok(head.to_vec());
    }

    // loading validates the event and pulls it through any overlay fetcher
    load_event(blocks, &event).await?;

    if cancel.is_cancelled() {
        return Err(ClockError::Cancelled);
    }

    // everything the event descends from is superseded by it
    let event_ancestors = ancestors(blocks, &[event], cancel).await?;

    let mut next: BTreeSet<Link> = BTreeSet::new();
    for h in head {
        if !event_ancestors.contains(h) {
            next.insert(*h);
        }
    }

    // if the event is already in the past of a retained head element the
    // head is unchanged
    if !head.is_empty() {
        let head_ancestors = ancestors(blocks, head, cancel).await?;
        if head_ancestors.contains(&event) {
            tracing::debug!("event {} is an ancestor of the current head", event);
            return Ok(head.to_vec());
        }
    }

    next.insert(event);
    Ok(next.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Blockstore, MemoryBlockstore};

    fn value(tag: &str) -> Link {
        Link::of_raw(tag.as_bytes())
    }

    async fn append(
        blocks: &MemoryBlockstore,
        op: Operation,
        parents: Vec<Link>,
    ) -> Link {
        let block = Event::new(op, parents).encode().unwrap();
        let link = *block.link();
        blocks.put(&block).await.unwrap();
        link
    }

    #[tokio::test]
    async fn test_event_round_trip() {
        let event = Event::new(
            Operation::Put {
                key: "a".to_string(),
                value: value("v"),
            },
            vec![value("parent")],
        );
        let block = event.encode().unwrap();
        assert_eq!(Event::decode(&block).unwrap(), event);

        let del = Event::new(Operation::Del { key: "a".to_string() }, vec![]);
        let block = del.encode().unwrap();
        assert_eq!(Event::decode(&block).unwrap(), del);
    }

    #[tokio::test]
    async fn test_head_codec_round_trip() {
        let head = head::canonical(vec![value("b"), value("a"), value("a")]);
        let bytes = head::encode(&head).unwrap();
        assert_eq!(head::decode(&bytes).unwrap(), head);
        // empty head encodes and decodes
        assert!(head::decode(&head::encode(&[]).unwrap()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_advance_from_empty() {
        let blocks = MemoryBlockstore::new();
        let cancel = CancellationToken::new();
        let e1 = append(
            &blocks,
            Operation::Put {
                key: "a".to_string(),
                value: value("1"),
            },
            vec![],
        )
        .await;
        let head = advance(&blocks, &[], e1, &cancel).await.unwrap();
        assert_eq!(head, vec![e1]);
        // reapplying is a no-op
        assert_eq!(advance(&blocks, &head, e1, &cancel).await.unwrap(), head);
    }

    #[tokio::test]
    async fn test_advance_replaces_ancestors() {
        let blocks = MemoryBlockstore::new();
        let cancel = CancellationToken::new();
        let e1 = append(
            &blocks,
            Operation::Put {
                key: "a".to_string(),
                value: value("1"),
            },
            vec![],
        )
        .await;
        let e2 = append(
            &blocks,
            Operation::Put {
                key: "a".to_string(),
                value: value("2"),
            },
            vec![e1],
        )
        .await;
        let head = advance(&blocks, &[e1], e2, &cancel).await.unwrap();
        assert_eq!(head, vec![e2]);
        // an old event cannot move the head backwards
        assert_eq!(advance(&blocks, &head, e1, &cancel).await.unwrap(), head);
    }

    #[tokio::test]
    async fn test_advance_merges_concurrent_events() {
        let blocks = MemoryBlockstore::new();
        let cancel = CancellationToken::new();
        let e1 = append(
            &blocks,
            Operation::Put {
                key: "a".to_string(),
                value: value("1"),
            },
            vec![],
        )
        .await;
        let e2 = append(
            &blocks,
            Operation::Put {
                key: "b".to_string(),
                value: value("2"),
            },
            vec![],
        )
        .await;
        let head = advance(&blocks, &[e1], e2, &cancel).await.unwrap();
        assert_eq!(head, head::canonical(vec![e1, e2]));
    }

    #[tokio::test]
    async fn test_advance_missing_event() {
        let blocks = MemoryBlockstore::new();
        let cancel = CancellationToken::new();
        let absent = value("nowhere");
        assert!(matches!(
            advance(&blocks, &[], absent, &cancel).await,
            Err(ClockError::MissingEvent(l)) if l == absent
        ));
    }

    #[tokio::test]
    async fn test_deep_chain_traversal() {
        let blocks = MemoryBlockstore::new();
        let cancel = CancellationToken::new();
        let e1 = append(
            &blocks,
            Operation::Put {
                key: "a".to_string(),
                value: value("1"),
            },
            vec![],
        )
        .await;
        let mut parent = e1;
        for i in 0..64 {
            parent = append(
                &blocks,
                Operation::Put {
                    key: format!("k{i}"),
                    value: value("v"),
                },
                vec![parent],
            )
            .await;
        }
        let head = advance(&blocks, &[e1], parent, &cancel).await.unwrap();
        assert_eq!(head, vec![parent]);
    }

    #[tokio::test]
    async fn test_malformed_event_rejected() {
        let block = Block::encode_cbor(&Ipld::List(vec![Ipld::Integer(1)])).unwrap();
        assert!(matches!(
            Event::decode(&block),
            Err(ClockError::MalformedEvent(..))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_advance() {
        let blocks = MemoryBlockstore::new();
        let cancel = CancellationToken::new();
        let e1 = append(
            &blocks,
            Operation::Put {
                key: "a".to_string(),
                value: value("1"),
            },
            vec![],
        )
        .await;
        cancel.cancel();
        assert!(matches!(
            advance(&blocks, &[], e1, &cancel).await,
            Err(ClockError::Cancelled)
        ));
    }
}
