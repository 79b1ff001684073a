//! Operation-based CRDT over the merkle clock.
//!
//! State is materialized by replaying the event DAG onto an empty shard
//! tree in a fixed topological order. The order is total: ancestors come
//! first, and concurrent events are folded in ascending binary-link order.
//! That tie-break is what makes replicas converge, with the effect that the
//! operation sorting last wins a race on the same key.

use std::collections::{BTreeSet, HashMap, VecDeque};

use tokio_util::sync::CancellationToken;

use crate::block::{Blockstore, Fetcher};
use crate::clock::{self, ClockError, Event, Operation};
use crate::linked_data::{Block, Link};
use crate::shard::{self, Shard, ShardConfig, ShardDiff, ShardError};

#[derive(Debug, thiserror::Error)]
pub enum CrdtError {
    #[error("clock error: {0}")]
    Clock(#[from] ClockError),
    #[error("shard error: {0}")]
    Shard(#[from] ShardError),
    #[error("block error: {0}")]
    Block(#[from] crate::block::BlockError),
    #[error("operation cancelled")]
    Cancelled,
}

/// Result of applying one mutation.
pub struct Mutation {
    /// The event appended for this mutation.
    pub event: Block,
    /// The advanced head, in canonical order.
    pub head: Vec<Link>,
    /// The shard tree root after the mutation.
    pub root: Link,
    /// Blocks the mutation created and blocks it unlinked.
    pub diff: ShardDiff,
}

/// Materialize the shard tree for `head`.
///
/// Events are read through `events` (which may be an overlay pulling from a
/// remote); every shard block produced by the fold, and the canonical empty
/// root, are written to `blocks` so the returned root is fully resolvable
/// locally afterwards. Nothing is deleted here: replay may run concurrently
/// on read paths, and blocks the fold leaves behind are just unreachable.
pub async fn materialize(
    events: &dyn Fetcher,
    blocks: &dyn Blockstore,
    head: &[Link],
    cfg: &ShardConfig,
    cancel: &CancellationToken,
) -> Result<Link, CrdtError> {
    let empty = Shard::empty_root_block()?;
    let mut root = *empty.link();
    blocks.put(&empty).await?;

    if head.is_empty() {
        return Ok(root);
    }

    let order = topo_order(events, head, cancel).await?;
    tracing::debug!("materializing {} events", order.len());

    for (link, event) in order {
        if cancel.is_cancelled() {
            return Err(CrdtError::Cancelled);
        }
        tracing::trace!("folding event {}", link);
        let (next, diff) = match &event.op {
            Operation::Put { key, value } => {
                shard::put(blocks, &root, key, *value, cfg, cancel).await?
            }
            Operation::Del { key } => shard::del(blocks, &root, key, cancel).await?,
        };
        blocks.put_batch(&diff.additions).await?;
        root = next;
    }

    Ok(root)
}

/// Every event reachable from `head`, in deterministic fold order.
async fn topo_order(
    events: &dyn Fetcher,
    head: &[Link],
    cancel: &CancellationToken,
) -> Result<Vec<(Link, Event)>, CrdtError> {
    // collect the reachable DAG
    let mut loaded: HashMap<Link, Event> = HashMap::new();
    let mut queue: VecDeque<Link> = head.iter().copied().collect();
    while let Some(link) = queue.pop_front() {
        if cancel.is_cancelled() {
            return Err(CrdtError::Cancelled);
        }
        if loaded.contains_key(&link) {
            continue;
        }
        let event = clock::load_event(events, &link).await?;
        queue.extend(event.parents.iter().copied());
        loaded.insert(link, event);
    }

    // Kahn's algorithm; the ready set is ordered by binary link, which is
    // the convergence tie-break
    let mut children: HashMap<Link, Vec<Link>> = HashMap::new();
    let mut pending_parents: HashMap<Link, usize> = HashMap::new();
    for (link, event) in &loaded {
        let in_dag = event
            .parents
            .iter()
            .filter(|p| loaded.contains_key(p))
            .count();
        pending_parents.insert(*link, in_dag);
        for parent in &event.parents {
            children.entry(*parent).or_default().push(*link);
        }
    }

    let mut ready: BTreeSet<Link> = pending_parents
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(l, _)| *l)
        .collect();
    let mut order = Vec::with_capacity(loaded.len());
    while let Some(link) = ready.iter().next().copied() {
        ready.remove(&link);
        for child in children.remove(&link).unwrap_or_default() {
            let n = pending_parents
                .get_mut(&child)
                .expect("child is in the DAG");
            *n -= 1;
            if *n == 0 {
                ready.insert(child);
            }
        }
        let event = loaded.remove(&link).expect("event is loaded");
        order.push((link, event));
    }

    Ok(order)
}

/// Apply one operation: encode and persist the event, update the shard
/// tree from `base_root`, and advance the clock.
///
/// The event block is written to `blocks` before the head is computed; the
/// caller persists the shard diff and the new head slot in that order.
pub async fn mutate(
    blocks: &dyn Blockstore,
    head: &[Link],
    base_root: &Link,
    op: Operation,
    cfg: &ShardConfig,
    cancel: &CancellationToken,
) -> Result<Mutation, CrdtError> {
    let parents = clock::head::canonical(head.to_vec());
    let event = Event::new(op.clone(), parents.clone());
    let block = event.encode()?;
    blocks.put(&block).await?;

    let (root, diff) = match &op {
        Operation::Put { key, value } => {
            shard::put(blocks, base_root, key, *value, cfg, cancel).await?
        }
        Operation::Del { key } => shard::del(blocks, base_root, key, cancel).await?,
    };

    let head = clock::advance(blocks, &parents, *block.link(), cancel).await?;

    Ok(Mutation {
        event: block,
        head,
        root,
        diff,
    })
}
