//! Replication over the real peer channel: push, pull, and convergence.

use tokio_util::sync::CancellationToken;

use fam_common::clock::head;
use fam_common::linked_data::Link;
use fam_common::remote::Remote;
use fam_common::testkit;

fn value(tag: &str) -> Link {
    Link::of_raw(tag.as_bytes())
}

/// Two stores holding grants on the same bucket, serving their protocols,
/// each with a named remote pointing at the other.
async fn paired() -> (
    std::sync::Arc<fam_common::store::UserStore>,
    std::sync::Arc<fam_common::store::UserStore>,
    fam_common::capability::Did,
) {
    let alice = testkit::memory_store().await.unwrap();
    let bob = testkit::memory_store().await.unwrap();
    let cancel = CancellationToken::new();

    let (id, grants) = testkit::issue_grants(&[alice.agent(), bob.agent()]).unwrap();
    let mut grants = grants.into_iter();
    alice
        .add_bucket(grants.next().unwrap(), &cancel)
        .await
        .unwrap();
    bob.add_bucket(grants.next().unwrap(), &cancel)
        .await
        .unwrap();

    alice.listen();
    bob.listen();
    testkit::introduce(&alice, &bob).unwrap();

    let bucket_a = alice.bucket(&id, &cancel).await.unwrap();
    bucket_a
        .remotes()
        .put(
            "bob",
            &Remote::new(bob.agent().public(), testkit::direct_addrs(&bob)),
            &cancel,
        )
        .await
        .unwrap();
    let bucket_b = bob.bucket(&id, &cancel).await.unwrap();
    bucket_b
        .remotes()
        .put(
            "alice",
            &Remote::new(alice.agent().public(), testkit::direct_addrs(&alice)),
            &cancel,
        )
        .await
        .unwrap();

    (alice, bob, id)
}

#[tokio::test]
async fn test_push_replicates_state() {
    let (alice, bob, id) = paired().await;
    let cancel = CancellationToken::new();

    let bucket_a = alice.bucket(&id, &cancel).await.unwrap();
    bucket_a.put("greeting", value("hello"), &cancel).await.unwrap();
    bucket_a.put("subject", value("world"), &cancel).await.unwrap();

    let remote = bucket_a.remote("bob", &cancel).await.unwrap();
    remote.push(&cancel).await.unwrap();

    let bucket_b = bob.bucket(&id, &cancel).await.unwrap();
    assert_eq!(bucket_b.head().await, bucket_a.head().await);
    assert_eq!(
        bucket_b.get("greeting", &cancel).await.unwrap(),
        value("hello")
    );
    assert_eq!(
        bucket_b.get("subject", &cancel).await.unwrap(),
        value("world")
    );
    assert_eq!(
        bucket_b.root(&cancel).await.unwrap(),
        bucket_a.root(&cancel).await.unwrap()
    );

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_pull_replicates_state_and_is_idempotent() {
    let (alice, bob, id) = paired().await;
    let cancel = CancellationToken::new();

    let bucket_b = bob.bucket(&id, &cancel).await.unwrap();
    bucket_b.put("k", value("from-bob"), &cancel).await.unwrap();

    let bucket_a = alice.bucket(&id, &cancel).await.unwrap();
    let remote = bucket_a.remote("bob", &cancel).await.unwrap();
    remote.pull(&cancel).await.unwrap();

    assert_eq!(bucket_a.head().await, bucket_b.head().await);
    assert_eq!(bucket_a.get("k", &cancel).await.unwrap(), value("from-bob"));

    // a repeated pull is a no-op
    let head = bucket_a.head().await;
    remote.pull(&cancel).await.unwrap();
    assert_eq!(bucket_a.head().await, head);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_concurrent_writes_converge_after_cross_sync() {
    let (alice, bob, id) = paired().await;
    let cancel = CancellationToken::new();

    // both replicas start from the same single-put state
    let bucket_a = alice.bucket(&id, &cancel).await.unwrap();
    bucket_a.put("a", value("v1"), &cancel).await.unwrap();
    let remote_ab = bucket_a.remote("bob", &cancel).await.unwrap();
    remote_ab.push(&cancel).await.unwrap();

    let bucket_b = bob.bucket(&id, &cancel).await.unwrap();
    assert_eq!(bucket_b.head().await, bucket_a.head().await);

    // concurrent conflicting writes to the same key
    bucket_a.put("a", value("from-alice"), &cancel).await.unwrap();
    bucket_b.put("a", value("from-bob"), &cancel).await.unwrap();
    let event_a = bucket_a.head().await[0];
    let event_b = bucket_b.head().await[0];

    // exchange both ways
    remote_ab.push(&cancel).await.unwrap();
    remote_ab.pull(&cancel).await.unwrap();

    let expected_head = head::canonical(vec![event_a, event_b]);
    assert_eq!(bucket_a.head().await, expected_head);
    assert_eq!(bucket_b.head().await, expected_head);
    assert_eq!(
        bucket_a.root(&cancel).await.unwrap(),
        bucket_b.root(&cancel).await.unwrap()
    );

    // the event sorting later in binary link order wins the race
    let winner = if event_a > event_b {
        value("from-alice")
    } else {
        value("from-bob")
    };
    assert_eq!(bucket_a.get("a", &cancel).await.unwrap(), winner);
    assert_eq!(bucket_b.get("a", &cancel).await.unwrap(), winner);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_push_without_grant_is_rejected() {
    let alice = testkit::memory_store().await.unwrap();
    let bob = testkit::memory_store().await.unwrap();
    let cancel = CancellationToken::new();

    // only alice holds a grant; bob has never imported the bucket
    let (id, grants) = testkit::issue_grants(&[alice.agent()]).unwrap();
    alice
        .add_bucket(grants.into_iter().next().unwrap(), &cancel)
        .await
        .unwrap();

    alice.listen();
    bob.listen();
    testkit::introduce(&alice, &bob).unwrap();

    let bucket_a = alice.bucket(&id, &cancel).await.unwrap();
    bucket_a.put("a", value("v"), &cancel).await.unwrap();
    bucket_a
        .remotes()
        .put(
            "bob",
            &Remote::new(bob.agent().public(), testkit::direct_addrs(&bob)),
            &cancel,
        )
        .await
        .unwrap();

    let remote = bucket_a.remote("bob", &cancel).await.unwrap();
    // bob's store has no grant for the bucket, so the receipt is a failure
    assert!(matches!(
        remote.push(&cancel).await,
        Err(fam_common::remote::RemoteError::Invocation(_))
    ));

    alice.close().await;
    bob.close().await;
}
