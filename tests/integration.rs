//! Integration tests for the artifact runtime.
//!
//! These exercise the full path from coordinator to journal, outbox, broker,
//! and catalog projection, across one or more in-process nodes.

use std::sync::Arc;
use std::time::Duration;

use artifact_es::artifacts::{
    ArtifactCatalog, ArtifactCoordinates, ArtifactDetails, ArtifactService, DetailsCommand,
    DetailsRecord, DetailsReply, GlobalCommand, GlobalRegistry, GlobalReply, Group,
    StaticGitRemotes, StaticVersions, register_aggregates,
};
use artifact_es::{
    AggregateStore, CommandContext, CommandEnvelope, EntityKey, EventJournal, ExecuteError, FileJournal, InMemoryBroker,
    InMemoryTransport, MemoryJournal, Membership, OutboxConfig, OutboxPublisher, OutboxStore,
    Projector, RemoteFailure, RuntimeConfig, ShardCoordinator, StreamId, rebalance,
};
use serde_json::json;

const TIMEOUT: Duration = Duration::from_secs(5);

fn ctx() -> CommandContext {
    CommandContext::default().with_actor("test")
}

fn sponge() -> Group {
    Group::new("org.spongepowered", "SpongePowered", "https://spongepowered.org/")
}

fn coords(s: &str) -> ArtifactCoordinates {
    s.parse().expect("coordinates should parse")
}

fn store_on(journal: &Arc<MemoryJournal>) -> AggregateStore {
    register_aggregates(AggregateStore::builder())
        .journal(Arc::clone(journal))
        .config(RuntimeConfig {
            shard_count: 32,
            tag_count: 4,
            ..RuntimeConfig::default()
        })
        .build()
}

/// Coordinators `ids` sharing one journal, all starting from membership
/// `members`.
fn cluster(
    journal: &Arc<MemoryJournal>,
    ids: &[&str],
    members: &[&str],
) -> (InMemoryTransport, Vec<Arc<ShardCoordinator>>) {
    let transport = InMemoryTransport::new();
    let membership = Membership::new(members.iter().copied()).expect("membership");
    let nodes = ids
        .iter()
        .map(|id| {
            let node = Arc::new(
                ShardCoordinator::new(*id, store_on(journal), &membership, Arc::new(transport.clone()))
                    .expect("coordinator"),
            );
            transport.register(&node);
            node
        })
        .collect();
    (transport, nodes)
}

fn service(node: &Arc<ShardCoordinator>) -> ArtifactService {
    ArtifactService::new(
        Arc::clone(node),
        Arc::new(StaticGitRemotes::new()),
        Arc::new(StaticVersions::new()),
        TIMEOUT,
    )
}

async fn register_global(node: &ShardCoordinator, group: Group) -> GlobalReply {
    node.execute::<GlobalRegistry>(
        &GlobalRegistry::key(),
        GlobalCommand::RegisterGroup(group),
        ctx(),
        TIMEOUT,
    )
    .await
    .expect("register group should succeed")
}

#[tokio::test]
async fn register_group_twice_persists_one_event() {
    let journal = Arc::new(MemoryJournal::new());
    let (_, nodes) = cluster(&journal, &["node-1"], &["node-1"]);
    let stream = StreamId::of::<GlobalRegistry>(&GlobalRegistry::key());

    let first = register_global(&nodes[0], sponge()).await;
    assert_eq!(journal.last_sequence(&stream).expect("last_sequence"), 1);

    let second = register_global(&nodes[0], sponge()).await;
    assert_eq!(journal.last_sequence(&stream).expect("last_sequence"), 1);
    assert_eq!(first, second);

    let state = nodes[0]
        .store()
        .state::<GlobalRegistry>(&GlobalRegistry::key())
        .await
        .expect("state");
    assert_eq!(state.groups(), &[sponge()]);
}

#[tokio::test]
async fn re_register_artifact_keeps_first_coordinates() {
    let journal = Arc::new(MemoryJournal::new());
    let (_, nodes) = cluster(&journal, &["node-1"], &["node-1"]);
    let key = coords("org.spongepowered:example").entity_key();

    let reply = nodes[0]
        .execute::<ArtifactDetails>(
            &key,
            DetailsCommand::Register {
                coordinates: coords("org.spongepowered:example"),
                display_name: "Example".into(),
            },
            ctx(),
            TIMEOUT,
        )
        .await
        .expect("register should succeed");
    assert_eq!(reply, DetailsReply::Registered(coords("org.spongepowered:example")));

    nodes[0]
        .execute::<ArtifactDetails>(
            &key,
            DetailsCommand::Register {
                coordinates: coords("com.example:somethingelse"),
                display_name: "replaced".into(),
            },
            ctx(),
            TIMEOUT,
        )
        .await
        .expect("re-register should succeed");

    let stream = StreamId::of::<ArtifactDetails>(&key);
    assert_eq!(journal.last_sequence(&stream).expect("last_sequence"), 1);
    let state = nodes[0].store().state::<ArtifactDetails>(&key).await.expect("state");
    assert_eq!(
        state,
        ArtifactDetails::Populated(DetailsRecord {
            coordinates: coords("org.spongepowered:example"),
            display_name: "Example".into(),
            website: String::new(),
            issues: String::new(),
            git_repository: String::new(),
        })
    );
}

#[tokio::test]
async fn outbox_records_survive_broker_outage() {
    let journal = Arc::new(MemoryJournal::new());
    let (_, nodes) = cluster(&journal, &["node-1"], &["node-1"]);
    let service = service(&nodes[0]);

    service.register_group(sponge(), ctx()).await.expect("register group");
    service
        .register_artifact(coords("org.spongepowered:example"), "Example".into(), ctx())
        .await
        .expect("register artifact");
    // GroupRegistered, global GroupRegistered, ArtifactAdded, ArtifactRegistered.
    assert_eq!(journal.pending_count().expect("pending_count"), 4);

    let broker = InMemoryBroker::new();
    let publisher = OutboxPublisher::new(
        Arc::clone(&journal) as Arc<dyn OutboxStore>,
        Arc::new(broker.clone()),
        OutboxConfig::default(),
    );

    broker.set_available(false);
    let report = publisher.run_once().await.expect("poll");
    assert!(report.stalled);
    assert_eq!(journal.pending_count().expect("pending_count"), 4);

    broker.set_available(true);
    let report = publisher.run_once().await.expect("poll");
    assert_eq!(report.published, 4);
    assert_eq!(journal.pending_count().expect("pending_count"), 0);

    let topics: Vec<String> = broker.delivered().into_iter().map(|r| r.topic).collect();
    assert_eq!(
        topics,
        vec![
            "ArtifactsGroupUpserted",
            "GroupCreated",
            "ArtifactsGroupUpserted",
            "ArtifactsArtifactUpserted",
        ]
    );
}

#[tokio::test]
async fn catalog_follows_the_broker_and_ignores_redelivery() {
    let journal = Arc::new(MemoryJournal::new());
    let (_, nodes) = cluster(&journal, &["node-1"], &["node-1"]);
    let service = service(&nodes[0]);
    let example = coords("org.spongepowered:example");

    service.register_group(sponge(), ctx()).await.expect("register group");
    service
        .register_artifact(example.clone(), "Example".into(), ctx())
        .await
        .expect("register artifact");
    service
        .update_website(&example, "https://spongepowered.org/", ctx())
        .await
        .expect("update website");

    let broker = InMemoryBroker::new();
    let mut feed = broker.subscribe();
    OutboxPublisher::new(
        Arc::clone(&journal) as Arc<dyn OutboxStore>,
        Arc::new(broker.clone()),
        OutboxConfig::default(),
    )
    .run_once()
    .await
    .expect("poll");

    let projector = Projector::<ArtifactCatalog>::new(nodes[0].store(), None);
    let mut records = Vec::new();
    while let Ok(record) = feed.try_recv() {
        records.push(record);
    }
    assert_eq!(records.len(), 5);
    for record in &records {
        projector.deliver_record(record).await.expect("deliver");
    }
    // Redeliver everything.
    for record in &records {
        assert!(!projector.deliver_record(record).await.expect("redeliver"));
    }

    let catalog = ArtifactCatalog::merge(projector.partitions().await);
    let row = catalog.artifact(&example).expect("artifact row");
    assert_eq!(row.display_name, "Example");
    assert_eq!(row.website, "https://spongepowered.org/");
    let group = catalog.group("org.spongepowered").expect("group row");
    assert_eq!(group.artifacts, vec!["example".to_string()]);
}

#[tokio::test]
async fn disconnected_owner_is_unavailable() {
    let journal = Arc::new(MemoryJournal::new());
    let (transport, nodes) = cluster(&journal, &["node-1", "node-2"], &["node-1", "node-2"]);

    let table = nodes[0].table().await;
    let key = (0..)
        .map(|i| coords(&format!("org.example:a{i}")).entity_key())
        .find(|k| table.route(&StreamId::of::<ArtifactDetails>(k), "node-2").local)
        .expect("some key lands on node-2");

    transport.disconnect("node-2");
    let result = nodes[0]
        .execute::<ArtifactDetails>(
            &key,
            DetailsCommand::Register {
                coordinates: key.as_str().parse().expect("coordinates"),
                display_name: "A".into(),
            },
            ctx(),
            TIMEOUT,
        )
        .await;
    assert!(matches!(result, Err(ExecuteError::Unavailable(_))), "got {result:?}");
    assert_eq!(
        journal
            .last_sequence(&StreamId::of::<ArtifactDetails>(&key))
            .expect("last_sequence"),
        0
    );
}

#[tokio::test]
async fn state_survives_shard_handoff() {
    let journal = Arc::new(MemoryJournal::new());
    let (_, nodes) = cluster(&journal, &["node-1", "node-2"], &["node-1"]);

    // Groups spread over many shards; some will move to node-2.
    let groups: Vec<Group> = (0..20)
        .map(|i| Group::new(format!("org.example{i}"), format!("Example {i}"), "https://example.com/"))
        .collect();
    let svc = service(&nodes[0]);
    for group in &groups {
        svc.register_group(group.clone(), ctx()).await.expect("register group");
    }

    let joined = Membership::new(["node-1", "node-2"]).expect("membership");
    let plans = rebalance(&nodes, &joined).await.expect("rebalance");
    assert!(plans[0].released > 0);
    assert!(plans[0].passivated > 0);

    // Every group is still registered exactly once, wherever it now lives.
    for node in &nodes {
        let svc = service(node);
        for group in &groups {
            let outcome = svc.register_group(group.clone(), ctx()).await.expect("re-register");
            assert_eq!(
                outcome,
                artifact_es::artifacts::GroupRegistration::AlreadyRegistered(group.clone())
            );
        }
    }
    let groups_now = svc.groups(ctx()).await.expect("groups");
    assert_eq!(groups_now, groups);
}

#[tokio::test]
async fn file_journal_restart_restores_state_and_outbox() {
    let tmp = tempfile::tempdir().expect("failed to create tmpdir");
    let key = coords("org.spongepowered:example").entity_key();

    {
        let journal = Arc::new(FileJournal::open(tmp.path()).expect("open journal"));
        let store = register_aggregates(AggregateStore::builder())
            .journal(journal)
            .build();
        store
            .execute::<ArtifactDetails>(
                &key,
                DetailsCommand::Register {
                    coordinates: coords("org.spongepowered:example"),
                    display_name: "Example".into(),
                },
                ctx(),
            )
            .await
            .expect("register");
        store.shutdown().await;
    }

    let journal = Arc::new(FileJournal::open(tmp.path()).expect("reopen journal"));
    assert_eq!(journal.pending_count().expect("pending_count"), 1);
    let store = AggregateStore::builder().journal(Arc::clone(&journal)).build();
    let state = store.state::<ArtifactDetails>(&key).await.expect("state");
    assert_eq!(
        state.record().map(|r| r.display_name.as_str()),
        Some("Example")
    );
}

#[tokio::test]
async fn forwarded_commands_cannot_smuggle_unchecked_values() {
    let journal = Arc::new(MemoryJournal::new());
    let store = store_on(&journal);
    let key = EntityKey::new("bad id:x");

    let bad_coordinates = CommandEnvelope {
        aggregate_type: "details".into(),
        entity_key: key.clone(),
        command: json!({
            "Register": {
                "coordinates": {"group_id": "bad id", "artifact_id": "x"},
                "display_name": "Bad",
            }
        }),
        context: ctx(),
    };
    let err = store
        .dispatch(bad_coordinates)
        .await
        .expect_err("unchecked coordinates should not decode");
    assert!(matches!(err, RemoteFailure::Malformed(_)), "got {err:?}");

    let bad_url = CommandEnvelope {
        aggregate_type: "details".into(),
        entity_key: coords("org.spongepowered:example").entity_key(),
        command: json!({"UpdateWebsite": "https://user@/"}),
        context: ctx(),
    };
    let err = store
        .dispatch(bad_url)
        .await
        .expect_err("unchecked URL should not decode");
    assert!(matches!(err, RemoteFailure::Malformed(_)), "got {err:?}");

    assert_eq!(
        journal
            .last_sequence(&StreamId::of::<ArtifactDetails>(&key))
            .expect("last_sequence"),
        0
    );
    assert_eq!(journal.pending_count().expect("pending_count"), 0);
}
