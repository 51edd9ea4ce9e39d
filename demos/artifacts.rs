//! Self-contained demo of a two-node, in-process artifact cluster: commands
//! routed by shard, the transactional outbox, and the catalog projection.
//!
//! Run with: `cargo run --example artifacts`

use std::sync::Arc;
use std::time::Duration;

use artifact_es::artifacts::{
    ArtifactCatalog, ArtifactCoordinates, ArtifactDetails, ArtifactService, Group, StaticGitRemotes,
    StaticVersions, register_aggregates,
};
use artifact_es::{
    AggregateStore, CommandContext, FileJournal, InMemoryBroker, InMemoryTransport, Membership,
    OutboxConfig, OutboxPublisher, OutboxStore, Projector, ShardCoordinator,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempfile::tempdir()?;
    let journal = Arc::new(FileJournal::open(tmp.path().join("journal"))?);

    // Two nodes sharing one journal, wired through an in-memory transport.
    let membership = Membership::new(["node-1", "node-2"])?;
    let transport = InMemoryTransport::new();
    let mut nodes = Vec::new();
    for id in ["node-1", "node-2"] {
        let store = register_aggregates(AggregateStore::builder())
            .journal(Arc::clone(&journal))
            .build();
        let node = Arc::new(ShardCoordinator::new(
            id,
            store,
            &membership,
            Arc::new(transport.clone()),
        )?);
        transport.register(&node);
        nodes.push(node);
    }

    let git = StaticGitRemotes::new();
    git.insert(
        "https://github.com/SpongePowered/SpongeVanilla.git",
        vec!["refs/heads/main".into()],
    );
    let versions = StaticVersions::new();
    let service = ArtifactService::new(
        Arc::clone(&nodes[0]),
        Arc::new(git),
        Arc::new(versions.clone()),
        Duration::from_secs(5),
    );
    let ctx = CommandContext::default().with_actor("demo");

    let sponge = Group::new(
        "org.spongepowered",
        "SpongePowered",
        "https://spongepowered.org/",
    );
    service.register_group(sponge.clone(), ctx.clone()).await?;

    for (artifact_id, name) in [("spongevanilla", "SpongeVanilla"), ("spongeforge", "SpongeForge")] {
        let coordinates = ArtifactCoordinates::new("org.spongepowered", artifact_id)?;
        let route = nodes[0]
            .route_for::<ArtifactDetails>(&coordinates.entity_key())
            .await;
        println!("{coordinates} -> shard {} on {}", route.shard, route.owner);
        service
            .register_artifact(coordinates, name.into(), ctx.clone())
            .await?;
    }

    let vanilla: ArtifactCoordinates = "org.spongepowered:spongevanilla".parse()?;
    service
        .update_website(&vanilla, "https://spongepowered.org/downloads", ctx.clone())
        .await?;
    let details = service
        .update_git_repository(
            &vanilla,
            "https://github.com/SpongePowered/SpongeVanilla.git",
            ctx.clone(),
        )
        .await?;
    println!("details: {details:?}");

    versions.insert(vanilla.clone(), vec!["1.16.5-8.0.0".into(), "1.20.6-11.0.0".into()]);
    println!("versions: {:?}", service.versions(&vanilla, ctx.clone()).await?);

    // Drain the outbox to the broker.
    let broker = InMemoryBroker::new();
    let publisher = OutboxPublisher::new(
        Arc::clone(&journal) as Arc<dyn OutboxStore>,
        Arc::new(broker.clone()),
        OutboxConfig::default(),
    );
    let report = publisher.run_once().await?;
    println!("published {} outbox records", report.published);
    for record in broker.delivered() {
        println!("  {} [{}]", record.topic, record.partition_key);
    }

    // Fold the journal into the catalog read model.
    let checkpoints = tmp.path().join("projections");
    let projector = Projector::<ArtifactCatalog>::new(nodes[1].store(), Some(checkpoints.as_path()));
    projector.catch_up().await?;
    let catalog = ArtifactCatalog::merge(projector.partitions().await);
    for row in catalog.artifacts() {
        println!(
            "artifact {}:{} \"{}\" website={} git={}",
            row.group_id, row.artifact_id, row.display_name, row.website, row.git_repository
        );
    }

    let group = catalog
        .group("org.spongepowered")
        .ok_or("group missing from catalog")?;
    assert_eq!(group.artifacts, vec!["spongevanilla", "spongeforge"]);
    assert_eq!(service.groups(ctx).await?, vec![sponge]);
    assert_eq!(journal.pending_count()?, 0);

    for node in &nodes {
        node.store().shutdown().await;
    }
    println!("all assertions passed");
    Ok(())
}
