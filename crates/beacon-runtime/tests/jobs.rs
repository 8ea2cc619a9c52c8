mod common;

use beacon_core::job::{props, JobLayout, JobResource, QueueConfiguration, QueueType, MAIN_QUEUE_NAME};
use beacon_core::store::{Change, Properties, ResourceStore};
use beacon_core::time::Clock;

use common::{converge, eventually, spawn_job_manager, Cluster};

async fn assigned_jobs(cluster: &Cluster, instance: &str, topic: &str) -> Vec<JobResource> {
    let mut jobs = Vec::new();
    for path in cluster
        .store
        .paths_under(&format!("/jobs/assigned/{}/{}", instance, topic))
    {
        if let Some(job) = cluster
            .store
            .get(&path)
            .await
            .unwrap()
            .and_then(JobResource::from_resource)
        {
            jobs.push(job);
        }
    }
    jobs
}

#[tokio::test]
async fn test_unassigned_job_moves_to_new_consumer() {
    let cluster = Cluster::new();
    let b = cluster.node("b", |config| config.jobs.topics = vec!["other".into()]);
    let b_jobs = spawn_job_manager(&b);
    converge(&[&b], 1).await;
    assert!(
        eventually(|| {
            let b = &b;
            async move { b.job_manager().current_capabilities().is_some() }
        })
        .await
    );

    let job = b.add_job("t", Properties::new()).await.unwrap().unwrap();
    assert!(job.path.starts_with("/jobs/unassigned/t/"));

    let a = cluster.node("a", |_| {});
    let a_jobs = spawn_job_manager(&a);
    converge(&[&a, &b], 2).await;

    assert!(
        eventually(|| {
            let cluster = &cluster;
            async move { assigned_jobs(cluster, "a", "t").await.len() == 1 }
        })
        .await
    );
    assert!(cluster.store.get(&job.path).await.unwrap().is_none());

    let moved = assigned_jobs(&cluster, "a", "t").await.remove(0);
    assert_eq!(moved.queue_name(), Some(MAIN_QUEUE_NAME));
    assert_eq!(moved.target_instance(), Some("a"));
    assert!(!moved.has_started());
    assert_eq!(moved.id(), job.id());

    // Nothing changed since: another pass must not touch the store.
    let mutations = cluster.store.mutation_count();
    a.job_manager().maintain().await.unwrap();
    a.job_manager().maintain().await.unwrap();
    assert_eq!(cluster.store.mutation_count(), mutations);

    a.job_manager().stop();
    b.job_manager().stop();
    a_jobs.await.unwrap();
    b_jobs.await.unwrap();
}

#[tokio::test]
async fn test_drop_policy_deletes_pending_job() {
    let cluster = Cluster::new();
    let layout = JobLayout::new("/jobs");
    let created = cluster.clock.now();
    let path = layout.job_path(Some("gone"), "trash/old", created, "j1");
    cluster
        .store
        .commit(vec![Change::Create {
            path: path.clone(),
            properties: JobResource::new_properties("j1", "trash/old", "gone", created, 10, Properties::new()),
        }])
        .await
        .unwrap();

    let a = cluster.node("a", |config| {
        config.jobs.queues = vec![QueueConfiguration::new("trash", QueueType::Drop).with_topics(["trash/*"])];
    });
    let a_jobs = spawn_job_manager(&a);
    converge(&[&a], 1).await;

    assert!(
        eventually(|| {
            let (store, path) = (&cluster.store, &path);
            async move { store.get(path).await.unwrap().is_none() }
        })
        .await
    );
    assert!(cluster.store.paths_under("/jobs").iter().all(|p| !p.ends_with("/j1")));
    assert!(a.add_job("trash/new", Properties::new()).await.unwrap().is_none());

    a.job_manager().stop();
    a_jobs.await.unwrap();
}

#[tokio::test]
async fn test_jobs_of_departed_instance_are_redistributed() {
    let cluster = Cluster::new();
    let a = cluster.node("a", |_| {});
    let c = cluster.node("c", |_| {});
    let a_jobs = spawn_job_manager(&a);
    converge(&[&a, &c], 2).await;

    let created = cluster.clock.now();
    let layout = JobLayout::new("/jobs");
    let mut properties = JobResource::new_properties("j1", "t", "c", created, 10, Properties::new());
    properties.insert(props::TARGET_INSTANCE.into(), "c".into());
    properties.insert(props::STARTED_TIME.into(), created.timestamp_millis().into());
    let path = layout.job_path(Some("c"), "t", created, "j1");
    cluster
        .store
        .commit(vec![Change::Create { path: path.clone(), properties }])
        .await
        .unwrap();

    // c goes away; a notices after the staleness threshold.
    for _ in 0..5 {
        cluster.advance(5);
        a.heartbeat().tick().await.unwrap();
    }

    assert!(
        eventually(|| {
            let cluster = &cluster;
            async move { assigned_jobs(cluster, "a", "t").await.len() == 1 }
        })
        .await
    );
    assert!(cluster.store.get(&path).await.unwrap().is_none());

    a.job_manager().stop();
    a_jobs.await.unwrap();
}
