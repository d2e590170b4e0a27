//! Orchestrates one scrape across all instances of a region.
//!
//! Collection runs in two stages. First every instance refreshes its metric
//! catalog in parallel under a semaphore. Then all (instance, batch) pairs
//! are pushed through a bounded queue drained by a fixed pool of workers,
//! so one instance with many batches cannot serialize behind the others.
//! Per-instance and per-batch failures are recorded and never stop their
//! siblings; the first recorded error is the representative result.

use anyhow::{Context, Result, anyhow};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, instrument, warn};
use tracing_futures::Instrument as _;

use crate::formatting::Sample;
use crate::manager::{InstanceProvider, MetricProvider};
use crate::models::Instance;

/// Queue capacity per worker; bounded on purpose so a huge catalog cannot
/// balloon memory between producer and workers.
const QUEUE_DEPTH_PER_WORKER: usize = 10;

struct CatalogOutcome {
    instance: Arc<Instance>,
    batches: Result<Vec<Vec<String>>>,
}

#[derive(Clone)]
struct WorkItem {
    instance: Arc<Instance>,
    batch: Vec<String>,
}

type ErrorList = Arc<Mutex<Vec<anyhow::Error>>>;

pub struct RegionScheduler {
    region: String,
    instances: Arc<dyn InstanceProvider>,
    metrics: Arc<dyn MetricProvider>,
    max_concurrency: usize,
}

impl RegionScheduler {
    pub fn new(
        region: String,
        instances: Arc<dyn InstanceProvider>,
        metrics: Arc<dyn MetricProvider>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            region,
            instances,
            metrics,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Collect metrics from every eligible instance in the region.
    ///
    /// # Errors
    ///
    /// Returns the discovery error, or the first recorded catalog or batch
    /// error. Samples emitted before a failure stay emitted.
    #[instrument(skip(self, cancel, sink), fields(region = %self.region))]
    pub async fn collect_metrics(
        &self,
        cancel: &CancellationToken,
        sink: &mpsc::Sender<Sample>,
    ) -> Result<()> {
        self.run(cancel, None, sink).await
    }

    /// Same as [`collect_metrics`](Self::collect_metrics), restricted to
    /// the given instance identifiers.
    #[instrument(skip(self, cancel, sink), fields(region = %self.region))]
    pub async fn collect_metrics_for_instances(
        &self,
        cancel: &CancellationToken,
        identifiers: &[String],
        sink: &mpsc::Sender<Sample>,
    ) -> Result<()> {
        let retain: HashSet<String> = identifiers.iter().cloned().collect();
        self.run(cancel, Some(retain), sink).await
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        retain: Option<HashSet<String>>,
        sink: &mpsc::Sender<Sample>,
    ) -> Result<()> {
        let mut instances = self.instances.get_instances(cancel).await?;
        if let Some(retain) = retain {
            instances.retain(|instance| retain.contains(&instance.identifier));
        }
        info!(instances = instances.len(), "starting collection");

        let outcomes = self.fetch_catalogs(cancel, instances).await;

        let errors: ErrorList = Arc::new(Mutex::new(Vec::new()));
        self.drain_work_queue(cancel, outcomes, sink, &errors).await?;

        let mut errors = errors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if errors.is_empty() {
            Ok(())
        } else {
            if errors.len() > 1 {
                warn!(
                    suppressed = errors.len() - 1,
                    "multiple collection errors, returning the first"
                );
            }
            Err(errors.remove(0))
        }
    }

    /// Stage one: refresh every instance's catalog concurrently, bounded
    /// by the semaphore. Failures are carried in the outcome so healthy
    /// instances keep going.
    async fn fetch_catalogs(
        &self,
        cancel: &CancellationToken,
        instances: Vec<Arc<Instance>>,
    ) -> Vec<CatalogOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = FuturesUnordered::new();

        for instance in instances {
            let semaphore = Arc::clone(&semaphore);
            let metrics = Arc::clone(&self.metrics);
            let cancel = cancel.clone();
            let span = debug_span!("catalog.refresh", identifier = %instance.identifier);

            tasks.push(
                async move {
                    let batches = tokio::select! {
                        () = cancel.cancelled() => Err(anyhow!("catalog refresh cancelled")),
                        permit = semaphore.acquire_owned() => {
                            let _permit = permit.expect("semaphore is never closed");
                            metrics.metric_batches(&cancel, &instance).await
                        }
                    };

                    CatalogOutcome { instance, batches }
                }
                .instrument(span),
            );
        }

        // Drain completions as they finish (unordered).
        let mut outcomes = Vec::new();
        while let Some(outcome) = tasks.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Stage two: one producer feeds every (instance, batch) pair into a
    /// bounded queue; `max_concurrency` workers drain it.
    async fn drain_work_queue(
        &self,
        cancel: &CancellationToken,
        outcomes: Vec<CatalogOutcome>,
        sink: &mpsc::Sender<Sample>,
        errors: &ErrorList,
    ) -> Result<()> {
        let (work_tx, work_rx) =
            async_channel::bounded::<WorkItem>(self.max_concurrency * QUEUE_DEPTH_PER_WORKER);

        let mut workers = JoinSet::new();
        for worker in 0..self.max_concurrency {
            let work_rx = work_rx.clone();
            let metrics = Arc::clone(&self.metrics);
            let sink = sink.clone();
            let cancel = cancel.clone();
            let errors = Arc::clone(errors);

            workers.spawn(async move {
                loop {
                    let item = tokio::select! {
                        () = cancel.cancelled() => break,
                        item = work_rx.recv() => match item {
                            Ok(item) => item,
                            // Queue closed and empty: producer is done.
                            Err(_) => break,
                        },
                    };

                    debug!(
                        worker,
                        identifier = %item.instance.identifier,
                        batch_len = item.batch.len(),
                        "collecting batch"
                    );
                    if let Err(err) = metrics
                        .collect_batch(&cancel, &item.instance, &item.batch, &sink)
                        .await
                    {
                        record_error(&errors, err);
                    }
                }
            });
        }
        drop(work_rx);

        let producer = {
            let cancel = cancel.clone();
            let errors = Arc::clone(errors);

            tokio::spawn(async move {
                for outcome in outcomes {
                    match outcome.batches {
                        Ok(batches) => {
                            for batch in batches {
                                let item = WorkItem {
                                    instance: Arc::clone(&outcome.instance),
                                    batch,
                                };
                                tokio::select! {
                                    () = cancel.cancelled() => return,
                                    sent = work_tx.send(item) => {
                                        if sent.is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                        Err(err) => record_error(&errors, err),
                    }
                }
                // work_tx drops here, closing the queue after the last push.
            })
        };

        producer.await.context("producer task panicked")?;
        while let Some(joined) = workers.join_next().await {
            joined.context("worker task panicked")?;
        }

        Ok(())
    }
}

fn record_error(errors: &ErrorList, err: anyhow::Error) {
    warn!("collection error: {err:#}");
    errors
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .push(err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Engine;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn instance(identifier: &str) -> Arc<Instance> {
        Arc::new(Instance::new(
            format!("db-{identifier}"),
            identifier,
            Engine::Postgres,
            Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap(),
            HashMap::new(),
            Duration::from_secs(3600),
        ))
    }

    struct FakeInstances {
        instances: Vec<Arc<Instance>>,
        fail: bool,
    }

    #[async_trait]
    impl InstanceProvider for FakeInstances {
        async fn get_instances(&self, _cancel: &CancellationToken) -> Result<Vec<Arc<Instance>>> {
            if self.fail {
                anyhow::bail!("discovery failed");
            }
            Ok(self.instances.clone())
        }
    }

    /// Per-resource behavior: batches to hand out (or a catalog error),
    /// and whether batch collection fails.
    #[derive(Default)]
    struct FakeMetrics {
        catalogs: HashMap<String, Result<Vec<Vec<String>>, String>>,
        failing_batches: HashMap<String, String>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeMetrics {
        fn with_catalog(mut self, resource_id: &str, names: &[&str]) -> Self {
            let batches = crate::utils::names::batch_metric_names(
                &names.iter().map(|n| (*n).to_string()).collect::<Vec<_>>(),
                crate::utils::names::BATCH_SIZE,
            );
            self.catalogs.insert(resource_id.to_string(), Ok(batches));
            self
        }

        fn with_catalog_error(mut self, resource_id: &str, message: &str) -> Self {
            self.catalogs
                .insert(resource_id.to_string(), Err(message.to_string()));
            self
        }

        fn with_batch_error(mut self, resource_id: &str, message: &str) -> Self {
            self.failing_batches
                .insert(resource_id.to_string(), message.to_string());
            self
        }
    }

    #[async_trait]
    impl MetricProvider for FakeMetrics {
        async fn metric_batches(
            &self,
            _cancel: &CancellationToken,
            instance: &Arc<Instance>,
        ) -> Result<Vec<Vec<String>>> {
            match self.catalogs.get(&instance.resource_id) {
                Some(Ok(batches)) => Ok(batches.clone()),
                Some(Err(message)) => Err(anyhow!("{message}")),
                None => Ok(Vec::new()),
            }
        }

        async fn collect_batch(
            &self,
            _cancel: &CancellationToken,
            instance: &Arc<Instance>,
            batch: &[String],
            sink: &mpsc::Sender<Sample>,
        ) -> Result<()> {
            let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(concurrent, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(message) = self.failing_batches.get(&instance.resource_id) {
                anyhow::bail!("{message}");
            }

            for name in batch {
                let sample = Sample {
                    name: name.clone(),
                    help: String::new(),
                    identifier: instance.identifier.clone(),
                    engine: instance.engine.to_string(),
                    unit: "Count".to_string(),
                    value: 1.0,
                    timestamp_ms: 0,
                };
                if sink.send(sample).await.is_err() {
                    break;
                }
            }
            Ok(())
        }
    }

    fn scheduler(
        instances: Vec<Arc<Instance>>,
        metrics: FakeMetrics,
        max_concurrency: usize,
    ) -> RegionScheduler {
        RegionScheduler::new(
            "us-west-2".to_string(),
            Arc::new(FakeInstances {
                instances,
                fail: false,
            }),
            Arc::new(metrics),
            max_concurrency,
        )
    }

    async fn collect_all(
        scheduler: &RegionScheduler,
        identifiers: Option<&[String]>,
    ) -> (Vec<Sample>, Result<()>) {
        let (sink, mut collected) = mpsc::channel(1024);
        let cancel = CancellationToken::new();

        let result = match identifiers {
            Some(identifiers) => {
                scheduler
                    .collect_metrics_for_instances(&cancel, identifiers, &sink)
                    .await
            }
            None => scheduler.collect_metrics(&cancel, &sink).await,
        };
        drop(sink);

        let mut samples = Vec::new();
        while let Some(sample) = collected.recv().await {
            samples.push(sample);
        }
        (samples, result)
    }

    fn names(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("db.metric{i:02}.avg")).collect()
    }

    #[tokio::test]
    async fn test_collects_from_all_instances() {
        let a_names: Vec<&str> = ["db.a0.avg", "db.a1.avg"].to_vec();
        let metrics = FakeMetrics::default()
            .with_catalog("db-a", &a_names)
            .with_catalog("db-b", &["db.b0.avg"]);
        let scheduler = scheduler(vec![instance("a"), instance("b")], metrics, 4);

        let (samples, result) = collect_all(&scheduler, None).await;

        assert!(result.is_ok());
        assert_eq!(samples.len(), 3);
        let from_b = samples.iter().filter(|s| s.identifier == "b").count();
        assert_eq!(from_b, 1);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_healthy_instances() {
        // A's catalog fails; B has 33 metrics in 3 batches. The scrape
        // still emits all of B and reports A's error.
        let b_names = names(33);
        let b_refs: Vec<&str> = b_names.iter().map(String::as_str).collect();
        let metrics = FakeMetrics::default()
            .with_catalog_error("db-a", "throttled listing metrics")
            .with_catalog("db-b", &b_refs);
        let scheduler = scheduler(vec![instance("a"), instance("b")], metrics, 4);

        let (samples, result) = collect_all(&scheduler, None).await;

        assert_eq!(samples.len(), 33);
        assert!(samples.iter().all(|s| s.identifier == "b"));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("throttled"));
    }

    #[tokio::test]
    async fn test_batch_error_is_recorded_and_siblings_proceed() {
        let metrics = FakeMetrics::default()
            .with_catalog("db-a", &["db.a0.avg"])
            .with_catalog("db-b", &["db.b0.avg"])
            .with_batch_error("db-a", "batch fetch failed");
        let scheduler = scheduler(vec![instance("a"), instance("b")], metrics, 4);

        let (samples, result) = collect_all(&scheduler, None).await;

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].identifier, "b");
        assert!(result.unwrap_err().to_string().contains("batch fetch"));
    }

    #[tokio::test]
    async fn test_discovery_error_aborts_the_scrape() {
        let scheduler = RegionScheduler::new(
            "us-west-2".to_string(),
            Arc::new(FakeInstances {
                instances: Vec::new(),
                fail: true,
            }),
            Arc::new(FakeMetrics::default()),
            4,
        );

        let (samples, result) = collect_all(&scheduler, None).await;

        assert!(samples.is_empty());
        assert!(result.unwrap_err().to_string().contains("discovery"));
    }

    #[tokio::test]
    async fn test_filtered_variant_restricts_to_identifiers() {
        let metrics = FakeMetrics::default()
            .with_catalog("db-a", &["db.a0.avg"])
            .with_catalog("db-b", &["db.b0.avg"])
            .with_catalog("db-c", &["db.c0.avg"]);
        let scheduler = scheduler(
            vec![instance("a"), instance("b"), instance("c")],
            metrics,
            4,
        );

        let identifiers = vec!["a".to_string(), "c".to_string(), "ghost".to_string()];
        let (samples, result) = collect_all(&scheduler, Some(&identifiers)).await;

        assert!(result.is_ok());
        let mut seen: Vec<&str> = samples.iter().map(|s| s.identifier.as_str()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_worker_concurrency_is_bounded() {
        let many = names(60);
        let refs: Vec<&str> = many.iter().map(String::as_str).collect();
        let metrics = Arc::new(FakeMetrics::default().with_catalog("db-a", &refs));
        let scheduler = RegionScheduler::new(
            "us-west-2".to_string(),
            Arc::new(FakeInstances {
                instances: vec![instance("a")],
                fail: false,
            }),
            Arc::clone(&metrics) as Arc<dyn MetricProvider>,
            2,
        );

        let (samples, result) = collect_all(&scheduler, None).await;

        assert!(result.is_ok());
        assert_eq!(samples.len(), 60);
        assert!(metrics.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_single_instance_batches_run_on_multiple_workers() {
        // 60 metrics in 4 batches on one instance; with 4 workers the
        // batches overlap instead of running serially.
        let many = names(60);
        let refs: Vec<&str> = many.iter().map(String::as_str).collect();
        let metrics = Arc::new(FakeMetrics::default().with_catalog("db-a", &refs));
        let scheduler = RegionScheduler::new(
            "us-west-2".to_string(),
            Arc::new(FakeInstances {
                instances: vec![instance("a")],
                fail: false,
            }),
            Arc::clone(&metrics) as Arc<dyn MetricProvider>,
            4,
        );

        let (samples, result) = collect_all(&scheduler, None).await;

        assert!(result.is_ok());
        assert_eq!(samples.len(), 60);
        assert!(metrics.max_in_flight.load(Ordering::SeqCst) > 1);
        assert!(metrics.max_in_flight.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_cancellation_stops_collection_early() {
        let many = names(600);
        let refs: Vec<&str> = many.iter().map(String::as_str).collect();
        let metrics = FakeMetrics::default().with_catalog("db-a", &refs);
        let scheduler = scheduler(vec![instance("a")], metrics, 1);

        let (sink, mut collected) = mpsc::channel(2048);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = scheduler.collect_metrics(&cancel, &sink).await;
        drop(sink);

        let mut samples = Vec::new();
        while let Some(sample) = collected.recv().await {
            samples.push(sample);
        }

        // Catalog fan-out observed the cancellation, so the one instance
        // carries a cancellation error and no samples were produced.
        assert!(result.is_err());
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn test_empty_instance_list_is_a_clean_scrape() {
        let scheduler = scheduler(Vec::new(), FakeMetrics::default(), 4);

        let (samples, result) = collect_all(&scheduler, None).await;

        assert!(result.is_ok());
        assert!(samples.is_empty());
    }
}
