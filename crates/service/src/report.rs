//! Order reports, computed inline for small result sets and as background
//! jobs for large ones.

use std::sync::Arc;
use std::time::Duration;

use model::{Clock, ReportFilters, ReportJob, ReportJobStatus, ReportMetrics};
use repository::{OrderListFilter, OrdersRepository, ReportJobsRepository};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::ServiceError;

/// Pause before the one retry of a job's final write.
const RECORD_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Either the finished metrics or the ticket of a job computing them.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    Ready(ReportMetrics),
    Queued(ReportJob),
}

#[derive(Clone)]
pub struct ReportService {
    orders: Arc<dyn OrdersRepository>,
    jobs: Arc<dyn ReportJobsRepository>,
    clock: Arc<dyn Clock>,
    async_threshold: u64,
}

impl ReportService {
    /// Reports over more than `async_threshold` orders run as jobs.
    pub fn new(
        orders: Arc<dyn OrdersRepository>,
        jobs: Arc<dyn ReportJobsRepository>,
        clock: Arc<dyn Clock>,
        async_threshold: u64,
    ) -> Self {
        Self {
            orders,
            jobs,
            clock,
            async_threshold,
        }
    }

    async fn compute(&self, filters: &ReportFilters) -> Result<ReportMetrics, ServiceError> {
        let figures = self.orders.figures(&OrderListFilter::from(filters)).await?;
        Ok(ReportMetrics::aggregate(&figures, self.clock.now()))
    }

    #[instrument(skip(self))]
    pub async fn generate_report(&self, user_id: Uuid, filters: ReportFilters) -> Result<ReportOutcome, ServiceError> {
        let estimated = self.orders.count(&OrderListFilter::from(&filters)).await?;
        if estimated <= self.async_threshold {
            return Ok(ReportOutcome::Ready(self.compute(&filters).await?));
        }

        let job = ReportJob::new(user_id, filters, self.clock.now());
        self.jobs.insert(&job).await?;
        info!(job_id = %job.id, estimated, "Report queued as background job");

        let worker = self.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            if let Err(e) = worker.run_job(job_id).await {
                error!(%job_id, error = %e, "Report job could not be recorded");
            }
        });
        Ok(ReportOutcome::Queued(job))
    }

    /// Runs a pending job to completion or failure.
    #[instrument(skip(self))]
    pub async fn run_job(&self, job_id: Uuid) -> Result<ReportJob, ServiceError> {
        let mut job = self.get_job(job_id).await?;
        job.start(self.clock.now()).map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.jobs.update(&job).await?;

        let outcome = self.compute(&job.filters).await;
        let now = self.clock.now();
        let transition = match outcome {
            Ok(metrics) => job.complete(metrics, now),
            Err(e) => {
                error!(%job_id, error = %e, "Report job failed");
                job.fail(e.to_string(), now)
            }
        };
        transition.map_err(|e| ServiceError::Internal(e.to_string()))?;
        if let Err(e) = self.jobs.update(&job).await {
            warn!(%job_id, status = %job.status, error = %e, "Could not record report job outcome, retrying");
            tokio::time::sleep(RECORD_RETRY_DELAY).await;
            self.jobs.update(&job).await?;
        }
        if job.status == ReportJobStatus::Completed {
            info!(%job_id, "Report job completed");
        }
        Ok(job)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<ReportJob, ServiceError> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Report job not found".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::tests::{new_order, sandbox_factory};
    use crate::order::{OrderService, OrderServiceImpl};
    use model::{ManualClock, OrderStatus};
    use repository::InMemoryStore;
    use async_trait::async_trait;
    use repository::RepositoryError;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn seeded(threshold: u64) -> (Arc<InMemoryStore>, ReportService) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let orders = OrderServiceImpl::new(store.clone(), sandbox_factory(), clock.clone());
        for _ in 0..3 {
            orders.create_order(new_order(Uuid::new_v4())).await.unwrap();
        }
        let svc = ReportService::new(store.clone(), store.clone(), clock, threshold);
        (store, svc)
    }

    #[tokio::test]
    async fn test_small_report_is_synchronous() {
        let (_, svc) = seeded(10).await;
        let outcome = svc.generate_report(Uuid::new_v4(), ReportFilters::default()).await.unwrap();
        let ReportOutcome::Ready(metrics) = outcome else {
            panic!("expected inline metrics");
        };
        assert_eq!(metrics.total_orders, 3);
        assert_eq!(metrics.total_revenue, dec!(33000));
        assert_eq!(metrics.total_discount, dec!(3300));
        assert_eq!(metrics.status_breakdown.len(), 1);
        assert_eq!(metrics.status_breakdown[0].status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_filters_apply() {
        let (_, svc) = seeded(10).await;
        let filters = ReportFilters {
            status: Some(OrderStatus::Delivered),
            ..Default::default()
        };
        let ReportOutcome::Ready(metrics) = svc.generate_report(Uuid::new_v4(), filters).await.unwrap() else {
            panic!("expected inline metrics");
        };
        assert_eq!(metrics.total_orders, 0);
        assert_eq!(metrics.average_order_value, dec!(0));
    }

    #[tokio::test]
    async fn test_large_report_becomes_job() {
        let (_, svc) = seeded(2).await;
        let ReportOutcome::Queued(job) = svc.generate_report(Uuid::new_v4(), ReportFilters::default()).await.unwrap()
        else {
            panic!("expected a queued job");
        };
        assert_eq!(job.status, ReportJobStatus::Pending);

        let mut finished = None;
        for _ in 0..100 {
            let current = svc.get_job(job.id).await.unwrap();
            if current.status == ReportJobStatus::Completed {
                finished = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let finished = finished.expect("job should complete");
        assert_eq!(finished.result.unwrap().total_orders, 3);
        assert!(finished.completed_at.is_some());
    }

    /// Job store whose final writes fail `failures` times.
    struct FlakyJobs {
        inner: Arc<InMemoryStore>,
        updates: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl ReportJobsRepository for FlakyJobs {
        async fn insert(&self, job: &ReportJob) -> Result<(), RepositoryError> {
            ReportJobsRepository::insert(self.inner.as_ref(), job).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<ReportJob>, RepositoryError> {
            ReportJobsRepository::get(self.inner.as_ref(), id).await
        }

        async fn update(&self, job: &ReportJob) -> Result<(), RepositoryError> {
            let call = self.updates.fetch_add(1, Ordering::SeqCst);
            if (1..=self.failures).contains(&call) {
                return Err(RepositoryError::Decode("connection reset".into()));
            }
            ReportJobsRepository::update(self.inner.as_ref(), job).await
        }
    }

    async fn flaky(failures: usize) -> (Arc<FlakyJobs>, ReportService, Uuid) {
        let (store, _) = seeded(2).await;
        let jobs = Arc::new(FlakyJobs {
            inner: store.clone(),
            updates: AtomicUsize::new(0),
            failures,
        });
        let clock = Arc::new(ManualClock::default());
        let job = ReportJob::new(Uuid::new_v4(), ReportFilters::default(), clock.now());
        jobs.insert(&job).await.unwrap();
        let svc = ReportService::new(store, jobs.clone(), clock, 2);
        (jobs, svc, job.id)
    }

    #[tokio::test]
    async fn test_job_outcome_write_is_retried() {
        let (jobs, svc, job_id) = flaky(1).await;
        let job = svc.run_job(job_id).await.unwrap();
        assert_eq!(job.status, ReportJobStatus::Completed);
        assert_eq!(jobs.updates.load(Ordering::SeqCst), 3);

        let stored = svc.get_job(job_id).await.unwrap();
        assert_eq!(stored.status, ReportJobStatus::Completed);
        assert_eq!(stored.result.unwrap().total_orders, 3);
    }

    #[tokio::test]
    async fn test_job_outcome_write_failing_twice_is_reported() {
        let (jobs, svc, job_id) = flaky(2).await;
        let err = svc.run_job(job_id).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(jobs.updates.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (_, svc) = seeded(2).await;
        let err = svc.get_job(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
