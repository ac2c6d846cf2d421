use crate::{
    cache::PriceCache,
    images::ImageStore,
    models::{ApiError, RunSummary, ScrapeRequest},
    pipeline::Orchestrator,
};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::info;
use uuid::Uuid;

/// Background scrape runs, executed one at a time by a single worker.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<JobBook>>,
}

/// Job states plus the completion order of finished jobs. Only the most
/// recent `retained` finished jobs are kept.
struct JobBook {
    states: HashMap<Uuid, JobState>,
    finished: VecDeque<Uuid>,
    retained: usize,
}

impl JobBook {
    fn new(retained: usize) -> Self {
        Self {
            states: HashMap::new(),
            finished: VecDeque::new(),
            retained: retained.max(1),
        }
    }

    fn finish(&mut self, id: Uuid, state: JobState) {
        self.states.insert(id, state);
        self.finished.push_back(id);
        while self.finished.len() > self.retained {
            if let Some(evicted) = self.finished.pop_front() {
                self.states.remove(&evicted);
            }
        }
    }
}

struct Job {
    id: Uuid,
    request: ScrapeRequest,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { summary: RunSummary },
    Failed { error: String, stage: String },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    pub fn spawn<C, I>(
        pipeline: Arc<Orchestrator<C, I>>,
        capacity: usize,
        retained: usize,
    ) -> (Self, JoinHandle<()>)
    where
        C: PriceCache + 'static,
        I: ImageStore + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let statuses = Arc::new(Mutex::new(JobBook::new(retained)));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                statuses_bg.lock().await.states.insert(job.id, JobState::Running);
                info!(target = "catalog.jobs", job_id = %job.id, "scrape job started");

                let state = match pipeline.run_queued(job.request).await {
                    Ok(summary) => JobState::Completed { summary },
                    Err(err) => JobState::Failed {
                        error: err.detail().to_string(),
                        stage: err.stage().to_string(),
                    },
                };
                statuses_bg.lock().await.finish(job.id, state);
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue(&self, request: ScrapeRequest) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        self.statuses.lock().await.states.insert(id, JobState::Queued);
        if self.tx.try_send(Job { id, request }).is_err() {
            self.statuses.lock().await.states.remove(&id);
            return Err(ApiError {
                error: "queue_full".into(),
                detail: Some("too many scrape jobs pending".into()),
            });
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.states.get(&id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryPriceCache;
    use crate::config::{CatalogConfig, FetchConfig};
    use crate::images::ImageError;
    use crate::models::ProductKey;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::watch;

    struct NoImages;

    impl ImageStore for NoImages {
        async fn store(&self, _key: &ProductKey, _url: &str) -> Result<String, ImageError> {
            Err(ImageError::Status(404))
        }
    }

    fn catalog_for(base_url: String, dir: &TempDir) -> CatalogConfig {
        CatalogConfig {
            base_url,
            default_pages: 1,
            max_pages: 5,
            data_file: dir.path().join("catalog.json"),
            images_dir: dir.path().join("images"),
        }
    }

    async fn serve_burs(server: &mut mockito::ServerGuard) {
        server
            .mock("GET", "/shop/page/1/")
            .with_status(200)
            .with_body(
                r#"<div class="product-inner"><h2 class="woo-loop-product__title">Burs</h2>
                   <span class="woocommerce-Price-amount">₹10.00</span></div>"#,
            )
            .create_async()
            .await;
    }

    async fn wait_for_terminal(queue: &JobQueue, id: Uuid) -> JobState {
        for _ in 0..200 {
            if let Some(info) = queue.get(id).await
                && matches!(info.state, JobState::Completed { .. } | JobState::Failed { .. })
            {
                return info.state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn job_runs_to_completion() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/shop/page/1/")
            .with_status(200)
            .with_body(
                r#"<div class="product-inner"><h2 class="woo-loop-product__title">Burs</h2>
                   <span class="woocommerce-Price-amount">₹10.00</span></div>"#,
            )
            .create_async()
            .await;
        let dir = TempDir::new().unwrap();
        let catalog = CatalogConfig {
            base_url: format!("{}/shop/page/{{page}}/", server.url()),
            default_pages: 1,
            max_pages: 5,
            data_file: dir.path().join("catalog.json"),
            images_dir: dir.path().join("images"),
        };
        let (_, rx) = watch::channel(false);
        let pipeline = Arc::new(
            Orchestrator::new(catalog, FetchConfig::default(), MemoryPriceCache::default(), NoImages, rx)
                .unwrap(),
        );
        let (queue, _worker) = JobQueue::spawn(pipeline, 4, 16);

        let id = queue.enqueue(ScrapeRequest::default()).await.unwrap();

        match wait_for_terminal(&queue, id).await {
            JobState::Completed { summary } => {
                assert_eq!(summary.total_scraped, 1);
                assert_eq!(summary.total_updated, 1);
            }
            _ => panic!("job should complete"),
        }
    }

    #[tokio::test]
    async fn invalid_request_marks_job_failed() {
        let dir = TempDir::new().unwrap();
        let catalog = CatalogConfig {
            base_url: "http://127.0.0.1:1/shop/page/{page}/".into(),
            default_pages: 1,
            max_pages: 5,
            data_file: dir.path().join("catalog.json"),
            images_dir: dir.path().join("images"),
        };
        let (_, rx) = watch::channel(false);
        let pipeline = Arc::new(
            Orchestrator::new(catalog, FetchConfig::default(), MemoryPriceCache::default(), NoImages, rx)
                .unwrap(),
        );
        let (queue, _worker) = JobQueue::spawn(pipeline, 4, 16);

        let id = queue
            .enqueue(ScrapeRequest {
                pages: Some(50),
                proxy: None,
            })
            .await
            .unwrap();

        match wait_for_terminal(&queue, id).await {
            JobState::Failed { stage, .. } => assert_eq!(stage, "request"),
            _ => panic!("job should fail"),
        }
    }

    #[tokio::test]
    async fn unknown_job_is_none() {
        let dir = TempDir::new().unwrap();
        let catalog = CatalogConfig {
            base_url: "http://127.0.0.1:1/{page}".into(),
            default_pages: 1,
            max_pages: 1,
            data_file: dir.path().join("catalog.json"),
            images_dir: dir.path().join("images"),
        };
        let (_, rx) = watch::channel(false);
        let pipeline = Arc::new(
            Orchestrator::new(catalog, FetchConfig::default(), MemoryPriceCache::default(), NoImages, rx)
                .unwrap(),
        );
        let (queue, _worker) = JobQueue::spawn(pipeline, 1, 16);
        assert!(queue.get(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn job_waits_for_running_scrape() {
        let mut server = mockito::Server::new_async().await;
        serve_burs(&mut server).await;
        let dir = TempDir::new().unwrap();
        let catalog = catalog_for(format!("{}/shop/page/{{page}}/", server.url()), &dir);
        let (_, rx) = watch::channel(false);
        let pipeline = Arc::new(
            Orchestrator::new(catalog, FetchConfig::default(), MemoryPriceCache::default(), NoImages, rx)
                .unwrap(),
        );
        let (queue, _worker) = JobQueue::spawn(pipeline.clone(), 4, 16);

        let held = pipeline.run_lock.lock().await;
        let id = queue.enqueue(ScrapeRequest::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            queue.get(id).await.map(|info| info.state),
            Some(JobState::Running)
        ));
        drop(held);

        match wait_for_terminal(&queue, id).await {
            JobState::Completed { summary } => assert_eq!(summary.total_scraped, 1),
            _ => panic!("job should complete once the lock is released"),
        }
    }

    #[tokio::test]
    async fn oldest_finished_jobs_are_evicted() {
        let mut server = mockito::Server::new_async().await;
        serve_burs(&mut server).await;
        let dir = TempDir::new().unwrap();
        let catalog = catalog_for(format!("{}/shop/page/{{page}}/", server.url()), &dir);
        let (_, rx) = watch::channel(false);
        let pipeline = Arc::new(
            Orchestrator::new(catalog, FetchConfig::default(), MemoryPriceCache::default(), NoImages, rx)
                .unwrap(),
        );
        let (queue, _worker) = JobQueue::spawn(pipeline, 4, 1);

        let first = queue.enqueue(ScrapeRequest::default()).await.unwrap();
        wait_for_terminal(&queue, first).await;
        let second = queue.enqueue(ScrapeRequest::default()).await.unwrap();
        wait_for_terminal(&queue, second).await;

        assert!(queue.get(first).await.is_none());
        assert!(queue.get(second).await.is_some());
    }
}
