// Job consumer
// Decision: one job at a time; receive is cancellable on shutdown, labeling is not
//
// receive(1) ──► decode ──► write image ──► classify ──► reply ──► delete
//                   └──────────── failure ──► FailedJobPolicy

use std::path::{Path, PathBuf};
use std::sync::Arc;

use labelq_fleet::{
    ChannelError, CorrelationId, Job, MessageChannel, ReceivedMessage, Reply, WireError,
};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::classifier::{ClassifyError, Classifier};
use crate::config::{FailedJobPolicy, WorkerConfig};

/// File name used when a job's name has no usable file component
const FALLBACK_FILE_NAME: &str = "image";

/// Consumer errors
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("undecodable job: {0}")]
    Decode(#[from] WireError),

    #[error("failed to write image: {0}")]
    Io(#[from] std::io::Error),

    #[error("classification failed: {0}")]
    Classify(#[from] ClassifyError),
}

/// What happened to one received job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Reply published and job deleted
    Labeled(String),
    /// Labeling failed and the job was deleted
    Dropped,
    /// Labeling failed and the job was left for redelivery
    Released,
}

/// Pulls jobs, labels them and publishes replies
pub struct JobConsumer {
    jobs: Arc<dyn MessageChannel>,
    replies: Arc<dyn MessageChannel>,
    classifier: Arc<dyn Classifier>,
    config: WorkerConfig,
}

impl JobConsumer {
    pub fn new(
        jobs: Arc<dyn MessageChannel>,
        replies: Arc<dyn MessageChannel>,
        classifier: Arc<dyn Classifier>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            jobs,
            replies,
            classifier,
            config,
        }
    }

    /// Create the work directory and verify both channels
    pub async fn prepare(&self) -> Result<(), ConsumerError> {
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        self.jobs.ensure_exists().await?;
        self.replies.ensure_exists().await?;
        Ok(())
    }

    /// Receive and handle at most one job
    pub async fn run_cycle(&self) -> Result<Option<JobOutcome>, ConsumerError> {
        let mut batch = self.jobs.receive(1, self.config.receive_wait).await?;
        match batch.pop() {
            Some(message) => self.handle(&message).await.map(Some),
            None => Ok(None),
        }
    }

    /// Label one job and settle it according to the outcome
    #[instrument(skip_all, fields(message_id = %message.message_id, attempt = message.receive_count))]
    pub async fn handle(&self, message: &ReceivedMessage) -> Result<JobOutcome, ConsumerError> {
        match self.label(message).await {
            Ok(label) => {
                self.jobs.delete(&message.receipt_handle).await?;
                info!(label = %label, "job labeled");
                Ok(JobOutcome::Labeled(label))
            }
            Err(e) => match self.config.failed_job_policy {
                FailedJobPolicy::Drop => {
                    warn!("Job failed, dropping: {}", e);
                    self.jobs.delete(&message.receipt_handle).await?;
                    Ok(JobOutcome::Dropped)
                }
                FailedJobPolicy::Release => {
                    warn!("Job failed, leaving for redelivery: {}", e);
                    Ok(JobOutcome::Released)
                }
            },
        }
    }

    async fn label(&self, message: &ReceivedMessage) -> Result<String, ConsumerError> {
        let job = Job::from_message(message)?;
        let path = self.image_path(&job.name);

        tokio::fs::write(&path, &job.payload).await?;
        let classified = self.classifier.classify(&path).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(path = %path.display(), "Failed to remove image: {}", e);
        }
        let label = classified?;

        let reply = Reply::labeled(
            CorrelationId::new(message.message_id.clone()),
            &job.name,
            &label,
        );
        self.replies.send(reply.to_message()).await?;
        Ok(label)
    }

    /// Path inside the work directory; directory parts of the name are ignored
    fn image_path(&self, name: &str) -> PathBuf {
        let file_name = Path::new(name)
            .file_name()
            .unwrap_or_else(|| FALLBACK_FILE_NAME.as_ref());
        self.config.work_dir.join(file_name)
    }

    /// Run until `shutdown_rx` flips to true
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            slot = self.config.slot.as_deref().unwrap_or("unassigned"),
            jobs = %self.jobs.name(),
            policy = ?self.config.failed_job_policy,
            "worker consuming jobs"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let received = tokio::select! {
                received = self.jobs.receive(1, self.config.receive_wait) => received,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match received {
                Ok(mut batch) => {
                    if let Some(message) = batch.pop() {
                        if let Err(e) = self.handle(&message).await {
                            error!(message_id = %message.message_id, "Failed to settle job: {}", e);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to receive jobs: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("worker stopped");
    }
}
