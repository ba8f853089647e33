// labelq worker library
// Decision: consumer, classifier and config live in the library so they can be tested without a database

pub mod classifier;
pub mod config;
pub mod consumer;

pub use classifier::{Classifier, ClassifyError, CommandClassifier};
pub use config::{FailedJobPolicy, WorkerConfig};
pub use consumer::{ConsumerError, JobConsumer, JobOutcome};
