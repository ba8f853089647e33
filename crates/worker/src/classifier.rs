// Image classifiers
//
// The production classifier is an external program: it receives the image
// path as its last argument and prints "<name>,<label>" on stdout.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use labelq_fleet::job::parse_label;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Classification errors
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("failed to start classifier: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("classifier exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("unexpected classifier output: {0:?}")]
    Output(String),
}

/// Labels one image file
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image: &Path) -> Result<String, ClassifyError>;
}

/// Runs an external command per image
#[derive(Debug, Clone)]
pub struct CommandClassifier {
    program: String,
    args: Vec<String>,
}

impl CommandClassifier {
    /// `command[0]` is the program, the rest are leading arguments
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Classifier for CommandClassifier {
    #[instrument(skip(self), fields(program = %self.program))]
    async fn classify(&self, image: &Path) -> Result<String, ClassifyError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(ClassifyError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let label = parse_label(stdout.trim())
            .map_err(|_| ClassifyError::Output(stdout.to_string()))?;
        if label.is_empty() {
            return Err(ClassifyError::Output(stdout.to_string()));
        }

        debug!(label = %label, "image classified");
        Ok(label.to_string())
    }
}
