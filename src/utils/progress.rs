//! Spinner shown while gcloud creates or deletes a burst cluster

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt;
use std::io::IsTerminal;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterOp {
    Create,
    Delete,
}

impl fmt::Display for ClusterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterOp::Create => write!(f, "Creating"),
            ClusterOp::Delete => write!(f, "Deleting"),
        }
    }
}

/// Tracks one cluster operation from start to finish.
///
/// GKE operations take minutes, so the final line reports how long it took.
/// The spinner is not drawn when stderr is not a terminal.
pub struct ClusterProgress {
    pb: ProgressBar,
    started: Instant,
}

impl ClusterProgress {
    pub fn start(op: ClusterOp, cluster: &str) -> Self {
        let pb = if std::io::stderr().is_terminal() {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::with_draw_target(None, ProgressDrawTarget::hidden())
        };
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold} {msg} [{elapsed}]") {
            pb.set_style(style);
        }
        pb.set_prefix(cluster.to_string());
        pb.set_message(format!("{}...", op.to_string().to_lowercase()));
        pb.enable_steady_tick(Duration::from_millis(120));

        Self {
            pb,
            started: Instant::now(),
        }
    }

    pub fn set_step(&self, step: impl Into<String>) {
        self.pb.set_message(step.into());
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn done(&self, what: &str) {
        let line = self.summary("✓", what);
        self.pb.finish_with_message(line);
    }

    pub fn failed(&self, what: &str) {
        let line = self.summary("✗", what);
        self.pb.abandon_with_message(line);
    }

    fn summary(&self, mark: &str, what: &str) -> String {
        format!("{} {} after {}s", mark, what, self.elapsed().as_secs())
    }
}
