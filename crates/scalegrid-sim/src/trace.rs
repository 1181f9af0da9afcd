//! Per-request diagnostic trace log.
//!
//! When a request asks for diagnostics, its whole tracing output is routed
//! into `<trace_dir>/<request>-<correlation>.log` through a dedicated
//! dispatcher. The file is closed once the last clone of the dispatcher is
//! dropped.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Dispatch;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{Layer, Registry};

use crate::error::{SimResult, SimulationError};

pub struct TraceLog {
    path: PathBuf,
    dispatch: Dispatch,
}

impl TraceLog {
    pub fn create(dir: &Path, request_id: &str, correlation_id: &str) -> SimResult<Self> {
        let path = dir.join(format!(
            "{}-{}.log",
            file_safe(request_id),
            file_safe(correlation_id)
        ));
        let open_error = |source| SimulationError::TraceLog {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(dir).map_err(open_error)?;
        let file = File::create(&path).map_err(open_error)?;

        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(Mutex::new(file))
            .with_filter(LevelFilter::DEBUG);
        let dispatch = Dispatch::new(Registry::default().with(layer));
        Ok(Self { path, dispatch })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }
}

/// Keep ids usable as a file name component.
fn file_safe(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "none".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_events_to_the_request_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = TraceLog::create(dir.path(), "req/1", "corr").unwrap();
        assert_eq!(log.path(), dir.path().join("req_1-corr.log"));

        tracing::dispatcher::with_default(log.dispatch(), || {
            tracing::debug!(pass = 1, "pass started");
        });
        drop(log);

        let content = std::fs::read_to_string(dir.path().join("req_1-corr.log")).unwrap();
        assert!(content.contains("pass started"));
        assert!(content.contains("pass=1"));
    }

    #[test]
    fn empty_ids_still_give_a_file_name() {
        assert_eq!(file_safe(""), "none");
        assert_eq!(file_safe("a b"), "a_b");
    }
}
