// SPDX-License-Identifier: Apache-2.0

//! Source specifications and pipeline tuning limits.
//!
//! Each monitored input is described as `<glob pattern>:<handler reference>`.
//! Patterns are expanded exactly once at startup into a fixed file list;
//! files created later that would match a pattern are not picked up. Zero
//! matches for a pattern and unresolvable handler references are fatal
//! startup errors.

use glob::glob;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::parsers::{self, LineParser};

/// One `<glob>:<handler>` input specification as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub pattern: String,
    pub handler: String,
}

impl SourceSpec {
    /// Split on the first `:`; everything after it is the handler reference,
    /// which may itself contain colons (`regex:<pattern>`).
    pub fn parse(spec: &str) -> Result<Self> {
        match spec.split_once(':') {
            Some((pattern, handler)) if !pattern.is_empty() && !handler.is_empty() => Ok(Self {
                pattern: pattern.to_string(),
                handler: handler.to_string(),
            }),
            _ => Err(Error::Config(format!(
                "source must be <glob pattern>:<handler>, got: {}",
                spec
            ))),
        }
    }
}

/// One monitored file with its resolved parser.
#[derive(Clone)]
pub struct Source {
    pub path: PathBuf,
    pub handler: String,
    pub parser: Arc<dyn LineParser>,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("path", &self.path)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

/// Resolve handlers and expand globs for all source specs. Any failure here
/// aborts startup before the pipeline tasks are spawned.
pub fn prepare_sources(specs: &[SourceSpec]) -> Result<Vec<Source>> {
    let mut sources = Vec::new();

    for spec in specs {
        let parser = parsers::resolve(&spec.handler)?;

        let matches =
            glob(&spec.pattern).map_err(|e| Error::InvalidGlob(format!("{}: {}", spec.pattern, e)))?;

        let mut matched_any = false;
        for entry in matches {
            let path = entry.map_err(|e| Error::Io(e.into_error()))?;
            if path.is_dir() {
                continue;
            }
            matched_any = true;
            sources.push(Source {
                path,
                handler: spec.handler.clone(),
                parser: parser.clone(),
            });
        }

        if !matched_any {
            return Err(Error::NoMatchingFiles(spec.pattern.clone()));
        }
    }

    Ok(sources)
}

/// Tuning knobs of the delivery pipeline, with the reference defaults.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Delivery queue capacity; producers block when it is full.
    pub queue_capacity: usize,
    /// Flush once a batch holds this many records.
    pub batch_max_records: usize,
    /// Flush a non-empty batch once this much time has passed.
    pub batch_max_delay: Duration,
    /// Upper bound on one dequeue wait, so the time trigger is re-checked
    /// while idle.
    pub queue_timeout: Duration,
    /// Backlog depth above which publishing is throttled.
    pub depth_limit: u64,
    /// Interval between depth polls; also the throttle re-check interval.
    pub depth_poll_interval: Duration,
    /// Delay before retrying a failed publish.
    pub publish_retry_delay: Duration,
    /// Delay before retrying a failed tailer pass.
    pub pass_retry_delay: Duration,
    /// Poll interval while a tailer waits for its pass to be committed.
    pub ack_poll_delay: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            queue_capacity: 2000,
            batch_max_records: 100,
            batch_max_delay: Duration::from_secs(1),
            queue_timeout: Duration::from_secs(1),
            depth_limit: 10_000_000,
            depth_poll_interval: Duration::from_secs(5),
            publish_retry_delay: Duration::from_secs(1),
            pass_retry_delay: Duration::from_millis(250),
            ack_poll_delay: Duration::from_millis(50),
        }
    }
}
