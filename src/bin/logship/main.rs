// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tower::BoxError;
use tracing::metadata::LevelFilter;
use tracing::{error, info};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use logship::bounded_channel::bounded;
use logship::broker::BrokerClient;
use logship::config::{Limits, SourceSpec, prepare_sources};
use logship::depth::{DepthMonitor, ThrottleFlag};
use logship::offsets::OffsetStore;
use logship::sender::BatchSender;
use logship::tailer::Tailer;

#[derive(Debug, Parser)]
#[command(name = "logship")]
#[command(bin_name = "logship")]
#[command(version, about, long_about = None)]
struct Arguments {
    /// Log format
    #[arg(
        value_enum,
        long,
        env = "LOGSHIP_LOG_FORMAT",
        default_value = "text"
    )]
    log_format: LogFormatArg,

    /// Monitored sources as <glob pattern>:<handler reference>
    #[arg(long = "file", env = "LOGSHIP_FILES", value_delimiter = ',', required = true)]
    files: Vec<String>,

    /// Broker HTTP address
    #[arg(long, env = "LOGSHIP_NSQD_HTTP_ADDRESS", default_value = "localhost:4151")]
    nsqd_http_address: String,

    /// Topic records are published to
    #[arg(long, env = "LOGSHIP_TOPIC")]
    topic: String,

    /// File the committed read offsets are checkpointed to
    #[arg(
        long,
        env = "LOGSHIP_OFFSETS_FILE",
        default_value = "/tmp/logship-offsets.json"
    )]
    offsets_file: String,

    /// Delivery queue capacity; tailers block while it is full
    #[arg(long, env = "LOGSHIP_QUEUE_CAPACITY", default_value = "2000")]
    queue_capacity: usize,

    /// Flush a batch once it holds this many records
    #[arg(long, env = "LOGSHIP_BATCH_MAX_RECORDS", default_value = "100")]
    batch_max_records: usize,

    /// Flush a non-empty batch after this long
    #[arg(long, env = "LOGSHIP_BATCH_MAX_DELAY", default_value = "1s")]
    batch_max_delay: humantime::Duration,

    /// Upper bound on one dequeue wait, so the flush timer is re-checked
    /// while the queue is idle
    #[arg(long, env = "LOGSHIP_QUEUE_TIMEOUT", default_value = "1s")]
    queue_timeout: humantime::Duration,

    /// Broker backlog depth above which publishing pauses
    #[arg(long, env = "LOGSHIP_DEPTH_LIMIT", default_value = "10000000")]
    depth_limit: u64,

    /// Interval between broker depth polls
    #[arg(long, env = "LOGSHIP_DEPTH_POLL_INTERVAL", default_value = "5s")]
    depth_poll_interval: humantime::Duration,

    /// Delay before retrying a failed publish
    #[arg(long, env = "LOGSHIP_PUBLISH_RETRY_DELAY", default_value = "1s")]
    publish_retry_delay: humantime::Duration,

    /// Delay before retrying a failed tailer pass
    #[arg(long, env = "LOGSHIP_PASS_RETRY_DELAY", default_value = "250ms")]
    pass_retry_delay: humantime::Duration,

    /// Poll interval while a tailer waits for its pass to be committed
    #[arg(long, env = "LOGSHIP_ACK_POLL_DELAY", default_value = "50ms")]
    ack_poll_delay: humantime::Duration,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

fn main() -> ExitCode {
    let args = Arguments::parse();

    let _guard = match setup_logging(&args.log_format) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ERROR: failed to setup logging: {}", e);
            return ExitCode::from(1);
        }
    };

    match run_agent(args) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Failed to run agent.");
            ExitCode::from(1)
        }
    }
}

#[tokio::main]
async fn run_agent(args: Arguments) -> Result<(), BoxError> {
    let limits = Limits {
        queue_capacity: args.queue_capacity,
        batch_max_records: args.batch_max_records,
        batch_max_delay: args.batch_max_delay.into(),
        queue_timeout: args.queue_timeout.into(),
        depth_limit: args.depth_limit,
        depth_poll_interval: args.depth_poll_interval.into(),
        publish_retry_delay: args.publish_retry_delay.into(),
        pass_retry_delay: args.pass_retry_delay.into(),
        ack_poll_delay: args.ack_poll_delay.into(),
    };

    // Startup configuration errors are the only fatal errors: handler
    // resolution and glob expansion happen here, before any task starts.
    let specs = args
        .files
        .iter()
        .map(|f| SourceSpec::parse(f))
        .collect::<Result<Vec<_>, _>>()?;
    let sources = prepare_sources(&specs)?;

    let offsets = Arc::new(OffsetStore::open(&args.offsets_file)?);
    let client = BrokerClient::new(&args.nsqd_http_address, &args.topic)?;
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());

    let (queue_tx, queue_rx) = bounded(limits.queue_capacity);
    let throttle = ThrottleFlag::new();

    info!(
        sources = sources.len(),
        topic = %args.topic,
        broker = %args.nsqd_http_address,
        "Starting log shipper."
    );

    let mut tasks = JoinSet::new();

    for source in sources {
        let source_id = offsets.register(&source.path.display().to_string());
        let tailer = Tailer::new(
            source,
            source_id,
            host.clone(),
            offsets.clone(),
            queue_tx.clone(),
            limits.pass_retry_delay,
            limits.ack_poll_delay,
        );
        tasks.spawn(tailer.run());
    }
    drop(queue_tx);

    let sender = BatchSender::new(
        queue_rx,
        client.clone(),
        offsets.clone(),
        throttle.clone(),
        &limits,
    );
    tasks.spawn(sender.run());

    let monitor = DepthMonitor::new(
        client,
        throttle,
        limits.depth_limit,
        limits.depth_poll_interval,
    );
    tasks.spawn(monitor.run());

    // No graceful drain: a termination signal ends the process abruptly, and
    // uncommitted work replays on the next start.
    tokio::select! {
        _ = signal_wait() => {
            info!("Shutdown signal received, exiting.");
            Ok(())
        }
        res = tasks.join_next() => {
            match res {
                Some(Err(e)) => Err(format!("pipeline task panicked: {}", e).into()),
                _ => Err("unexpected early exit of pipeline task".into()),
            }
        }
    }
}

async fn signal_wait() {
    let mut sig_term = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
    let mut sig_int = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

    tokio::select! {
        _ = sig_term.recv() => {}
        _ = sig_int.recv() => {}
    }
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_format: &LogFormatArg) -> Result<LoggerGuard, BoxError> {
    LogTracer::init()?;

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        use std::io::IsTerminal;

        // Skip color codes when not in a terminal
        let use_ansi = std::io::stdout().is_terminal();

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn every_pipeline_knob_is_settable() {
        let args = Arguments::try_parse_from([
            "logship",
            "--file",
            "/var/log/app.log:raw",
            "--topic",
            "logs",
            "--queue-timeout",
            "500ms",
            "--pass-retry-delay",
            "100ms",
            "--ack-poll-delay",
            "10ms",
        ])
        .unwrap();

        assert_eq!(Duration::from_millis(500), *args.queue_timeout);
        assert_eq!(Duration::from_millis(100), *args.pass_retry_delay);
        assert_eq!(Duration::from_millis(10), *args.ack_poll_delay);
    }
}
