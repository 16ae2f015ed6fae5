//! featurestream entrypoint: NDJSON events on stdin → windowed features in the offline table and
//! online store. Runs the eviction sweep and periodic parity checks until EOF or Ctrl+C, then
//! prints the pipeline summary and a final parity report.

use featurestream::{
    clock::{Clock, SystemClock},
    config::FeatureStoreConfig,
    events::Event,
    logging::{LogEvent, StructuredLogger},
    parity::ParityChecker,
    pipeline::StreamPipeline,
    retrieval::PointInTimeJoin,
    storage::{spawn_eviction_sweeper, OfflineTable, OnlineStore},
    uplink::ParityReporter,
};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

static STOP: AtomicBool = AtomicBool::new(false);

fn spawn_stdin_reader(capacity: usize) -> crossbeam_channel::Receiver<String> {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    });
    rx
}

fn run_parity(checker: &ParityChecker, reporter: &ParityReporter) {
    let n = checker.config().sample_size;
    match checker.run_sampled(n, &mut rand::thread_rng()) {
        Ok(report) => {
            if let Err(e) = reporter.report(&report) {
                warn!(error = %e, "parity report not delivered");
            }
        }
        Err(e) => warn!(error = %e, "parity run failed"),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config_path = std::env::var("FEATURESTREAM_CONFIG_PATH")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("featurestream.json"));
    let config = FeatureStoreConfig::load(&config_path)?;

    StructuredLogger::init(config.log.json, &config.log.level);

    let registry = config.registry()?;
    info!(
        data_dir = ?config.data_dir,
        features = registry.len(),
        partitions = config.partitions.count,
        "featurestream starting"
    );

    std::fs::create_dir_all(&config.data_dir)?;
    let offline = Arc::new(OfflineTable::open(&config.offline_path())?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let online = Arc::new(OnlineStore::new(
        config.online.clone(),
        registry.clone(),
        Arc::clone(&clock),
    ));
    let pit = PointInTimeJoin::new(
        Arc::clone(&offline),
        registry.clone(),
        Duration::from_millis(config.retrieval.deadline_ms),
    );
    let checker = Arc::new(ParityChecker::new(
        Arc::clone(&online),
        pit,
        config.parity.clone(),
        Arc::clone(&clock),
    ));
    let reporter = Arc::new(ParityReporter::new(&config.report)?);

    let pipeline = StreamPipeline::start(
        &config,
        registry,
        Arc::clone(&offline),
        Arc::clone(&online),
    )?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let sweeper = {
        let _guard = rt.enter();
        spawn_eviction_sweeper(
            Arc::clone(&online),
            Duration::from_millis(config.online.sweep_interval_ms.max(1)),
            stop_rx.clone(),
        )
    };
    let parity_loop = {
        let checker = Arc::clone(&checker);
        let reporter = Arc::clone(&reporter);
        let every = Duration::from_secs(config.parity.interval_secs.max(1));
        let mut stop_rx = stop_rx;
        rt.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let checker = Arc::clone(&checker);
                        let reporter = Arc::clone(&reporter);
                        let _ = tokio::task::spawn_blocking(move || run_parity(&checker, &reporter)).await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let _ = ctrlc::set_handler(|| {
        STOP.store(true, Ordering::Relaxed);
    });

    let lines = spawn_stdin_reader(config.partitions.channel_capacity);
    let mut malformed: u64 = 0;
    while !STOP.load(Ordering::Relaxed) {
        match lines.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(&line) {
                    Ok(event) => pipeline.dispatch(event)?,
                    Err(e) => {
                        malformed += 1;
                        warn!(error = %e, malformed, "malformed event line skipped");
                    }
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    info!(interrupted = STOP.load(Ordering::Relaxed), "input finished, draining");

    let summary = pipeline.shutdown()?;
    let _ = stop_tx.send(true);
    rt.block_on(async {
        let _ = sweeper.await;
        let _ = parity_loop.await;
    });
    rt.shutdown_timeout(Duration::from_secs(5));

    let mut stdout = std::io::stdout().lock();
    StructuredLogger::emit_json(
        &LogEvent {
            watermark: summary.global_watermark,
            ..LogEvent::info("featurestream::pipeline", "pipeline summary", &summary)
        },
        &mut stdout,
    );
    drop(stdout);

    run_parity(&checker, &reporter);
    info!(malformed, "featurestream stopped");
    Ok(())
}
