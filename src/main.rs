use anyhow::{Context, Result};
use log::{error, info, warn};
use std::collections::HashSet;
use std::{thread, time::Duration};

use print_sentinel::config::constants;
use print_sentinel::image_fetcher::{self, ConnectionEvent, ImageFetcher};
use print_sentinel::{
    AlertId, AlertService, Engine, EngineConfig, Frame, InMemoryRepository, JobId, MonitorConfig,
    NewJob, NewPrinter, NewSpool, SpoolId,
};

/// Frames between inventory sweeps.
const INVENTORY_SWEEP_EVERY: u64 = 10;

/// Print Sentinel - camera monitor for a single print job.
///
/// Registers a printer, a spool and a job with an in-process engine, starts
/// the job and then submits a camera frame every `FRAME_INTERVAL_SECONDS`.
/// Each new failure event is posted to Discord with the frame annotated by
/// the regions that triggered it. Inventory alerts are swept periodically.
///
/// # Environment Variables
///
/// Required:
/// * `IMAGE_URL` - Camera image URL(s) (comma-separated for round-robin)
///
/// Optional:
/// * `DISCORD_WEBHOOK` - Discord webhook URL; alerts are only logged without it
/// * `PRINTER_NAME`, `JOB_ID`, `PART_NAME`, `JOB_MATERIAL_G`
/// * `SPOOL_ID`, `MATERIAL_TYPE`, `SPOOL_CAPACITY_G`, `SPOOL_REMAINING_G`
/// * `FAILURE_DETECTION_THRESHOLD`, `INVENTORY_ALERT_THRESHOLD`
/// * `FRAME_WARMUP_SECONDS`, `FRAME_INTERVAL_SECONDS`, `DETECTION_COOLDOWN_SECONDS`
/// * `FLIP_IMAGE` - Flip frames vertically (default: "false")
///
/// # Usage
///
/// ```bash
/// export IMAGE_URL="http://camera.local/image.jpg"
/// export DISCORD_WEBHOOK="https://discord.com/api/webhooks/..."
/// export PART_NAME="benchy" JOB_MATERIAL_G=15
/// ./print-sentinel
/// ```
fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(
            std::env::var("RUST_LOG")
                .ok()
                .and_then(|level| level.parse().ok())
                .unwrap_or(log::LevelFilter::Info),
        )
        .init();

    let monitor = MonitorConfig::from_env().context("invalid monitor configuration")?;
    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    let warmup = Duration::from_secs(config.frame_warmup_seconds);
    let interval = Duration::from_secs(config.frame_interval_seconds);

    let alerts = AlertService::new(monitor.discord_webhook.clone());
    if !alerts.is_enabled() {
        warn!("DISCORD_WEBHOOK not set; alerts will only be logged");
    }

    let engine = Engine::new(config, InMemoryRepository::new());

    let printer = engine.register_printer(NewPrinter {
        name: monitor.printer_name.clone(),
        ..NewPrinter::default()
    })?;

    let mut spool = NewSpool::new(
        SpoolId::new(monitor.spool_id.clone()),
        monitor.material_type.clone(),
        monitor.spool_capacity_grams,
    );
    if let Some(remaining) = monitor.spool_remaining_grams {
        spool = spool.with_remaining(remaining);
    }
    let spool_id = engine.create_spool(spool)?;

    let mut request =
        NewJob::new(printer.id.clone(), monitor.part_name.clone()).with_spool(spool_id);
    if let Some(id) = &monitor.job_id {
        request = request.with_id(JobId::new(id.clone()));
    }
    if let Some(grams) = monitor.job_material_grams {
        request = request.with_estimated_material(grams);
    }
    let job = engine.create_job(request)?;
    engine.start_job(&job.id)?;

    let mut fetcher = ImageFetcher::new(
        monitor.image_urls.clone(),
        constants::MAX_RETRIES,
        constants::RETRY_DELAY_SECONDS,
    );
    let mut announced: HashSet<AlertId> = HashSet::new();
    announce_open_alerts(&engine, &alerts, &mut announced);

    info!(
        "Monitoring job {} on {} from {}",
        job.id,
        printer.name,
        monitor.image_urls.join(", ")
    );
    thread::sleep(warmup);

    let mut frames: u64 = 0;
    loop {
        let current = engine.job(&job.id)?;
        if current.status.is_terminal() {
            let failures = engine.failure_events(&job.id)?.len();
            if let Err(e) = alerts.send_job_finished_alert(&current, failures) {
                error!("Failed to send job summary: {}", e);
            }
            info!("Job {} finished as {}", current.id, current.status);
            return Ok(());
        }

        let image_data = match fetch_frame(&mut fetcher, &alerts, monitor.flip_image) {
            Ok(data) => data,
            Err(e) => {
                error!(
                    "Skipping frame after {} failed attempts: {}",
                    fetcher.consecutive_failures(),
                    e
                );
                // An offline camera is polled at the frame interval.
                if fetcher.is_offline() {
                    thread::sleep(interval);
                } else {
                    thread::sleep(Duration::from_secs(constants::RETRY_DELAY_SECONDS));
                }
                continue;
            }
        };

        let frame = Frame::new(job.id.clone(), image_data, chrono::Utc::now());
        match engine.submit_frame(&job.id, &frame) {
            Ok(outcome) => {
                if let Some(event) = &outcome.failure_event {
                    let annotated = image_fetcher::annotate_regions(&frame.data, &event.regions)
                        .map_err(|e| warn!("Failed to annotate frame: {}", e))
                        .ok();
                    let job = engine.job(&job.id)?;
                    let sent = alerts.send_failure_event_alert(&job, event, annotated.as_deref());
                    if let Err(e) = sent {
                        error!("Failed to send failure alert: {}", e);
                    }
                }
            }
            Err(e) => error!("Frame rejected: {}", e),
        }

        frames += 1;
        if frames % INVENTORY_SWEEP_EVERY == 0 {
            announce_open_alerts(&engine, &alerts, &mut announced);
        }

        thread::sleep(interval);
    }
}

/// Fetch, and flip if configured, one frame. Outages and recoveries are
/// reported through the alert service.
fn fetch_frame(fetcher: &mut ImageFetcher, alerts: &AlertService, flip: bool) -> Result<Vec<u8>> {
    let url = fetcher.image_urls().join(", ");
    let max_retries = fetcher.max_retries();
    let data = fetcher.fetch_with_retry(|event| match event {
        ConnectionEvent::Offline => alerts.send_system_offline_alert(&url, max_retries),
        ConnectionEvent::Recovered => alerts.send_system_recovery_alert(),
    })?;
    image_fetcher::apply_image_transformations(&data, flip)
}

fn announce_open_alerts<R, A>(
    engine: &Engine<R, A>,
    alerts: &AlertService,
    announced: &mut HashSet<AlertId>,
) where
    R: print_sentinel::Repository,
    A: print_sentinel::FrameAnalyzer,
{
    let open = match engine.evaluate_alerts() {
        Ok(open) => open,
        Err(e) => {
            error!("Inventory sweep failed: {}", e);
            return;
        }
    };
    for alert in open {
        if !announced.insert(alert.id) {
            continue;
        }
        if let Err(e) = alerts.send_inventory_alert(&alert) {
            error!("Failed to send inventory alert {}: {}", alert.id, e);
        }
    }
}
