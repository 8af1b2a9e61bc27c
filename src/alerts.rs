use anyhow::Result;
use log::info;
use reqwest::blocking::multipart;
use serde_json::json;

use crate::model::{AlertKind, FailureEvent, InventoryAlert, PrintJob};

const ORANGE: u32 = 0xFFA500;
const RED: u32 = 0xFF0000;
const GREEN: u32 = 0x00FF00;
const BLUE: u32 = 0x0099FF;
const YELLOW: u32 = 0xFFD700;

/// Discord notifications for failure events, inventory alerts and monitor
/// connectivity.
///
/// Without a webhook every notification is written to the log instead, so
/// the monitor runs the same way with or without Discord configured.
pub struct AlertService {
    webhook_url: Option<String>,
}

impl AlertService {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self { webhook_url }
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    /// Send a rich embed with the given title, Markdown description, sidebar
    /// color and title emoji.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP request fails or Discord answers with a
    /// non-success status.
    pub fn send_alert(
        &self,
        title: &str,
        description: &str,
        color: u32,
        emoji: &str,
    ) -> Result<()> {
        let Some(webhook_url) = &self.webhook_url else {
            info!("{} {}: {}", emoji, title, description);
            return Ok(());
        };

        let payload = json!({ "embeds": [embed(title, description, color, emoji, None)] });

        let response = reqwest::blocking::Client::new()
            .post(webhook_url)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Failed to send Discord alert: HTTP {}",
                response.status()
            ));
        }

        Ok(())
    }

    /// Same as [`AlertService::send_alert`], with `image_data` attached and
    /// shown inside the embed.
    pub fn send_alert_with_image(
        &self,
        title: &str,
        description: &str,
        color: u32,
        emoji: &str,
        image_data: &[u8],
        filename: &str,
    ) -> Result<()> {
        let Some(webhook_url) = &self.webhook_url else {
            info!(
                "{} {}: {} ({} byte attachment)",
                emoji,
                title,
                description,
                image_data.len()
            );
            return Ok(());
        };

        let payload = json!({
            "embeds": [embed(title, description, color, emoji, Some(filename))]
        });

        let form = multipart::Form::new()
            .text("payload_json", payload.to_string())
            .part(
                "files[0]",
                multipart::Part::bytes(image_data.to_vec())
                    .file_name(filename.to_string())
                    .mime_str("image/jpeg")?,
            );

        let response = reqwest::blocking::Client::new()
            .post(webhook_url)
            .multipart(form)
            .send()?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Failed to send Discord alert with image: HTTP {}",
                response.status()
            ));
        }

        Ok(())
    }

    /// Announce a new failure event, optionally with the annotated frame.
    pub fn send_failure_event_alert(
        &self,
        job: &PrintJob,
        event: &FailureEvent,
        annotated_image: Option<&[u8]>,
    ) -> Result<()> {
        let title = format!("Print Failure #{} Detected", event.sequence);
        let description = failure_description(job, event);

        match annotated_image {
            Some(image_data) => {
                let filename = format!("{}_failure_{}.jpg", job.id, event.sequence);
                self.send_alert_with_image(
                    &title,
                    &description,
                    ORANGE,
                    "⚠️",
                    image_data,
                    &filename,
                )
            }
            None => self.send_alert(&title, &description, ORANGE, "⚠️"),
        }
    }

    pub fn send_inventory_alert(&self, alert: &InventoryAlert) -> Result<()> {
        let (title, color, emoji) = match alert.kind {
            AlertKind::LowInventory => ("Low Filament", YELLOW, "🧵"),
            AlertKind::InsufficientMaterial => ("Insufficient Filament", RED, "🚨"),
        };
        let description = format!(
            "Spool **{}**: {}\n\n• Fill: {:.0}%\n• Threshold: {:.0}%",
            alert.spool_id,
            alert.message,
            alert.fill_ratio * 100.0,
            alert.threshold * 100.0
        );
        self.send_alert(title, &description, color, emoji)
    }

    /// Report that a job reached a terminal state.
    pub fn send_job_finished_alert(&self, job: &PrintJob, failure_count: usize) -> Result<()> {
        let description = format!(
            "Job **{}** (`{}`) finished as **{}**\n\n• Progress: {:.1}%\n• Filament used: {:.1} g\n• Failures detected: {}",
            job.part_name,
            job.id,
            job.status,
            job.progress_percent,
            job.material_used_grams,
            failure_count
        );
        self.send_alert("Print Job Finished", &description, BLUE, "ℹ️")
    }

    /// Frame acquisition gave up after `max_retries` attempts.
    pub fn send_system_offline_alert(&self, image_url: &str, max_retries: u32) -> Result<()> {
        let description = format!(
            "Failed to fetch image from {} after {} attempts. Print monitoring is offline!",
            image_url, max_retries
        );
        self.send_alert("CRITICAL: Print Monitoring Offline", &description, RED, "🚨")
    }

    pub fn send_system_recovery_alert(&self) -> Result<()> {
        self.send_alert(
            "RECOVERY: Print Monitoring Back Online",
            "Image fetch successful after connection issues.",
            GREEN,
            "✅",
        )
    }
}

fn embed(
    title: &str,
    description: &str,
    color: u32,
    emoji: &str,
    attachment: Option<&str>,
) -> serde_json::Value {
    let mut embed = json!({
        "title": format!("{} {}", emoji, title),
        "description": description,
        "color": color,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "footer": { "text": "Print Sentinel" }
    });
    if let Some(filename) = attachment {
        embed["image"] = json!({ "url": format!("attachment://{}", filename) });
    }
    embed
}

/// Markdown body for a failure event.
pub fn failure_description(job: &PrintJob, event: &FailureEvent) -> String {
    let mut description = format!(
        "Detected **{}** on **{}** (`{}`) with **{:.0}%** confidence.\nJob is now **{}** at {:.1}%.",
        event.failure_type,
        job.part_name,
        job.id,
        event.confidence * 100.0,
        job.status,
        job.progress_percent
    );
    if !event.regions.is_empty() {
        description.push_str("\n\n**Regions:**");
        for region in &event.regions {
            let b = region.bbox;
            description.push_str(&format!(
                "\n• {:?}: {}x{} at ({}, {})",
                region.heuristic, b.width, b.height, b.x, b.y
            ));
        }
    }
    description
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AlertId, BoundingBox, Evidence, FailureType, Heuristic, JobId, JobStatus, NewJob, PrinterId,
        Region, SpoolId,
    };
    use chrono::Utc;

    fn job() -> PrintJob {
        let mut job = PrintJob::queued(
            JobId::from("JOB_ALERT"),
            NewJob::new(PrinterId::from("P1"), "bracket"),
            Utc::now(),
        );
        job.status = JobStatus::PausedFailure;
        job.progress_percent = 42.0;
        job
    }

    fn event() -> FailureEvent {
        FailureEvent {
            job_id: JobId::from("JOB_ALERT"),
            sequence: 1,
            failure_type: FailureType::Stringing,
            confidence: 0.85,
            evidence: Evidence::default(),
            regions: vec![Region {
                heuristic: Heuristic::Line,
                bbox: BoundingBox::new(5, 6, 30, 40),
            }],
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn failure_description_names_job_and_regions() {
        let text = failure_description(&job(), &event());
        assert!(text.contains("stringing"));
        assert!(text.contains("bracket"));
        assert!(text.contains("85%"));
        assert!(text.contains("paused_failure"));
        assert!(text.contains("30x40 at (5, 6)"));
    }

    #[test]
    fn without_webhook_alerts_are_logged() {
        let service = AlertService::new(None);
        assert!(!service.is_enabled());
        service.send_failure_event_alert(&job(), &event(), Some(&[1, 2, 3])).unwrap();
        service.send_job_finished_alert(&job(), 1).unwrap();
        service
            .send_inventory_alert(&InventoryAlert {
                id: AlertId(1),
                spool_id: SpoolId::from("S1"),
                kind: AlertKind::LowInventory,
                threshold: 0.15,
                fill_ratio: 0.1,
                message: "running low".into(),
                resolved: false,
                created_at: Utc::now(),
                resolved_at: None,
            })
            .unwrap();
        service.send_system_offline_alert("http://camera", 3).unwrap();
        service.send_system_recovery_alert().unwrap();
    }
}
