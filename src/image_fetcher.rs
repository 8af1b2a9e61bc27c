use anyhow::Result;
use image::Rgb;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use log::{error, info, warn};
use std::{thread, time::Duration};

use crate::model::{Heuristic, Region};

/// Downloads camera frames for the monitor.
///
/// URLs are used round-robin, one per attempt. A failed attempt is retried
/// after a fixed delay until `max_retries` consecutive failures, at which
/// point the caller is told the camera is offline. The next successful fetch
/// after that reports a recovery.
pub struct ImageFetcher {
    client: reqwest::blocking::Client,
    image_urls: Vec<String>,
    next_url: usize,
    max_retries: u32,
    retry_delay: Duration,
    consecutive_failures: u32,
    offline: bool,
}

/// Connectivity changes reported by [`ImageFetcher::fetch_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Offline,
    Recovered,
}

impl ImageFetcher {
    pub fn new(image_urls: Vec<String>, max_retries: u32, retry_delay_seconds: u64) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            image_urls,
            next_url: 0,
            max_retries: max_retries.max(1),
            retry_delay: Duration::from_secs(retry_delay_seconds),
            consecutive_failures: 0,
            offline: false,
        }
    }

    /// Fetch one frame, retrying until it succeeds or the retry budget is
    /// spent. `on_event` is called once when the camera goes offline and once
    /// when it comes back; its errors are logged and otherwise ignored.
    pub fn fetch_with_retry<F>(&mut self, mut on_event: F) -> Result<Vec<u8>>
    where
        F: FnMut(ConnectionEvent) -> Result<()>,
    {
        loop {
            match self.attempt_fetch() {
                Ok(data) => {
                    if self.offline {
                        match on_event(ConnectionEvent::Recovered) {
                            Ok(()) => info!("Camera connection recovered"),
                            Err(e) => error!("Failed to report recovery: {}", e),
                        }
                        self.offline = false;
                    }
                    self.consecutive_failures = 0;
                    return Ok(data);
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    warn!(
                        "Failed to fetch frame (attempt {}/{}): {}",
                        self.consecutive_failures, self.max_retries, e
                    );

                    if self.consecutive_failures >= self.max_retries {
                        if !self.offline {
                            match on_event(ConnectionEvent::Offline) {
                                Ok(()) => {
                                    info!("Reported camera offline");
                                    self.offline = true;
                                }
                                Err(alert_err) => error!("Failed to report outage: {}", alert_err),
                            }
                        }
                        self.consecutive_failures = 0;
                        return Err(anyhow::anyhow!(
                            "Failed to fetch frame after {} retries",
                            self.max_retries
                        ));
                    }

                    thread::sleep(self.retry_delay);
                }
            }
        }
    }

    /// One request against the next URL in rotation.
    pub fn attempt_fetch(&mut self) -> Result<Vec<u8>> {
        if self.image_urls.is_empty() {
            return Err(anyhow::anyhow!("no image URLs configured"));
        }
        let index = self.next_url % self.image_urls.len();
        self.next_url = (index + 1) % self.image_urls.len();

        let response = self.client.get(&self.image_urls[index]).send()?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "HTTP request failed with status: {}",
                response.status()
            ));
        }
        Ok(response.bytes()?.to_vec())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn image_urls(&self) -> &[String] {
        &self.image_urls
    }
}

fn heuristic_color(heuristic: Heuristic) -> Rgb<u8> {
    match heuristic {
        Heuristic::Edge => Rgb([255, 0, 255]),
        Heuristic::Line => Rgb([255, 255, 0]),
        Heuristic::Blob => Rgb([255, 128, 0]),
        Heuristic::Contour => Rgb([0, 200, 255]),
    }
}

/// Draw each region as a three pixel wide box in its heuristic's color and
/// return the frame as JPEG.
pub fn annotate_regions(image_data: &[u8], regions: &[Region]) -> Result<Vec<u8>> {
    let mut rgb_image = image::load_from_memory(image_data)?.to_rgb8();
    let (width, height) = rgb_image.dimensions();

    for region in regions {
        let bbox = region.bbox;
        let color = heuristic_color(region.heuristic);
        for inset in 0..3u32 {
            let x = bbox.x.saturating_add(inset);
            let y = bbox.y.saturating_add(inset);
            if x >= width || y >= height {
                break;
            }
            let w = bbox
                .width
                .saturating_sub(2 * inset)
                .min(width - x);
            let h = bbox
                .height
                .saturating_sub(2 * inset)
                .min(height - y);
            if w == 0 || h == 0 {
                break;
            }
            draw_hollow_rect_mut(&mut rgb_image, Rect::at(x as i32, y as i32).of_size(w, h), color);
        }
    }

    let mut buffer = Vec::new();
    image::DynamicImage::ImageRgb8(rgb_image)
        .write_to(&mut std::io::Cursor::new(&mut buffer), image::ImageFormat::Jpeg)?;
    Ok(buffer)
}

/// Flip the frame vertically for cameras mounted upside down, keeping the
/// input's encoding where it can be recognized.
pub fn apply_image_transformations(image_data: &[u8], flip_vertical: bool) -> Result<Vec<u8>> {
    if !flip_vertical {
        return Ok(image_data.to_vec());
    }

    let flipped = image::load_from_memory(image_data)?.flipv();
    let format = image::guess_format(image_data).unwrap_or(image::ImageFormat::Jpeg);

    let mut buffer = Vec::new();
    flipped.write_to(&mut std::io::Cursor::new(&mut buffer), format)?;
    Ok(buffer)
}
