use std::{fmt::Display, str::FromStr};

use crate::error::ConfigError;
use crate::model::FailureType;

/// Configuration for the engine, passed explicitly to [`crate::Engine::new`].
///
/// Every threshold is threaded from here into the component that needs it;
/// there is no global configuration. Values can be loaded from environment
/// variables to support containerized deployments.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Minimum fused confidence for a detection to become a failure event.
    ///
    /// Detections below this are a normal "no failure" outcome.
    /// Environment variable: `FAILURE_DETECTION_THRESHOLD`
    pub failure_detection_threshold: f32,

    /// Fill ratio below which a spool raises a low-inventory alert.
    /// Environment variable: `INVENTORY_ALERT_THRESHOLD`
    pub inventory_alert_threshold: f32,

    /// Delay before the acquisition loop submits its first frame.
    /// Environment variable: `FRAME_WARMUP_SECONDS`
    pub frame_warmup_seconds: u64,

    /// Delay between frame submissions in the acquisition loop.
    /// Environment variable: `FRAME_INTERVAL_SECONDS`
    pub frame_interval_seconds: u64,

    /// Minimum time between accepted events of the same type for one job.
    pub cooldowns: CooldownPolicy,

    /// Tuning constants for the image heuristics.
    pub analyzer: AnalyzerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failure_detection_threshold: constants::DEFAULT_FAILURE_DETECTION_THRESHOLD,
            inventory_alert_threshold: constants::DEFAULT_INVENTORY_ALERT_THRESHOLD,
            frame_warmup_seconds: constants::DEFAULT_FRAME_WARMUP_SECONDS,
            frame_interval_seconds: constants::DEFAULT_FRAME_INTERVAL_SECONDS,
            cooldowns: CooldownPolicy::default(),
            analyzer: AnalyzerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed, or a
    /// threshold falls outside `[0, 1]`:
    /// - `FAILURE_DETECTION_THRESHOLD` (default: "0.7")
    /// - `INVENTORY_ALERT_THRESHOLD` (default: "0.15")
    /// - `FRAME_WARMUP_SECONDS` (default: "10")
    /// - `FRAME_INTERVAL_SECONDS` (default: "30")
    /// - `DETECTION_COOLDOWN_SECONDS` (default: "300", applies to every type)
    /// - `STRINGING_COOLDOWN_SECONDS`, `LAYER_SEPARATION_COOLDOWN_SECONDS`,
    ///   `WARPING_COOLDOWN_SECONDS`, `BLOB_COOLDOWN_SECONDS` (per-type overrides)
    ///
    /// # Examples
    ///
    /// ```no_run
    /// let config = print_sentinel::EngineConfig::from_env().expect("invalid configuration");
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let failure_detection_threshold = parse_var(
            &lookup,
            "FAILURE_DETECTION_THRESHOLD",
            constants::DEFAULT_FAILURE_DETECTION_THRESHOLD,
        )?;
        ensure_unit("FAILURE_DETECTION_THRESHOLD", failure_detection_threshold)?;

        let inventory_alert_threshold = parse_var(
            &lookup,
            "INVENTORY_ALERT_THRESHOLD",
            constants::DEFAULT_INVENTORY_ALERT_THRESHOLD,
        )?;
        ensure_unit("INVENTORY_ALERT_THRESHOLD", inventory_alert_threshold)?;

        let frame_warmup_seconds = parse_var(
            &lookup,
            "FRAME_WARMUP_SECONDS",
            constants::DEFAULT_FRAME_WARMUP_SECONDS,
        )?;
        let frame_interval_seconds = parse_var(
            &lookup,
            "FRAME_INTERVAL_SECONDS",
            constants::DEFAULT_FRAME_INTERVAL_SECONDS,
        )?;

        let base = parse_var(
            &lookup,
            "DETECTION_COOLDOWN_SECONDS",
            constants::DEFAULT_COOLDOWN_SECONDS,
        )?;
        let cooldowns = CooldownPolicy {
            stringing_seconds: parse_var(&lookup, "STRINGING_COOLDOWN_SECONDS", base)?,
            layer_separation_seconds: parse_var(
                &lookup,
                "LAYER_SEPARATION_COOLDOWN_SECONDS",
                base,
            )?,
            warping_seconds: parse_var(&lookup, "WARPING_COOLDOWN_SECONDS", base)?,
            blob_seconds: parse_var(&lookup, "BLOB_COOLDOWN_SECONDS", base)?,
        };

        Ok(Self {
            failure_detection_threshold,
            inventory_alert_threshold,
            frame_warmup_seconds,
            frame_interval_seconds,
            cooldowns,
            analyzer: AnalyzerConfig::default(),
        })
    }
}

/// Per-failure-type duplicate suppression intervals, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub stringing_seconds: u64,
    pub layer_separation_seconds: u64,
    pub warping_seconds: u64,
    pub blob_seconds: u64,
}

impl CooldownPolicy {
    /// Same interval for every failure type.
    pub fn uniform(seconds: u64) -> Self {
        Self {
            stringing_seconds: seconds,
            layer_separation_seconds: seconds,
            warping_seconds: seconds,
            blob_seconds: seconds,
        }
    }

    pub fn cooldown_for(&self, failure_type: FailureType) -> chrono::Duration {
        let seconds = match failure_type {
            FailureType::None => 0,
            FailureType::Stringing => self.stringing_seconds,
            FailureType::LayerSeparation => self.layer_separation_seconds,
            FailureType::Warping => self.warping_seconds,
            FailureType::Blob => self.blob_seconds,
        };
        chrono::Duration::seconds(seconds.min(constants::MAX_COOLDOWN_SECONDS) as i64)
    }
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self::uniform(constants::DEFAULT_COOLDOWN_SECONDS)
    }
}

/// Tuning constants for the four image heuristics.
///
/// Distances and areas are in pixels of the working image, i.e. after the
/// frame has been downscaled to `max_dimension`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerConfig {
    /// Longest side of the working image. Larger frames are downscaled.
    pub max_dimension: u32,
    /// Intensity standard deviation below which a frame counts as flat.
    pub flat_frame_stddev: f32,
    pub canny_low: f32,
    pub canny_high: f32,
    /// Fraction of the envelope size used to shrink it (edge density) or
    /// grow it (stringing exclusion).
    pub envelope_margin: f32,
    /// Outer contours smaller than this fraction of the largest one do not
    /// contribute to the silhouette.
    pub silhouette_min_area_fraction: f32,
    /// Interior edge density that maps to full warping confidence.
    pub edge_density_saturation: f32,
    pub hough_vote_threshold: u32,
    pub hough_suppression_radius: u32,
    pub min_string_length: u32,
    pub max_line_gap: u32,
    /// Segments closer than this to horizontal are not stringing candidates.
    pub string_min_angle_degrees: f32,
    pub strings_for_full_confidence: u32,
    pub blob_min_area: f32,
    pub blob_max_area: f32,
    pub blob_min_circularity: f32,
    pub blobs_for_full_confidence: u32,
    /// A row is part of a gap band when its fill is below this fraction of
    /// the median row fill.
    pub gap_fill_ratio: f32,
    /// Gap band height, as a fraction of silhouette height, that maps to
    /// full layer-separation confidence.
    pub gap_fraction_for_full_confidence: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_dimension: 640,
            flat_frame_stddev: 2.0,
            canny_low: 50.0,
            canny_high: 150.0,
            envelope_margin: 0.05,
            silhouette_min_area_fraction: 0.1,
            edge_density_saturation: 0.12,
            hough_vote_threshold: 40,
            hough_suppression_radius: 8,
            min_string_length: 30,
            max_line_gap: 10,
            string_min_angle_degrees: 15.0,
            strings_for_full_confidence: 5,
            blob_min_area: 100.0,
            blob_max_area: 10_000.0,
            blob_min_circularity: 0.3,
            blobs_for_full_confidence: 4,
            gap_fill_ratio: 0.5,
            gap_fraction_for_full_confidence: 0.1,
        }
    }
}

/// Settings for the monitoring binary, which plays the frame-acquisition
/// collaborator for a single job.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Camera image URLs, fetched round-robin.
    /// Environment variable: `IMAGE_URL` (comma-separated, required)
    pub image_urls: Vec<String>,

    /// Discord webhook for failure and inventory notifications. When unset,
    /// notifications are only logged.
    /// Environment variable: `DISCORD_WEBHOOK`
    pub discord_webhook: Option<String>,

    /// Environment variable: `PRINTER_NAME` (default: "printer-1")
    pub printer_name: String,

    /// Environment variable: `JOB_ID` (generated when unset)
    pub job_id: Option<String>,

    /// Environment variable: `PART_NAME` (default: "unnamed part")
    pub part_name: String,

    /// Environment variable: `SPOOL_ID` (default: "SPOOL_1")
    pub spool_id: String,

    /// Environment variable: `MATERIAL_TYPE` (default: "PLA")
    pub material_type: String,

    /// Environment variable: `SPOOL_CAPACITY_G` (default: "1000")
    pub spool_capacity_grams: f32,

    /// Environment variable: `SPOOL_REMAINING_G` (default: full spool)
    pub spool_remaining_grams: Option<f32>,

    /// Environment variable: `JOB_MATERIAL_G` (optional estimate)
    pub job_material_grams: Option<f32>,

    /// Flip frames vertically for cameras mounted upside-down.
    /// Environment variable: `FLIP_IMAGE` (default: "false")
    pub flip_image: bool,
}

impl MonitorConfig {
    /// Load monitor settings from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let image_urls: Vec<String> = lookup("IMAGE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar {
                var_name: "IMAGE_URL".to_string(),
            })?
            .split(',')
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if image_urls.is_empty() {
            return Err(ConfigError::invalid(
                "IMAGE_URL",
                "",
                "at least one URL is required",
            ));
        }

        let spool_capacity_grams = parse_var(
            &lookup,
            "SPOOL_CAPACITY_G",
            constants::DEFAULT_SPOOL_CAPACITY_GRAMS,
        )?;
        if spool_capacity_grams.is_nan() || spool_capacity_grams <= 0.0 {
            return Err(ConfigError::invalid(
                "SPOOL_CAPACITY_G",
                spool_capacity_grams,
                "must be positive",
            ));
        }

        Ok(Self {
            image_urls,
            discord_webhook: lookup("DISCORD_WEBHOOK").filter(|url| !url.trim().is_empty()),
            printer_name: lookup("PRINTER_NAME").unwrap_or_else(|| "printer-1".to_string()),
            job_id: lookup("JOB_ID"),
            part_name: lookup("PART_NAME").unwrap_or_else(|| "unnamed part".to_string()),
            spool_id: lookup("SPOOL_ID").unwrap_or_else(|| "SPOOL_1".to_string()),
            material_type: lookup("MATERIAL_TYPE").unwrap_or_else(|| "PLA".to_string()),
            spool_capacity_grams,
            spool_remaining_grams: parse_optional(&lookup, "SPOOL_REMAINING_G")?,
            job_material_grams: parse_optional(&lookup, "JOB_MATERIAL_G")?,
            flip_image: parse_var(&lookup, "FLIP_IMAGE", false)?,
        })
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::invalid(name, &raw, e.to_string())),
        None => Ok(default),
    }
}

fn parse_optional<F, T>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::invalid(name, &raw, e.to_string()))
        })
        .transpose()
}

fn ensure_unit(name: &str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(name, value, "must be within [0, 1]"))
    }
}

/// Application constants used throughout the system.
pub mod constants {
    /// Maximum number of retry attempts when fetching images fails.
    pub const MAX_RETRIES: u32 = 15;

    /// Delay between retry attempts in seconds.
    pub const RETRY_DELAY_SECONDS: u64 = 15;

    pub const DEFAULT_FAILURE_DETECTION_THRESHOLD: f32 = 0.7;

    pub const DEFAULT_INVENTORY_ALERT_THRESHOLD: f32 = 0.15;

    pub const DEFAULT_FRAME_WARMUP_SECONDS: u64 = 10;

    pub const DEFAULT_FRAME_INTERVAL_SECONDS: u64 = 30;

    /// Default duplicate-suppression interval for every failure type.
    pub const DEFAULT_COOLDOWN_SECONDS: u64 = 300;

    /// Upper bound applied to configured cooldowns (one year).
    pub const MAX_COOLDOWN_SECONDS: u64 = 365 * 24 * 3600;

    pub const DEFAULT_SPOOL_CAPACITY_GRAMS: f32 = 1000.0;
}
