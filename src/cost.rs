//! # Cost Model
//!
//! Deterministic cost/savings computation from timing and size inputs.
//! No I/O, no clocks, no shared state — every function here is a pure
//! mapping so the numbers are independently unit-testable.
//!
//! ## The comparison:
//! - `cloud_api_cost` is what the cloud API charges (or would charge) for the
//!   audio duration at the configured per-minute rate
//! - `local_compute_cost` is the amortized hardware cost of the measured
//!   processing time at the configured per-second rate
//! - `savings` is always their difference; `savings_percentage` is defined as
//!   0 when `cloud_api_cost` is 0 so nothing ever divides by zero
//!
//! The serialized field names are a wire contract with the frontend and must
//! not change.

use crate::config::CostConfig;
use crate::providers::ProviderKind;
use serde::{Deserialize, Serialize};

/// Comparative cost metrics attached to every finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub audio_duration_seconds: f64,
    pub audio_duration_minutes: f64,
    pub file_size_bytes: u64,
    pub file_size_mb: f64,
    pub processing_time_seconds: f64,
    /// Audio seconds transcribed per processing second. Reported as the
    /// sentinel 0.0 when processing time is zero (JSON has no infinity).
    pub processing_speed_ratio: f64,
    pub cloud_api_cost: f64,
    pub local_compute_cost: f64,
    pub savings: f64,
    pub savings_percentage: f64,
}

/// Compute the comparative breakdown for one transcription run.
///
/// For dual-provider jobs the caller passes the local side's processing time:
/// the breakdown answers "what did local compute cost versus what the cloud
/// charges for this audio".
pub fn breakdown(
    rates: &CostConfig,
    duration_seconds: f64,
    file_size_bytes: u64,
    processing_time_seconds: f64,
) -> CostBreakdown {
    let duration_minutes = duration_seconds / 60.0;
    let cloud_api_cost = round_money(duration_minutes * rates.cloud_rate_per_minute);
    let local_compute_cost = round_money(processing_time_seconds * rates.local_rate_per_second);

    // Exact identity by construction: savings is the difference of the two
    // rounded figures, never independently rounded
    let savings = cloud_api_cost - local_compute_cost;
    let savings_percentage = if cloud_api_cost == 0.0 {
        0.0
    } else {
        round2(savings / cloud_api_cost * 100.0)
    };

    let processing_speed_ratio = if processing_time_seconds == 0.0 {
        0.0
    } else {
        round2(duration_seconds / processing_time_seconds)
    };

    CostBreakdown {
        audio_duration_seconds: duration_seconds,
        audio_duration_minutes: round2(duration_minutes),
        file_size_bytes,
        file_size_mb: round2(file_size_bytes as f64 / (1024.0 * 1024.0)),
        processing_time_seconds,
        processing_speed_ratio,
        cloud_api_cost,
        local_compute_cost,
        savings,
        savings_percentage,
    }
}

/// The actual cost of one provider run, attached to its `ProviderResult`.
///
/// Local runs bill processing time at the local rate; cloud runs bill audio
/// duration at the cloud per-minute rate.
pub fn run_cost(
    rates: &CostConfig,
    provider: ProviderKind,
    duration_seconds: f64,
    processing_time_seconds: f64,
) -> f64 {
    match provider {
        ProviderKind::Local => round_money(processing_time_seconds * rates.local_rate_per_second),
        ProviderKind::Cloud => round_money(duration_seconds / 60.0 * rates.cloud_rate_per_minute),
    }
}

/// Monetary values keep 6 decimal places (sub-cent rates times short clips
/// produce very small numbers).
fn round_money(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
