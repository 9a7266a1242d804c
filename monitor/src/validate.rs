use crate::errors::{Error, Result};
use crate::model::{DevicePatch, Metric, NewDevice, Telemetry};
use chrono::{DateTime, Duration, Utc};

const TEMP_MIN: f64 = -50.0;
const TEMP_MAX: f64 = 100.0;
const PERCENT_MIN: f64 = 0.0;
const PERCENT_MAX: f64 = 100.0;

const MAX_CLOCK_SKEW_SECS: i64 = 300;
const MAX_NAME_LEN: usize = 255;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;
/// Offsets are bound as BIGINT.
const MAX_OFFSET: usize = i64::MAX as usize;

fn range(metric: Metric) -> (f64, f64) {
    match metric {
        Metric::Temperature => (TEMP_MIN, TEMP_MAX),
        _ => (PERCENT_MIN, PERCENT_MAX),
    }
}

/// Validates a telemetry reading received at `now`
pub fn validate(telemetry: &Telemetry, now: DateTime<Utc>) -> Result<()> {
    if telemetry.device_id <= 0 {
        return Err(Error::Validation(format!(
            "Device ID {} must be positive",
            telemetry.device_id
        )));
    }

    let mut present = 0;
    for (metric, value) in telemetry.metrics() {
        let (min, max) = range(metric);
        // NaN fails `contains`, so it is rejected here too
        if !(min..=max).contains(&value) {
            return Err(Error::Validation(format!(
                "{} {} out of range [{}, {}]",
                metric.column(),
                value,
                min,
                max
            )));
        }
        present += 1;
    }

    if present == 0 {
        return Err(Error::Validation(
            "Telemetry must contain at least one metric".to_string(),
        ));
    }

    if telemetry.timestamp > now + Duration::seconds(MAX_CLOCK_SKEW_SECS) {
        return Err(Error::Validation(format!(
            "Timestamp {} is in the future",
            telemetry.timestamp.to_rfc3339()
        )));
    }

    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation("Device name cannot be empty".to_string()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(Error::Validation(format!(
            "Device name longer than {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

pub fn validate_new_device(device: &NewDevice) -> Result<()> {
    validate_name(&device.name)?;
    if device.serial_number.trim().is_empty() {
        return Err(Error::Validation("Serial number cannot be empty".to_string()));
    }
    Ok(())
}

pub fn validate_patch(patch: &DevicePatch) -> Result<()> {
    if let Some(name) = &patch.name {
        validate_name(name)?;
    }
    Ok(())
}

/// Resolves 1-based paging parameters into `(limit, offset)`.
pub fn page_bounds(page: Option<usize>, page_size: Option<usize>) -> Result<(usize, usize)> {
    let page = page.unwrap_or(1);
    let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE);

    if page < 1 {
        return Err(Error::Validation("page must be >= 1".to_string()));
    }
    if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(Error::Validation(format!(
            "page_size must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }

    let offset = (page - 1)
        .checked_mul(page_size)
        .filter(|offset| *offset <= MAX_OFFSET)
        .ok_or_else(|| Error::Validation(format!("page {} is out of range", page)))?;

    Ok((page_size, offset))
}

/// Rejects row offsets the database cannot address.
pub fn offset_bound(offset: Option<usize>) -> Result<usize> {
    let offset = offset.unwrap_or(0);
    if offset > MAX_OFFSET {
        return Err(Error::Validation(format!(
            "offset must be at most {}",
            MAX_OFFSET
        )));
    }
    Ok(offset)
}
