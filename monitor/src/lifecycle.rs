//! Device inventory lifecycle.
//!
//! Transitions are applied to an in-memory `Device`; the stores wrap this in
//! their own atomic load/update/log sequence.

use chrono::{DateTime, Utc};

use crate::errors::{Error, Result};
use crate::model::{Device, DeviceStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Deploy { location: String },
    Recall { location: Option<String> },
    Maintenance,
    Reserve,
    Retire,
    /// Administrative override, no source-state check.
    SetStatus {
        status: DeviceStatus,
        location: Option<String>,
    },
}

impl Action {
    /// Name recorded in the device log.
    pub fn log_name(&self) -> &'static str {
        match self {
            Action::Deploy { .. } => "deployed",
            Action::Recall { .. } => "recalled",
            Action::Maintenance => "maintenance",
            Action::Reserve => "reserved",
            Action::Retire => "retired",
            Action::SetStatus { .. } => "status_change",
        }
    }

    fn allowed_from(&self) -> &'static [DeviceStatus] {
        use DeviceStatus::*;
        match self {
            Action::Deploy { .. } => &[InStock, Reserved, Maintenance],
            Action::Recall { .. } => &[Deployed],
            Action::Maintenance => &[InStock, Reserved, Deployed, Maintenance],
            Action::Reserve => &[InStock],
            Action::Retire | Action::SetStatus { .. } => DeviceStatus::ALL,
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Action::Deploy { .. } => "deployed",
            Action::Recall { .. } => "recalled",
            Action::Maintenance => "sent to maintenance",
            Action::Reserve => "reserved",
            Action::Retire => "retired",
            Action::SetStatus { .. } => "updated",
        }
    }
}

fn quoted_list(statuses: &[DeviceStatus]) -> String {
    let quoted: Vec<String> = statuses.iter().map(|s| format!("'{}'", s)).collect();
    match quoted.len() {
        0 => String::new(),
        1 => quoted[0].clone(),
        2 => format!("{} or {}", quoted[0], quoted[1]),
        n => format!("{}, or {}", quoted[..n - 1].join(", "), quoted[n - 1]),
    }
}

/// Applies `action` to `device`. On error the device is left untouched.
pub fn apply(device: &mut Device, action: &Action, now: DateTime<Utc>) -> Result<()> {
    let allowed = action.allowed_from();
    if !allowed.contains(&device.status) {
        return Err(Error::InvalidState(format!(
            "Device cannot be {}. It must be in {} status.",
            action.verb(),
            quoted_list(allowed)
        )));
    }

    match action {
        Action::Deploy { location } => {
            if location.trim().is_empty() {
                return Err(Error::Validation(
                    "Deployment location cannot be empty".to_string(),
                ));
            }
            device.status = DeviceStatus::Deployed;
            device.location = Some(location.clone());
            device.deploy_date = Some(now);
        }
        Action::Recall { location } => {
            device.status = DeviceStatus::InStock;
            if let Some(location) = location {
                device.location = Some(location.clone());
            }
            device.deploy_date = None;
        }
        Action::Maintenance => {
            device.status = DeviceStatus::Maintenance;
            device.last_maintenance_date = Some(now);
        }
        Action::Reserve => device.status = DeviceStatus::Reserved,
        Action::Retire => device.status = DeviceStatus::Retired,
        Action::SetStatus { status, location } => {
            device.status = *status;
            if let Some(location) = location {
                device.location = Some(location.clone());
            }
        }
    }

    device.updated_at = now;
    Ok(())
}
