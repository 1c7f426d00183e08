//! Report validation and application
//!
//! The updater is the only write path into the presence store. A report is
//! either fully validated, durably committed and published, or rejected
//! with no effect. It also owns the optional staleness policy that demotes
//! entities which have stopped reporting.

use crate::error::{PresenceError, Result};
use crate::hub::BroadcastHub;
use crate::presence::PresenceEvent;
use crate::store::PresenceStore;
use crate::utils::get_timestamp;
use fleetcast_shared::{Location, PositionReport};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// A report that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidReport {
    pub id: String,
    pub location: Location,
    pub online: bool,
}

/// Checks a raw report and fills in defaults: accuracy 0, online true.
pub fn validate_report(report: &PositionReport) -> Result<ValidReport> {
    let id = match report.id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return Err(PresenceError::InvalidReport("missing id".to_string())),
    };

    let (lat, lng) = match (report.lat, report.lng) {
        (Some(lat), Some(lng)) => (lat, lng),
        _ => {
            return Err(PresenceError::InvalidReport(
                "missing lat or lng".to_string(),
            ))
        }
    };

    let location = Location::new(lat, lng, report.accuracy.unwrap_or(0.0));
    if let Some(reason) = location.range_error() {
        return Err(PresenceError::InvalidReport(reason));
    }

    Ok(ValidReport {
        id,
        location,
        online: report.online.unwrap_or(true),
    })
}

pub struct PresenceUpdater {
    store: Arc<PresenceStore>,
    hub: Arc<BroadcastHub>,
    staleness: Option<Duration>,
}

impl PresenceUpdater {
    pub fn new(store: Arc<PresenceStore>, hub: Arc<BroadcastHub>) -> Self {
        Self {
            store,
            hub,
            staleness: None,
        }
    }

    /// Enables time-based offline detection.
    pub fn with_staleness(mut self, staleness: Option<Duration>) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn staleness(&self) -> Option<Duration> {
        self.staleness
    }

    /// Applies `report` stamped with the current wall clock.
    pub async fn apply(&self, report: &PositionReport) -> Result<PresenceEvent> {
        self.apply_at(report, get_timestamp()).await
    }

    pub async fn apply_at(&self, report: &PositionReport, timestamp: u64) -> Result<PresenceEvent> {
        let report = validate_report(report).map_err(|e| {
            warn!("Rejected report: {}", e);
            e
        })?;

        let hub = &self.hub;
        let mut event = None;
        let record = self
            .store
            .upsert_and_then(
                &report.id,
                report.location,
                report.online,
                timestamp,
                |record| {
                    if let Some(committed) = PresenceEvent::from_record(record) {
                        hub.publish(&committed);
                        event = Some(committed);
                    }
                },
            )
            .await
            .map_err(|e| match e {
                PresenceError::Validation(reason) => PresenceError::InvalidReport(reason),
                other => other,
            })?;

        debug!(
            "Applied report for {} at ({:.5}, {:.5}), online={}",
            record.id, report.location.lat, report.location.lng, record.online
        );

        // Records written by upsert always carry a location
        event.ok_or_else(|| PresenceError::Validation(format!("{} has no location", record.id)))
    }

    /// Demotes every online entity not seen within the staleness window.
    ///
    /// Does nothing when no window is configured. Persistence failures are
    /// logged and the entity is retried on the next sweep.
    pub async fn sweep_stale(&self, now: u64) -> Vec<PresenceEvent> {
        let window = match self.staleness {
            Some(window) => window.as_millis() as u64,
            None => return Vec::new(),
        };
        let cutoff = now.saturating_sub(window);

        let candidates: Vec<String> = self
            .store
            .list()
            .into_iter()
            .filter(|r| r.online && r.last_seen < cutoff)
            .map(|r| r.id)
            .collect();

        let mut demoted = Vec::new();
        for id in candidates {
            let hub = &self.hub;
            let mut event = None;
            let result = self
                .store
                .mark_offline_if_stale(&id, cutoff, |record| {
                    if let Some(committed) = PresenceEvent::from_record(record) {
                        hub.publish(&committed);
                        event = Some(committed);
                    }
                })
                .await;

            match result {
                Ok(Some(_)) => {
                    info!("{} marked offline after {}ms without a report", id, window);
                    demoted.extend(event);
                }
                Ok(None) => {}
                Err(e) => warn!("Could not mark {} offline: {}", id, e),
            }
        }

        demoted
    }
}
