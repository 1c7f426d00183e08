use serde::{Deserialize, Serialize};

pub const MIN_LATITUDE: f64 = -90.0;
pub const MAX_LATITUDE: f64 = 90.0;
pub const MIN_LONGITUDE: f64 = -180.0;
pub const MAX_LONGITUDE: f64 = 180.0;

pub const DEFAULT_PORT: u16 = 5050;
pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 5;

pub const REPORT_PATH: &str = "/update-position";
pub const USERS_PATH: &str = "/get-users";
pub const CHANNEL_PATH: &str = "/ws";
pub const SNAPSHOT_PATH: &str = "/snapshot";

/// A fully populated position fix.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
}

impl Location {
    pub fn new(lat: f64, lng: f64, accuracy: f64) -> Self {
        Self { lat, lng, accuracy }
    }

    /// Returns a description of the first out-of-range field, if any.
    pub fn range_error(&self) -> Option<String> {
        if !self.lat.is_finite() || !(MIN_LATITUDE..=MAX_LATITUDE).contains(&self.lat) {
            return Some(format!(
                "lat {} outside [{}, {}]",
                self.lat, MIN_LATITUDE, MAX_LATITUDE
            ));
        }
        if !self.lng.is_finite() || !(MIN_LONGITUDE..=MAX_LONGITUDE).contains(&self.lng) {
            return Some(format!(
                "lng {} outside [{}, {}]",
                self.lng, MIN_LONGITUDE, MAX_LONGITUDE
            ));
        }
        if !self.accuracy.is_finite() || self.accuracy < 0.0 {
            return Some(format!("accuracy {} must be >= 0", self.accuracy));
        }
        None
    }

    pub fn is_valid(&self) -> bool {
        self.range_error().is_none()
    }
}

/// Position report as posted by a reporting device.
///
/// Every field is optional on the wire so that missing values can be
/// reported back as a validation error rather than a decode failure.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PositionReport {
    #[serde(default, alias = "user_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
}

impl PositionReport {
    pub fn new(id: impl Into<String>, lat: f64, lng: f64) -> Self {
        Self {
            id: Some(id.into()),
            lat: Some(lat),
            lng: Some(lng),
            accuracy: None,
            online: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    pub fn with_online(mut self, online: bool) -> Self {
        self.online = Some(online);
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Error,
}

/// Body returned by the ingress endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReportResponse {
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReportResponse {
    pub fn success() -> Self {
        Self {
            status: ReportStatus::Success,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Error,
            message: Some(message.into()),
        }
    }
}

/// Public view of one entity, as returned by the query endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PresenceView {
    pub id: String,
    pub location: Option<Location>,
    pub online: bool,
}

/// Events pushed over the realtime channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ChannelMessage {
    Message {
        msg: String,
    },
    LocationUpdate {
        id: String,
        lat: f64,
        lng: f64,
        accuracy: f64,
        online: bool,
    },
}

impl ChannelMessage {
    pub fn connected() -> Self {
        ChannelMessage::Message {
            msg: "connected".to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
