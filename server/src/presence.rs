use fleetcast_shared::{ChannelMessage, Location, PresenceView};
use serde::{Deserialize, Serialize};

/// Authoritative presence state of one entity.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PresenceRecord {
    pub id: String,
    /// Absent until the first accepted report
    pub location: Option<Location>,
    pub online: bool,
    /// Wall-clock milliseconds of the most recent accepted write
    pub last_seen: u64,
}

impl PresenceRecord {
    pub fn new(id: impl Into<String>, location: Location, online: bool, last_seen: u64) -> Self {
        Self {
            id: id.into(),
            location: Some(location),
            online,
            last_seen,
        }
    }

    /// Strips internal fields for the public query surface.
    pub fn to_view(&self) -> PresenceView {
        PresenceView {
            id: self.id.clone(),
            location: self.location,
            online: self.online,
        }
    }
}

/// Emitted once per committed presence change and handed to the broadcast hub.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PresenceEvent {
    pub id: String,
    pub location: Location,
    pub online: bool,
    pub last_seen: u64,
}

impl PresenceEvent {
    /// Returns None for records that have never carried a location.
    pub fn from_record(record: &PresenceRecord) -> Option<Self> {
        record.location.map(|location| Self {
            id: record.id.clone(),
            location,
            online: record.online,
            last_seen: record.last_seen,
        })
    }

    pub fn to_message(&self) -> ChannelMessage {
        ChannelMessage::LocationUpdate {
            id: self.id.clone(),
            lat: self.location.lat,
            lng: self.location.lng,
            accuracy: self.location.accuracy,
            online: self.online,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_omits_last_seen() {
        let record = PresenceRecord::new("u1", Location::new(10.0, 20.0, 0.0), true, 1234);
        let view = serde_json::to_value(record.to_view()).unwrap();

        assert_eq!(view["id"], "u1");
        assert_eq!(view["online"], true);
        assert!(view.get("last_seen").is_none());
    }

    #[test]
    fn test_event_from_record_without_location() {
        let record = PresenceRecord {
            id: "ghost".to_string(),
            location: None,
            online: false,
            last_seen: 0,
        };
        assert!(PresenceEvent::from_record(&record).is_none());
    }

    #[test]
    fn test_event_to_message() {
        let record = PresenceRecord::new("u2", Location::new(-5.0, -5.0, 3.0), true, 99);
        let event = PresenceEvent::from_record(&record).unwrap();

        assert_eq!(
            event.to_message(),
            ChannelMessage::LocationUpdate {
                id: "u2".to_string(),
                lat: -5.0,
                lng: -5.0,
                accuracy: 3.0,
                online: true,
            }
        );
    }
}
