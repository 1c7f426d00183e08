//! Simulated device producing a random walk of position reports

use fleetcast_shared::{
    PositionReport, MAX_LATITUDE, MAX_LONGITUDE, MIN_LATITUDE, MIN_LONGITUDE,
};
use rand::Rng;

/// Generates successive positions for one simulated device.
pub struct RandomWalk {
    id: String,
    lat: f64,
    lng: f64,
    step_deg: f64,
    next_sequence: u32,
}

impl RandomWalk {
    pub fn new(id: impl Into<String>, lat: f64, lng: f64, step_deg: f64) -> Self {
        Self {
            id: id.into(),
            lat: lat.clamp(MIN_LATITUDE, MAX_LATITUDE),
            lng: lng.clamp(MIN_LONGITUDE, MAX_LONGITUDE),
            step_deg: step_deg.abs(),
            next_sequence: 1,
        }
    }

    pub fn position(&self) -> (f64, f64) {
        (self.lat, self.lng)
    }

    /// Number of reports produced so far.
    pub fn produced(&self) -> u32 {
        self.next_sequence - 1
    }

    /// Moves by up to `step_deg` on each axis and returns the new report.
    /// Coordinates are clamped so every report is in range.
    pub fn step<R: Rng>(&mut self, rng: &mut R) -> PositionReport {
        if self.step_deg > 0.0 {
            self.lat += rng.gen_range(-self.step_deg..=self.step_deg);
            self.lng += rng.gen_range(-self.step_deg..=self.step_deg);
        }
        self.lat = self.lat.clamp(MIN_LATITUDE, MAX_LATITUDE);
        self.lng = self.lng.clamp(MIN_LONGITUDE, MAX_LONGITUDE);
        self.next_sequence += 1;

        let accuracy = rng.gen_range(3.0..30.0);
        PositionReport::new(self.id.clone(), self.lat, self.lng).with_accuracy(accuracy)
    }
}
