use geo::{GeodesicDistance, Point};
use serde::{Deserialize, Serialize};

/// A single position fix as delivered by the location provider.
///
/// `accuracy` is the horizontal accuracy radius in meters; any negative value
/// marks the fix as invalid. `speed` is `None` when the provider could not
/// measure it. `timestamp` is seconds (monotonic or wall clock, but consistent
/// within one stream).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    #[serde(default)]
    pub speed: Option<f64>,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64, speed: Option<f64>, timestamp: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            accuracy,
            speed,
        }
    }

    pub fn has_valid_accuracy(&self) -> bool {
        self.accuracy >= 0.0 && self.accuracy.is_finite()
    }

    /// Speed in m/s, with unknown or negative readings treated as zero.
    pub fn speed_or_zero(&self) -> f64 {
        self.speed.filter(|s| s.is_finite() && *s > 0.0).unwrap_or(0.0)
    }

    /// Geodesic (WGS84 ellipsoid) distance to another fix, in meters.
    pub fn distance_to(&self, other: &LocationSample) -> f64 {
        geodesic_distance(self.latitude, self.longitude, other.latitude, other.longitude)
    }

    /// Seconds elapsed since `earlier`. Negative when the stream runs backwards.
    pub fn seconds_since(&self, earlier: &LocationSample) -> f64 {
        self.timestamp - earlier.timestamp
    }
}

pub fn geodesic_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let a = Point::new(lon1, lat1);
    let b = Point::new(lon2, lat2);
    a.geodesic_distance(&b)
}

/// Context a fix was captured in. Selects which accuracy threshold applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LocationType {
    MotionChange,
    Tracking,
    Current,
    Sample,
    Watch,
    Geofence,
    Polygon,
    Heartbeat,
    MotionState,
    Odometer,
    Stream,
}

impl LocationType {
    pub fn is_odometer(self) -> bool {
        matches!(self, LocationType::Odometer)
    }
}

/// Tracking strategy of the host. Distance only accumulates in `Location` mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackingMode {
    Geofence,
    Location,
}
