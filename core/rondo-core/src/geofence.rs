//! Decides which location deltas are worth broadcasting and when arrival
//! has happened. Conservative rules: when in doubt, don't spend a
//! notification.

use serde::Serialize;
use tracing::{debug, info};

/// A WGS-84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Great-circle distance in meters (haversine on the mean earth radius).
pub fn distance_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TravelMode {
    Walking,
    Driving,
}

/// What to do with one observed position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Delta met the movement threshold; worth a notification.
    Broadcast,
    /// Within the arrival tolerance of the round-up point. Terminal: every
    /// later observation is ignored.
    Arrived,
    /// Not worth a notification.
    Ignore,
}

/// One-shot warning that the journey is long enough to force a coarser
/// movement threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LongJourneyNotice {
    pub distance_m: f64,
    pub new_threshold_m: f64,
}

/// Movement threshold defaults in meters, per travel mode.
pub const DEFAULT_WALKING_THRESHOLD_M: f64 = 25.0;
pub const DEFAULT_DRIVING_THRESHOLD_M: f64 = 250.0;

/// A position within this distance of the round-up point counts as arrived.
pub const ARRIVAL_TOLERANCE_M: f64 = 50.0;

/// Budget for notifications over one journey, held conservatively below the
/// push transport's 500/day device quota.
pub const SAFE_NOTIFICATION_CEILING: f64 = 400.0;

#[derive(Debug)]
pub struct GeofenceThrottle {
    mode: TravelMode,
    walking_threshold_m: f64,
    driving_threshold_m: f64,
    round_up: Option<GeoPoint>,
    last_broadcast: Option<GeoPoint>,
    arrived: bool,
    journey_planned: bool,
}

impl GeofenceThrottle {
    pub fn new(mode: TravelMode) -> Self {
        Self {
            mode,
            walking_threshold_m: DEFAULT_WALKING_THRESHOLD_M,
            driving_threshold_m: DEFAULT_DRIVING_THRESHOLD_M,
            round_up: None,
            last_broadcast: None,
            arrived: false,
            journey_planned: false,
        }
    }

    pub fn set_mode(&mut self, mode: TravelMode) {
        self.mode = mode;
    }

    /// Current movement threshold for the active travel mode.
    pub fn threshold_m(&self) -> f64 {
        match self.mode {
            TravelMode::Walking => self.walking_threshold_m,
            TravelMode::Driving => self.driving_threshold_m,
        }
    }

    pub fn round_up_point(&self) -> Option<GeoPoint> {
        self.round_up
    }

    pub fn set_round_up_point(&mut self, point: GeoPoint) {
        self.round_up = Some(point);
    }

    /// Back to per-mode defaults and a fresh journey. Called on any session
    /// reset.
    pub fn reset(&mut self) {
        self.walking_threshold_m = DEFAULT_WALKING_THRESHOLD_M;
        self.driving_threshold_m = DEFAULT_DRIVING_THRESHOLD_M;
        self.round_up = None;
        self.last_broadcast = None;
        self.arrived = false;
        self.journey_planned = false;
    }

    /// Classifies one observed position. The first fix always broadcasts so
    /// the inviter sees the invitee promptly.
    pub fn observe(&mut self, position: GeoPoint) -> Decision {
        if self.arrived {
            return Decision::Ignore;
        }

        if let Some(point) = self.round_up {
            let remaining = distance_meters(position, point);
            if remaining <= ARRIVAL_TOLERANCE_M {
                info!(remaining_m = remaining, "within arrival tolerance");
                self.arrived = true;
                return Decision::Arrived;
            }
        }

        match self.last_broadcast {
            None => {
                self.last_broadcast = Some(position);
                Decision::Broadcast
            }
            Some(previous) => {
                let delta = distance_meters(previous, position);
                if delta >= self.threshold_m() {
                    self.last_broadcast = Some(position);
                    Decision::Broadcast
                } else {
                    debug!(
                        delta_m = delta,
                        threshold_m = self.threshold_m(),
                        "delta below movement threshold"
                    );
                    Decision::Ignore
                }
            }
        }
    }

    /// Adapts the movement threshold when the whole journey would exceed the
    /// safe notification budget. Fires the notice at most once per journey.
    pub fn plan_journey(&mut self, distance_to_point_m: f64) -> Option<LongJourneyNotice> {
        if self.journey_planned || distance_to_point_m <= 0.0 {
            return None;
        }
        self.journey_planned = true;

        let estimated = distance_to_point_m / self.threshold_m();
        if estimated <= SAFE_NOTIFICATION_CEILING {
            return None;
        }

        let adapted = round2(distance_to_point_m / SAFE_NOTIFICATION_CEILING);
        match self.mode {
            TravelMode::Walking => self.walking_threshold_m = adapted,
            TravelMode::Driving => self.driving_threshold_m = adapted,
        }
        info!(
            distance_m = distance_to_point_m,
            threshold_m = adapted,
            "long journey; movement threshold adapted"
        );

        Some(LongJourneyNotice {
            distance_m: distance_to_point_m,
            new_threshold_m: adapted,
        })
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONDON: GeoPoint = GeoPoint {
        latitude: 51.50,
        longitude: -0.12,
    };

    /// Roughly `meters` north of `from` (1 deg latitude ~= 111.32 km).
    fn north_of(from: GeoPoint, meters: f64) -> GeoPoint {
        GeoPoint::new(from.latitude + meters / 111_320.0, from.longitude)
    }

    #[test]
    fn haversine_matches_known_distance() {
        // London -> Paris is ~343.5 km.
        let paris = GeoPoint::new(48.8566, 2.3522);
        let d = distance_meters(LONDON, paris);
        assert!((d - 343_500.0).abs() < 2_000.0, "got {d}");
    }

    #[test]
    fn first_fix_always_broadcasts() {
        let mut throttle = GeofenceThrottle::new(TravelMode::Walking);
        throttle.set_round_up_point(north_of(LONDON, 5_000.0));
        assert_eq!(throttle.observe(LONDON), Decision::Broadcast);
    }

    #[test]
    fn small_delta_is_ignored_until_threshold() {
        let mut throttle = GeofenceThrottle::new(TravelMode::Walking);
        throttle.set_round_up_point(north_of(LONDON, 5_000.0));
        assert_eq!(throttle.observe(LONDON), Decision::Broadcast);

        assert_eq!(throttle.observe(north_of(LONDON, 10.0)), Decision::Ignore);
        assert_eq!(
            throttle.observe(north_of(LONDON, 30.0)),
            Decision::Broadcast
        );
    }

    #[test]
    fn delta_measures_from_last_broadcast_not_last_sample() {
        let mut throttle = GeofenceThrottle::new(TravelMode::Walking);
        throttle.set_round_up_point(north_of(LONDON, 5_000.0));
        throttle.observe(LONDON);

        // Three 10 m steps: the third crosses the 25 m threshold measured
        // from the broadcast position, not from the previous sample.
        assert_eq!(throttle.observe(north_of(LONDON, 10.0)), Decision::Ignore);
        assert_eq!(throttle.observe(north_of(LONDON, 20.0)), Decision::Ignore);
        assert_eq!(
            throttle.observe(north_of(LONDON, 30.0)),
            Decision::Broadcast
        );
    }

    #[test]
    fn arrival_within_tolerance_is_terminal() {
        let point = north_of(LONDON, 5_000.0);
        let mut throttle = GeofenceThrottle::new(TravelMode::Walking);
        throttle.set_round_up_point(point);

        assert_eq!(throttle.observe(LONDON), Decision::Broadcast);
        assert_eq!(throttle.observe(north_of(point, 20.0)), Decision::Arrived);
        // Everything after arrival is ignored, even big moves.
        assert_eq!(throttle.observe(LONDON), Decision::Ignore);
    }

    #[test]
    fn arrival_beats_broadcast_when_both_apply() {
        let point = north_of(LONDON, 5_000.0);
        let mut throttle = GeofenceThrottle::new(TravelMode::Walking);
        throttle.set_round_up_point(point);
        throttle.observe(LONDON);

        // A jump straight into the tolerance zone is an arrival, not a
        // location broadcast.
        assert_eq!(throttle.observe(point), Decision::Arrived);
    }

    #[test]
    fn short_journey_keeps_default_threshold() {
        let mut throttle = GeofenceThrottle::new(TravelMode::Walking);
        assert!(throttle.plan_journey(2_000.0).is_none());
        assert_eq!(throttle.threshold_m(), DEFAULT_WALKING_THRESHOLD_M);
    }

    #[test]
    fn long_journey_adapts_threshold_to_the_ceiling() {
        let mut throttle = GeofenceThrottle::new(TravelMode::Walking);
        // 100 km walking at 25 m per notification would be 4000
        // notifications; the adapted threshold is 100000/400 = 250 m.
        let notice = throttle.plan_journey(100_000.0).expect("notice fires");
        assert_eq!(notice.new_threshold_m, 250.0);
        assert_eq!(throttle.threshold_m(), 250.0);
    }

    #[test]
    fn long_journey_notice_fires_once_per_journey() {
        let mut throttle = GeofenceThrottle::new(TravelMode::Driving);
        assert!(throttle.plan_journey(500_000.0).is_some());
        assert!(throttle.plan_journey(500_000.0).is_none());

        throttle.reset();
        assert_eq!(throttle.threshold_m(), DEFAULT_DRIVING_THRESHOLD_M);
        assert!(throttle.plan_journey(500_000.0).is_some());
    }

    #[test]
    fn adapted_threshold_rounds_to_centimeters() {
        let mut throttle = GeofenceThrottle::new(TravelMode::Walking);
        let notice = throttle.plan_journey(10_001.0).expect("notice fires");
        assert_eq!(notice.new_threshold_m, 25.0);
    }

    #[test]
    fn threshold_adaptation_is_per_mode() {
        let mut throttle = GeofenceThrottle::new(TravelMode::Walking);
        throttle.plan_journey(100_000.0);
        throttle.set_mode(TravelMode::Driving);
        assert_eq!(throttle.threshold_m(), DEFAULT_DRIVING_THRESHOLD_M);
    }
}
