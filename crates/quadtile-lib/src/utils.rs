//! Utility functions for coordinate conversions and tile arithmetic

use geo::Point;

/// Web Mercator bounds in meters (EPSG:3857)
pub const EARTH_MERCATOR_MAX: f64 = 20037508.34;

/// Maximum latitude that can be represented in Web Mercator
pub const MAX_LATITUDE: f64 = 85.05112878;

/// Mean earth radius used for great-circle distances
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Precomputed constant: EARTH_MERCATOR_MAX / 180.0
const LON_TO_X_FACTOR: f64 = EARTH_MERCATOR_MAX / 180.0;

/// Precomputed constant: EARTH_MERCATOR_MAX / PI
const Y_FACTOR: f64 = EARTH_MERCATOR_MAX / std::f64::consts::PI;

/// Convert WGS84 (lat, lon) to Web Mercator (x, y) in meters
///
/// Latitude is clamped to the representable Web Mercator range.
#[inline(always)]
pub fn wgs84_to_mercator(lat: f64, lon: f64) -> Point<f64> {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let x = lon * LON_TO_X_FACTOR;
    let lat_rad = lat.to_radians();
    let y = (lat_rad.tan() + (1.0 / lat_rad.cos())).ln() * Y_FACTOR;
    Point::new(x, y)
}

/// Great-circle distance in meters between two lon/lat points
#[inline]
pub fn haversine_distance(a: Point<f64>, b: Point<f64>) -> f64 {
    let lat1 = a.y().to_radians();
    let lat2 = b.y().to_radians();
    let dlat = lat2 - lat1;
    let dlon = (b.x() - a.x()).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().asin()
}

/// Smallest power of two greater than or equal to `value` (1 for 0)
#[inline]
pub fn next_pow2(value: u64) -> u64 {
    value.max(1).next_power_of_two()
}

/// Wrap a longitude into the hemisphere on the other side of the antimeridian
///
/// Eastern longitudes move to `lon - 360`, western ones to `lon + 360`.
#[inline]
pub fn wrap_to_other_hemisphere(lon: f64) -> f64 {
    if lon >= 0.0 { lon - 360.0 } else { lon + 360.0 }
}

/// Resolution level that best matches a view GSD for a dataset GSD
///
/// `ceil(max(log2(view_gsd / dataset_gsd) + bias, 0))`; coarser views select
/// higher (coarser) levels.
#[inline]
pub fn level_for_resolution(dataset_gsd: f64, view_gsd: f64, bias: f64) -> u32 {
    if !(dataset_gsd > 0.0) || !(view_gsd > 0.0) {
        return 0;
    }
    let scale = dataset_gsd / view_gsd;
    let level = ((1.0 / scale).log2() + bias).max(0.0).ceil();
    if level >= u32::MAX as f64 {
        u32::MAX
    } else {
        level as u32
    }
}

/// Angle of the vector (dx, dy) in degrees, normalized to [0, 360)
#[inline]
pub fn angle_degrees(dx: f64, dy: f64) -> f64 {
    let theta = dy.atan2(dx).to_degrees();
    if theta < 0.0 { theta + 360.0 } else { theta }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mercator_origin() {
        let p = wgs84_to_mercator(0.0, 0.0);
        assert!(p.x().abs() < 1e-6);
        assert!(p.y().abs() < 1e-6);
    }

    #[test]
    fn test_mercator_antimeridian() {
        let p = wgs84_to_mercator(0.0, 180.0);
        assert!((p.x() - EARTH_MERCATOR_MAX).abs() < 1e-3);
    }

    #[test]
    fn test_haversine_one_degree_at_equator() {
        let d = haversine_distance(Point::new(0.0, 0.0), Point::new(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 100.0, "got {d}");
    }

    #[test]
    fn test_next_pow2() {
        assert_eq!(next_pow2(0), 1);
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(3), 4);
        assert_eq!(next_pow2(16), 16);
        assert_eq!(next_pow2(17), 32);
    }

    #[test]
    fn test_level_for_resolution() {
        // Same resolution selects full resolution
        assert_eq!(level_for_resolution(1.0, 1.0, 0.0), 0);
        // Zoomed in further than the data selects full resolution
        assert_eq!(level_for_resolution(1.0, 0.25, 0.0), 0);
        assert_eq!(level_for_resolution(1.0, 2.0, 0.0), 1);
        assert_eq!(level_for_resolution(1.0, 3.0, 0.0), 2);
        assert_eq!(level_for_resolution(1.0, 8.0, 0.0), 3);
        // Bias shifts the transition
        assert_eq!(level_for_resolution(1.0, 2.0, 1.0), 2);
        assert_eq!(level_for_resolution(1.0, 0.0, 0.0), 0);
    }

    #[test]
    fn test_angle_degrees() {
        assert_eq!(angle_degrees(1.0, 0.0), 0.0);
        assert!((angle_degrees(0.0, 1.0) - 90.0).abs() < 1e-9);
        assert!((angle_degrees(0.0, -1.0) - 270.0).abs() < 1e-9);
    }

    #[test]
    fn test_wrap_to_other_hemisphere() {
        assert_eq!(wrap_to_other_hemisphere(170.0), -190.0);
        assert_eq!(wrap_to_other_hemisphere(-170.0), 190.0);
    }
}
