// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Great-circle geometry.

use crate::config::EARTH_RADIUS_KM;

/// Haversine great-circle distance in kilometers.
#[must_use]
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let lat1 = lat1.to_radians();
    let lat2 = lat2.to_radians();
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}

/// Kilometers per degree of latitude (and of longitude at the equator).
#[must_use]
pub fn km_per_deg() -> f64 {
    2.0 * std::f64::consts::PI * EARTH_RADIUS_KM / 360.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_distance_to_self() {
        assert_eq!(haversine_km(48.85, 2.35, 48.85, 2.35), 0.0);
    }

    #[test]
    fn test_antipodes_are_half_circumference() {
        let d = haversine_km(0.0, 0.0, 0.0, 180.0);
        let half = std::f64::consts::PI * EARTH_RADIUS_KM;
        assert!((d - half).abs() < 1.0, "antipodal distance {} km", d);
    }

    #[test]
    fn test_known_city_pair() {
        // Stockholm to San Francisco, roughly 8,600 km.
        let d = haversine_km(59.3293, 18.0686, 37.77, -122.42);
        assert!((8_500.0..8_750.0).contains(&d), "got {} km", d);
    }

    #[test]
    fn test_symmetry() {
        let ab = haversine_km(10.0, 20.0, -30.0, 40.0);
        let ba = haversine_km(-30.0, 40.0, 10.0, 20.0);
        assert!((ab - ba).abs() < 1e-9);
    }
}
