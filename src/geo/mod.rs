use crate::config::Pricing;
use crate::models::booking::TripEstimate;
use crate::models::location::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6_371.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

/// Straight-line travel time at a flat city speed. Good enough for display.
pub fn travel_minutes(distance_km: f64, average_speed_kmh: f64) -> u32 {
    if distance_km <= 0.0 || average_speed_kmh <= 0.0 {
        return 0;
    }
    (distance_km / average_speed_kmh * 60.0).ceil() as u32
}

pub fn eta_minutes(from: &GeoPoint, to: &GeoPoint, average_speed_kmh: f64) -> u32 {
    travel_minutes(haversine_km(from, to), average_speed_kmh)
}

pub fn estimate_trip(pickup: &GeoPoint, drop: &GeoPoint, pricing: &Pricing) -> TripEstimate {
    let distance_km = round2(haversine_km(pickup, drop));

    TripEstimate {
        distance_km,
        duration_minutes: travel_minutes(distance_km, pricing.average_speed_kmh),
        fare: round2(pricing.base_fare + pricing.fare_per_km * distance_km),
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
