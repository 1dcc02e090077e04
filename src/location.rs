//! Conversions between the session's canvas coordinates and geodetic
//! positions, anchored at a configurable reference point.

use serde::Serialize;
use std::fmt;

/// Meters per degree of latitude on the reference sphere.
const LAT_DEGREE_METERS: f64 = 111_320.0;

/// A geographic position expressed in degrees latitude and longitude plus
/// altitude in meters. Latitude is positive in the northern hemisphere,
/// longitude positive in the eastern hemisphere.
#[derive(Clone, Copy, PartialEq, Debug, Serialize)]
pub struct GeoPosition {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

impl GeoPosition {
    pub fn new(lat: f64, lon: f64, alt: f64) -> Self {
        GeoPosition { lat, lon, alt }
    }
}

impl fmt::Display for GeoPosition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {}, {})", self.lat, self.lon, self.alt)
    }
}

/// Local tangent-plane projection between canvas `(x, y, z)` and
/// `(lat, lon, alt)`. Canvas x grows eastward, y grows southward and z is
/// altitude above the reference. `scale` is canvas units per meter.
///
/// The longitude circle is evaluated at the reference latitude, which
/// keeps the projection exactly invertible.
#[derive(Clone, Debug)]
pub struct GeoReference {
    ref_xyz: (f64, f64, f64),
    ref_geo: GeoPosition,
    scale: f64,
    cos_lat: f64,
}

impl Default for GeoReference {
    fn default() -> Self {
        GeoReference::new(GeoPosition::new(52.011, 4.357, 0.0), 1.0)
    }
}

impl GeoReference {
    pub fn new(ref_geo: GeoPosition, scale: f64) -> Self {
        GeoReference {
            ref_xyz: (0.0, 0.0, 0.0),
            cos_lat: ref_geo.lat.to_radians().cos(),
            ref_geo,
            scale,
        }
    }

    pub fn set_ref_xyz(&mut self, x: f64, y: f64, z: f64) {
        self.ref_xyz = (x, y, z);
    }

    pub fn refgeo(&self) -> GeoPosition {
        self.ref_geo
    }

    /// Canvas coordinates to a geodetic position.
    pub fn getgeo(&self, x: f64, y: f64, z: f64) -> GeoPosition {
        let east = (x - self.ref_xyz.0) / self.scale;
        let south = (y - self.ref_xyz.1) / self.scale;
        let up = (z - self.ref_xyz.2) / self.scale;
        GeoPosition {
            lat: self.ref_geo.lat - south / LAT_DEGREE_METERS,
            lon: self.ref_geo.lon + east / (LAT_DEGREE_METERS * self.cos_lat),
            alt: self.ref_geo.alt + up,
        }
    }

    /// Geodetic position back to canvas coordinates.
    pub fn getxyz(&self, lat: f64, lon: f64, alt: f64) -> (f64, f64, f64) {
        let east = (lon - self.ref_geo.lon) * LAT_DEGREE_METERS * self.cos_lat;
        let south = (self.ref_geo.lat - lat) * LAT_DEGREE_METERS;
        let up = alt - self.ref_geo.alt;
        (
            self.ref_xyz.0 + east * self.scale,
            self.ref_xyz.1 + south * self.scale,
            self.ref_xyz.2 + up * self.scale,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_within_a_meter() {
        let location = GeoReference::default();
        for (x, y, z) in [
            (0.0, 0.0, 0.0),
            (100.0, 250.0, 10.0),
            (65535.0, 65535.0, 65535.0),
            (12.5, 9_000.0, 3.0),
        ] {
            let geo = location.getgeo(x, y, z);
            let (x2, y2, z2) = location.getxyz(geo.lat, geo.lon, geo.alt);
            assert!((x - x2).abs() < 1.0, "x {} -> {}", x, x2);
            assert!((y - y2).abs() < 1.0, "y {} -> {}", y, y2);
            assert!((z - z2).abs() < 1.0, "z {} -> {}", z, z2);
        }
    }

    #[test]
    fn north_is_up() {
        let location = GeoReference::default();
        let origin = location.getgeo(0.0, 0.0, 0.0);
        let below = location.getgeo(0.0, 1000.0, 0.0);
        assert!(below.lat < origin.lat);
        let east = location.getgeo(1000.0, 0.0, 0.0);
        assert!(east.lon > origin.lon);
    }
}
