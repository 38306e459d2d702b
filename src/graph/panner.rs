//! Panner math: linear distance attenuation, sound cones and equal-power panning.
//!
//! These follow the Web Audio `PannerNode` definitions for the `linear`
//! distance model and the `equalpower` panning model.

use super::PannerSettings;
use crate::math::{Orientation, Vec3};
use std::f32::consts::FRAC_PI_2;

/// Linear distance gain, `1 - rolloff * (d - ref) / (max - ref)` with `d` clamped to `[ref, max]`.
pub fn linear_distance_gain(distance: f32, settings: &PannerSettings) -> f32 {
    let ref_distance = settings.ref_distance;
    let max_distance = settings.max_distance;
    if max_distance <= ref_distance {
        return 1.0;
    }
    let rolloff = settings.rolloff_factor.clamp(0.0, 1.0);
    let d = distance.clamp(ref_distance, max_distance);
    1.0 - rolloff * (d - ref_distance) / (max_distance - ref_distance)
}

/// Gain contributed by the source's sound cone.
///
/// `orientation` is the source's world-space direction; a zero direction
/// makes the source omnidirectional.
pub fn cone_gain(
    source_position: Vec3,
    orientation: Vec3,
    listener_position: Vec3,
    settings: &PannerSettings,
) -> f32 {
    let inner = settings.cone_inner_angle.abs();
    let outer = settings.cone_outer_angle.abs();
    if inner >= 360.0 && outer >= 360.0 {
        return 1.0;
    }
    let Some(direction) = orientation.try_normalize() else {
        return 1.0;
    };
    let Some(to_listener) = (listener_position - source_position).try_normalize() else {
        return 1.0;
    };

    let angle = direction.dot(to_listener).clamp(-1.0, 1.0).acos().to_degrees();
    let half_inner = inner * 0.5;
    let half_outer = outer * 0.5;

    if angle <= half_inner {
        1.0
    } else if angle >= half_outer {
        settings.cone_outer_gain
    } else {
        let x = (angle - half_inner) / (half_outer - half_inner);
        (1.0 - x) + settings.cone_outer_gain * x
    }
}

/// Azimuth of the source around the listener in degrees, `0` straight ahead,
/// positive to the right, in `[-180, 180]`.
pub fn azimuth(
    source_position: Vec3,
    listener_position: Vec3,
    listener_orientation: &Orientation,
) -> f32 {
    let Some(source_listener) = (source_position - listener_position).try_normalize() else {
        return 0.0;
    };
    let Some(front) = listener_orientation.forward.try_normalize() else {
        return 0.0;
    };
    let Some(right) = front.cross(listener_orientation.up).try_normalize() else {
        return 0.0;
    };
    let up = right.cross(front);

    let projected = source_listener - up * source_listener.dot(up);
    let Some(projected) = projected.try_normalize() else {
        return 0.0;
    };

    let mut azimuth = projected.dot(right).clamp(-1.0, 1.0).acos().to_degrees();
    if projected.dot(front) < 0.0 {
        azimuth = 360.0 - azimuth;
    }
    if (0.0..=90.0).contains(&azimuth) {
        azimuth = 90.0 - azimuth;
    } else {
        azimuth = 450.0 - azimuth;
    }
    if azimuth > 180.0 {
        azimuth -= 360.0;
    }
    azimuth
}

/// Left/right gains for a mono input at the given azimuth.
pub fn equal_power_gains(azimuth: f32) -> (f32, f32) {
    let mut azimuth = azimuth.clamp(-180.0, 180.0);
    // Sources behind the listener fold onto the frontal half plane.
    if azimuth < -90.0 {
        azimuth = -180.0 - azimuth;
    } else if azimuth > 90.0 {
        azimuth = 180.0 - azimuth;
    }
    let x = (azimuth + 90.0) / 180.0;
    ((x * FRAC_PI_2).cos(), (x * FRAC_PI_2).sin())
}
