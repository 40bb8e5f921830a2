//! Coordinate conversion
//!
//!  Devices report positions as degrees and minutes glued together
//!  (`DDMM.mmmm` / `DDDMM.mmmm`) plus a hemisphere letter.

use crate::error::DecodeError;

/// Width of the minutes part, `MM.mmmm`
const MINUTES_WIDTH: usize = 7;

/// Round half away from zero to a fixed number of decimals.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Convert a device coordinate into signed decimal degrees, 6 decimals.
///
/// `S` and `W` hemispheres yield negative values.
pub fn fix_geo(value: &str, hemisphere: &str) -> Result<f64, DecodeError> {
    let value = value.trim();
    if !value.is_ascii() {
        return Err(DecodeError::InvalidNumber {
            field: "coordinate",
            value: value.to_string(),
        });
    }
    if value.len() <= MINUTES_WIDTH {
        return Err(DecodeError::ShortCoordinate(value.to_string()));
    }

    let (degrees, minutes) = value.split_at(value.len() - MINUTES_WIDTH);
    let degrees: u32 = degrees.parse().map_err(|_| DecodeError::InvalidNumber {
        field: "degrees",
        value: value.to_string(),
    })?;
    let minutes: f64 = minutes.parse().map_err(|_| DecodeError::InvalidNumber {
        field: "minutes",
        value: value.to_string(),
    })?;

    let mut decimal = degrees as f64 + minutes / 60.0;
    if matches!(hemisphere, "S" | "W") {
        decimal = -decimal;
    }

    Ok(round_to(decimal, 6))
}
