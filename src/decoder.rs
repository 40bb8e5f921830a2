//! H02 message decoder
//!
//!  Decodes raw comma-separated device messages into structured readings.
//!  Known message shapes are tried in declared order, the first one that
//!  recognizes the input wins.

use std::fmt;

use serde::Serialize;

use crate::bitmask::{BitMaskTable, decode_bit_masks};
use crate::error::DecodeError;
use crate::geo::{fix_geo, round_to};

/// Status flags that are not mapped to a documented bit yet
pub const UNWIRED_FLAG: bool = false;

const LOW_BATTERY_BYTE: usize = 1;
const DROP_ALARM_BYTE: usize = 3;

/// Knots to km/h
pub const KMH_PER_KNOT: f64 = 1.852;
/// Knots to mph
pub const MPH_PER_KNOT: f64 = 1.151;

/// Number of comma-separated fields in a `V1` location report
pub const V1_FIELD_COUNT: usize = 18;

/// GPS fix status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Fix {
    Active,
    Invalid,
}

impl fmt::Display for Fix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fix::Active => write!(f, "active"),
            Fix::Invalid => write!(f, "invalid"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Gps {
    /// Device date, `20YY-MM-DD`
    pub date: String,
    /// Device time, `HH:MM:SS`
    pub time: String,
    pub fix: Fix,
    /// Battery indicator as sent by the device
    pub batt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Geo {
    pub latitude: f64,
    pub longitude: f64,
    /// Bearing in whole degrees
    pub bearing: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Speed {
    pub knots: f64,
    pub kmh: f64,
    pub mph: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Retention {
    /// Power cut while idle
    pub power_cut: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpsStatus {
    pub vibration: bool,
    /// Power cut while running
    pub power_cut: bool,
    pub shock: bool,
    pub low_battery: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Vehicle {
    pub armed: bool,
    pub ac: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alarm {
    pub sos: bool,
    pub speed: bool,
    pub drop: bool,
}

/// Named device status flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub retention: Retention,
    pub gps: GpsStatus,
    pub vehicle: Vehicle,
    pub alarm: Alarm,
}

impl Status {
    /// Map the bit-mask coordinates that are known.
    ///
    /// Low battery is byte 1 bit 7, drop alarm is byte 3 bit 1 inverted.
    /// Both bytes must be present; a missing bit inside a present byte
    /// reads as `false`.
    pub fn from_bit_masks(masks: &BitMaskTable) -> Result<Self, DecodeError> {
        for byte in [LOW_BATTERY_BYTE, DROP_ALARM_BYTE] {
            if masks.byte(byte).is_none() {
                return Err(DecodeError::MissingStatusByte { byte });
            }
        }

        Ok(Self {
            retention: Retention {
                power_cut: UNWIRED_FLAG,
            },
            gps: GpsStatus {
                vibration: UNWIRED_FLAG,
                power_cut: UNWIRED_FLAG,
                shock: UNWIRED_FLAG,
                low_battery: masks.bit(LOW_BATTERY_BYTE, 7).unwrap_or(false),
            },
            vehicle: Vehicle {
                armed: UNWIRED_FLAG,
                ac: UNWIRED_FLAG,
            },
            alarm: Alarm {
                sos: UNWIRED_FLAG,
                speed: UNWIRED_FLAG,
                drop: masks.bit(DROP_ALARM_BYTE, 1) == Some(false),
            },
        })
    }
}

/// A decoded location report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Trimmed raw message
    pub raw: String,
    /// Device timestamp, `20YY-MM-DD HH:II`
    pub datetime: String,
    pub phone: String,
    pub gps: Gps,
    pub geo: Geo,
    pub speed: Speed,
    pub status: Status,
    /// Full decoded status field, for diagnostics
    pub raw_bit_masks: BitMaskTable,
    pub imei: String,
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} fix={} lat={:.6} lon={:.6} bearing={} speed={} km/h",
            self.imei,
            self.datetime,
            self.gps.fix,
            self.geo.latitude,
            self.geo.longitude,
            self.geo.bearing,
            self.speed.kmh
        )
    }
}

/// One recognizable message shape.
pub trait MessageSpec: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// `None` if the message does not have this shape, otherwise the
    /// outcome of decoding it.
    fn decode(&self, raw: &str) -> Option<Result<Reading, DecodeError>>;
}

/// Ordered list of message shapes.
pub struct Decoder {
    specs: Vec<Box<dyn MessageSpec>>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            specs: vec![Box::new(V1Report)],
        }
    }
}

impl Decoder {
    /// A decoder that recognizes nothing until specs are added
    pub fn empty() -> Self {
        Self { specs: Vec::new() }
    }

    /// Append a message shape, tried after the existing ones
    pub fn with_spec(mut self, spec: impl MessageSpec + 'static) -> Self {
        self.specs.push(Box::new(spec));
        self
    }

    pub fn spec_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.specs.iter().map(|s| s.name())
    }

    /// Decode one raw message.
    pub fn parse(&self, raw: &str) -> Result<Reading, DecodeError> {
        let raw = raw.trim();
        self.specs
            .iter()
            .find_map(|spec| spec.decode(raw))
            .unwrap_or(Err(DecodeError::Unrecognized))
    }
}

/// Decode one raw message with the default set of message shapes.
pub fn parse(raw: &str) -> Result<Reading, DecodeError> {
    Decoder::default().parse(raw)
}

/// `*HQ,<imei>,V1,...` location report
///
/// ```text
/// *HQ,4209950057,V1,035522,A,1321.1457,N,10351.0798,E,000.00,000,240317,BFFFFBFF,456,06,0,0,6#
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct V1Report;

impl MessageSpec for V1Report {
    fn name(&self) -> &'static str {
        "V1"
    }

    fn decode(&self, raw: &str) -> Option<Result<Reading, DecodeError>> {
        let raw = raw.trim();
        let fields: Vec<&str> = raw.split(',').collect();
        if fields.len() != V1_FIELD_COUNT || fields[2] != "V1" {
            return None;
        }
        Some(decode_v1(raw, &fields))
    }
}

fn decode_v1(raw: &str, fields: &[&str]) -> Result<Reading, DecodeError> {
    let field = |index: usize| {
        fields
            .get(index)
            .copied()
            .ok_or(DecodeError::MissingField { index })
    };

    // Field 11 is read twice: as YYMMDDHHII for the datetime and as DDMMYY
    // for the GPS date. Both renderings are part of the output format.
    let datetime = rewrite_digit_run(field(11)?, 10, |d| {
        format!(
            "20{}-{}-{} {}:{}",
            &d[0..2],
            &d[2..4],
            &d[4..6],
            &d[6..8],
            &d[8..10]
        )
    });
    let date = rewrite_digit_run(field(11)?, 6, |d| {
        format!("20{}-{}-{}", &d[4..6], &d[2..4], &d[0..2])
    });
    let time = rewrite_digit_run(field(3)?, 6, |d| {
        format!("{}:{}:{}", &d[0..2], &d[2..4], &d[4..6])
    });

    let masks = decode_bit_masks(field(12)?)?;
    let status = Status::from_bit_masks(&masks)?;

    // The bearing field also feeds km/h and mph; there is no separate speed
    // field for those in this message.
    let knots = parse_number("knots", field(9)?)?;
    let bearing = parse_number("bearing", field(10)?)?;

    let phone = field(1)?.to_string();

    Ok(Reading {
        raw: raw.to_string(),
        datetime,
        phone: phone.clone(),
        gps: Gps {
            date,
            time,
            fix: if field(4)? == "A" {
                Fix::Active
            } else {
                Fix::Invalid
            },
            batt: field(14)?.to_string(),
        },
        geo: Geo {
            latitude: fix_geo(field(5)?, field(6)?)?,
            longitude: fix_geo(field(7)?, field(8)?)?,
            bearing: bearing.trunc() as i64,
        },
        speed: Speed {
            knots: round_to(knots, 3),
            kmh: round_to(bearing * KMH_PER_KNOT, 3),
            mph: round_to(bearing * MPH_PER_KNOT, 3),
        },
        status,
        raw_bit_masks: masks,
        imei: phone,
    })
}

fn parse_number(field: &'static str, value: &str) -> Result<f64, DecodeError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DecodeError::InvalidNumber {
            field,
            value: value.to_string(),
        })
}

/// Rewrite the first run of `len` consecutive ASCII digits with `render`,
/// keeping any text around it. Input without such a run is returned as is.
fn rewrite_digit_run(value: &str, len: usize, render: impl Fn(&str) -> String) -> String {
    let bytes = value.as_bytes();
    if bytes.len() < len {
        return value.to_string();
    }

    for start in 0..=bytes.len() - len {
        if bytes[start..start + len].iter().all(u8::is_ascii_digit) {
            let digits = &value[start..start + len];
            return format!(
                "{}{}{}",
                &value[..start],
                render(digits),
                &value[start + len..]
            );
        }
    }

    value.to_string()
}
