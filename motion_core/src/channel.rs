//! Sensor channel types.
//!
//! A channel is a sensor modality, optionally bound to a body location, with
//! a fixed number of scalar values per sample row.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a wrist-worn sensor sits
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    LeftWrist,
    RightWrist,
}

impl Location {
    fn as_str(&self) -> &'static str {
        match self {
            Location::LeftWrist => "left-wrist",
            Location::RightWrist => "right-wrist",
        }
    }

    fn tag_byte(&self) -> u8 {
        match self {
            Location::LeftWrist => b'l',
            Location::RightWrist => b'r',
        }
    }
}

/// Type of data carried by a span of columns in a sample row
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChannelType {
    Accelerometer(Location),
    Gyroscope(Location),
    HeartRate,
}

/// Leading byte of every channel tag on the wire
pub const TAG_MARKER: u8 = 0x74;

/// Size of an encoded channel tag
pub const TAG_LEN: usize = 4;

impl ChannelType {
    /// Number of scalar values this channel contributes to one row
    pub fn width(&self) -> usize {
        match self {
            ChannelType::Accelerometer(_) | ChannelType::Gyroscope(_) => 3,
            ChannelType::HeartRate => 1,
        }
    }

    /// The 4-byte wire tag identifying kind and location
    pub fn tag(&self) -> [u8; TAG_LEN] {
        match self {
            ChannelType::Accelerometer(loc) => [TAG_MARKER, b'a', loc.tag_byte(), 0],
            ChannelType::Gyroscope(loc) => [TAG_MARKER, b'g', loc.tag_byte(), 0],
            ChannelType::HeartRate => [TAG_MARKER, b'h', b'-', 0],
        }
    }

    /// Resolve a wire tag; the trailing byte is reserved and ignored
    pub fn from_tag(tag: [u8; TAG_LEN]) -> Option<Self> {
        match (tag[0], tag[1], tag[2]) {
            (TAG_MARKER, b'a', b'l') => Some(ChannelType::Accelerometer(Location::LeftWrist)),
            (TAG_MARKER, b'a', b'r') => Some(ChannelType::Accelerometer(Location::RightWrist)),
            (TAG_MARKER, b'g', b'l') => Some(ChannelType::Gyroscope(Location::LeftWrist)),
            (TAG_MARKER, b'g', b'r') => Some(ChannelType::Gyroscope(Location::RightWrist)),
            (TAG_MARKER, b'h', _) => Some(ChannelType::HeartRate),
            _ => None,
        }
    }
}

/// Total row width of an ordered list of channels
pub fn dimension_of(types: &[ChannelType]) -> usize {
    types.iter().map(ChannelType::width).sum()
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelType::Accelerometer(loc) => write!(f, "accelerometer@{}", loc.as_str()),
            ChannelType::Gyroscope(loc) => write!(f, "gyroscope@{}", loc.as_str()),
            ChannelType::HeartRate => f.write_str("heart-rate"),
        }
    }
}

impl FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "heart-rate" || s == "hr" {
            return Ok(ChannelType::HeartRate);
        }

        let (kind, location) = s
            .split_once('@')
            .ok_or_else(|| format!("unknown channel type: {}", s))?;
        let location = match location {
            "left-wrist" | "left" => Location::LeftWrist,
            "right-wrist" | "right" => Location::RightWrist,
            other => return Err(format!("unknown location: {}", other)),
        };

        match kind {
            "accelerometer" | "accel" => Ok(ChannelType::Accelerometer(location)),
            "gyroscope" | "gyro" => Ok(ChannelType::Gyroscope(location)),
            other => Err(format!("unknown channel kind: {}", other)),
        }
    }
}

impl TryFrom<String> for ChannelType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChannelType> for String {
    fn from(value: ChannelType) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ChannelType; 5] = [
        ChannelType::Accelerometer(Location::LeftWrist),
        ChannelType::Accelerometer(Location::RightWrist),
        ChannelType::Gyroscope(Location::LeftWrist),
        ChannelType::Gyroscope(Location::RightWrist),
        ChannelType::HeartRate,
    ];

    #[test]
    fn test_widths() {
        assert_eq!(ChannelType::Accelerometer(Location::LeftWrist).width(), 3);
        assert_eq!(ChannelType::HeartRate.width(), 1);
        assert_eq!(dimension_of(&ALL), 13);
    }

    #[test]
    fn test_equality_requires_matching_location() {
        assert_ne!(
            ChannelType::Accelerometer(Location::LeftWrist),
            ChannelType::Accelerometer(Location::RightWrist)
        );
        assert_ne!(
            ChannelType::Accelerometer(Location::LeftWrist),
            ChannelType::Gyroscope(Location::LeftWrist)
        );
    }

    #[test]
    fn test_tags_resolve_to_same_type() {
        for t in ALL {
            assert_eq!(ChannelType::from_tag(t.tag()), Some(t));
        }
        assert_eq!(
            ChannelType::Accelerometer(Location::LeftWrist).tag(),
            [0x74, 0x61, 0x6c, 0x00]
        );
    }

    #[test]
    fn test_unknown_tags_rejected() {
        assert_eq!(ChannelType::from_tag([0x75, b'a', b'l', 0]), None);
        assert_eq!(ChannelType::from_tag([TAG_MARKER, b'x', b'l', 0]), None);
        assert_eq!(ChannelType::from_tag([TAG_MARKER, b'a', b'-', 0]), None);
    }

    #[test]
    fn test_text_form() {
        for t in ALL {
            let parsed: ChannelType = t.to_string().parse().unwrap();
            assert_eq!(parsed, t);
        }
        assert_eq!(
            "accel@left".parse::<ChannelType>().unwrap(),
            ChannelType::Accelerometer(Location::LeftWrist)
        );
        assert!("barometer@left-wrist".parse::<ChannelType>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&ChannelType::Gyroscope(Location::RightWrist)).unwrap();
        assert_eq!(json, "\"gyroscope@right-wrist\"");
        let parsed: ChannelType = serde_json::from_str("\"heart-rate\"").unwrap();
        assert_eq!(parsed, ChannelType::HeartRate);
    }
}
