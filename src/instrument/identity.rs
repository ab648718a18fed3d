//! `*IDN?` parsing and instrument classification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fields of an IEEE 488.2 identification string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl Identity {
    /// Parse a comma-separated `*IDN?` reply.
    ///
    /// Replies with fewer than three fields yield an empty identity rather than
    /// an error, since several older instruments answer with junk on power-up.
    pub fn parse(reply: &str) -> Self {
        let fields: Vec<&str> = reply.trim().split(',').map(str::trim).collect();
        if fields.len() < 3 {
            return Self::default();
        }
        Self {
            manufacturer: fields[0].to_string(),
            model: fields[1].to_string(),
            serial: fields[2].to_string(),
            firmware: fields.get(3).map(|s| s.to_string()).unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.manufacturer.is_empty() && self.model.is_empty()
    }

    /// Upper-cased manufacturer with Agilent folded into Keysight.
    pub fn normalized_manufacturer(&self) -> String {
        let upper = self.manufacturer.to_ascii_uppercase();
        if upper.starts_with("KEY") || upper.starts_with("AGI") {
            "KEYSIGHT".to_string()
        } else {
            upper
        }
    }

    pub fn manufacturer_kind(&self) -> Manufacturer {
        Manufacturer::from_identity(self)
    }

    /// Channel count encoded in the model number.
    pub fn channel_count(&self) -> u8 {
        channel_count_from_model(&self.model)
    }

    /// Whether the model string contains any of `models`, ignoring case.
    pub fn model_matches(&self, models: &[&str]) -> bool {
        let model = self.model.to_ascii_uppercase();
        models.iter().any(|m| model.contains(&m.to_ascii_uppercase()))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (s/n {})", self.manufacturer, self.model, self.serial)
    }
}

/// Channel count from a model number such as `DSOX3034T` or `TDS2024C`.
///
/// The four characters starting at the first digit are the model number and
/// its last digit is the channel count. Models that start with a digit, or whose
/// model number does not end in a digit, report 0.
pub fn channel_count_from_model(model: &str) -> u8 {
    let chars: Vec<char> = model.chars().collect();
    let Some(first) = chars.iter().position(|c| c.is_ascii_digit()) else {
        return 0;
    };
    if first == 0 || first + 4 > chars.len() {
        return 0;
    }
    chars[first + 3]
        .to_digit(10)
        .map(|d| d as u8)
        .unwrap_or(0)
}

/// Oscilloscope vendors with a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Manufacturer {
    Keysight,
    Tektronix,
    RohdeSchwarz,
    Other,
}

impl Manufacturer {
    pub fn from_identity(identity: &Identity) -> Self {
        let name = identity.normalized_manufacturer();
        if name == "KEYSIGHT" {
            Self::Keysight
        } else if name.starts_with("TEKTRONIX") {
            Self::Tektronix
        } else if name.starts_with("ROHDE") {
            Self::RohdeSchwarz
        } else {
            Self::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_idn() {
        let id = Identity::parse("KEYSIGHT TECHNOLOGIES,DSOX3034T,MY58490123,07.50.2021102830\n");
        assert_eq!(id.manufacturer, "KEYSIGHT TECHNOLOGIES");
        assert_eq!(id.model, "DSOX3034T");
        assert_eq!(id.serial, "MY58490123");
        assert_eq!(id.firmware, "07.50.2021102830");
    }

    #[test]
    fn test_parse_short_idn_is_empty() {
        assert!(Identity::parse("HEWLETT-PACKARD").is_empty());
        assert!(Identity::parse("").is_empty());
    }

    #[test]
    fn test_parse_three_fields() {
        let id = Identity::parse("FLUKE,5730A,2345678");
        assert_eq!(id.serial, "2345678");
        assert!(id.firmware.is_empty());
    }

    #[test]
    fn test_agilent_normalizes_to_keysight() {
        let id = Identity::parse("AGILENT TECHNOLOGIES,DSO5054A,MY44001234,00.00");
        assert_eq!(id.normalized_manufacturer(), "KEYSIGHT");
        assert_eq!(id.manufacturer_kind(), Manufacturer::Keysight);
    }

    #[test]
    fn test_manufacturer_kinds() {
        let tek = Identity::parse("TEKTRONIX,MSO54,C012345,CF:91.1CT FV:1.28");
        assert_eq!(tek.manufacturer_kind(), Manufacturer::Tektronix);
        let rs = Identity::parse("Rohde&Schwarz,RTH1004,1317.5000K04/101234,1.70");
        assert_eq!(rs.manufacturer_kind(), Manufacturer::RohdeSchwarz);
        let other = Identity::parse("RIGOL TECHNOLOGIES,DS1054Z,DS1ZA1234,00.04");
        assert_eq!(other.manufacturer_kind(), Manufacturer::Other);
    }

    #[test]
    fn test_channel_count_from_model() {
        assert_eq!(channel_count_from_model("DSOX3034T"), 4);
        assert_eq!(channel_count_from_model("DSOX1202G"), 2);
        assert_eq!(channel_count_from_model("TDS2024C"), 4);
        assert_eq!(channel_count_from_model("RTH1002"), 2);
        assert_eq!(channel_count_from_model("MSO-X 3014A"), 4);
    }

    #[test]
    fn test_channel_count_edge_cases() {
        assert_eq!(channel_count_from_model("3458A"), 0);
        assert_eq!(channel_count_from_model("MSO5"), 0);
        assert_eq!(channel_count_from_model("SCOPE"), 0);
        assert_eq!(channel_count_from_model("TDS202C"), 0);
    }

    #[test]
    fn test_model_matches() {
        let id = Identity::parse("Agilent Technologies,33250A,0,1.0");
        assert!(id.model_matches(&["33250a"]));
        assert!(!id.model_matches(&["33220A"]));
    }
}
