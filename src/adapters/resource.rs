//! VISA resource strings.
//!
//! Operators usually pick an instrument by GPIB board and primary address;
//! everything downstream wants the full `GPIBn::addr::INSTR` form.

use crate::error::{AppResult, CalError};
use std::fmt;
use std::str::FromStr;

/// Build the resource string for a GPIB primary address.
pub fn gpib_resource(board: u8, address: u8) -> String {
    format!("GPIB{}::{}::INSTR", board, address)
}

/// A parsed VISA resource string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceAddress {
    /// `GPIB<board>::<primary>::INSTR`
    Gpib { board: u8, primary: u8 },
    /// `USB<board>::<vid>::<pid>::<serial>::INSTR`
    Usb {
        board: u8,
        vendor: String,
        product: String,
        serial: String,
    },
    /// `TCPIP<board>::<host>[::<device>]::INSTR`
    Tcpip { board: u8, host: String },
}

impl ResourceAddress {
    /// Interface prefix (`GPIB`, `USB` or `TCPIP`).
    pub fn interface(&self) -> &'static str {
        match self {
            Self::Gpib { .. } => "GPIB",
            Self::Usb { .. } => "USB",
            Self::Tcpip { .. } => "TCPIP",
        }
    }

    /// GPIB is the only bus with a remote/local state to hand back.
    pub fn supports_go_to_local(&self) -> bool {
        matches!(self, Self::Gpib { .. })
    }
}

fn board_number(token: &str, prefix: &str) -> Option<u8> {
    let rest = token.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some(0)
    } else {
        rest.parse().ok()
    }
}

impl FromStr for ResourceAddress {
    type Err = CalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CalError::InvalidArgument(format!("Invalid VISA resource '{}'", s));
        let upper = s.trim().to_ascii_uppercase();
        let parts: Vec<&str> = upper.split("::").collect();
        if parts.len() < 2 || parts.last() != Some(&"INSTR") {
            return Err(invalid());
        }
        let head = parts[0];

        if let Some(board) = board_number(head, "GPIB") {
            if parts.len() != 3 {
                return Err(invalid());
            }
            let primary: u8 = parts[1].parse().map_err(|_| invalid())?;
            if primary > 30 {
                return Err(invalid());
            }
            return Ok(Self::Gpib { board, primary });
        }
        if let Some(board) = board_number(head, "USB") {
            if parts.len() != 5 {
                return Err(invalid());
            }
            return Ok(Self::Usb {
                board,
                vendor: parts[1].to_string(),
                product: parts[2].to_string(),
                serial: parts[3].to_string(),
            });
        }
        if let Some(board) = board_number(head, "TCPIP") {
            return Ok(Self::Tcpip {
                board,
                host: parts[1].to_string(),
            });
        }
        Err(invalid())
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpib { board, primary } => write!(f, "{}", gpib_resource(*board, *primary)),
            Self::Usb {
                board,
                vendor,
                product,
                serial,
            } => write!(f, "USB{}::{}::{}::{}::INSTR", board, vendor, product, serial),
            Self::Tcpip { board, host } => write!(f, "TCPIP{}::{}::INSTR", board, host),
        }
    }
}

/// List every `INSTR` resource the VISA runtime can see.
#[cfg(feature = "instrument_visa")]
pub fn list_resources() -> AppResult<Vec<String>> {
    use visa_rs::prelude::*;

    let rm = DefaultRM::new().map_err(|e| CalError::transport("VISA", e.to_string()))?;
    let expr = std::ffi::CString::new("?*INSTR")
        .map_err(|e| CalError::InvalidArgument(e.to_string()))?
        .into();
    let mut list = rm
        .find_res_list(&expr)
        .map_err(|e| CalError::transport("VISA", e.to_string()))?;
    let mut found = Vec::new();
    while let Some(res) = list
        .find_next()
        .map_err(|e| CalError::transport("VISA", e.to_string()))?
    {
        found.push(res.to_string());
    }
    Ok(found)
}

/// List every `INSTR` resource the VISA runtime can see.
#[cfg(not(feature = "instrument_visa"))]
pub fn list_resources() -> AppResult<Vec<String>> {
    Err(CalError::FeatureNotEnabled("instrument_visa".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpib_resource_string() {
        assert_eq!(gpib_resource(0, 6), "GPIB0::6::INSTR");
        assert_eq!(gpib_resource(1, 22), "GPIB1::22::INSTR");
    }

    #[test]
    fn test_parse_gpib() {
        let addr: ResourceAddress = "gpib0::7::instr".parse().unwrap();
        assert_eq!(addr, ResourceAddress::Gpib { board: 0, primary: 7 });
        assert!(addr.supports_go_to_local());
        assert_eq!(addr.to_string(), "GPIB0::7::INSTR");
    }

    #[test]
    fn test_parse_usb() {
        let addr: ResourceAddress = "USB0::0x0957::0x179B::MY51250123::INSTR".parse().unwrap();
        assert_eq!(addr.interface(), "USB");
        assert!(!addr.supports_go_to_local());
        assert_eq!(addr.to_string(), "USB0::0X0957::0X179B::MY51250123::INSTR");
    }

    #[test]
    fn test_parse_tcpip() {
        let addr: ResourceAddress = "TCPIP0::192.168.1.100::inst0::INSTR".parse().unwrap();
        assert_eq!(
            addr,
            ResourceAddress::Tcpip {
                board: 0,
                host: "192.168.1.100".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("GPIB0::31::INSTR".parse::<ResourceAddress>().is_err());
        assert!("GPIB0::6".parse::<ResourceAddress>().is_err());
        assert!("ASRL1::INSTR".parse::<ResourceAddress>().is_err());
        assert!("".parse::<ResourceAddress>().is_err());
    }
}
