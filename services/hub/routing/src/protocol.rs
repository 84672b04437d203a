//! Mesh protocol selector values

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Frame encoding used to reach a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MeshProtocol {
    /// Pick from the graph at send time
    #[default]
    Auto = 0,
    /// Coordinator itself, no envelope
    Direct = 1,
    /// One hop from the coordinator
    Unicast = 3,
    /// Source routed through intermediate hops
    Multipath = 4,
}

impl MeshProtocol {
    /// Lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            MeshProtocol::Auto => "auto",
            MeshProtocol::Direct => "direct",
            MeshProtocol::Unicast => "unicast",
            MeshProtocol::Multipath => "multipath",
        }
    }
}

impl fmt::Display for MeshProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeshProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(MeshProtocol::Auto),
            "direct" => Ok(MeshProtocol::Direct),
            "unicast" => Ok(MeshProtocol::Unicast),
            "multipath" => Ok(MeshProtocol::Multipath),
            other => Err(format!("unknown mesh protocol '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        assert_eq!("Unicast".parse::<MeshProtocol>().unwrap(), MeshProtocol::Unicast);
        assert_eq!(MeshProtocol::Multipath.to_string(), "multipath");
        assert!("broadcast".parse::<MeshProtocol>().is_err());
        assert_eq!(MeshProtocol::default(), MeshProtocol::Auto);
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&MeshProtocol::Direct).unwrap();
        assert_eq!(json, "\"direct\"");
        let back: MeshProtocol = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(back, MeshProtocol::Auto);
    }
}
