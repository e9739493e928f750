//! Tool versions and their API capability flags.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const PROMPT_CACHING_BETA_FLAG: &str = "prompt-caching-2024-07-31";
pub const TOKEN_EFFICIENT_TOOLS_BETA_FLAG: &str = "token-efficient-tools-2025-02-19";

/// A named, fixed bundle of tool capabilities. Selected once per loop
/// invocation and fixed for its duration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolVersion {
    #[default]
    #[serde(rename = "computer_use_20241022")]
    ComputerUse20241022,
    #[serde(rename = "computer_use_20250124")]
    ComputerUse20250124,
    #[serde(rename = "computer_use_20250429")]
    ComputerUse20250429,
}

impl ToolVersion {
    pub const ALL: [ToolVersion; 3] = [
        Self::ComputerUse20241022,
        Self::ComputerUse20250124,
        Self::ComputerUse20250429,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ComputerUse20241022 => "computer_use_20241022",
            Self::ComputerUse20250124 => "computer_use_20250124",
            Self::ComputerUse20250429 => "computer_use_20250429",
        }
    }

    /// The `anthropic-beta` flag that must accompany requests using this group.
    pub fn beta_flag(&self) -> Option<&'static str> {
        match self {
            Self::ComputerUse20241022 => Some("computer-use-2024-10-22"),
            // 20250429 ships a newer editor but still rides the January flag.
            Self::ComputerUse20250124 | Self::ComputerUse20250429 => Some("computer-use-2025-01-24"),
        }
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| format!("unknown tool version '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beta_flags_per_version() {
        assert_eq!(ToolVersion::ComputerUse20241022.beta_flag(), Some("computer-use-2024-10-22"));
        assert_eq!(ToolVersion::ComputerUse20250124.beta_flag(), Some("computer-use-2025-01-24"));
        assert_eq!(ToolVersion::ComputerUse20250429.beta_flag(), Some("computer-use-2025-01-24"));
    }

    #[test]
    fn parses_and_serializes_wire_names() {
        for version in ToolVersion::ALL {
            assert_eq!(version.as_str().parse::<ToolVersion>().unwrap(), version);
            assert_eq!(serde_json::to_value(version).unwrap(), version.as_str());
        }
        assert!("computer_use_1999".parse::<ToolVersion>().is_err());
        assert_eq!(ToolVersion::default(), ToolVersion::ComputerUse20241022);
    }
}
