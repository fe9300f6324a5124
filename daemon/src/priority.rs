//! Scheduling priority classes, mapped to the Linux nice value at the boundary

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
    RealTime,
}

impl PriorityClass {
    /// Nice value written by `setpriority(2)` for this class.
    pub fn to_nice(self) -> i32 {
        match self {
            PriorityClass::Idle => 19,
            PriorityClass::BelowNormal => 10,
            PriorityClass::Normal => 0,
            PriorityClass::AboveNormal => -5,
            PriorityClass::High => -10,
            PriorityClass::RealTime => -20,
        }
    }

    pub fn from_nice(nice: i32) -> Self {
        match nice {
            n if n >= 15 => PriorityClass::Idle,
            n if n >= 5 => PriorityClass::BelowNormal,
            n if n > -5 => PriorityClass::Normal,
            n if n > -10 => PriorityClass::AboveNormal,
            n if n > -20 => PriorityClass::High,
            _ => PriorityClass::RealTime,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            PriorityClass::Idle => "Idle",
            PriorityClass::BelowNormal => "Below Normal",
            PriorityClass::Normal => "Normal",
            PriorityClass::AboveNormal => "Above Normal",
            PriorityClass::High => "High",
            PriorityClass::RealTime => "Real Time",
        }
    }

    pub fn all() -> &'static [PriorityClass] {
        &[
            PriorityClass::Idle,
            PriorityClass::BelowNormal,
            PriorityClass::Normal,
            PriorityClass::AboveNormal,
            PriorityClass::High,
            PriorityClass::RealTime,
        ]
    }
}

impl Default for PriorityClass {
    fn default() -> Self {
        PriorityClass::Normal
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for PriorityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "idle" => Ok(PriorityClass::Idle),
            "belownormal" => Ok(PriorityClass::BelowNormal),
            "normal" => Ok(PriorityClass::Normal),
            "abovenormal" => Ok(PriorityClass::AboveNormal),
            "high" => Ok(PriorityClass::High),
            "realtime" => Ok(PriorityClass::RealTime),
            _ => Err(format!("unknown priority class: {s}")),
        }
    }
}
