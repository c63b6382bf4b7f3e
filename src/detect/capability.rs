use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Compliance gear a gear provider can report on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GearKind {
    Mask,
    Gloves,
    Hairnet,
    Apron,
}

/// Hand-hygiene behaviors a behavior classifier can report on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BehaviorKind {
    HandWashing,
    Sanitizing,
}

/// Detection capabilities. Resolved when the provider set is built, never per frame.
///
/// Wire form is a short string (`presence`, `gear:mask`, `behavior:hand_washing`)
/// so capabilities can be used as JSON map keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Capability {
    /// Primary subjects (people).
    Presence,
    Gear(GearKind),
    Behavior(BehaviorKind),
}

/// How a provider wants to see the frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    #[default]
    FullFrame,
    /// Called once per primary subject with that subject's box as the region hint.
    PerSubjectRoi,
}

impl GearKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Mask => "mask",
            Self::Gloves => "gloves",
            Self::Hairnet => "hairnet",
            Self::Apron => "apron",
        }
    }
}

impl FromStr for GearKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mask" => Ok(Self::Mask),
            "gloves" => Ok(Self::Gloves),
            "hairnet" => Ok(Self::Hairnet),
            "apron" => Ok(Self::Apron),
            other => Err(anyhow!("unknown gear kind '{}'", other)),
        }
    }
}

impl BehaviorKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::HandWashing => "hand_washing",
            Self::Sanitizing => "sanitizing",
        }
    }
}

impl FromStr for BehaviorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hand_washing" => Ok(Self::HandWashing),
            "sanitizing" => Ok(Self::Sanitizing),
            other => Err(anyhow!("unknown behavior kind '{}'", other)),
        }
    }
}

impl Capability {
    pub fn is_primary(self) -> bool {
        matches!(self, Self::Presence)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Presence => write!(f, "presence"),
            Self::Gear(kind) => write!(f, "gear:{}", kind.as_str()),
            Self::Behavior(kind) => write!(f, "behavior:{}", kind.as_str()),
        }
    }
}

impl FromStr for Capability {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        if s == "presence" {
            return Ok(Self::Presence);
        }
        match s.split_once(':') {
            Some(("gear", kind)) => Ok(Self::Gear(kind.parse()?)),
            Some(("behavior", kind)) => Ok(Self::Behavior(kind.parse()?)),
            _ => Err(anyhow!(
                "unknown capability '{}': expected presence, gear:<kind> or behavior:<kind>",
                s
            )),
        }
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Capability {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_string_forms() {
        for cap in [
            Capability::Presence,
            Capability::Gear(GearKind::Mask),
            Capability::Gear(GearKind::Apron),
            Capability::Behavior(BehaviorKind::HandWashing),
        ] {
            assert_eq!(cap.to_string().parse::<Capability>().unwrap(), cap);
        }
        assert_eq!(
            "GEAR:Gloves".parse::<Capability>().unwrap(),
            Capability::Gear(GearKind::Gloves)
        );
        assert!("gear".parse::<Capability>().is_err());
        assert!("behavior:juggling".parse::<Capability>().is_err());
    }

    #[test]
    fn capability_is_a_json_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(Capability::Gear(GearKind::Hairnet), 2u32);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"gear:hairnet":2}"#);
    }
}
