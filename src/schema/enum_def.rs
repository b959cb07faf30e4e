use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Channel lifecycle state. Stored as an integer column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

impl ChannelStatus {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => ChannelStatus::Enabled,
            3 => ChannelStatus::AutoDisabled,
            _ => ChannelStatus::ManuallyDisabled,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            ChannelStatus::Enabled => 1,
            ChannelStatus::ManuallyDisabled => 2,
            ChannelStatus::AutoDisabled => 3,
        }
    }
}

/// Upstream provider tag. The numbering matches the rows written by existing gateways.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChannelType {
    #[default]
    #[serde(rename = "openai")]
    #[strum(serialize = "openai")]
    OpenAI,
    Midjourney,
    Azure,
    Custom,
    Anthropic,
    Gemini,
    Suno,
    DeepSeek,
    Unknown,
}

impl ChannelType {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => ChannelType::OpenAI,
            2 => ChannelType::Midjourney,
            3 => ChannelType::Azure,
            8 => ChannelType::Custom,
            14 => ChannelType::Anthropic,
            24 => ChannelType::Gemini,
            36 => ChannelType::Suno,
            43 => ChannelType::DeepSeek,
            _ => ChannelType::Unknown,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            ChannelType::OpenAI => 1,
            ChannelType::Midjourney => 2,
            ChannelType::Azure => 3,
            ChannelType::Custom => 8,
            ChannelType::Anthropic => 14,
            ChannelType::Gemini => 24,
            ChannelType::Suno => 36,
            ChannelType::DeepSeek => 43,
            ChannelType::Unknown => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TokenStatus {
    #[default]
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

impl TokenStatus {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => TokenStatus::Enabled,
            3 => TokenStatus::Expired,
            4 => TokenStatus::Exhausted,
            _ => TokenStatus::Disabled,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            TokenStatus::Enabled => 1,
            TokenStatus::Disabled => 2,
            TokenStatus::Expired => 3,
            TokenStatus::Exhausted => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[default]
    Enabled,
    Disabled,
}

impl UserStatus {
    pub fn from_i32(value: i32) -> Self {
        if value == 1 { UserStatus::Enabled } else { UserStatus::Disabled }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            UserStatus::Enabled => 1,
            UserStatus::Disabled => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    #[default]
    Common,
    Admin,
    Root,
}

impl UserRole {
    pub fn from_i32(value: i32) -> Self {
        match value {
            v if v >= 100 => UserRole::Root,
            v if v >= 10 => UserRole::Admin,
            _ => UserRole::Common,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            UserRole::Common => 1,
            UserRole::Admin => 10,
            UserRole::Root => 100,
        }
    }

    pub fn is_admin(self) -> bool {
        self >= UserRole::Admin
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MultiKeyMode {
    #[default]
    Random,
    RoundRobin,
}

impl MultiKeyMode {
    pub fn from_i32(value: i32) -> Self {
        if value == 1 { MultiKeyMode::RoundRobin } else { MultiKeyMode::Random }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            MultiKeyMode::Random => 0,
            MultiKeyMode::RoundRobin => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    #[default]
    Consume,
    Error,
}

impl LogType {
    pub fn from_i32(value: i32) -> Self {
        if value == 5 { LogType::Error } else { LogType::Consume }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            LogType::Consume => 2,
            LogType::Error => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_integers_round_trip() {
        for status in [ChannelStatus::Enabled, ChannelStatus::ManuallyDisabled, ChannelStatus::AutoDisabled] {
            assert_eq!(ChannelStatus::from_i32(status.as_i32()), status);
        }
        for status in [TokenStatus::Enabled, TokenStatus::Disabled, TokenStatus::Expired, TokenStatus::Exhausted] {
            assert_eq!(TokenStatus::from_i32(status.as_i32()), status);
        }
    }

    #[test]
    fn test_unknown_channel_status_is_treated_as_disabled() {
        assert_eq!(ChannelStatus::from_i32(0), ChannelStatus::ManuallyDisabled);
        assert_eq!(ChannelStatus::from_i32(42), ChannelStatus::ManuallyDisabled);
    }

    #[test]
    fn test_role_ordering() {
        assert!(UserRole::from_i32(100).is_admin());
        assert!(UserRole::from_i32(10).is_admin());
        assert!(!UserRole::from_i32(1).is_admin());
    }

    #[test]
    fn test_channel_type_names() {
        assert_eq!(ChannelType::Anthropic.to_string(), "anthropic");
        assert_eq!(ChannelType::from_str("gemini").unwrap(), ChannelType::Gemini);
        assert_eq!(ChannelType::from_i32(ChannelType::Suno.as_i32()), ChannelType::Suno);
    }
}
