//! Closed tag sets describing what a queued write targets and does.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Backend resource a queued operation targets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    WalkingSession,
    FastingSession,
    FoodEntry,
    Profile,
    UserJourney,
    SharedSetting,
}

impl Entity {
    pub const ALL: [Entity; 6] = [
        Entity::WalkingSession,
        Entity::FastingSession,
        Entity::FoodEntry,
        Entity::Profile,
        Entity::UserJourney,
        Entity::SharedSetting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::WalkingSession => "walking_session",
            Entity::FastingSession => "fasting_session",
            Entity::FoodEntry => "food_entry",
            Entity::Profile => "profile",
            Entity::UserJourney => "user_journey",
            Entity::SharedSetting => "shared_setting",
        }
    }

    /// Backend table holding rows of this entity.
    pub fn table(&self) -> &'static str {
        match self {
            Entity::WalkingSession => "walking_sessions",
            Entity::FastingSession => "fasting_sessions",
            Entity::FoodEntry => "food_entries",
            Entity::Profile => "profiles",
            Entity::UserJourney => "user_journeys",
            Entity::SharedSetting => "shared_settings",
        }
    }
}

impl core::fmt::Display for Entity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Entity {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Entity::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| DomainError::unknown_tag(format!("entity '{s}'")))
    }
}

/// Kind of write a queued operation performs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
    Start,
    Pause,
    Resume,
    End,
    Cancel,
    /// Domain-specific action, replayed as a named remote function.
    Custom(String),
}

impl Action {
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Start => "start",
            Action::Pause => "pause",
            Action::Resume => "resume",
            Action::End => "end",
            Action::Cancel => "cancel",
            Action::Custom(name) => name,
        }
    }

    /// Whether replaying this action brings a new entity into existence.
    pub fn creates_entity(&self) -> bool {
        matches!(self, Action::Create | Action::Start)
    }

    /// Session lifecycle transitions (`pause`, `resume`, `end`, `cancel`).
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Action::Pause | Action::Resume | Action::End | Action::Cancel)
    }
}

impl core::fmt::Display for Action {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = DomainError;

    /// Known names map to their variant; anything else non-empty is `Custom`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s {
            "create" => Action::Create,
            "update" => Action::Update,
            "delete" => Action::Delete,
            "start" => Action::Start,
            "pause" => Action::Pause,
            "resume" => Action::Resume,
            "end" => Action::End,
            "cancel" => Action::Cancel,
            "" => return Err(DomainError::unknown_tag("empty action")),
            other => Action::Custom(other.to_string()),
        };
        Ok(action)
    }
}
