//! Per-user generation defaults and the saved reference-image library.

use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AspectRatio, Quality, ReferenceImage, Style, UserId};

/// Library slots a user can fill. One slot per reference a request may carry.
pub const REFERENCE_SLOTS: RangeInclusive<u8> = 1..=5;

/// Applied to a generation whenever the request leaves the field out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: UserId,
    pub model: String,
    pub quality: Quality,
    pub aspect_ratio: AspectRatio,
    pub style: Style,
}

impl UserSettings {
    pub fn defaults(user_id: UserId, model: &str) -> Self {
        Self {
            user_id,
            model: model.to_string(),
            quality: Quality::default(),
            aspect_ratio: AspectRatio::default(),
            style: Style::default(),
        }
    }

    pub fn apply(&mut self, update: SettingsUpdate) {
        if let Some(model) = update.model {
            self.model = model;
        }
        if let Some(quality) = update.quality {
            self.quality = quality;
        }
        if let Some(aspect_ratio) = update.aspect_ratio {
            self.aspect_ratio = aspect_ratio;
        }
        if let Some(style) = update.style {
            self.style = style;
        }
    }
}

/// Partial settings change; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub model: Option<String>,
    pub quality: Option<Quality>,
    pub aspect_ratio: Option<AspectRatio>,
    pub style: Option<Style>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSlot {
    pub user_id: UserId,
    pub slot: u8,
    pub image: ReferenceImage,
    pub filename: Option<String>,
    pub updated_at: DateTime<Utc>,
}
