//! User profiles: stored generation defaults and the reference-image library.
//!
//! Submissions consult the profile only for fields the request leaves out,
//! so a request that spells everything out never touches the store.

pub mod handlers;

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::info;

use crate::errors::AppError;
use crate::generation::gemini::SUPPORTED_MODELS;
use crate::models::{
    params::random_seed, AspectRatio, GenerationParams, Quality, ReferenceImage, ReferenceSlot,
    SettingsUpdate, Style, UserId, UserSettings, REFERENCE_SLOTS,
};
use crate::store::{ReferenceStore, SettingsStore};

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("unsupported model {0:?} (supported: {list})", list = SUPPORTED_MODELS.join(", "))]
    UnsupportedModel(String),

    #[error("reference slot {0} is out of range (1-5)")]
    InvalidSlot(u8),

    #[error("reference image: {0}")]
    BadImage(&'static str),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<ProfileError> for AppError {
    fn from(e: ProfileError) -> Self {
        match e {
            ProfileError::Store(e) => AppError::Internal(e),
            other => AppError::Validation(other.to_string()),
        }
    }
}

/// Generation fields a request may leave for the profile to fill in.
#[derive(Debug, Clone, Default)]
pub struct ParamOverrides {
    pub model: Option<String>,
    pub style: Option<Style>,
    pub quality: Option<Quality>,
    pub aspect_ratio: Option<AspectRatio>,
    pub references: Option<Vec<ReferenceImage>>,
}

impl ParamOverrides {
    fn needs_settings(&self) -> bool {
        self.model.is_none()
            || self.style.is_none()
            || self.quality.is_none()
            || self.aspect_ratio.is_none()
    }
}

pub struct UserProfiles {
    default_model: String,
    settings: Arc<dyn SettingsStore>,
    references: Arc<dyn ReferenceStore>,
}

impl UserProfiles {
    pub fn new(
        default_model: impl Into<String>,
        settings: Arc<dyn SettingsStore>,
        references: Arc<dyn ReferenceStore>,
    ) -> Self {
        Self {
            default_model: default_model.into(),
            settings,
            references,
        }
    }

    /// Stored settings, or the defaults for a user who never changed them.
    pub async fn settings(&self, user_id: UserId) -> Result<UserSettings, ProfileError> {
        Ok(self
            .settings
            .load_settings(user_id)
            .await?
            .unwrap_or_else(|| UserSettings::defaults(user_id, &self.default_model)))
    }

    pub async fn update_settings(
        &self,
        user_id: UserId,
        update: SettingsUpdate,
    ) -> Result<UserSettings, ProfileError> {
        if let Some(model) = &update.model {
            check_model(model)?;
        }
        let mut settings = self.settings(user_id).await?;
        settings.apply(update);
        self.settings.save_settings(&settings).await?;
        info!(
            "User {user_id} settings: {} {} {} {:?}",
            settings.model,
            settings.quality.as_str(),
            settings.aspect_ratio.as_str(),
            settings.style
        );
        Ok(settings)
    }

    pub async fn references(&self, user_id: UserId) -> Result<Vec<ReferenceSlot>, ProfileError> {
        Ok(self.references.list_references(user_id).await?)
    }

    pub async fn save_reference(
        &self,
        user_id: UserId,
        slot: u8,
        image: ReferenceImage,
        filename: Option<String>,
    ) -> Result<ReferenceSlot, ProfileError> {
        check_slot(slot)?;
        image.check().map_err(ProfileError::BadImage)?;

        let reference = ReferenceSlot {
            user_id,
            slot,
            image,
            filename,
            updated_at: Utc::now(),
        };
        self.references.save_reference(&reference).await?;
        info!("User {user_id} saved reference slot {slot}");
        Ok(reference)
    }

    pub async fn delete_reference(&self, user_id: UserId, slot: u8) -> Result<bool, ProfileError> {
        check_slot(slot)?;
        Ok(self.references.delete_reference(user_id, slot).await?)
    }

    pub async fn clear_references(&self, user_id: UserId) -> Result<u64, ProfileError> {
        let cleared = self.references.clear_references(user_id).await?;
        info!("User {user_id} cleared {cleared} reference slot(s)");
        Ok(cleared)
    }

    /// Builds the parameters of an original generation. Fields missing from
    /// `overrides` come from the user's settings; missing references come
    /// from the saved library.
    pub async fn resolve_params(
        &self,
        user_id: UserId,
        prompt: String,
        overrides: ParamOverrides,
    ) -> Result<GenerationParams, ProfileError> {
        if let Some(model) = &overrides.model {
            check_model(model)?;
        }
        let settings = if overrides.needs_settings() {
            self.settings(user_id).await?
        } else {
            UserSettings::defaults(user_id, &self.default_model)
        };
        let references = match overrides.references {
            Some(references) => references,
            None => self
                .references(user_id)
                .await?
                .into_iter()
                .map(|r| r.image)
                .collect(),
        };

        Ok(GenerationParams {
            prompt,
            style: overrides.style.unwrap_or(settings.style),
            quality: overrides.quality.unwrap_or(settings.quality),
            aspect_ratio: overrides.aspect_ratio.unwrap_or(settings.aspect_ratio),
            references,
            model: Some(overrides.model.unwrap_or(settings.model)),
            seed: random_seed(),
        })
    }
}

fn check_model(model: &str) -> Result<(), ProfileError> {
    if SUPPORTED_MODELS.contains(&model) {
        Ok(())
    } else {
        Err(ProfileError::UnsupportedModel(model.to_string()))
    }
}

fn check_slot(slot: u8) -> Result<(), ProfileError> {
    if REFERENCE_SLOTS.contains(&slot) {
        Ok(())
    } else {
        Err(ProfileError::InvalidSlot(slot))
    }
}
