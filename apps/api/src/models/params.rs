//! Generation parameters shared by original and derived jobs.
//!
//! A job stores the user's prompt and the *keys* of style, quality and aspect
//! ratio. Expansion into provider text happens in `generation::prompts`, so a
//! derived job can copy these fields verbatim from its parent.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_PROMPT_CHARS: usize = 1000;
pub const MAX_REFERENCE_IMAGES: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamsError {
    #[error("prompt cannot be empty")]
    EmptyPrompt,

    #[error("prompt is {0} characters (max {MAX_PROMPT_CHARS})")]
    PromptTooLong(usize),

    #[error("{0} reference images supplied (max {MAX_REFERENCE_IMAGES})")]
    TooManyReferences(usize),

    #[error("reference image {0}: {1}")]
    BadReference(usize, &'static str),
}

/// Style presets appended to the prompt when the provider request is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    #[default]
    None,
    Photorealistic,
    Anime,
    Cyberpunk,
    Fantasy,
    OilPainting,
    Watercolor,
    #[serde(rename = "3d_render")]
    Render3d,
    Comic,
    Minimalist,
}

impl Style {
    pub fn prompt_suffix(self) -> &'static str {
        match self {
            Style::None => "",
            Style::Photorealistic => {
                ", ultra realistic, 8k uhd, photorealistic, professional photography, natural lighting"
            }
            Style::Anime => {
                ", anime style, studio ghibli inspired, cel shaded, vibrant colors, detailed anime art"
            }
            Style::Cyberpunk => {
                ", cyberpunk style, neon lights, futuristic, blade runner aesthetic, rain, night city"
            }
            Style::Fantasy => ", fantasy art style, magical, ethereal, detailed illustration, epic fantasy",
            Style::OilPainting => {
                ", oil painting style, classical art, brushstrokes visible, museum quality"
            }
            Style::Watercolor => {
                ", watercolor painting, soft edges, artistic, delicate colors, paper texture"
            }
            Style::Render3d => {
                ", 3D render, octane render, unreal engine 5, highly detailed, volumetric lighting"
            }
            Style::Comic => ", comic book style, bold lines, dynamic, superhero aesthetic, vibrant",
            Style::Minimalist => {
                ", minimalist style, clean, simple, elegant, white space, modern design"
            }
        }
    }
}

/// Output resolution tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Quality {
    #[default]
    #[serde(rename = "1K")]
    OneK,
    #[serde(rename = "2K")]
    TwoK,
    #[serde(rename = "4K")]
    FourK,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Quality::OneK => "1K",
            Quality::TwoK => "2K",
            Quality::FourK => "4K",
        }
    }

    /// The tier an upscale of this quality is rendered at.
    pub fn upscaled(self) -> Self {
        match self {
            Quality::OneK => Quality::TwoK,
            Quality::TwoK | Quality::FourK => Quality::FourK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "4:3")]
    Standard,
    #[serde(rename = "3:4")]
    StandardPortrait,
    #[serde(rename = "21:9")]
    Ultrawide,
}

impl AspectRatio {
    pub fn as_str(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Landscape => "16:9",
            AspectRatio::Portrait => "9:16",
            AspectRatio::Standard => "4:3",
            AspectRatio::StandardPortrait => "3:4",
            AspectRatio::Ultrawide => "21:9",
        }
    }
}

/// A user-supplied reference image, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceImage {
    pub mime_type: String,
    pub data: String,
}

impl ReferenceImage {
    pub fn check(&self) -> Result<(), &'static str> {
        if !self.mime_type.starts_with("image/") {
            return Err("mime type must be image/*");
        }
        if self.data.is_empty() {
            return Err("image data is empty");
        }
        if STANDARD.decode(&self.data).is_err() {
            return Err("image data is not valid base64");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    #[serde(default)]
    pub style: Style,
    #[serde(default)]
    pub quality: Quality,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    #[serde(default)]
    pub references: Vec<ReferenceImage>,
    /// Provider model; `None` renders with the client's configured model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Provider seed. Re-rolls always pick a different one.
    #[serde(default = "random_seed")]
    pub seed: u32,
}

impl GenerationParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            style: Style::default(),
            quality: Quality::default(),
            aspect_ratio: AspectRatio::default(),
            references: Vec::new(),
            model: None,
            seed: random_seed(),
        }
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(ParamsError::EmptyPrompt);
        }
        let chars = prompt.chars().count();
        if chars > MAX_PROMPT_CHARS {
            return Err(ParamsError::PromptTooLong(chars));
        }
        if self.references.len() > MAX_REFERENCE_IMAGES {
            return Err(ParamsError::TooManyReferences(self.references.len()));
        }
        for (i, reference) in self.references.iter().enumerate() {
            reference.check().map_err(|reason| ParamsError::BadReference(i, reason))?;
        }
        Ok(())
    }

    /// Same parameters with a seed guaranteed to differ from this one.
    pub fn reseeded(&self) -> Self {
        let mut seed = random_seed();
        while seed == self.seed {
            seed = random_seed();
        }
        Self {
            seed,
            ..self.clone()
        }
    }
}

pub fn random_seed() -> u32 {
    rand::random()
}
