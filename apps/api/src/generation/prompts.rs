// Prompt text sent to the image provider.
// Jobs keep the user's raw prompt; everything here is applied at request time.

use crate::generation::client::GenerationRequest;
use crate::models::JobKind;

/// Prefix when exactly one reference image is attached.
pub const SINGLE_REFERENCE_INSTRUCTION: &str = "Use the exact face/style from the reference image. \
    Keep it identical while following this description: ";

/// Prefix when two or more reference images are attached.
pub const MULTI_REFERENCE_INSTRUCTION: &str = "IMPORTANT: Use the face/person from the FIRST reference image(s). \
    The LAST image shows the pose/scene/style to recreate. \
    Keep the face IDENTICAL but recreate the pose and setting. ";

pub const UPSCALE_INSTRUCTION: &str = "Recreate the attached image at higher resolution. \
    Preserve composition, subject, colours and style exactly; add fine detail only. \
    Original description: ";

pub const VARIATION_INSTRUCTION: &str = "Create a variation of the attached image. \
    Keep the subject and overall composition but vary details, pose and lighting. \
    Original description: ";

/// Full provider prompt for a request: instruction prefix, the user's prompt,
/// then the style suffix.
pub fn build_prompt(request: &GenerationRequest) -> String {
    let styled = format!("{}{}", request.prompt.trim(), request.style.prompt_suffix());

    let prefix = match request.kind {
        JobKind::Upscale => UPSCALE_INSTRUCTION,
        JobKind::Variation => VARIATION_INSTRUCTION,
        JobKind::Original | JobKind::Reroll => match request.references.len() {
            0 => "",
            1 => SINGLE_REFERENCE_INSTRUCTION,
            _ => MULTI_REFERENCE_INSTRUCTION,
        },
    };

    format!("{prefix}{styled}")
}
