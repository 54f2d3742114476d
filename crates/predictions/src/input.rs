//! Typed per-operation inputs.
//!
//! Request bodies and provider payloads are untyped JSON; they are converted
//! into a [`ToolInput`] at the boundary and back to JSON only when handed to
//! the provider.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use artforge_core::{DomainError, DomainResult};

use crate::kind::OperationKind;

pub const MAX_PROMPT_LEN: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateInput {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_outputs: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditInput {
    pub image: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleTransferInput {
    pub image: String,
    pub style: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarInput {
    pub image: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionImproveInput {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveBgInput {
    pub image: String,
}

/// Input of one job, tagged by operation kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ToolInput {
    Generate(GenerateInput),
    Edit(EditInput),
    StyleTransfer(StyleTransferInput),
    Avatar(AvatarInput),
    ResolutionImprove(ResolutionImproveInput),
    RemoveBg(RemoveBgInput),
}

impl ToolInput {
    /// Parse and validate an untyped body for `kind`.
    pub fn parse(kind: OperationKind, body: serde_json::Value) -> DomainResult<Self> {
        let input = match kind {
            OperationKind::Generate => ToolInput::Generate(from_json(body)?),
            OperationKind::Edit => ToolInput::Edit(from_json(body)?),
            OperationKind::StyleTransfer => ToolInput::StyleTransfer(from_json(body)?),
            OperationKind::Avatar => ToolInput::Avatar(from_json(body)?),
            OperationKind::ResolutionImprove => ToolInput::ResolutionImprove(from_json(body)?),
            OperationKind::RemoveBg => ToolInput::RemoveBg(from_json(body)?),
        };
        input.validate()?;
        Ok(input)
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            ToolInput::Generate(_) => OperationKind::Generate,
            ToolInput::Edit(_) => OperationKind::Edit,
            ToolInput::StyleTransfer(_) => OperationKind::StyleTransfer,
            ToolInput::Avatar(_) => OperationKind::Avatar,
            ToolInput::ResolutionImprove(_) => OperationKind::ResolutionImprove,
            ToolInput::RemoveBg(_) => OperationKind::RemoveBg,
        }
    }

    /// Free-text prompt, when the operation has one.
    pub fn prompt(&self) -> Option<&str> {
        match self {
            ToolInput::Generate(i) => Some(&i.prompt),
            ToolInput::Edit(i) => Some(&i.prompt),
            ToolInput::StyleTransfer(i) => i.prompt.as_deref().or(Some(&i.style)),
            ToolInput::Avatar(i) => Some(&i.prompt),
            ToolInput::ResolutionImprove(_) | ToolInput::RemoveBg(_) => None,
        }
    }

    pub fn source_image(&self) -> Option<&str> {
        match self {
            ToolInput::Generate(_) => None,
            ToolInput::Edit(i) => Some(&i.image),
            ToolInput::StyleTransfer(i) => Some(&i.image),
            ToolInput::Avatar(i) => Some(&i.image),
            ToolInput::ResolutionImprove(i) => Some(&i.image),
            ToolInput::RemoveBg(i) => Some(&i.image),
        }
    }

    /// Input object as sent to the provider (no `kind` tag).
    pub fn to_provider_input(&self) -> serde_json::Value {
        let value = match self {
            ToolInput::Generate(i) => serde_json::to_value(i),
            ToolInput::Edit(i) => serde_json::to_value(i),
            ToolInput::StyleTransfer(i) => serde_json::to_value(i),
            ToolInput::Avatar(i) => serde_json::to_value(i),
            ToolInput::ResolutionImprove(i) => serde_json::to_value(i),
            ToolInput::RemoveBg(i) => serde_json::to_value(i),
        };
        // Plain structs of strings and integers always serialize.
        value.unwrap_or(serde_json::Value::Null)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if let Some(image) = self.source_image() {
            validate_image_ref(image)?;
        }
        match self {
            ToolInput::Generate(i) => {
                validate_prompt("prompt", &i.prompt)?;
                if let Some(n) = i.num_outputs {
                    if !(1..=4).contains(&n) {
                        return Err(DomainError::validation("num_outputs must be 1-4"));
                    }
                }
            }
            ToolInput::Edit(i) => validate_prompt("prompt", &i.prompt)?,
            ToolInput::Avatar(i) => validate_prompt("prompt", &i.prompt)?,
            ToolInput::StyleTransfer(i) => {
                validate_prompt("style", &i.style)?;
                if let Some(p) = &i.prompt {
                    validate_prompt("prompt", p)?;
                }
            }
            ToolInput::ResolutionImprove(i) => {
                if let Some(scale) = i.scale {
                    if !(2..=8).contains(&scale) {
                        return Err(DomainError::validation("scale must be 2-8"));
                    }
                }
            }
            ToolInput::RemoveBg(_) => {}
        }
        Ok(())
    }
}

fn from_json<T: DeserializeOwned>(body: serde_json::Value) -> DomainResult<T> {
    serde_json::from_value(body).map_err(|e| DomainError::validation(e.to_string()))
}

fn validate_prompt(field: &str, value: &str) -> DomainResult<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation(format!("{field} is required")));
    }
    if trimmed.chars().count() > MAX_PROMPT_LEN {
        return Err(DomainError::validation(format!(
            "{field} exceeds {MAX_PROMPT_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_image_ref(image: &str) -> DomainResult<()> {
    let ok = image.starts_with("https://")
        || image.starts_with("http://")
        || image.starts_with("data:image/");
    if !ok {
        return Err(DomainError::validation(
            "image must be an http(s) URL or an image data URI",
        ));
    }
    Ok(())
}
