//! User turn attachments and their normalization against model capabilities.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::message::{ContentBlock, Message};
use crate::core::registry::ProviderCapability;

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("unsupported image format: {0}")]
    UnsupportedImageFormat(String),

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Attachment {
    Image {
        name: String,
        mime_type: String,
        data: Vec<u8>,
    },
    /// A text file included with the turn.
    File { name: String, contents: String },
}

impl Attachment {
    pub fn image(name: impl Into<String>, data: Vec<u8>) -> Result<Self, AttachmentError> {
        let name = name.into();
        let mime_type = image_mime_for(&name)
            .ok_or_else(|| AttachmentError::UnsupportedImageFormat(name.clone()))?;
        Ok(Attachment::Image {
            name,
            mime_type: mime_type.to_string(),
            data,
        })
    }

    pub fn image_from_path(path: &Path) -> Result<Self, AttachmentError> {
        let data = std::fs::read(path).map_err(|source| AttachmentError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::image(file_name(path), data)
    }

    pub fn file_from_path(path: &Path) -> Result<Self, AttachmentError> {
        let contents = std::fs::read_to_string(path).map_err(|source| AttachmentError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Attachment::File {
            name: file_name(path),
            contents,
        })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// MIME type for an image file name, by extension.
pub fn image_mime_for(name: &str) -> Option<&'static str> {
    let extension = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        _ => None,
    }
}

/// Text plus attachments, as typed by the user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserTurn {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl UserTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

pub fn image_placeholder(name: Option<&str>, model: &str) -> ContentBlock {
    ContentBlock::text(format!(
        "[image `{}` omitted: model {model} does not accept image input]",
        name.unwrap_or("attachment")
    ))
}

/// Builds the content of a user message: included files, then images, then
/// the typed text. Images become placeholders when the model cannot take them.
pub fn normalize_turn(
    turn: UserTurn,
    capability: ProviderCapability,
    model: &str,
) -> Vec<ContentBlock> {
    let mut files = Vec::new();
    let mut images = Vec::new();
    for attachment in turn.attachments {
        match attachment {
            Attachment::File { name, contents } => files.push(ContentBlock::File { name, contents }),
            Attachment::Image {
                name,
                mime_type,
                data,
            } => {
                if capability.supports_images {
                    images.push(ContentBlock::Image {
                        mime_type,
                        data,
                        name: Some(name),
                    });
                } else {
                    tracing::debug!(image = %name, model, "Replacing image with placeholder");
                    images.push(image_placeholder(Some(&name), model));
                }
            }
        }
    }

    let mut blocks = files;
    blocks.extend(images);
    if !turn.text.is_empty() {
        blocks.push(ContentBlock::text(turn.text));
    }
    blocks
}

/// Request view of the history for the current model. History images
/// recorded under an image-capable model are downgraded when the model
/// changes; error turns are left out.
pub fn request_view<'a>(
    messages: &'a [Message],
    capability: ProviderCapability,
    model: &str,
) -> Cow<'a, [Message]> {
    let needs_rewrite = messages
        .iter()
        .any(|message| !message.is_transmitted() || (!capability.supports_images && message.has_images()));
    if !needs_rewrite {
        return Cow::Borrowed(messages);
    }

    let rewritten = messages
        .iter()
        .filter(|message| message.is_transmitted())
        .map(|message| {
            if capability.supports_images || !message.has_images() {
                return message.clone();
            }
            let content = message
                .content
                .iter()
                .map(|block| match block {
                    ContentBlock::Image { name, .. } => image_placeholder(name.as_deref(), model),
                    other => other.clone(),
                })
                .collect();
            Message {
                content,
                ..message.clone()
            }
        })
        .collect::<Vec<_>>();
    Cow::Owned(rewritten)
}
