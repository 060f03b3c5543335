//! Media helpers: `data:` URL decoding and on-disk storage of sent media.

use std::path::{Path, PathBuf};

use {
    async_trait::async_trait,
    base64::Engine,
    tracing::debug,
    wagate_whatsapp::MediaSink,
};

#[derive(Debug, thiserror::Error)]
pub enum DataUrlError {
    #[error("not a data URL")]
    NotDataUrl,
    #[error("data URL is not base64 encoded")]
    NotBase64,
    #[error("data URL has no media type")]
    MissingMimeType,
    #[error("invalid base64 payload: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// A decoded `data:<mime>;base64,<payload>` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl DataUrl {
    pub fn parse(input: &str) -> Result<Self, DataUrlError> {
        let rest = input
            .trim()
            .strip_prefix("data:")
            .ok_or(DataUrlError::NotDataUrl)?;
        let (header, payload) = rest.split_once(',').ok_or(DataUrlError::NotDataUrl)?;
        let header = header
            .strip_suffix(";base64")
            .ok_or(DataUrlError::NotBase64)?;
        let mime_type = header
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if mime_type.is_empty() || !mime_type.contains('/') {
            return Err(DataUrlError::MissingMimeType);
        }
        let payload: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        let data = base64::engine::general_purpose::STANDARD.decode(payload)?;
        Ok(Self { mime_type, data })
    }
}

/// File extension for a media type, `bin` when unknown. Prefers the
/// extension named like the subtype (`audio/ogg` → `ogg`, not `oga`).
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    let essence = mime_type.split(';').next().unwrap_or_default().trim();
    let Some(exts) = mime_guess::get_mime_extensions_str(essence) else {
        return "bin";
    };
    let subtype = essence.rsplit('/').next().unwrap_or_default();
    exts.iter()
        .find(|ext| ext.eq_ignore_ascii_case(subtype))
        .or_else(|| exts.first())
        .copied()
        .unwrap_or("bin")
}

/// Writes sent media to `<root>/<owner>/<message id>.<ext>`.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn safe_component(value: &str) -> std::io::Result<&str> {
    let ok = !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0']);
    if ok {
        Ok(value)
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid path component: {value:?}"),
        ))
    }
}

#[async_trait]
impl MediaSink for MediaStore {
    async fn save(
        &self,
        owner_id: &str,
        message_id: &str,
        mime_type: &str,
        data: &[u8],
    ) -> std::io::Result<PathBuf> {
        let dir = self.root.join(safe_component(owner_id)?);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!(
            "{}.{}",
            safe_component(message_id)?,
            extension_for_mime(mime_type)
        ));
        tokio::fs::write(&path, data).await?;
        debug!(path = %path.display(), bytes = data.len(), "media saved");
        Ok(path)
    }
}
