//! Built-in extractors.
//!
//! - `_default`: file stem as `char_str`, embedded PNG text as `prompt`, pixel
//!   dimensions. Runs first because of the leading underscore.
//! - `sidecar`: text files written next to the image by generation front-ends.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use galleryd_common::{Error, Metadata, Result};
use serde_json::Value;

use super::{Extractor, HookInput};

pub const DEFAULT_HOOK: &str = "_default";
pub const SIDECAR_HOOK: &str = "sidecar";

/// Look up a built-in extractor by its configured name.
pub fn by_name(name: &str) -> Option<Arc<dyn Extractor>> {
    match name {
        DEFAULT_HOOK => Some(Arc::new(DefaultExtractor)),
        SIDECAR_HOOK => Some(Arc::new(SidecarExtractor)),
        _ => None,
    }
}

pub struct DefaultExtractor;

#[async_trait]
impl Extractor for DefaultExtractor {
    fn name(&self) -> &str {
        DEFAULT_HOOK
    }

    fn kind(&self) -> &'static str {
        "builtin"
    }

    async fn extract(&self, input: &HookInput, _current: &Metadata) -> Result<Metadata> {
        let mut out = Metadata::new();
        if let Some(stem) = input.file.file_stem() {
            out.insert("char_str".into(), stem.to_string_lossy().into());
        }

        let file = input.file.clone();
        let (prompt, dimensions) = tokio::task::spawn_blocking(move || read_embedded(&file))
            .await
            .map_err(|e| Error::hook(DEFAULT_HOOK, e.to_string()))??;

        if let Some(prompt) = prompt {
            out.insert("prompt".into(), prompt);
        }
        if let Some((width, height)) = dimensions {
            out.insert("width".into(), width.into());
            out.insert("height".into(), height.into());
        }
        Ok(out)
    }
}

fn read_embedded(file: &Path) -> Result<(Option<Value>, Option<(u32, u32)>)> {
    let is_png = file
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
    let prompt = if is_png {
        let reader = File::open(file).map_err(|e| Error::hook(DEFAULT_HOOK, e.to_string()))?;
        embedded_prompt(&png_text_chunks(BufReader::new(reader)))
    } else {
        None
    };
    let dimensions = image::image_dimensions(file).ok();
    Ok((prompt, dimensions))
}

/// Text chunks ahead of the image data: `tEXt`, then `zTXt`, then `iTXt`.
/// A chunk that fails to inflate is skipped; a stream that is not a PNG
/// has none.
pub(crate) fn png_text_chunks<R: Read>(reader: R) -> Vec<(String, String)> {
    let png = match png::Decoder::new(reader).read_info() {
        Ok(png) => png,
        Err(e) => {
            tracing::debug!("No PNG text chunks: {}", e);
            return Vec::new();
        }
    };
    let info = png.info();

    let plain = info
        .uncompressed_latin1_text
        .iter()
        .map(|chunk| (chunk.keyword.clone(), chunk.text.clone()));
    let compressed = info
        .compressed_latin1_text
        .iter()
        .filter_map(|chunk| Some((chunk.keyword.clone(), chunk.get_text().ok()?)));
    let utf8 = info
        .utf8_text
        .iter()
        .filter_map(|chunk| Some((chunk.keyword.clone(), chunk.get_text().ok()?)));
    plain.chain(compressed).chain(utf8).collect()
}

const PROMPT_KEYS: [&str; 4] = ["prompt", "parameters", "workflow", "Comment"];

/// First non-empty prompt-bearing chunk. A JSON object with a `prompt` key
/// yields that inner value.
pub(crate) fn embedded_prompt(chunks: &[(String, String)]) -> Option<Value> {
    PROMPT_KEYS.iter().find_map(|key| {
        let (_, raw) = chunks.iter().find(|(k, _)| k == key)?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(trimmed) {
            if let Some(inner) = obj.get("prompt") {
                return Some(inner.clone());
            }
        }
        Some(Value::String(trimmed.to_string()))
    })
}

pub struct SidecarExtractor;

const CHAR_STR_FILE: &str = "CharStr.txt";
const NORMAL_PROMPT_FILE: &str = "metadata.txt";
const SCENE_PROMPT_FILE: &str = "STMetaDataOut.txt";

#[async_trait]
impl Extractor for SidecarExtractor {
    fn name(&self) -> &str {
        SIDECAR_HOOK
    }

    fn kind(&self) -> &'static str {
        "builtin"
    }

    async fn extract(&self, input: &HookInput, _current: &Metadata) -> Result<Metadata> {
        let folder = &input.folder;
        let mut char_str = read_trimmed(&folder.join(CHAR_STR_FILE))
            .await
            .and_then(|s| clean_char_str(&s));

        let prompt = match input.hint_str("generation_type") {
            Some("normal") => read_trimmed(&folder.join(NORMAL_PROMPT_FILE)).await,
            Some("scene_gen") => read_trimmed(&folder.join(SCENE_PROMPT_FILE)).await,
            _ => match read_trimmed(&folder.join(NORMAL_PROMPT_FILE)).await {
                Some(p) => Some(p),
                None => read_trimmed(&folder.join(SCENE_PROMPT_FILE)).await,
            },
        };

        if char_str.is_none() {
            char_str = prompt.as_deref().and_then(infer_char_str);
        }

        let mut out = Metadata::new();
        if let Some(c) = char_str {
            out.insert("char_str".into(), c.into());
        }
        if let Some(p) = prompt {
            out.insert("prompt".into(), p.into());
        }
        Ok(out)
    }
}

async fn read_trimmed(path: &Path) -> Option<String> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    let trimmed = content.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Drop the placeholder some front-ends write when their own lookup failed.
fn clean_char_str(value: &str) -> Option<String> {
    let text = value.trim();
    let lower = text.to_lowercase();
    if text.is_empty() || lower.starts_with("[file not found:") || lower.starts_with("file not found:") {
        return None;
    }
    Some(text.to_string())
}

/// First subject token of a comma separated prompt, skipping a leading
/// `embedding:` tag.
fn infer_char_str(prompt: &str) -> Option<String> {
    let tokens: Vec<&str> = prompt
        .split([',', '\n'])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    let candidate = match tokens.as_slice() {
        [] => return None,
        [first, second, ..] if first.to_lowercase().starts_with("embedding:") => second,
        [first, ..] => first,
    };
    clean_char_str(candidate)
}
