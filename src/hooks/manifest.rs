//! Extractors declared by TOML manifests in the hook directory.
//!
//! ```toml
//! name = "tagger"
//! kind = "command"
//! command = "bin/tagger"      # relative to the manifest
//! args = ["--fast"]
//! ```
//!
//! ```toml
//! name = "captions"
//! kind = "sidecar"
//!
//! [[files]]
//! file = "caption.txt"
//! key = "caption"
//! json = false
//! ```

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use galleryd_common::{Error, Metadata, Result};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Extractor, HookInput};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ManifestKind {
    Command,
    Sidecar,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    name: String,
    kind: ManifestKind,
    #[serde(default)]
    command: Option<PathBuf>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    files: Vec<SidecarFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SidecarFile {
    /// File name inside the image's folder
    pub file: String,
    /// Metadata key to store the content under
    pub key: String,
    /// Parse the content as JSON instead of taking it as text
    #[serde(default)]
    pub json: bool,
}

/// Parse and validate one manifest.
pub fn load_manifest(path: &Path) -> Result<Arc<dyn Extractor>> {
    let content = std::fs::read_to_string(path)?;
    let manifest: Manifest = toml::from_str(&content)
        .map_err(|e| Error::invalid_input(format!("manifest does not parse: {e}")))?;

    let name = manifest.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::invalid_input("manifest name is empty"));
    }

    match manifest.kind {
        ManifestKind::Command => {
            let command = manifest
                .command
                .ok_or_else(|| Error::invalid_input("command manifest has no 'command'"))?;
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            let command = if command.is_absolute() {
                command
            } else {
                base.join(command)
            };
            check_executable(&command)?;
            Ok(Arc::new(CommandExtractor {
                name,
                command,
                args: manifest.args,
            }))
        }
        ManifestKind::Sidecar => {
            if manifest.files.is_empty() {
                return Err(Error::invalid_input("sidecar manifest lists no files"));
            }
            for entry in &manifest.files {
                if entry.key.trim().is_empty() {
                    return Err(Error::invalid_input("sidecar entry has an empty key"));
                }
                if !is_plain_relative(Path::new(&entry.file)) {
                    return Err(Error::invalid_input(format!(
                        "sidecar file '{}' must stay inside the image folder",
                        entry.file
                    )));
                }
            }
            Ok(Arc::new(DeclarativeSidecar {
                name,
                files: manifest.files,
            }))
        }
    }
}

fn is_plain_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn check_executable(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|e| {
        Error::invalid_input(format!("command {} is not available: {e}", path.display()))
    })?;
    if !meta.is_file() {
        return Err(Error::invalid_input(format!(
            "command {} is not a file",
            path.display()
        )));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(Error::invalid_input(format!(
                "command {} is not executable",
                path.display()
            )));
        }
    }
    Ok(())
}

/// Runs an external program per image.
///
/// The program gets the folder path as its last argument and a JSON object
/// `{folder, file, hints, metadata}` on stdin, and must print a JSON object.
/// Dropping the extraction future kills the child.
pub struct CommandExtractor {
    name: String,
    command: PathBuf,
    args: Vec<String>,
}

#[async_trait]
impl Extractor for CommandExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "command"
    }

    async fn extract(&self, input: &HookInput, current: &Metadata) -> Result<Metadata> {
        let fail = |msg: String| Error::hook(self.name.clone(), msg);

        let payload = serde_json::json!({
            "folder": input.folder,
            "file": input.file,
            "hints": input.hints,
            "metadata": current,
        });
        let payload = serde_json::to_vec(&payload).map_err(|e| fail(e.to_string()))?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg(&input.folder)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| fail(format!("failed to start {}: {e}", self.command.display())))?;

        if let Some(mut stdin) = child.stdin.take() {
            // a command that ignores stdin may close it early
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!(hook = %self.name, "stdin not fully consumed: {}", e);
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| fail(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!(
                "exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        match serde_json::from_slice::<Value>(&output.stdout) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(fail("output is not a JSON object".to_string())),
            Err(e) => Err(fail(format!("output is not JSON: {e}"))),
        }
    }
}

/// Reads fixed files from the image's folder into fixed keys.
pub struct DeclarativeSidecar {
    name: String,
    files: Vec<SidecarFile>,
}

#[async_trait]
impl Extractor for DeclarativeSidecar {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "sidecar"
    }

    async fn extract(&self, input: &HookInput, _current: &Metadata) -> Result<Metadata> {
        let mut out = Metadata::new();
        for entry in &self.files {
            let path = input.folder.join(&entry.file);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::hook(self.name.clone(), format!("{}: {e}", entry.file))),
            };
            let value = if entry.json {
                serde_json::from_str(&content)
                    .map_err(|e| Error::hook(self.name.clone(), format!("{}: {e}", entry.file)))?
            } else {
                let trimmed = content.trim();
                if trimmed.is_empty() {
                    continue;
                }
                Value::String(trimmed.to_string())
            };
            out.insert(entry.key.clone(), value);
        }
        Ok(out)
    }
}
