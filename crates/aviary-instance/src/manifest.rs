//! Instance manifest: the single persisted record per instance.
//!
//! A manifest is a plain-text document with a fenced JSON config block at
//! the top. The host recovers configs by extracting the block; the worker
//! executable loads the same document as its startup input. Rendering is a
//! pure function of the config, so an update produces a clean diff.

use crate::InstanceConfig;

pub const MANIFEST_EXT: &str = "manifest";

const HEADER: &str = "# aviary instance manifest (generated, do not hand-edit while running)";
const BEGIN_FENCE: &str = "-----BEGIN AVIARY INSTANCE-----";
const END_FENCE: &str = "-----END AVIARY INSTANCE-----";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("no config block found")]
    MissingFence,
    #[error("config block is not valid: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Render the full manifest document for a config.
///
/// Free text (instruction, display name) is carried inside JSON strings, so
/// serde escaping keeps the fences unambiguous: a string can never produce
/// a bare fence line of its own.
pub fn render(config: &InstanceConfig) -> Result<String, ManifestError> {
    let body = serde_json::to_string_pretty(config)?;
    Ok(format!(
        "{HEADER}\n{BEGIN_FENCE}\n{body}\n{END_FENCE}\n"
    ))
}

/// Recover the config from a manifest document.
///
/// Anything after the end fence is ignored, so a document with trailing
/// garbage still yields its config.
pub fn extract(text: &str) -> Result<InstanceConfig, ManifestError> {
    let mut lines = text.lines();
    if !lines.any(|l| l.trim_end() == BEGIN_FENCE) {
        return Err(ManifestError::MissingFence);
    }

    let mut body = String::new();
    let mut closed = false;
    for line in lines {
        if line.trim_end() == END_FENCE {
            closed = true;
            break;
        }
        body.push_str(line);
        body.push('\n');
    }
    if !closed {
        return Err(ManifestError::MissingFence);
    }

    Ok(serde_json::from_str(&body)?)
}

/// File name of an instance's manifest: a readable slug plus the id, so
/// the id can always be recovered from a directory listing.
pub fn file_name(config: &InstanceConfig) -> String {
    format!("{}-{}.{}", slug(&config.display_name), config.id.0, MANIFEST_EXT)
}

fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            out.push(c);
        } else {
            out.push('-');
        }
    }
    if out.is_empty() {
        out.push_str("instance");
    }
    out
}

/// Whether a directory entry looks like an instance manifest.
pub fn is_manifest_file(file_name: &str) -> bool {
    file_name
        .rsplit_once('.')
        .is_some_and(|(_, ext)| ext == MANIFEST_EXT)
}
