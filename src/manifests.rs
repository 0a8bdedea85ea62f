//! Reading and rewriting resource manifests in a config checkout.
//!
//! Mutation is deliberately a text operation: only the matched `image:`
//! values change, everything else stays byte-identical, so commit diffs
//! stay minimal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value as Yaml;

use crate::error::{Error, Result};
use crate::image::ImageRef;
use crate::workload::{WorkloadId, DEFAULT_NAMESPACE};

/// Annotation that marks a workload as locked against releases.
pub const LOCK_ANNOTATION: &str = "deckhand.io/locked";

/// What the repository defines for one workload.
#[derive(Debug, Clone, Default)]
pub struct WorkloadManifest {
    pub files: Vec<PathBuf>,
    pub locked: bool,
}

/// Scan a manifest tree and index every workload defined in it.
pub fn scan(root: &Path) -> Result<HashMap<WorkloadId, WorkloadManifest>> {
    let mut files = Vec::new();
    collect_yaml_files(root, &mut files)?;

    let mut index: HashMap<WorkloadId, WorkloadManifest> = HashMap::new();
    for file in files {
        let text = match std::fs::read_to_string(&file) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "skipping unreadable manifest");
                continue;
            }
        };
        for document in serde_yaml::Deserializer::from_str(&text) {
            let value = match Yaml::deserialize(document) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(file = %file.display(), error = %e, "skipping unparseable document");
                    continue;
                }
            };
            let Some(id) = workload_id_of(&value) else {
                continue;
            };
            let entry = index.entry(id).or_default();
            if !entry.files.contains(&file) {
                entry.files.push(file.clone());
            }
            entry.locked = entry.locked || is_locked(&value);
        }
    }
    Ok(index)
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::Manifest(format!("reading manifest dir {:?}: {}", dir, e)))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::Manifest(format!("reading dir entry: {}", e)))?;
        let path = entry.path();
        if path.is_dir() {
            // Dot directories hold VCS metadata, not manifests.
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(false)
            {
                continue;
            }
            collect_yaml_files(&path, out)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            out.push(path);
        }
    }
    Ok(())
}

fn workload_id_of(doc: &Yaml) -> Option<WorkloadId> {
    let kind = doc.get("kind")?.as_str()?.to_ascii_lowercase();
    let metadata = doc.get("metadata")?;
    let name = metadata.get("name")?.as_str()?;
    let namespace = metadata
        .get("namespace")
        .and_then(|ns| ns.as_str())
        .unwrap_or(DEFAULT_NAMESPACE);
    Some(WorkloadId::new(namespace, &kind, name))
}

fn is_locked(doc: &Yaml) -> bool {
    doc.get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(LOCK_ANNOTATION))
        .and_then(|v| v.as_str())
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// The namespace a manifest document declares, if any.
pub fn manifest_namespace(doc: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(doc).ok()?;
    let document = serde_yaml::Deserializer::from_str(text).next()?;
    let value = Yaml::deserialize(document).ok()?;
    value
        .get("metadata")?
        .get("namespace")?
        .as_str()
        .map(|s| s.to_string())
}

/// Rewrite every image field in `doc` whose repository matches `target` to
/// the full target reference. Fields for other repositories and all other
/// content are left byte-identical. Idempotent; a document with no
/// matching field is returned unchanged.
pub fn update_image(doc: &[u8], target: &ImageRef) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(doc)
        .map_err(|_| Error::Manifest("manifest is not valid UTF-8".to_string()))?;

    // Reject input that is not a parseable document sequence before
    // touching any of it.
    for document in serde_yaml::Deserializer::from_str(text) {
        Yaml::deserialize(document)
            .map_err(|e| Error::Manifest(format!("parsing manifest: {}", e)))?;
    }

    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        match rewrite_image_line(line, target) {
            Some(rewritten) => out.push_str(&rewritten),
            None => out.push_str(line),
        }
    }
    Ok(out.into_bytes())
}

/// Rewrites one line if it is an `image:` field for the target's
/// repository; returns None to keep the line as-is.
fn rewrite_image_line(line: &str, target: &ImageRef) -> Option<String> {
    let body = line.trim_end_matches(['\n', '\r']);
    let mut offset = body.len() - body.trim_start().len();
    let mut rest = &body[offset..];
    if let Some(stripped) = rest.strip_prefix("- ") {
        rest = stripped;
        offset += 2;
    }
    rest = rest.strip_prefix("image:")?;
    offset += "image:".len();

    let spaces = rest.len() - rest.trim_start().len();
    if spaces == 0 {
        return None;
    }
    offset += spaces;

    let value_piece = &body[offset..];
    let (value_start, value_end) = match value_piece.chars().next()? {
        quote @ ('"' | '\'') => {
            let close = value_piece[1..].find(quote)?;
            (offset + 1, offset + 1 + close)
        }
        _ => {
            let end = value_piece
                .find(|c: char| c.is_whitespace() || c == '#')
                .unwrap_or(value_piece.len());
            (offset, offset + end)
        }
    };

    let current = ImageRef::parse(&line[value_start..value_end]).ok()?;
    if !current.same_repository(target) {
        return None;
    }

    let mut rewritten = String::with_capacity(line.len());
    rewritten.push_str(&line[..value_start]);
    rewritten.push_str(&target.to_string());
    rewritten.push_str(&line[value_end..]);
    Some(rewritten)
}
