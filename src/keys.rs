//! Backend key layout and path-safety checks.
//!
//! Every key starts with the owning user's id, so keys of different users never collide:
//!
//! - **Files**: `{user_id}/files/{logical_path}`
//! - **Versions**: `{user_id}/versions/{file_id}/v{version}`
//! - **Temporary uploads**: `{user_id}/temp/{random}-{filename}`
//!
//! [`ensure_safe`] is called by every backend operation before a key reaches the backend.

use std::borrow::Cow;

use uuid::Uuid;

use crate::error::{Error, Result};

const FILES_NAMESPACE: &str = "files";
const VERSIONS_NAMESPACE: &str = "versions";
const TEMP_NAMESPACE: &str = "temp";

/// Key of the live object for a logical path, e.g. `/docs/report.pdf`.
pub fn file_key(user_id: Uuid, logical_path: &str) -> Result<String> {
    let path = logical_path.trim_start_matches('/');
    if path.is_empty() {
        return Err(Error::InvalidKey(format!(
            "logical path '{logical_path}' does not name a file"
        )));
    }
    let key = format!("{user_id}/{FILES_NAMESPACE}/{path}");
    ensure_safe(&key)?;
    Ok(key)
}

/// Key of an immutable stored version. Never reused for different content.
pub fn version_key(user_id: Uuid, file_id: Uuid, version: u64) -> String {
    format!("{user_id}/{VERSIONS_NAMESPACE}/{file_id}/v{version}")
}

/// Key for staging an upload. The random component keeps concurrent uploads of the
/// same name apart.
pub fn temp_key(user_id: Uuid, filename: &str) -> String {
    let name = sanitize_filename(filename);
    format!("{user_id}/{TEMP_NAMESPACE}/{}-{name}", Uuid::new_v4().simple())
}

/// True if `key` is relative, already canonical and free of `..` segments.
pub fn is_safe(key: &str) -> bool {
    if key.is_empty() || is_absolute(key) {
        return false;
    }
    if key.split('/').any(|segment| segment == "..") {
        return false;
    }
    match canonicalize(key) {
        Some(canonical) => canonical == key,
        None => false,
    }
}

pub fn ensure_safe(key: &str) -> Result<()> {
    if is_safe(key) {
        Ok(())
    } else {
        Err(Error::InvalidKey(key.to_string()))
    }
}

/// Lexical canonical form: percent-decoded, `\` treated as a separator, empty and `.`
/// segments dropped. `None` when the key does not decode or resolves above its root.
pub fn canonicalize(key: &str) -> Option<String> {
    let decoded: Cow<'_, str> = urlencoding::decode(key).ok()?;
    if decoded.contains('\0') {
        return None;
    }
    let unified = decoded.replace('\\', "/");

    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(segments.join("/"))
}

fn is_absolute(key: &str) -> bool {
    if key.starts_with('/') || key.starts_with('\\') {
        return true;
    }
    // Windows drive prefix such as `C:`
    let bytes = key.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}
