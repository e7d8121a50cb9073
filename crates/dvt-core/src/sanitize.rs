//! Job id derivation from uploaded filenames.
//!
//! One job per filename at a time, so the id must be stable across uploads
//! of the same name and safe to embed in on-disk paths.

/// Byte cap on an id embedded in directory names.
const ID_MAX_BYTES: usize = 128;

fn is_safe(c: char) -> bool {
    !(c == '/' || c == '\\' || c.is_whitespace() || c.is_control())
}

/// Derives a job id from an uploaded filename.
///
/// The extension is dropped (the requested container decides the output
/// extension, not the upload name). Runs of separators, control
/// characters, and whitespace each collapse into a single `_`, and runs at
/// either end vanish. Returns `None` when nothing usable remains.
pub fn job_id_from_filename(name: &str) -> Option<String> {
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };

    let mut id = String::with_capacity(stem.len());
    for word in stem.split(|c: char| !is_safe(c)).filter(|w| !w.is_empty()) {
        if !id.is_empty() {
            id.push('_');
        }
        id.push_str(word);
    }
    let id = id.trim_matches('.');
    if id.is_empty() {
        return None;
    }
    Some(truncate_at_boundary(id))
}

fn truncate_at_boundary(id: &str) -> String {
    if id.len() <= ID_MAX_BYTES {
        return id.to_string();
    }
    let cut = id
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|i| *i <= ID_MAX_BYTES)
        .last()
        .unwrap_or(0);
    id[..cut].to_string()
}
