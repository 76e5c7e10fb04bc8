//! Store key scheme.
//!
//! ```text
//! {dataset}/{stage}-{part}        chunk payloads
//! {dataset}/{stage}-hulls         serialized hull list
//! {dataset}/{stage}-shapes        serialized polygon list
//! {dataset}/_manifest/{stage}     expected part count of a stage
//! {dataset}/_state                PipelineState checkpoint
//! ```

pub fn chunk_key(dataset: &str, stage: &str, part: u32) -> String {
    format!("{dataset}/{stage}-{part}")
}

/// Prefix shared by every chunk (and artifact) of one stage.
pub fn stage_prefix(dataset: &str, stage: &str) -> String {
    format!("{dataset}/{stage}-")
}

pub fn hulls_key(dataset: &str, stage: &str) -> String {
    format!("{dataset}/{stage}-hulls")
}

pub fn shapes_key(dataset: &str, stage: &str) -> String {
    format!("{dataset}/{stage}-shapes")
}

pub fn manifest_key(dataset: &str, stage: &str) -> String {
    format!("{dataset}/_manifest/{stage}")
}

pub fn state_key(dataset: &str) -> String {
    format!("{dataset}/_state")
}

/// Part index of a chunk key under `prefix`. Artifacts such as `-hulls` yield `None`.
pub fn parse_part(prefix: &str, key: &str) -> Option<u32> {
    let rest = key.strip_prefix(prefix)?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Reject "007" so every part has exactly one key.
    if rest.len() > 1 && rest.starts_with('0') {
        return None;
    }
    rest.parse().ok()
}

/// Chunk keys under `prefix` with their part index, ascending by part.
pub fn sort_by_part(prefix: &str, keys: impl IntoIterator<Item = String>) -> Vec<(u32, String)> {
    let mut parts: Vec<(u32, String)> = keys
        .into_iter()
        .filter_map(|k| parse_part(prefix, &k).map(|p| (p, k)))
        .collect();
    parts.sort_unstable_by_key(|(p, _)| *p);
    parts
}

/// Dataset and stage names become key segments.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
        && !name.starts_with('_')
}
