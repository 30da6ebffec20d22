// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Small helpers shared by the node and packager modules.

use crate::constants::ESCAPED_SLASH;
use fnv::FnvBuildHasher;
use serde::Serialize;
use tracing::warn;

/// Map type used by every aggregation table.
pub type FnvHashMap<K, V> = hashbrown::HashMap<K, V, FnvBuildHasher>;

/// Escapes `/` so a URL fits in a single metric name segment.
///
/// ```
/// use apm_packager::util::escape_slashes;
///
/// assert_eq!(escape_slashes("http://a/b"), "http:%2F%2Fa%2Fb");
/// ```
pub fn escape_slashes(segment: &str) -> String {
    segment.replace('/', ESCAPED_SLASH)
}

/// Keeps at most `max` characters of `text`, never splitting a character.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// Encodes a value embedded as a JSON string inside an upload record.
pub fn to_json_blob<T: Serialize + ?Sized>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(blob) => blob,
        Err(e) => {
            warn!("Failed to encode trace payload, sending an empty object: {}", e);
            "{}".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("timeout", 4), "time");
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("ünïcödé", 3), "ünï");
        assert_eq!(truncate_chars("", 0), "");
    }

    #[test]
    fn test_to_json_blob() {
        assert_eq!(to_json_blob(&serde_json::json!({"a": [1, 2]})), r#"{"a":[1,2]}"#);
    }
}
