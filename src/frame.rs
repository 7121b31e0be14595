//! Stack-frame feature serialization.
//!
//! In the full system a feature extractor turns structured stack frames
//! into the opaque tokens the index consumes; the index itself never looks
//! inside them. This module reproduces that collaborator's contract so the
//! crate is testable end to end: a pure, canonical encoding with a context
//! window collapse that makes near-duplicate frames serialize identically
//! and so raises LSH recall.

use serde::Serialize;

use crate::error::{SimilarityError, StorageError};

/// Context lines kept verbatim at each end of the window. Frames that
/// differ only between these margins serialize to the same bytes.
const CONTEXT_HEAD: usize = 10;
const CONTEXT_TAIL: usize = 10;

/// A structured stack frame as reported by the calling application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub module: Option<String>,
    pub function: Option<String>,
    pub filename: Option<String>,
    pub abs_path: Option<String>,
    pub context_line: Option<String>,
    pub pre_context: Vec<String>,
    pub post_context: Vec<String>,
}

#[derive(Serialize)]
struct CanonicalFrame<'a> {
    location: Option<&'a str>,
    function: Option<&'a str>,
    context: Vec<&'a str>,
}

/// Serialize a frame to its canonical feature token.
///
/// Requires a function name or a context line; a structurally empty frame
/// is a caller bug, not an empty token. Identical frames always produce
/// identical bytes, and the context window is collapsed to its first
/// [`CONTEXT_HEAD`] and last [`CONTEXT_TAIL`] lines.
pub fn serialize_frame(frame: &Frame) -> Result<Vec<u8>, SimilarityError> {
    if frame.function.is_none() && frame.context_line.is_none() {
        return Err(SimilarityError::invalid_feature(
            "frame",
            "frame has neither a function name nor a context line",
        ));
    }

    let mut context: Vec<&str> = frame
        .pre_context
        .iter()
        .map(String::as_str)
        .chain(frame.context_line.as_deref())
        .chain(frame.post_context.iter().map(String::as_str))
        .collect();
    if context.len() > CONTEXT_HEAD + CONTEXT_TAIL {
        context.drain(CONTEXT_HEAD..context.len() - CONTEXT_TAIL);
    }

    let canonical = CanonicalFrame {
        location: frame
            .module
            .as_deref()
            .or(frame.filename.as_deref())
            .or(frame.abs_path.as_deref()),
        function: frame.function.as_deref(),
        context,
    };
    rmp_serde::to_vec(&canonical)
        .map_err(StorageError::from)
        .map_err(SimilarityError::from)
}

/// Sliding-window byte shingles over a message, for callers that feed raw
/// text (not frames) into the index. Empty text yields no tokens so the
/// record path rejects it.
pub fn shingle(text: &str, width: usize) -> Vec<Vec<u8>> {
    let bytes = text.as_bytes();
    if bytes.is_empty() || width == 0 {
        return Vec::new();
    }
    if bytes.len() <= width {
        return vec![bytes.to_vec()];
    }
    bytes.windows(width).map(|window| window.to_vec()).collect()
}

// --------------------------- Tests ---------------------------
