/// Scanner output classification: find the init marker, detect error tokens,
/// and pull the found time out of a successful scan's output.
///
/// A successful scan tokenizes (after the init marker) to something like
/// `hci0 target bdaddr found after 1234 ms`, with the duration second-to-last.
use crate::config::{MarkerConfig, TokenizeFrom};

/// What a finished scan's output amounts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The scanner reported a found time.
    FoundTime(u64),
    /// The scanner printed the error marker as a token.
    ScannerError,
    /// The output has the wrong shape; the attempt yields no sample.
    Malformed(SkipReason),
}

/// Why an attempt produced no sample without ending the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Token count differs from the expected shape.
    TokenCount { found: usize, expected: usize },
    /// The shape is right but the duration token is not a base-10 integer.
    Unparsable { token: String },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::TokenCount { found, expected } => {
                write!(f, "expected {expected} tokens, got {found}")
            }
            SkipReason::Unparsable { token } => {
                write!(f, "duration token {token:?} is not an integer")
            }
        }
    }
}

/// Byte offset of the first occurrence of `marker` in `haystack`.
pub fn find_marker(haystack: &[u8], marker: &str) -> Option<usize> {
    let needle = marker.as_bytes();
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// True when any whitespace-delimited token equals the error marker.
pub fn has_error_token(output: &[u8], error_marker: &str) -> bool {
    String::from_utf8_lossy(output)
        .split_ascii_whitespace()
        .any(|token| token == error_marker)
}

/// The slice of output that gets tokenized.
///
/// In `AfterInit` mode this is everything after the end of the first init
/// marker; if the marker never appeared, the whole output.
fn tokenized_region<'a>(output: &'a [u8], markers: &MarkerConfig) -> &'a [u8] {
    match markers.tokenize {
        TokenizeFrom::Full => output,
        TokenizeFrom::AfterInit => match find_marker(output, &markers.init) {
            Some(pos) => &output[pos + markers.init.len()..],
            None => output,
        },
    }
}

/// Classify a completed scan's captured output.
///
/// The error marker is searched across everything captured, so a scanner
/// error printed before initialization still counts.
pub fn classify(output: &[u8], markers: &MarkerConfig) -> Classification {
    if has_error_token(output, &markers.error) {
        tracing::debug!(marker = %markers.error, "error marker found in scanner output");
        return Classification::ScannerError;
    }

    let region = String::from_utf8_lossy(tokenized_region(output, markers));
    let tokens: Vec<&str> = region.split_ascii_whitespace().collect();
    tracing::debug!(?tokens, "tokenized scanner output");

    if tokens.len() != markers.expected_tokens {
        return Classification::Malformed(SkipReason::TokenCount {
            found: tokens.len(),
            expected: markers.expected_tokens,
        });
    }

    let Some(token) = tokens.len().checked_sub(2).and_then(|i| tokens.get(i)) else {
        return Classification::Malformed(SkipReason::TokenCount {
            found: tokens.len(),
            expected: markers.expected_tokens,
        });
    };
    match token.parse::<u64>() {
        Ok(found_time) => Classification::FoundTime(found_time),
        Err(_) => Classification::Malformed(SkipReason::Unparsable {
            token: token.to_string(),
        }),
    }
}
