//! Label encoding for per-constraint tracking objects.
//!
//! A constraint is identified by the label `<pod>-<kind>-<name>`. Since the
//! components may themselves contain `-`, every internal `-` is doubled on
//! encode so that a single `-` is unambiguously a separator.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("expected 3 label segments, found {0}")]
    WrongSegmentCount(usize),
    #[error("label ends with an unterminated separator")]
    TrailingSeparator,
}

fn escape(component: &str) -> String {
    component.replace('-', "--")
}

/// Encodes a `<pod>-<kind>-<name>` constraint label.
pub fn encode(pod: &str, kind: &str, name: &str) -> String {
    format!("{}-{}-{}", escape(pod), escape(kind), escape(name))
}

/// Decodes a constraint label into its `(pod, kind, name)` components.
pub fn decode(label: &str) -> Result<(String, String, String), DecodeError> {
    let mut segments = vec![String::new()];
    let mut chars = label.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '-' {
            segments.last_mut().expect("segments is non-empty").push(c);
            continue;
        }
        match chars.peek() {
            // An escaped literal `-`.
            Some('-') => {
                chars.next();
                segments.last_mut().expect("segments is non-empty").push('-');
            }
            // A separator.
            Some(_) => segments.push(String::new()),
            None => return Err(DecodeError::TrailingSeparator),
        }
    }

    if segments.len() != 3 {
        return Err(DecodeError::WrongSegmentCount(segments.len()));
    }
    let mut it = segments.into_iter();
    Ok((
        it.next().expect("3 segments"),
        it.next().expect("3 segments"),
        it.next().expect("3 segments"),
    ))
}
