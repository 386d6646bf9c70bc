//! Backslash-delimited logical paths inside a container.
//!
//! Valid element names:
//! - Must be non-empty
//! - Must not contain `\`, `/`, `:` or `!`
//! - Must not exceed 31 UTF-16 code units (the compound-file name limit)
//! - Must not start with a reserved control character (0x01-0x1F); those
//!   names belong to the container's own bookkeeping
//!
//! A path string must additionally have no leading or trailing whitespace and
//! no empty segments. The empty string is the root path.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Separator between path segments.
pub const SEPARATOR: char = '\\';

/// Longest element name, in UTF-16 code units.
pub const MAX_NAME_LEN: usize = 31;

/// Characters that are forbidden anywhere in an element name.
const FORBIDDEN_CHARS: &[char] = &[SEPARATOR, '/', ':', '!'];

/// An immutable, validated sequence of element names.
///
/// # Examples
///
/// ```
/// use cfs_types::ContainerPath;
///
/// let path = ContainerPath::parse("images\\button.jpg").unwrap();
/// assert_eq!(path.segments(), ["images", "button.jpg"]);
/// assert_eq!(path.to_string(), "images\\button.jpg");
/// assert!(ContainerPath::parse(" images").is_err());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerPath {
    segments: Vec<String>,
}

impl ContainerPath {
    /// The root path (zero segments).
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a backslash-delimited path string.
    pub fn parse(path: &str) -> StorageResult<Self> {
        if path.is_empty() {
            return Ok(Self::root());
        }
        if path.trim() != path {
            return Err(StorageError::MalformedPath {
                path: path.to_string(),
                reason: "leading or trailing whitespace".into(),
            });
        }

        let mut segments = Vec::new();
        for segment in path.split(SEPARATOR) {
            if segment.is_empty() {
                return Err(StorageError::MalformedPath {
                    path: path.to_string(),
                    reason: "empty path segment".into(),
                });
            }
            validate_element_name(segment)?;
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Build a path from already-split segments, validating each.
    pub fn from_segments<I, S>(segments: I) -> StorageResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for segment in &segments {
            validate_element_name(segment)?;
        }
        Ok(Self { segments })
    }

    /// The individual element names, outermost first.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns `true` for the root path.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The final element name, if any.
    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The containing path, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.segments.split_last()?;
        Some(Self {
            segments: rest.to_vec(),
        })
    }

    /// A child path one level below this one.
    pub fn join(&self, name: &str) -> StorageResult<Self> {
        validate_element_name(name)?;
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self { segments })
    }

    /// Re-join the segments with the separator.
    pub fn format(&self) -> String {
        self.segments.join(&SEPARATOR.to_string())
    }
}

impl fmt::Display for ContainerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

impl FromStr for ContainerPath {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Fail with `InvalidName` if `segment` itself contains the separator.
pub fn check_no_embedded_separator(segment: &str) -> StorageResult<()> {
    if segment.contains(SEPARATOR) {
        return Err(StorageError::InvalidName {
            name: segment.to_string(),
            reason: "contains the path separator".into(),
        });
    }
    Ok(())
}

/// Validate a name as the native layer sees it.
///
/// Reserved names (first character below 0x20) pass; the container uses them
/// for its own storages and streams.
pub fn validate_native_name(name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::InvalidName {
            name: String::new(),
            reason: "element name must not be empty".into(),
        });
    }
    check_no_embedded_separator(name)?;
    for ch in FORBIDDEN_CHARS {
        if name.contains(*ch) {
            return Err(StorageError::InvalidName {
                name: name.to_string(),
                reason: format!("contains forbidden character: {ch:?}"),
            });
        }
    }
    let units = name.encode_utf16().count();
    if units > MAX_NAME_LEN {
        return Err(StorageError::InvalidName {
            name: name.to_string(),
            reason: format!("{units} UTF-16 units exceeds the limit of {MAX_NAME_LEN}"),
        });
    }
    Ok(())
}

/// Validate a caller-visible element name.
pub fn validate_element_name(name: &str) -> StorageResult<()> {
    validate_native_name(name)?;
    if is_reserved_name(name) {
        return Err(StorageError::InvalidName {
            name: name.to_string(),
            reason: "starts with a reserved control character".into(),
        });
    }
    Ok(())
}

/// Returns `true` if the name starts with a reserved control character.
pub fn is_reserved_name(name: &str) -> bool {
    name.chars()
        .next()
        .is_some_and(|ch| ('\u{1}'..='\u{1f}').contains(&ch))
}
