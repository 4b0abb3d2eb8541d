//! Resource metadata returned by the provider's public listing endpoint.

use chrono::{DateTime, Timelike};
use serde::Deserialize;

/// Metadata of a file or directory inside a public resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMetadata {
    /// Display name of the file or directory.
    pub name: String,
    /// Size in bytes (absent for directories).
    pub size: Option<u64>,
    /// Last modification time, epoch seconds rounded up.
    pub modified_time: i64,
    /// Whether this entry is a directory.
    pub is_directory: bool,
    /// Directory listing, when the provider embedded one.
    pub children: Option<Vec<ResourceMetadata>>,
}

/// Wire shape of a resource as the provider serializes it.
#[derive(Debug, Deserialize)]
pub(crate) struct RawResource {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: Option<u64>,
    modified: String,
    #[serde(default, rename = "_embedded")]
    embedded: Option<RawListing>,
}

#[derive(Debug, Deserialize)]
struct RawListing {
    #[serde(default)]
    items: Vec<RawResource>,
}

impl TryFrom<RawResource> for ResourceMetadata {
    type Error = String;

    fn try_from(raw: RawResource) -> Result<Self, Self::Error> {
        let modified_time = parse_modified(&raw.modified)
            .ok_or_else(|| format!("unparseable modification time '{}'", raw.modified))?;

        let children = raw
            .embedded
            .map(|listing| {
                listing
                    .items
                    .into_iter()
                    .map(ResourceMetadata::try_from)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        Ok(Self {
            name: raw.name,
            size: raw.size,
            modified_time,
            is_directory: raw.kind == "dir",
            children,
        })
    }
}

/// Parses an RFC 3339 timestamp into epoch seconds, rounding fractions up.
///
/// ```
/// use relay_core::provider::parse_modified;
///
/// assert_eq!(parse_modified("1970-01-01T00:00:10+00:00"), Some(10));
/// assert_eq!(parse_modified("1970-01-01T00:00:10.2+00:00"), Some(11));
/// assert_eq!(parse_modified("yesterday"), None);
/// ```
#[must_use]
pub fn parse_modified(value: &str) -> Option<i64> {
    let parsed = DateTime::parse_from_rfc3339(value.trim()).ok()?;
    let seconds = parsed.timestamp();
    if parsed.nanosecond() > 0 {
        Some(seconds + 1)
    } else {
        Some(seconds)
    }
}
