//! List filters and ordering for logical file queries.
//!
//! Query parameters arrive as untyped key/value pairs. They are parsed into a
//! closed set of typed predicates here; unrecognized keys are rejected rather
//! than ignored. Empty values are treated as absent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::Date;
use time::macros::format_description;

pub const PARAM_SEARCH: &str = "search";
pub const PARAM_FILE_TYPE: &str = "file_type";
pub const PARAM_FILE_TYPE_IN: &str = "file_type__in";
pub const PARAM_SIZE_GTE: &str = "size__gte";
pub const PARAM_SIZE_LTE: &str = "size__lte";
pub const PARAM_DATE_GTE: &str = "uploaded_at__date__gte";
pub const PARAM_DATE_LTE: &str = "uploaded_at__date__lte";
pub const PARAM_ORDERING: &str = "ordering";

/// Predicates applied to the file list. All present predicates must match.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFilter {
    /// Case-insensitive substring of `original_filename`.
    pub search: Option<String>,
    /// Exact `file_type` match against any of these values.
    pub file_types: Option<Vec<String>>,
    pub size_min: Option<u64>,
    pub size_max: Option<u64>,
    /// Inclusive lower bound on the UTC calendar date of `uploaded_at`.
    pub uploaded_from: Option<Date>,
    /// Inclusive upper bound on the UTC calendar date of `uploaded_at`.
    pub uploaded_to: Option<Date>,
}

impl FileFilter {
    /// True when the bounds cannot match anything, e.g. `size_min > size_max`.
    pub fn is_unsatisfiable(&self) -> bool {
        matches!((self.size_min, self.size_max), (Some(lo), Some(hi)) if lo > hi)
            || matches!((self.uploaded_from, self.uploaded_to), (Some(lo), Some(hi)) if lo > hi)
            || matches!(&self.file_types, Some(types) if types.is_empty())
    }
}

/// Column a file list can be sorted by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    UploadedAt,
    OriginalFilename,
    Size,
}

impl SortKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UploadedAt => "uploaded_at",
            Self::OriginalFilename => "original_filename",
            Self::Size => "size",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    Asc,
    Desc,
}

/// A single sort key with direction. Defaults to most recent first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOrdering {
    pub key: SortKey,
    pub direction: OrderDirection,
}

impl FileOrdering {
    pub fn desc(key: SortKey) -> Self {
        Self {
            key,
            direction: OrderDirection::Desc,
        }
    }
}

impl Default for FileOrdering {
    fn default() -> Self {
        Self::desc(SortKey::UploadedAt)
    }
}

impl FromStr for FileOrdering {
    type Err = crate::Error;

    /// Parse `field` or `-field`.
    fn from_str(s: &str) -> crate::Result<Self> {
        let (direction, name) = match s.strip_prefix('-') {
            Some(rest) => (OrderDirection::Desc, rest),
            None => (OrderDirection::Asc, s),
        };
        let key = match name {
            "uploaded_at" => SortKey::UploadedAt,
            "original_filename" => SortKey::OriginalFilename,
            "size" => SortKey::Size,
            _ => {
                return Err(crate::Error::InvalidQueryValue {
                    param: PARAM_ORDERING.to_string(),
                    reason: format!(
                        "unknown field {s:?}; expected one of uploaded_at, original_filename, size"
                    ),
                });
            }
        };
        Ok(Self { key, direction })
    }
}

impl fmt::Display for FileOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.direction == OrderDirection::Desc {
            f.write_str("-")?;
        }
        f.write_str(self.key.as_str())
    }
}

/// A fully parsed list request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub filter: FileFilter,
    pub ordering: FileOrdering,
}

impl ListQuery {
    /// Parse query-string pairs into a typed query.
    ///
    /// Repeated keys take the last value.
    pub fn from_pairs<I, K, V>(pairs: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut query = Self::default();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            if !is_known_param(key) {
                return Err(crate::Error::UnknownQueryParam(key.to_string()));
            }
            if value.is_empty() {
                continue;
            }
            let filter = &mut query.filter;
            match key {
                PARAM_SEARCH => filter.search = Some(value.to_string()),
                PARAM_FILE_TYPE => filter.file_types = Some(vec![value.to_string()]),
                PARAM_FILE_TYPE_IN => {
                    filter.file_types = Some(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|t| !t.is_empty())
                            .map(str::to_string)
                            .collect(),
                    )
                }
                PARAM_SIZE_GTE => filter.size_min = Some(parse_size(key, value)?),
                PARAM_SIZE_LTE => filter.size_max = Some(parse_size(key, value)?),
                PARAM_DATE_GTE => filter.uploaded_from = Some(parse_date(key, value)?),
                PARAM_DATE_LTE => filter.uploaded_to = Some(parse_date(key, value)?),
                PARAM_ORDERING => query.ordering = value.parse()?,
                other => return Err(crate::Error::UnknownQueryParam(other.to_string())),
            }
        }
        Ok(query)
    }
}

fn is_known_param(key: &str) -> bool {
    matches!(
        key,
        PARAM_SEARCH
            | PARAM_FILE_TYPE
            | PARAM_FILE_TYPE_IN
            | PARAM_SIZE_GTE
            | PARAM_SIZE_LTE
            | PARAM_DATE_GTE
            | PARAM_DATE_LTE
            | PARAM_ORDERING
    )
}

fn parse_size(param: &str, value: &str) -> crate::Result<u64> {
    value.parse().map_err(|_| crate::Error::InvalidQueryValue {
        param: param.to_string(),
        reason: format!("expected a non-negative integer, got {value:?}"),
    })
}

fn parse_date(param: &str, value: &str) -> crate::Result<Date> {
    Date::parse(value, format_description!("[year]-[month]-[day]")).map_err(|_| {
        crate::Error::InvalidQueryValue {
            param: param.to_string(),
            reason: format!("expected YYYY-MM-DD, got {value:?}"),
        }
    })
}
