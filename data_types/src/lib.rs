//! Shared data types used by the worker scheduler, dispatch service, and
//! memory manager.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use snafu::{OptionExt, ResultExt, Snafu};
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt::{self, Write as _},
    str::FromStr,
};

/// Characters that need escaping in a resource path variable value.
const VAR_VALUE_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Unique ID for a horizontal partition of the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(u32);

#[allow(missing_docs)]
impl ChunkId {
    pub fn new(v: u32) -> Self {
        Self(v)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority tier carried by a query request.
///
/// Priority is advisory: the scheduler orders tasks by scan-table slowness,
/// not by tier. The tier is surfaced in logs and STATUS replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Best effort.
    #[default]
    Low,
    /// The standard tier for interactive queries.
    Medium,
    /// Ahead of interactive traffic.
    High,
    /// Operator-initiated work.
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        write!(f, "{}", s)
    }
}

/// One table touched by a shared scan, with its expected scan cost.
///
/// A higher `slowness` rating means the table is more expensive to read from
/// storage, and tasks touching it are grouped so the table is scanned once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanTable {
    /// Database the table lives in.
    pub db: String,
    /// Table name.
    pub table: String,
    /// Expected scan cost; higher is slower.
    pub slowness: i32,
}

impl ScanTable {
    /// Create a new scan-table descriptor.
    pub fn new(db: impl Into<String>, table: impl Into<String>, slowness: i32) -> Self {
        Self {
            db: db.into(),
            table: table.into(),
            slowness,
        }
    }
}

impl fmt::Display for ScanTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}({})", self.db, self.table, self.slowness)
    }
}

/// The table-level manifest of a task: which tables a shared scan touches
/// and how slow each of them is expected to be.
///
/// Tables are kept in descending slowness order (name-ascending within a
/// rating) so that [`ScanInfo::compare_tables`] can walk both manifests
/// position by position.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanInfo {
    tables: Vec<ScanTable>,
}

impl ScanInfo {
    /// Build a manifest from an arbitrary-order table list.
    pub fn new(mut tables: Vec<ScanTable>) -> Self {
        tables.sort_by(|a, b| {
            b.slowness
                .cmp(&a.slowness)
                .then_with(|| a.table.cmp(&b.table))
                .then_with(|| a.db.cmp(&b.db))
        });
        Self { tables }
    }

    /// The tables of this manifest, slowest first.
    pub fn tables(&self) -> &[ScanTable] {
        &self.tables
    }

    /// Total slowness rating across all tables.
    pub fn scan_rating(&self) -> i64 {
        self.tables.iter().map(|t| i64::from(t.slowness)).sum()
    }

    /// Rating of the slowest table, if any.
    pub fn top_slowness(&self) -> Option<i32> {
        self.tables.first().map(|t| t.slowness)
    }

    /// Order two manifests for shared-scan grouping.
    ///
    /// `Greater` means `self` is slower than `other` and should be scheduled
    /// first. Manifests are compared position by position in descending
    /// slowness order: the first differing slowness decides, a differing
    /// table name at equal slowness decides (the lexicographically earlier
    /// name ranks as slower), and two manifests where one is a prefix of the
    /// other are ordered by table-set size.
    pub fn compare_tables(&self, other: &Self) -> Ordering {
        for (a, b) in self.tables.iter().zip(other.tables.iter()) {
            match a.slowness.cmp(&b.slowness) {
                Ordering::Equal => {}
                ord => return ord,
            }
            match a.table.cmp(&b.table).then_with(|| a.db.cmp(&b.db)) {
                Ordering::Equal => {}
                ord => return ord.reverse(),
            }
        }
        self.tables.len().cmp(&other.tables.len())
    }
}

impl fmt::Display for ScanInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, t) in self.tables.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", t)?;
        }
        write!(f, "]")
    }
}

/// Error for malformed resource identifiers.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ResourceError {
    #[snafu(display("resource path '{}' is not absolute", path))]
    NotAbsolute { path: String },

    #[snafu(display("resource path '{}' has an unknown prefix", path))]
    UnknownPrefix { path: String },

    #[snafu(display("resource path '{}' is missing a component", path))]
    MissingComponent { path: String },

    #[snafu(display("invalid chunk id in resource path '{}': {}", path, source))]
    InvalidChunk {
        path: String,
        source: std::num::ParseIntError,
    },

    #[snafu(display("malformed variable assignment '{}' in resource path", var))]
    MalformedVar { var: String },

    #[snafu(display("invalid percent encoding in resource path '{}'", path))]
    BadEncoding { path: String },
}

/// A parsed resource identifier a session is provisioned against.
///
/// Two forms exist: `/chunk/<db>/<chunk_id>` routes per-chunk query requests
/// and `/result/<hash>[?k=v&k=v]` routes result retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceUnit {
    /// A database chunk a QUERY request may target.
    DbChunk {
        /// Database name.
        db: String,
        /// Chunk the session serves.
        chunk: ChunkId,
    },
    /// A spooled result, addressed by hash, with optional variables.
    Result {
        /// Result hash.
        hash: String,
        /// Decoded variable map.
        vars: BTreeMap<String, String>,
    },
}

impl ResourceUnit {
    /// Variable lookup for the `/result` form. Always `None` for `/chunk`.
    pub fn var(&self, key: &str) -> Option<&str> {
        match self {
            Self::DbChunk { .. } => None,
            Self::Result { vars, .. } => vars.get(key).map(String::as_str),
        }
    }

    /// Whether `db`/`chunk` matches this resource. Only the `/chunk` form
    /// can match.
    pub fn matches_chunk(&self, db: &str, chunk: ChunkId) -> bool {
        match self {
            Self::DbChunk { db: d, chunk: c } => d == db && *c == chunk,
            Self::Result { .. } => false,
        }
    }
}

impl FromStr for ResourceUnit {
    type Err = ResourceError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let rest = path.strip_prefix('/').context(NotAbsoluteSnafu { path })?;
        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q)),
            None => (rest, None),
        };
        let mut parts = rest.split('/');
        match parts.next() {
            Some("chunk") => {
                let db = parts.next().context(MissingComponentSnafu { path })?;
                let chunk = parts.next().context(MissingComponentSnafu { path })?;
                if db.is_empty() || parts.next().is_some() {
                    return MissingComponentSnafu { path }.fail();
                }
                let chunk = chunk.parse().context(InvalidChunkSnafu { path })?;
                Ok(Self::DbChunk {
                    db: db.to_string(),
                    chunk: ChunkId::new(chunk),
                })
            }
            Some("result") => {
                let hash = parts.next().context(MissingComponentSnafu { path })?;
                if hash.is_empty() || parts.next().is_some() {
                    return MissingComponentSnafu { path }.fail();
                }
                let mut vars = BTreeMap::new();
                if let Some(query) = query {
                    for assignment in query.split('&').filter(|a| !a.is_empty()) {
                        let (k, v) = assignment
                            .split_once('=')
                            .context(MalformedVarSnafu { var: assignment })?;
                        let v = percent_decode_str(v)
                            .decode_utf8()
                            .ok()
                            .context(BadEncodingSnafu { path })?;
                        vars.insert(k.to_string(), v.to_string());
                    }
                }
                Ok(Self::Result {
                    hash: hash.to_string(),
                    vars,
                })
            }
            _ => UnknownPrefixSnafu { path }.fail(),
        }
    }
}

impl fmt::Display for ResourceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DbChunk { db, chunk } => write!(f, "/chunk/{}/{}", db, chunk),
            Self::Result { hash, vars } => {
                write!(f, "/result/{}", hash)?;
                for (i, (k, v)) in vars.iter().enumerate() {
                    f.write_char(if i == 0 { '?' } else { '&' })?;
                    write!(f, "{}={}", k, utf8_percent_encode(v, VAR_VALUE_ESCAPE))?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    fn info(tables: &[(&str, i32)]) -> ScanInfo {
        ScanInfo::new(
            tables
                .iter()
                .map(|(name, slowness)| ScanTable::new("LSST", *name, *slowness))
                .collect(),
        )
    }

    #[test]
    fn scan_info_sorts_slowest_first() {
        let si = info(&[("Source", 3), ("Object", 10), ("Filter", 1)]);
        let names: Vec<_> = si.tables().iter().map(|t| t.table.as_str()).collect();
        assert_eq!(names, vec!["Object", "Source", "Filter"]);
        assert_eq!(si.scan_rating(), 14);
        assert_eq!(si.top_slowness(), Some(10));
    }

    #[test]
    fn compare_tables_by_slowness() {
        let a = info(&[("Object", 10)]);
        let b = info(&[("Object", 5)]);
        assert_eq!(a.compare_tables(&b), Ordering::Greater);
        assert_eq!(b.compare_tables(&a), Ordering::Less);
        assert_eq!(a.compare_tables(&a.clone()), Ordering::Equal);
    }

    #[test]
    fn compare_tables_tie_broken_by_name() {
        // Same rating: the lexicographically earlier table ranks as slower.
        let a = info(&[("Object", 10)]);
        let b = info(&[("Source", 10)]);
        assert_eq!(a.compare_tables(&b), Ordering::Greater);
        assert_eq!(b.compare_tables(&a), Ordering::Less);
    }

    #[test]
    fn compare_tables_prefix_ordered_by_size() {
        let a = info(&[("Object", 10), ("Source", 3)]);
        let b = info(&[("Object", 10)]);
        assert_eq!(a.compare_tables(&b), Ordering::Greater);
        assert_eq!(b.compare_tables(&a), Ordering::Less);
    }

    #[test]
    fn compare_tables_first_difference_wins() {
        // The second position differs; the third would reverse the order but
        // must never be reached.
        let a = info(&[("Object", 10), ("Source", 7), ("Filter", 1)]);
        let b = info(&[("Object", 10), ("Source", 4), ("Filter", 9)]);
        assert_eq!(a.compare_tables(&b), Ordering::Greater);
    }

    #[test]
    fn chunk_resource_round_trip() {
        let ru: ResourceUnit = "/chunk/LSST/3240".parse().unwrap();
        assert_eq!(
            ru,
            ResourceUnit::DbChunk {
                db: "LSST".to_string(),
                chunk: ChunkId::new(3240)
            }
        );
        assert!(ru.matches_chunk("LSST", ChunkId::new(3240)));
        assert!(!ru.matches_chunk("LSST", ChunkId::new(3241)));
        assert!(!ru.matches_chunk("SDSS", ChunkId::new(3240)));
        assert_eq!(ru.to_string(), "/chunk/LSST/3240");
    }

    #[test]
    fn result_resource_round_trip() {
        let ru: ResourceUnit = "/result/1fd3a2?obj=4 2&batch=7".parse().unwrap();
        assert_eq!(ru.var("obj"), Some("4 2"));
        assert_eq!(ru.var("batch"), Some("7"));
        assert_eq!(ru.var("missing"), None);
        assert!(!ru.matches_chunk("LSST", ChunkId::new(1)));
        // Rendering escapes the space; parsing the render gives the unit back.
        let rendered = ru.to_string();
        assert_eq!(rendered, "/result/1fd3a2?batch=7&obj=4%202");
        assert_eq!(rendered.parse::<ResourceUnit>().unwrap(), ru);
    }

    #[test]
    fn malformed_resources_rejected() {
        for path in [
            "chunk/LSST/3",
            "/chunk/LSST",
            "/chunk//3",
            "/chunk/LSST/three",
            "/chunk/LSST/3/extra",
            "/query/LSST/3",
            "/result/",
            "/result/abc?novalue",
        ] {
            assert!(path.parse::<ResourceUnit>().is_err(), "accepted {}", path);
        }
    }
}
