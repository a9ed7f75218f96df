//! C3 — tablespace mapper.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Ordered mapping from absolute source path to absolute destination path,
/// built from repeated `--tablespace-mapping=SRC=DST` flags.
#[derive(Debug, Clone, Default)]
pub struct TablespaceMap {
    entries: BTreeMap<PathBuf, PathBuf>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TablespaceMapError {
    #[error("--tablespace-mapping value has no '=' separator: {0}")]
    MissingSeparator(String),
    #[error("--tablespace-mapping paths must be absolute: {0}")]
    NotAbsolute(String),
}

impl TablespaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one `SRC=DST` mapping. Splits on the *last* `=` so that `=`
    /// characters inside a path (legal, if unusual) don't break parsing.
    pub fn parse_entry(&mut self, raw: &str) -> Result<(), TablespaceMapError> {
        let idx = raw
            .rfind('=')
            .ok_or_else(|| TablespaceMapError::MissingSeparator(raw.to_string()))?;
        let (src, dst) = (&raw[..idx], &raw[idx + 1..]);
        let src = PathBuf::from(src);
        let dst = PathBuf::from(dst);
        if !src.is_absolute() || !dst.is_absolute() {
            return Err(TablespaceMapError::NotAbsolute(raw.to_string()));
        }
        self.entries.insert(src, dst);
        Ok(())
    }

    pub fn from_args<'a>(
        args: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, TablespaceMapError> {
        let mut map = Self::new();
        for raw in args {
            map.parse_entry(raw)?;
        }
        Ok(map)
    }

    /// Resolves a source symlink target `t` through the map: finds the
    /// longest mapped source path that is a prefix of `t` (matching `t`
    /// exactly counts as the longest possible prefix) and splices the
    /// remainder onto the mapped destination. Returns `t` itself, unchanged,
    /// if no mapped source path is a prefix of it. A tablespace symlink's
    /// target is the directory PostgreSQL created directly under the
    /// mapping's source (e.g. `/srv/ts1/PG_16_202501010000`), not the
    /// mapping's source itself, so an exact-match-only lookup would never
    /// fire in practice.
    pub fn resolve(&self, target: &Path) -> PathBuf {
        match self.longest_prefix_match(target) {
            Some((src, dst)) if src.as_path() == target => dst.clone(),
            Some((src, dst)) => {
                let remainder = target
                    .strip_prefix(src)
                    .expect("longest_prefix_match only returns actual prefixes");
                dst.join(remainder)
            }
            None => target.to_path_buf(),
        }
    }

    pub fn contains(&self, target: &Path) -> bool {
        self.longest_prefix_match(target).is_some()
    }

    /// The mapped `(src, dst)` entry whose `src` is a path-prefix of
    /// `target` (or equal to it) with the most path components, i.e. the
    /// most specific mapping that applies. Mirrors `get_tablespace_mapping`'s
    /// longest-prefix behavior in the original source.
    fn longest_prefix_match(&self, target: &Path) -> Option<(&PathBuf, &PathBuf)> {
        self.entries
            .iter()
            .filter(|(src, _)| target == src.as_path() || target.starts_with(src))
            .max_by_key(|(src, _)| src.components().count())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_mapped_target() {
        let map = TablespaceMap::from_args(["/srv/ts1=/srv/ts1b"]).unwrap();
        assert_eq!(map.resolve(Path::new("/srv/ts1")), Path::new("/srv/ts1b"));
    }

    #[test]
    fn unmapped_target_passes_through() {
        let map = TablespaceMap::new();
        assert_eq!(map.resolve(Path::new("/srv/ts1")), Path::new("/srv/ts1"));
    }

    #[test]
    fn splits_on_last_equals() {
        let map = TablespaceMap::from_args(["/srv/ts=1=/srv/ts1b=2"]).unwrap();
        assert_eq!(
            map.resolve(Path::new("/srv/ts=1")),
            Path::new("/srv/ts1b=2")
        );
    }

    #[test]
    fn resolves_a_path_nested_under_a_mapped_source() {
        // A tablespace symlink's actual target is the PG_<version>_<catalog
        // version> directory PostgreSQL creates under the mapping's source,
        // never the mapping's source path itself.
        let map = TablespaceMap::from_args(["/srv/ts1=/srv/ts1b"]).unwrap();
        assert_eq!(
            map.resolve(Path::new("/srv/ts1/PG_16_202501010000")),
            Path::new("/srv/ts1b/PG_16_202501010000")
        );
    }

    #[test]
    fn contains_matches_a_nested_path_under_a_mapped_source() {
        let map = TablespaceMap::from_args(["/srv/ts1=/srv/ts1b"]).unwrap();
        assert!(map.contains(Path::new("/srv/ts1/PG_16_202501010000")));
        assert!(!map.contains(Path::new("/srv/ts2/PG_16_202501010000")));
    }

    #[test]
    fn uses_the_most_specific_mapping_when_several_prefixes_match() {
        let map =
            TablespaceMap::from_args(["/srv/ts1=/a", "/srv/ts1/sub=/b"]).unwrap();
        assert_eq!(map.resolve(Path::new("/srv/ts1/sub/inner")), Path::new("/b/inner"));
        assert_eq!(map.resolve(Path::new("/srv/ts1/other")), Path::new("/a/other"));
    }

    #[test]
    fn rejects_missing_separator() {
        assert_eq!(
            TablespaceMap::new().parse_entry("/srv/ts1"),
            Err(TablespaceMapError::MissingSeparator("/srv/ts1".to_string()))
        );
    }

    #[test]
    fn rejects_relative_paths() {
        assert!(matches!(
            TablespaceMap::new().parse_entry("ts1=/srv/ts1b"),
            Err(TablespaceMapError::NotAbsolute(_))
        ));
    }
}
