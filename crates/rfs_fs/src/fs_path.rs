//! FsPath - POSIX-like path algebra over separator-delimited segments

use crate::{FsError, Result, SEPARATOR};
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

const CURRENT_DIR: &str = ".";
const PARENT_DIR: &str = "..";

/// The namespace a path belongs to
///
/// Features:
/// - Cheap to clone (shared handle)
/// - Identified by its authority string
/// - Hash-based ID for fast comparisons and map keys
#[derive(Clone)]
pub struct FsContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    /// Authority the filesystem was opened under (e.g. `namenode:8020`)
    authority: String,

    /// Hash of the authority
    id: u64,
}

impl FsContext {
    /// Create a context for an authority
    pub fn new(authority: impl Into<String>) -> Self {
        let authority = authority.into();
        let id = xxh3_64(authority.as_bytes());

        Self {
            inner: Arc::new(ContextInner { authority, id }),
        }
    }

    /// Get the authority string
    pub fn authority(&self) -> &str {
        &self.inner.authority
    }

    /// Get the hash ID
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Parse a path string in this context
    pub fn parse(&self, raw: &str) -> Result<FsPath> {
        FsPath::parse(raw, self)
    }

    /// The root path of this context
    pub fn root(&self) -> FsPath {
        FsPath::from_segments(self.clone(), true, Vec::new())
    }
}

impl PartialEq for FsContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.id == other.inner.id && self.inner.authority == other.inner.authority)
    }
}

impl Eq for FsContext {}

impl Hash for FsContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for FsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FsContext").field(&self.inner.authority).finish()
    }
}

/// An immutable hierarchical path
///
/// The root is the absolute path with no segments; the empty path is the relative
/// path with no segments. Segments are never empty and never contain the separator.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FsPath {
    context: FsContext,
    absolute: bool,
    segments: Vec<String>,
}

impl FsPath {
    /// Parse a path string
    ///
    /// A leading separator makes the path absolute. Trailing and repeated separators are
    /// dropped, so `"/a//b/"` parses to the segments `a`, `b`.
    pub fn parse(raw: &str, context: &FsContext) -> Result<Self> {
        if raw.contains('\0') {
            return Err(FsError::InvalidPath(format!("{:?} contains a NUL byte", raw)));
        }

        let absolute = raw.starts_with(SEPARATOR);
        let segments = raw
            .split(SEPARATOR)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();

        Ok(Self::from_segments(context.clone(), absolute, segments))
    }

    pub(crate) fn from_segments(context: FsContext, absolute: bool, segments: Vec<String>) -> Self {
        debug_assert!(segments.iter().all(|s| !s.is_empty() && !s.contains(SEPARATOR)));
        Self {
            context,
            absolute,
            segments,
        }
    }

    fn with_segments(&self, absolute: bool, segments: Vec<String>) -> Self {
        Self::from_segments(self.context.clone(), absolute, segments)
    }

    pub fn context(&self) -> &FsContext {
        &self.context
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The relative path with no segments
    pub fn is_empty(&self) -> bool {
        !self.absolute && self.segments.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.absolute && self.segments.is_empty()
    }

    /// Root of this path's context, or `None` for a relative path
    pub fn root(&self) -> Option<Self> {
        self.absolute.then(|| self.context.root())
    }

    /// Last segment as a single-segment relative path
    pub fn file_name(&self) -> Option<Self> {
        self.segments
            .last()
            .map(|name| self.with_segments(false, vec![name.clone()]))
    }

    /// Get parent directory
    ///
    /// `/a` has the root as parent; the root and single-segment relative paths have none.
    pub fn parent(&self) -> Option<Self> {
        match self.segments.len() {
            0 => None,
            1 if self.absolute => Some(self.context.root()),
            1 => None,
            n => Some(self.with_segments(self.absolute, self.segments[..n - 1].to_vec())),
        }
    }

    pub fn name_count(&self) -> usize {
        self.segments.len()
    }

    /// Segment at `index` as a relative path
    pub fn name(&self, index: usize) -> Result<Self> {
        match self.segments.get(index) {
            Some(name) => Ok(self.with_segments(false, vec![name.clone()])),
            None => Err(FsError::IndexOutOfRange(format!(
                "name({}) on '{}' with {} segments",
                index,
                self,
                self.segments.len()
            ))),
        }
    }

    /// Relative path made of the segments in `begin..end`
    pub fn subpath(&self, begin: usize, end: usize) -> Result<Self> {
        if begin >= end || end > self.segments.len() {
            return Err(FsError::IndexOutOfRange(format!(
                "subpath({}, {}) on '{}' with {} segments",
                begin,
                end,
                self,
                self.segments.len()
            )));
        }
        Ok(self.with_segments(false, self.segments[begin..end].to_vec()))
    }

    /// Segment-prefix test; every absolute path starts with the root
    pub fn starts_with(&self, other: &Self) -> Result<bool> {
        self.check_context(other)?;

        if self.absolute != other.absolute {
            return Ok(false);
        }
        if other.is_empty() {
            return Ok(self.is_empty());
        }
        Ok(self.segments.starts_with(&other.segments))
    }

    pub fn starts_with_str(&self, other: &str) -> Result<bool> {
        self.starts_with(&Self::parse(other, &self.context)?)
    }

    /// Segment-suffix test
    ///
    /// An absolute suffix is anchored at the root, so it only matches the whole path.
    pub fn ends_with(&self, other: &Self) -> Result<bool> {
        self.check_context(other)?;

        if self.absolute != other.absolute {
            return Ok(false);
        }
        if other.is_empty() {
            return Ok(self.is_empty());
        }
        if other.absolute {
            return Ok(self.segments == other.segments);
        }
        Ok(self.segments.ends_with(&other.segments))
    }

    pub fn ends_with_str(&self, other: &str) -> Result<bool> {
        self.ends_with(&Self::parse(other, &self.context)?)
    }

    /// Lexically remove `.` and `..` segments
    ///
    /// A `..` with nothing left to pop is kept on a relative path (`a/../..` is `..`) and
    /// dropped on an absolute one (`/..` is `/`).
    pub fn normalize(&self) -> Self {
        let mut out: Vec<String> = Vec::with_capacity(self.segments.len());

        for segment in &self.segments {
            match segment.as_str() {
                CURRENT_DIR => {}
                PARENT_DIR => match out.last() {
                    Some(last) if last != PARENT_DIR => {
                        out.pop();
                    }
                    _ if self.absolute => {}
                    _ => out.push(segment.clone()),
                },
                _ => out.push(segment.clone()),
            }
        }

        self.with_segments(self.absolute, out)
    }

    /// Append `other` to this path
    ///
    /// An absolute `other` (or resolving against the bare root) yields `other` as an
    /// absolute path; an empty `other` yields this path.
    pub fn resolve(&self, other: &Self) -> Result<Self> {
        self.check_context(other)?;

        if other.absolute || self.is_root() {
            return Ok(self.with_segments(true, other.segments.clone()));
        }
        if other.segments.is_empty() {
            return Ok(self.clone());
        }

        let mut segments = Vec::with_capacity(self.segments.len() + other.segments.len());
        segments.extend_from_slice(&self.segments);
        segments.extend_from_slice(&other.segments);
        Ok(self.with_segments(self.absolute, segments))
    }

    pub fn resolve_str(&self, other: &str) -> Result<Self> {
        self.resolve(&Self::parse(other, &self.context)?)
    }

    /// Resolve `other` against this path's parent
    pub fn resolve_sibling(&self, other: &Self) -> Result<Self> {
        match self.parent() {
            Some(parent) => parent.resolve(other),
            None => {
                self.check_context(other)?;
                Ok(other.clone())
            }
        }
    }

    pub fn resolve_sibling_str(&self, other: &str) -> Result<Self> {
        self.resolve_sibling(&Self::parse(other, &self.context)?)
    }

    /// Relative path leading from this path to `other`
    ///
    /// Both paths must be absolute and share a context.
    pub fn relativize(&self, other: &Self) -> Result<Self> {
        if self.context != other.context {
            return Err(FsError::InvalidArgument(format!(
                "cannot relativize across contexts {} and {}",
                self.context.authority(),
                other.context.authority()
            )));
        }
        if !self.absolute || !other.absolute {
            return Err(FsError::InvalidArgument(format!(
                "relativize needs two absolute paths, got '{}' and '{}'",
                self, other
            )));
        }

        let common = self
            .segments
            .iter()
            .zip(&other.segments)
            .take_while(|(a, b)| a == b)
            .count();

        let mut segments = vec![PARENT_DIR.to_string(); self.segments.len() - common];
        segments.extend_from_slice(&other.segments[common..]);
        Ok(self.with_segments(false, segments))
    }

    /// Compare two paths of the same context
    pub fn compare_to(&self, other: &Self) -> Result<Ordering> {
        self.check_context(other)?;
        Ok(self.cmp(other))
    }

    /// Resolve against the context root (there is no working directory)
    pub fn to_absolute(&self) -> Self {
        if self.absolute {
            self.clone()
        } else {
            self.with_segments(true, self.segments.clone())
        }
    }

    /// Iterate over the segments as single-segment relative paths
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            path: self,
            front: 0,
            back: self.segments.len(),
        }
    }

    fn check_context(&self, other: &Self) -> Result<()> {
        if self.context == other.context {
            Ok(())
        } else {
            Err(FsError::IncompatibleContext(
                self.context.authority().to_string(),
                other.context.authority().to_string(),
            ))
        }
    }
}

impl Ord for FsPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.context
            .authority()
            .cmp(other.context.authority())
            .then_with(|| self.segments.cmp(&other.segments))
            .then_with(|| self.absolute.cmp(&other.absolute))
    }
}

impl PartialOrd for FsPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute {
            write!(f, "{}", SEPARATOR)?;
        }
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", SEPARATOR)?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FsPath({:?} @ {})", self.to_string(), self.context.authority())
    }
}

impl Serialize for FsPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Iterator over the segments of an [`FsPath`]
pub struct Iter<'a> {
    path: &'a FsPath,
    front: usize,
    back: usize,
}

impl<'a> Iter<'a> {
    fn segment(&self, index: usize) -> FsPath {
        self.path
            .with_segments(false, vec![self.path.segments[index].clone()])
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = FsPath;

    fn next(&mut self) -> Option<FsPath> {
        if self.front >= self.back {
            return None;
        }
        let item = self.segment(self.front);
        self.front += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl<'a> DoubleEndedIterator for Iter<'a> {
    fn next_back(&mut self) -> Option<FsPath> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        Some(self.segment(self.back))
    }
}

impl<'a> ExactSizeIterator for Iter<'a> {}

impl<'a> IntoIterator for &'a FsPath {
    type Item = FsPath;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FsContext {
        FsContext::new("test")
    }

    fn p(raw: &str) -> FsPath {
        FsPath::parse(raw, &ctx()).unwrap()
    }

    #[test]
    fn test_parse() {
        let root = p("/");
        assert!(root.is_absolute());
        assert!(root.is_root());
        assert_eq!(root.name_count(), 0);

        let path = p("/foo/bar/");
        assert!(path.is_absolute());
        assert_eq!(path.segments(), &["foo".to_string(), "bar".to_string()]);

        let rel = p("foo//bar");
        assert!(!rel.is_absolute());
        assert_eq!(rel.name_count(), 2);

        assert!(p("").is_empty());
        assert_eq!(p("//"), root);
    }

    #[test]
    fn test_parse_rejects_nul() {
        let err = FsPath::parse("a\0b", &ctx()).unwrap_err();
        assert!(matches!(err, FsError::InvalidPath(_)));
    }

    #[test]
    fn test_display_round_trip() {
        for raw in ["/", "/a", "/a/b/c", "a", "a/b/c", "/a/b/", "a/", ""] {
            let parsed = p(raw);
            assert_eq!(p(&parsed.to_string()), parsed, "round trip of {:?}", raw);
        }
        assert_eq!(p("/").to_string(), "/");
        assert_eq!(p("/a/b/").to_string(), "/a/b");
        assert_eq!(p("a/b").to_string(), "a/b");
    }

    #[test]
    fn test_context_equality() {
        let a = FsPath::parse("/x", &FsContext::new("one")).unwrap();
        let b = FsPath::parse("/x", &FsContext::new("two")).unwrap();
        let c = FsPath::parse("/x", &FsContext::new("one")).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_eq!(FsContext::new("one").id(), FsContext::new("one").id());
        assert_ne!(p("/x"), p("x"));
    }

    #[test]
    fn test_root_file_name_parent() {
        assert_eq!(p("/a/b").root(), Some(p("/")));
        assert_eq!(p("a/b").root(), None);

        assert_eq!(p("/a/b").file_name(), Some(p("b")));
        assert_eq!(p("/").file_name(), None);

        assert_eq!(p("/a/b").parent(), Some(p("/a")));
        assert_eq!(p("/a").parent(), Some(p("/")));
        assert_eq!(p("a/b").parent(), Some(p("a")));
        assert_eq!(p("a").parent(), None);
        assert_eq!(p("/").parent(), None);
    }

    #[test]
    fn test_name_and_subpath() {
        let path = p("/a/b/c");
        assert_eq!(path.name(0).unwrap(), p("a"));
        assert_eq!(path.name(2).unwrap(), p("c"));
        assert!(matches!(path.name(3), Err(FsError::IndexOutOfRange(_))));

        assert_eq!(path.subpath(1, 3).unwrap(), p("b/c"));
        assert!(!path.subpath(0, 1).unwrap().is_absolute());
        assert!(matches!(path.subpath(2, 2), Err(FsError::IndexOutOfRange(_))));
        assert!(matches!(path.subpath(1, 4), Err(FsError::IndexOutOfRange(_))));

        assert!(matches!(p("/").name(0), Err(FsError::IndexOutOfRange(_))));
        assert!(matches!(p("/").subpath(0, 1), Err(FsError::IndexOutOfRange(_))));
    }

    #[test]
    fn test_starts_with() {
        assert!(p("/foo").starts_with(&p("/")).unwrap());
        assert!(p("/foo/bar").starts_with(&p("/foo")).unwrap());
        assert!(!p("/foo/bar").starts_with(&p("/fo")).unwrap());
        assert!(!p("foo/bar").starts_with(&p("/foo")).unwrap());
        assert!(!p("/foo").starts_with(&p("foo")).unwrap());
        assert!(p("foo/bar").starts_with(&p("foo")).unwrap());
        assert!(!p("foo").starts_with(&p("")).unwrap());
        assert!(p("").starts_with(&p("")).unwrap());
        assert!(p("/a/b").starts_with_str("/a").unwrap());
    }

    #[test]
    fn test_ends_with() {
        assert!(p("foo/bar").ends_with(&p("bar")).unwrap());
        assert!(!p("foo/bar").ends_with(&p("/bar")).unwrap());
        assert!(p("foo/bar").ends_with(&p("foo/bar")).unwrap());
        assert!(!p("foo/bar").ends_with(&p("o/bar")).unwrap());
        assert!(p("/foo/bar").ends_with(&p("/foo/bar")).unwrap());
        assert!(!p("/foo/bar").ends_with(&p("/bar")).unwrap());
        assert!(p("/").ends_with(&p("/")).unwrap());
        assert!(p("a/b").ends_with_str("b").unwrap());
    }

    #[test]
    fn test_cross_context_fails() {
        let other = FsPath::parse("/foo", &FsContext::new("elsewhere")).unwrap();
        let here = p("/foo");

        assert!(matches!(here.starts_with(&other), Err(FsError::IncompatibleContext(..))));
        assert!(matches!(here.ends_with(&other), Err(FsError::IncompatibleContext(..))));
        assert!(matches!(here.resolve(&other), Err(FsError::IncompatibleContext(..))));
        assert!(matches!(here.compare_to(&other), Err(FsError::IncompatibleContext(..))));
        assert!(matches!(here.relativize(&other), Err(FsError::InvalidArgument(_))));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(p("foo/baz/../bar").normalize(), p("foo/bar"));
        assert_eq!(p("foo/./bar").normalize(), p("foo/bar"));
        assert_eq!(p("/a/./b/../../c").normalize(), p("/c"));
        assert_eq!(p("./.").normalize(), p(""));
    }

    #[test]
    fn test_normalize_leading_parent_policy() {
        // relative paths keep unmatched `..`
        assert_eq!(p("../a").normalize(), p("../a"));
        assert_eq!(p("a/../..").normalize(), p(".."));
        assert_eq!(p("../../x/..").normalize(), p("../.."));

        // absolute paths cannot climb above the root
        assert_eq!(p("/..").normalize(), p("/"));
        assert_eq!(p("/a/../../b").normalize(), p("/b"));
    }

    #[test]
    fn test_resolve() {
        assert_eq!(p("/a").resolve(&p("b/c")).unwrap(), p("/a/b/c"));
        assert_eq!(p("a").resolve(&p("b")).unwrap(), p("a/b"));
        assert_eq!(p("/a").resolve(&p("/x")).unwrap(), p("/x"));
        assert_eq!(p("/").resolve(&p("x")).unwrap(), p("/x"));
        assert_eq!(p("/a/b").resolve(&p("")).unwrap(), p("/a/b"));
        assert_eq!(p("/a").resolve_str("b").unwrap(), p("/a/b"));
    }

    #[test]
    fn test_resolve_sibling() {
        assert_eq!(p("/a/b").resolve_sibling(&p("c")).unwrap(), p("/a/c"));
        assert_eq!(p("/a").resolve_sibling(&p("c")).unwrap(), p("/c"));
        assert_eq!(p("a").resolve_sibling(&p("c")).unwrap(), p("c"));
        assert_eq!(p("/a/b").resolve_sibling_str("/z").unwrap(), p("/z"));
    }

    #[test]
    fn test_relativize() {
        assert_eq!(p("/a/b").relativize(&p("/a/b/c/d")).unwrap(), p("c/d"));
        assert_eq!(p("/a/b").relativize(&p("/a/x")).unwrap(), p("../x"));
        assert_eq!(p("/a/b").relativize(&p("/")).unwrap(), p("../.."));
        assert!(p("/a").relativize(&p("/a")).unwrap().is_empty());
        assert!(matches!(p("a").relativize(&p("/a")), Err(FsError::InvalidArgument(_))));
        assert!(matches!(p("/a").relativize(&p("a")), Err(FsError::InvalidArgument(_))));
    }

    #[test]
    fn test_relativize_then_resolve_returns_target() {
        let paths = ["/", "/a", "/a/b", "/a/b/c", "/a/x", "/q/r/s", "/a/b/c/d"];
        for from in paths {
            for to in paths {
                let (from, to) = (p(from), p(to));
                let rel = from.relativize(&to).unwrap();
                assert!(!rel.is_absolute());
                assert_eq!(from.resolve(&rel).unwrap().normalize(), to, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_compare_to() {
        assert_eq!(p("/foo").compare_to(&p("/bar")).unwrap(), Ordering::Greater);
        assert_eq!(p("/").compare_to(&p("/foo")).unwrap(), Ordering::Less);
        assert_eq!(p("/a").compare_to(&p("/a/b")).unwrap(), Ordering::Less);
        assert_eq!(p("/a/b").compare_to(&p("/a/b")).unwrap(), Ordering::Equal);
        assert_ne!(p("a").compare_to(&p("/a")).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_ordering_is_total_and_consistent() {
        let paths: Vec<FsPath> = ["/", "/a", "a", "/a/b", "/b", "b/a", "", "/a/a"]
            .iter()
            .map(|raw| p(raw))
            .collect();

        for x in &paths {
            for y in &paths {
                let xy = x.compare_to(y).unwrap();
                assert_eq!(xy, y.compare_to(x).unwrap().reverse());
                assert_eq!(xy == Ordering::Equal, x == y);
                for z in &paths {
                    if xy == Ordering::Less && y.cmp(z) == Ordering::Less {
                        assert_eq!(x.cmp(z), Ordering::Less);
                    }
                }
            }
        }
    }

    #[test]
    fn test_iteration() {
        let path = p("/a/b/c");
        let names: Vec<FsPath> = path.iter().collect();
        assert_eq!(names, vec![p("a"), p("b"), p("c")]);
        assert!(names.iter().all(|n| !n.is_absolute()));

        // restartable
        assert_eq!(path.iter().count(), 3);
        assert_eq!((&path).into_iter().len(), 3);
        assert_eq!(path.iter().rev().next(), Some(p("c")));

        assert_eq!(p("/").iter().next(), None);
    }

    #[test]
    fn test_to_absolute() {
        assert_eq!(p("a/b").to_absolute(), p("/a/b"));
        assert_eq!(p("/a").to_absolute(), p("/a"));
        assert_eq!(p("").to_absolute(), p("/"));
    }

    #[test]
    fn test_serialize_as_string() {
        let json = serde_json::to_string(&p("/a/b")).unwrap();
        assert_eq!(json, "\"/a/b\"");
    }
}
