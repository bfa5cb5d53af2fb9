//! Path splitting.
//!
//! Paths are `/`-separated; runs of slashes collapse and a leading slash is
//! optional (everything resolves from the root). A trailing slash names the
//! directory itself rather than an entry in it.

use crate::error::Error;
use crate::param::NAME_MAX;

/// Split off the next path element.
///
/// Returns `Some((name, rest))` where `name` is the first component and
/// `rest` is the remainder (possibly with leading slashes), or `None` when
/// no component is left.
///
/// ```text
/// skip_elem("a/bb/c")  == Some(("a", "bb/c"))
/// skip_elem("///a//b") == Some(("a", "/b"))
/// skip_elem("a")       == Some(("a", ""))
/// skip_elem("////")    == None
/// ```
pub(crate) fn skip_elem(path: &str) -> Option<(&str, &str)> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return None;
    }
    match path.find('/') {
        Some(pos) => Some((&path[..pos], path[pos..].trim_start_matches('/'))),
        None => Some((path, "")),
    }
}

/// Split a path into the directory part and the final component.
///
/// The directory part keeps its trailing slash so it resolves as a
/// directory; a path with no final component (the root, or all slashes)
/// is rejected.
pub(crate) fn split_parent(path: &str) -> Result<(&str, &str), Error> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::BadPath);
    }
    let (dir, base) = match trimmed.rfind('/') {
        Some(pos) => (&trimmed[..pos + 1], &trimmed[pos + 1..]),
        None => ("", trimmed),
    };
    check_name(base)?;
    Ok((dir, base))
}

/// Validate a single component for use as a new or removed entry name.
pub(crate) fn check_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::BadPath);
    }
    if name.len() > NAME_MAX {
        return Err(Error::NameTooLong);
    }
    Ok(())
}
