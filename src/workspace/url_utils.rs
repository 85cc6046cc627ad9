//! URL helpers shared by the facade and every backend
//!
//! Every entity is addressed by an absolute URL; directory URLs end in `/`.
//! Remote paths always use `/` regardless of the local OS.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use url::Url;

use super::error::FsError;

/// Characters escaped when a file name becomes a path segment
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

pub fn parse(url: &str) -> Result<Url, FsError> {
    Url::parse(url).map_err(|e| FsError::InvalidUrl(format!("{}: {}", url, e)))
}

pub fn is_directory_url(url: &Url) -> bool {
    url.path().ends_with('/')
}

/// Decoded path with any trailing slash removed (root stays `/`)
pub fn decoded_path(url: &Url) -> String {
    let decoded = percent_decode_str(url.path()).decode_utf8_lossy().into_owned();
    match decoded.trim_end_matches('/') {
        "" => "/".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// Last path segment, decoded
pub fn display_name(url: &Url) -> String {
    let path = decoded_path(url);
    match path.rsplit_once('/') {
        Some((_, name)) if !name.is_empty() => name.to_string(),
        _ => url.host_str().map(str::to_string).unwrap_or(path),
    }
}

pub fn as_directory(url: &Url) -> Url {
    let mut dir = url.clone();
    if !is_directory_url(&dir) {
        let path = format!("{}/", dir.path());
        dir.set_path(&path);
    }
    dir
}

pub fn as_file(url: &Url) -> Url {
    let mut file = url.clone();
    let trimmed = url.path().trim_end_matches('/');
    if !trimmed.is_empty() {
        file.set_path(trimmed);
    }
    file
}

/// Child of a directory URL; directories get the trailing slash
pub fn child_url(dir: &Url, name: &str, is_directory: bool) -> Result<Url, FsError> {
    // "./" keeps names like "a:b" from parsing as a scheme
    let mut segment = format!("./{}", utf8_percent_encode(name, SEGMENT));
    if is_directory {
        segment.push('/');
    }
    as_directory(dir)
        .join(&segment)
        .map_err(|e| FsError::InvalidUrl(format!("{}{}: {}", dir, name, e)))
}

/// Containing directory, or `None` at the root
pub fn parent_url(url: &Url) -> Option<Url> {
    let path = url.path().trim_end_matches('/');
    if path.is_empty() {
        return None;
    }
    let (parent, _) = path.rsplit_once('/')?;
    let mut out = url.clone();
    out.set_path(&format!("{}/", parent));
    out.set_query(None);
    out.set_fragment(None);
    Some(out)
}

/// Comparable form: no trailing slash, `/private` aliasing folded for local URLs
fn location_key(url: &Url) -> String {
    let mut path = decoded_path(url);
    if url.scheme() == "file" {
        let aliased = ["/private/var", "/private/tmp", "/private/etc"]
            .iter()
            .any(|alias| path == *alias || path.starts_with(&format!("{}/", alias)));
        if aliased {
            path = path["/private".len()..].to_string();
        }
    }
    format!(
        "{}://{}:{}{}",
        url.scheme(),
        url.host_str().unwrap_or(""),
        url.port_or_known_default().unwrap_or(0),
        path
    )
}

pub fn same_location(a: &Url, b: &Url) -> bool {
    location_key(a) == location_key(b)
}

/// Whether `descendant` lives strictly below `ancestor`
pub fn is_ancestor(ancestor: &Url, descendant: &Url) -> bool {
    let mut prefix = location_key(ancestor);
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    let candidate = location_key(descendant);
    candidate.len() > prefix.len() && candidate.starts_with(&prefix)
}

/// `name.ext` -> `name (n).ext`, keeping the directory marker
pub fn with_suffix(url: &Url, n: usize) -> Result<Url, FsError> {
    let name = display_name(url);
    let renamed = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{} ({}).{}", stem, n, ext),
        _ => format!("{} ({})", name, n),
    };
    let parent = parent_url(url).ok_or_else(|| FsError::InvalidUrl(url.to_string()))?;
    child_url(&parent, &renamed, is_directory_url(url))
}
