use url::Url;

use crate::error::DashlingResult;

pub(crate) fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://")
        || s.starts_with("https://")
        || s.starts_with("file://")
        || s.starts_with("ftp://")
}

/// Resolves `new` against `current`.
///
/// A relative reference inherits the query of `current` unless it carries
/// its own, so signed manifest URLs keep working for fragments:
///
/// merge_baseurls(https://example.com/manifest.mpd?auth=secret, /video42.mp4) =>
///   https://example.com/video42.mp4?auth=secret
pub(crate) fn merge_baseurls(current: &Url, new: &str) -> DashlingResult<Url> {
    if is_absolute_url(new) {
        return Ok(Url::parse(new)?);
    }

    let mut merged = current.join(new)?;
    if merged.query().is_none() {
        merged.set_query(current.query());
    }
    Ok(merged)
}
