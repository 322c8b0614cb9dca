use http::uri::{InvalidUri, InvalidUriParts, PathAndQuery, Uri};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UriError {
    #[error(transparent)]
    InvalidUri(#[from] InvalidUri),

    #[error(transparent)]
    InvalidUriParts(#[from] InvalidUriParts),
}

/// Join a path (and optional query string) onto a base URI, keeping any path
/// prefix the base already carries.
pub fn make_uri(base_uri: &Uri, path: &str, query: Option<&str>) -> Result<Uri, UriError> {
    let prefix = base_uri.path().trim_end_matches('/');
    let path_and_query = if let Some(qs) = query {
        PathAndQuery::from_maybe_shared(format!("{prefix}{path}?{qs}"))?
    } else {
        PathAndQuery::from_maybe_shared(format!("{prefix}{path}"))?
    };

    let mut parts = base_uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    Uri::from_parts(parts).map_err(|err| err.into())
}
