use warp::http::Uri;

/// Accepts a WebSocket upgrade only from a page served by this same host,
/// over the same kind of transport.
pub fn is_allowed_origin(origin: Option<&str>, host: Option<&str>, tls: bool) -> bool {
    let (Some(origin), Some(host)) = (origin, host) else {
        return false;
    };

    let Ok(uri) = origin.parse::<Uri>() else {
        return false;
    };
    let Some(authority) = uri.authority() else {
        return false;
    };
    if authority.host().is_empty() || !authority.as_str().eq_ignore_ascii_case(host) {
        return false;
    }

    let expected = if tls { "https" } else { "http" };
    uri.scheme_str()
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case(expected))
}
