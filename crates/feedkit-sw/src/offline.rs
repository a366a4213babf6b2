//! Offline fallback documents and the URLs used to look them up.

use feedkit_net::Response;
use http::StatusCode;
use url::Url;

/// Self-contained offline page served when no cached fallback exists.
pub const OFFLINE_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>You're Offline</title>
<style>
  body { margin: 0; min-height: 100vh; display: flex; align-items: center;
         justify-content: center; font-family: system-ui, -apple-system, "Segoe UI", sans-serif;
         background: #0b0b0f; color: #f4f4f5; }
  main { text-align: center; padding: 2rem; max-width: 28rem; }
  h1 { font-size: 1.75rem; margin: 0 0 0.75rem; }
  p { color: #a1a1aa; line-height: 1.5; margin: 0 0 1.5rem; }
  button { border: 0; border-radius: 9999px; padding: 0.75rem 1.75rem; font-size: 1rem;
           background: #f4f4f5; color: #0b0b0f; cursor: pointer; }
</style>
</head>
<body>
<main>
  <h1>You're Offline</h1>
  <p>Check your connection. Your feed will be back as soon as you are.</p>
  <button type="button" onclick="window.location.reload()">Try again</button>
</main>
</body>
</html>
"#;

/// Inline offline page with status 503. Uses neither cache nor network.
pub fn inline_offline_response(url: &Url) -> Response {
    Response::synthesized(
        url.clone(),
        StatusCode::SERVICE_UNAVAILABLE,
        "text/html; charset=utf-8",
        OFFLINE_HTML,
    )
}

/// Generic 503 for requests that do not accept HTML.
pub fn service_unavailable(url: &Url) -> Response {
    Response::synthesized(
        url.clone(),
        StatusCode::SERVICE_UNAVAILABLE,
        "text/plain; charset=utf-8",
        "Service Unavailable",
    )
}

/// `<offline_page>?from=<path>` resolved against the scope origin.
pub fn tagged_offline_url(scope: &Url, offline_page: &str, from: &str) -> Option<Url> {
    let mut url = scope.join(offline_page).ok()?;
    url.query_pairs_mut().append_pair("from", from);
    Some(url)
}

/// Untagged offline page URL.
pub fn offline_url(scope: &Url, offline_page: &str) -> Option<Url> {
    scope.join(offline_page).ok()
}

/// The cache-busting URL install stores an asset under: `url?v=<version>`.
///
/// Existing query pairs are kept; a URL that already carries `v` is returned as is.
pub fn versioned_url(url: &Url, version: &str) -> Url {
    if url.query_pairs().any(|(key, _)| key == "v") {
        return url.clone();
    }
    let mut versioned = url.clone();
    versioned.query_pairs_mut().append_pair("v", version);
    versioned
}

/// Whether `key` is `page?v=<any version>`: same origin and path, and `v` as
/// the only query pair.
pub fn is_versioned_copy(page: &Url, key: &str) -> bool {
    let Ok(key) = Url::parse(key) else {
        return false;
    };
    if key.origin() != page.origin() || key.path() != page.path() {
        return false;
    }
    let mut pairs = key.query_pairs();
    matches!(pairs.next(), Some((name, _)) if name == "v") && pairs.next().is_none()
}
