//! Request classification.

use feedkit_net::Request;
use http::Method;
use url::Url;

use crate::config::ControllerConfig;

/// Store a stale-while-revalidate request is cached in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Static,
    Images,
}

/// Why a request is left to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    Method,
    Scheme,
    Api,
    Unclassified,
}

/// Strategy chosen for an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    PassThrough(PassReason),
    /// Root, auth pages and auth API: network with offline page fallback.
    Auth,
    CacheFirst,
    StaleWhileRevalidate(StoreKind),
}

/// Pick the strategy for `request` as seen by a controller whose scope is `scope`.
pub fn classify(config: &ControllerConfig, scope: &Url, request: &Request) -> Route {
    if request.method != Method::GET {
        return Route::PassThrough(PassReason::Method);
    }
    if !matches!(request.url.scheme(), "http" | "https") {
        return Route::PassThrough(PassReason::Scheme);
    }

    let path = request.url.path();
    let same_origin = request.url.origin() == scope.origin();

    if same_origin {
        if is_auth_path(config, path) {
            return Route::Auth;
        }
        if path.starts_with(&config.api_prefix) {
            return Route::PassThrough(PassReason::Api);
        }
        if is_critical(config, path) {
            return Route::CacheFirst;
        }
    }

    let host_allowed = same_origin
        || request
            .url
            .host_str()
            .is_some_and(|host| config.is_cacheable_host(host));

    match extension(path) {
        Some(ext) if host_allowed && config.is_cacheable_extension(&ext) => {
            let kind = if config.is_image_extension(&ext) {
                StoreKind::Images
            } else {
                StoreKind::Static
            };
            Route::StaleWhileRevalidate(kind)
        }
        _ => Route::PassThrough(PassReason::Unclassified),
    }
}

fn matches_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path == "/";
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn is_auth_path(config: &ControllerConfig, path: &str) -> bool {
    path == "/"
        || config.auth_paths.iter().any(|p| matches_prefix(path, p))
        || matches_prefix(path, &config.auth_api_prefix)
}

/// Exact match, or suffix match for entries other than the bare root.
fn is_critical(config: &ControllerConfig, path: &str) -> bool {
    config
        .critical_assets
        .iter()
        .any(|asset| path == asset || (asset != "/" && path.ends_with(asset.as_str())))
}

/// Lowercased extension of the last path segment.
pub(crate) fn extension(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn scope() -> Url {
        Url::parse("https://app.example/").unwrap()
    }

    fn route(url: &str) -> Route {
        let config = ControllerConfig {
            cacheable_hosts: vec!["cdn.example".to_string()],
            ..Default::default()
        };
        classify(&config, &scope(), &Request::get(Url::parse(url).unwrap()))
    }

    #[test]
    fn test_non_get_passes_through() {
        let request = Request::post(
            Url::parse("https://app.example/globals.css").unwrap(),
            Bytes::new(),
        );
        assert_eq!(
            classify(&ControllerConfig::default(), &scope(), &request),
            Route::PassThrough(PassReason::Method)
        );
    }

    #[test]
    fn test_non_http_scheme_passes_through() {
        assert_eq!(
            route("chrome-extension://abc/logo.png"),
            Route::PassThrough(PassReason::Scheme)
        );
    }

    #[test]
    fn test_api_is_network_only() {
        assert_eq!(
            route("https://app.example/api/posts/feed.json"),
            Route::PassThrough(PassReason::Api)
        );
        assert_eq!(
            route("https://app.example/api/avatar.png"),
            Route::PassThrough(PassReason::Api)
        );
    }

    #[test]
    fn test_auth_paths() {
        assert_eq!(route("https://app.example/"), Route::Auth);
        assert_eq!(route("https://app.example/home"), Route::Auth);
        assert_eq!(route("https://app.example/auth/callback"), Route::Auth);
        assert_eq!(route("https://app.example/api/auth/session"), Route::Auth);
        assert_ne!(route("https://app.example/homework"), Route::Auth);
    }

    #[test]
    fn test_critical_assets_are_cache_first() {
        assert_eq!(route("https://app.example/globals.css"), Route::CacheFirst);
        assert_eq!(route("https://app.example/offline.html"), Route::CacheFirst);
        assert_eq!(route("https://app.example/v2/favicon.ico"), Route::CacheFirst);
    }

    #[test]
    fn test_bare_root_does_not_suffix_match() {
        assert_eq!(
            route("https://app.example/profile/"),
            Route::PassThrough(PassReason::Unclassified)
        );
    }

    #[test]
    fn test_images_and_static_extensions() {
        assert_eq!(
            route("https://app.example/img/pic.webp"),
            Route::StaleWhileRevalidate(StoreKind::Images)
        );
        assert_eq!(
            route("https://app.example/_next/static/chunk.JS"),
            Route::StaleWhileRevalidate(StoreKind::Static)
        );
    }

    #[test]
    fn test_cross_origin_requires_allowlist() {
        assert_eq!(
            route("https://cdn.example/media/post.jpg"),
            Route::StaleWhileRevalidate(StoreKind::Images)
        );
        assert_eq!(
            route("https://tracker.example/pixel.gif"),
            Route::PassThrough(PassReason::Unclassified)
        );
    }

    #[test]
    fn test_cross_origin_root_is_not_auth() {
        assert_eq!(
            route("https://cdn.example/"),
            Route::PassThrough(PassReason::Unclassified)
        );
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("/img/a.PNG").as_deref(), Some("png"));
        assert_eq!(extension("/profile"), None);
        assert_eq!(extension("/.well-known"), None);
        assert_eq!(extension("/dir.d/file"), None);
    }
}
