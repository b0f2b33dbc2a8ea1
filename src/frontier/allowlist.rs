use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use url::Url;

// ---------------------------------------------------------------------------
// Curated host allow-list. Article paths are matched per-host; the listing
// paths are the seed pages we crawl for links but never index.
// ---------------------------------------------------------------------------

static ALLOWED_URL_PATTERNS: LazyLock<HashMap<&'static str, Vec<Regex>>> = LazyLock::new(|| {
    let table: &[(&str, &[&str])] = &[
        ("engineering.fb.com", &[r"^/\d{4}/\d{2}/\d{2}/[^/]+/[^/]+$"]),
        ("builders.ramp.com", &[r"^/post/[^/]+$"]),
        ("airbnb.tech", &[r"^/[^/]+/[^/]+$"]),
        ("www.anthropic.com", &[r"^/engineering/[^/]+$"]),
        ("developers.openai.com", &[r"^/blog/[^/]+$"]),
        ("blog.cloudflare.com", &[r"^/[^/]+$"]),
        ("developers.googleblog.com", &[r"^/[^/]+$"]),
        ("www.notion.com", &[r"^/blog/[^/]+$"]),
        ("cursor.com", &[r"^/blog/[^/]+$"]),
        ("shopify.engineering", &[r"^/[^/]+$"]),
        ("netflixtechblog.com", &[r"^/[^/]+-[0-9a-f]{8,}$"]),
        ("github.blog", &[r"^/engineering/[^/]+/[^/]+$"]),
        ("engineering.atspotify.com", &[r"^/\d{4}/\d{1,2}/[^/]+$"]),
        ("slack.engineering", &[r"^/[^/]+$"]),
        ("stripe.com", &[r"^/blog/[^/]+$"]),
        ("www.uber.com", &[r"^/blog/[^/]+$"]),
    ];
    table
        .iter()
        .map(|(host, patterns)| {
            let compiled = patterns
                .iter()
                .map(|p| Regex::new(p).expect("static allow-list pattern"))
                .collect();
            (*host, compiled)
        })
        .collect()
});

static ALLOWED_SEED_PATHS: LazyLock<HashMap<&'static str, HashSet<&'static str>>> =
    LazyLock::new(|| {
        let table: &[(&str, &[&str])] = &[
            ("engineering.fb.com", &["/"]),
            ("builders.ramp.com", &["/"]),
            ("airbnb.tech", &["/"]),
            ("www.anthropic.com", &["/engineering"]),
            ("developers.openai.com", &["/blog"]),
            ("blog.cloudflare.com", &["/"]),
            ("developers.googleblog.com", &["/"]),
            ("www.notion.com", &["/blog"]),
            ("cursor.com", &["/blog"]),
            ("shopify.engineering", &["/"]),
            ("netflixtechblog.com", &["/"]),
            ("github.blog", &["/engineering"]),
            ("engineering.atspotify.com", &["/"]),
            ("slack.engineering", &["/"]),
            ("stripe.com", &["/blog"]),
            ("www.uber.com", &["/blog"]),
        ];
        table
            .iter()
            .map(|(host, paths)| (*host, paths.iter().copied().collect()))
            .collect()
    });

const DEFAULT_SITEMAP_PATHS: &[&str] = &["/sitemap.xml", "/sitemap_index.xml"];

static SITEMAP_PATHS: LazyLock<HashMap<&'static str, Vec<&'static str>>> = LazyLock::new(|| {
    HashMap::from([(
        "netflixtechblog.com",
        vec!["/sitemap/sitemap.xml", "/sitemap.xml"],
    )])
});

// ---------------------------------------------------------------------------
// URL normalization
// ---------------------------------------------------------------------------

/// Canonical URL form used everywhere a URL becomes a store key: defragment,
/// lowercase scheme/host, http(s) only, default ports dropped, trailing
/// slashes stripped off non-root paths. Returns None for anything that can't
/// be crawled. Idempotent.
pub fn normalize_url(url: &str) -> Option<String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut parsed = Url::parse(trimmed).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    parsed.host_str()?;
    parsed.set_fragment(None);
    let path = parsed.path();
    if path != "/" && path.ends_with('/') {
        let stripped = path.trim_end_matches('/').to_string();
        parsed.set_path(&stripped);
    }
    Some(parsed.to_string())
}

/// Host (with any non-default port) of a URL, or "" when unparseable.
pub fn parse_domain(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return String::new();
    };
    let Some(host) = parsed.host_str() else {
        return String::new();
    };
    match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn host_and_path(url: &str) -> Option<(String, String)> {
    let parsed = Url::parse(url).ok()?;
    let host = match parsed.port() {
        Some(port) => format!("{}:{}", parsed.host_str()?, port),
        None => parsed.host_str()?.to_string(),
    };
    let path = if parsed.path().is_empty() {
        "/".to_string()
    } else {
        parsed.path().to_string()
    };
    Some((host, path))
}

/// A URL is crawlable when it is a known listing page or matches one of its
/// host's article patterns.
pub fn is_allowed_url(url: &str) -> bool {
    let Some((host, path)) = host_and_path(url) else {
        return false;
    };
    if let Some(seed_paths) = ALLOWED_SEED_PATHS.get(host.as_str()) {
        if seed_paths.contains(path.as_str()) {
            return true;
        }
    }
    let Some(patterns) = ALLOWED_URL_PATTERNS.get(host.as_str()) else {
        return false;
    };
    patterns.iter().any(|p| p.is_match(&path))
}

/// Listing pages (blog indexes) are crawled for links but never persisted.
pub fn is_listing_url(url: &str) -> bool {
    let Some((host, path)) = host_and_path(url) else {
        return false;
    };
    ALLOWED_SEED_PATHS
        .get(host.as_str())
        .is_some_and(|paths| paths.contains(path.as_str()))
}

/// Sitemap candidates for an allow-listed domain.
pub fn sitemap_urls_for_domain(domain: &str) -> Vec<String> {
    if !ALLOWED_URL_PATTERNS.contains_key(domain) {
        return Vec::new();
    }
    let paths = SITEMAP_PATHS
        .get(domain)
        .map(|p| p.as_slice())
        .unwrap_or(DEFAULT_SITEMAP_PATHS);
    paths
        .iter()
        .map(|path| format!("https://{domain}{path}"))
        .collect()
}

pub fn is_sitemap_url(url: &str) -> bool {
    let Some((host, path)) = host_and_path(url) else {
        return false;
    };
    if !ALLOWED_URL_PATTERNS.contains_key(host.as_str()) {
        return false;
    }
    if path.ends_with(".xml") || path.contains("sitemap") {
        return true;
    }
    sitemap_urls_for_domain(&host).iter().any(|u| u == url)
}

// ---------------------------------------------------------------------------
// Sitemap XML
// ---------------------------------------------------------------------------

/// `<loc>` entries of a `urlset` / `sitemapindex` document. Anything that is
/// not well-formed sitemap XML degrades to an empty list.
pub fn parse_sitemap_links(xml_text: &str) -> Vec<String> {
    if !xml_text.trim_start().starts_with('<') {
        return Vec::new();
    }
    let mut reader = Reader::from_str(xml_text);
    let mut links = Vec::new();
    let mut seen = HashSet::new();
    let mut root_checked = false;
    let mut in_loc = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                let name = element.local_name();
                let name = name.as_ref();
                if !root_checked {
                    root_checked = true;
                    if name != b"urlset" && name != b"sitemapindex" {
                        return Vec::new();
                    }
                    continue;
                }
                in_loc = name == b"loc";
            }
            Ok(Event::Text(text)) => {
                if in_loc {
                    if let Ok(value) = text.unescape() {
                        let value = value.trim().to_string();
                        if !value.is_empty() && seen.insert(value.clone()) {
                            links.push(value);
                        }
                    }
                }
            }
            Ok(Event::End(_)) => in_loc = false,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return Vec::new(),
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_fragment_port_and_trailing_slash() {
        assert_eq!(
            normalize_url("HTTPS://Engineering.FB.com:443/2024/01/15/systems/foo/#anchor"),
            Some("https://engineering.fb.com/2024/01/15/systems/foo".to_string())
        );
        assert_eq!(
            normalize_url("http://example.com:80/"),
            Some("http://example.com/".to_string())
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in [
            "https://engineering.fb.com/2024/01/15/systems/foo/",
            "https://slack.engineering/",
            "http://example.com:8080/a/b/?q=1",
        ] {
            let once = normalize_url(raw).unwrap();
            assert_eq!(normalize_url(&once), Some(once.clone()));
        }
    }

    #[test]
    fn normalize_rejects_non_http_and_empty() {
        assert_eq!(normalize_url("ftp://example.com/x"), None);
        assert_eq!(normalize_url("mailto:dev@example.com"), None);
        assert_eq!(normalize_url("   "), None);
        assert_eq!(normalize_url("not a url"), None);
    }

    #[test]
    fn allow_list_accepts_articles_and_listings() {
        assert!(is_allowed_url(
            "https://engineering.fb.com/2024/01/15/systems/foo"
        ));
        assert!(is_allowed_url("https://engineering.fb.com/"));
        assert!(is_allowed_url("https://www.anthropic.com/engineering"));
        assert!(!is_allowed_url("https://engineering.fb.com/about"));
        assert!(!is_allowed_url("https://unknown-blog.example.com/post/x"));
    }

    #[test]
    fn listing_detection() {
        assert!(is_listing_url("https://engineering.fb.com/"));
        assert!(!is_listing_url(
            "https://engineering.fb.com/2024/01/15/systems/foo"
        ));
        assert!(!is_listing_url("https://unknown.example.com/"));
    }

    #[test]
    fn sitemap_urls_respect_overrides() {
        let urls = sitemap_urls_for_domain("netflixtechblog.com");
        assert_eq!(
            urls,
            vec![
                "https://netflixtechblog.com/sitemap/sitemap.xml".to_string(),
                "https://netflixtechblog.com/sitemap.xml".to_string(),
            ]
        );
        assert!(sitemap_urls_for_domain("unknown.example.com").is_empty());
        assert!(is_sitemap_url("https://slack.engineering/sitemap.xml"));
        assert!(!is_sitemap_url("https://unknown.example.com/sitemap.xml"));
    }

    #[test]
    fn sitemap_parse_extracts_loc_entries() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <url><loc>https://slack.engineering/post-one</loc></url>
              <url><loc> https://slack.engineering/post-two </loc></url>
              <url><loc>https://slack.engineering/post-one</loc></url>
            </urlset>"#;
        let links = parse_sitemap_links(xml);
        assert_eq!(
            links,
            vec![
                "https://slack.engineering/post-one".to_string(),
                "https://slack.engineering/post-two".to_string(),
            ]
        );
    }

    #[test]
    fn sitemap_parse_rejects_non_sitemap_documents() {
        assert!(parse_sitemap_links("<html><body>nope</body></html>").is_empty());
        assert!(parse_sitemap_links("not xml at all").is_empty());
        assert!(parse_sitemap_links("<urlset><loc>broken").is_empty());
    }
}
