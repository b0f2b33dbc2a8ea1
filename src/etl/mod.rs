use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;
use whatlang::{detect, Lang};

const UNWANTED_TAGS: &str = "nav, footer, aside, script, style, noscript";

/// Canonical parsed form of a fetched page; everything the indexer writes
/// comes from here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedDocument {
    pub url: String,
    pub title: String,
    pub content: String,
    pub authors: Vec<String>,
    pub company: String,
    pub published_at: Option<String>,
    pub canonical_url: Option<String>,
    pub language: Option<String>,
}

fn detach_unwanted(doc: &mut Html) {
    let Ok(selector) = Selector::parse(UNWANTED_TAGS) else {
        return;
    };
    let ids: Vec<_> = doc.select(&selector).map(|el| el.id()).collect();
    for id in ids {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }
}

/// Content container preference: article > main > body > whole document.
fn select_container(doc: &Html) -> Option<ElementRef<'_>> {
    for tag in ["article", "main", "body"] {
        if let Ok(selector) = Selector::parse(tag) {
            if let Some(element) = doc.select(&selector).next() {
                return Some(element);
            }
        }
    }
    None
}

fn normalized_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Serialized HTML of the cleaned content container — what gets archived as
/// the "cleaned" variant of a page.
pub fn clean_html(html: &str) -> String {
    let mut doc = Html::parse_document(html);
    detach_unwanted(&mut doc);
    match select_container(&doc) {
        Some(element) => element.html(),
        None => doc.root_element().html(),
    }
}

/// Whitespace-normalized visible text of the cleaned content container.
pub fn extract_text(html: &str) -> String {
    let mut doc = Html::parse_document(html);
    detach_unwanted(&mut doc);
    match select_container(&doc) {
        Some(element) => normalized_text(element),
        None => normalized_text(doc.root_element()),
    }
}

/// First matching `<meta property|name=...>` content attribute.
fn extract_meta(doc: &Html, names: &[&str]) -> Option<String> {
    for name in names {
        for attr in ["property", "name"] {
            let Ok(selector) = Selector::parse(&format!("meta[{attr}=\"{name}\"]")) else {
                continue;
            };
            if let Some(content) = doc
                .select(&selector)
                .next()
                .and_then(|el| el.value().attr("content"))
            {
                let content = content.trim();
                if !content.is_empty() {
                    return Some(content.to_string());
                }
            }
        }
    }
    None
}

fn extract_title(doc: &Html) -> String {
    if let Some(meta) = extract_meta(doc, &["og:title", "twitter:title"]) {
        return meta;
    }
    if let Ok(selector) = Selector::parse("title") {
        if let Some(element) = doc.select(&selector).next() {
            return element.text().collect::<String>().trim().to_string();
        }
    }
    String::new()
}

fn extract_canonical(doc: &Html) -> Option<String> {
    if let Some(meta) = extract_meta(doc, &["og:url"]) {
        return Some(meta);
    }
    let selector = Selector::parse("link[rel=\"canonical\"]").ok()?;
    doc.select(&selector)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(|href| href.trim().to_string())
        .filter(|href| !href.is_empty())
}

fn extract_authors(doc: &Html) -> Vec<String> {
    let mut authors = Vec::new();
    if let Some(meta) = extract_meta(doc, &["author", "article:author"]) {
        for part in meta.split(',') {
            let part = part.trim();
            if !part.is_empty() {
                authors.push(part.to_string());
            }
        }
    }
    if let Ok(selector) = Selector::parse("[rel=\"author\"]") {
        for element in doc.select(&selector) {
            let text = element.text().collect::<String>().trim().to_string();
            if !text.is_empty() && !authors.contains(&text) {
                authors.push(text);
            }
        }
    }
    authors
}

fn extract_published_at(doc: &Html) -> Option<String> {
    if let Some(meta) = extract_meta(
        doc,
        &[
            "article:published_time",
            "article:modified_time",
            "publish_date",
        ],
    ) {
        return Some(meta);
    }
    let selector = Selector::parse("time").ok()?;
    let time = doc.select(&selector).next()?;
    if let Some(datetime) = time.value().attr("datetime") {
        return Some(datetime.trim().to_string());
    }
    let text = time.text().collect::<String>().trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn extract_language(doc: &Html, content: &str) -> Option<String> {
    if let Some(meta) = extract_meta(doc, &["og:locale", "language"]) {
        return Some(meta);
    }
    // Content-based fallback for blogs that skip the locale meta entirely.
    if content.len() < 80 {
        return None;
    }
    detect(content).map(|info| match info.lang() {
        Lang::Eng => "en".to_string(),
        Lang::Spa => "es".to_string(),
        Lang::Fra => "fr".to_string(),
        Lang::Deu => "de".to_string(),
        Lang::Por => "pt".to_string(),
        Lang::Jpn => "ja".to_string(),
        Lang::Kor => "ko".to_string(),
        Lang::Cmn => "zh".to_string(),
        other => format!("{other:?}").to_lowercase(),
    })
}

fn company_from_url(url: &str) -> String {
    let domain = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_default();
    if domain.contains("fb.com") || domain.contains("meta") {
        return "Meta".to_string();
    }
    domain
}

/// Parse raw page HTML into the canonical document form. Parsing never
/// fails — a degenerate page yields empty fields, not an error.
pub fn parse_html(url: &str, html: &str) -> ParsedDocument {
    let mut doc = Html::parse_document(html);
    detach_unwanted(&mut doc);
    let content = match select_container(&doc) {
        Some(element) => normalized_text(element),
        None => normalized_text(doc.root_element()),
    };
    let language = extract_language(&doc, &content);
    ParsedDocument {
        url: url.to_string(),
        title: extract_title(&doc),
        authors: extract_authors(&doc),
        company: company_from_url(url),
        published_at: extract_published_at(&doc),
        canonical_url: extract_canonical(&doc),
        language,
        content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTICLE: &str = r#"<!doctype html>
        <html><head>
          <title>Fallback Title</title>
          <meta property="og:title" content="Scaling the Feed"/>
          <meta property="og:url" content="https://engineering.fb.com/2024/01/15/systems/foo"/>
          <meta name="author" content="Ada Lovelace, Grace Hopper"/>
          <meta property="article:published_time" content="2024-01-15T10:00:00Z"/>
          <meta property="og:locale" content="en_US"/>
        </head><body>
          <nav>Home About</nav>
          <article>
            <h1>Scaling the Feed</h1>
            <p>We moved the ranking   pipeline to a new
               streaming engine.</p>
            <a rel="author">Linus T</a>
            <script>var hidden = 1;</script>
          </article>
          <footer>© 2024</footer>
        </body></html>"#;

    #[test]
    fn parse_html_extracts_the_article() {
        let doc = parse_html("https://engineering.fb.com/2024/01/15/systems/foo", ARTICLE);
        assert_eq!(doc.title, "Scaling the Feed");
        assert_eq!(
            doc.canonical_url.as_deref(),
            Some("https://engineering.fb.com/2024/01/15/systems/foo")
        );
        assert_eq!(
            doc.authors,
            vec!["Ada Lovelace", "Grace Hopper", "Linus T"]
        );
        assert_eq!(doc.published_at.as_deref(), Some("2024-01-15T10:00:00Z"));
        assert_eq!(doc.language.as_deref(), Some("en_US"));
        assert_eq!(doc.company, "Meta");
        assert!(doc.content.contains("ranking pipeline"));
        assert!(!doc.content.contains("hidden"));
        assert!(!doc.content.contains("Home About"));
        assert!(!doc.content.contains("© 2024"));
    }

    #[test]
    fn title_falls_back_to_title_tag() {
        let html = "<html><head><title> Plain Title </title></head><body><p>x</p></body></html>";
        let doc = parse_html("https://slack.engineering/plain", html);
        assert_eq!(doc.title, "Plain Title");
        assert_eq!(doc.company, "slack.engineering");
    }

    #[test]
    fn published_at_falls_back_to_time_tag() {
        let html = r#"<html><body><article>
            <time datetime="2023-06-01">June 1</time><p>body</p>
        </article></body></html>"#;
        let doc = parse_html("https://slack.engineering/p", html);
        assert_eq!(doc.published_at.as_deref(), Some("2023-06-01"));
    }

    #[test]
    fn degenerate_html_degrades_to_empty_fields() {
        let doc = parse_html("https://slack.engineering/x", "<<<not really html");
        assert!(doc.title.is_empty());
        assert!(doc.authors.is_empty());
        assert!(doc.published_at.is_none());
    }

    #[test]
    fn clean_html_drops_unwanted_subtrees() {
        let cleaned = clean_html(ARTICLE);
        assert!(cleaned.contains("<article>"));
        assert!(!cleaned.contains("<script>"));
        assert!(!cleaned.contains("<nav>"));
    }

    #[test]
    fn extract_text_normalizes_whitespace() {
        let text = extract_text(ARTICLE);
        assert!(text.contains("We moved the ranking pipeline"));
        assert!(!text.contains('\n'));
    }
}
