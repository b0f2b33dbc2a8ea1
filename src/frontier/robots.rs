use crate::core::config::Settings;
use crate::frontier::unix_now;
use crate::store::{hash_str, StoreClient};
use anyhow::Result;
use regex::Regex;
use robotstxt::DefaultMatcher;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

/// Parsed per-domain robots policy, cached in the store so every worker in
/// the fleet fetches `/robots.txt` at most once per domain.
#[derive(Debug, Clone)]
pub struct RobotsRules {
    pub domain: String,
    pub crawl_delay_s: u64,
    pub request_rate_s: u64,
    pub allowed: bool,
    pub fetched_at: i64,
    pub text: String,
}

impl RobotsRules {
    /// Effective minimum spacing between fetches of this domain.
    pub fn min_delay_s(&self) -> u64 {
        self.crawl_delay_s.max(self.request_rate_s)
    }

    /// Per-URL verdict for our user agent against the cached robots body.
    pub fn can_fetch(&self, user_agent: &str, url: &str) -> bool {
        DefaultMatcher::default().one_agent_allowed_by_robots(&self.text, user_agent, url)
    }
}

static REQUEST_RATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*/\s*([\d.]+)\s*([smhd])?\s*$").unwrap());

/// Seconds-per-request derived from a `Request-rate: N/T[unit]` value, or 0
/// when the value is malformed or degenerate.
fn parse_request_rate_value(value: &str) -> u64 {
    let Some(captures) = REQUEST_RATE_RE.captures(value) else {
        return 0;
    };
    let requests: u64 = captures[1].parse().unwrap_or(0);
    if requests == 0 {
        return 0;
    }
    let window: f64 = captures[2].parse().unwrap_or(0.0);
    let multiplier = match captures.get(3).map(|m| m.as_str()) {
        Some("m") => 60.0,
        Some("h") => 3600.0,
        Some("d") => 86400.0,
        _ => 1.0,
    };
    let window_s = window * multiplier;
    if window_s <= 0.0 {
        return 0;
    }
    (window_s / requests as f64).ceil() as u64
}

/// Group a robots body into (user-agents, directives) blocks. A new group
/// starts when a `User-agent` line follows at least one directive.
fn agent_groups(robots_txt: &str) -> Vec<(Vec<String>, Vec<String>)> {
    let mut groups = Vec::new();
    let mut agents: Vec<String> = Vec::new();
    let mut directives: Vec<String> = Vec::new();
    let mut seen_directive = false;
    for raw_line in robots_txt.lines() {
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let lower = line.to_ascii_lowercase();
        if let Some(agent) = lower.strip_prefix("user-agent:") {
            if !agents.is_empty() && seen_directive {
                groups.push((std::mem::take(&mut agents), std::mem::take(&mut directives)));
                seen_directive = false;
            }
            agents.push(agent.trim().to_string());
            continue;
        }
        if agents.is_empty() {
            continue;
        }
        directives.push(line.to_string());
        seen_directive = true;
    }
    if !agents.is_empty() {
        groups.push((agents, directives));
    }
    groups
}

/// Pull a `directive: value` out of the groups that apply to `user_agent`.
/// An exact user-agent match beats `*`; for wildcards the first value wins.
fn extract_directive(robots_txt: &str, user_agent: &str, directive: &str) -> Option<String> {
    let user_agent = user_agent.to_ascii_lowercase();
    let prefix = format!("{directive}:");
    let mut exact: Option<String> = None;
    let mut wildcard: Option<String> = None;
    for (agents, directives) in agent_groups(robots_txt) {
        let applies_exact = agents.iter().any(|a| *a == user_agent);
        let applies_wildcard = agents.iter().any(|a| a == "*");
        if !applies_exact && !applies_wildcard {
            continue;
        }
        for line in &directives {
            if !line.to_ascii_lowercase().starts_with(&prefix) {
                continue;
            }
            let value = line.splitn(2, ':').nth(1).unwrap_or("").trim().to_string();
            if value.is_empty() {
                continue;
            }
            if applies_exact {
                exact = Some(value);
            } else if wildcard.is_none() {
                wildcard = Some(value);
            }
        }
    }
    exact.or(wildcard)
}

fn extract_request_rate(robots_txt: &str, user_agent: &str) -> u64 {
    extract_directive(robots_txt, user_agent, "request-rate")
        .map(|v| parse_request_rate_value(&v))
        .unwrap_or(0)
}

fn extract_crawl_delay(robots_txt: &str, user_agent: &str) -> Option<u64> {
    extract_directive(robots_txt, user_agent, "crawl-delay")
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| *v >= 0.0)
        .map(|v| v as u64)
}

pub fn parse_robots(
    robots_txt: &str,
    domain: &str,
    user_agent: &str,
    default_delay_s: u64,
) -> RobotsRules {
    let allowed = DefaultMatcher::default().one_agent_allowed_by_robots(
        robots_txt,
        user_agent,
        &format!("https://{domain}/"),
    );
    RobotsRules {
        domain: domain.to_string(),
        crawl_delay_s: extract_crawl_delay(robots_txt, user_agent).unwrap_or(default_delay_s),
        request_rate_s: extract_request_rate(robots_txt, user_agent),
        allowed,
        fetched_at: unix_now(),
        text: robots_txt.to_string(),
    }
}

fn field_u64(map: &HashMap<String, Vec<u8>>, name: &str) -> u64 {
    hash_str(map, name).parse().unwrap_or(0)
}

/// Store-backed robots cache plus the per-domain fetch reservation.
#[derive(Clone)]
pub struct RobotsGate {
    store: StoreClient,
    http: reqwest::Client,
    user_agent: String,
    cache_prefix: String,
    next_allowed_prefix: String,
    default_delay_s: u64,
    request_timeout: Duration,
}

impl RobotsGate {
    pub fn new(store: StoreClient, http: reqwest::Client, settings: &Settings) -> Self {
        Self {
            store,
            http,
            user_agent: settings.user_agent.clone(),
            cache_prefix: settings.robots_key_prefix.clone(),
            next_allowed_prefix: settings.robots_next_allowed_prefix.clone(),
            default_delay_s: settings.crawl_delay_default_s,
            request_timeout: Duration::from_secs(settings.request_timeout_s),
        }
    }

    fn cache_key(&self, domain: &str) -> String {
        format!("{}{}", self.cache_prefix, domain)
    }

    fn next_allowed_key(&self, domain: &str) -> String {
        format!("{}{}", self.next_allowed_prefix, domain)
    }

    async fn fetch_robots_txt(&self, domain: &str) -> String {
        let robots_url = format!("https://{domain}/robots.txt");
        let response = self
            .http
            .get(&robots_url)
            .timeout(self.request_timeout)
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().as_u16() < 400 => resp.text().await.unwrap_or_default(),
            Ok(resp) => {
                debug!("robots fetch {} -> {}", robots_url, resp.status());
                String::new()
            }
            Err(err) => {
                // An unreachable robots endpoint must not kill the worker;
                // empty rules mean "allowed, default delay".
                debug!("robots fetch {} failed: {}", robots_url, err);
                String::new()
            }
        }
    }

    /// Cached rules for a domain, fetching and caching on miss. The cache
    /// write is racy across workers but idempotent.
    pub async fn get_or_fetch(&self, domain: &str) -> Result<RobotsRules> {
        let cached = self.store.hgetall_raw(&self.cache_key(domain)).await?;
        if !cached.is_empty() {
            return Ok(RobotsRules {
                domain: domain.to_string(),
                crawl_delay_s: field_u64(&cached, "crawl_delay_s"),
                request_rate_s: field_u64(&cached, "request_rate_s"),
                allowed: hash_str(&cached, "allowed") != "0",
                fetched_at: hash_str(&cached, "fetched_at").parse().unwrap_or(0),
                text: hash_str(&cached, "text"),
            });
        }
        let robots_txt = self.fetch_robots_txt(domain).await;
        let rules = parse_robots(&robots_txt, domain, &self.user_agent, self.default_delay_s);
        let fields = vec![
            ("crawl_delay_s".to_string(), rules.crawl_delay_s.to_string().into_bytes()),
            (
                "request_rate_s".to_string(),
                rules.request_rate_s.to_string().into_bytes(),
            ),
            (
                "allowed".to_string(),
                if rules.allowed { b"1".to_vec() } else { b"0".to_vec() },
            ),
            ("fetched_at".to_string(), rules.fetched_at.to_string().into_bytes()),
            ("text".to_string(), rules.text.clone().into_bytes()),
        ];
        self.store.hset_map(&self.cache_key(domain), &fields).await?;
        Ok(rules)
    }

    /// Claim the next permitted fetch instant for a domain. Exactly one of
    /// any set of concurrent callers wins; losers get the current deadline
    /// back and must park their item until then.
    pub async fn reserve_next_allowed(&self, domain: &str, delay_s: u64) -> Result<(bool, i64)> {
        self.store
            .reserve_deadline(&self.next_allowed_key(domain), unix_now(), delay_s as i64)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UA: &str = "EngverseBot/0.4";

    #[test]
    fn request_rate_values() {
        assert_eq!(parse_request_rate_value("1/5"), 5);
        assert_eq!(parse_request_rate_value("2/1m"), 30);
        assert_eq!(parse_request_rate_value("10 / 1h"), 360);
        assert_eq!(parse_request_rate_value("0/5"), 0);
        assert_eq!(parse_request_rate_value("garbage"), 0);
        assert_eq!(parse_request_rate_value("3/0"), 0);
    }

    #[test]
    fn exact_agent_beats_wildcard() {
        let txt = "User-agent: *\nRequest-rate: 1/2\n\nUser-agent: engversebot/0.4\nRequest-rate: 1/7\n";
        assert_eq!(extract_request_rate(txt, UA), 7);
        assert_eq!(extract_request_rate(txt, "OtherBot"), 2);
    }

    #[test]
    fn crawl_delay_falls_back_to_default() {
        let rules = parse_robots("User-agent: *\nDisallow:\n", "slack.engineering", UA, 5);
        assert_eq!(rules.crawl_delay_s, 5);
        assert!(rules.allowed);

        let rules = parse_robots(
            "User-agent: *\nCrawl-delay: 11\n",
            "slack.engineering",
            UA,
            5,
        );
        assert_eq!(rules.crawl_delay_s, 11);
        assert_eq!(rules.min_delay_s(), 11);
    }

    #[test]
    fn min_delay_takes_the_stronger_directive() {
        let txt = "User-agent: *\nCrawl-delay: 3\nRequest-rate: 1/9\n";
        let rules = parse_robots(txt, "stripe.com", UA, 5);
        assert_eq!(rules.crawl_delay_s, 3);
        assert_eq!(rules.request_rate_s, 9);
        assert_eq!(rules.min_delay_s(), 9);
    }

    #[test]
    fn deny_all_blocks_fetches() {
        let txt = "User-agent: *\nDisallow: /\n";
        let rules = parse_robots(txt, "engineering.fb.com", UA, 5);
        assert!(!rules.allowed);
        assert!(!rules.can_fetch(UA, "https://engineering.fb.com/2024/01/15/systems/foo"));
    }

    #[test]
    fn empty_robots_allows_everything() {
        let rules = parse_robots("", "airbnb.tech", UA, 5);
        assert!(rules.allowed);
        assert!(rules.can_fetch(UA, "https://airbnb.tech/anything/at-all"));
    }

    #[test]
    fn groups_split_on_directive_boundaries() {
        let txt = "User-agent: a\nUser-agent: b\nDisallow: /x\n\nUser-agent: c\nDisallow: /y\n";
        let groups = agent_groups(txt);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, vec!["a", "b"]);
        assert_eq!(groups[1].0, vec!["c"]);
    }
}
