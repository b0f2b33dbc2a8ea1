use regex::Regex;
use std::sync::LazyLock;

/// Fixed technology vocabulary matched against article text. Matches are
/// whole-word and case-insensitive, so "Rust" inside "trusting" stays out.
pub const DEFAULT_TOPICS: &[&str] = &[
    "Kafka",
    "Flink",
    "Spark",
    "Redis",
    "Kubernetes",
    "Ray",
    "TensorFlow",
    "PyTorch",
    "GraphQL",
    "React",
    "Rust",
];

static TOPIC_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    DEFAULT_TOPICS
        .iter()
        .map(|topic| {
            let pattern = format!(r"(?i)\b{}\b", regex::escape(topic));
            (*topic, Regex::new(&pattern).expect("static topic pattern"))
        })
        .collect()
});

pub fn extract_topics(text: &str) -> Vec<String> {
    TOPIC_PATTERNS
        .iter()
        .filter(|(_, pattern)| pattern.is_match(text))
        .map(|(topic, _)| topic.to_string())
        .collect()
}
