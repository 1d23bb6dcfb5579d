use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::error::CoreError;
use crate::types::ValidatedJob;

/// The three identifiers §3 defines for a `ValidatedJob`. Each is a 64-bit
/// truncation of a SHA-256 digest, rendered as 16 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FingerprintBundle {
    pub url_hash: String,
    pub content_hash: String,
    pub desc_hash: String,
}

const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "ref",
    "src",
    "source",
    "referrer",
    "clickid",
    "cmp",
    "from",
];

const NOISE_TOKENS: &[&str] = &[
    "senior", "junior", "sr", "jr", "lead", "principal", "staff", "inc", "llc", "ltd", "corp",
    "co", "gmbh", "plc",
];

static CITY_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("nyc", "new york"),
        ("sf", "san francisco"),
        ("la", "los angeles"),
        ("dc", "washington"),
        ("sv", "silicon valley"),
    ])
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static PUNCTUATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").unwrap());

/// Lowercase, tracking-strip, fragment-drop, trailing-slash-trim form of a
/// URL, used as the stable key for a posting (§3 "Canonical URL").
pub fn canonicalize_url(raw: &str) -> Result<String, CoreError> {
    let mut parsed = url::Url::parse(raw)?;
    parsed.set_fragment(None);

    let retained: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.to_lowercase().as_str()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if retained.is_empty() {
        parsed.set_query(None);
    } else {
        let query = retained
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&query));
    }

    let mut canonical = parsed.as_str().to_lowercase();
    if canonical.ends_with('/') && parsed.path() != "/" {
        canonical.pop();
    }
    Ok(canonical)
}

/// Strip punctuation, collapse whitespace, drop noise tokens, resolve city
/// aliases. Shared by `content_hash` and `desc_hash` so identical postings
/// normalize identically regardless of which field they came from.
pub fn normalize_text(input: &str) -> String {
    let lowered = input.to_lowercase();
    let stripped = PUNCTUATION.replace_all(&lowered, " ");
    let collapsed = WHITESPACE.replace_all(stripped.trim(), " ");

    collapsed
        .split(' ')
        .filter(|tok| !tok.is_empty() && !NOISE_TOKENS.contains(tok))
        .map(|tok| *CITY_ALIASES.get(tok).unwrap_or(&tok))
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncated_sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Compute the fingerprint bundle for a validated job (§3, §8 dedup
/// determinism invariant: identical normalized inputs always hash equal).
pub fn compute_fingerprint(job: &ValidatedJob) -> Result<FingerprintBundle, CoreError> {
    let url_hash = truncated_sha256_hex(&canonicalize_url(&job.raw.url)?);

    let content_key = format!(
        "{}|{}|{}",
        normalize_text(&job.raw.title),
        normalize_text(&job.raw.company),
        normalize_text(job.raw.location.as_deref().unwrap_or("")),
    );
    let content_hash = truncated_sha256_hex(&content_key);

    let desc_prefix: String = normalize_text(&job.raw.description)
        .chars()
        .take(500)
        .collect();
    let desc_hash = truncated_sha256_hex(&desc_prefix);

    Ok(FingerprintBundle {
        url_hash,
        content_hash,
        desc_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(url: &str, title: &str, company: &str, desc: &str) -> ValidatedJob {
        ValidatedJob {
            raw: crate::types::RawJob {
                title: title.into(),
                company: company.into(),
                description: desc.into(),
                url: url.into(),
                source: "test".into(),
                ..Default::default()
            },
            scraped_at: chrono::Utc::now(),
            platform: "test".into(),
        }
    }

    #[test]
    fn strips_tracking_params() {
        let canon =
            canonicalize_url("https://Example.com/job-1?utm_source=x&ref=y&foo=bar#section")
                .unwrap();
        assert!(!canon.contains("utm_source="));
        assert!(!canon.contains("ref="));
        assert!(canon.contains("foo=bar"));
        assert!(!canon.contains('#'));
    }

    #[test]
    fn trims_trailing_slash() {
        assert_eq!(
            canonicalize_url("https://example.com/job-1/").unwrap(),
            canonicalize_url("https://example.com/job-1").unwrap()
        );
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = job(
            "https://example.com/job-1",
            "Software Engineer",
            "Example Corp",
            "Test description of at least ten chars",
        );
        let b = job(
            "https://example.com/job-1",
            "Software Engineer",
            "Example Corp",
            "Test description of at least ten chars",
        );
        assert_eq!(
            compute_fingerprint(&a).unwrap(),
            compute_fingerprint(&b).unwrap()
        );
    }

    #[test]
    fn noise_tokens_and_aliases_normalize_equal() {
        assert_eq!(normalize_text("Senior Engineer, NYC"), "engineer new york");
        assert_eq!(normalize_text("Engineer nyc"), "engineer new york");
    }
}
