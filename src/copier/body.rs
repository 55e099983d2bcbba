//! Body transformations applied before an issue or comment crosses
//! repositories: image URL extraction/replacement and bare issue-reference
//! rewriting.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

fn markdown_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[[^\]]*\]\((https?://[^)\s]+)\)").unwrap())
}

fn html_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<img[^>]+src=["']([^"']+)["']"#).unwrap())
}

fn attachment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https://github\.com/[^\s)]+/files/").unwrap())
}

fn issue_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // A bare `#123`: not preceded by a word character, `/` (qualified refs,
    // URL paths) or `&` (HTML entities). regex has no lookbehind, so the
    // preceding character is captured and restored in the replacement.
    RE.get_or_init(|| Regex::new(r"(?m)(^|[^\w/&])#(\d+)\b").unwrap())
}

/// Host part of a URL, lowercased; empty when unparseable.
fn host_of(url: &str) -> String {
    let rest = url.split("://").nth(1).unwrap_or("");
    rest.split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn is_github_hosted(url: &str) -> bool {
    let host = host_of(url);
    host == "github.com"
        || host.ends_with(".github.com")
        || host == "githubusercontent.com"
        || host.ends_with(".githubusercontent.com")
}

/// Image URLs that are NOT already hosted on GitHub, deduplicated:
/// Markdown matches first, then HTML `<img>` sources.
pub fn extract_foreign_image_urls(text: &str) -> Vec<String> {
    let mut urls = Vec::new();
    for captures in markdown_image_re()
        .captures_iter(text)
        .chain(html_image_re().captures_iter(text))
    {
        let url = captures[1].to_owned();
        if !is_github_hosted(&url) && !urls.contains(&url) {
            urls.push(url);
        }
    }
    urls
}

/// Count image references of either form (for partial-status reporting).
pub fn count_images(text: &str) -> usize {
    markdown_image_re().find_iter(text).count() + html_image_re().find_iter(text).count()
}

/// Does the text carry images or GitHub file attachments?
pub fn has_media(text: &str) -> bool {
    count_images(text) > 0 || attachment_re().is_match(text)
}

/// Stable asset path for a source URL: the URL's filename when it has an
/// extension, otherwise a name derived from the URL hash.
pub fn asset_path_for(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let filename = without_query.rsplit('/').next().unwrap_or("");

    if !filename.is_empty() && filename.contains('.') {
        return format!("images/{filename}");
    }

    let digest = Sha256::digest(url.as_bytes());
    format!("images/image_{}.png", hex::encode(&digest[..6]))
}

/// Raw URL for a file on the target's assets branch.
pub fn raw_asset_url(target_repo: &str, asset_path: &str) -> String {
    format!("https://github.com/{target_repo}/blob/assets/{asset_path}?raw=true")
}

/// Qualify bare `#123` references with the source repository so they still
/// resolve from the copied issue. Already-qualified references
/// (`owner/repo#5`) and URL fragments are untouched.
pub fn rewrite_issue_references(text: &str, source_repo: &str) -> String {
    issue_ref_re()
        .replace_all(text, format!("${{1}}{source_repo}#${{2}}"))
        .into_owned()
}
