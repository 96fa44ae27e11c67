use sha2::{Digest, Sha256};

/// Compute a fallback visitor ID from IP and User-Agent.
///
/// Formula: sha256(salt_epoch + ip + user_agent)[0..8] encoded as 16 hex chars.
///
/// The salt_epoch = floor(unix_utc_timestamp / 86400) rotates daily at midnight UTC.
/// Only used when the tracking script did not send its own visitor id.
pub fn compute_visitor_id(ip: &str, user_agent: &str) -> String {
    let salt_epoch = chrono::Utc::now().timestamp() / 86400;
    let input = format!("{}{}{}", salt_epoch, ip, user_agent);
    let hash = Sha256::digest(input.as_bytes());
    // First 8 bytes → 16 hex characters.
    hex::encode(&hash[..8])
}

/// Extract the host of a page URL, without scheme, path or port.
///
/// Returns `None` if the URL is empty or has no host.
pub fn domain_from_url(url: &str) -> Option<String> {
    if url.is_empty() {
        return None;
    }
    let stripped = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("//");
    let authority = stripped.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}
