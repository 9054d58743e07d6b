use crate::error::ConfigError;
use once_cell::sync::Lazy;
use url::Url;

/// Single-threaded runtime the binary drives its session on. REST and push
/// completions interleave on it but never run in parallel.
pub static RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime")
});

pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Push endpoint for a REST base URL: same host, websocket scheme, `/push`.
pub fn push_url_from_base(base_url: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(&normalize_url(base_url))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(ConfigError::Scheme(other.to_string())),
    };
    url.set_scheme(scheme).map_err(|_| ConfigError::Scheme(scheme.to_string()))?;
    let path = format!("{}/push", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

/// First `max_chars` characters of `text` on one line, with an ellipsis when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &flat[..cut]),
        None => flat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_hosts_default_to_https() {
        assert_eq!(normalize_url(" chat.example.com "), "https://chat.example.com");
        assert_eq!(normalize_url("http://localhost:8080"), "http://localhost:8080");
    }

    #[test]
    fn push_url_swaps_scheme() {
        let url = push_url_from_base("https://chat.example.com/").unwrap();
        assert_eq!(url.as_str(), "wss://chat.example.com/push");
        let url = push_url_from_base("http://localhost:8080").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8080/push");
    }

    #[test]
    fn excerpt_cuts_on_char_boundaries() {
        assert_eq!(excerpt("héllo\nthere", 5), "héllo…");
        assert_eq!(excerpt("short", 80), "short");
    }
}
