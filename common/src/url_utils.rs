use anyhow::anyhow;
use std::net::SocketAddr;
use url::Url;

/// Validate and normalize a server endpoint URL. Rejects non-HTTP schemes and
/// control characters; strips any trailing slash so URLs compare equal.
pub fn sanitize_url(url: &str) -> anyhow::Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(anyhow!("URL cannot be empty"));
    }

    if url.contains('\0') || url.contains('\r') || url.contains('\n') {
        return Err(anyhow!("URL contains invalid control characters"));
    }

    let parsed_url = Url::parse(url).map_err(|e| anyhow!("Invalid URL format: {}", e))?;

    match parsed_url.scheme() {
        "http" | "https" => {}
        other => return Err(anyhow!("Unsupported URL scheme: {}", other)),
    }

    let url_str = parsed_url.to_string();
    let trimmed = url_str.trim_end_matches('/');

    Ok(trimmed.to_string())
}

/// Legacy feeds list endpoints without a scheme. Prepend one so the url crate
/// parses the host correctly, then normalize as usual.
pub fn ensure_scheme(endpoint: &str, default_scheme: &str) -> anyhow::Result<String> {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        sanitize_url(endpoint)
    } else {
        sanitize_url(&format!("{}://{}", default_scheme, endpoint))
    }
}

pub fn parse_socket_addr(listen: &str) -> anyhow::Result<SocketAddr> {
    let url = if listen.starts_with("http://") || listen.starts_with("https://") {
        Url::parse(listen)?
    } else {
        Url::parse(&format!("http://{}", listen))?
    };

    let host = url
        .host_str()
        .ok_or(anyhow!("missing host in listen address"))?
        .to_string();

    let port = url.port().unwrap_or(80);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    Ok(addr)
}
