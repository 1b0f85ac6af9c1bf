use crate::UrlError;
use url::Url;

/// Extracts the host of a URL, lowercased
///
/// # Examples
///
/// ```
/// use url::Url;
/// use multicrawl::url::extract_domain;
///
/// let url = Url::parse("https://EXAMPLE.COM/path").unwrap();
/// assert_eq!(extract_domain(&url), Some("example.com".to_string()));
/// ```
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_lowercase())
}

/// Derives the site key used to identify a site in the stores
///
/// The key is the lowercased host with any leading `www.` removed. A
/// non-default port is kept, so two services on the same host stay distinct
/// sites.
///
/// # Arguments
///
/// * `url_str` - Any URL on the site (usually the seed listing URL)
///
/// # Returns
///
/// * `Ok(String)` - The site domain, e.g. `listings.example.com` or `127.0.0.1:8080`
/// * `Err(UrlError)` - The URL does not parse, is not HTTP(S), or has no host
///
/// # Examples
///
/// ```
/// use multicrawl::url::site_domain;
///
/// assert_eq!(site_domain("https://www.Example.com/homes?page=2").unwrap(), "example.com");
/// assert_eq!(site_domain("http://127.0.0.1:8080/").unwrap(), "127.0.0.1:8080");
/// ```
pub fn site_domain(url_str: &str) -> Result<String, UrlError> {
    let url = Url::parse(url_str).map_err(|e| UrlError::Parse(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(url.scheme().to_string()));
    }

    let host = extract_domain(&url).ok_or(UrlError::MissingDomain)?;
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();

    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_simple_domain() {
        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(extract_domain(&url), Some("example.com".to_string()));
    }

    #[test]
    fn test_extract_with_port() {
        let url = Url::parse("https://example.com:8080/").unwrap();
        assert_eq!(extract_domain(&url), Some("example.com".to_string()));
    }

    #[test]
    fn test_extract_mixed_case() {
        let url = Url::parse("https://Example.COM/").unwrap();
        assert_eq!(extract_domain(&url), Some("example.com".to_string()));
    }

    #[test]
    fn test_site_domain_strips_www() {
        assert_eq!(
            site_domain("https://www.homes.example.com/list").unwrap(),
            "homes.example.com"
        );
    }

    #[test]
    fn test_site_domain_keeps_explicit_port() {
        assert_eq!(
            site_domain("http://127.0.0.1:41234/listings").unwrap(),
            "127.0.0.1:41234"
        );
    }

    #[test]
    fn test_site_domain_drops_default_port() {
        assert_eq!(site_domain("https://example.com:443/").unwrap(), "example.com");
    }

    #[test]
    fn test_site_domain_rejects_other_schemes() {
        assert!(matches!(
            site_domain("ftp://example.com/"),
            Err(UrlError::InvalidScheme(_))
        ));
        assert!(matches!(site_domain("not a url"), Err(UrlError::Parse(_))));
    }
}
