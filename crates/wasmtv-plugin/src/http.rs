//! Outbound HTTP on behalf of plugins (`http_get`).

use std::net::IpAddr;
use std::time::Duration;

use crate::error::PluginError;

/// Maximum HTTP response body size (10 MB).
pub const MAX_HTTP_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Hosts plugins may reach: `*`, an exact host, or `*.suffix`.
    pub allowed_hosts: Vec<String>,
    /// Request timeout in seconds (default: 10).
    pub timeout_secs: u64,
    pub max_response_bytes: usize,
    /// Refuse loopback, private and link-local targets (default: true).
    pub block_private: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: vec!["*".to_string()],
            timeout_secs: 10,
            max_response_bytes: MAX_HTTP_RESPONSE_BYTES,
            block_private: true,
        }
    }
}

impl HttpConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            allowed_hosts: std::env::var("PLUGIN_HTTP_HOSTS")
                .ok()
                .map(|v| parse_host_list(&v))
                .unwrap_or(defaults.allowed_hosts),
            timeout_secs: std::env::var("PLUGIN_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timeout_secs),
            max_response_bytes: defaults.max_response_bytes,
            block_private: !std::env::var("PLUGIN_HTTP_ALLOW_PRIVATE")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
        }
    }
}

fn parse_host_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

/// Blocking GET client for host functions.
///
/// Host functions run synchronously on the thread executing the plugin.
/// Requests are driven to completion on the tokio runtime captured at
/// construction, so plugin calls must run on a blocking thread
/// (`spawn_blocking`), never on a runtime worker.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    config: HttpConfig,
    runtime: tokio::runtime::Handle,
}

impl HttpFetcher {
    pub fn new(config: HttpConfig, runtime: tokio::runtime::Handle) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            client,
            config,
            runtime,
        }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Check if a URL's host is in the allowed list (supports glob patterns).
    fn check_http_host(&self, url: &url::Url) -> Result<(), PluginError> {
        if self.config.allowed_hosts.is_empty() {
            return Err(PluginError::PermissionDenied(
                "no hosts are allowed for plugin HTTP".into(),
            ));
        }
        if self.config.allowed_hosts.iter().any(|h| h == "*") {
            return Ok(());
        }

        let host = url
            .host_str()
            .ok_or_else(|| PluginError::HostFunction(format!("URL has no host: {url}")))?;

        let matches = self.config.allowed_hosts.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix("*.") {
                host == suffix || host.ends_with(&format!(".{suffix}"))
            } else {
                host == pattern
            }
        });

        if !matches {
            return Err(PluginError::PermissionDenied(format!(
                "host '{host}' is not allowed; allowed: {:?}",
                self.config.allowed_hosts
            )));
        }
        Ok(())
    }

    /// SECURITY: Block requests to private/reserved IP addresses.
    fn check_private_ip(&self, url: &url::Url) -> Result<(), PluginError> {
        if !self.config.block_private {
            return Ok(());
        }
        let host = match url.host() {
            Some(h) => h,
            None => return Ok(()),
        };

        let ip = match host {
            url::Host::Domain(name) => {
                let blocked = ["localhost", "metadata.google.internal"];
                if blocked.contains(&name) || name.ends_with(".localhost") {
                    return Err(PluginError::PermissionDenied(format!(
                        "HTTP requests to '{name}' are blocked (private/reserved address)"
                    )));
                }
                return Ok(());
            }
            url::Host::Ipv4(v4) => IpAddr::V4(v4),
            url::Host::Ipv6(v6) => IpAddr::V6(v6),
        };

        let is_private = match ip {
            IpAddr::V4(v4) => {
                v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
            }
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        };
        if is_private {
            return Err(PluginError::PermissionDenied(format!(
                "HTTP requests to private IP '{ip}' are blocked"
            )));
        }
        Ok(())
    }

    fn check_url(&self, url_str: &str) -> Result<url::Url, PluginError> {
        let url = url::Url::parse(url_str)
            .map_err(|_| PluginError::HostFunction(format!("invalid URL: {url_str}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PluginError::PermissionDenied(format!(
                "unsupported URL scheme '{}'",
                url.scheme()
            )));
        }
        self.check_http_host(&url)?;
        self.check_private_ip(&url)?;
        Ok(url)
    }

    /// Perform the GET and return the response body.
    ///
    /// Non-2xx statuses are errors, so a plugin only ever receives the
    /// body of a successful response.
    pub async fn fetch(&self, url_str: &str) -> Result<Vec<u8>, PluginError> {
        let url = self.check_url(url_str)?;

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PluginError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PluginError::Http(format!("{url_str} returned {status}")));
        }

        if let Some(len) = resp.content_length() {
            if len > self.config.max_response_bytes as u64 {
                return Err(PluginError::Http(format!(
                    "response body too large: {len} bytes (max: {} bytes)",
                    self.config.max_response_bytes
                )));
            }
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| PluginError::Http(e.to_string()))?;

        if body.len() > self.config.max_response_bytes {
            return Err(PluginError::Http(format!(
                "response body too large: {} bytes (max: {} bytes)",
                body.len(),
                self.config.max_response_bytes
            )));
        }
        Ok(body.to_vec())
    }

    /// Blocking form of [`fetch`](Self::fetch) for use inside host functions.
    pub fn get(&self, url: &str) -> Result<Vec<u8>, PluginError> {
        self.runtime.block_on(self.fetch(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(hosts: Vec<&str>, block_private: bool) -> HttpFetcher {
        let config = HttpConfig {
            allowed_hosts: hosts.into_iter().map(String::from).collect(),
            block_private,
            ..HttpConfig::default()
        };
        HttpFetcher::new(config, tokio::runtime::Handle::current())
    }

    fn parse(url: &str) -> url::Url {
        url::Url::parse(url).unwrap()
    }

    #[test]
    fn test_http_config_default() {
        let config = HttpConfig::default();
        assert_eq!(config.allowed_hosts, vec!["*"]);
        assert_eq!(config.timeout_secs, 10);
        assert_eq!(config.max_response_bytes, MAX_HTTP_RESPONSE_BYTES);
        assert!(config.block_private);
    }

    #[test]
    fn test_parse_host_list() {
        assert_eq!(
            parse_host_list(" api.thetvdb.com, *.tmdb.org ,,"),
            vec!["api.thetvdb.com", "*.tmdb.org"]
        );
        assert!(parse_host_list("").is_empty());
    }

    #[tokio::test]
    async fn test_check_http_host_exact_and_glob() {
        let f = fetcher(vec!["api.thetvdb.com", "*.tmdb.org"], true);
        f.check_http_host(&parse("https://api.thetvdb.com/v4")).unwrap();
        f.check_http_host(&parse("https://image.tmdb.org/x")).unwrap();
        f.check_http_host(&parse("https://tmdb.org/x")).unwrap();
        let err = f
            .check_http_host(&parse("https://evil.com/"))
            .unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied(_)));
        assert!(f.check_http_host(&parse("https://nottmdb.org/")).is_err());
    }

    #[tokio::test]
    async fn test_check_http_host_empty_list() {
        let f = fetcher(vec![], true);
        let err = f
            .check_http_host(&parse("https://api.thetvdb.com/"))
            .unwrap_err();
        assert!(err.to_string().contains("no hosts"));
    }

    #[tokio::test]
    async fn test_check_private_ip_blocked() {
        let f = fetcher(vec!["*"], true);
        for url in [
            "http://localhost/",
            "http://127.0.0.1/",
            "http://127.0.0.2/",
            "http://10.0.0.1/",
            "http://172.16.0.1/",
            "http://192.168.1.1/",
            "http://169.254.169.254/latest/meta-data",
            "http://0.0.0.0/",
            "http://[::1]/",
            "http://metadata.google.internal/",
        ] {
            let err = f.check_private_ip(&parse(url)).unwrap_err();
            assert!(
                matches!(err, PluginError::PermissionDenied(_)),
                "{url} should be blocked"
            );
        }
    }

    #[tokio::test]
    async fn test_check_private_ip_public_ok() {
        let f = fetcher(vec!["*"], true);
        f.check_private_ip(&parse("https://8.8.8.8/")).unwrap();
        f.check_private_ip(&parse("https://api.example.com/")).unwrap();
    }

    #[tokio::test]
    async fn test_check_private_ip_disabled() {
        let f = fetcher(vec!["*"], false);
        f.check_private_ip(&parse("http://127.0.0.1:8080/")).unwrap();
    }

    #[tokio::test]
    async fn test_check_url_rejects_scheme_and_garbage() {
        let f = fetcher(vec!["*"], true);
        assert!(matches!(
            f.check_url("file:///etc/passwd").unwrap_err(),
            PluginError::PermissionDenied(_)
        ));
        assert!(matches!(
            f.check_url("not a url").unwrap_err(),
            PluginError::HostFunction(_)
        ));
    }

    #[tokio::test]
    async fn test_fetch_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/series/1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"{\"id\":1}".to_vec()))
            .mount(&server)
            .await;

        let f = fetcher(vec!["*"], false);
        let body = f.fetch(&format!("{}/series/1", server.uri())).await.unwrap();
        assert_eq!(body, b"{\"id\":1}");
    }

    #[tokio::test]
    async fn test_fetch_non_success_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let f = fetcher(vec!["*"], false);
        let err = f.fetch(&format!("{}/missing", server.uri())).await.unwrap_err();
        assert!(matches!(err, PluginError::Http(_)));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_fetch_body_size_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 64]))
            .mount(&server)
            .await;

        let mut f = fetcher(vec!["*"], false);
        f.config.max_response_bytes = 16;
        let err = f.fetch(&server.uri()).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blocking_get_from_blocking_thread() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let f = fetcher(vec!["*"], false);
        let url = server.uri();
        let body = tokio::task::spawn_blocking(move || f.get(&url))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, b"ok");
    }
}
