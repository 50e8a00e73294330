use reqwest::{Client, Proxy};
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of interpreting a configured proxy value.
#[derive(Debug, PartialEq, Eq)]
enum ProxyResolution {
    UseProxy(String),
    /// `proxy = ""` disables every proxy, including HTTPS_PROXY from the environment.
    ForceDirectConnect,
    /// Not configured: reqwest reads HTTPS_PROXY / HTTP_PROXY itself.
    FromEnvironment,
}

fn resolve_proxy(proxy: Option<&str>) -> ProxyResolution {
    match proxy.map(str::trim) {
        Some("") => ProxyResolution::ForceDirectConnect,
        Some(p) => ProxyResolution::UseProxy(p.to_string()),
        None => ProxyResolution::FromEnvironment,
    }
}

/// Build a reqwest client honouring an optional proxy override.
///
/// An invalid proxy URL is logged and ignored rather than failing startup.
pub fn build_http_client(proxy: Option<&str>, target: &str, timeout: Duration) -> Client {
    let mut builder = Client::builder().timeout(timeout);

    match resolve_proxy(proxy) {
        ProxyResolution::UseProxy(proxy_url) => match Proxy::all(&proxy_url) {
            Ok(p) => {
                info!(proxy = %proxy_url, target = %target, "HTTP client using proxy");
                builder = builder.proxy(p);
            }
            Err(e) => {
                warn!(error = %e, proxy = %proxy_url, "Invalid proxy URL, falling back to direct connect");
            }
        },
        ProxyResolution::ForceDirectConnect => {
            info!(target = %target, "HTTP client forced to direct connect");
            builder = builder.no_proxy();
        }
        ProxyResolution::FromEnvironment => {}
    }

    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client with proxy, using default");
        Client::new()
    })
}
