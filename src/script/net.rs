//! `http` binding group with SSRF protection.
//!
//! Redirects are followed here rather than by reqwest so that every hop is
//! validated and its host resolved to public addresses before it is
//! requested.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use mlua::{Lua, LuaSerdeExt, Result as LuaResult, Table, Value};
use reqwest::header::LOCATION;
use reqwest::{Client, Method, StatusCode};
use tokio::runtime::Handle;
use url::Url;

use crate::{Result, WardenError};

/// Connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Total timeout in seconds.
const TOTAL_TIMEOUT_SECS: u64 = 30;

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 5;

/// Maximum response body size.
const MAX_RESPONSE_BYTES: usize = 5 * 1024 * 1024;

const USER_AGENT: &str = concat!("warden/", env!("CARGO_PKG_VERSION"));

/// Build the HTTP client shared by one interpreter.
pub(crate) fn build_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(TOTAL_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| WardenError::Resource(format!("failed to create HTTP client: {e}")))
}

/// Create the `http` table.
///
/// `get(url, headers?)` and `delete(url, headers?)`; `post`, `put` and
/// `patch` take `(url, body, headers?)`. A table body is sent as JSON. All
/// return `{status, body, headers}`. Requests run on the ambient tokio
/// runtime from the blocking worker thread.
pub(crate) fn http_table(lua: &Lua, client: Client) -> LuaResult<Table> {
    let http = lua.create_table()?;

    for (name, method) in [("get", Method::GET), ("delete", Method::DELETE)] {
        let client = client.clone();
        let f = lua.create_function(move |lua, (url, headers): (String, Option<Table>)| {
            let headers = header_map(headers)?;
            send(lua, &client, method.clone(), &url, None, headers)
        })?;
        http.set(name, f)?;
    }

    for (name, method) in [("post", Method::POST), ("put", Method::PUT), ("patch", Method::PATCH)] {
        let client = client.clone();
        let f = lua.create_function(
            move |lua, (url, body, headers): (String, Value, Option<Table>)| {
                let mut headers = header_map(headers)?;
                let body = request_body(lua, body, &mut headers)?;
                send(lua, &client, method.clone(), &url, body, headers)
            },
        )?;
        http.set(name, f)?;
    }

    Ok(http)
}

fn header_map(headers: Option<Table>) -> LuaResult<HashMap<String, String>> {
    let mut map = HashMap::new();
    if let Some(headers) = headers {
        for pair in headers.pairs::<String, String>() {
            let (k, v) = pair?;
            map.insert(k.to_lowercase(), v);
        }
    }
    Ok(map)
}

fn request_body(
    lua: &Lua,
    body: Value,
    headers: &mut HashMap<String, String>,
) -> LuaResult<Option<String>> {
    match body {
        Value::Nil => Ok(None),
        Value::String(s) => Ok(Some(s.to_str()?.to_string())),
        other => {
            let json: serde_json::Value = lua.from_value(other)?;
            headers
                .entry("content-type".to_string())
                .or_insert_with(|| "application/json".to_string());
            serde_json::to_string(&json)
                .map(Some)
                .map_err(mlua::Error::external)
        }
    }
}

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

fn send(
    lua: &Lua,
    client: &Client,
    method: Method,
    url: &str,
    body: Option<String>,
    headers: HashMap<String, String>,
) -> LuaResult<Table> {
    validate_url(url).map_err(mlua::Error::external)?;
    let url = Url::parse(url).map_err(mlua::Error::external)?;

    let handle = Handle::try_current()
        .map_err(|_| mlua::Error::RuntimeError("http requires a tokio runtime".to_string()))?;
    let response = handle
        .block_on(fetch(client, method, url, body, &headers))
        .map_err(mlua::Error::external)?;

    let result = lua.create_table()?;
    result.set("status", response.status)?;
    result.set("body", lua.create_string(&response.body)?)?;
    let header_table = lua.create_table()?;
    for (k, v) in response.headers {
        header_table.set(k, v)?;
    }
    result.set("headers", header_table)?;
    Ok(result)
}

/// Perform a request, following up to [`MAX_REDIRECTS`] redirects. Each
/// target is validated and resolved before it is contacted.
async fn fetch(
    client: &Client,
    mut method: Method,
    mut url: Url,
    mut body: Option<String>,
    headers: &HashMap<String, String>,
) -> Result<Response> {
    let origin = url.host_str().map(str::to_string);
    let mut hops = 0;

    loop {
        ensure_public_host(&url).await?;

        let mut request = client.request(method.clone(), url.clone());
        for (k, v) in headers {
            // Credentials stay with the host they were meant for
            if k == "authorization" && url.host_str().map(str::to_string) != origin {
                continue;
            }
            request = request.header(k, v);
        }
        if let Some(body) = &body {
            request = request.body(body.clone());
        }

        let response = request.send().await.map_err(request_failed)?;
        let status = response.status();

        if status.is_redirection() {
            if let Some(location) = response.headers().get(LOCATION) {
                let location = location.to_str().map_err(|_| {
                    WardenError::security("network", "redirect location is not valid text")
                })?;
                url = redirect_target(&url, location, hops)?;
                hops += 1;
                if status == StatusCode::SEE_OTHER
                    || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
                        && method == Method::POST)
                {
                    method = Method::GET;
                    body = None;
                }
                continue;
            }
        }

        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let bytes = response.bytes().await.map_err(request_failed)?;
        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(WardenError::Resource(format!(
                "response too large: {} bytes (max {} bytes)",
                bytes.len(),
                MAX_RESPONSE_BYTES
            )));
        }

        return Ok(Response {
            status: status.as_u16(),
            headers,
            body: bytes.to_vec(),
        });
    }
}

fn request_failed(e: reqwest::Error) -> WardenError {
    WardenError::Runtime {
        message: format!("http request failed: {e}"),
        stack_trace: None,
    }
}

/// Resolve the next hop of a redirect and validate it.
fn redirect_target(current: &Url, location: &str, hops: usize) -> Result<Url> {
    if hops >= MAX_REDIRECTS {
        return Err(WardenError::security(
            "network",
            format!("too many redirects (max {MAX_REDIRECTS})"),
        ));
    }
    let next = current
        .join(location)
        .map_err(|e| WardenError::security("network", format!("invalid redirect: {e}")))?;
    validate_url(next.as_str())?;
    Ok(next)
}

/// Resolve a URL's host and reject it if any address is private.
async fn ensure_public_host(url: &Url) -> Result<()> {
    let Some(url::Host::Domain(domain)) = url.host() else {
        // IP literals were checked by validate_url
        return Ok(());
    };
    let port = url.port_or_known_default().unwrap_or(80);
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((domain, port))
        .await?
        .map(|addr| addr.ip())
        .collect();
    check_resolved(domain, &addrs)
}

fn check_resolved(host: &str, addrs: &[IpAddr]) -> Result<()> {
    if addrs.is_empty() {
        return Err(WardenError::security(
            "network",
            format!("host did not resolve: {host}"),
        ));
    }
    match addrs.iter().find(|ip| is_private_ip(ip)) {
        Some(ip) => Err(WardenError::security(
            "network",
            format!("host {host} resolves to private IP address: {ip}"),
        )),
        None => Ok(()),
    }
}

/// Validate a URL for SSRF protection.
///
/// This function checks that:
/// - The URL uses http or https scheme
/// - The host is not a private/loopback address
/// - The host is not a reserved hostname
pub fn validate_url(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url)
        .map_err(|e| WardenError::security("network", format!("invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(WardenError::security(
                "network",
                format!("unsupported URL scheme: {scheme}"),
            ));
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| WardenError::security("network", "URL has no host"))?;

    match host {
        url::Host::Domain(domain) => {
            if is_forbidden_hostname(domain) {
                return Err(WardenError::security(
                    "network",
                    format!("forbidden host: {domain}"),
                ));
            }
        }
        url::Host::Ipv4(ipv4) => check_ip(IpAddr::V4(ipv4))?,
        url::Host::Ipv6(ipv6) => check_ip(IpAddr::V6(ipv6))?,
    }

    Ok(())
}

fn check_ip(ip: IpAddr) -> Result<()> {
    if is_private_ip(&ip) {
        return Err(WardenError::security(
            "network",
            format!("private IP address not allowed: {ip}"),
        ));
    }
    Ok(())
}

fn is_forbidden_hostname(host: &str) -> bool {
    let host = host.to_lowercase();
    if host == "localhost" {
        return true;
    }
    [
        ".local",
        ".localhost",
        ".internal",
        ".intranet",
        ".corp",
        ".home",
        ".lan",
    ]
    .iter()
    .any(|suffix| host.ends_with(suffix))
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            let octets = ipv4.octets();
            ipv4.is_loopback()
                || ipv4.is_private()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_unspecified()
                || ipv4.is_documentation()
                // Carrier-grade NAT: 100.64.0.0/10
                || (octets[0] == 100 && (64..=127).contains(&octets[1]))
        }
        IpAddr::V6(ipv6) => {
            let segments = ipv6.segments();
            if let Some(mapped) = ipv6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(mapped));
            }
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                // Unique local: fc00::/7
                || (segments[0] & 0xfe00) == 0xfc00
                // Link-local: fe80::/10
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url_valid() {
        assert!(validate_url("https://example.com/feed").is_ok());
        assert!(validate_url("http://93.184.216.34/").is_ok());
    }

    #[test]
    fn test_validate_url_invalid_scheme() {
        let err = validate_url("file:///etc/passwd").unwrap_err();
        assert!(matches!(err, WardenError::SecurityViolation { .. }));
        assert!(validate_url("ftp://example.com").is_err());
    }

    #[test]
    fn test_validate_url_forbidden_hosts() {
        assert!(validate_url("http://localhost:8080").is_err());
        assert!(validate_url("http://printer.local").is_err());
        assert!(validate_url("http://db.internal/x").is_err());
    }

    #[test]
    fn test_validate_url_private_ips() {
        for url in [
            "http://127.0.0.1/",
            "http://10.1.2.3/",
            "http://172.16.0.1/",
            "http://192.168.1.1/",
            "http://169.254.169.254/latest/meta-data",
            "http://0.0.0.0/",
            "http://100.64.0.1/",
            "http://[::1]/",
            "http://[fd00::1]/",
            "http://[fe80::1]/",
            "http://[::ffff:127.0.0.1]/",
        ] {
            assert!(validate_url(url).is_err(), "allowed: {url}");
        }
    }

    #[test]
    fn test_check_resolved() {
        let public: IpAddr = "93.184.216.34".parse().unwrap();
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        let metadata: IpAddr = "169.254.169.254".parse().unwrap();

        assert!(check_resolved("example.com", &[public]).is_ok());
        assert!(check_resolved("rebind.example", &[public, loopback]).is_err());
        let err = check_resolved("meta.example", &[metadata]).unwrap_err();
        assert!(matches!(err, WardenError::SecurityViolation { .. }));
        assert!(check_resolved("nothing.example", &[]).is_err());
    }

    #[test]
    fn test_redirect_target_is_validated() {
        let current = Url::parse("https://public.example/start").unwrap();

        let next = redirect_target(&current, "/next?x=1", 0).unwrap();
        assert_eq!(next.as_str(), "https://public.example/next?x=1");
        assert!(redirect_target(&current, "https://other.example/", 4).is_ok());

        for location in [
            "http://127.0.0.1/",
            "http://169.254.169.254/latest/meta-data",
            "http://localhost:8080/admin",
            "file:///etc/passwd",
        ] {
            let err = redirect_target(&current, location, 0).unwrap_err();
            assert!(matches!(err, WardenError::SecurityViolation { .. }), "{location}");
        }

        let err = redirect_target(&current, "/again", MAX_REDIRECTS).unwrap_err();
        assert!(err.to_string().contains("too many redirects"));
    }

    #[test]
    fn test_http_table_methods() {
        let lua = Lua::new();
        let http = http_table(&lua, build_client().unwrap()).unwrap();
        for name in ["get", "post", "put", "patch", "delete"] {
            let f: Value = http.get(name).unwrap();
            assert!(matches!(f, Value::Function(_)), "{name}");
        }
    }

    #[test]
    fn test_validate_url_garbage() {
        assert!(validate_url("not a url").is_err());
    }

    #[test]
    fn test_http_table_rejects_private_target() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let result = rt.block_on(async {
            tokio::task::spawn_blocking(|| {
                let lua = Lua::new();
                let http = http_table(&lua, build_client().unwrap()).unwrap();
                lua.globals().set("http", http).unwrap();
                lua.load("return http.get('http://127.0.0.1:1/')")
                    .exec()
                    .map_err(|e| e.to_string())
            })
            .await
            .unwrap()
        });
        let err = result.unwrap_err();
        assert!(err.contains("private IP"), "{err}");
    }
}
