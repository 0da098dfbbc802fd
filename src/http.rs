//! HTTP 辅助工具：客户端地址解析、上传链接、CORS 与安全头。

use axum::body::Body as AxumBody;
use axum::http::uri::Authority;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::{middleware, response::Response};
use std::net::IpAddr;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

/// 构建 CORS Layer（支持逗号分隔的来源列表）。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// 综合转发头与连接信息计算客户端 IP。
pub fn resolve_client_ip(headers: &HeaderMap, connect_ip: Option<IpAddr>) -> Option<IpAddr> {
    extract_forwarded_ip(headers).or(connect_ip)
}

/// The host the client used to reach us: `Host` header without its port,
/// otherwise the client address itself.
pub fn public_host(headers: &HeaderMap, peer: IpAddr) -> String {
    let from_header = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<Authority>().ok())
        .map(|authority| authority.host().to_string())
        .filter(|host| !host.is_empty());
    if let Some(host) = from_header {
        return host;
    }

    match resolve_client_ip(headers, Some(peer)).unwrap_or(peer) {
        IpAddr::V6(ip) => format!("[{ip}]"),
        IpAddr::V4(ip) => ip.to_string(),
    }
}

/// 生成客户端上传文件所用的完整链接。
pub fn upload_url(host: &str, port: u16, token: &str) -> String {
    format!("http://{host}:{port}/upload/{token}")
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));

    #[test]
    fn host_header_wins_and_loses_its_port() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("manga.local:9000"));
        assert_eq!(public_host(&headers, PEER), "manga.local");

        headers.insert(header::HOST, HeaderValue::from_static("[::1]:8000"));
        assert_eq!(public_host(&headers, PEER), "[::1]");
    }

    #[test]
    fn falls_back_to_client_address() {
        let mut headers = HeaderMap::new();
        assert_eq!(public_host(&headers, PEER), "10.0.0.7");

        headers.insert("x-forwarded-for", HeaderValue::from_static("192.168.1.20, 10.0.0.1"));
        assert_eq!(public_host(&headers, PEER), "192.168.1.20");

        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(public_host(&HeaderMap::new(), v6), "[fe80::1]");
    }

    #[test]
    fn upload_url_embeds_token() {
        assert_eq!(
            upload_url("192.168.1.20", 8000, "abc"),
            "http://192.168.1.20:8000/upload/abc"
        );
    }

    #[test]
    fn cors_layer_requires_valid_origins() {
        assert!(build_cors_layer(None).is_none());
        assert!(build_cors_layer(Some(" , ")).is_none());
        assert!(build_cors_layer(Some("http://localhost:3000")).is_some());
    }
}
