/// 服务端 HTTP/1.1 处理
///
/// 只需要处理升级请求和少量自定义接口，因此请求头由这里直接读取解析：
/// 读取受 `header_size_limit` 约束，每个连接只服务一个请求（不保持连接）
use crate::error::{ProxyError, Result};
use crate::limited_reader::{is_limit_exceeded, LimitedReader};
use http::{Request, Response, StatusCode};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 自定义 HTTP 处理函数
pub type HttpHandler = Arc<dyn Fn(&Request<()>) -> Response<String> + Send + Sync>;

/// 读取请求头失败的原因
#[derive(Debug)]
pub(crate) enum HeadError {
    /// 请求头超过上限，回复 431
    TooLarge,
    /// 请求格式错误，回复 400
    Malformed(String),
    /// 对端在请求头结束前断开
    Io(io::Error),
}

impl std::fmt::Display for HeadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeadError::TooLarge => f.write_str("request header too large"),
            HeadError::Malformed(msg) => write!(f, "malformed request: {}", msg),
            HeadError::Io(e) => write!(f, "read request header: {}", e),
        }
    }
}

/// 已解析的请求头，以及请求头之后多读到的字节
pub(crate) struct RequestHead {
    pub request: Request<()>,
    pub leftover: Vec<u8>,
}

const READ_CHUNK: usize = 512;

/// 读取到第一个 `\r\n\r\n` 为止
pub(crate) async fn read_request_head<R>(
    stream: &mut R,
    limit: usize,
) -> std::result::Result<RequestHead, HeadError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = LimitedReader::new(stream, limit);
    let mut buffer = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(n) => n,
            Err(e) if is_limit_exceeded(&e) => return Err(HeadError::TooLarge),
            Err(e) => return Err(HeadError::Io(e)),
        };
        if n == 0 {
            return Err(HeadError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected EOF while reading request header",
            )));
        }

        // 只需从上次末尾回退 3 个字节开始查找
        let search_from = buffer.len().saturating_sub(3);
        buffer.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_head_end(&buffer[search_from..]) {
            let end = search_from + pos + 4;
            let request = parse_request_head(&buffer[..end])?;
            let leftover = buffer[end..].to_vec();
            return Ok(RequestHead { request, leftover });
        }
    }
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// 把请求行和请求头解析为 `http::Request`
pub(crate) fn parse_request_head(raw: &[u8]) -> std::result::Result<Request<()>, HeadError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| HeadError::Malformed("request header is not valid UTF-8".into()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| HeadError::Malformed("empty request".into()))?;
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(HeadError::Malformed(format!(
            "invalid request line: {}",
            request_line
        )));
    }
    if parts[2] != "HTTP/1.1" && parts[2] != "HTTP/1.0" {
        return Err(HeadError::Malformed(format!(
            "unsupported HTTP version: {}",
            parts[2]
        )));
    }

    let mut builder = Request::builder().method(parts[0]).uri(parts[1]);
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HeadError::Malformed(format!("invalid header line: {}", line)))?;
        builder = builder.header(name.trim(), value.trim());
    }

    builder
        .body(())
        .map_err(|e| HeadError::Malformed(e.to_string()))
}

/// 生成一个纯文本响应
pub(crate) fn text_response(status: StatusCode, body: impl Into<String>) -> Response<String> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

/// 序列化响应；总是附带 `Connection: close`
pub(crate) fn render_response(response: &Response<String>) -> Vec<u8> {
    let status = response.status();
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        if name == http::header::CONNECTION || name == http::header::CONTENT_LENGTH {
            continue;
        }
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(&String::from_utf8_lossy(value.as_bytes()));
        out.push_str("\r\n");
    }
    if !response.headers().contains_key(http::header::CONTENT_TYPE) {
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    }
    out.push_str(&format!("Content-Length: {}\r\n", response.body().len()));
    out.push_str("Connection: close\r\n\r\n");

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(response.body().as_bytes());
    bytes
}

pub(crate) async fn write_response<W>(stream: &mut W, response: &Response<String>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&render_response(response)).await?;
    stream.flush().await?;
    stream.shutdown().await
}

/// 路由目标
#[derive(Clone)]
pub(crate) enum Route {
    /// WebSocket 升级
    Upgrade,
    Custom(HttpHandler),
}

/// 精确匹配路径，未命中时回落到 `"/"`
#[derive(Default)]
pub(crate) struct RouteTable {
    routes: parking_lot::RwLock<HashMap<String, Route>>,
}

impl RouteTable {
    pub(crate) fn add(&self, url: &str, route: Route) -> Result<()> {
        if !url.starts_with('/') {
            return Err(ProxyError::config_error(format!(
                "handler url must start with '/': {}",
                url
            )));
        }
        let mut routes = self.routes.write();
        if routes.contains_key(url) {
            return Err(ProxyError::config_error(format!(
                "handler for {} already registered",
                url
            )));
        }
        routes.insert(url.to_string(), route);
        Ok(())
    }

    /// 未注册时安装，已存在则保持不变
    pub(crate) fn ensure(&self, url: &str, route: Route) -> bool {
        let mut routes = self.routes.write();
        if routes.contains_key(url) {
            return false;
        }
        routes.insert(url.to_string(), route);
        true
    }

    pub(crate) fn resolve(&self, path: &str) -> Option<Route> {
        let routes = self.routes.read();
        routes.get(path).or_else(|| routes.get("/")).cloned()
    }
}
