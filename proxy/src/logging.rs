use crate::config::Config;
use crate::config::LogsConfig;
use crate::url_match::UrlMatch;
use crate::url_match::strip_wildcard;
use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::read::ZlibDecoder;
use rama_core::bytes::Bytes;
use rama_core::error::BoxError;
use rama_core::futures::stream::Stream;
use rama_http::Body;
use rama_http::BodyDataStream;
use rama_http::HeaderMap;
use rama_http::Request;
use rama_http::Response;
use rama_http::header;
use regex::Regex;
use sqlx::MySqlPool;
use std::io::Read;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::task::Context as TaskContext;
use std::task::Poll;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;

/// Logged URLs are cut to this many characters.
const URL_LOG_LIMIT: usize = 1000;
/// Captured response text is cut to this many characters before storage.
const RESPONSE_TEXT_LIMIT: usize = 1000;
/// Raw bytes buffered from a request body before giving up on it.
const REQUEST_CAPTURE_LIMIT: usize = 64 * 1024;
/// Raw bytes buffered from a response body; enough for the text limit and
/// the `<title>` element even through compression.
const RESPONSE_CAPTURE_LIMIT: usize = 16 * 1024;
/// Upper bound on decompressed body text considered for capture.
const DECODED_LIMIT: u64 = 256 * 1024;

static TITLE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)<title>([^<>]*)</title>").ok());

/// One completed proxy exchange, as handed to an [`AccessLogger`] sink.
#[derive(Debug, Clone, Default)]
pub struct HttpLog {
    pub remote_addr: String,
    pub method: String,
    pub url: String,
    pub request_content_type: String,
    pub request_length: i64,
    pub request_body: String,
    pub response_code: u16,
    pub response_content_type: String,
    pub response_length: i64,
    pub response_body: String,
    pub title: String,
}

/// Destination for completed access records. Sinks are best effort: they
/// may drop records but must never block or fail the data path.
#[async_trait]
pub trait AccessLogger: Send + Sync + 'static {
    async fn log(&self, record: &HttpLog);
}

pub struct ConsoleLogger;

#[async_trait]
impl AccessLogger for ConsoleLogger {
    async fn log(&self, record: &HttpLog) {
        info!("{}", format_console_line(record));
    }
}

fn format_console_line(l: &HttpLog) -> String {
    format!(
        "ACCESS: [{} | {}][{} | {} | {}][{} | {} | {} | {}] {}",
        l.remote_addr,
        l.method,
        l.request_content_type,
        l.request_length,
        l.request_body,
        l.response_code,
        l.response_content_type,
        l.response_length,
        l.title,
        l.url,
    )
}

pub struct MysqlLogger {
    pool: MySqlPool,
}

impl MysqlLogger {
    fn new(logs: &LogsConfig) -> Result<Self> {
        let url = logs
            .config
            .get("url")
            .filter(|url| !url.is_empty())
            .context("no URL provided for DB logger")?;
        let pool = MySqlPool::connect_lazy(url).context("failed to create MySQL pool")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl AccessLogger for MysqlLogger {
    async fn log(&self, record: &HttpLog) {
        let result = sqlx::query(
            "INSERT INTO LOG (RemoteAddr, Method, RequestContentType, RequestLength, \
             RequestBody, ResponseCode, ResponseContentType, ResponseLength, ResponseBody, \
             Title, URL, LogTime) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.remote_addr)
        .bind(&record.method)
        .bind(&record.request_content_type)
        .bind(record.request_length)
        .bind(&record.request_body)
        .bind(record.response_code)
        .bind(&record.response_content_type)
        .bind(record.response_length)
        .bind(&record.response_body)
        .bind(&record.title)
        .bind(&record.url)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            warn!("failed to write access log record: {err}");
        }
    }
}

fn new_access_logger(logs: &LogsConfig) -> Result<Arc<dyn AccessLogger>> {
    match logs.provider.as_str() {
        "db" => Ok(Arc::new(MysqlLogger::new(logs)?)),
        "console" => Ok(Arc::new(ConsoleLogger)),
        other => bail!("unsupported log provider: {other}"),
    }
}

/// Front end of the access-log pipeline: snapshots requests, observes
/// response bodies and hands finished records to the configured sink
/// through a channel, so slow sinks never stall a connection task.
#[derive(Clone)]
pub struct AccessLog {
    tx: mpsc::UnboundedSender<HttpLog>,
    skip: Arc<UrlMatch<()>>,
}

impl std::fmt::Debug for AccessLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessLog").finish_non_exhaustive()
    }
}

impl AccessLog {
    /// Builds the sink from the config and spawns the dispatcher task.
    /// Unknown providers and unusable sink configs are startup errors.
    pub fn new(config: &Config) -> Result<Self> {
        let sink = new_access_logger(&config.logs)?;
        let mut skip = UrlMatch::new();
        for entry in &config.logs.skip_logging {
            skip.add(strip_wildcard(entry), ());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<HttpLog>();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                sink.log(&record).await;
            }
        });

        Ok(Self {
            tx,
            skip: Arc::new(skip),
        })
    }

    /// Starts a record for one request, wrapping its body when the content
    /// type is worth capturing. Returns `None` (and the request untouched)
    /// for skip-logging targets.
    pub fn snapshot_request(
        &self,
        req: Request,
        remote_addr: Option<String>,
        host: &str,
        path: &str,
        url: String,
    ) -> (Option<RecordHandle>, Request) {
        if self.skip.find(host, path).is_some() {
            return (None, req);
        }

        let record = HttpLog {
            remote_addr: remote_addr.unwrap_or_default(),
            method: req.method().as_str().to_string(),
            url: truncate_chars(url, URL_LOG_LIMIT),
            request_content_type: header_str(req.headers(), &header::CONTENT_TYPE),
            request_length: content_length(req.headers()),
            ..HttpLog::default()
        };

        let capture = request_body_loggable(&record.request_content_type);
        let encoding = header_str(req.headers(), &header::CONTENT_ENCODING);
        let record = Arc::new(Mutex::new(record));
        let handle = RecordHandle {
            record: record.clone(),
            tx: self.tx.clone(),
        };

        if !capture {
            return (Some(handle), req);
        }

        let (parts, body) = req.into_parts();
        let body = capture_body(body, REQUEST_CAPTURE_LIMIT, move |bytes| {
            let text = decode_body(&bytes, &encoding);
            lock(&record).request_body = text;
        });
        (Some(handle), Request::from_parts(parts, body))
    }
}

/// An in-flight access record. Completing it with the upstream response
/// arms a body observer that dispatches the record once the response has
/// fully streamed to the client.
pub struct RecordHandle {
    record: Arc<Mutex<HttpLog>>,
    tx: mpsc::UnboundedSender<HttpLog>,
}

impl RecordHandle {
    pub fn complete(self, resp: Response) -> Response {
        let (parts, body) = resp.into_parts();
        let content_type = header_str(&parts.headers, &header::CONTENT_TYPE);
        let encoding = header_str(&parts.headers, &header::CONTENT_ENCODING);
        {
            let mut record = lock(&self.record);
            record.response_code = parts.status.as_u16();
            record.response_content_type = content_type.clone();
            record.response_length = content_length(&parts.headers);
        }

        let capture = response_body_loggable(&content_type);
        let record = self.record;
        let tx = self.tx;
        let body = capture_body(body, RESPONSE_CAPTURE_LIMIT, move |bytes| {
            let snapshot = {
                let mut record = lock(&record);
                if capture {
                    let text =
                        truncate_chars(decode_body(&bytes, &encoding), RESPONSE_TEXT_LIMIT);
                    if let Some(title) = extract_title(&text) {
                        record.title = title;
                    }
                    record.response_body = text;
                }
                record.clone()
            };
            let _ = tx.send(snapshot);
        });
        Response::from_parts(parts, body)
    }
}

fn lock(record: &Mutex<HttpLog>) -> std::sync::MutexGuard<'_, HttpLog> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

fn header_str(headers: &HeaderMap, name: &header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn content_length(headers: &HeaderMap) -> i64 {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or_default()
}

fn request_body_loggable(content_type: &str) -> bool {
    content_type.starts_with("text")
        || content_type.ends_with("json")
        || content_type.ends_with("x-www-form-urlencoded")
}

fn response_body_loggable(content_type: &str) -> bool {
    content_type.starts_with("text") || content_type.ends_with("json")
}

fn extract_title(body: &str) -> Option<String> {
    TITLE_RE
        .as_ref()?
        .captures(body)
        .map(|captures| captures[1].to_string())
}

fn truncate_chars(mut s: String, max: usize) -> String {
    if let Some((idx, _)) = s.char_indices().nth(max) {
        s.truncate(idx);
    }
    s
}

/// Decodes a captured body per its content-encoding, tolerating truncated
/// input (capture is capped, so compressed streams may be cut short).
fn decode_body(bytes: &[u8], encoding: &str) -> String {
    let reader: Option<Box<dyn Read + '_>> = match encoding.trim().to_ascii_lowercase().as_str() {
        "gzip" | "x-gzip" => Some(Box::new(GzDecoder::new(bytes).take(DECODED_LIMIT))),
        "deflate" => Some(Box::new(ZlibDecoder::new(bytes).take(DECODED_LIMIT))),
        _ => None,
    };
    match reader {
        Some(mut reader) => {
            let mut decoded = Vec::new();
            // A decode error mid-stream still leaves whatever was already
            // inflated in the buffer; use it.
            let _ = reader.read_to_end(&mut decoded);
            String::from_utf8_lossy(&decoded).into_owned()
        }
        None => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn capture_body(
    body: Body,
    max: usize,
    on_done: impl FnOnce(Vec<u8>) + Send + 'static,
) -> Body {
    Body::from_stream(CaptureStream {
        inner: Box::pin(body.into_data_stream()),
        buf: Vec::new(),
        max,
        on_done: Some(Box::new(on_done)),
    })
}

/// Passes body frames through untouched while buffering a bounded copy;
/// invokes the completion callback exactly once when the stream ends.
struct CaptureStream {
    inner: Pin<Box<BodyDataStream>>,
    buf: Vec<u8>,
    max: usize,
    on_done: Option<Box<dyn FnOnce(Vec<u8>) + Send + 'static>>,
}

impl Stream for CaptureStream {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                if this.buf.len() < this.max {
                    let room = this.max - this.buf.len();
                    let take = room.min(bytes.len());
                    this.buf.extend_from_slice(&bytes[..take]);
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(err))) => {
                if let Some(on_done) = this.on_done.take() {
                    on_done(std::mem::take(&mut this.buf));
                }
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if let Some(on_done) = this.on_done.take() {
                    on_done(std::mem::take(&mut this.buf));
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn title_extraction_is_case_insensitive() {
        assert_eq!(
            extract_title("<html><TITLE>Hello World</TITLE></html>"),
            Some("Hello World".to_string())
        );
        assert_eq!(extract_title("<html><body>no title</body></html>"), None);
        assert_eq!(extract_title("<title><nested></title>"), None);
    }

    #[test]
    fn truncate_chars_respects_character_boundaries() {
        assert_eq!(truncate_chars("héllo".to_string(), 3), "hél");
        assert_eq!(truncate_chars("ab".to_string(), 10), "ab");
        let long = "x".repeat(1500);
        assert_eq!(truncate_chars(long, URL_LOG_LIMIT).len(), URL_LOG_LIMIT);
    }

    #[test]
    fn request_content_types_gate_body_capture() {
        assert!(request_body_loggable("text/html"));
        assert!(request_body_loggable("application/json"));
        assert!(request_body_loggable("application/x-www-form-urlencoded"));
        assert!(!request_body_loggable("application/octet-stream"));
        assert!(!request_body_loggable(""));

        assert!(response_body_loggable("text/plain"));
        assert!(response_body_loggable("application/json"));
        assert!(!response_body_loggable("application/x-www-form-urlencoded"));
        assert!(!response_body_loggable("image/png"));
    }

    #[test]
    fn decode_body_inflates_gzip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"<title>compressed</title>").unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decode_body(&compressed, "gzip");
        assert_eq!(decoded, "<title>compressed</title>");
        assert_eq!(extract_title(&decoded), Some("compressed".to_string()));
    }

    #[test]
    fn decode_body_passes_identity_through() {
        assert_eq!(decode_body(b"plain", ""), "plain");
        assert_eq!(decode_body(b"plain", "identity"), "plain");
    }

    #[test]
    fn console_line_carries_every_field() {
        let record = HttpLog {
            remote_addr: "127.0.0.1:9000".to_string(),
            method: "GET".to_string(),
            url: "http://example.com/x".to_string(),
            request_content_type: "application/json".to_string(),
            request_length: 12,
            request_body: "{\"a\":1}".to_string(),
            response_code: 200,
            response_content_type: "text/html".to_string(),
            response_length: 42,
            response_body: "<title>t</title>".to_string(),
            title: "t".to_string(),
        };
        assert_eq!(
            format_console_line(&record),
            "ACCESS: [127.0.0.1:9000 | GET][application/json | 12 | {\"a\":1}]\
             [200 | text/html | 42 | t] http://example.com/x"
        );
    }

    #[test]
    fn unknown_provider_is_a_startup_error() {
        let logs = LogsConfig {
            provider: "syslog".to_string(),
            ..LogsConfig::default()
        };
        assert!(new_access_logger(&logs).is_err());
    }

    #[test]
    fn db_provider_requires_a_url() {
        let logs = LogsConfig {
            provider: "db".to_string(),
            ..LogsConfig::default()
        };
        assert!(new_access_logger(&logs).is_err());
    }

    #[tokio::test]
    async fn capture_stream_buffers_and_passes_through() {
        let (tx, rx) = std::sync::mpsc::channel();
        let body = capture_body(Body::from("hello world".to_string()), 1024, move |bytes| {
            let _ = tx.send(bytes);
        });

        let mut forwarded = Vec::new();
        let mut body = body;
        while let Ok(Some(chunk)) = body.chunk().await {
            forwarded.extend_from_slice(&chunk);
        }

        assert_eq!(forwarded, b"hello world");
        assert_eq!(rx.recv().unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn capture_stream_caps_the_buffered_copy() {
        let (tx, rx) = std::sync::mpsc::channel();
        let body = capture_body(Body::from("abcdefgh".to_string()), 4, move |bytes| {
            let _ = tx.send(bytes);
        });

        let mut forwarded = Vec::new();
        let mut body = body;
        while let Ok(Some(chunk)) = body.chunk().await {
            forwarded.extend_from_slice(&chunk);
        }

        assert_eq!(forwarded, b"abcdefgh");
        assert_eq!(rx.recv().unwrap(), b"abcd");
    }

    fn test_config(skip: &[&str]) -> Config {
        Config {
            logs: LogsConfig {
                provider: "console".to_string(),
                skip_logging: skip.iter().map(|s| (*s).to_string()).collect(),
                ..LogsConfig::default()
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn skip_logging_suppresses_the_record() {
        let log = AccessLog::new(&test_config(&["telemetry.example.com"])).unwrap();
        let req = Request::builder()
            .uri("http://telemetry.example.com/beacon")
            .body(Body::empty())
            .unwrap();

        let (handle, _req) = log.snapshot_request(
            req,
            None,
            "telemetry.example.com",
            "/beacon",
            "http://telemetry.example.com/beacon".to_string(),
        );
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn snapshot_request_records_metadata() {
        let log = AccessLog::new(&test_config(&[])).unwrap();
        let req = Request::builder()
            .method("POST")
            .uri("http://example.com/submit")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, "7")
            .body(Body::from("{\"a\":1}".to_string()))
            .unwrap();

        let (handle, mut req) = log.snapshot_request(
            req,
            Some("127.0.0.1:9000".to_string()),
            "example.com",
            "/submit",
            "http://example.com/submit".to_string(),
        );
        let handle = handle.unwrap();

        // Drain the (wrapped) request body so the capture completes.
        while let Ok(Some(_)) = req.body_mut().chunk().await {}

        let record = lock(&handle.record).clone();
        assert_eq!(record.method, "POST");
        assert_eq!(record.remote_addr, "127.0.0.1:9000");
        assert_eq!(record.request_content_type, "application/json");
        assert_eq!(record.request_length, 7);
        assert_eq!(record.request_body, "{\"a\":1}");
    }

    #[tokio::test]
    async fn completing_a_response_dispatches_after_the_body_ends() {
        let log = AccessLog::new(&test_config(&[])).unwrap();
        let req = Request::builder()
            .uri("http://example.com/page")
            .body(Body::empty())
            .unwrap();
        let (handle, _req) = log.snapshot_request(
            req,
            None,
            "example.com",
            "/page",
            "http://example.com/page".to_string(),
        );
        let handle = handle.unwrap();
        let record = handle.record.clone();

        let resp = Response::builder()
            .status(200)
            .header(header::CONTENT_TYPE, "text/html")
            .body(Body::from("<title>Page</title>".to_string()))
            .unwrap();
        let mut resp = handle.complete(resp);
        while let Ok(Some(_)) = resp.body_mut().chunk().await {}

        let record = lock(&record).clone();
        assert_eq!(record.response_code, 200);
        assert_eq!(record.response_content_type, "text/html");
        assert_eq!(record.title, "Page");
        assert_eq!(record.response_body, "<title>Page</title>");
    }
}
