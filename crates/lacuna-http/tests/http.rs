use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use url::Url;

use lacuna_core::{LacunaErrorKind, RangeSource};
use lacuna_http::HttpRangeSource;

/// One immutable blob served over loopback, the way an object store fronts a
/// snapshot artifact.
#[derive(Clone)]
struct Object {
    bytes: Arc<Vec<u8>>,
    honor_ranges: bool,
}

impl Object {
    fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new((0..len).map(|i| (i.wrapping_mul(31) % 253) as u8).collect()),
            honor_ranges: true,
        }
    }

    /// A server that replies 200 with the whole object no matter what range
    /// was asked for.
    fn ignoring_ranges(len: usize) -> Self {
        Self {
            honor_ranges: false,
            ..Self::new(len)
        }
    }

    fn total(&self) -> u64 {
        self.bytes.len() as u64
    }
}

struct ObjectServer {
    url: Url,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ObjectServer {
    async fn spawn(object: Object) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let url = Url::parse(&format!("http://{addr}/")).expect("server url");
        let (shutdown, mut stop) = oneshot::channel::<()>();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = &mut stop => break,
                    accepted = listener.accept() => accepted,
                };
                let Ok((stream, _)) = accepted else { break };
                let object = object.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| respond(req, object.clone()));
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        Self {
            url,
            shutdown: Some(shutdown),
        }
    }

    fn url(&self) -> Url {
        self.url.clone()
    }
}

impl Drop for ObjectServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn respond(
    req: Request<Incoming>,
    object: Object,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let head_only = req.method() == Method::HEAD;
    if !head_only && req.method() != Method::GET {
        return Ok(status_only(StatusCode::METHOD_NOT_ALLOWED));
    }

    let window = if object.honor_ranges {
        req.headers()
            .get(RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(requested_window)
            .filter(|(first, _)| *first < object.total())
    } else {
        None
    };

    let (status, payload, content_range) = match window {
        Some((first, last)) => {
            let last = last.min(object.total() - 1);
            (
                StatusCode::PARTIAL_CONTENT,
                Bytes::copy_from_slice(&object.bytes[first as usize..=last as usize]),
                Some(format!("bytes {first}-{last}/{}", object.total())),
            )
        }
        None => (
            StatusCode::OK,
            Bytes::copy_from_slice(&object.bytes),
            None,
        ),
    };

    let mut response = Response::builder()
        .status(status)
        .header(CONTENT_LENGTH, payload.len());
    if let Some(content_range) = content_range {
        response = response.header(CONTENT_RANGE, content_range);
    }
    let body = if head_only { Bytes::new() } else { payload };
    Ok(response.body(Full::new(body)).expect("build response"))
}

fn status_only(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// `bytes=a-b`, both bounds required.
fn requested_window(header: &str) -> Option<(u64, u64)> {
    let (first, last) = header.strip_prefix("bytes=")?.split_once('-')?;
    Some((first.parse().ok()?, last.parse().ok()?))
}

#[tokio::test]
async fn ranged_read_returns_the_requested_window() {
    let object = Object::new(8192);
    let expected = Arc::clone(&object.bytes);
    let server = ObjectServer::spawn(object).await;

    let source = HttpRangeSource::new(server.url()).await.expect("http source");
    assert_eq!(source.size_bytes(), 8192);

    let mut buf = vec![0u8; 1000];
    let read = source.read_at(3000, &mut buf).await.expect("read range");
    assert_eq!(read, buf.len());
    assert_eq!(&buf[..], &expected[3000..4000]);
}

#[tokio::test]
async fn size_probe_uses_head() {
    let server = ObjectServer::spawn(Object::new(4096)).await;
    let source = HttpRangeSource::new(server.url()).await.expect("http source");
    assert_eq!(source.size_bytes(), 4096);
}

#[tokio::test]
async fn explicit_size_skips_probe() {
    let object = Object::new(2048);
    let expected = Arc::clone(&object.bytes);
    let server = ObjectServer::spawn(object).await;

    let source = HttpRangeSource::new_with_size(server.url(), 2048);
    assert_eq!(source.size_bytes(), 2048);

    let mut buf = vec![0u8; 48];
    source.read_at(2000, &mut buf).await.expect("tail read");
    assert_eq!(&buf[..], &expected[2000..2048]);
}

#[tokio::test]
async fn full_body_response_is_sliced_locally() {
    let object = Object::ignoring_ranges(2048);
    let expected = Arc::clone(&object.bytes);
    let server = ObjectServer::spawn(object).await;

    let source = HttpRangeSource::new(server.url()).await.expect("http source");
    let mut buf = vec![0u8; 100];
    let read = source.read_at(500, &mut buf).await.expect("read range");
    assert_eq!(read, buf.len());
    assert_eq!(&buf[..], &expected[500..600]);
}

#[tokio::test]
async fn read_past_end_is_rejected() {
    let server = ObjectServer::spawn(Object::new(1024)).await;
    let source = HttpRangeSource::new(server.url()).await.expect("http source");

    let mut buf = vec![0u8; 128];
    let err = source.read_at(1000, &mut buf).await.expect_err("oob read");
    assert_eq!(err.kind(), LacunaErrorKind::OutOfRange);
}
