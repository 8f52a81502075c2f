use http::Version;
use http::header::{
    CONNECTION, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE, VIA,
};
use hyper::body::Body;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Accepts connections and hands each one to hyper, auto-detecting h1/h2.
///
/// The service produces every response itself, so its error type is
/// [`Infallible`]; listener/socket errors surface as `io::Error`.
pub async fn run_http_service<S, B>(host: &str, port: u16, service: S) -> std::io::Result<()>
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = Infallible>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    let service_arc = Arc::new(service);

    loop {
        let (stream, _peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service_arc.clone();

        tokio::spawn(async move {
            if let Err(err) = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await
            {
                tracing::debug!(error = %err, "connection closed with error");
            }
        });
    }
}

const GATEWAY_NAME: &str = "babelgate";

/// Protocol token used in Via entries; `None` for versions this gateway
/// does not know how to name.
fn via_protocol(version: Version) -> Option<&'static str> {
    const TOKENS: &[(Version, &str)] = &[
        (Version::HTTP_09, "0.9"),
        (Version::HTTP_10, "1.0"),
        (Version::HTTP_11, "1.1"),
        (Version::HTTP_2, "2"),
        (Version::HTTP_3, "3"),
    ];
    TOKENS
        .iter()
        .find(|(known, _)| *known == version)
        .map(|(_, token)| *token)
}

/// Appends this gateway to the Via chain so forwarded hops stay visible.
/// A Via value that is not valid UTF-8 is left alone rather than clobbered.
pub fn add_via_header(headers: &mut HeaderMap, version: Version) {
    let Some(protocol) = via_protocol(version) else {
        tracing::warn!(?version, "unrecognized HTTP version, leaving Via untouched");
        return;
    };

    let hop = format!("{protocol} {GATEWAY_NAME}");
    let chain = match headers.get(VIA) {
        Some(existing) => match existing.to_str() {
            Ok(existing) => format!("{existing}, {hop}"),
            Err(_) => return,
        },
        None => hop,
    };

    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(VIA, value);
    }
}

/// Names that are hop-by-hop on every HTTP/1.x message.
fn always_hop_by_hop(name: &HeaderName) -> bool {
    [
        &CONNECTION,
        &TE,
        &TRAILER,
        &TRANSFER_ENCODING,
        &UPGRADE,
        &PROXY_AUTHENTICATE,
        &PROXY_AUTHORIZATION,
    ]
    .contains(&name)
}

/// Strips connection-scoped headers before a message is forwarded: the
/// fixed hop-by-hop set, anything the peer listed in its Connection
/// header, and keep-alive on pre-1.1 protocols. HTTP/2 and HTTP/3 forbid
/// connection-scoped headers outright, so those versions pass untouched.
pub fn filter_hop_by_hop(headers: &mut HeaderMap, version: Version) -> &mut HeaderMap {
    if !matches!(
        version,
        Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11
    ) {
        return headers;
    }

    let listed: Vec<HeaderName> = headers
        .get(CONNECTION)
        .and_then(|value| value.to_str().ok())
        .into_iter()
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::try_from(token.trim()).ok())
        .collect();
    let drop_keep_alive = version != Version::HTTP_11;

    // Decide in one pass over the map, then remove by name.
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|&name| {
            always_hop_by_hop(name)
                || listed.contains(name)
                || (drop_keep_alive && name.as_str() == "keep-alive")
        })
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;

    fn forwardable_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("x-goog-api-key", HeaderValue::from_static("k"));
        headers
    }

    #[test]
    fn fixed_hop_by_hop_names_are_stripped() {
        let mut headers = forwardable_headers();
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));

        filter_hop_by_hop(&mut headers, Version::HTTP_11);

        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key(CONTENT_TYPE));
        assert!(headers.contains_key("x-goog-api-key"));
    }

    #[test]
    fn connection_listed_names_are_stripped_case_insensitively() {
        let mut headers = forwardable_headers();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, X-Per-Hop"));
        headers.insert("x-per-hop", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));

        filter_hop_by_hop(&mut headers, Version::HTTP_11);

        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("x-per-hop").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.contains_key(CONTENT_TYPE));
    }

    #[test]
    fn keep_alive_survives_only_on_http_11() {
        for (version, expected) in [(Version::HTTP_10, false), (Version::HTTP_11, true)] {
            let mut headers = forwardable_headers();
            headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));

            filter_hop_by_hop(&mut headers, version);
            assert_eq!(headers.contains_key("keep-alive"), expected, "{version:?}");
        }
    }

    #[test]
    fn h2_headers_pass_untouched() {
        let mut headers = forwardable_headers();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

        filter_hop_by_hop(&mut headers, Version::HTTP_2);
        assert!(headers.contains_key(CONNECTION));
    }

    #[test]
    fn via_header_starts_and_extends_the_chain() {
        let mut headers = HeaderMap::new();
        add_via_header(&mut headers, Version::HTTP_11);
        assert_eq!(headers.get(VIA).unwrap(), "1.1 babelgate");

        add_via_header(&mut headers, Version::HTTP_2);
        assert_eq!(headers.get(VIA).unwrap(), "1.1 babelgate, 2 babelgate");
    }

    #[test]
    fn opaque_via_values_are_left_alone() {
        let mut headers = HeaderMap::new();
        headers.insert(VIA, HeaderValue::from_bytes(b"1.1 \xff-proxy").unwrap());

        add_via_header(&mut headers, Version::HTTP_11);
        assert_eq!(
            headers.get(VIA).unwrap().as_bytes(),
            b"1.1 \xff-proxy".as_slice()
        );
    }
}
