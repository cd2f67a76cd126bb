//! HTTP vhost proxy: resolves each request to a Host rule, opens a stream
//! to the owning agent, rewrites the head and pipes the exchange.
//!
//! One client connection can carry many keep-alive requests; if a later
//! request resolves to a different Host rule the upstream stream is torn
//! down and the selection restarts. Responses to `.`-URIs are cached whole
//! when caching is on, and cache hits short-circuit the upstream entirely.

use crate::base::{ProxyBase, ProxyError};
use crate::cache::{cache_key, cacheable_uri, HttpCache};
use crate::httputil::{self, RequestHead};
use bytes::BytesMut;
use reverb_proto::{consts, BoxedStream, Link};
use reverb_store::Host;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Bodies beyond this size stream through without being cached.
const MAX_CACHE_BODY: usize = 1 << 20;

pub struct HttpVhostServer {
    base: ProxyBase,
    add_origin: bool,
    cache: Option<Arc<HttpCache>>,
}

type ClientWriter = Arc<Mutex<WriteHalf<BoxedStream>>>;

impl HttpVhostServer {
    pub fn new(base: ProxyBase, add_origin: bool, cache: Option<Arc<HttpCache>>) -> Self {
        Self {
            base,
            add_origin,
            cache,
        }
    }

    /// Drive one public connection. `scheme` is `http`, or `https` when the
    /// connection was decrypted by the SNI terminator.
    pub async fn handle_connection(
        &self,
        conn: BoxedStream,
        peer: SocketAddr,
        scheme: &str,
    ) {
        if let Err(e) = self.run_connection(conn, peer, scheme).await {
            debug!(%peer, "vhost connection ended: {}", e);
        }
    }

    async fn run_connection(
        &self,
        conn: BoxedStream,
        peer: SocketAddr,
        scheme: &str,
    ) -> Result<(), ProxyError> {
        let (mut client_r, client_w) = tokio::io::split(conn);
        let client_w: ClientWriter = Arc::new(Mutex::new(client_w));

        let Some(mut head) = httputil::read_request_head(&mut client_r).await? else {
            return Ok(());
        };
        // the live upstream response pump; replaced on host switch, stopped
        // when the client goes away
        let mut responder_slot: Option<tokio::task::AbortHandle> = None;

        'outer: loop {
            let host = match self
                .base
                .store
                .resolve_host(head.host(), scheme, &head.uri)
            {
                Ok(h) => h,
                Err(_) => {
                    warn!(host = head.host(), uri = %head.uri, "no vhost rule for request");
                    self.write_error_page(&client_w).await;
                    return Ok(());
                }
            };
            let agent = self.base.store.get_agent(host.agent_id)?;
            let _guard = self.base.admit(&agent)?;
            if self.base.check_basic_auth(&head, &agent).is_err() {
                let mut w = client_w.lock().await;
                let _ = w.write_all(b"HTTP/1.1 401 Unauthorized\r\n\r\n").await;
                return Err(ProxyError::Unauthorized);
            }

            let target = host.targets.select().map_err(|_| ProxyError::NoTarget)?;
            let profile = agent.profile();
            let link = Link::new(
                consts::CONN_HTTP,
                &target,
                profile.crypt,
                profile.compress,
                &peer.to_string(),
                host.targets.local_proxy,
            );
            let upstream = match self.base.bridge.send_link_info(agent.id, link, None).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(upstream = %target, "vhost upstream connect failed: {}", e);
                    self.write_error_page(&client_w).await;
                    return Ok(());
                }
            };
            let upstream = reverb_proto::wrap_stream(
                upstream,
                profile.crypt,
                profile.compress,
                Some(agent.rate()),
                true,
            )
            .await?;
            let (up_r, mut up_w) = tokio::io::split(upstream);

            // uri of the in-flight request when it should be cached
            let cache_slot: Arc<std::sync::Mutex<Option<String>>> =
                Arc::new(std::sync::Mutex::new(None));
            let responder = tokio::spawn(forward_responses(
                up_r,
                client_w.clone(),
                host.clone(),
                self.cache.clone(),
                cache_slot.clone(),
            ));
            responder_slot = Some(responder.abort_handle());

            // inner loop: requests for this same host rule
            loop {
                if let Some(cache) = &self.cache {
                    if cacheable_uri(&head.uri) {
                        if let Some(cached) = cache.get(&cache_key(&host.host, &head.uri)) {
                            debug!(uri = %head.uri, "cache hit");
                            let mut w = client_w.lock().await;
                            if w.write_all(&cached).await.is_err() {
                                break 'outer;
                            }
                            drop(w);
                            host.flow.add(0, cached.len() as i64);
                            match self.next_request(&mut client_r, &head).await? {
                                Some(next) => {
                                    if self.host_changed(&host, &next, scheme) {
                                        head = next;
                                        let _ = up_w.shutdown().await;
                                        responder.abort();
                                        continue 'outer;
                                    }
                                    head = next;
                                    continue;
                                }
                                None => break 'outer,
                            }
                        }
                    }
                }

                *cache_slot.lock().unwrap() = match &self.cache {
                    Some(_) if cacheable_uri(&head.uri) => Some(head.uri.clone()),
                    _ => None,
                };

                let rewritten = head.rewrite(
                    &host.host_rewrite,
                    &host.extra_headers,
                    &peer.to_string(),
                    self.add_origin,
                );
                if up_w.write_all(&rewritten).await.is_err() {
                    break 'outer;
                }
                host.flow.add(rewritten.len() as i64, 0);

                // request body, if any
                let body_len = head.content_length();
                if body_len > 0
                    && copy_exact(&mut client_r, &mut up_w, body_len, &host)
                        .await
                        .is_err()
                {
                    break 'outer;
                }
                let _ = up_w.flush().await;

                match self.next_request(&mut client_r, &head).await? {
                    Some(next) => {
                        if self.host_changed(&host, &next, scheme) {
                            head = next;
                            let _ = up_w.shutdown().await;
                            responder.abort();
                            continue 'outer;
                        }
                        head = next;
                    }
                    None => break 'outer,
                }
            }
        }
        if let Some(responder) = responder_slot {
            responder.abort();
        }
        Ok(())
    }

    async fn next_request(
        &self,
        client_r: &mut ReadHalf<BoxedStream>,
        _prev: &RequestHead,
    ) -> Result<Option<RequestHead>, ProxyError> {
        Ok(httputil::read_request_head(client_r).await?)
    }

    fn host_changed(&self, current: &Arc<Host>, next: &RequestHead, scheme: &str) -> bool {
        match self
            .base
            .store
            .resolve_host(next.host(), scheme, &next.uri)
        {
            Ok(resolved) => resolved.id != current.id,
            Err(_) => true,
        }
    }

    async fn write_error_page(&self, client_w: &ClientWriter) {
        let body = &self.base.error_content;
        let head = format!(
            "HTTP/1.1 404 Not Found\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let mut w = client_w.lock().await;
        let _ = w.write_all(head.as_bytes()).await;
        let _ = w.write_all(body).await;
    }
}

/// Upstream → client pump. Each response is read as far as framing
/// requires; cacheable ones are buffered whole and stored, the rest stream
/// through chunk by chunk.
async fn forward_responses(
    mut up_r: ReadHalf<BoxedStream>,
    client_w: ClientWriter,
    host: Arc<Host>,
    cache: Option<Arc<HttpCache>>,
    cache_slot: Arc<std::sync::Mutex<Option<String>>>,
) {
    loop {
        let head = match httputil::read_response_head(&mut up_r).await {
            Ok(Some(h)) => h,
            _ => break,
        };
        let key = cache_slot.lock().unwrap().take();

        let cacheable = match (&cache, &key, head.content_length) {
            (Some(_), Some(_), Some(len)) => len <= MAX_CACHE_BODY,
            _ => false,
        };

        if cacheable {
            let len = head.content_length.unwrap_or(0);
            let mut body = vec![0u8; len];
            if up_r.read_exact(&mut body).await.is_err() {
                break;
            }
            let mut full = BytesMut::with_capacity(head.raw.len() + len);
            full.extend_from_slice(&head.raw);
            full.extend_from_slice(&body);
            let full = full.freeze();

            let mut w = client_w.lock().await;
            if w.write_all(&full).await.is_err() {
                break;
            }
            drop(w);
            host.flow.add(0, full.len() as i64);
            if let (Some(cache), Some(uri)) = (&cache, key) {
                cache.insert(cache_key(&host.host, &uri), full);
            }
            continue;
        }

        // stream-through path
        {
            let mut w = client_w.lock().await;
            if w.write_all(&head.raw).await.is_err() {
                break;
            }
        }
        host.flow.add(0, head.raw.len() as i64);

        let ok = if let Some(len) = head.content_length {
            pump_n(&mut up_r, &client_w, len, &host).await
        } else if head.chunked {
            pump_chunked(&mut up_r, &client_w, &host).await
        } else {
            // EOF-delimited body: stream until the upstream closes
            pump_until_eof(&mut up_r, &client_w, &host).await;
            false
        };
        if !ok {
            break;
        }
    }
}

async fn copy_exact(
    from: &mut ReadHalf<BoxedStream>,
    to: &mut WriteHalf<BoxedStream>,
    mut remaining: usize,
    host: &Arc<Host>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 16 * 1024];
    while remaining > 0 {
        let take = remaining.min(buf.len());
        let n = from.read(&mut buf[..take]).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        to.write_all(&buf[..n]).await?;
        host.flow.add(n as i64, 0);
        remaining -= n;
    }
    Ok(())
}

async fn pump_n(
    up_r: &mut ReadHalf<BoxedStream>,
    client_w: &ClientWriter,
    mut remaining: usize,
    host: &Arc<Host>,
) -> bool {
    let mut buf = vec![0u8; 16 * 1024];
    while remaining > 0 {
        let take = remaining.min(buf.len());
        let n = match up_r.read(&mut buf[..take]).await {
            Ok(0) | Err(_) => return false,
            Ok(n) => n,
        };
        let mut w = client_w.lock().await;
        if w.write_all(&buf[..n]).await.is_err() {
            return false;
        }
        drop(w);
        host.flow.add(0, n as i64);
        remaining -= n;
    }
    true
}

/// Forward a chunked body verbatim, watching the chunk sizes to find the
/// response boundary.
async fn pump_chunked(
    up_r: &mut ReadHalf<BoxedStream>,
    client_w: &ClientWriter,
    host: &Arc<Host>,
) -> bool {
    loop {
        // chunk-size line
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match up_r.read_exact(&mut byte).await {
                Ok(_) => {}
                Err(_) => return false,
            }
            line.push(byte[0]);
            if line.ends_with(b"\r\n") || line.len() > 64 {
                break;
            }
        }
        let size_text = String::from_utf8_lossy(&line);
        let size = match usize::from_str_radix(size_text.trim().split(';').next().unwrap_or(""), 16)
        {
            Ok(s) => s,
            Err(_) => return false,
        };
        {
            let mut w = client_w.lock().await;
            if w.write_all(&line).await.is_err() {
                return false;
            }
        }
        host.flow.add(0, line.len() as i64);

        // chunk data + trailing CRLF (or the final CRLF after a 0 chunk)
        let mut body = vec![0u8; size + 2];
        if up_r.read_exact(&mut body).await.is_err() {
            return false;
        }
        {
            let mut w = client_w.lock().await;
            if w.write_all(&body).await.is_err() {
                return false;
            }
        }
        host.flow.add(0, body.len() as i64);
        if size == 0 {
            return true;
        }
    }
}

async fn pump_until_eof(
    up_r: &mut ReadHalf<BoxedStream>,
    client_w: &ClientWriter,
    host: &Arc<Host>,
) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = match up_r.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut w = client_w.lock().await;
        if w.write_all(&buf[..n]).await.is_err() {
            break;
        }
        drop(w);
        host.flow.add(0, n as i64);
    }
}
