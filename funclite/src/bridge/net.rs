//! TCP and TLS bridge.
//!
//! Sockets are host-side handles; every connect is policy-gated before the
//! host lookup and again per resolved address. The guest shim builds its
//! event surface (`data`/`end`/`close`/`error`/`timeout`) by looping on the
//! promise-returning `_net_read`; the host never calls into the guest.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use funclite_shared::{FuncliteError, FuncliteResult};
use rquickjs::Ctx;
use rquickjs::function::{Async, Func, Opt};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use super::convert::{AsyncReply, BytesArg, JsBytes, JsJson};
use super::dns::resolve_host_addrs;
use super::handles::HandleObject;
use super::BridgeState;

const READ_CHUNK: usize = 16 * 1024;

enum SocketStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl SocketStream {
    fn tcp_ref(&self) -> &TcpStream {
        match self {
            SocketStream::Tcp(s) => s,
            SocketStream::Tls(s) => s.get_ref().0,
        }
    }
}

/// TLS session facts captured at handshake time.
#[derive(Clone, Debug, Default)]
pub struct TlsSessionInfo {
    pub authorized: bool,
    pub protocol: Option<String>,
    pub cipher: Option<String>,
    pub peer_certificate_b64: Option<String>,
}

/// One guest socket.
pub struct SocketHandle {
    // Taken out during I/O so the table lock is never held across an await.
    stream: Option<SocketStream>,
    read_timeout_ms: Option<u64>,
    tls: Option<TlsSessionInfo>,
}

impl SocketHandle {
    fn new(stream: SocketStream, tls: Option<TlsSessionInfo>) -> Self {
        Self { stream: Some(stream), read_timeout_ms: None, tls }
    }
}

/// Policy-checked TCP connect shared with the fetch bridge.
pub async fn open_checked_tcp(
    state: &BridgeState,
    host: &str,
    port: u16,
) -> FuncliteResult<(TcpStream, Vec<IpAddr>)> {
    state.policy.check_host_port(host, port)?;
    let addrs = resolve_host_addrs(host).await?;
    state.policy.check_resolved(host, port, &addrs)?;

    let mut last_error: Option<std::io::Error> = None;
    for addr in &addrs {
        match TcpStream::connect((*addr, port)).await {
            Ok(stream) => return Ok((stream, addrs)),
            Err(e) => last_error = Some(e),
        }
    }
    Err(FuncliteError::Internal(format!(
        "connection to {}:{} failed: {}",
        host,
        port,
        last_error.map(|e| e.kind().to_string()).unwrap_or_else(|| "no addresses".into())
    )))
}

fn tls_client_config() -> FuncliteResult<Arc<rustls::ClientConfig>> {
    static CONFIG: std::sync::OnceLock<Arc<rustls::ClientConfig>> = std::sync::OnceLock::new();
    if let Some(config) = CONFIG.get() {
        return Ok(Arc::clone(config));
    }
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    // Name the provider explicitly: the process may carry more than one
    // crypto backend, and the default-provider lookup refuses to pick.
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| FuncliteError::Internal(format!("TLS configuration failed: {}", e)))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    let config = Arc::new(config);
    Ok(Arc::clone(CONFIG.get_or_init(|| config)))
}

fn protocol_name(version: rustls::ProtocolVersion) -> String {
    match version {
        rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2".into(),
        rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3".into(),
        other => format!("{:?}", other),
    }
}

async fn tls_handshake(
    state: &BridgeState,
    host: &str,
    port: u16,
) -> FuncliteResult<(TlsStream<TcpStream>, TlsSessionInfo)> {
    let (tcp, _addrs) = open_checked_tcp(state, host, port).await?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| FuncliteError::InvalidArgument(format!("invalid server name: {}", host)))?;
    let connector = TlsConnector::from(tls_client_config()?);
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| FuncliteError::Internal(format!("TLS handshake with {} failed: {}", host, e.kind())))?;

    let info = {
        let (_, session) = stream.get_ref();
        TlsSessionInfo {
            authorized: true,
            protocol: session.protocol_version().map(protocol_name),
            cipher: session
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite())),
            peer_certificate_b64: session
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|der| BASE64.encode(der.as_ref())),
        }
    };
    Ok((stream, info))
}

fn take_stream(state: &BridgeState, handle: u32) -> FuncliteResult<(SocketStream, Option<u64>)> {
    let mut handles = state.handles.lock();
    match handles.get_mut(handle)? {
        HandleObject::Socket(socket) => {
            let stream = socket.stream.take().ok_or_else(|| {
                FuncliteError::InvalidArgument("socket is closed or busy".into())
            })?;
            Ok((stream, socket.read_timeout_ms))
        }
        _ => Err(FuncliteError::InvalidArgument("handle is not a socket".into())),
    }
}

fn put_stream(state: &BridgeState, handle: u32, stream: SocketStream) {
    let mut handles = state.handles.lock();
    if let Ok(HandleObject::Socket(socket)) = handles.get_mut(handle) {
        socket.stream = Some(stream);
    }
    // Handle destroyed while I/O was in flight: the stream drops and closes.
}

async fn socket_read(
    state: &Arc<BridgeState>,
    handle: u32,
) -> FuncliteResult<Option<Vec<u8>>> {
    let (mut stream, timeout_ms) = take_stream(state, handle)?;
    let mut buf = vec![0u8; READ_CHUNK];
    let read = async {
        let n = match &mut stream {
            SocketStream::Tcp(s) => s.read(&mut buf).await,
            SocketStream::Tls(s) => s.read(&mut buf).await,
        };
        n.map_err(|e| FuncliteError::Internal(format!("socket read failed: {}", e.kind())))
    };
    let result = match timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), read).await {
            Ok(inner) => inner,
            Err(_) => {
                put_stream(state, handle, stream);
                return Err(FuncliteError::Canceled("socket read timed out".into()));
            }
        },
        None => read.await,
    };
    put_stream(state, handle, stream);
    let n = result?;
    if n == 0 {
        Ok(None)
    } else {
        buf.truncate(n);
        Ok(Some(buf))
    }
}

async fn socket_write(state: &Arc<BridgeState>, handle: u32, data: Vec<u8>) -> FuncliteResult<()> {
    let (mut stream, _) = take_stream(state, handle)?;
    let result = match &mut stream {
        SocketStream::Tcp(s) => s.write_all(&data).await,
        SocketStream::Tls(s) => s.write_all(&data).await,
    };
    put_stream(state, handle, stream);
    result.map_err(|e| FuncliteError::Internal(format!("socket write failed: {}", e.kind())))
}

async fn socket_end(state: &Arc<BridgeState>, handle: u32) -> FuncliteResult<()> {
    let (mut stream, _) = take_stream(state, handle)?;
    let result = match &mut stream {
        SocketStream::Tcp(s) => s.shutdown().await,
        SocketStream::Tls(s) => s.shutdown().await,
    };
    put_stream(state, handle, stream);
    result.map_err(|e| FuncliteError::Internal(format!("socket shutdown failed: {}", e.kind())))
}

fn with_socket<R>(
    state: &BridgeState,
    handle: u32,
    f: impl FnOnce(&mut SocketHandle) -> FuncliteResult<R>,
) -> FuncliteResult<R> {
    let mut handles = state.handles.lock();
    match handles.get_mut(handle)? {
        HandleObject::Socket(socket) => f(socket),
        _ => Err(FuncliteError::InvalidArgument("handle is not a socket".into())),
    }
}

pub fn install(ctx: &Ctx<'_>, state: &Arc<BridgeState>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let st = Arc::clone(state);
    globals.set(
        "_net_connect",
        Func::from(Async(move |host: String, port: u16| {
            let st = Arc::clone(&st);
            async move {
                let result = st
                    .guard(async {
                        let (stream, _) = open_checked_tcp(&st, &host, port).await?;
                        Ok(st
                            .handles
                            .lock()
                            .insert(HandleObject::Socket(SocketHandle::new(
                                SocketStream::Tcp(stream),
                                None,
                            ))))
                    })
                    .await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_tls_connect",
        Func::from(Async(move |host: String, port: u16| {
            let st = Arc::clone(&st);
            async move {
                let result = st
                    .guard(async {
                        let (stream, info) = tls_handshake(&st, &host, port).await?;
                        Ok(st
                            .handles
                            .lock()
                            .insert(HandleObject::Socket(SocketHandle::new(
                                SocketStream::Tls(Box::new(stream)),
                                Some(info),
                            ))))
                    })
                    .await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_net_write",
        Func::from(Async(move |handle: u32, data: BytesArg| {
            let st = Arc::clone(&st);
            async move {
                let result = st.guard(socket_write(&st, handle, data.0)).await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_net_read",
        Func::from(Async(move |handle: u32| {
            let st = Arc::clone(&st);
            async move {
                let result = st.guard(socket_read(&st, handle)).await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(
                    result.map(|opt| opt.map(JsBytes)),
                ))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_net_end",
        Func::from(Async(move |handle: u32| {
            let st = Arc::clone(&st);
            async move {
                let result = st.guard(socket_end(&st, handle)).await;
                Ok::<_, rquickjs::Error>(AsyncReply::from(result))
            }
        })),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_net_destroy",
        Func::from(move |handle: u32| {
            st.handles.lock().try_remove(handle);
            Ok::<_, rquickjs::Error>(())
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_net_setTimeout",
        Func::from(move |ctx: Ctx<'_>, handle: u32, ms: f64| {
            let result = with_socket(&st, handle, |socket| {
                socket.read_timeout_ms = if ms > 0.0 { Some(ms as u64) } else { None };
                Ok(())
            });
            super::convert::sync_result(&ctx, result)
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_net_setNoDelay",
        Func::from(move |ctx: Ctx<'_>, handle: u32, enabled: Opt<bool>| {
            let result = with_socket(&st, handle, |socket| {
                let stream = socket.stream.as_ref().ok_or_else(|| {
                    FuncliteError::InvalidArgument("socket is closed or busy".into())
                })?;
                stream
                    .tcp_ref()
                    .set_nodelay(enabled.0.unwrap_or(true))
                    .map_err(|e| FuncliteError::Internal(format!("setNoDelay failed: {}", e.kind())))
            });
            super::convert::sync_result(&ctx, result)
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_net_setKeepAlive",
        Func::from(move |ctx: Ctx<'_>, handle: u32, enabled: Opt<bool>| {
            let result = with_socket(&st, handle, |socket| {
                let stream = socket.stream.as_ref().ok_or_else(|| {
                    FuncliteError::InvalidArgument("socket is closed or busy".into())
                })?;
                let sock = socket2::SockRef::from(stream.tcp_ref());
                sock.set_keepalive(enabled.0.unwrap_or(true))
                    .map_err(|e| FuncliteError::Internal(format!("setKeepAlive failed: {}", e.kind())))
            });
            super::convert::sync_result(&ctx, result)
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_tls_info",
        Func::from(move |ctx: Ctx<'_>, handle: u32| {
            let result = with_socket(&st, handle, |socket| {
                let info = socket.tls.clone().unwrap_or_default();
                Ok(serde_json::json!({
                    "authorized": info.authorized,
                    "protocol": info.protocol,
                    "cipher": info.cipher,
                }))
            });
            super::convert::sync_result(&ctx, result.map(JsJson))
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "_tls_peerCertificate",
        Func::from(move |ctx: Ctx<'_>, handle: u32| {
            let result = with_socket(&st, handle, |socket| {
                let raw = socket
                    .tls
                    .as_ref()
                    .and_then(|info| info.peer_certificate_b64.clone());
                Ok(match raw {
                    Some(raw) => serde_json::json!({ "raw": raw }),
                    None => serde_json::json!({}),
                })
            });
            super::convert::sync_result(&ctx, result.map(JsJson))
        }),
    )?;

    globals.set(
        "_tls_getCACertificates",
        Func::from(|_store: Opt<String>| {
            let subjects = webpki_roots::TLS_SERVER_ROOTS
                .iter()
                .map(|anchor| serde_json::json!(BASE64.encode(anchor.subject.as_ref())))
                .collect::<Vec<_>>();
            Ok::<_, rquickjs::Error>(JsJson(serde_json::Value::Array(subjects)))
        }),
    )?;

    Ok(())
}
