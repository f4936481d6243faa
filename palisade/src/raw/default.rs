// Copyright 2020 Palantir Technologies, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
use crate::builder::{Builder, Complete};
use crate::errors::Error;
use crate::raw::{
    BuildRawClient, ConnectTimeoutError, RawBody, ReadTimeoutError, Service, TransportConfig,
};
use crate::timing::TimingRecorder;
use http::header::HOST;
use http::uri::Scheme;
use http::{HeaderValue, Request, Response, Uri};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::{error, fmt, io};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{self, TcpStream};
use tokio::time;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// The default raw client builder.
#[derive(Copy, Clone)]
pub struct DefaultRawClientBuilder;

impl BuildRawClient for DefaultRawClientBuilder {
    type RawClient = DefaultRawClient;

    fn build_raw_client(&self, _: &Builder<Complete<Self>>) -> Result<DefaultRawClient, Error> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(DefaultRawClient {
            tls: TlsConnector::from(Arc::new(config)),
        })
    }
}

/// The default raw client implementation.
///
/// This is currently implemented with `hyper` and `rustls`, but that is
/// subject to change at any time. Each dispatch resolves, connects, and
/// performs its own HTTP/1 handshake, reporting the transport milestones to
/// the attempt's [`TimingRecorder`].
pub struct DefaultRawClient {
    tls: TlsConnector,
}

/// The response body type used by [`DefaultRawClient`].
pub type DefaultRawBody = hyper::body::Incoming;

impl Service<Request<RawBody>> for DefaultRawClient {
    type Response = Response<DefaultRawBody>;
    type Error = DefaultRawError;

    fn call(
        &self,
        req: Request<RawBody>,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send {
        let tls = self.tls.clone();
        async move { dispatch(tls, req).await }
    }
}

async fn dispatch(
    tls: TlsConnector,
    mut req: Request<RawBody>,
) -> Result<Response<DefaultRawBody>, DefaultRawError> {
    let config = req
        .extensions()
        .get::<TransportConfig>()
        .copied()
        .unwrap_or_default();
    let recorder = req.extensions().get::<Arc<TimingRecorder>>().cloned();

    let uri = req.uri().clone();
    let https = uri.scheme() == Some(&Scheme::HTTPS);
    let host = uri
        .host()
        .ok_or_else(|| DefaultRawError::new("request URI has no host"))?
        .to_string();
    let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

    if let Some(recorder) = &recorder {
        recorder.socket_assigned();
    }

    let stream = time::timeout(config.connect_timeout, connect(&host, port, recorder.as_ref()))
        .await
        .map_err(|_| DefaultRawError::new(ConnectTimeoutError(())))?
        .map_err(DefaultRawError::new)?;

    let stream = if https {
        let name = ServerName::try_from(host.clone()).map_err(DefaultRawError::new)?;
        let stream = time::timeout(config.read_timeout, tls.connect(name, stream))
            .await
            .map_err(|_| DefaultRawError::new(ReadTimeoutError(())))?
            .map_err(DefaultRawError::new)?;
        if let Some(recorder) = &recorder {
            recorder.tls_connected();
        }
        MaybeHttpsStream::Https(stream)
    } else {
        MaybeHttpsStream::Http(stream)
    };

    let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(DefaultRawError::new)?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "connection terminated abnormally");
        }
    });

    let authority = if (https && port == 443) || (!https && port == 80) {
        host.clone()
    } else {
        format!("{}:{}", host, port)
    };
    let authority = HeaderValue::from_str(&authority).map_err(DefaultRawError::new)?;
    req.headers_mut().insert(HOST, authority);

    // the connection is dedicated to this host, so send the URI in origin-form
    let origin_form = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    *req.uri_mut() = origin_form.parse::<Uri>().map_err(DefaultRawError::new)?;

    let response = time::timeout(config.read_timeout, sender.send_request(req))
        .await
        .map_err(|_| DefaultRawError::new(ReadTimeoutError(())))?
        .map_err(DefaultRawError::new)?;

    Ok(response)
}

async fn connect(
    host: &str,
    port: u16,
    recorder: Option<&Arc<TimingRecorder>>,
) -> io::Result<TcpStream> {
    let addrs = net::lookup_host((host, port)).await?;
    if let Some(recorder) = recorder {
        recorder.dns_resolved();
    }

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                if let Some(recorder) = recorder {
                    recorder.tcp_connected();
                }
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")))
}

/// A stream which may or may not be TLS-protected.
#[pin_project(project = MaybeHttpsStreamProj)]
pub enum MaybeHttpsStream<T> {
    /// A plaintext stream.
    Http(#[pin] T),
    /// A TLS-protected stream.
    Https(#[pin] TlsStream<T>),
}

impl<T> AsyncRead for MaybeHttpsStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeHttpsStreamProj::Http(s) => s.poll_read(cx, buf),
            MaybeHttpsStreamProj::Https(s) => s.poll_read(cx, buf),
        }
    }
}

impl<T> AsyncWrite for MaybeHttpsStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            MaybeHttpsStreamProj::Http(s) => s.poll_write(cx, buf),
            MaybeHttpsStreamProj::Https(s) => s.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeHttpsStreamProj::Http(s) => s.poll_flush(cx),
            MaybeHttpsStreamProj::Https(s) => s.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeHttpsStreamProj::Http(s) => s.poll_shutdown(cx),
            MaybeHttpsStreamProj::Https(s) => s.poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            MaybeHttpsStreamProj::Http(s) => s.poll_write_vectored(cx, bufs),
            MaybeHttpsStreamProj::Https(s) => s.poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            MaybeHttpsStream::Http(s) => s.is_write_vectored(),
            MaybeHttpsStream::Https(s) => s.is_write_vectored(),
        }
    }
}

/// The error type used by [`DefaultRawClient`].
#[derive(Debug)]
pub struct DefaultRawError(Box<dyn error::Error + Sync + Send>);

impl DefaultRawError {
    fn new<E>(e: E) -> DefaultRawError
    where
        E: Into<Box<dyn error::Error + Sync + Send>>,
    {
        DefaultRawError(e.into())
    }
}

impl fmt::Display for DefaultRawError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, fmt)
    }
}

impl error::Error for DefaultRawError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&*self.0 as &(dyn error::Error + 'static))
    }
}
