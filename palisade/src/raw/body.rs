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
use crate::body::{Body, ResetTrackingBody};
use crate::errors::BoxError;
use bytes::{Bytes, BytesMut};
use futures::channel::{mpsc, oneshot};
use futures::{SinkExt, Stream};
use http_body::{Frame, SizeHint};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::{error, fmt, io};
use tracing::debug;

/// The error type produced by [`RawBody`] when the request body fails.
#[derive(Debug)]
pub struct BodyError(pub(crate) ());

impl fmt::Display for BodyError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("error writing request body")
    }
}

impl error::Error for BodyError {}

pub(crate) enum BodyPart {
    Chunk(Bytes),
    Done,
}

pub(crate) enum RawBodyInner {
    Empty,
    Stream {
        receiver: mpsc::Receiver<BodyPart>,
        polled: Option<oneshot::Sender<()>>,
    },
}

/// The request body type passed to the raw HTTP client.
pub struct RawBody {
    pub(crate) inner: RawBodyInner,
}

impl RawBody {
    pub(crate) fn new<'a, 'b>(
        body: Option<Pin<&'a mut ResetTrackingBody<dyn Body + Sync + Send + 'b>>>,
    ) -> (RawBody, Writer<'a, 'b>) {
        match body {
            None => (
                RawBody {
                    inner: RawBodyInner::Empty,
                },
                Writer::Nop,
            ),
            Some(body) => {
                let (body_sender, body_receiver) = mpsc::channel(1);
                let (polled_sender, polled_receiver) = oneshot::channel();
                (
                    RawBody {
                        inner: RawBodyInner::Stream {
                            receiver: body_receiver,
                            polled: Some(polled_sender),
                        },
                    },
                    Writer::Streaming {
                        polled: polled_receiver,
                        body,
                        sender: body_sender,
                    },
                )
            }
        }
    }
}

impl http_body::Body for RawBody {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        match &mut this.inner {
            RawBodyInner::Empty => Poll::Ready(None),
            RawBodyInner::Stream { receiver, polled } => {
                if let Some(polled) = polled.take() {
                    let _ = polled.send(());
                }

                match Pin::new(receiver).poll_next(cx) {
                    Poll::Ready(Some(BodyPart::Chunk(bytes))) => {
                        Poll::Ready(Some(Ok(Frame::data(bytes))))
                    }
                    Poll::Ready(Some(BodyPart::Done)) => {
                        this.inner = RawBodyInner::Empty;
                        Poll::Ready(None)
                    }
                    Poll::Ready(None) => Poll::Ready(Some(Err(BodyError(())))),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.inner, RawBodyInner::Empty)
    }

    fn size_hint(&self) -> SizeHint {
        match self.inner {
            RawBodyInner::Empty => SizeHint::with_exact(0),
            RawBodyInner::Stream { .. } => SizeHint::new(),
        }
    }
}

/// The asynchronous writer passed to [`Body::write`](crate::Body::write).
///
/// Small writes are buffered; [`BodyWriter::write_bytes`] bypasses the buffer
/// for callers that already hold their data in [`Bytes`].
pub struct BodyWriter {
    sender: mpsc::Sender<BodyPart>,
    buf: BytesMut,
}

impl BodyWriter {
    pub(crate) fn new(sender: mpsc::Sender<BodyPart>) -> BodyWriter {
        BodyWriter {
            sender,
            buf: BytesMut::new(),
        }
    }

    /// Writes a block of body bytes through the internal buffer.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.buf.len() > 4096 {
            self.flush().await?;
        }
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    /// Writes a block of body bytes, avoiding a copy of already-owned data.
    pub async fn write_bytes(&mut self, bytes: Bytes) -> io::Result<()> {
        self.flush().await?;
        self.send(BodyPart::Chunk(bytes)).await
    }

    /// Flushes buffered bytes out to the transport.
    pub async fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        self.send(BodyPart::Chunk(chunk)).await
    }

    pub(crate) async fn finish(mut self) -> io::Result<()> {
        self.flush().await?;
        self.send(BodyPart::Done).await
    }

    async fn send(&mut self, part: BodyPart) -> io::Result<()> {
        self.sender
            .send(part)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

pub(crate) enum Writer<'a, 'b> {
    Nop,
    Streaming {
        polled: oneshot::Receiver<()>,
        body: Pin<&'a mut ResetTrackingBody<dyn Body + Sync + Send + 'b>>,
        sender: mpsc::Sender<BodyPart>,
    },
}

impl Writer<'_, '_> {
    pub(crate) async fn write(self) -> Result<(), BoxError> {
        match self {
            Writer::Nop => Ok(()),
            Writer::Streaming {
                polled,
                body,
                sender,
            } => {
                // wait for the transport to actually ask for the body so we
                // don't start reading it if the request fails early
                if polled.await.is_err() {
                    debug!("transport hung up before polling the request body");
                    return Ok(());
                }

                let mut writer = BodyWriter::new(sender);
                body.write(&mut writer).await?;
                writer.finish().await?;

                Ok(())
            }
        }
    }
}
