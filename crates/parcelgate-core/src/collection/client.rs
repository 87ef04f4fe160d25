//! Endpoint side of a collection connection

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::protocol::{frame_codec, ClientFrame, ServerFrame, StreamingMode};
use crate::error::ProtocolError;
use crate::identity::EndpointCredentials;

/// What the gateway sent after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Delivery { delivery_id: String, parcel: Vec<u8> },
    Heartbeat,
    Closed { code: u16, reason: String },
}

/// Collects parcels from a gateway on behalf of one or more endpoints
pub struct CollectionClient<S> {
    framed: Framed<S, LengthDelimitedCodec>,
}

impl CollectionClient<TcpStream> {
    pub async fn connect_tcp(addr: impl ToSocketAddrs) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }
}

impl<S> CollectionClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S) -> Self {
        Self {
            framed: Framed::new(io, frame_codec()),
        }
    }

    /// Send a raw frame
    pub async fn send(&mut self, frame: &ClientFrame) -> Result<(), ProtocolError> {
        self.framed.send(frame.encode()?).await?;
        Ok(())
    }

    /// Receive a raw frame; `None` once the gateway has hung up
    pub async fn recv(&mut self) -> Result<Option<ServerFrame>, ProtocolError> {
        match self.framed.next().await {
            None => Ok(None),
            Some(bytes) => Ok(Some(ServerFrame::decode(&bytes?)?)),
        }
    }

    /// Send the connection parameters and wait for the challenge nonce
    pub async fn open(&mut self, mode: StreamingMode) -> Result<Vec<u8>, ProtocolError> {
        self.send(&ClientFrame::Connect {
            streaming_mode: mode.as_str().to_string(),
        })
        .await?;

        loop {
            match self.recv().await? {
                Some(ServerFrame::Challenge { nonce }) => return Ok(nonce),
                Some(ServerFrame::Heartbeat) => continue,
                Some(ServerFrame::Close { code, reason }) => {
                    return Err(ProtocolError::Closed { code, reason })
                }
                Some(ServerFrame::Delivery { .. }) => {
                    return Err(ProtocolError::UnexpectedFrame(
                        "delivery before handshake".to_string(),
                    ))
                }
                None => return Err(ProtocolError::Disconnected),
            }
        }
    }

    /// Answer a challenge with one signature per set of credentials
    pub async fn authenticate(
        &mut self,
        nonce: &[u8],
        credentials: &[EndpointCredentials],
    ) -> Result<(), ProtocolError> {
        let signatures = credentials.iter().map(|c| c.sign_nonce(nonce)).collect();
        self.send(&ClientFrame::HandshakeResponse { signatures }).await
    }

    /// [`open`](Self::open) followed by [`authenticate`](Self::authenticate)
    pub async fn handshake(
        &mut self,
        mode: StreamingMode,
        credentials: &[EndpointCredentials],
    ) -> Result<(), ProtocolError> {
        let nonce = self.open(mode).await?;
        self.authenticate(&nonce, credentials).await
    }

    /// Next event after the handshake; `None` once the gateway has hung up
    pub async fn next_event(&mut self) -> Result<Option<ServerEvent>, ProtocolError> {
        let event = match self.recv().await? {
            None => return Ok(None),
            Some(ServerFrame::Delivery {
                delivery_id,
                parcel,
            }) => ServerEvent::Delivery {
                delivery_id,
                parcel,
            },
            Some(ServerFrame::Heartbeat) => ServerEvent::Heartbeat,
            Some(ServerFrame::Close { code, reason }) => ServerEvent::Closed { code, reason },
            Some(ServerFrame::Challenge { .. }) => {
                return Err(ProtocolError::UnexpectedFrame(
                    "challenge after handshake".to_string(),
                ))
            }
        };
        Ok(Some(event))
    }

    pub async fn acknowledge(&mut self, delivery_id: &str) -> Result<(), ProtocolError> {
        self.send(&ClientFrame::Ack {
            delivery_id: delivery_id.as_bytes().to_vec(),
        })
        .await
    }

    pub fn into_inner(self) -> S {
        self.framed.into_inner()
    }
}
