use futures_util::{SinkExt, StreamExt};
use relay_protocol::Envelope;
use std::collections::VecDeque;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A test client for a running hub endpoint.
///
/// The hub may coalesce several queued envelopes into one text frame
/// separated by newlines; the client splits incoming frames and hands
/// the parts back one at a time.
pub struct MockWsClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
    pending: VecDeque<String>,
}

impl MockWsClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self {
            write,
            read,
            pending: VecDeque::new(),
        })
    }

    /// Connect with an explicit `Origin` header, for exercising the
    /// upgrade gate.  Fails when the server denies the upgrade.
    pub async fn connect_with_origin(
        url: &str,
        origin: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        use tokio_tungstenite::tungstenite::handshake::client::generate_key;
        let uri: tokio_tungstenite::tungstenite::http::Uri = url.parse()?;
        let host = uri.host().unwrap_or("localhost").to_owned();
        let host_header = if let Some(p) = uri.port_u16() {
            format!("{}:{}", host, p)
        } else {
            host
        };
        let request = Request::builder()
            .uri(url)
            .header("Host", host_header)
            .header("Origin", origin)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .body(())?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
        let (write, read) = ws_stream.split();
        Ok(Self {
            write,
            read,
            pending: VecDeque::new(),
        })
    }

    pub async fn send_envelope(
        &mut self,
        envelope: &Envelope,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let json = envelope.encode()?;
        self.send_text(&json).await
    }

    /// Send a raw text frame (exact bytes, no validation).
    pub async fn send_text(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Receive the next JSON object from the server, transparently
    /// unbatching newline-coalesced frames.
    pub async fn recv_json(&mut self) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
        let text = self.recv_part().await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Receive the next envelope from the server.  Fails on a JSON
    /// object that is not a valid envelope.
    pub async fn recv_envelope(&mut self) -> Result<Envelope, Box<dyn std::error::Error>> {
        let text = self.recv_part().await?;
        Ok(Envelope::decode(&text)?)
    }

    async fn recv_part(&mut self) -> Result<String, Box<dyn std::error::Error>> {
        loop {
            if let Some(part) = self.pending.pop_front() {
                return Ok(part);
            }
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.pending.extend(
                        relay_protocol::split_batch(&text).map(ToOwned::to_owned),
                    );
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
