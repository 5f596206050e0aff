//! Gemini Live API client
//!
//! Opens the BidiGenerateContent WebSocket, splits it into a writer task fed
//! by an unbounded channel and a reader task that translates server
//! messages into [`TransportEvent`]s. `Open` is only reported once the
//! server acknowledges the setup message.

use crate::gemini::{BidiGenerateContentSetup, ClientMessage, GeminiError, RealtimeInput, ServerMessage};
use crate::transport::{
    LiveConfig, LiveConnector, LiveLink, LiveTransport, MediaChunk, TransportError, TransportEvent,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Frames queued for the writer task
#[derive(Debug)]
enum Outbound {
    Json(String),
    Close,
}

/// Connects live sessions to the Gemini Live API.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    url: String,
    setup_timeout: Duration,
}

impl GeminiLiveConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            setup_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_api_key(api_key: &str) -> Self {
        Self::new(format!("{}?key={}", LIVE_ENDPOINT, api_key))
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }
}

impl LiveConnector for GeminiLiveConnector {
    async fn connect(&mut self, config: &LiveConfig) -> Result<LiveLink, TransportError> {
        info!("Connecting to Gemini Live API with model {}", config.model);

        let (ws, resp) = connect_async(self.url.as_str())
            .await
            .map_err(GeminiError::WebSocket)?;
        debug!("WebSocket connection response: {:?}", resp.status());

        let (mut sink, stream) = ws.split();

        let setup = ClientMessage::Setup(BidiGenerateContentSetup::from_config(config));
        let json = serde_json::to_string(&setup).map_err(GeminiError::Serialization)?;
        sink.send(Message::text(json))
            .await
            .map_err(GeminiError::WebSocket)?;
        info!("Setup message sent, waiting for acknowledgment");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(64);

        tokio::spawn(run_writer(sink, outbound_rx));
        tokio::spawn(run_reader(stream, event_tx, self.setup_timeout));

        Ok(LiveLink {
            transport: Box::new(GeminiTransport {
                outbound: outbound_tx,
                closed: false,
            }),
            events: event_rx,
        })
    }
}

/// Write half handed to the session.
struct GeminiTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: bool,
}

impl LiveTransport for GeminiTransport {
    fn send_realtime_input(&mut self, chunk: MediaChunk) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let msg = ClientMessage::RealtimeInput(RealtimeInput::from(&chunk));
        let json = serde_json::to_string(&msg).map_err(|e| TransportError::Send(e.to_string()))?;
        self.outbound
            .send(Outbound::Json(json))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.outbound.send(Outbound::Close);
    }

    fn is_closed(&self) -> bool {
        self.closed || self.outbound.is_closed()
    }
}

impl Drop for GeminiTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_writer(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    debug!("WebSocket writer task started");
    while let Some(msg) = outbound_rx.recv().await {
        match msg {
            Outbound::Json(json) => {
                if let Err(e) = sink.send(Message::text(json)).await {
                    error!("Failed to send to websocket: {}", e);
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    if let Err(e) = sink.close().await {
        debug!("WebSocket close: {}", e);
    }
    info!("WebSocket writer task shutting down");
}

async fn run_reader(
    mut stream: SplitStream<WsStream>,
    event_tx: mpsc::Sender<TransportEvent>,
    setup_timeout: Duration,
) {
    let setup_deadline = tokio::time::sleep(setup_timeout);
    tokio::pin!(setup_deadline);
    let mut open = false;

    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = &mut setup_deadline, if !open => {
                error!("Timeout waiting for setup complete message");
                let _ = event_tx.send(TransportEvent::Error(GeminiError::Timeout.to_string())).await;
                break;
            }
        };

        let text = match message {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => text.to_owned(),
                Err(_) => {
                    debug!("Ignoring non-UTF-8 binary message ({} bytes)", bytes.len());
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                info!("WebSocket closed: {:?}", frame);
                let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                let _ = event_tx.send(TransportEvent::Close(reason)).await;
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                error!("WebSocket error: {:?}", e);
                let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                break;
            }
            None => {
                let _ = event_tx.send(TransportEvent::Close(None)).await;
                break;
            }
        };

        let server_message = match ServerMessage::parse(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Failed to parse server message: {}", e);
                continue;
            }
        };

        if server_message.is_setup_complete() {
            if !open {
                open = true;
                info!("Gemini session setup complete");
                if event_tx.send(TransportEvent::Open).await.is_err() {
                    break;
                }
            }
            continue;
        }
        if server_message.is_go_away() {
            info!("Server requested disconnection");
            let _ = event_tx
                .send(TransportEvent::Close(Some("server requested disconnect".into())))
                .await;
            break;
        }

        for event in server_message.into_events() {
            if event_tx.send(TransportEvent::Message(event)).await.is_err() {
                debug!("Session dropped its event feed");
                return;
            }
        }
    }
    info!("Inbound message task terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ResponseModality, ServerEvent};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn live_config() -> LiveConfig {
        LiveConfig {
            model: "gemini-live-test".into(),
            response_modality: ResponseModality::Audio,
            voice: "Kore".into(),
            system_instruction: String::new(),
        }
    }

    /// Local server that acknowledges setup, echoes the first realtime input
    /// back as model audio and then closes.
    async fn spawn_fake_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();

            let setup = ws.next().await.unwrap().unwrap();
            let setup: serde_json::Value = serde_json::from_str(setup.to_text().unwrap()).unwrap();
            assert_eq!(setup["setup"]["model"], "models/gemini-live-test");
            ws.send(Message::text(r#"{"setupComplete": {}}"#)).await.unwrap();

            let input = ws.next().await.unwrap().unwrap();
            let input: serde_json::Value = serde_json::from_str(input.to_text().unwrap()).unwrap();
            let data = input["realtimeInput"]["audio"]["data"].as_str().unwrap().to_owned();
            let reply = serde_json::json!({
                "serverContent": {"modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": data}}]}}
            });
            ws.send(Message::text(reply.to_string())).await.unwrap();
            ws.close(None).await.unwrap();
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_open_message_and_close_round_trip() {
        let url = spawn_fake_server().await;
        let mut connector = GeminiLiveConnector::new(url);
        let mut link = connector.connect(&live_config()).await.unwrap();

        assert_eq!(link.events.recv().await, Some(TransportEvent::Open));

        link.transport
            .send_realtime_input(MediaChunk::microphone_pcm(vec![7u8, 0, 8, 0]))
            .unwrap();
        assert_eq!(
            link.events.recv().await,
            Some(TransportEvent::Message(ServerEvent::Audio(bytes::Bytes::from_static(&[7, 0, 8, 0]))))
        );
        assert!(matches!(link.events.recv().await, Some(TransportEvent::Close(_))));
    }

    #[tokio::test]
    async fn test_setup_timeout_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            // Never acknowledge setup.
            while ws.next().await.is_some() {}
        });

        let mut connector = GeminiLiveConnector::new(format!("ws://{}", addr))
            .with_setup_timeout(Duration::from_millis(50));
        let mut link = connector.connect(&live_config()).await.unwrap();
        assert!(matches!(link.events.recv().await, Some(TransportEvent::Error(_))));
    }

    #[test]
    fn test_closed_transport_rejects_input() {
        let (outbound, _rx) = mpsc::unbounded_channel();
        let mut transport = GeminiTransport {
            outbound,
            closed: false,
        };
        transport.close();
        transport.close();
        assert!(transport.is_closed());
        assert_eq!(
            transport.send_realtime_input(MediaChunk::microphone_pcm(vec![0u8, 0])),
            Err(TransportError::Closed)
        );
    }
}
