//! IRC over WebSocket 传输（Twitch 聊天网关）
//!
//! 一条 WebSocket 连接，写方向走 mpsc 队列，读方向逐行解析 IRC。
//! join / leave 等待服务器回显自己的 JOIN / PART 作为确认；连接断开后指数退避重连，
//! 成功后推送 Reconnected，由对账任务把频道重新加回来。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{ChatTransport, IncomingMessage, TransportEvent};
use crate::config::AppConfig;
use crate::core::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// 服务器拒绝 join 时 NOTICE 携带的 msg-id
const JOIN_FAILURE_NOTICES: &[&str] = &[
    "msg_channel_suspended",
    "msg_banned",
    "msg_requires_verified_phone_number",
    "msg_verified_email",
    "tos_ban",
];

#[derive(Debug, Clone)]
pub struct IrcConfig {
    pub url: String,
    pub nickname: String,
    pub oauth_token: Option<String>,
    pub operation_timeout: Duration,
}

impl IrcConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            url: config.transport.url.clone(),
            nickname: config.bot.nickname.to_lowercase(),
            oauth_token: config.bot.oauth_token.clone(),
            operation_timeout: config.transport.operation_timeout(),
        }
    }

    fn handshake_lines(&self) -> Vec<String> {
        let mut lines = vec!["CAP REQ :twitch.tv/tags twitch.tv/commands".to_string()];
        if let Some(token) = &self.oauth_token {
            if token.starts_with("oauth:") {
                lines.push(format!("PASS {}", token));
            } else {
                lines.push(format!("PASS oauth:{}", token));
            }
        }
        lines.push(format!("NICK {}", self.nickname));
        lines
    }
}

/// 一行解析后的 IRC 消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine {
    pub tags: HashMap<String, String>,
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcLine {
    /// prefix 中的昵称部分（nick!user@host）
    pub fn nick(&self) -> Option<&str> {
        self.prefix.as_deref().and_then(|p| p.split('!').next())
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn channel_param(&self) -> Option<String> {
        self.params
            .first()
            .filter(|p| p.starts_with('#'))
            .map(|p| p.trim_start_matches('#').to_lowercase())
    }
}

pub fn parse_line(raw: &str) -> Option<IrcLine> {
    let mut rest = raw.trim_end_matches(['\r', '\n']);
    if rest.is_empty() {
        return None;
    }

    let mut tags = HashMap::new();
    if let Some(stripped) = rest.strip_prefix('@') {
        let (raw_tags, remainder) = stripped.split_once(' ')?;
        for pair in raw_tags.split(';') {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            tags.insert(k.to_string(), unescape_tag(v));
        }
        rest = remainder.trim_start();
    }

    let mut prefix = None;
    if let Some(stripped) = rest.strip_prefix(':') {
        let (p, remainder) = stripped.split_once(' ')?;
        prefix = Some(p.to_string());
        rest = remainder.trim_start();
    }

    let (head, trailing) = match rest.split_once(" :") {
        Some((head, trailing)) => (head, Some(trailing)),
        None => (rest, None),
    };
    let mut parts = head.split_whitespace();
    let command = parts.next()?.to_ascii_uppercase();
    let mut params: Vec<String> = parts.map(str::to_string).collect();
    if let Some(trailing) = trailing {
        params.push(trailing.to_string());
    }

    Some(IrcLine {
        tags,
        prefix,
        command,
        params,
    })
}

fn unescape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some(':') => out.push(';'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// 把 PRIVMSG 转成入站消息
pub fn to_incoming(line: &IrcLine, own_nick: &str) -> Option<IncomingMessage> {
    if line.command != "PRIVMSG" {
        return None;
    }
    let channel = line.channel_param()?;
    let content = line.params.get(1)?.clone();
    let author = line.nick()?.to_lowercase();
    let timestamp = line
        .tag("tmi-sent-ts")
        .and_then(|ts| ts.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    Some(IncomingMessage {
        is_self: author.eq_ignore_ascii_case(own_nick),
        channel,
        author,
        content,
        transport_message_id: line.tag("id").map(str::to_string),
        timestamp,
        color: line.tag("color").map(str::to_string),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PendingKey {
    Join(String),
    Part(String),
}

type Ack = oneshot::Sender<Result<(), String>>;

#[derive(Default)]
struct Shared {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<PendingKey, Ack>>,
}

impl Shared {
    fn send_line(&self, line: String) -> Result<(), TransportError> {
        let outbound = self.outbound.lock().unwrap_or_else(|p| p.into_inner());
        match outbound.as_ref() {
            Some(tx) => tx.send(line).map_err(|_| TransportError::NotConnected),
            None => Err(TransportError::NotConnected),
        }
    }

    fn install_outbound(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        rx
    }

    fn register(&self, key: PendingKey) -> oneshot::Receiver<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).insert(key, tx);
        rx
    }

    fn complete(&self, key: &PendingKey, result: Result<(), String>) -> bool {
        let ack = self.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(key);
        match ack {
            Some(ack) => {
                let _ = ack.send(result);
                true
            }
            None => false,
        }
    }

    fn forget(&self, key: &PendingKey) {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(key);
    }

    /// 连接断开：丢弃写队列与所有等待中的确认
    fn reset(&self) {
        *self.outbound.lock().unwrap_or_else(|p| p.into_inner()) = None;
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

enum LineAction {
    Nothing,
    Reply(String),
    Reconnect,
}

enum SessionEnd {
    Closed,
    Lost(String),
}

pub struct IrcTransport {
    config: IrcConfig,
    shared: Arc<Shared>,
    closing: CancellationToken,
}

impl IrcTransport {
    pub fn new(config: IrcConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            closing: CancellationToken::new(),
        }
    }

    async fn await_ack(
        &self,
        key: PendingKey,
        rx: oneshot::Receiver<Result<(), String>>,
        what: String,
    ) -> Result<(), String> {
        match tokio::time::timeout(self.config.operation_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err("connection dropped".to_string()),
            Err(_) => {
                self.shared.forget(&key);
                Err(format!("no confirmation for {} within {:?}", what, self.config.operation_timeout))
            }
        }
    }
}

async fn open_session(config: &IrcConfig) -> Result<WsStream, TransportError> {
    let (mut ws, _response) = tokio::time::timeout(config.operation_timeout, connect_async(config.url.as_str()))
        .await
        .map_err(|_| TransportError::Timeout(format!("connecting to {}", config.url)))?
        .map_err(|e| TransportError::Protocol(format!("WebSocket connect failed: {}", e)))?;

    for line in config.handshake_lines() {
        ws.send(WsMessage::Text(line))
            .await
            .map_err(|e| TransportError::Protocol(format!("handshake failed: {}", e)))?;
    }
    Ok(ws)
}

fn handle_line(
    line: IrcLine,
    shared: &Shared,
    events: &mpsc::UnboundedSender<TransportEvent>,
    own_nick: &str,
) -> LineAction {
    match line.command.as_str() {
        "PING" => {
            let token = line.params.first().cloned().unwrap_or_default();
            LineAction::Reply(format!("PONG :{}", token))
        }
        "RECONNECT" => LineAction::Reconnect,
        "JOIN" if line.nick().is_some_and(|n| n.eq_ignore_ascii_case(own_nick)) => {
            if let Some(channel) = line.channel_param() {
                shared.complete(&PendingKey::Join(channel), Ok(()));
            }
            LineAction::Nothing
        }
        "PART" if line.nick().is_some_and(|n| n.eq_ignore_ascii_case(own_nick)) => {
            if let Some(channel) = line.channel_param() {
                if !shared.complete(&PendingKey::Part(channel.clone()), Ok(())) {
                    let _ = events.send(TransportEvent::Parted { channel });
                }
            }
            LineAction::Nothing
        }
        "NOTICE" => {
            let refused = line.tag("msg-id").is_some_and(|id| JOIN_FAILURE_NOTICES.contains(&id));
            if let (true, Some(channel)) = (refused, line.channel_param()) {
                let reason = line.params.get(1).cloned().unwrap_or_else(|| "refused".to_string());
                shared.complete(&PendingKey::Join(channel), Err(reason));
            }
            LineAction::Nothing
        }
        "PRIVMSG" => {
            if let Some(message) = to_incoming(&line, own_nick) {
                let _ = events.send(TransportEvent::Message(message));
            }
            LineAction::Nothing
        }
        _ => LineAction::Nothing,
    }
}

async fn drive_session(
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    shared: &Shared,
    events: &mpsc::UnboundedSender<TransportEvent>,
    own_nick: &str,
    closing: &CancellationToken,
) -> SessionEnd {
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            _ = closing.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return SessionEnd::Closed;
            }
            Some(line) = outbound.recv() => {
                if let Err(e) = sink.send(WsMessage::Text(line)).await {
                    return SessionEnd::Lost(format!("write failed: {}", e));
                }
            }
            incoming = source.next() => {
                let text = match incoming {
                    None => return SessionEnd::Lost("stream ended".to_string()),
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = sink.send(WsMessage::Pong(payload)).await;
                        continue;
                    }
                    Some(Ok(WsMessage::Close(_))) => return SessionEnd::Lost("closed by server".to_string()),
                    Some(Ok(_)) => continue,
                };

                for raw in text.lines() {
                    let Some(line) = parse_line(raw) else { continue };
                    match handle_line(line, shared, events, own_nick) {
                        LineAction::Nothing => {}
                        LineAction::Reply(reply) => {
                            if let Err(e) = sink.send(WsMessage::Text(reply)).await {
                                return SessionEnd::Lost(format!("write failed: {}", e));
                            }
                        }
                        LineAction::Reconnect => return SessionEnd::Lost("server requested reconnect".to_string()),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ChatTransport for IrcTransport {
    async fn connect(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<(), TransportError> {
        let first = open_session(&self.config).await?;
        tracing::info!("Connected to {} as {}", self.config.url, self.config.nickname);

        let config = self.config.clone();
        let shared = Arc::clone(&self.shared);
        let closing = self.closing.clone();
        let mut outbound = shared.install_outbound();

        tokio::spawn(async move {
            let mut ws = first;
            loop {
                let end = drive_session(ws, outbound, &shared, &events, &config.nickname, &closing).await;
                shared.reset();
                match end {
                    SessionEnd::Closed => {
                        let _ = events.send(TransportEvent::Closed {
                            reason: "closed by client".to_string(),
                        });
                        return;
                    }
                    SessionEnd::Lost(reason) => tracing::warn!("Chat connection lost: {}", reason),
                }

                let mut backoff = Duration::from_secs(1);
                ws = loop {
                    tokio::select! {
                        _ = closing.cancelled() => {
                            let _ = events.send(TransportEvent::Closed {
                                reason: "closed while reconnecting".to_string(),
                            });
                            return;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    match open_session(&config).await {
                        Ok(ws) => break ws,
                        Err(e) => {
                            tracing::warn!("Reconnect failed, retrying in {:?}: {}", backoff, e);
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    }
                };

                outbound = shared.install_outbound();
                tracing::info!("Chat connection re-established");
                let _ = events.send(TransportEvent::Reconnected);
            }
        });

        Ok(())
    }

    async fn join(&self, channel: &str) -> Result<(), TransportError> {
        let key = PendingKey::Join(channel.to_string());
        let rx = self.shared.register(key.clone());
        if let Err(e) = self.shared.send_line(format!("JOIN #{}", channel)) {
            self.shared.forget(&key);
            return Err(e);
        }
        self.await_ack(key, rx, format!("JOIN #{}", channel))
            .await
            .map_err(|reason| TransportError::Join {
                channel: channel.to_string(),
                reason,
            })
    }

    async fn leave(&self, channel: &str) -> Result<(), TransportError> {
        let key = PendingKey::Part(channel.to_string());
        let rx = self.shared.register(key.clone());
        if let Err(e) = self.shared.send_line(format!("PART #{}", channel)) {
            self.shared.forget(&key);
            return Err(e);
        }
        self.await_ack(key, rx, format!("PART #{}", channel))
            .await
            .map_err(|reason| TransportError::Leave {
                channel: channel.to_string(),
                reason,
            })
    }

    async fn send(&self, channel: &str, text: &str) -> Result<(), TransportError> {
        let text = text.replace(['\r', '\n'], " ");
        self.shared
            .send_line(format!("PRIVMSG #{} :{}", channel, text))
            .map_err(|e| TransportError::Send {
                channel: channel.to_string(),
                reason: e.to_string(),
            })
    }

    async fn close(&self) {
        self.closing.cancel();
    }
}
