/// The relay connection: one IRC client session to the remote network,
/// re-established on demand.
///
/// The task registers, joins the configured channels after 001, and feeds
/// every inbound line to the tracker in arrival order. Lines queued on the
/// outgoing channel (tracker requests, the WHOIS pacer, the bridge itself)
/// are written as they arrive. Health goes to the resilience manager as
/// `relay-chat`; reconnection happens only when the manager asks for it.
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use super::codec::{CodecError, IrcCodec};
use super::message::Message;
use super::tracker::SharedTracker;
use crate::metrics;
use crate::resilience::{ReconnectRequest, ResilienceManager, RELAY_CHAT};

type Connection = Framed<TcpStream, IrcCodec>;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// `host:port` of the IRC server.
    pub server: String,
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub channels: Vec<String>,
    /// Keepalive PING period; a connection silent for two periods is dead.
    pub ping_interval: Duration,
    pub register_timeout: Duration,
    pub whois_interval: Duration,
    pub whois_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:6667".into(),
            nick: "lagoon-bridge".into(),
            username: "bridge".into(),
            realname: "Lagoon Bridge".into(),
            channels: Vec::new(),
            ping_interval: Duration::from_secs(30),
            register_timeout: Duration::from_secs(20),
            whois_interval: Duration::from_secs(1),
            whois_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("server closed the connection")]
    Closed,
    #[error("not registered within {0:?}")]
    RegisterTimeout(Duration),
    #[error("no traffic for {0:?}")]
    PingTimeout(Duration),
}

/// Why a connected session ended.
enum SessionEnd {
    /// QUIT sent or the bridge is shutting down.
    Shutdown,
    Failed(RelayError),
}

/// Drive the relay connection until shutdown.
///
/// Returns after a `QUIT` is sent through `outgoing`, or when every
/// sender of `outgoing` is gone.
pub async fn run_relay(
    config: RelayConfig,
    tracker: SharedTracker,
    resilience: Arc<ResilienceManager>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    mut reconnects: mpsc::UnboundedReceiver<ReconnectRequest>,
) {
    resilience.monitor(RELAY_CHAT);
    let mut conn = match connect(&config, &tracker).await {
        Ok(framed) => {
            resilience.record_success(RELAY_CHAT);
            Some(framed)
        }
        Err(e) => {
            resilience.record_failure(RELAY_CHAT, &e);
            None
        }
    };

    // Ticks only matter while disconnected.
    let mut idle = tokio::time::interval(resilience.config().health_check_interval);
    idle.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if let Some(mut framed) = conn.take() {
            match run_session(&mut framed, &config, &tracker, &resilience, &mut outgoing, &mut reconnects)
                .await
            {
                SessionEnd::Shutdown => {
                    info!(server = %config.server, "relay shut down");
                    return;
                }
                SessionEnd::Failed(e) => {
                    warn!(server = %config.server, "relay connection lost: {e}");
                    resilience.record_failure(RELAY_CHAT, &e);
                    idle.reset();
                    continue;
                }
            }
        }

        tokio::select! {
            Some(request) = reconnects.recv() => {
                if request.service != RELAY_CHAT {
                    debug!(service = %request.service, "reconnect request for another service");
                    let _ = request.respond.send(false);
                    continue;
                }
                info!(server = %config.server, attempt = request.attempt, "reconnecting");
                match connect(&config, &tracker).await {
                    Ok(framed) => {
                        resilience.record_success(RELAY_CHAT);
                        let _ = request.respond.send(true);
                        conn = Some(framed);
                    }
                    Err(e) => {
                        warn!(server = %config.server, attempt = request.attempt, "reconnect failed: {e}");
                        resilience.record_failure(RELAY_CHAT, &e);
                        let _ = request.respond.send(false);
                    }
                }
            }

            msg = outgoing.recv() => match msg {
                None => return,
                Some(msg) if msg.command == "QUIT" => return,
                Some(msg) => trace!(command = %msg.command, "relay down, dropping outgoing line"),
            },

            _ = idle.tick() => {
                // Retry once the breaker has timed out.
                if !resilience.is_recovering() && resilience.is_available(RELAY_CHAT) {
                    let manager = Arc::clone(&resilience);
                    tokio::spawn(async move {
                        if let Err(e) = manager.force_recovery(RELAY_CHAT).await {
                            debug!("relay retry: {e}");
                        }
                    });
                }
            }
        }
    }
}

/// Open a connection and complete registration.
async fn connect(config: &RelayConfig, tracker: &SharedTracker) -> Result<Connection, RelayError> {
    tracker.lock().reset();

    let stream = TcpStream::connect(&config.server)
        .await
        .map_err(|source| RelayError::Connect {
            addr: config.server.clone(),
            source,
        })?;
    info!(server = %config.server, "relay: TCP connected");
    let mut framed = Framed::new(stream, IrcCodec);

    let mut nick = config.nick.clone();
    framed.send(Message::new("NICK", vec![nick.clone()])).await?;
    framed
        .send(Message::new(
            "USER",
            vec![
                config.username.clone(),
                "0".into(),
                "*".into(),
                config.realname.clone(),
            ],
        ))
        .await?;

    let deadline = tokio::time::sleep(config.register_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return Err(RelayError::RegisterTimeout(config.register_timeout)),

            frame = framed.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(RelayError::Closed),
                };
                metrics::record_irc_message(&msg.command);

                match msg.command.as_str() {
                    "PING" => {
                        let token = msg.param(0).unwrap_or_default().to_owned();
                        framed.send(Message::new("PONG", vec![token])).await?;
                    }
                    // ERR_NICKNAMEINUSE
                    "433" => {
                        nick.push('_');
                        warn!(nick, "relay: nick in use, retrying with suffix");
                        framed.send(Message::new("NICK", vec![nick.clone()])).await?;
                    }
                    "001" => {
                        tracker.lock().handle_message(&msg);
                        info!(nick = msg.param(0).unwrap_or(&nick), "relay: registered");
                        for channel in &config.channels {
                            framed.send(Message::new("JOIN", vec![channel.clone()])).await?;
                        }
                        return Ok(framed);
                    }
                    _ => {
                        tracker.lock().handle_message(&msg);
                    }
                }
            }
        }
    }
}

async fn run_session(
    framed: &mut Connection,
    config: &RelayConfig,
    tracker: &SharedTracker,
    resilience: &ResilienceManager,
    outgoing: &mut mpsc::UnboundedReceiver<Message>,
    reconnects: &mut mpsc::UnboundedReceiver<ReconnectRequest>,
) -> SessionEnd {
    let mut keepalive = tokio::time::interval(config.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick.
    keepalive.tick().await;
    let mut last_rx = Instant::now();

    loop {
        tokio::select! {
            frame = framed.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => return SessionEnd::Failed(e.into()),
                    None => return SessionEnd::Failed(RelayError::Closed),
                };
                last_rx = Instant::now();
                metrics::record_irc_message(&msg.command);

                match msg.command.as_str() {
                    "PING" => {
                        let token = msg.param(0).unwrap_or_default().to_owned();
                        if let Err(e) = framed.send(Message::new("PONG", vec![token])).await {
                            return SessionEnd::Failed(e.into());
                        }
                    }
                    "PONG" => resilience.record_success(RELAY_CHAT),
                    "ERROR" => {
                        warn!(reason = msg.param(0).unwrap_or(""), "relay: server sent ERROR");
                    }
                    _ => {
                        tracker.lock().handle_message(&msg);
                    }
                }
            }

            msg = outgoing.recv() => {
                let Some(msg) = msg else {
                    let _ = framed.send(Message::new("QUIT", vec!["Bridge shutting down".into()])).await;
                    return SessionEnd::Shutdown;
                };
                let quitting = msg.command == "QUIT";
                if let Err(e) = framed.send(msg).await {
                    return SessionEnd::Failed(e.into());
                }
                if quitting {
                    return SessionEnd::Shutdown;
                }
            }

            Some(request) = reconnects.recv() => {
                // Already connected: report the link as up.
                let _ = request.respond.send(request.service == RELAY_CHAT);
            }

            _ = keepalive.tick() => {
                let silent = last_rx.elapsed();
                if silent > config.ping_interval * 2 {
                    return SessionEnd::Failed(RelayError::PingTimeout(silent));
                }
                let ping = Message::new("PING", vec![config.nick.clone()]);
                if let Err(e) = framed.send(ping).await {
                    return SessionEnd::Failed(e.into());
                }
            }
        }
    }
}
