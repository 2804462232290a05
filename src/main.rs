use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use lagoon_bridge::admission::{self, AdmissionController};
use lagoon_bridge::config::BridgeConfig;
use lagoon_bridge::irc::connection::run_relay;
use lagoon_bridge::irc::message::Message;
use lagoon_bridge::irc::tracker::{self, ProtocolTracker, SharedTracker};
use lagoon_bridge::irc::whois::PacedWhoisQueue;
use lagoon_bridge::metrics;
use lagoon_bridge::resilience::{ResilienceManager, PRIMARY_CHAT, RELAY_CHAT};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = BridgeConfig::from_env()?;
    info!(server = %config.relay.server, nick = %config.relay.nick, "lagoon-bridge starting");

    if let Some(addr) = config.metrics_addr {
        metrics::install_exporter(addr)?;
    }

    let (resilience, reconnects) = ResilienceManager::new(config.resilience.clone());
    resilience.monitor(RELAY_CHAT);
    resilience.monitor(PRIMARY_CHAT);
    metrics::spawn_event_listener(resilience.subscribe());
    resilience.spawn_health_monitor();

    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let (whois, _) = PacedWhoisQueue::spawn(
        outgoing_tx.clone(),
        config.relay.whois_interval,
        config.relay.whois_timeout,
    );
    let gc_interval = config.tracker.gc_interval;
    let tracker =
        ProtocolTracker::new(config.tracker.clone(), Arc::new(whois), outgoing_tx.clone())
            .into_shared();
    tracker::spawn_gc(tracker.clone(), gc_interval);
    metrics::spawn_tracker_collector(tracker.clone(), config.resilience.health_check_interval);

    let admission = Arc::new(AdmissionController::new(config.admission.clone()));
    admission::spawn_cleanup(admission.clone());

    // Lines on stdin stand in for the primary network: `sender: text`.
    let primary = tokio::spawn(relay_stdin(
        admission,
        resilience.clone(),
        tracker.clone(),
        config.relay.channels.first().cloned(),
        outgoing_tx.clone(),
    ));

    let quit_tx = outgoing_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, quitting");
            let _ = quit_tx.send(Message::new("QUIT", vec!["Bridge shutting down".into()]));
        }
    });
    drop(outgoing_tx);

    run_relay(config.relay, tracker.clone(), resilience.clone(), outgoing_rx, reconnects).await;
    primary.abort();

    let stats = tracker.lock().stats();
    info!(
        health = %serde_json::to_string(&resilience.health_snapshot())?,
        tracker = %serde_json::to_string(&stats)?,
        "lagoon-bridge stopped"
    );
    Ok(())
}

async fn relay_stdin(
    admission: Arc<AdmissionController>,
    resilience: Arc<ResilienceManager>,
    tracker: SharedTracker,
    channel: Option<String>,
    outgoing: mpsc::UnboundedSender<Message>,
) {
    let Some(channel) = channel else {
        warn!("no IRC channels configured, stdin relay disabled");
        return;
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                resilience.record_failure(PRIMARY_CHAT, &e);
                return;
            }
        };
        resilience.record_success(PRIMARY_CHAT);

        let Some((sender, text)) = line.split_once(':') else {
            continue;
        };
        let (sender, text) = (sender.trim(), text.trim());
        if text.is_empty() {
            continue;
        }
        if let Some(violation) = admission.check_message(sender, sender, text) {
            warn!(sender, "not relayed: {violation}");
            continue;
        }
        if !resilience.is_available(RELAY_CHAT) {
            warn!(sender, "relay unavailable, message dropped");
            continue;
        }
        let joined = {
            let tracker = tracker.lock();
            tracker
                .own_nick()
                .is_some_and(|nick| tracker.is_user_in_channel(nick, &channel))
        };
        if !joined {
            warn!(sender, channel, "not in channel yet, message dropped");
            continue;
        }
        let body = format!("<{sender}> {text}");
        if outgoing.send(Message::new("PRIVMSG", vec![channel.clone(), body])).is_err() {
            return;
        }
    }
}
