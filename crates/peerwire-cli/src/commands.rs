//! Command handlers for the peerwire CLI

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use peerwire_ble::{BleCentral, BleManager};
use peerwire_core::events::{connection_event_channel, server_event_channel};
use peerwire_core::{BincodeCodec, Codec, ConnectionEvent, JsonCodec, SendReport, ServerEvent};
use peerwire_tcp::{TcpConnection, TcpServer};

use crate::cli::Commands;
use crate::config::{AppConfig, CodecKind};
use crate::error::{CliError, Result};

/// Type code of [`ChatText`] envelopes
pub const CHAT_TEXT_TYPE: u8 = 1;

/// The one application message the CLI knows how to send and print
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatText {
    pub from: String,
    pub body: String,
}

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command with the configured codec
    pub async fn execute(command: Commands, config: AppConfig) -> Result<()> {
        info!("Using {} payload codec", config.codec);
        match config.codec {
            CodecKind::Bincode => Self::run(command, config, BincodeCodec).await,
            CodecKind::Json => Self::run(command, config, JsonCodec).await,
        }
    }

    async fn run<C: Codec>(command: Commands, config: AppConfig, codec: C) -> Result<()> {
        match command {
            Commands::Serve { .. } => Self::handle_serve(config, codec).await,
            Commands::Send { addr, message } => {
                Self::handle_send(config, codec, addr, message).await
            }
            Commands::BleScan => Self::handle_ble_scan(config).await,
            Commands::BleSend { to, message } => {
                Self::handle_ble_send(config, codec, to, message).await
            }
        }
    }

    /// Run a TCP server until interrupted, printing chat traffic
    async fn handle_serve<C: Codec>(config: AppConfig, codec: C) -> Result<()> {
        let (events, mut rx) = server_event_channel();
        let server = TcpServer::with_codec(config.tcp.clone(), codec, events);
        let addr = server.start().await?;
        println!("{} listening on {}", config.name, addr);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Interrupted, shutting down");
                    break;
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if let Some(line) = render_event(server.codec(), &event) {
                        println!("{}", line);
                    }
                    if matches!(event, ServerEvent::Stopped { .. }) {
                        break;
                    }
                }
            }
        }

        server.stop().await;
        Ok(())
    }

    /// Connect, identify, send one chat message and close
    async fn handle_send<C: Codec>(
        config: AppConfig,
        codec: C,
        addr: String,
        message: String,
    ) -> Result<()> {
        let (events, mut rx) = connection_event_channel();
        let conn =
            TcpConnection::connect(addr.as_str(), &config.name, &codec, &config.tcp, events).await?;
        conn.start().await?;

        let text = ChatText {
            from: config.name.clone(),
            body: message,
        };
        let sent = conn.send_value(&codec, CHAT_TEXT_TYPE, &text).await;
        conn.stop();
        while let Some(event) = rx.recv().await {
            if let ConnectionEvent::Stopped { error, .. } = event {
                if let Some(e) = error {
                    debug!("Connection stopped with {}", e);
                }
                break;
            }
        }

        let bytes = sent?;
        println!("sent {} bytes to {}", bytes, conn.peer_addr());
        Ok(())
    }

    /// List peerwire peripherals in range
    async fn handle_ble_scan(config: AppConfig) -> Result<()> {
        let (links, _unused) = mpsc::unbounded_channel();
        let central = BleCentral::new(config.ble.clone(), links).await?;
        let devices = central.scan().await?;
        if devices.is_empty() {
            println!("no peerwire devices found");
        }
        for device in devices {
            println!(
                "{}\t{}\t{}",
                device.logical_name.as_deref().unwrap_or("-"),
                device.device_name,
                device.address
            );
        }
        Ok(())
    }

    /// Find a peer by its advertised name and send it one chat message
    async fn handle_ble_send<C: Codec>(
        config: AppConfig,
        codec: C,
        to: String,
        message: String,
    ) -> Result<()> {
        let (events, _events) = server_event_channel();
        let manager = BleManager::with_codec(config.ble.clone(), codec, events)?;
        manager.start()?;

        let outcome: Result<usize> = async {
            let mut central = BleCentral::new(config.ble.clone(), manager.link_sender()).await?;
            central.watch_disconnects().await?;
            let device = central
                .scan()
                .await?
                .into_iter()
                .find(|d| d.logical_name.as_deref() == Some(to.as_str()))
                .ok_or_else(|| CliError::DeviceNotFound(to.clone()))?;

            let link = central.connect(&device).await?;
            manager.connect(link, Some(to.as_str()), &config.name).await?;

            let text = ChatText {
                from: config.name.clone(),
                body: message,
            };
            let report = manager
                .send_value(CHAT_TEXT_TYPE, &text, &[to.as_str()])
                .await?;
            check_report(&report)
        }
        .await;

        manager.stop().await;
        let bytes = outcome?;
        println!("sent {} bytes to {}", bytes, to);
        Ok(())
    }
}

/// Printable line for the server events a user cares about
pub fn render_event<C: Codec>(codec: &C, event: &ServerEvent) -> Option<String> {
    match event {
        ServerEvent::Identified { identity, .. } => Some(format!("* {} joined", identity.label())),
        ServerEvent::Disconnected {
            identity, error, ..
        } => Some(match error {
            Some(e) => format!("* {} left ({})", identity.label(), e),
            None => format!("* {} left", identity.label()),
        }),
        ServerEvent::Received { from, envelope, .. } if envelope.type_code == CHAT_TEXT_TYPE => {
            match envelope.to_object_tagged::<_, ChatText>(codec, CHAT_TEXT_TYPE) {
                Ok(text) => Some(format!("[{}] {}", text.from, text.body)),
                Err(e) => {
                    warn!("Undecodable chat message from {}: {}", from.label(), e);
                    None
                }
            }
        }
        ServerEvent::Received { from, envelope, .. } => {
            debug!(
                "Ignoring type {} envelope from {}",
                envelope.type_code,
                from.label()
            );
            None
        }
        _ => None,
    }
}

/// Total bytes delivered, or the first failure
pub fn check_report(report: &SendReport) -> Result<usize> {
    if let Some(failed) = report.failed().next() {
        let reason = match &failed.result {
            Err(e) => e.to_string(),
            Ok(_) => "unknown".to_string(),
        };
        return Err(CliError::Delivery(format!("{}: {}", failed.target, reason)));
    }
    if report.is_empty() {
        return Err(CliError::Delivery("no peers matched".to_string()));
    }
    Ok(report
        .outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().ok())
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerwire_core::{
        ConnectionId, Envelope, PeerIdentity, PeerwireError, SendOutcome, TransportAddress,
    };
    use std::sync::Arc;

    fn alice() -> PeerIdentity {
        PeerIdentity::named("alice", TransportAddress::Ble("aa:bb".to_string()))
    }

    #[test]
    fn chat_text_renders_with_sender() {
        let codec = JsonCodec;
        let text = ChatText {
            from: "alice".to_string(),
            body: "tea is ready".to_string(),
        };
        let event = ServerEvent::Received {
            id: ConnectionId::next(),
            from: alice(),
            envelope: Envelope::from_value(&codec, CHAT_TEXT_TYPE, &text).unwrap(),
        };
        assert_eq!(
            render_event(&codec, &event).as_deref(),
            Some("[alice] tea is ready")
        );
    }

    #[test]
    fn other_types_and_garbage_are_not_printed() {
        let codec = BincodeCodec;
        let other = ServerEvent::Received {
            id: ConnectionId::next(),
            from: alice(),
            envelope: Envelope::new(7, vec![1, 2, 3]).unwrap(),
        };
        assert!(render_event(&codec, &other).is_none());

        let garbage = ServerEvent::Received {
            id: ConnectionId::next(),
            from: alice(),
            envelope: Envelope::new(CHAT_TEXT_TYPE, vec![0xFF]).unwrap(),
        };
        assert!(render_event(&codec, &garbage).is_none());
    }

    #[test]
    fn membership_changes_are_printed() {
        let codec = BincodeCodec;
        let joined = ServerEvent::Identified {
            id: ConnectionId::next(),
            identity: alice(),
        };
        assert_eq!(render_event(&codec, &joined).as_deref(), Some("* alice joined"));

        let left = ServerEvent::Disconnected {
            id: ConnectionId::next(),
            identity: alice(),
            error: Some(Arc::new(PeerwireError::busy("alice"))),
        };
        let line = render_event(&codec, &left).unwrap();
        assert!(line.starts_with("* alice left ("));
    }

    #[test]
    fn report_failure_names_the_target() {
        let mut report = SendReport::default();
        report.push(SendOutcome {
            target: "phone".to_string(),
            id: None,
            result: Err(PeerwireError::peer_not_found("phone")),
        });
        let err = check_report(&report).unwrap_err();
        assert!(matches!(err, CliError::Delivery(ref msg) if msg.starts_with("phone:")));

        assert!(check_report(&SendReport::default()).is_err());

        let mut report = SendReport::default();
        report.push(SendOutcome {
            target: "phone".to_string(),
            id: Some(ConnectionId::next()),
            result: Ok(42),
        });
        assert_eq!(check_report(&report).unwrap(), 42);
    }
}
