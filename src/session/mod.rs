//! The per-peer protocol state machine: it reads commands from a [Channel], dispatches them to
//!  handlers and keeps track of the peer's liveness.
//!
//! A read timeout is not fatal. It challenges the peer with a heartbeat request (`PING`), which
//!  a live peer answers with `PONG` - any unit received resets the count of missed heartbeats.
//!  Once the configured number of heartbeats went unanswered, the next timeout closes the session.

pub mod commands;

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::config::ServerConfig;
use crate::error::{is_closed, is_timeout};
use crate::session::commands::CommandRegistry;
use crate::status::{Status, HEARTBEAT_REQUEST, HEARTBEAT_RESPONSE};
use crate::transfer::TransferEngine;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// the session will stop reading commands and close its channel
    Closing,
    Closed,
}

pub struct Session {
    channel: Box<dyn Channel>,
    engine: Arc<Mutex<TransferEngine>>,
    config: Arc<ServerConfig>,
    commands: Arc<CommandRegistry>,
    state: SessionState,
    missed_heartbeats: u32,
}

impl Session {
    pub fn new(channel: Box<dyn Channel>, engine: Arc<Mutex<TransferEngine>>, config: Arc<ServerConfig>) -> Session {
        Self::with_commands(channel, engine, config, Arc::new(CommandRegistry::default()))
    }

    pub fn with_commands(channel: Box<dyn Channel>, engine: Arc<Mutex<TransferEngine>>, config: Arc<ServerConfig>, commands: Arc<CommandRegistry>) -> Session {
        Session {
            channel,
            engine,
            config,
            commands,
            state: SessionState::Connected,
            missed_heartbeats: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn channel(&mut self) -> &mut dyn Channel {
        self.channel.as_mut()
    }

    pub fn engine(&self) -> Arc<Mutex<TransferEngine>> {
        self.engine.clone()
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    /// makes the session stop after the current command
    pub fn close(&mut self) {
        if self.state == SessionState::Connected {
            self.state = SessionState::Closing;
        }
    }

    /// Runs the session until it is closed by a command, by the peer, by an unrecoverable channel
    ///  error or for lack of heartbeats. The channel is closed when this returns.
    pub async fn communicate(&mut self) {
        let peer_addr = self.channel.peer_addr();
        info!("session with {:?} started", peer_addr);

        while self.state == SessionState::Connected {
            if !self.channel.check_channel() {
                debug!("channel to {:?} is no longer usable", peer_addr);
                self.close();
                break;
            }

            match self.channel.read_unit(self.config.read_timeout).await {
                Ok(unit) => {
                    self.missed_heartbeats = 0;
                    if let Err(e) = self.on_unit(&unit).await {
                        error!("session with {:?} failed: {:#}", peer_addr, e);
                        self.close();
                    }
                }
                Err(e) if is_timeout(&e) => {
                    if let Err(e) = self.on_read_timeout().await {
                        error!("session with {:?} failed sending heartbeat: {:#}", peer_addr, e);
                        self.close();
                    }
                }
                Err(e) if is_closed(&e) => {
                    info!("peer {:?} closed the channel", peer_addr);
                    self.close();
                }
                Err(e) => {
                    error!("error reading from {:?}: {:#}", peer_addr, e);
                    self.close();
                }
            }
        }

        self.channel.close().await;
        self.state = SessionState::Closed;
        info!("session with {:?} closed", peer_addr);
    }

    /// Up to `heartbeat_limit` consecutive timeouts are answered with a heartbeat request
    ///  each. The timeout after that closes the session.
    async fn on_read_timeout(&mut self) -> anyhow::Result<()> {
        if self.missed_heartbeats >= self.config.heartbeat_limit {
            warn!("no response from {:?} after {} heartbeats - closing session", self.channel.peer_addr(), self.missed_heartbeats);
            self.close();
            return Ok(());
        }

        self.missed_heartbeats += 1;
        debug!("no data from {:?} - sending heartbeat #{}", self.channel.peer_addr(), self.missed_heartbeats);
        self.channel.write_heartbeat_request().await
    }

    /// handles a single unit received from the peer
    async fn on_unit(&mut self, unit: &str) -> anyhow::Result<()> {
        let line = unit.trim();

        match line {
            HEARTBEAT_REQUEST => return self.channel.write_heartbeat_response().await,
            HEARTBEAT_RESPONSE => return Ok(()),
            "" => {
                debug!("ignoring empty line from {:?}", self.channel.peer_addr());
                return Ok(());
            }
            _ => {}
        }

        let (verb, args) = match line.split_once(char::is_whitespace) {
            Some((verb, args)) => (verb, args.trim()),
            None => (line, ""),
        };

        match self.commands.create(verb, args) {
            Some(command) => {
                debug!("executing {:?} for {:?}", line, self.channel.peer_addr());
                command.execute(self).await
            }
            None => {
                self.channel.write_message(Status::Error, &format!("No such command: {}", verb)).await?;
                self.channel.write_end_message().await
            }
        }
    }
}
