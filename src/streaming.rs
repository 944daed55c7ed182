//! Start/stop sequencing for the acquisition stream.
//!
//! ```text
//! start:  subscribe(TX) → write(RX, start cmd) → Streaming
//!                              └─ fails → unsubscribe(TX), stay Connected
//! stop:   write(RX, 0x00) → unsubscribe(TX) → Connected
//!           └─ failure logged, the unsubscribe still runs
//! ```
//!
//! The frame handler is the pump in [`crate::client`]; it decodes only while
//! the state is `Streaming`, so entering and leaving that state is what
//! installs and removes it.

use log::{info, warn};

use crate::client::{BitalinoClient, InFlightGuard, Op};
use crate::error::{BitalinoError, Result};
use crate::protocol::{encode_start_command, encode_stop_command};
use crate::transport::Transport;
use crate::types::{BitalinoEvent, ConnectionState, StreamConfig};

/// Result of [`BitalinoClient::stop_streaming`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The stream was running and has been stopped.
    Stopped,
    /// Nothing to stop; state is unchanged.
    NotStreaming,
}

impl<T: Transport> BitalinoClient<T> {
    /// Begin acquisition with `config`. Valid only from `Connected`.
    pub async fn start_streaming(&self, config: StreamConfig) -> Result<()> {
        config.validate()?;
        let command = encode_start_command(&config)?;

        let (epoch, write, notify, _guard) = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                ConnectionState::Connected => {}
                ConnectionState::Streaming => return Err(BitalinoError::AlreadyStreaming),
                other => return Err(BitalinoError::NotConnected(other)),
            }
            if inner.in_flight.start {
                return Err(BitalinoError::OperationInProgress("start_streaming"));
            }
            if inner.in_flight.disconnect {
                return Err(BitalinoError::OperationInProgress("disconnect"));
            }
            let Some(session) = inner.session.as_ref() else {
                return Err(BitalinoError::NotConnected(inner.state));
            };
            let (write, notify) = (session.write.clone(), session.notify.clone());
            let guard = InFlightGuard::arm(&self.shared, &mut inner, Op::Start);
            (inner.epoch, write, notify, guard)
        };

        if let Err(e) = self.transport.subscribe(&notify).await {
            self.ensure_epoch(epoch, "start_streaming")?;
            return Err(BitalinoError::SubscribeFailed(e.to_string()));
        }
        self.ensure_epoch(epoch, "start_streaming")?;

        if let Err(e) = self.transport.write(&write, &command).await {
            self.ensure_epoch(epoch, "start_streaming")?;
            if let Err(ue) = self.transport.unsubscribe(&notify).await {
                warn!("unsubscribe after failed start failed: {ue}");
            }
            return Err(BitalinoError::WriteFailed(e.to_string()));
        }

        // Frames queued before the start command belong to no stream.
        self.flush_backlog().await;

        {
            let mut inner = self.shared.inner.lock();
            if inner.epoch != epoch {
                return Err(BitalinoError::Disconnected("start_streaming"));
            }
            inner.state = ConnectionState::Streaming;
            inner.last_sample = None;
            self.shared.publish(&inner);
            self.shared
                .surface
                .emit(BitalinoEvent::StreamingStarted(config.clone()));
        }
        info!(
            "Streaming started: {} Hz, channels {:?}",
            config.sample_rate_hz, config.channels
        );
        Ok(())
    }

    /// Stop acquisition and return to `Connected`.
    ///
    /// Returns [`StopOutcome::NotStreaming`] when there is nothing to stop.
    /// A failed stop-command write is logged and the unsubscribe still
    /// happens; an unsubscribe failure is reported after the state has
    /// already left `Streaming`.
    pub async fn stop_streaming(&self) -> Result<StopOutcome> {
        let (epoch, write, notify, _guard) = {
            let mut inner = self.shared.inner.lock();
            if inner.state != ConnectionState::Streaming {
                return Ok(StopOutcome::NotStreaming);
            }
            if inner.in_flight.stop {
                return Err(BitalinoError::OperationInProgress("stop_streaming"));
            }
            let Some(session) = inner.session.as_ref() else {
                return Ok(StopOutcome::NotStreaming);
            };
            let (write, notify) = (session.write.clone(), session.notify.clone());
            let guard = InFlightGuard::arm(&self.shared, &mut inner, Op::Stop);
            (inner.epoch, write, notify, guard)
        };

        if let Err(e) = self.transport.write(&write, &encode_stop_command()).await {
            warn!("stop command write failed, releasing subscription anyway: {e}");
        }
        let unsubscribed = self.transport.unsubscribe(&notify).await;

        {
            let mut inner = self.shared.inner.lock();
            if inner.epoch != epoch {
                return Err(BitalinoError::Disconnected("stop_streaming"));
            }
            inner.state = ConnectionState::Connected;
            self.shared.publish(&inner);
            self.shared.surface.emit(BitalinoEvent::StreamingStopped);
        }
        info!("Streaming stopped");

        unsubscribed.map_err(|e| BitalinoError::UnsubscribeFailed(e.to_string()))?;
        Ok(StopOutcome::Stopped)
    }
}
