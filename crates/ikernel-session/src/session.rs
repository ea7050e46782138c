//! The session orchestrator.
//!
//! Owns the channel sockets and multiplexes them from one loop:
//! incoming requests are decoded, verified and dispatched, queued
//! outgoing messages are routed to the channel they belong to. Slow
//! work never happens here; execute requests go to the worker thread.

use std::net::SocketAddr;

use bytes::Bytes;
use ikernel_engine::Evaluator;
use ikernel_protocol::{
    Channel, Message, MessageSigner, ProtocolError, PubSocket, RouterSocket, codec, create_signer,
};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Duration;

use crate::display::DisplayFormatter;
use crate::heartbeat::Heartbeat;
use crate::options::SessionOptions;
use crate::worker::{PublishQueue, SessionTask, SessionWorker, TaskQueue};

/// Socket poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Session failure.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The endpoints a session actually bound.
#[derive(Debug, Clone)]
pub struct SessionEndpoints {
    pub control: SocketAddr,
    pub shell: SocketAddr,
    pub iopub: SocketAddr,
    pub heartbeat: SocketAddr,
}

enum Event {
    Frames(Result<Vec<Bytes>, ProtocolError>, Channel),
    Tick,
}

/// A bound kernel session.
pub struct Session {
    signer: Box<dyn MessageSigner>,
    control: RouterSocket,
    shell: RouterSocket,
    iopub: PubSocket,
    heartbeat: Heartbeat,
    publish: PublishQueue,
    tasks: TaskQueue,
    worker: SessionWorker,
    endpoints: SessionEndpoints,
    shutdown: bool,
}

impl Session {
    /// Bind every channel and spawn the worker and heartbeat.
    ///
    /// # Errors
    /// Returns an error if the signing scheme is unsupported, an
    /// endpoint cannot be bound, or the worker thread cannot start.
    pub async fn bind(
        options: &SessionOptions,
        evaluator: Box<dyn Evaluator>,
        formatter: Box<dyn DisplayFormatter>,
    ) -> Result<Self, SessionError> {
        let signer = create_signer(&options.signature_scheme, &options.key)?;

        let control = RouterSocket::bind(&options.endpoint(options.control_port)).await?;
        let shell = RouterSocket::bind(&options.endpoint(options.shell_port)).await?;
        let iopub = PubSocket::bind(&options.endpoint(options.iopub_port)).await?;
        let heartbeat = Heartbeat::bind(&options.endpoint(options.hb_port)).await?;

        let endpoints = SessionEndpoints {
            control: control.local_addr()?,
            shell: shell.local_addr()?,
            iopub: iopub.local_addr()?,
            heartbeat: heartbeat.local_addr(),
        };

        let publish = PublishQueue::new();
        let tasks = TaskQueue::new();
        let worker = SessionWorker::spawn(evaluator, formatter, publish.clone(), tasks.clone())?;

        tracing::info!(
            control = %endpoints.control,
            shell = %endpoints.shell,
            iopub = %endpoints.iopub,
            heartbeat = %endpoints.heartbeat,
            "session bound"
        );

        Ok(Self {
            signer,
            control,
            shell,
            iopub,
            heartbeat,
            publish,
            tasks,
            worker,
            endpoints,
            shutdown: false,
        })
    }

    /// The endpoints this session bound.
    #[must_use]
    pub fn endpoints(&self) -> &SessionEndpoints {
        &self.endpoints
    }

    /// Drive the session until a shutdown request arrives.
    ///
    /// # Errors
    /// Returns an error for unrecoverable socket failures.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        self.publish.push(Message::kernel_status(false));
        self.flush_outgoing().await;

        while !self.shutdown {
            let event = tokio::select! {
                frames = self.control.recv_frames() => Event::Frames(frames, Channel::Control),
                frames = self.shell.recv_frames() => Event::Frames(frames, Channel::Shell),
                () = tokio::time::sleep(POLL_INTERVAL) => Event::Tick,
            };
            match event {
                Event::Frames(frames, channel) => self.handle_frames(frames, channel),
                Event::Tick => {}
            }
            self.flush_outgoing().await;
        }

        tracing::info!("session shutting down");
        self.worker.stop();
        self.flush_outgoing().await;
        self.heartbeat.shutdown();
        Ok(())
    }

    fn handle_frames(&mut self, frames: Result<Vec<Bytes>, ProtocolError>, channel: Channel) {
        let frames = match frames {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!("receive failed on {channel:?}: {e}");
                return;
            }
        };
        // Undecodable and unverifiable messages are dropped, never
        // answered.
        match codec::decode_message(&frames, self.signer.as_ref()) {
            Ok(message) => self.dispatch(message.associate_channel(channel)),
            Err(e) => tracing::warn!("dropping message on {channel:?}: {e}"),
        }
    }

    fn dispatch(&mut self, message: Message) {
        let channel = message.channel().unwrap_or(Channel::Shell);
        match message.msg_type() {
            "execute_request" => {
                let content = &message.content;
                let code = content
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_owned();
                let silent = content
                    .get("silent")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let store_history = content
                    .get("store_history")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let record = store_history && !silent;
                tracing::debug!(silent, record, "queueing execute request");
                self.tasks.push(SessionTask {
                    request: message,
                    code,
                    silent,
                    record,
                });
            }
            "kernel_info_request" => {
                self.publish
                    .push(Message::kernel_info_reply(&message).associate_channel(channel));
            }
            "shutdown_request" => {
                let restart = message
                    .content
                    .get("restart")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.publish
                    .push(Message::shutdown_reply(&message, restart).associate_channel(channel));
                self.shutdown = true;
            }
            other => tracing::warn!("ignoring unhandled message type '{other}'"),
        }
    }

    async fn flush_outgoing(&mut self) {
        for message in self.publish.drain() {
            let frames = codec::encode_message(&message, self.signer.as_ref());
            let result = match message.channel() {
                Some(Channel::Control) => self.control.send_frames(&frames).await,
                Some(Channel::Shell) => self.shell.send_frames(&frames).await,
                _ => {
                    self.iopub.broadcast(&frames).await;
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::warn!("dropping undeliverable {} message: {e}", message.msg_type());
            }
        }
    }
}
