// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT framing adaptor.
//!
//! The broker connection itself — TLS, socket, MQTT packets — belongs to
//! an external client library. This task owns what sits on either side of
//! it: routing subscribed topics to commands for the certificate
//! machinery, and an outbound queue of JSON payloads for the publisher to
//! drain.
//!
//! One rule is non-negotiable on the subscribe side: the library reuses
//! its receive buffer the moment the callback returns, so every payload
//! is copied into its own allocation before anything is enqueued.

pub mod wire;

use ringbuf::{ringbuf, ringbuf_entry};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use task_certmgr_api::Command;

pub const TOPIC_SUFFIX_PROTECTED_UPDATE: &str = "/commands/protected_update";
pub const TOPIC_SUFFIX_CERTIFICATE: &str = "/commands/certificate";
pub const TOPIC_SUFFIX_CHECK_RESPONSE: &str =
    "/commands/check_certificate_response";
pub const TOPIC_SUFFIX_UPLOAD_RESPONSE: &str =
    "/commands/upload_certificate_response";
pub const TOPIC_SUFFIX_SYNC_RESPONSE: &str =
    "/commands/sync_certificate_response";

pub const TOPIC_CSR: &str = "commands/csr";
pub const TOPIC_REQUEST: &str = "commands/request";
pub const TOPIC_STATUS: &str = "commands/status";
pub const TOPIC_ACK: &str = "commands/ack";
pub const TOPIC_TELEMETRY: &str = "telemetry";

/// Broker ports by authentication scheme, by convention.
pub const MUTUAL_TLS_PORT: u16 = 8883;
pub const TOKEN_TLS_PORT: u16 = 8884;

/// Pending inbound commands; small, the workers drain promptly.
pub const INBOUND_QUEUE_DEPTH: usize = 4;
/// Pending outbound publishes.
pub const OUTBOUND_QUEUE_DEPTH: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Routed(usize),
    Unrouted,
    InboundFull,
    Publish(usize),
    OutboundFull,
}

ringbuf!(Trace, 32, Trace::None);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    /// Element-bound client certificate.
    MutualTls,
    /// Server-side TLS with a bearer token.
    Token,
}

/// Broker endpoint configuration.
#[derive(Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub auth: AuthMethod,
}

impl MqttConfig {
    pub fn mutual_tls(host: &str) -> Self {
        MqttConfig {
            host: host.to_string(),
            port: MUTUAL_TLS_PORT,
            keep_alive_secs: 60,
            clean_session: true,
            auth: AuthMethod::MutualTls,
        }
    }

    pub fn token(host: &str) -> Self {
        MqttConfig {
            port: TOKEN_TLS_PORT,
            auth: AuthMethod::Token,
            ..Self::mutual_tls(host)
        }
    }

    /// Client identifier derived from the factory UID, globally unique by
    /// construction.
    pub fn client_id(uid: &[u8]) -> String {
        use std::fmt::Write as _;
        let mut id = String::from("edge-");
        for b in uid {
            let _ = write!(id, "{b:02x}");
        }
        id
    }
}

struct Route {
    suffix: &'static str,
    build: fn(Vec<u8>) -> Command,
}

/// Exact-suffix table; no wildcard matching anywhere in the router.
static ROUTES: [Route; 5] = [
    Route {
        suffix: TOPIC_SUFFIX_PROTECTED_UPDATE,
        build: Command::ProtectedUpdate,
    },
    Route {
        suffix: TOPIC_SUFFIX_CERTIFICATE,
        build: Command::InstallCertificate,
    },
    Route {
        suffix: TOPIC_SUFFIX_CHECK_RESPONSE,
        build: Command::CheckCertificateResponse,
    },
    Route {
        suffix: TOPIC_SUFFIX_UPLOAD_RESPONSE,
        build: Command::UploadCertificateResponse,
    },
    Route {
        suffix: TOPIC_SUFFIX_SYNC_RESPONSE,
        build: Command::SyncCertificateResponse,
    },
];

/// Map a subscribed topic to a command, copying the payload into an owned
/// allocation.
pub fn route(topic: &str, payload: &[u8]) -> Option<Command> {
    ROUTES
        .iter()
        .find(|r| topic.ends_with(r.suffix))
        .map(|r| (r.build)(payload.to_vec()))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The worker is behind; the caller decides whether to drop or nack.
    Full,
    /// The worker is gone.
    Closed,
}

/// Subscribe-side adaptor: called from the MQTT library's receive
/// callback, owns the copy, enqueues for the worker.
pub struct Subscriber {
    tx: SyncSender<Command>,
}

impl Subscriber {
    pub fn new(tx: SyncSender<Command>) -> Self {
        Subscriber { tx }
    }

    /// Returns `Ok(true)` if the topic was ours and the command was
    /// enqueued, `Ok(false)` if the topic is not routed here.
    pub fn on_message(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<bool, QueueError> {
        // `route` copies the payload; after this line the caller's buffer
        // may be reused freely.
        let Some(cmd) = route(topic, payload) else {
            ringbuf_entry!(Trace::Unrouted);
            return Ok(false);
        };
        ringbuf_entry!(Trace::Routed(payload.len()));

        match self.tx.try_send(cmd) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                ringbuf_entry!(Trace::InboundFull);
                Err(QueueError::Full)
            }
            Err(TrySendError::Disconnected(_)) => Err(QueueError::Closed),
        }
    }
}

/// One outbound publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Where the publisher worker writes: the MQTT client's publish call in
/// production, a capture buffer in tests.
pub trait PublishSink {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), ()>;
}

/// Publish-side adaptor: producers enqueue, the publisher task drains to
/// the sink over TLS.
pub struct Publisher {
    tx: SyncSender<OutboundMessage>,
}

impl Publisher {
    /// A bounded queue and its producer handle.
    pub fn channel() -> (Publisher, Receiver<OutboundMessage>) {
        let (tx, rx) = std::sync::mpsc::sync_channel(OUTBOUND_QUEUE_DEPTH);
        (Publisher { tx }, rx)
    }

    pub fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), QueueError> {
        ringbuf_entry!(Trace::Publish(payload.len()));
        match self.tx.try_send(OutboundMessage {
            topic: topic.to_string(),
            payload,
        }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                ringbuf_entry!(Trace::OutboundFull);
                Err(QueueError::Full)
            }
            Err(TrySendError::Disconnected(_)) => Err(QueueError::Closed),
        }
    }

    /// Queue a certification request for the platform.
    pub fn publish_csr(
        &self,
        uid_hex: &str,
        pem: &str,
    ) -> Result<(), QueueError> {
        self.publish(TOPIC_CSR, wire::csr_body(uid_hex, pem))
    }

    /// Ask the platform whether it holds a certificate for us.
    pub fn publish_check_certificate(
        &self,
        uid_hex: &str,
    ) -> Result<(), QueueError> {
        self.publish(TOPIC_REQUEST, wire::check_certificate_body(uid_hex))
    }

    pub fn publish_status(
        &self,
        uid_hex: &str,
        status: &str,
    ) -> Result<(), QueueError> {
        self.publish(TOPIC_STATUS, wire::status_body(uid_hex, status))
    }

    pub fn publish_ack(
        &self,
        command: &str,
        ok: bool,
    ) -> Result<(), QueueError> {
        self.publish(TOPIC_ACK, wire::ack_body(command, ok))
    }

    pub fn publish_telemetry(
        &self,
        uid_hex: &str,
        sequence: u32,
    ) -> Result<(), QueueError> {
        self.publish(
            TOPIC_TELEMETRY,
            wire::telemetry_body(uid_hex, sequence),
        )
    }
}

/// Publisher task body: drain the queue into the sink until the queue
/// closes.
pub fn run_publisher(
    rx: &Receiver<OutboundMessage>,
    sink: &mut dyn PublishSink,
) {
    while let Ok(msg) = rx.recv() {
        // A sink failure drops the message; the broker session layer owns
        // reconnect and the producers own retry policy.
        let _ = sink.publish(&msg.topic, &msg.payload);
    }
}
