#![warn(clippy::pedantic)]

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use gethostname::gethostname;
use log::{info, warn};
use zeromq::prelude::*;
use zeromq::ZmqMessage;

use crate::controller::{Controller, SharedController};
use crate::error::ServerError;
use crate::scheduler::StopFlag;

macro_rules! to_bytes {
    ($collection:expr) => {
        $collection.iter().flat_map(|x| x.to_le_bytes())
    };
}

/// Request/reply transport of the command server. Exactly one reply must follow each request.
#[async_trait]
pub trait ReplyChannel: Send {
    /// Wait at most `wait` for the next request; `Ok(None)` if none arrived.
    async fn recv_request(&mut self, wait: Duration) -> Result<Option<String>, ServerError>;
    async fn send_reply(&mut self, reply: String) -> Result<(), ServerError>;
}

pub struct ZmqReplyChannel {
    sock: zeromq::RepSocket,
    endpoint: String,
}

impl ZmqReplyChannel {
    /// # Errors
    /// Propagates any zeromq error while binding.
    pub async fn bind(endpoint: &str) -> Result<Self, ServerError> {
        let mut sock = zeromq::RepSocket::new();
        let endpoint = sock.bind(endpoint).await?.to_string();
        info!("command socket bound on {endpoint}");
        Ok(ZmqReplyChannel { sock, endpoint })
    }

    /// The endpoint actually bound, with any wildcard port resolved.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ReplyChannel for ZmqReplyChannel {
    async fn recv_request(&mut self, wait: Duration) -> Result<Option<String>, ServerError> {
        match async_std::future::timeout(wait, self.sock.recv()).await {
            Err(_) => Ok(None),
            Ok(msg) => {
                let msg = msg?;
                Ok(Some(
                    msg.get(0)
                        .map(|frame| String::from_utf8_lossy(frame).into_owned())
                        .unwrap_or_default(),
                ))
            }
        }
    }

    async fn send_reply(&mut self, reply: String) -> Result<(), ServerError> {
        self.sock.send(reply.into()).await?;
        Ok(())
    }
}

/// Receives requests, runs them against the shared controller and sends the reply, strictly
/// alternating.
pub struct CommandServer<C: ReplyChannel> {
    channel: C,
    shared: SharedController,
    stop: StopFlag,
    poll_interval: Duration,
    awaiting_reply: bool,
}

impl<C: ReplyChannel> CommandServer<C> {
    #[must_use]
    pub fn new(channel: C, shared: SharedController, stop: StopFlag) -> Self {
        CommandServer {
            channel,
            shared,
            stop,
            poll_interval: Duration::from_millis(200),
            awaiting_reply: false,
        }
    }

    /// How long a receive waits before the stop flag is looked at again.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Handle at most one request. Returns the request handled, if any.
    ///
    /// # Errors
    /// [`ServerError::OutOfTurn`] if the reply to an earlier request never went out, otherwise
    /// whatever the transport reports.
    pub async fn exchange(&mut self) -> Result<Option<String>, ServerError> {
        if self.awaiting_reply {
            return Err(ServerError::OutOfTurn);
        }
        let Some(request) = self.channel.recv_request(self.poll_interval).await? else {
            return Ok(None);
        };
        self.awaiting_reply = true;
        let reply = self.shared.lock().await.process_command(&request);
        info!("handled request <{request}>, replied <{reply}>");
        self.reply(reply).await?;
        Ok(Some(request))
    }

    async fn reply(&mut self, reply: String) -> Result<(), ServerError> {
        if !self.awaiting_reply {
            return Err(ServerError::NoPendingRequest);
        }
        self.channel.send_reply(reply).await?;
        self.awaiting_reply = false;
        Ok(())
    }

    /// Serve until the stop flag is raised.
    ///
    /// # Errors
    /// Stops at the first failed exchange.
    pub async fn serve(mut self) -> Result<(), ServerError> {
        while !self.stop.load(Ordering::Relaxed) {
            self.exchange().await?;
        }
        info!("command server stopped");
        Ok(())
    }
}

/// Frames of one telemetry message: hostname, tick, uptime seconds, status code, signal,
/// threshold, target, offsets, set-points, outputs, signal history, then the two offset
/// histories. Numbers are little-endian, floats as `f64`.
#[must_use]
pub fn telemetry_frames(hostname: &str, ctrl: &Controller, now: Instant) -> Vec<Bytes> {
    let snap = ctrl.snapshot(now);
    vec![
        Bytes::copy_from_slice(hostname.as_bytes()),
        Bytes::copy_from_slice(&snap.tick.to_le_bytes()),
        Bytes::copy_from_slice(&snap.uptime.as_secs().to_le_bytes()),
        Bytes::copy_from_slice(&[snap.status.code()]),
        Bytes::copy_from_slice(&snap.signal.to_le_bytes()),
        Bytes::copy_from_slice(&snap.threshold.to_le_bytes()),
        Bytes::copy_from_slice(&snap.target.to_le_bytes()),
        to_bytes!(snap.offsets).collect(),
        to_bytes!(snap.set_points).collect(),
        to_bytes!(snap.outputs).collect(),
        ctrl.signal_log.le_bytes().collect(),
        ctrl.offset_logs[0].le_bytes().collect(),
        ctrl.offset_logs[1].le_bytes().collect(),
    ]
}

/// PUB socket sending a [`telemetry_frames`] message every `2^k` ticks.
pub struct Telemetry {
    hostname: String,
    sock: zeromq::PubSocket,
    endpoint: String,
    publish_frequency_exponent: u8,
}

impl Telemetry {
    /// # Errors
    /// Propagates any zeromq error while binding.
    pub async fn bind(endpoint: &str, publish_every: u32) -> Result<Self, ServerError> {
        let mut sock = zeromq::PubSocket::new();
        let endpoint = sock.bind(endpoint).await?.to_string();
        info!("telemetry socket bound on {endpoint}");
        let mut telemetry = Telemetry {
            hostname: gethostname().to_string_lossy().into_owned(),
            sock,
            endpoint,
            publish_frequency_exponent: 0,
        };
        telemetry.set_publish_frequency(publish_every);
        Ok(telemetry)
    }

    pub fn set_publish_frequency(&mut self, num_cycles: u32) {
        // round `num_cycles` down to the nearest power of 2
        #[allow(clippy::cast_possible_truncation)]
        let exponent = num_cycles.checked_ilog2().unwrap_or(0) as u8;
        self.publish_frequency_exponent = exponent;
    }

    /// The endpoint actually bound, with any wildcard port resolved.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[inline]
    #[must_use]
    pub fn should_publish(&self, tick: u64) -> bool {
        should_publish(self.publish_frequency_exponent, tick)
    }

    #[must_use]
    pub fn frames(&self, ctrl: &Controller, now: Instant) -> Vec<Bytes> {
        telemetry_frames(&self.hostname, ctrl, now)
    }

    /// # Errors
    /// Propagates any zeromq error in the send.
    pub async fn publish(&mut self, frames: Vec<Bytes>) -> Result<(), ServerError> {
        let mut frames = frames.into_iter();
        let Some(first) = frames.next() else {
            warn!("refusing to publish an empty telemetry message");
            return Ok(());
        };
        let mut msg = ZmqMessage::from(first);
        for frame in frames {
            msg.push_back(frame);
        }
        self.sock.send(msg).await?;
        Ok(())
    }
}

#[inline]
fn should_publish(exponent: u8, tick: u64) -> bool {
    (tick & ((1 << exponent) - 1)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerSettings;
    use async_std::sync::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    /// Plays back canned requests and records the replies. Raises `stop` once it runs dry.
    struct ScriptedChannel {
        requests: VecDeque<String>,
        replies: Arc<std::sync::Mutex<Vec<String>>>,
        stop: StopFlag,
        fail_send: bool,
    }

    #[async_trait]
    impl ReplyChannel for ScriptedChannel {
        async fn recv_request(&mut self, _wait: Duration) -> Result<Option<String>, ServerError> {
            let next = self.requests.pop_front();
            if next.is_none() {
                self.stop.store(true, Ordering::Relaxed);
            }
            Ok(next)
        }

        async fn send_reply(&mut self, reply: String) -> Result<(), ServerError> {
            if self.fail_send {
                return Err(ServerError::Zmq(zeromq::ZmqError::Network(
                    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone"),
                )));
            }
            self.replies.lock().unwrap().push(reply);
            Ok(())
        }
    }

    fn shared() -> SharedController {
        Arc::new(Mutex::new(
            Controller::new(ControllerSettings::default()).expect("should allocate"),
        ))
    }

    fn scripted(
        requests: &[&str],
        fail_send: bool,
    ) -> (ScriptedChannel, Arc<std::sync::Mutex<Vec<String>>>, StopFlag) {
        let replies = Arc::new(std::sync::Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let channel = ScriptedChannel {
            requests: requests.iter().map(ToString::to_string).collect(),
            replies: Arc::clone(&replies),
            stop: Arc::clone(&stop),
            fail_send,
        };
        (channel, replies, stop)
    }

    #[async_std::test]
    async fn serves_until_stopped() {
        let (channel, replies, stop) = scripted(
            &["banana", "SetVolt3 4.2", "ShiftVolt7 Up", "Please Lock"],
            false,
        );
        let ctrl = shared();
        CommandServer::new(channel, Arc::clone(&ctrl), stop)
            .serve()
            .await
            .unwrap();
        assert_eq!(
            *replies.lock().unwrap(),
            [
                "Speak Properly",
                "SetVolt3 4.2",
                "ShiftVolt7 Undefined",
                "Lock Nonexistent"
            ]
        );
        assert_eq!(ctrl.lock().await.channel(3).unwrap().set_point(), 4.2);
    }

    #[async_std::test]
    async fn failed_reply_leaves_server_out_of_turn() {
        let (channel, _replies, stop) = scripted(&["Check Lock", "Check Lock"], true);
        let mut server = CommandServer::new(channel, shared(), stop);
        assert!(matches!(server.exchange().await, Err(ServerError::Zmq(_))));
        assert!(matches!(server.exchange().await, Err(ServerError::OutOfTurn)));
        assert!(matches!(
            server.serve().await,
            Err(ServerError::OutOfTurn)
        ));
    }

    #[async_std::test]
    async fn reply_without_request_is_refused() {
        let (channel, replies, stop) = scripted(&[], false);
        let mut server = CommandServer::new(channel, shared(), stop);
        assert!(matches!(
            server.reply("Okay Boss".to_string()).await,
            Err(ServerError::NoPendingRequest)
        ));
        assert_eq!(server.exchange().await.unwrap(), None);
        assert!(replies.lock().unwrap().is_empty());
    }

    #[async_std::test]
    async fn zmq_round_trip() {
        let (_, _, stop) = scripted(&[], false);
        let channel = ZmqReplyChannel::bind("tcp://127.0.0.1:0").await.unwrap();
        let endpoint = channel.endpoint().to_string();
        let mut server = CommandServer::new(channel, shared(), stop)
            .with_poll_interval(Duration::from_secs(5));

        let mut client = zeromq::ReqSocket::new();
        client.connect(&endpoint).await.unwrap();
        let (handled, reply) = futures::join!(server.exchange(), async {
            client.send("CheckVolt 9".into()).await.unwrap();
            client.recv().await.unwrap()
        });
        assert_eq!(handled.unwrap().as_deref(), Some("CheckVolt 9"));
        assert_eq!(reply.get(0).unwrap().as_ref(), b"Volt9 Undefined");
    }

    #[test]
    fn frame_layout() {
        let mut ctrl = Controller::new(ControllerSettings {
            log_length_exponent: 3,
            averaging: 1,
            ..Default::default()
        })
        .unwrap();
        ctrl.set_voltage(2, 0.05);
        ctrl.observe(12.0);
        ctrl.tick(Instant::now());

        let frames = telemetry_frames("lab-pc", &ctrl, Instant::now());
        assert_eq!(frames.len(), 13);
        assert_eq!(frames[0].as_ref(), b"lab-pc");
        assert_eq!(frames[1].as_ref(), 1u64.to_le_bytes());
        assert_eq!(frames[3].as_ref(), [0]);
        assert_eq!(frames[4].as_ref(), 12.0f64.to_le_bytes());
        assert_eq!(frames[7].len(), 16);
        assert_eq!(frames[8].len(), 48);
        assert_eq!(frames[9][8..16], 0.05f64.to_le_bytes());
        for frame in &frames[10..] {
            assert_eq!(frame.len(), 8 * 8);
        }
        assert_eq!(frames[10][56..], 12.0f64.to_le_bytes());
    }

    #[test]
    fn publish_cadence() {
        assert!((0..10).all(|t| should_publish(0, t)));
        let published: Vec<u64> = (1..=20).filter(|t| should_publish(3, *t)).collect();
        assert_eq!(published, [8, 16]);
    }
}
