//! Request/reply links to the orchestration services.

use std::{io, time::Duration};

use comms::{
    WireReceiver, WireSender,
    msg::{Command, Envelope, MessageHeader, Msg, Payload},
};
use futures::future::BoxFuture;
use log::warn;
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream},
    net::TcpStream,
    sync::mpsc,
};

use crate::{FederationErr, Result};

pub type BoxReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxWriter = Box<dyn AsyncWrite + Unpin + Send>;

const LOCAL_LINK_CAPACITY: usize = 1 << 16;

/// Opens new connections to a peer.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, io::Result<(BoxReader, BoxWriter)>>;
}

/// Connects through TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> BoxFuture<'_, io::Result<(BoxReader, BoxWriter)>> {
        Box::pin(async move {
            let stream = TcpStream::connect(&self.addr).await?;
            stream.set_nodelay(true)?;
            let (rx, tx) = stream.into_split();
            Ok((Box::new(rx) as BoxReader, Box::new(tx) as BoxWriter))
        })
    }
}

/// Connects to an in-process `LocalListener`.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    incoming: mpsc::UnboundedSender<DuplexStream>,
}

/// Accepts the connections opened by its `LocalConnector`s.
#[derive(Debug)]
pub struct LocalListener {
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
}

/// Creates an in-process connector and the listener it connects to.
pub fn local_link() -> (LocalConnector, LocalListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LocalConnector { incoming: tx }, LocalListener { incoming: rx })
}

impl Connector for LocalConnector {
    fn connect(&self) -> BoxFuture<'_, io::Result<(BoxReader, BoxWriter)>> {
        Box::pin(async move {
            let (ours, theirs) = tokio::io::duplex(LOCAL_LINK_CAPACITY);

            if self.incoming.send(theirs).is_err() {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }

            let (rx, tx) = tokio::io::split(ours);
            Ok((Box::new(rx) as BoxReader, Box::new(tx) as BoxWriter))
        })
    }
}

impl LocalListener {
    /// Waits for the next connection.
    ///
    /// # Returns
    /// `None` once every connector was dropped.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.incoming.recv().await
    }
}

/// Who we are and who we expect to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub peer: String,
    pub federation_id: String,
    pub cert_common_name: String,
}

impl Identity {
    /// The header of every request we send.
    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            sender: self.name.clone(),
            receiver: self.peer.clone(),
            federation_id: self.federation_id.clone(),
            cert_common_name: self.cert_common_name.clone(),
        }
    }

    /// Checks that a reply comes from our peer, is meant for us and belongs to our federation.
    pub fn validate(&self, header: &MessageHeader) -> Result<()> {
        check("receiver", &header.receiver, &self.name)?;
        check("sender", &header.sender, &self.peer)?;
        check("federation id", &header.federation_id, &self.federation_id)?;

        if !self.cert_common_name.is_empty() {
            check(
                "common name",
                &header.cert_common_name,
                &self.cert_common_name,
            )?;
        }

        Ok(())
    }
}

fn check(field: &'static str, got: &str, expected: &str) -> Result<()> {
    if got != expected {
        return Err(FederationErr::InvalidHeader {
            field,
            got: got.to_string(),
            expected: expected.to_string(),
        });
    }

    Ok(())
}

/// Describes a message for error reports without dumping its payload.
pub(crate) fn describe(msg: &Msg<'_>) -> String {
    match msg {
        Msg::Control(envelope) => format!("{:?}", envelope.command),
        Msg::Data(Payload::Model(p)) => format!("model payload of {} values", p.len()),
        Msg::Data(Payload::LocalUpdate(p)) => format!("local update of {} values", p.len()),
        Msg::Err(e) => format!("error '{e}'"),
    }
}

/// How a call waits while its peer is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// Reconnection attempts per call, 0 for unlimited.
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 0,
        }
    }
}

type Conn = (WireReceiver<BoxReader>, WireSender<BoxWriter>);

/// A request/reply link, every call sends a command (and maybe a payload) and
/// waits for the peer's answer.
pub struct Link {
    connector: Box<dyn Connector>,
    identity: Identity,
    retry: RetryPolicy,
    atomic: bool,
    conn: Option<Conn>,
    rx_buf: Vec<u32>,
}

impl Link {
    /// Creates a new `Link`, the connection is opened on the first call.
    pub fn new(connector: impl Connector + 'static, identity: Identity) -> Self {
        Self {
            connector: Box::new(connector),
            identity,
            retry: RetryPolicy::default(),
            atomic: false,
            conn: None,
            rx_buf: Vec::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Opens a fresh connection for every call and closes it afterwards.
    pub fn atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Sends `command` followed by `payload` and returns the reply's command.
    pub async fn call(
        &mut self,
        command: Command,
        payload: Option<Payload<'_>>,
    ) -> Result<Command> {
        self.call_inner(&command, payload.as_ref(), false)
            .await
            .map(|(reply, _)| reply)
    }

    /// Like `call`, but the reply is followed by a model payload.
    pub async fn call_for_model(&mut self, command: Command) -> Result<(Command, Vec<f32>)> {
        let (reply, model) = self.call_inner(&command, None, true).await?;
        Ok((reply, model.unwrap_or_default()))
    }

    /// Sends `command` as a farewell and shuts the open connection down.
    ///
    /// Does nothing if no connection is open, as between the calls of an atomic link.
    pub async fn close(&mut self, command: Command) -> Result<()> {
        let Some((_, mut tx)) = self.conn.take() else {
            return Ok(());
        };

        let msg = Msg::Control(Envelope {
            header: self.identity.header(),
            command,
        });
        tx.send(&msg).await?;
        tx.shutdown().await?;
        Ok(())
    }

    async fn call_inner(
        &mut self,
        command: &Command,
        payload: Option<&Payload<'_>>,
        with_model: bool,
    ) -> Result<(Command, Option<Vec<f32>>)> {
        let mut attempts = 0;

        loop {
            let res = self.try_call(command, payload, with_model).await;

            if res.is_err() || self.atomic {
                self.conn = None;
            }

            match res {
                Err(FederationErr::Io(e)) if is_unavailable(&e) => {
                    attempts += 1;

                    if self.retry.max_attempts != 0 && attempts >= self.retry.max_attempts {
                        return Err(e.into());
                    }

                    warn!(
                        peer:% = self.identity.peer,
                        attempt = attempts,
                        error:% = e;
                        "peer unavailable, retrying"
                    );
                    tokio::time::sleep(self.retry.interval).await;
                }
                res => return res,
            }
        }
    }

    async fn try_call(
        &mut self,
        command: &Command,
        payload: Option<&Payload<'_>>,
        with_model: bool,
    ) -> Result<(Command, Option<Vec<f32>>)> {
        if self.conn.is_none() {
            let (rx, tx) = self.connector.connect().await?;
            self.conn = Some(comms::channel(rx, tx));
        }

        let Self {
            identity,
            conn,
            rx_buf,
            ..
        } = self;

        // SAFETY: the connection was just established above.
        let (rx, tx) = conn.as_mut().unwrap();

        let msg = Msg::Control(Envelope {
            header: identity.header(),
            command: command.clone(),
        });
        tx.send(&msg).await?;

        if let Some(payload) = payload {
            let msg = Msg::Data(match payload {
                Payload::Model(p) => Payload::Model(p),
                Payload::LocalUpdate(p) => Payload::LocalUpdate(p),
            });
            tx.send(&msg).await?;
        }

        let reply = match rx.recv_into(rx_buf).await? {
            Msg::Control(envelope) => {
                identity.validate(&envelope.header)?;
                envelope.command
            }
            Msg::Err(e) => return Err(FederationErr::Remote(e.into_owned())),
            other => {
                return Err(FederationErr::UnexpectedMessage {
                    expected: "control message",
                    got: describe(&other),
                });
            }
        };

        if !with_model {
            return Ok((reply, None));
        }

        match rx.recv_into(rx_buf).await? {
            Msg::Data(Payload::Model(params)) => Ok((reply, Some(params.to_vec()))),
            Msg::Err(e) => Err(FederationErr::Remote(e.into_owned())),
            other => Err(FederationErr::UnexpectedMessage {
                expected: "model payload",
                got: describe(&other),
            }),
        }
    }
}

fn is_unavailable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            name: "envoy_1".into(),
            peer: "aggregator".into(),
            federation_id: "fed".into(),
            cert_common_name: String::new(),
        }
    }

    #[test]
    fn replies_must_address_us() {
        let id = identity();
        let reply = id.header().reply();
        assert!(id.validate(&reply).is_ok());

        let mut wrong = reply.clone();
        wrong.receiver = "envoy_2".into();
        assert!(matches!(
            id.validate(&wrong),
            Err(FederationErr::InvalidHeader {
                field: "receiver",
                ..
            })
        ));

        let mut wrong = reply;
        wrong.federation_id = "other".into();
        assert!(id.validate(&wrong).is_err());
    }

    #[test]
    fn common_name_is_checked_when_configured() {
        let mut id = identity();
        id.cert_common_name = "envoy_1.example".into();

        let mut reply = id.header().reply();
        assert!(id.validate(&reply).is_ok());

        reply.cert_common_name = "mallory".into();
        assert!(id.validate(&reply).is_err());
    }

    #[tokio::test]
    async fn refused_connections_are_retried_until_the_limit() {
        let (connector, listener) = local_link();
        drop(listener);

        let mut link = Link::new(connector, identity()).with_retry(RetryPolicy {
            interval: Duration::from_millis(1),
            max_attempts: 3,
        });

        let err = link
            .call(Command::ConnectivityCheck, None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, FederationErr::Io(ref e) if e.kind() == io::ErrorKind::ConnectionRefused)
        );
    }
}
