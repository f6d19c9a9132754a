use std::{borrow::Cow, io};

use crate::{
    Deserialize, Serialize,
    specs::{
        experiment::{ExperimentSpec, Metrics, RoundTask},
        federation::{EnvoyInfo, ExperimentStatus, ModelKind},
    },
};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR: Header = 0;
const CONTROL: Header = 1;
const MODEL: Header = 2;
const LOCAL_UPDATE: Header = 3;

/// Identifies both ends of an exchange and the federation it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MessageHeader {
    pub sender: String,
    pub receiver: String,
    pub federation_id: String,
    #[serde(default)]
    pub cert_common_name: String,
}

impl MessageHeader {
    /// Builds the header of the answer to a message carrying `self`.
    pub fn reply(&self) -> Self {
        Self {
            sender: self.receiver.clone(),
            receiver: self.sender.clone(),
            federation_id: self.federation_id.clone(),
            cert_common_name: self.cert_common_name.clone(),
        }
    }
}

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug, PartialEq)]
pub enum Payload<'a> {
    /// Model parameters handed out by the orchestrator.
    Model(&'a [f32]),
    /// Model parameters produced by a collaborator's training task.
    LocalUpdate(&'a [f32]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    ConnectivityCheck,
    Ack,
    GetShardRegistry,
    ShardRegistry {
        envoys: Vec<EnvoyInfo>,
    },
    /// Followed by a `Model` payload with the initial parameters.
    SetNewExperiment {
        spec: ExperimentSpec,
    },
    GetExperimentStatus {
        name: String,
    },
    ExperimentStatus {
        status: ExperimentStatus,
    },
    GetTrainedModel {
        name: String,
        kind: ModelKind,
    },
    /// Followed by a `Model` payload.
    TrainedModel {
        round: usize,
    },
    GetTasks,
    Tasks {
        round: usize,
        tasks: Vec<RoundTask>,
        sleep_ms: u64,
        quit: bool,
    },
    GetAggregatedModel {
        round: usize,
    },
    /// Followed by a `Model` payload.
    AggregatedModel {
        round: usize,
    },
    /// Followed by a `LocalUpdate` payload when `has_model` is set.
    TaskResults {
        round: usize,
        task: RoundTask,
        data_size: usize,
        metrics: Metrics,
        has_model: bool,
    },
    /// Lets `name` take part from the current round on, answered with `Ack`.
    AddCollaborator {
        name: String,
    },
    /// Stops waiting for `name`, answered with `Ack`.
    RemoveCollaborator {
        name: String,
    },
    /// Sent right before closing a link, never answered.
    Disconnect,
}

/// A command together with the header identifying its ends.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    pub header: MessageHeader,
    pub command: Command,
}

/// The application layer message of every federation link.
#[derive(Debug, PartialEq)]
pub enum Msg<'a> {
    Control(Envelope),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// Shorthand for a control message.
    pub fn control(header: MessageHeader, command: Command) -> Self {
        Msg::Control(Envelope { header, command })
    }

    fn invalid_data<T, E>(err: E) -> io::Result<T>
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Err(io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(envelope) => {
                buf.extend_from_slice(&CONTROL.to_be_bytes());

                // SAFETY: `Envelope` derives `Serialize` and only holds maps keyed by strings.
                serde_json::to_writer(buf, envelope).unwrap();
                None
            }
            Msg::Data(payload) => {
                let (kind, nums) = match payload {
                    Payload::Model(params) => (MODEL, params),
                    Payload::LocalUpdate(params) => (LOCAL_UPDATE, params),
                };

                buf.extend_from_slice(&kind.to_be_bytes());
                Some(bytemuck::cast_slice(nums))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::invalid_data(format!(
                "frame of {} bytes is shorter than the {HEADER_SIZE} bytes header",
                buf.len()
            ));
        }

        let (kind_buf, rest) = buf.split_at_mut(HEADER_SIZE);

        // SAFETY: `kind_buf` was split to be exactly `HEADER_SIZE` long.
        let kind = Header::from_be_bytes(kind_buf.try_into().unwrap());

        match kind {
            ERR => match std::str::from_utf8(rest) {
                Ok(s) => Ok(Msg::Err(Cow::Borrowed(s))),
                Err(e) => Self::invalid_data(e),
            },
            CONTROL => {
                let envelope = serde_json::from_slice(rest)?;
                Ok(Msg::Control(envelope))
            }
            MODEL | LOCAL_UPDATE => {
                let nums: &[f32] = match bytemuck::try_cast_slice(rest) {
                    Ok(nums) => nums,
                    Err(e) => return Self::invalid_data(format!("malformed f32 payload: {e}")),
                };

                let payload = if kind == MODEL {
                    Payload::Model(nums)
                } else {
                    Payload::LocalUpdate(nums)
                };

                Ok(Msg::Data(payload))
            }
            other => Self::invalid_data(format!("received an invalid kind header {other}")),
        }
    }
}
