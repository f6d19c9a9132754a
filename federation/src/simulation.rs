//! Runs an experiment in process: one aggregator served over in-memory links and one
//! collaborator per shard.

use std::{borrow::Cow, io, ops::ControlFlow, sync::Arc};

use comms::{
    WireReceiver, WireSender,
    msg::{Command, Envelope, MessageHeader, Msg, Payload},
    specs::experiment::ExperimentSpec,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream},
    task::JoinSet,
};

use crate::{
    FederationErr, Result,
    aggregator::Aggregator,
    client::{AGGREGATOR_ID, AggregatorClient},
    collaborator::Collaborator,
    data::DataInterface,
    device::Device,
    link::{LocalListener, describe, local_link},
    model::ModelInterface,
    shard::ShardDescriptor,
    tasks::TaskKeeper,
};

/// Everything the collaborators of a simulation share.
pub(crate) struct Setup<'a, D> {
    pub federation_id: &'a str,
    pub shards: &'a [(String, Arc<dyn ShardDescriptor>)],
    pub model: &'a ModelInterface,
    pub tasks: &'a TaskKeeper,
    pub data: &'a D,
    pub device: Device,
    pub seed: u64,
}

/// Runs `spec` to completion.
///
/// # Returns
/// The aggregator holding the final state, or the first error of any participant.
pub(crate) async fn run<D>(setup: Setup<'_, D>, spec: ExperimentSpec) -> Result<Aggregator>
where
    D: DataInterface + Clone + 'static,
{
    let name = spec.name.clone();
    let opt_treatment = spec.opt_treatment;
    let names = setup.shards.iter().map(|(n, _)| n.clone()).collect();
    let aggregator = Aggregator::new(spec, names, setup.model.params().to_vec())?;
    let aggregator = Arc::new(Mutex::new(aggregator));

    let (connector, listener) = local_link();
    let mut set = JoinSet::new();
    set.spawn(serve(
        listener,
        aggregator.clone(),
        setup.federation_id.to_string(),
    ));

    for (i, (collaborator, shard)) in setup.shards.iter().enumerate() {
        let participant = Collaborator::new(
            collaborator.clone(),
            setup.model.clone(),
            setup.tasks.clone(),
            setup.data.clone(),
            shard.clone(),
        )?
        .with_opt_treatment(opt_treatment)
        .with_device(setup.device)
        .with_seed(setup.seed.wrapping_add(i as u64 * 7919));

        let mut client =
            AggregatorClient::new(connector.clone(), collaborator.clone(), setup.federation_id);

        set.spawn(async move { participant.run(&mut client).await.map(|_| ()) });
    }

    drop(connector);
    info!(experiment:% = name, collaborators = setup.shards.len(); "simulation started");

    while let Some(res) = set.join_next().await {
        if let Err(e) = res.map_err(FederationErr::from).and_then(|r| r) {
            warn!(experiment:% = name, error:% = e; "simulation failed");
            aggregator.lock().fail();
            return Err(e);
        }
    }

    let Ok(aggregator) = Arc::try_unwrap(aggregator) else {
        return Err(FederationErr::ExperimentFailed(name));
    };

    let aggregator = aggregator.into_inner();
    if !aggregator.is_done() {
        return Err(FederationErr::ExperimentFailed(name));
    }

    Ok(aggregator)
}

/// Accepts links until every connector is gone, serving each on its own task.
async fn serve(
    mut listener: LocalListener,
    aggregator: Arc<Mutex<Aggregator>>,
    federation_id: String,
) -> Result<()> {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            stream = listener.accept() => match stream {
                Some(stream) => {
                    handlers.spawn(handle(stream, aggregator.clone(), federation_id.clone()));
                }
                None => break,
            },
            Some(res) = handlers.join_next() => res??,
        }
    }

    while let Some(res) = handlers.join_next().await {
        res??;
    }

    Ok(())
}

async fn handle(
    stream: DuplexStream,
    aggregator: Arc<Mutex<Aggregator>>,
    federation_id: String,
) -> Result<()> {
    let (rx, tx) = tokio::io::split(stream);
    let (mut rx, mut tx) = comms::channel(rx, tx);
    let mut rx_buf: Vec<u32> = Vec::new();
    let mut update_buf: Vec<u32> = Vec::new();

    loop {
        let envelope = match rx.recv_into(&mut rx_buf).await {
            Ok(Msg::Control(envelope)) => envelope,
            Ok(other) => {
                let err = FederationErr::UnexpectedMessage {
                    expected: "control message",
                    got: describe(&other),
                };
                return reject(&mut tx, err).await;
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let res = respond(
            &mut rx,
            &mut tx,
            &mut update_buf,
            &aggregator,
            &federation_id,
            envelope,
        )
        .await;

        match res {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(())) => return Ok(()),
            Err(e) => return reject(&mut tx, e).await,
        }
    }
}

/// Tells the peer why its link is being dropped.
async fn reject<W>(tx: &mut WireSender<W>, err: FederationErr) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let msg = Msg::Err(Cow::Owned(err.to_string()));

    if let Err(e) = tx.send(&msg).await {
        warn!(error:% = e; "could not report error to collaborator");
    }

    Err(err)
}

async fn respond<R, W>(
    rx: &mut WireReceiver<R>,
    tx: &mut WireSender<W>,
    update_buf: &mut Vec<u32>,
    aggregator: &Mutex<Aggregator>,
    federation_id: &str,
    envelope: Envelope,
) -> Result<ControlFlow<()>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Envelope { header, command } = envelope;
    validate_request(&header, federation_id)?;

    if command == Command::Disconnect {
        debug!(collaborator:% = header.sender; "collaborator disconnected");
        return Ok(ControlFlow::Break(()));
    }

    answer(rx, tx, update_buf, aggregator, &header, command).await?;
    Ok(ControlFlow::Continue(()))
}

async fn answer<R, W>(
    rx: &mut WireReceiver<R>,
    tx: &mut WireSender<W>,
    update_buf: &mut Vec<u32>,
    aggregator: &Mutex<Aggregator>,
    header: &MessageHeader,
    command: Command,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let reply = header.reply();
    let sender = header.sender.as_str();

    match command {
        Command::ConnectivityCheck => send(tx, reply, Command::Ack).await,
        Command::GetTasks => {
            let assignment = aggregator.lock().tasks_for(sender)?;
            let command = Command::Tasks {
                round: assignment.round,
                tasks: assignment.tasks,
                sleep_ms: assignment.sleep.as_millis() as u64,
                quit: assignment.quit,
            };
            send(tx, reply, command).await
        }
        Command::GetAggregatedModel { round } => {
            let model = aggregator.lock().model(round)?.to_vec();
            send(tx, reply, Command::AggregatedModel { round }).await?;
            tx.send(&Msg::Data(Payload::Model(&model))).await?;
            Ok(())
        }
        Command::TaskResults {
            round,
            task,
            data_size,
            metrics,
            has_model,
        } => {
            let update = if has_model {
                match rx.recv_into(update_buf).await? {
                    Msg::Data(Payload::LocalUpdate(params)) => Some(params),
                    other => {
                        return Err(FederationErr::UnexpectedMessage {
                            expected: "local update",
                            got: describe(&other),
                        });
                    }
                }
            } else {
                None
            };

            aggregator
                .lock()
                .submit(sender, round, &task, data_size, metrics, update)?;
            send(tx, reply, Command::Ack).await
        }
        Command::GetExperimentStatus { name } => {
            let status = {
                let aggregator = aggregator.lock();

                if aggregator.name() != name {
                    return Err(FederationErr::Remote(format!("unknown experiment '{name}'")));
                }

                aggregator.status()
            };

            send(tx, reply, Command::ExperimentStatus { status }).await
        }
        Command::AddCollaborator { name } => {
            aggregator.lock().add_collaborator(&name)?;
            send(tx, reply, Command::Ack).await
        }
        Command::RemoveCollaborator { name } => {
            aggregator.lock().remove_collaborator(&name)?;
            send(tx, reply, Command::Ack).await
        }
        other => Err(FederationErr::UnexpectedMessage {
            expected: "aggregator request",
            got: format!("{other:?}"),
        }),
    }
}

fn validate_request(header: &MessageHeader, federation_id: &str) -> Result<()> {
    if header.receiver != AGGREGATOR_ID {
        return Err(FederationErr::InvalidHeader {
            field: "receiver",
            got: header.receiver.clone(),
            expected: AGGREGATOR_ID.to_string(),
        });
    }

    if header.federation_id != federation_id {
        return Err(FederationErr::InvalidHeader {
            field: "federation id",
            got: header.federation_id.clone(),
            expected: federation_id.to_string(),
        });
    }

    Ok(())
}

async fn send<W>(tx: &mut WireSender<W>, header: MessageHeader, command: Command) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    tx.send(&Msg::Control(Envelope { header, command })).await?;
    Ok(())
}
