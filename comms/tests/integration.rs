use comms::{
    WireReceiver, WireSender,
    msg::{Command, MessageHeader, Msg, Payload},
    specs::{
        experiment::{
            AggregationSpec, ExperimentSpec, OptTreatment, RoundPhase, TaskKind, TaskSpec,
        },
        model::{ActFnSpec, InitSpec, LayerSpec, LossFnSpec, ModelSpec, OptimizerSpec},
    },
};
use tokio::io::{self, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

type Link = (WireReceiver<ReadHalf<DuplexStream>>, WireSender<WriteHalf<DuplexStream>>);

fn link_pair(size: usize) -> (Link, Link) {
    let (one, two) = io::duplex(size);
    let (rx1, tx1) = io::split(one);
    let (rx2, tx2) = io::split(two);
    (comms::channel(rx1, tx1), comms::channel(rx2, tx2))
}

fn header() -> MessageHeader {
    MessageHeader {
        sender: "director".into(),
        receiver: "frontend".into(),
        federation_id: "cifar".into(),
        cert_common_name: String::new(),
    }
}

fn experiment() -> ExperimentSpec {
    ExperimentSpec {
        name: "cifar10".into(),
        model: ModelSpec::Sequential {
            input_shape: vec![3, 8, 8],
            layers: vec![
                LayerSpec::Flatten,
                LayerSpec::Dense {
                    dim: (192, 10),
                    act_fn: Some(ActFnSpec::Relu),
                },
            ],
            init: InitSpec::Normal {
                mean: 0.,
                std_dev: 0.05,
            },
        },
        optimizer: OptimizerSpec::GradientDescent { learning_rate: 0.1 },
        loss: LossFnSpec::CrossEntropy,
        tasks: vec![
            TaskSpec {
                name: "train".into(),
                kind: TaskKind::Train,
                aggregation: AggregationSpec::WeightedAverage,
                kwargs: Default::default(),
            },
            TaskSpec {
                name: "validate".into(),
                kind: TaskKind::Validate,
                aggregation: AggregationSpec::WeightedAverage,
                kwargs: Default::default(),
            },
        ],
        rounds: 3,
        opt_treatment: OptTreatment::ContinueLocal,
        best_metric: "acc".into(),
        seed: Some(7),
    }
}

#[tokio::test]
async fn control_then_model_payload() -> io::Result<()> {
    let ((_, mut tx), (mut rx, _)) = link_pair(64);
    let spec = experiment();
    let params: Vec<f32> = (0..1930).map(|i| i as f32 * 0.5).collect();

    let sender = async {
        let msg = Msg::control(header(), Command::SetNewExperiment { spec: spec.clone() });
        tx.send(&msg).await?;
        tx.send(&Msg::Data(Payload::Model(&params))).await
    };

    let receiver = async {
        let mut buf: Vec<u32> = Vec::new();
        let Msg::Control(envelope) = rx.recv_into(&mut buf).await? else {
            panic!("expected a control message");
        };
        assert_eq!(envelope.header, header());
        assert_eq!(
            envelope.command,
            Command::SetNewExperiment { spec: spec.clone() }
        );

        let msg: Msg = rx.recv_into(&mut buf).await?;
        assert_eq!(msg, Msg::Data(Payload::Model(&params)));
        Ok::<_, io::Error>(())
    };

    tokio::try_join!(sender, receiver)?;
    Ok(())
}

#[tokio::test]
async fn error_messages_round_trip() -> io::Result<()> {
    let ((_, mut tx), (mut rx, _)) = link_pair(256);

    tx.send(&Msg::Err("unknown task `fit`".into())).await?;

    let mut buf: Vec<u32> = Vec::new();
    let msg: Msg = rx.recv_into(&mut buf).await?;
    assert_eq!(msg, Msg::Err("unknown task `fit`".into()));
    Ok(())
}

#[tokio::test]
async fn disconnect_is_the_last_frame() -> io::Result<()> {
    let ((_, mut tx), (mut rx, _)) = link_pair(256);

    tx.send(&Msg::control(header(), Command::Disconnect)).await?;
    tx.shutdown().await?;

    let mut buf: Vec<u32> = Vec::new();
    let Msg::Control(envelope) = rx.recv_into(&mut buf).await? else {
        panic!("expected a control message");
    };
    assert_eq!(envelope.command, Command::Disconnect);

    let err = rx.recv_into::<Msg, _>(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    Ok(())
}

#[tokio::test]
async fn closed_link_is_an_error() {
    let ((_, tx), (mut rx, _)) = link_pair(64);
    drop(tx);

    let mut buf: Vec<u32> = Vec::new();
    let res: io::Result<Msg> = rx.recv_into(&mut buf).await;
    assert!(res.is_err());
}

#[tokio::test]
async fn garbage_frame_is_invalid_data() -> io::Result<()> {
    let (one, two) = io::duplex(64);
    let (_, mut raw_tx) = io::split(one);
    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);

    raw_tx.write_all(&6u64.to_be_bytes()).await?;
    raw_tx.write_all(&[0, 0, 0, 1, b'{', b'x']).await?;

    let mut buf: Vec<u32> = Vec::new();
    let err = rx.recv_into::<Msg, _>(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    Ok(())
}

#[test]
fn round_tasks_wrap_training_in_validation() {
    let tasks = experiment().round_tasks();
    let phases: Vec<_> = tasks.iter().map(|t| (t.task.as_str(), t.phase)).collect();

    assert_eq!(
        phases,
        [
            ("validate", RoundPhase::AggregatedModelValidation),
            ("train", RoundPhase::Train),
            ("validate", RoundPhase::LocallyTunedModelValidation),
        ]
    );
}
