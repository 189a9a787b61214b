use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload},
    specs::PeerSpec,
};
use tokio::io::{self, DuplexStream, ReadHalf, WriteHalf};

type Rx = OnoReceiver<ReadHalf<DuplexStream>>;
type Tx = OnoSender<WriteHalf<DuplexStream>>;

fn channel_pair() -> ((Rx, Tx), (Rx, Tx)) {
    let (one, two) = io::duplex(4096);
    let (rx1, tx1) = io::split(one);
    let (rx2, tx2) = io::split(two);
    (comms::channel(rx1, tx1), comms::channel(rx2, tx2))
}

#[tokio::test]
async fn control_messages_travel_as_json() -> std::io::Result<()> {
    let ((_, mut tx), (mut rx, _)) = channel_pair();

    let spec = PeerSpec {
        rank: 3,
        world_size: 4,
        strategy: "periodic(k=5)".to_string(),
        num_params: 1234,
    };

    tx.send(&Msg::Control(Command::Join(spec.clone()))).await?;

    let mut buf: Vec<u32> = Vec::new();
    let msg: Msg = rx.recv_into(&mut buf).await?;

    match msg {
        Msg::Control(Command::Join(got)) => assert_eq!(got, spec),
        other => panic!("unexpected message: {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn numeric_payloads_keep_their_values_and_kind() -> std::io::Result<()> {
    let ((_, mut tx), (mut rx, _)) = channel_pair();

    let sum = [1.5_f32, -2.0, 3.25];
    let gather = [0.1_f32, 0.2];

    tx.send(&Msg::Data(Payload::Sum(&sum))).await?;
    tx.send(&Msg::Data(Payload::Gather(&gather))).await?;

    let mut buf: Vec<f32> = Vec::new();

    let Msg::Data(Payload::Sum(got)) = rx.recv_into(&mut buf).await? else {
        panic!("expected a sum payload");
    };
    assert_eq!(got, sum);

    let Msg::Data(Payload::Gather(got)) = rx.recv_into(&mut buf).await? else {
        panic!("expected a gather payload");
    };
    assert_eq!(got, gather);

    Ok(())
}

#[tokio::test]
async fn error_messages_carry_their_text() -> std::io::Result<()> {
    let ((_, mut tx), (mut rx, _)) = channel_pair();

    tx.send(&Msg::Err("rank 2 disconnected".into())).await?;

    let mut buf: Vec<u32> = Vec::new();
    let msg: Msg = rx.recv_into(&mut buf).await?;

    assert_eq!(msg.kind(), "err");
    let Msg::Err(text) = msg else {
        panic!("expected an error message");
    };
    assert_eq!(text, "rank 2 disconnected");

    Ok(())
}

#[tokio::test]
async fn closed_streams_fail_to_receive() {
    let ((_, tx), (mut rx, _)) = channel_pair();
    drop(tx);

    let mut buf: Vec<u32> = Vec::new();
    let res = rx.recv_into::<Msg, _>(&mut buf).await;
    assert!(res.is_err());
}
