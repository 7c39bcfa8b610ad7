//! Connection pumps driven over in-memory streams

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use pig_arena_server::game::constants::net::{MAX_INBOUND_FRAME, MAX_OUTBOUND_FRAME};
use pig_arena_server::game::dice::ScriptedDie;
use pig_arena_server::game::state::Rules;
use pig_arena_server::lobby::actor::MatchActor;
use pig_arena_server::lobby::{spawn_match, ActorSettings, MatchHandle};
use pig_arena_server::metrics::Metrics;
use pig_arena_server::net::connection::{channel, Connection, Departure, Liveness};
use pig_arena_server::net::framing::{read_frame, write_frame};
use pig_arena_server::net::protocol::{decode, ErrorKind, MessageType, Outcome, ServerMessage};
use tokio::io::{duplex, split, AsyncRead, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

struct Client {
    id: Uuid,
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    task: JoinHandle<Departure>,
}

fn session_with(outcomes: Vec<u32>) -> MatchHandle {
    spawn_match(
        Uuid::new_v4(),
        Rules::with_target(100),
        ActorSettings::default(),
        Box::new(ScriptedDie::new(outcomes)),
        Arc::new(Metrics::new()),
    )
}

/// Join `session` over an in-memory stream and start both pumps
fn connect(session: &MatchHandle, name: &str, liveness: Liveness, metrics: Arc<Metrics>) -> Client {
    let id = Uuid::new_v4();
    let (handle, outbox) = channel(id, 64);
    let driver = Connection::new(session.clone(), &handle, liveness, metrics);
    session.join(handle, name.to_string()).unwrap();

    let (client, server) = duplex(16 * 1024);
    let (server_reader, server_writer) = split(server);
    let (reader, writer) = split(client);
    let task = tokio::spawn(driver.serve(server_reader, server_writer, outbox));

    Client {
        id,
        reader,
        writer,
        task,
    }
}

async fn next_message<R: AsyncRead + Unpin>(reader: &mut R) -> ServerMessage {
    let frame = timeout(Duration::from_secs(2), read_frame(reader, MAX_OUTBOUND_FRAME))
        .await
        .expect("timed out reading frame")
        .expect("frame");
    decode(&frame).expect("server message")
}

async fn expect_kind<R: AsyncRead + Unpin>(reader: &mut R, kind: MessageType) -> ServerMessage {
    loop {
        let message = next_message(reader).await;
        if message.kind == kind {
            return message;
        }
    }
}

async fn send(client: &mut Client, payload: &[u8]) {
    write_frame(&mut client.writer, payload, MAX_INBOUND_FRAME)
        .await
        .unwrap();
}

async fn expect_in_outbox(
    outbox: &mut mpsc::Receiver<Arc<ServerMessage>>,
    kind: MessageType,
) -> Arc<ServerMessage> {
    loop {
        let message = timeout(Duration::from_secs(2), outbox.recv())
            .await
            .unwrap()
            .unwrap();
        if message.kind == kind {
            return message;
        }
    }
}

#[tokio::test]
async fn test_inbound_frames_reach_the_session() {
    let metrics = Arc::new(Metrics::new());
    let session = session_with(vec![3]);
    let mut a = connect(&session, "A", Liveness::default(), metrics.clone());

    let joined = next_message(&mut a.reader).await;
    assert_eq!(joined.kind, MessageType::Joined);
    assert_eq!(joined.participant_id, Some(a.id));

    let b = Uuid::new_v4();
    let (b_handle, mut b_box) = channel(b, 64);
    session.join(b_handle, "B".to_string()).unwrap();
    expect_kind(&mut a.reader, MessageType::Started).await;

    send(&mut a, br#"{"action":"pong"}"#).await;
    send(&mut a, br#"{"action":"roll"}"#).await;

    let update = expect_kind(&mut a.reader, MessageType::Updated).await;
    assert_eq!(update.participant_id, Some(a.id));
    assert_eq!(
        update.outcome,
        Some(Outcome::Rolled {
            value: 3,
            forfeited: false
        })
    );

    let seen_by_b = expect_in_outbox(&mut b_box, MessageType::Updated).await;
    assert_eq!(seen_by_b.state.as_ref().unwrap().accumulator, 3);
    assert_eq!(metrics.connections_active.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_malformed_frame_closes_and_leaves() {
    let metrics = Arc::new(Metrics::new());
    let session = session_with(vec![]);

    let b = Uuid::new_v4();
    let (b_handle, mut b_box) = channel(b, 64);
    session.join(b_handle, "B".to_string()).unwrap();

    let mut a = connect(&session, "A", Liveness::default(), metrics.clone());
    expect_kind(&mut a.reader, MessageType::Started).await;

    send(&mut a, b"not json").await;
    let departure = timeout(Duration::from_secs(2), a.task).await.unwrap().unwrap();
    assert_eq!(departure, Departure::ProtocolError);

    let left = expect_in_outbox(&mut b_box, MessageType::Left).await;
    assert_eq!(left.participant_id, Some(a.id));
    let over = expect_in_outbox(&mut b_box, MessageType::Over).await;
    assert_eq!(over.state.as_ref().unwrap().winner, Some(b));

    assert_eq!(metrics.connections_active.load(Ordering::Relaxed), 0);
    assert_eq!(metrics.connections_total.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_oversized_frame_is_a_protocol_error() {
    let session = session_with(vec![]);
    let mut a = connect(&session, "A", Liveness::default(), Arc::new(Metrics::new()));

    let len = (MAX_INBOUND_FRAME as u32 + 1).to_le_bytes();
    a.writer.write_all(&len).await.unwrap();
    a.writer.flush().await.unwrap();

    let departure = timeout(Duration::from_secs(2), a.task).await.unwrap().unwrap();
    assert_eq!(departure, Departure::ProtocolError);
}

#[tokio::test]
async fn test_silent_client_times_out_after_pings() {
    let liveness = Liveness {
        ping_period: Duration::from_millis(20),
        pong_wait: Duration::from_millis(150),
        write_wait: Duration::from_secs(1),
    };
    let session = session_with(vec![]);
    let mut a = connect(&session, "A", liveness, Arc::new(Metrics::new()));

    let ping = expect_kind(&mut a.reader, MessageType::Ping).await;
    assert!(ping.state.is_none());

    let departure = timeout(Duration::from_secs(2), a.task).await.unwrap().unwrap();
    assert_eq!(departure, Departure::ReadTimeout);

    let summary = session.wait_for(|s| s.connections == 0).await.unwrap();
    assert!(!summary.snapshot.participants[0].active);
}

#[tokio::test]
async fn test_pongs_keep_connection_alive() {
    let liveness = Liveness {
        ping_period: Duration::from_millis(20),
        pong_wait: Duration::from_millis(100),
        write_wait: Duration::from_secs(1),
    };
    let session = session_with(vec![]);
    let mut a = connect(&session, "A", liveness, Arc::new(Metrics::new()));

    for _ in 0..10 {
        expect_kind(&mut a.reader, MessageType::Ping).await;
        send(&mut a, br#"{"action":"pong"}"#).await;
    }
    assert!(!a.task.is_finished());

    a.writer.shutdown().await.unwrap();
    let departure = timeout(Duration::from_secs(2), a.task).await.unwrap().unwrap();
    assert_eq!(departure, Departure::ClientClosed);
}

#[tokio::test]
async fn test_released_mailbox_ends_the_connection() {
    let session = session_with(vec![]);
    let (handle, outbox) = channel(Uuid::new_v4(), 4);
    let driver = Connection::new(session.clone(), &handle, Liveness::default(), Arc::new(Metrics::new()));
    drop(handle);

    let (_client, server) = duplex(1024);
    let (reader, writer) = split(server);
    let departure = timeout(Duration::from_secs(2), driver.serve(reader, writer, outbox))
        .await
        .unwrap();
    assert_eq!(departure, Departure::SessionClosed);
}

#[tokio::test]
async fn test_busy_session_answers_sender_privately() {
    let metrics = Arc::new(Metrics::new());
    // Never run, so the pending join keeps the single mailbox slot occupied
    let (_actor, session) = MatchActor::new(
        Uuid::new_v4(),
        Rules::default(),
        ActorSettings {
            mailbox_capacity: 1,
            ..ActorSettings::default()
        },
        Box::new(ScriptedDie::new(vec![3])),
        Arc::new(Metrics::new()),
    );
    let mut a = connect(&session, "A", Liveness::default(), metrics.clone());

    send(&mut a, br#"{"action":"roll"}"#).await;

    let reply = next_message(&mut a.reader).await;
    assert_eq!(reply.kind, MessageType::Error);
    let error = reply.error.expect("error payload");
    assert_eq!(error.kind, ErrorKind::Busy);
    assert!(error.message.contains("roll"));
    assert_eq!(metrics.actions_busy.load(Ordering::Relaxed), 1);

    // Still connected; the client decides whether to resubmit
    assert!(!a.task.is_finished());
}
