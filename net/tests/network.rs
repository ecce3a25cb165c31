use std::{
    collections::HashSet,
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{mpsc::Receiver, Arc},
    time::{Duration, Instant},
};

use channel_net::{
    notification::{notification_queue, NotificationSink},
    settings::NetworkSettings,
    ChannelId, ConnectionState, Multiplexer, NetworkError, Notification, NotificationKind,
};

const RECEIVE_TIMEOUT_MS: u64 = 100;
const EVENT_WAIT: Duration = Duration::from_secs(5);

fn new_multiplexer() -> (Multiplexer, Receiver<Notification>) {
    let settings = Arc::new(NetworkSettings {
        connect_timeout_ms: 2_000,
        receive_timeout_ms: RECEIVE_TIMEOUT_MS,
        send_timeout_ms: 2_000,
        ..NetworkSettings::default()
    });
    let (sink, receiver) = notification_queue();
    let sink: Arc<dyn NotificationSink> = sink;
    (Multiplexer::new(&settings, &sink), receiver)
}

fn wait_for(receiver: &Receiver<Notification>, kind: NotificationKind) -> Notification {
    loop {
        let notification = receiver.recv_timeout(EVENT_WAIT).expect("no notification received");
        if notification.kind() == kind {
            return notification;
        }
    }
}

fn wait_for_channel(receiver: &Receiver<Notification>, kind: NotificationKind, channel_id: ChannelId) {
    loop {
        let notification = wait_for(receiver, kind);
        if notification.channel_id() == Some(channel_id) {
            return;
        }
    }
}

fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn should_issue_distinct_increasing_channel_ids() {
    let (multiplexer, _receiver) = new_multiplexer();
    let port = closed_port();

    let channel_ids: Vec<ChannelId> = (0..10)
        .map(|_| multiplexer.connect("127.0.0.1", port).unwrap())
        .collect();

    assert!(channel_ids.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(channel_ids.iter().collect::<HashSet<_>>().len(), channel_ids.len());
}

#[test]
fn should_send_to_the_right_accepted_channel() {
    let (multiplexer, receiver) = new_multiplexer();
    let addr = multiplexer.listen(Some("127.0.0.1"), 0).unwrap();

    let mut clients = Vec::new();
    let mut channel_ids = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(addr).unwrap());
        let connected = wait_for(&receiver, NotificationKind::Connected);
        channel_ids.push(connected.channel_id().unwrap());
    }
    assert!(channel_ids.windows(2).all(|pair| pair[0] < pair[1]));

    multiplexer.send(channel_ids[1], b"ping").unwrap();

    let client = &mut clients[1];
    client.set_read_timeout(Some(EVENT_WAIT)).unwrap();
    let mut buffer = [0u8; 4];
    client.read_exact(&mut buffer).unwrap();
    assert_eq!(&buffer, b"ping");

    for index in [0, 2] {
        clients[index].set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut buffer = [0u8; 1];
        assert!(clients[index].read(&mut buffer).is_err());
    }
}

#[test]
fn should_forget_reclaimed_channels() {
    let (multiplexer, receiver) = new_multiplexer();
    let channel_id = multiplexer.connect("127.0.0.1", closed_port()).unwrap();
    wait_for_channel(&receiver, NotificationKind::End, channel_id);

    assert_eq!(multiplexer.state(channel_id), Some(ConnectionState::Closed));
    assert_eq!(multiplexer.reclaim(), 1);

    assert_eq!(multiplexer.state(channel_id), None);
    assert_eq!(multiplexer.channel_count(), 0);
    assert_eq!(
        multiplexer.send(channel_id, b"data"),
        Err(NetworkError::UnknownChannel { channel_id })
    );
    assert_eq!(
        multiplexer.disconnect(channel_id),
        Err(NetworkError::UnknownChannel { channel_id })
    );
}

#[test]
fn should_reclaim_closed_channels_before_registering() {
    let (multiplexer, receiver) = new_multiplexer();
    let port = closed_port();
    let first = multiplexer.connect("127.0.0.1", port).unwrap();
    wait_for_channel(&receiver, NotificationKind::End, first);

    let second = multiplexer.connect("127.0.0.1", port).unwrap();
    assert!(multiplexer.state(first).is_none());
    assert!(second > first);
}

#[test]
fn should_reject_unknown_channel() {
    let (multiplexer, _receiver) = new_multiplexer();
    assert_eq!(
        multiplexer.send(42, b"data"),
        Err(NetworkError::UnknownChannel { channel_id: 42 })
    );
}

#[test]
fn should_echo_between_multiplexers() {
    let (server, server_events) = new_multiplexer();
    let (client, client_events) = new_multiplexer();
    let addr = server.listen(Some("127.0.0.1"), 0).unwrap();

    let channel_id = client.connect("127.0.0.1", addr.port()).unwrap();
    client.send(channel_id, b"hello").unwrap();

    let mut echoed = 0;
    while echoed < 5 {
        if let Notification::DataIn { channel_id, data } = wait_for(&server_events, NotificationKind::DataIn) {
            let bytes = data.take();
            server.send(channel_id, &bytes).unwrap();
            echoed += bytes.len();
        }
    }

    let mut received = Vec::new();
    while received.len() < 5 {
        if let Notification::DataIn { data, .. } = wait_for(&client_events, NotificationKind::DataIn) {
            received.extend(data.take());
        }
    }
    assert_eq!(received, b"hello");
}

#[test]
fn should_end_disconnected_channel_within_receive_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (multiplexer, receiver) = new_multiplexer();

    let channel_id = multiplexer.connect("127.0.0.1", listener.local_addr().unwrap().port()).unwrap();
    let (_peer, _) = listener.accept().unwrap();
    wait_for_channel(&receiver, NotificationKind::Connected, channel_id);

    let requested = Instant::now();
    multiplexer.disconnect(channel_id).unwrap();
    wait_for_channel(&receiver, NotificationKind::End, channel_id);

    assert!(requested.elapsed() < Duration::from_millis(RECEIVE_TIMEOUT_MS * 10));
    assert_eq!(multiplexer.state(channel_id), Some(ConnectionState::Closed));
}

#[test]
fn should_disconnect_every_channel_on_shutdown() {
    let (multiplexer, receiver) = new_multiplexer();
    let addr = multiplexer.listen(Some("127.0.0.1"), 0).unwrap();

    multiplexer.connect("127.0.0.1", addr.port()).unwrap();
    multiplexer.connect("127.0.0.1", addr.port()).unwrap();

    let mut connected = 0;
    while connected < 4 {
        wait_for(&receiver, NotificationKind::Connected);
        connected += 1;
    }
    assert_eq!(multiplexer.channel_count(), 4);

    multiplexer.shutdown();
    assert!(multiplexer.listen_addr().is_none());

    let mut ended = 0;
    while ended < 4 {
        wait_for(&receiver, NotificationKind::End);
        ended += 1;
    }
    assert_eq!(multiplexer.reclaim(), 4);
    assert_eq!(multiplexer.channel_count(), 0);
}

#[test]
fn should_stop_accepting_after_stop_listening() {
    let (multiplexer, _receiver) = new_multiplexer();
    let addr = multiplexer.listen(Some("127.0.0.1"), 0).unwrap();
    multiplexer.stop_listening();

    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn should_pipeline_sends_made_while_connecting() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (multiplexer, receiver) = new_multiplexer();

    let channel_id = multiplexer.connect("127.0.0.1", listener.local_addr().unwrap().port()).unwrap();
    multiplexer.send(channel_id, b"early").unwrap();
    let (mut peer, _) = listener.accept().unwrap();
    wait_for_channel(&receiver, NotificationKind::Connected, channel_id);
    multiplexer.send(channel_id, b"+late").unwrap();

    peer.set_read_timeout(Some(EVENT_WAIT)).unwrap();
    let mut buffer = [0u8; 10];
    peer.read_exact(&mut buffer).unwrap();
    assert_eq!(&buffer, b"early+late");

    peer.write_all(b"!").unwrap();
    wait_for_channel(&receiver, NotificationKind::DataIn, channel_id);
}
