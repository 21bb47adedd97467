//! End-to-end tests driving the engine against a scripted IRC server
//! on a loopback socket.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use skiff_sdk::client::{ConnectionState, Session, SessionHandle};
use skiff_sdk::event::Event;
use skiff_sdk::state::{BufferId, ServerId};
use skiff_sdk::store::{ChannelRecord, ServerRecord, Store};

struct Server {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Server {
    async fn accept(listener: &TcpListener) -> Server {
        let (sock, _) = tokio::time::timeout(Duration::from_secs(6), listener.accept())
            .await
            .expect("timed out waiting for a connection")
            .unwrap();
        let (read, write) = sock.into_split();
        Server {
            reader: BufReader::new(read).lines(),
            writer: write,
        }
    }

    async fn recv(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.reader.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap()
            .expect("client hung up")
    }

    /// Skip lines until one starting with `prefix` arrives.
    async fn recv_until(&mut self, prefix: &str) -> String {
        loop {
            let line = self.recv().await;
            if line.starts_with(prefix) {
                return line;
            }
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    /// Walk the client through CAP negotiation to a 001 welcome.
    async fn register(&mut self, nick: &str) {
        self.recv_until("CAP LS").await;
        self.send(":srv CAP * LS :message-tags server-time batch echo-message")
            .await;
        self.recv_until("CAP REQ").await;
        self.send(":srv CAP dana ACK :message-tags server-time batch echo-message")
            .await;
        self.recv_until("CAP END").await;
        self.send(&format!(":srv 001 {nick} :Welcome to the test net"))
            .await;
    }
}

fn start_session(
    port: u16,
    autojoin: Option<&str>,
) -> (SessionHandle, mpsc::UnboundedReceiver<Event>, ServerId) {
    let store = Store::open_memory().unwrap();
    let id = store
        .add_server(&ServerRecord {
            id: ServerId(0),
            host: "127.0.0.1".to_string(),
            port,
            tls: false,
            nick: "dana".to_string(),
            username: "dana".to_string(),
            realname: "Dana".to_string(),
            password: None,
            sasl_user: None,
            sasl_pass: None,
        })
        .unwrap();
    if let Some(channel) = autojoin {
        store
            .save_channel(&ChannelRecord {
                server: id,
                name: channel.to_string(),
                autojoin: true,
            })
            .unwrap();
    }
    let (session, handle, events) = Session::new(store).unwrap();
    tokio::spawn(session.run());
    (handle, events, id)
}

async fn expect_event(
    rx: &mut mpsc::UnboundedReceiver<Event>,
    pred: impl Fn(&Event) -> bool,
) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn registers_and_autojoins_saved_channels() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (handle, mut events, id) = start_session(port, Some("#ops"));

    handle.connect(id).unwrap();
    let mut server = Server::accept(&listener).await;
    server.register("dana").await;

    expect_event(&mut events, |e| {
        matches!(e, Event::Registered { nick, .. } if nick == "dana")
    })
    .await;

    assert_eq!(server.recv_until("JOIN").await, "JOIN #ops");
    server.send(":dana!d@h JOIN #ops").await;
    server.send(":srv 353 dana = #ops :@alice dana").await;
    server.send(":srv 366 dana #ops :End of names").await;

    let channel = BufferId::channel(id, "#ops");
    expect_event(&mut events, |e| {
        matches!(e, Event::BufferOpened { buffer } if *buffer == channel)
    })
    .await;
    let ev = expect_event(&mut events, |e| {
        matches!(e, Event::MembersChanged { buffer, members }
            if *buffer == channel && !members.is_empty())
    })
    .await;
    let Event::MembersChanged { members, .. } = ev else {
        unreachable!()
    };
    assert!(members.iter().any(|m| m.nick == "alice" && m.symbols == "@"));
}

#[tokio::test]
async fn nick_collision_resolves_with_underscore() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (handle, mut events, id) = start_session(port, None);

    handle.connect(id).unwrap();
    let mut server = Server::accept(&listener).await;
    server.recv_until("CAP LS").await;
    server.send(":srv CAP * LS :").await;
    assert_eq!(server.recv_until("NICK").await, "NICK dana");

    server.send(":srv 433 * dana :Nickname is already in use").await;
    assert_eq!(server.recv_until("NICK").await, "NICK dana_");
    server.send(":srv 001 dana_ :Welcome").await;

    expect_event(&mut events, |e| {
        matches!(e, Event::Registered { nick, .. } if nick == "dana_")
    })
    .await;
}

#[tokio::test]
async fn server_pings_are_answered() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (handle, mut events, id) = start_session(port, None);

    handle.connect(id).unwrap();
    let mut server = Server::accept(&listener).await;
    server.register("dana").await;
    expect_event(&mut events, |e| matches!(e, Event::Registered { .. })).await;

    server.send("PING :healthcheck").await;
    assert_eq!(server.recv_until("PONG").await, "PONG healthcheck");
}

#[tokio::test]
async fn explicit_disconnect_sends_quit_and_stays_down() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (handle, mut events, id) = start_session(port, None);

    handle.connect(id).unwrap();
    let mut server = Server::accept(&listener).await;
    server.register("dana").await;
    expect_event(&mut events, |e| matches!(e, Event::Registered { .. })).await;

    handle.disconnect(id).unwrap();
    assert_eq!(server.recv_until("QUIT").await, "QUIT :leaving");
    expect_event(&mut events, |e| {
        matches!(
            e,
            Event::ConnectionState {
                state: ConnectionState::Disconnected,
                ..
            }
        )
    })
    .await;

    // The first backoff rung is 3s; with reconnects suppressed, nothing
    // should dial back in.
    let redial = tokio::time::timeout(Duration::from_secs(4), listener.accept()).await;
    assert!(redial.is_err());
}

#[tokio::test]
async fn reconnects_after_the_server_drops() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (handle, mut events, id) = start_session(port, None);

    handle.connect(id).unwrap();
    let mut server = Server::accept(&listener).await;
    server.register("dana").await;
    expect_event(&mut events, |e| matches!(e, Event::Registered { .. })).await;

    drop(server);
    expect_event(&mut events, |e| {
        matches!(
            e,
            Event::ConnectionState {
                state: ConnectionState::Disconnected,
                ..
            }
        )
    })
    .await;

    let mut server = Server::accept(&listener).await;
    server.register("dana").await;
    expect_event(&mut events, |e| {
        matches!(e, Event::Registered { nick, .. } if nick == "dana")
    })
    .await;
}
