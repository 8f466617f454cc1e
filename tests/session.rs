//! End-to-end session tests over an in-memory duplex: a scripted peer on
//! one end, the full engine (registration, loops, routing, encryption
//! adapter) on the other.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use tirc::config::Config;
use tirc::crypto::{Conversation as _, Engine};
use tirc::e2e::E2eEngine;
use tirc::session::Session;
use tirc::term::{CollectSink, TermDriver};

const TICK: Duration = Duration::from_millis(10);
const DEADLINE: Duration = Duration::from_secs(5);

/// The scripted remote end of the duplex.
struct Peer {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Peer {
    async fn read_line(&mut self) -> Option<String> {
        let mut buf = String::new();
        let n = timeout(DEADLINE, self.reader.read_line(&mut buf))
            .await
            .expect("peer read timed out")
            .unwrap();
        if n == 0 {
            None
        } else {
            Some(buf.trim_end_matches(['\r', '\n']).to_string())
        }
    }

    async fn expect(&mut self, want: &str) {
        assert_eq!(self.read_line().await.as_deref(), Some(want));
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }
}

struct Harness {
    handle: JoinHandle<anyhow::Result<()>>,
    input: mpsc::Sender<String>,
    sink: Arc<CollectSink>,
    cancel: CancellationToken,
    peer: Peer,
}

fn start(cfg: Config) -> Harness {
    start_with(cfg, Vec::new())
}

fn start_with(cfg: Config, preamble: Vec<String>) -> Harness {
    let (client, server) = tokio::io::duplex(4096);
    let (read, write) = tokio::io::split(server);
    let (input_tx, input_rx) = mpsc::channel(8);
    let sink = Arc::new(CollectSink::default());
    let term = TermDriver {
        input: input_rx,
        sink: sink.clone(),
    };

    let session = Session::new(cfg, Box::new(E2eEngine::new()));
    let cancel = session.cancel_token();
    let handle = tokio::spawn(session.run_with_stream(Box::new(client), term, preamble));

    Harness {
        handle,
        input: input_tx,
        sink,
        cancel,
        peer: Peer {
            reader: BufReader::new(read),
            writer: write,
        },
    }
}

fn config(nick: &str) -> Config {
    Config {
        nick: nick.to_string(),
        ..Config::default()
    }
}

/// Poll the sink until a line matching `pred` shows up.
async fn wait_for_line(sink: &CollectSink, pred: impl Fn(&str) -> bool) {
    timeout(DEADLINE, async {
        loop {
            if sink.lines().iter().any(|l| pred(l)) {
                return;
            }
            tokio::time::sleep(TICK).await;
        }
    })
    .await
    .expect("expected output line never appeared");
}

async fn wait_for_prompt(sink: &CollectSink, want: &str) {
    timeout(DEADLINE, async {
        while sink.prompt() != want {
            tokio::time::sleep(TICK).await;
        }
    })
    .await
    .expect("expected prompt never appeared");
}

#[tokio::test]
async fn registers_then_answers_ping() {
    let mut h = start(config("alice"));
    h.peer.expect("USER alice * localhost :alice").await;
    h.peer.expect("NICK alice").await;

    h.peer.send("PING :token123").await;
    h.peer.expect("PONG :token123").await;

    h.cancel.cancel();
    h.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn oversized_preamble_is_delivered_in_full_and_in_order() {
    let preamble: Vec<String> = (0..100).map(|i| format!("connect report {i}")).collect();
    let mut h = start_with(config("alice"), preamble);
    h.peer.read_line().await;
    h.peer.read_line().await;

    // More lines than the queue holds: backpressure, not loss.
    wait_for_line(&h.sink, |l| l == "[INFO] connect report 99").await;
    let shown: Vec<String> = h
        .sink
        .lines()
        .into_iter()
        .filter(|l| l.starts_with("[INFO] connect report "))
        .collect();
    let want: Vec<String> = (0..100).map(|i| format!("[INFO] connect report {i}")).collect();
    assert_eq!(shown, want);

    h.cancel.cancel();
    h.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn sasl_burst_precedes_registration() {
    let mut h = start(Config {
        sasl_cert: Some("ident".to_string()),
        ..config("alice")
    });
    h.peer.expect("CAP REQ :sasl").await;
    h.peer.expect("AUTHENTICATE EXTERNAL").await;
    h.peer.expect("AUTHENTICATE +").await;
    h.peer.expect("CAP END").await;
    h.peer.expect("USER alice * localhost :alice").await;
    h.peer.expect("NICK alice").await;

    h.cancel.cancel();
    h.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn commands_drive_the_wire_and_the_prompt() {
    let mut h = start(config("bob"));
    h.peer.read_line().await;
    h.peer.read_line().await;

    h.input.send("/join #den".to_string()).await.unwrap();
    h.peer.expect("JOIN #den").await;
    wait_for_prompt(&h.sink, "#den> ").await;

    // Bare input goes to the last recipient. Channel traffic is plain.
    h.input.send("hello room".to_string()).await.unwrap();
    h.peer.expect("PRIVMSG #den :hello room").await;

    // First direct message piggybacks a key offer before the plaintext.
    h.input.send("/msg carol hi".to_string()).await.unwrap();
    let offer = h.peer.read_line().await.unwrap();
    assert!(offer.starts_with("PRIVMSG carol :?TIRC:KEX:"));
    h.peer.expect("PRIVMSG carol :hi").await;
    wait_for_prompt(&h.sink, "carol> ").await;

    h.input.send("/bogus".to_string()).await.unwrap();
    wait_for_line(&h.sink, |l| {
        l == "[INFO] Unknown command \"bogus\" - try /help"
    })
    .await;

    h.input.send("/quit".to_string()).await.unwrap();
    h.peer.expect("QUIT :Leaving.").await;

    // The server hangs up in response; EOF takes the session down cleanly.
    drop(h.peer);
    h.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn inbound_key_exchange_upgrades_the_conversation() {
    let mut h = start(config("bob"));
    h.peer.read_line().await;
    h.peer.read_line().await;

    let peer_engine = E2eEngine::new();
    let mut carol = peer_engine.new_conversation();

    // Carol's first message: key offer plus plaintext.
    for line in carol.send("hi bob").unwrap() {
        h.peer.send(&format!(":carol!c@h PRIVMSG bob :{line}")).await;
    }
    wait_for_line(&h.sink, |l| l.contains("hi bob")).await;

    // The engine answers the offer without displaying anything for it.
    let answer = h.peer.read_line().await.unwrap();
    let payload = answer
        .strip_prefix("PRIVMSG carol :")
        .expect("key answer goes back to carol");
    assert!(payload.starts_with("?TIRC:KEXR:"));
    let (_, replies) = carol.receive(payload).unwrap();
    assert!(replies.is_empty());
    assert!(carol.is_encrypted());

    // Both directions now run encrypted.
    let wire = carol.send("covert hello").unwrap();
    assert_eq!(wire.len(), 1);
    h.peer
        .send(&format!(":carol!c@h PRIVMSG bob :{}", wire[0]))
        .await;
    wait_for_line(&h.sink, |l| l.contains("covert hello")).await;

    h.input.send("/msg carol back atcha".to_string()).await.unwrap();
    let out = h.peer.read_line().await.unwrap();
    let payload = out.strip_prefix("PRIVMSG carol :").unwrap();
    assert!(payload.starts_with("?TIRC:MSG:"));
    assert_eq!(carol.receive(payload).unwrap().0, "back atcha");

    h.cancel.cancel();
    h.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_key_offer_reports_without_killing_the_session() {
    let mut h = start(config("bob"));
    h.peer.read_line().await;
    h.peer.read_line().await;

    let bogus = format!("?TIRC:KEX:{}", B64.encode(b"short"));
    h.peer
        .send(&format!(":mallory!m@h PRIVMSG bob :{bogus}"))
        .await;
    wait_for_line(&h.sink, |l| {
        l.starts_with("[INFO] Encryption error with mallory:")
    })
    .await;

    // Still alive and serving.
    h.peer.send("PING :still-up").await;
    h.peer.expect("PONG :still-up").await;

    h.cancel.cancel();
    h.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn server_eof_shuts_everything_down() {
    let mut h = start(config("alice"));
    h.peer.read_line().await;
    h.peer.read_line().await;

    drop(h.peer);
    h.handle.await.unwrap().unwrap();
    assert!(h
        .sink
        .lines()
        .contains(&"[INFO] ERROR: connection closed by server".to_string()));
}

#[tokio::test]
async fn closed_input_is_a_fatal_condition() {
    let mut h = start(config("alice"));
    h.peer.read_line().await;
    h.peer.read_line().await;

    drop(h.input);
    let err = h.handle.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("terminal input closed"));
}
