//! Session engine: spawns and coordinates the read-dispatch, dispatch, and
//! info-display loops around the foreground input loop, and owns shutdown.
//!
//! Lifecycle: `Created → Connecting → Running → Stopping → Closed`. A
//! connect failure short-circuits to `Closed`. Any loop hitting a fatal
//! condition cancels the shared token; shutdown then runs exactly once —
//! the token is idempotent and the transport close is guarded — waiting
//! for every background loop before releasing the transport.
//!
//! Backpressure comes from the bounded queues alone: a stalled consumer
//! blocks its producer, which eventually stalls the transport read. There
//! is no drop policy and no idle timer.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::commands;
use crate::config::Config;
use crate::crypto::{Crypto, Engine};
use crate::proto::{Codec, ParsedMessage};
use crate::router;
use crate::term::{TermDriver, TermSink};
use crate::transport::{self, BoxStream, LineReader, LineWriter, Transport};

/// Capacity of the inbound-message and info queues.
pub const QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Connecting,
    Running,
    Stopping,
    Closed,
}

/// Shared state every loop works against. The queues and the adapter are
/// the only mutation points; the transport writer serializes itself.
pub struct SessionCtx {
    pub writer: LineWriter,
    pub sink: Arc<dyn TermSink>,
    pub crypto: tokio::sync::Mutex<Crypto>,
    pub cancel: CancellationToken,
    pub show_chatter: bool,
    info_tx: mpsc::Sender<String>,
    last_rcpt: StdMutex<String>,
}

impl SessionCtx {
    /// Queue an informational line for the display loop. Blocks when the
    /// queue is full (backpressure), but never outlives cancellation.
    pub async fn info(&self, text: String) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.info_tx.send(text) => {}
        }
    }

    pub fn last_rcpt(&self) -> String {
        self.last_rcpt.lock().unwrap().clone()
    }

    pub fn set_last_rcpt(&self, rcpt: &str) {
        *self.last_rcpt.lock().unwrap() = rcpt.to_string();
    }

    /// Re-derive the prompt from the current last recipient.
    pub fn refresh_prompt(&self) {
        self.sink.set_prompt(&format!("{}> ", self.last_rcpt()));
    }
}

pub struct Session {
    cfg: Config,
    engine: Box<dyn Engine>,
    cancel: CancellationToken,
    state: State,
}

impl Session {
    pub fn new(cfg: Config, engine: Box<dyn Engine>) -> Self {
        Self {
            cfg,
            engine,
            cancel: CancellationToken::new(),
            state: State::Created,
        }
    }

    /// Handle for requesting shutdown from outside the engine. Cancelling
    /// it is idempotent.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Connect through the configured proxy and run the session to
    /// completion. A connect failure never enters `Running`.
    pub async fn run(mut self, term: TermDriver) -> Result<()> {
        transition(&mut self.state, State::Connecting);
        let (stream, preamble) = match transport::connect(&self.cfg).await {
            Ok(ok) => ok,
            Err(e) => {
                transition(&mut self.state, State::Closed);
                return Err(e);
            }
        };
        self.run_with_stream(stream, term, preamble).await
    }

    /// Run the session over an already-established stream. `preamble`
    /// lines (connect/cipher reports) are queued for the info loop.
    pub async fn run_with_stream(
        mut self,
        stream: BoxStream,
        term: TermDriver,
        preamble: Vec<String>,
    ) -> Result<()> {
        if self.state == State::Created {
            transition(&mut self.state, State::Connecting);
        }
        let (reader, writer) = Transport::new(stream).split();
        let (info_tx, info_rx) = mpsc::channel(QUEUE_DEPTH);

        if let Err(e) = register(&writer, &self.cfg).await {
            let _ = writer.close().await;
            transition(&mut self.state, State::Closed);
            return Err(e.into());
        }

        let ctx = Arc::new(SessionCtx {
            writer: writer.clone(),
            sink: term.sink,
            crypto: tokio::sync::Mutex::new(Crypto::new(self.engine)),
            cancel: self.cancel.clone(),
            show_chatter: self.cfg.show_chatter,
            info_tx,
            last_rcpt: StdMutex::new(String::new()),
        });
        ctx.refresh_prompt();

        transition(&mut self.state, State::Running);
        let (msg_tx, msg_rx) = mpsc::channel(QUEUE_DEPTH);
        let handles: Vec<JoinHandle<()>> = vec![
            tokio::spawn(read_loop(reader, Codec::new(), msg_tx, ctx.clone())),
            tokio::spawn(dispatch_loop(msg_rx, ctx.clone())),
            tokio::spawn(info_loop(info_rx, ctx.clone())),
        ];

        // Connect preamble goes through the info queue like everything
        // else; the display loop is already draining, so backpressure
        // applies and nothing is dropped.
        for line in preamble {
            ctx.info(line).await;
        }

        // Foreground input loop, on the caller's own task.
        let mut input = term.input;
        let result = loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break Ok(()),
                line = input.recv() => match line {
                    Some(line) => {
                        if let Err(e) = commands::dispatch(&ctx, &line).await {
                            ctx.info(format!("ERROR: {e}")).await;
                            break Err(e);
                        }
                    }
                    None => break Err(anyhow!("terminal input closed")),
                }
            }
        };

        transition(&mut self.state, State::Stopping);
        self.cancel.cancel();
        for handle in handles {
            let _ = handle.await;
        }
        let _ = writer.close().await;
        transition(&mut self.state, State::Closed);
        result
    }
}

fn transition(state: &mut State, to: State) {
    tracing::debug!(from = ?*state, to = ?to, "session state");
    *state = to;
}

/// IRC registration burst: optional SASL EXTERNAL, then USER/NICK.
async fn register(writer: &LineWriter, cfg: &Config) -> std::io::Result<()> {
    if cfg.sasl_cert.is_some() {
        writer.send_line("CAP REQ :sasl").await?;
        writer.send_line("AUTHENTICATE EXTERNAL").await?;
        writer.send_line("AUTHENTICATE +").await?;
        writer.send_line("CAP END").await?;
    }
    writer
        .send_line(&format!("USER {} * localhost :{}", cfg.nick, cfg.nick))
        .await?;
    writer.send_line(&format!("NICK {}", cfg.nick)).await
}

/// Reads transport lines, parses them, and feeds the inbound queue. Wire
/// order is preserved: single producer into a FIFO with one consumer.
async fn read_loop(
    mut reader: LineReader,
    codec: Codec,
    msg_tx: mpsc::Sender<ParsedMessage>,
    ctx: Arc<SessionCtx>,
) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            res = reader.read_line() => match res {
                Ok(Some(line)) => {
                    let msg = codec.parse(&line);
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return,
                        sent = msg_tx.send(msg) => if sent.is_err() { return; }
                    }
                }
                Ok(None) => {
                    ctx.info("ERROR: connection closed by server".to_string()).await;
                    ctx.cancel.cancel();
                    return;
                }
                Err(e) => {
                    ctx.info(format!("ERROR: {e}")).await;
                    ctx.cancel.cancel();
                    return;
                }
            }
        }
    }
}

/// Pops inbound messages and routes them. Exits on queue closure; a
/// routing failure (transport write, terminal write) is fatal.
async fn dispatch_loop(mut msg_rx: mpsc::Receiver<ParsedMessage>, ctx: Arc<SessionCtx>) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            msg = msg_rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = router::route(&ctx, msg).await {
                        ctx.info(format!("ERROR: {e}")).await;
                        ctx.cancel.cancel();
                        return;
                    }
                }
                None => return,
            }
        }
    }
}

/// Renders queued informational lines. On cancellation it drains whatever
/// producers managed to queue, so shutdown never swallows diagnostics.
async fn info_loop(mut info_rx: mpsc::Receiver<String>, ctx: Arc<SessionCtx>) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            line = info_rx.recv() => match line {
                Some(text) => {
                    if ctx.sink.write_line(&format!("[INFO] {text}")).is_err() {
                        ctx.cancel.cancel();
                        break;
                    }
                }
                None => return,
            }
        }
    }
    while let Ok(text) = info_rx.try_recv() {
        let _ = ctx.sink.write_line(&format!("[INFO] {text}"));
    }
}
