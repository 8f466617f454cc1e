//! Terminal driver: the line-oriented interface the session engine needs
//! from a UI, plus the rustyline-backed implementation.
//!
//! The engine only ever reads whole input lines and writes whole output
//! lines; raw mode, editing, and history stay inside rustyline. Input runs
//! on a dedicated thread feeding a channel, so the async loops never block
//! on the keyboard; output goes through rustyline's external printer, which
//! is safe to use while a readline is in progress.
//!
//! Terminal geometry also stays inside rustyline: it re-queries the window
//! size on SIGWINCH and on each redraw, so [`TermSink`] carries no resize
//! or set-size hook.

use std::io;
use std::sync::{Arc, Mutex};

use rustyline::error::ReadlineError;
use rustyline::ExternalPrinter;
use tokio::sync::mpsc;

/// Write side of the terminal. Shared by the info-display loop and the
/// message router.
pub trait TermSink: Send + Sync {
    fn write_line(&self, line: &str) -> io::Result<()>;
    fn set_prompt(&self, prompt: &str);
}

/// What the session engine receives at startup: a channel of input lines
/// (closed on input failure or EOF) and a sink for rendered output.
pub struct TermDriver {
    pub input: mpsc::Receiver<String>,
    pub sink: Arc<dyn TermSink>,
}

/// Interactive terminal on stdin/stdout.
pub struct ReadlineTerm;

impl ReadlineTerm {
    /// Start the input thread and return the driver. The thread exits (and
    /// closes the input channel) on EOF, interrupt, or read error.
    pub fn spawn(initial_prompt: &str) -> anyhow::Result<TermDriver> {
        let mut editor = rustyline::DefaultEditor::new()?;
        let printer = editor.create_external_printer()?;
        let prompt = Arc::new(Mutex::new(initial_prompt.to_string()));

        let (input_tx, input_rx) = mpsc::channel(8);
        let reader_prompt = prompt.clone();
        std::thread::spawn(move || loop {
            let current = reader_prompt.lock().unwrap().clone();
            match editor.readline(&current) {
                Ok(line) => {
                    let _ = editor.add_history_entry(&line);
                    if input_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "terminal read failed");
                    break;
                }
            }
        });

        let sink = Arc::new(PrinterSink {
            printer: Mutex::new(printer),
            prompt,
        });
        Ok(TermDriver {
            input: input_rx,
            sink,
        })
    }
}

struct PrinterSink<P: ExternalPrinter + Send> {
    printer: Mutex<P>,
    prompt: Arc<Mutex<String>>,
}

impl<P: ExternalPrinter + Send> TermSink for PrinterSink<P> {
    fn write_line(&self, line: &str) -> io::Result<()> {
        self.printer
            .lock()
            .unwrap()
            .print(line.to_string())
            .map_err(io::Error::other)
    }

    fn set_prompt(&self, prompt: &str) {
        *self.prompt.lock().unwrap() = prompt.to_string();
    }
}

/// In-memory sink collecting everything written to it. Used by the test
/// suites in place of a real terminal.
#[derive(Default)]
pub struct CollectSink {
    lines: Mutex<Vec<String>>,
    prompt: Mutex<String>,
}

impl CollectSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn prompt(&self) -> String {
        self.prompt.lock().unwrap().clone()
    }
}

impl TermSink for CollectSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        self.lines.lock().unwrap().push(line.to_string());
        Ok(())
    }

    fn set_prompt(&self, prompt: &str) {
        *self.prompt.lock().unwrap() = prompt.to_string();
    }
}
