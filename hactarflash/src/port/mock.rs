//! Scripted in-memory port for protocol tests.
//!
//! Replies are queued as [`Step`]s: byte runs are handed to reads in order,
//! and each [`Step::Silence`] makes exactly one read time out. Reads, writes,
//! parity changes, pin changes and closes are recorded so tests can assert
//! ordering.
//! Clones share state, so a test can keep a handle after moving the port
//! into an uploader.

use {
    crate::{
        error::Result,
        port::{DEFAULT_BAUD, DEFAULT_TIMEOUT, Parity, Port},
    },
    std::{
        collections::VecDeque,
        io::{self, Read, Write},
        sync::{Arc, Mutex, MutexGuard},
        time::Duration,
    },
};

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Bytes(Vec<u8>),
    Silence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Write(Vec<u8>),
    Read(Vec<u8>),
    Parity(Parity),
    Dtr(bool),
    Rts(bool),
    Clear,
    Timeout(Duration),
    Close,
}

#[derive(Debug)]
struct State {
    script: VecDeque<Step>,
    events: Vec<Event>,
    parity: Parity,
    timeout: Duration,
    baud: u32,
    fail_close: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct MockPort {
    state: Arc<Mutex<State>>,
}

impl MockPort {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                script: VecDeque::new(),
                events: Vec::new(),
                parity: Parity::None,
                timeout: DEFAULT_TIMEOUT,
                baud: DEFAULT_BAUD,
                fail_close: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Queue bytes for upcoming reads.
    pub(crate) fn reply(&self, bytes: &[u8]) -> &Self {
        self.lock().script.push_back(Step::Bytes(bytes.to_vec()));
        self
    }

    /// Queue one timed-out read.
    pub(crate) fn silence(&self) -> &Self {
        self.lock().script.push_back(Step::Silence);
        self
    }

    /// Make `close` report a broken device.
    pub(crate) fn fail_close(&self) -> &Self {
        self.lock().fail_close = true;
        self
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    /// All written bytes, one entry per `write` call.
    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Write(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// All written bytes concatenated.
    pub(crate) fn written(&self) -> Vec<u8> {
        self.writes().concat()
    }

    pub(crate) fn remaining_script(&self) -> usize {
        self.lock().script.len()
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        match state.script.pop_front() {
            Some(Step::Bytes(mut bytes)) => {
                let n = buf.len().min(bytes.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                state.events.push(Event::Read(bytes[..n].to_vec()));
                if n < bytes.len() {
                    bytes.drain(..n);
                    state.script.push_front(Step::Bytes(bytes));
                }
                Ok(n)
            },
            Some(Step::Silence) | None => Err(io::Error::new(io::ErrorKind::TimedOut, "timeout")),
        }
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().events.push(Event::Write(buf.to_vec()));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        let mut state = self.lock();
        state.timeout = timeout;
        state.events.push(Event::Timeout(timeout));
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.lock().timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.lock().baud = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.lock().baud
    }

    fn set_parity(&mut self, parity: Parity) -> Result<()> {
        let mut state = self.lock();
        state.parity = parity;
        state.events.push(Event::Parity(parity));
        Ok(())
    }

    fn parity(&self) -> Parity {
        self.lock().parity
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.lock().events.push(Event::Clear);
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.lock().events.push(Event::Dtr(level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.lock().events.push(Event::Rts(level));
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.events.push(Event::Close);
        if state.fail_close {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone").into());
        }
        Ok(())
    }
}
