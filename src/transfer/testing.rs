//! Simulated devices for exercising the transfer protocols

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use super::{Cancellation, Link};

/// Every write call made to a `ScriptedLink`, in order
pub(crate) type Transcript = Rc<RefCell<Vec<Vec<u8>>>>;

/// A link that replays a script of device replies
///
/// Entry `n` of the script becomes readable once the host has made `n` write calls, so entry 0 is
/// what the device sends before the host writes anything. Reads with nothing to deliver block for
/// the configured timeout and then fail with `TimedOut`, like a serial port would.
pub(crate) struct ScriptedLink {
    name: String,
    pending: VecDeque<Vec<u8>>,
    available: VecDeque<u8>,
    timeout: Duration,
    transcript: Transcript,
    cancel_after: Option<(usize, Cancellation)>,
}

impl ScriptedLink {
    pub(crate) fn new(name: &str, script: &[&[u8]]) -> ScriptedLink {
        let mut pending: VecDeque<Vec<u8>> = script.iter().map(|turn| turn.to_vec()).collect();
        let available = pending.pop_front().unwrap_or_default().into_iter().collect();

        ScriptedLink {
            name: name.to_string(),
            pending,
            available,
            timeout: Duration::from_millis(10),
            transcript: Rc::new(RefCell::new(Vec::new())),
            cancel_after: None,
        }
    }

    /// Cancels `cancel` once the host has made `writes` write calls
    pub(crate) fn cancel_after(mut self, writes: usize, cancel: &Cancellation) -> ScriptedLink {
        self.cancel_after = Some((writes, cancel.clone()));
        self
    }

    /// Handle to the write calls, usable after the link has been moved into a session
    pub(crate) fn transcript(&self) -> Transcript {
        self.transcript.clone()
    }
}

impl Read for ScriptedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.available.is_empty() {
            thread::sleep(self.timeout);

            return Err(io::Error::new(io::ErrorKind::TimedOut, "Operation timed out"));
        }

        let mut read = 0;

        while read < buf.len() {
            match self.available.pop_front() {
                Some(byte) => {
                    buf[read] = byte;
                    read += 1;
                }
                None => break,
            }
        }

        Ok(read)
    }
}

impl Write for ScriptedLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.transcript.borrow_mut().push(buf.to_vec());

        if let Some(turn) = self.pending.pop_front() {
            self.available.extend(turn);
        }

        if let Some((writes, cancel)) = &self.cancel_after {
            if self.transcript.borrow().len() >= *writes {
                cancel.cancel();
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Link for ScriptedLink {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.available.clear();
        Ok(())
    }
}
