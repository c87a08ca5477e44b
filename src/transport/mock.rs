//! Scripted transport for unit tests.
use std::collections::VecDeque;
use std::time::Duration;

use super::{ConnectionState, Transport};
use crate::error::{Error, Result};

/// Everything the code under test did to the link, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Configure(ConnectionState),
    Write(Vec<u8>),
    Rts(bool),
    Delay(Duration),
    Discard,
}

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8>>;

/// Replays queued bytes and answers writes through an optional responder.
/// A read that cannot be filled completely times out.
pub(crate) struct MockTransport {
    pub events: Vec<Event>,
    incoming: VecDeque<u8>,
    responder: Option<Responder>,
}

impl MockTransport {
    /// A link where nothing ever answers.
    pub fn silent() -> Self {
        MockTransport {
            events: Vec::new(),
            incoming: VecDeque::new(),
            responder: None,
        }
    }

    pub fn with_replies(replies: &[u8]) -> Self {
        let mut mock = Self::silent();
        mock.incoming.extend(replies);
        mock
    }

    pub fn with_responder(responder: impl FnMut(&[u8]) -> Vec<u8> + 'static) -> Self {
        let mut mock = Self::silent();
        mock.responder = Some(Box::new(responder));
        mock
    }

    /// All written bytes, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.writes().concat()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Write(raw) => Some(raw.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Transport for MockTransport {
    fn configure(&mut self, line: &ConnectionState) -> Result<()> {
        self.events.push(Event::Configure(*line));
        Ok(())
    }

    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.events.push(Event::Write(raw.to_vec()));
        if let Some(responder) = self.responder.as_mut() {
            let reply = responder(raw);
            self.incoming.extend(reply);
        }
        Ok(())
    }

    fn recv_raw(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<()> {
        if self.incoming.len() < buf.len() {
            self.incoming.clear();
            return Err(Error::NoResponse);
        }
        for b in buf.iter_mut() {
            *b = self.incoming.pop_front().unwrap();
        }
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.events.push(Event::Rts(level));
        Ok(())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.events.push(Event::Discard);
        self.incoming.clear();
        Ok(())
    }

    fn delay(&mut self, duration: Duration) {
        self.events.push(Event::Delay(duration));
    }
}
