use crate::address::Address;
use crate::error::NetResult;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::io;
use std::time::Duration;

const LISTEN_TOKEN: Token = Token(0);

/// Listening socket driven by the server's accept thread. Runs on its own small poll, off the
/// completion engine, so accepts stay totally ordered and the termination flag is checked
/// between waits.
pub struct ListeningSocket {
    listener: TcpListener,
    poll: Poll,
    events: Events,
}

impl ListeningSocket {
    pub fn bind(local: Address) -> NetResult<ListeningSocket> {
        let listener = TcpListener::bind(&local.socket_addr())?;
        let poll = Poll::new()?;

        poll.register(&listener, LISTEN_TOKEN, Ready::readable(), PollOpt::level())?;

        Ok(ListeningSocket {
            listener,
            poll,
            events: Events::with_capacity(64),
        })
    }

    /// Waits up to `timeout` for an incoming connection. Returns `None` when the wait expires
    /// without one, so the caller can check its termination flag and come back.
    pub fn accept(&mut self, timeout: Duration) -> NetResult<Option<(TcpStream, Address)>> {
        match self.listener.accept() {
            Ok((stream, addr)) => return Ok(Some((stream, addr.into()))),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err.into()),
        }

        self.poll.poll(&mut self.events, Some(timeout))?;

        match self.listener.accept() {
            Ok((stream, addr)) => Ok(Some((stream, addr.into()))),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn local_addr(&self) -> NetResult<Address> {
        Ok(self.listener.local_addr()?.into())
    }
}
