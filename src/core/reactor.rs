//! Single-threaded readiness reactor
//!
//! Every subsystem thread owns one [`Reactor`]: an epoll instance plus a
//! registration table of descriptors tagged by kind. The reactor performs
//! exactly one dispatch per ready descriptor: periodic timers have their
//! expiry counter consumed before the handler runs, datagram sockets get one
//! bounded non-blocking receive, and raw descriptors are handed to the
//! subsystem untouched (listener accept, netlink receive).
//!
//! The loop is level-triggered and self-correcting: a handler returning an
//! error is logged and the registration stays in place, so the next readiness
//! event retries naturally. Only failure to create the epoll instance is
//! fatal, and only at startup.

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::socket::{recvfrom, UnixAddr};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use crate::error::Result;

/// Receive buffer for one datagram; larger payloads are truncated by the OS.
pub const RX_BUFFER_SIZE: usize = 1024;

/// Size of one readiness batch.
const MAX_EVENTS: usize = 4;

/// Upper bound on one `epoll_wait`, so a stop request is observed even on a
/// reactor whose descriptors stay quiet.
const WAIT_SLICE_MS: u16 = 500;

/// Identifies a registered descriptor within its reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token(pub usize);

/// What a registered descriptor is, which decides its dispatch path.
pub enum FdKind {
    /// Periodic timer owned by the reactor.
    Timer(TimerFd),
    /// Datagram socket owned by the subsystem; the reactor receives from it.
    Datagram(RawFd),
    /// Anything else; the subsystem reads it itself.
    Raw(RawFd),
}

struct Registration {
    kind: FdKind,
}

/// Dispatch seam between the reactor and a subsystem.
///
/// One implementation per subsystem, replacing a virtual-method hierarchy
/// with a capability trait. Default bodies log and carry on so a subsystem
/// only implements the kinds it registers.
pub trait EventHandler {
    fn on_timer(&mut self, token: Token) -> Result<()> {
        log::warn!("unexpected timer dispatch for token {:?}", token);
        Ok(())
    }

    fn on_datagram(&mut self, token: Token, payload: &[u8], src: Option<&UnixAddr>) -> Result<()> {
        let _ = (payload, src);
        log::warn!("unexpected datagram dispatch for token {:?}", token);
        Ok(())
    }

    fn on_readable(&mut self, token: Token) -> Result<()> {
        log::warn!("unexpected raw dispatch for token {:?}", token);
        Ok(())
    }
}

/// Cooperative stop flag for a running reactor.
///
/// `stop` is idempotent; the loop exits after completing the dispatch batch
/// it is in, or at the end of the current wait slice at the latest.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// The underlying flag, for wiring into signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }
}

/// Readiness-based I/O multiplexer owning the registration table.
pub struct Reactor {
    epoll: Epoll,
    registrations: Vec<Registration>,
    stop: Arc<AtomicBool>,
    rx_buffer: Box<[u8; RX_BUFFER_SIZE]>,
}

impl Reactor {
    /// Create the multiplexing primitive. Failure here is fatal to the
    /// subsystem: it must not start without a reactor.
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            epoll,
            registrations: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            rx_buffer: Box::new([0u8; RX_BUFFER_SIZE]),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.stop.clone(),
        }
    }

    /// Register a periodic timer with the given interval. The reactor owns
    /// the timer descriptor for its whole lifetime.
    pub fn register_timer(&mut self, interval: Duration) -> Result<Token> {
        let timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_CLOEXEC)?;
        timer.set(
            Expiration::Interval(TimeSpec::from_duration(interval)),
            TimerSetTimeFlags::empty(),
        )?;
        let token = Token(self.registrations.len());
        self.epoll.add(
            &timer,
            EpollEvent::new(EpollFlags::EPOLLIN, token.0 as u64),
        )?;
        self.registrations.push(Registration {
            kind: FdKind::Timer(timer),
        });
        Ok(token)
    }

    /// Register a datagram socket for receive dispatch. The subsystem keeps
    /// ownership of the socket (it still sends on it); it must stay open for
    /// the lifetime of the reactor.
    pub fn register_datagram(&mut self, socket: &impl AsRawFd) -> Result<Token> {
        self.register_fd(socket.as_raw_fd(), true)
    }

    /// Register a descriptor whose readiness is handed to the subsystem raw.
    pub fn register_raw(&mut self, fd: &impl AsRawFd) -> Result<Token> {
        self.register_fd(fd.as_raw_fd(), false)
    }

    fn register_fd(&mut self, fd: RawFd, datagram: bool) -> Result<Token> {
        let token = Token(self.registrations.len());
        // The caller guarantees the descriptor outlives the reactor.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.add(
            borrowed,
            EpollEvent::new(EpollFlags::EPOLLIN, token.0 as u64),
        )?;
        self.registrations.push(Registration {
            kind: if datagram {
                FdKind::Datagram(fd)
            } else {
                FdKind::Raw(fd)
            },
        });
        Ok(token)
    }

    /// Block on readiness and dispatch until stopped.
    pub fn run(&mut self, handler: &mut dyn EventHandler) -> Result<()> {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        while !self.stop.load(Ordering::Acquire) {
            let n = match self.epoll.wait(&mut events, EpollTimeout::from(WAIT_SLICE_MS)) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            };
            for event in events.iter().take(n) {
                let token = Token(event.data() as usize);
                if let Err(e) = self.dispatch(token, handler) {
                    log::warn!("dispatch for token {:?} failed: {}", token, e);
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, token: Token, handler: &mut dyn EventHandler) -> Result<()> {
        let registration = match self.registrations.get(token.0) {
            Some(r) => r,
            None => {
                log::error!("readiness for unknown token {:?}", token);
                return Ok(());
            }
        };
        match &registration.kind {
            FdKind::Timer(timer) => {
                // Consume the expiry counter before handing over.
                timer.wait()?;
                handler.on_timer(token)
            }
            FdKind::Datagram(fd) => {
                let (len, src) = match recvfrom::<UnixAddr>(*fd, self.rx_buffer.as_mut_slice()) {
                    Ok(r) => r,
                    Err(Errno::EAGAIN) => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                if len == 0 {
                    log::warn!("empty datagram for token {:?}", token);
                    return Ok(());
                }
                handler.on_datagram(token, &self.rx_buffer[..len], src.as_ref())
            }
            FdKind::Raw(_) => handler.on_readable(token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;

    struct CountingHandler {
        timer_ticks: u32,
        datagrams: Vec<Vec<u8>>,
        stop: Option<StopHandle>,
        stop_after: u32,
    }

    impl EventHandler for CountingHandler {
        fn on_timer(&mut self, _token: Token) -> Result<()> {
            self.timer_ticks += 1;
            if self.timer_ticks >= self.stop_after {
                if let Some(stop) = &self.stop {
                    stop.stop();
                }
            }
            Ok(())
        }

        fn on_datagram(
            &mut self,
            _token: Token,
            payload: &[u8],
            _src: Option<&UnixAddr>,
        ) -> Result<()> {
            self.datagrams.push(payload.to_vec());
            if let Some(stop) = &self.stop {
                stop.stop();
            }
            Ok(())
        }
    }

    #[test]
    fn test_timer_dispatch_counts_ticks() {
        let mut reactor = Reactor::new().unwrap();
        reactor.register_timer(Duration::from_millis(5)).unwrap();
        let mut handler = CountingHandler {
            timer_ticks: 0,
            datagrams: Vec::new(),
            stop: Some(reactor.stop_handle()),
            stop_after: 3,
        };
        reactor.run(&mut handler).unwrap();
        assert!(handler.timer_ticks >= 3);
    }

    #[test]
    fn test_datagram_dispatch_delivers_payload() {
        let (a, b) = UnixDatagram::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let mut reactor = Reactor::new().unwrap();
        reactor.register_datagram(&b).unwrap();
        a.send(b"hello board").unwrap();

        let mut handler = CountingHandler {
            timer_ticks: 0,
            datagrams: Vec::new(),
            stop: Some(reactor.stop_handle()),
            stop_after: u32::MAX,
        };
        reactor.run(&mut handler).unwrap();
        assert_eq!(handler.datagrams, vec![b"hello board".to_vec()]);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let reactor = Reactor::new().unwrap();
        let stop = reactor.stop_handle();
        stop.stop();
        stop.stop();
        assert!(stop.flag().load(Ordering::Acquire));
    }

    #[test]
    fn test_handler_error_does_not_deregister() {
        struct FailingOnce {
            fails_left: u32,
            seen: u32,
            stop: StopHandle,
        }
        impl EventHandler for FailingOnce {
            fn on_datagram(
                &mut self,
                _token: Token,
                _payload: &[u8],
                _src: Option<&UnixAddr>,
            ) -> Result<()> {
                self.seen += 1;
                if self.fails_left > 0 {
                    self.fails_left -= 1;
                    return Err(crate::error::ControlError::Parse);
                }
                self.stop.stop();
                Ok(())
            }
        }

        let (a, b) = UnixDatagram::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let mut reactor = Reactor::new().unwrap();
        reactor.register_datagram(&b).unwrap();
        let mut handler = FailingOnce {
            fails_left: 1,
            seen: 0,
            stop: reactor.stop_handle(),
        };
        a.send(b"first").unwrap();
        a.send(b"second").unwrap();
        reactor.run(&mut handler).unwrap();
        // the failing dispatch did not remove the registration
        assert_eq!(handler.seen, 2);
    }
}
