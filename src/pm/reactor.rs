//! Single-threaded reactor multiplexing fd readiness, timers, and POSIX
//! signals.
//!
//! All callbacks run on the thread that calls [`EventLoop::run`]; nothing
//! here is `Send`. Notifier and timer handles deregister themselves on drop,
//! and dropping a notifier from inside a callback (including its own) is
//! safe: if it is already queued for dispatch this iteration, its slot is
//! skipped.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Wall-clock microseconds since the epoch. Used for timer deadlines and
/// message timestamps alike.
pub fn timestamp_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    Read,
    Write,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    SingleShot,
    Repeating,
}

type Callback = Box<dyn FnMut()>;

struct NotifierState {
    fd: RawFd,
    kind: FdKind,
    alive: Cell<bool>,
    callback: RefCell<Callback>,
}

struct TimerState {
    interval_ms: Cell<i64>,
    kind: Cell<TimerKind>,
    active: Cell<bool>,
    /// Fired during the current drain and awaiting rearm or deactivation.
    resched: Cell<bool>,
    /// Microsecond deadline; meaningful only while active.
    deadline: Cell<i64>,
    alive: Cell<bool>,
    callback: RefCell<Callback>,
}

struct LoopInner {
    quit: Cell<bool>,
    notifiers: RefCell<Vec<Rc<NotifierState>>>,
    timers: RefCell<Vec<Rc<TimerState>>>,
    signal_pipe: Cell<(RawFd, RawFd)>,
    signal_notifier: RefCell<Option<FdNotifier>>,
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        let (read_fd, write_fd) = self.signal_pipe.get();
        if read_fd >= 0 {
            SIGNAL_WRITE_FD.store(-1, Ordering::Relaxed);
            // SAFETY: these fds were created by set_posix_signals and are
            // owned by this loop.
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
        }
    }
}

/// Handle for a registered fd callback. Dropping it deregisters the fd.
pub struct FdNotifier {
    state: Rc<NotifierState>,
    loop_: Weak<LoopInner>,
}

impl Drop for FdNotifier {
    fn drop(&mut self) {
        // The alive flag makes any queued dispatch this iteration a no-op.
        self.state.alive.set(false);
        if let Some(inner) = self.loop_.upgrade() {
            inner
                .notifiers
                .borrow_mut()
                .retain(|n| !Rc::ptr_eq(n, &self.state));
        }
    }
}

/// Handle for a timer. Dropping it cancels the timer.
pub struct Timer {
    state: Rc<TimerState>,
    loop_: Weak<LoopInner>,
}

impl Timer {
    /// Arms the timer at `now + interval`. No-op when already active.
    pub fn start(&self) {
        if self.state.active.get() {
            return;
        }
        self.state.resched.set(false);
        self.state
            .deadline
            .set(timestamp_now() + self.state.interval_ms.get() * 1000);
        self.state.active.set(true);
    }

    pub fn stop(&self) {
        if !self.state.active.get() {
            return;
        }
        self.state.active.set(false);
        self.state.resched.set(false);
    }

    /// Changes the interval; an active timer is re-armed from now.
    pub fn set_interval(&self, interval_ms: i64) {
        self.state.interval_ms.set(interval_ms);
        if self.state.active.get() {
            self.state.resched.set(false);
            self.state.deadline.set(timestamp_now() + interval_ms * 1000);
        }
    }

    pub fn set_kind(&self, kind: TimerKind) {
        self.state.kind.set(kind);
    }

    pub fn is_active(&self) -> bool {
        self.state.active.get()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.state.alive.set(false);
        self.state.active.set(false);
        if let Some(inner) = self.loop_.upgrade() {
            inner
                .timers
                .borrow_mut()
                .retain(|t| !Rc::ptr_eq(t, &self.state));
        }
    }
}

static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn signal_handler(signum: libc::c_int) {
    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let buf = signum.to_ne_bytes();
        // SAFETY: write(2) is async-signal-safe; the pipe end is
        // non-blocking, so a flood of signals drops wakeups instead of
        // deadlocking the handler.
        unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    }
}

#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        EventLoop {
            inner: Rc::new(LoopInner {
                quit: Cell::new(false),
                notifiers: RefCell::new(Vec::new()),
                timers: RefCell::new(Vec::new()),
                signal_pipe: Cell::new((-1, -1)),
                signal_notifier: RefCell::new(None),
            }),
        }
    }

    /// Registers `callback` to run whenever `fd` reports the given
    /// readiness. Notifiers fire in registration order within an iteration.
    pub fn add_fd(
        &self,
        fd: RawFd,
        kind: FdKind,
        callback: impl FnMut() + 'static,
    ) -> FdNotifier {
        let state = Rc::new(NotifierState {
            fd,
            kind,
            alive: Cell::new(true),
            callback: RefCell::new(Box::new(callback)),
        });
        self.inner.notifiers.borrow_mut().push(Rc::clone(&state));
        FdNotifier {
            state,
            loop_: Rc::downgrade(&self.inner),
        }
    }

    /// Creates a timer, armed immediately when `active` is true.
    pub fn add_timer(
        &self,
        interval_ms: i64,
        kind: TimerKind,
        active: bool,
        callback: impl FnMut() + 'static,
    ) -> Timer {
        let state = Rc::new(TimerState {
            interval_ms: Cell::new(interval_ms),
            kind: Cell::new(kind),
            active: Cell::new(false),
            resched: Cell::new(false),
            deadline: Cell::new(0),
            alive: Cell::new(true),
            callback: RefCell::new(Box::new(callback)),
        });
        self.inner.timers.borrow_mut().push(Rc::clone(&state));
        let timer = Timer {
            state,
            loop_: Rc::downgrade(&self.inner),
        };
        if active {
            timer.start();
        }
        timer
    }

    /// Routes the given signals through a self-pipe so that `callback` runs
    /// synchronously on the reactor thread. May be called once per process.
    pub fn set_posix_signals(
        &self,
        signals: &[Signal],
        mut callback: impl FnMut(i32) + 'static,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.inner.signal_pipe.get().0 == -1
                && SIGNAL_WRITE_FD.load(Ordering::Relaxed) == -1,
            "POSIX signals already routed to an event loop"
        );

        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds is a valid out-array of two fds.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).context("signal pipe");
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);
        // SAFETY: write_fd is a fresh pipe fd owned here.
        unsafe {
            let flags = libc::fcntl(write_fd, libc::F_GETFL);
            libc::fcntl(write_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        self.inner.signal_pipe.set((read_fd, write_fd));
        SIGNAL_WRITE_FD.store(write_fd, Ordering::Relaxed);

        let action = SigAction::new(
            SigHandler::Handler(signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in signals {
            // SAFETY: the handler only performs an async-signal-safe write.
            unsafe { sigaction(*sig, &action) }
                .with_context(|| format!("install handler for {sig}"))?;
        }

        let notifier = self.add_fd(read_fd, FdKind::Read, move || {
            let mut buf = [0u8; 4];
            // SAFETY: read_fd stays open for the life of the loop.
            let n = unsafe {
                libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n == buf.len() as isize {
                callback(i32::from_ne_bytes(buf));
            }
        });
        *self.inner.signal_notifier.borrow_mut() = Some(notifier);
        Ok(())
    }

    pub fn run(&self) -> anyhow::Result<()> {
        while !self.inner.quit.get() {
            self.iterate_once()?;
        }
        Ok(())
    }

    /// Requests exit; the loop stops after the current step.
    pub fn quit(&self) {
        self.inner.quit.set(true);
    }

    pub fn iterate_once(&self) -> anyhow::Result<()> {
        let soonest = self.soonest_deadline();
        let snapshot: Vec<Rc<NotifierState>> =
            self.inner.notifiers.borrow().iter().cloned().collect();

        if !snapshot.is_empty() {
            let timeout_ms: i32 = match soonest {
                Some(deadline) => {
                    (((deadline - timestamp_now()).max(0)) / 1000).min(i32::MAX as i64) as i32
                }
                None => -1,
            };

            let mut pfds: Vec<libc::pollfd> = snapshot
                .iter()
                .map(|n| libc::pollfd {
                    fd: n.fd,
                    events: match n.kind {
                        FdKind::Read => libc::POLLIN,
                        FdKind::Write => libc::POLLOUT,
                        FdKind::Error => libc::POLLERR,
                    },
                    revents: 0,
                })
                .collect();

            // SAFETY: pfds is a valid array for the duration of the call.
            let rc = unsafe {
                libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms)
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                // A signal landing mid-poll is routine; the self-pipe shows
                // up as readable on the next pass.
                if err.raw_os_error() != Some(libc::EINTR) {
                    return Err(err).context("poll");
                }
            } else if rc > 0 {
                for (notifier, pfd) in snapshot.iter().zip(&pfds) {
                    if pfd.revents & pfd.events == 0 {
                        continue;
                    }
                    if !notifier.alive.get() {
                        continue;
                    }
                    (notifier.callback.borrow_mut())();
                }
            }
        } else if let Some(deadline) = soonest {
            // Nothing to poll; sleep until the next timer is due.
            let wait_usec = deadline - timestamp_now();
            if wait_usec > 0 {
                std::thread::sleep(Duration::from_micros(wait_usec as u64));
            }
        }

        self.process_ready_timers();
        Ok(())
    }

    fn soonest_deadline(&self) -> Option<i64> {
        self.inner
            .timers
            .borrow()
            .iter()
            .filter(|t| t.alive.get() && t.active.get() && !t.resched.get())
            .map(|t| t.deadline.get())
            .min()
    }

    fn process_ready_timers(&self) {
        let process_time = timestamp_now();

        loop {
            if self.inner.quit.get() {
                break;
            }
            let due: Option<Rc<TimerState>> = self
                .inner
                .timers
                .borrow()
                .iter()
                .filter(|t| t.alive.get() && t.active.get() && !t.resched.get())
                .filter(|t| t.deadline.get() <= process_time)
                .min_by_key(|t| t.deadline.get())
                .cloned();
            let Some(timer) = due else {
                break;
            };
            timer.resched.set(true);
            (timer.callback.borrow_mut())();
        }

        // Rearm repeating timers relative to now. Missed ticks are dropped
        // rather than compensated.
        let reschedule_base = timestamp_now();
        let timers: Vec<Rc<TimerState>> =
            self.inner.timers.borrow().iter().cloned().collect();
        for timer in timers {
            if !timer.resched.get() {
                continue;
            }
            timer.resched.set(false);
            if timer.kind.get() == TimerKind::SingleShot || !timer.active.get() {
                timer.active.set(false);
            } else {
                timer
                    .deadline
                    .set(reschedule_base + timer.interval_ms.get() * 1000);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_and_can_cancel_each_other() {
        let event_loop = EventLoop::new();

        let a_count = Rc::new(Cell::new(0));
        let b_count = Rc::new(Cell::new(0));
        let c_count = Rc::new(Cell::new(0));

        let _timer_a = event_loop.add_timer(10, TimerKind::SingleShot, true, {
            let a_count = Rc::clone(&a_count);
            move || a_count.set(a_count.get() + 1)
        });

        let timer_b = event_loop.add_timer(40, TimerKind::Repeating, true, {
            let b_count = Rc::clone(&b_count);
            move || b_count.set(b_count.get() + 1)
        });
        let b_slot: Rc<RefCell<Option<Timer>>> = Rc::new(RefCell::new(Some(timer_b)));

        let _timer_c = event_loop.add_timer(100, TimerKind::SingleShot, true, {
            let c_count = Rc::clone(&c_count);
            let b_slot = Rc::clone(&b_slot);
            move || {
                c_count.set(c_count.get() + 1);
                b_slot.borrow_mut().take();
            }
        });

        let _timer_d = event_loop.add_timer(150, TimerKind::SingleShot, true, {
            let event_loop = event_loop.clone();
            move || event_loop.quit()
        });

        event_loop.run().unwrap();

        assert_eq!(a_count.get(), 1);
        assert_eq!(b_count.get(), 2);
        assert_eq!(c_count.get(), 1);
    }

    #[test]
    fn armed_timer_does_not_fire_early() {
        let event_loop = EventLoop::new();
        let fired = Rc::new(Cell::new(0));

        let _far = event_loop.add_timer(10_000, TimerKind::SingleShot, true, {
            let fired = Rc::clone(&fired);
            move || fired.set(fired.get() + 1)
        });
        let _quit = event_loop.add_timer(20, TimerKind::SingleShot, true, {
            let event_loop = event_loop.clone();
            move || event_loop.quit()
        });

        event_loop.run().unwrap();
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn stopped_timer_stays_quiet_until_restarted() {
        let event_loop = EventLoop::new();
        let count = Rc::new(Cell::new(0));

        let timer = event_loop.add_timer(10, TimerKind::SingleShot, false, {
            let count = Rc::clone(&count);
            move || count.set(count.get() + 1)
        });

        event_loop.iterate_once().unwrap();
        assert_eq!(count.get(), 0);
        assert!(!timer.is_active());

        timer.start();
        assert!(timer.is_active());
        std::thread::sleep(Duration::from_millis(15));
        event_loop.iterate_once().unwrap();
        assert_eq!(count.get(), 1);
        assert!(!timer.is_active());
    }

    #[test]
    fn fd_notifier_delivers_pipe_bytes() {
        let event_loop = EventLoop::new();

        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let received = Rc::new(RefCell::new(Vec::new()));
        let _notifier = event_loop.add_fd(read_fd, FdKind::Read, {
            let received = Rc::clone(&received);
            let event_loop = event_loop.clone();
            move || {
                let mut buf = [0u8; 80];
                let n = unsafe {
                    libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n > 0 {
                    received.borrow_mut().extend_from_slice(&buf[..n as usize]);
                }
                event_loop.quit();
            }
        });

        let text = b"hello";
        let n = unsafe {
            libc::write(write_fd, text.as_ptr() as *const libc::c_void, text.len())
        };
        assert_eq!(n, text.len() as isize);

        event_loop.run().unwrap();
        assert_eq!(received.borrow().as_slice(), text);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn dropping_a_queued_notifier_suppresses_its_dispatch() {
        let event_loop = EventLoop::new();

        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let second_fired = Rc::new(Cell::new(0));
        let second_slot: Rc<RefCell<Option<FdNotifier>>> = Rc::new(RefCell::new(None));

        // Registered first, so it dispatches first and drops the second
        // notifier while it is still queued for this iteration.
        let _first = event_loop.add_fd(read_fd, FdKind::Read, {
            let second_slot = Rc::clone(&second_slot);
            move || {
                second_slot.borrow_mut().take();
            }
        });
        let second = event_loop.add_fd(read_fd, FdKind::Read, {
            let second_fired = Rc::clone(&second_fired);
            move || second_fired.set(second_fired.get() + 1)
        });
        *second_slot.borrow_mut() = Some(second);

        let n = unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);

        event_loop.iterate_once().unwrap();
        assert_eq!(second_fired.get(), 0);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn posix_signal_arrives_as_a_synchronous_callback() {
        let event_loop = EventLoop::new();
        let handled = Rc::new(Cell::new(0));

        event_loop
            .set_posix_signals(&[Signal::SIGUSR1], {
                let handled = Rc::clone(&handled);
                let event_loop = event_loop.clone();
                move |signum| {
                    handled.set(signum);
                    event_loop.quit();
                }
            })
            .unwrap();

        let _kick = event_loop.add_timer(10, TimerKind::SingleShot, true, || {
            nix::sys::signal::raise(Signal::SIGUSR1).unwrap();
        });

        event_loop.run().unwrap();
        assert_eq!(handled.get(), libc::SIGUSR1);
    }
}
