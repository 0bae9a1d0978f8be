//! The deputy controller: receives orders from the sheriff, reconciles local
//! process state to match, and reports status and captured output back.
//!
//! Everything runs on the reactor thread. The controller state lives in one
//! `Rc<RefCell<..>>`; every reactor callback holds a weak reference and
//! upgrades on entry, so tearing the deputy down cancels the callbacks.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use nix::sys::signal::Signal;

use crate::pm::log::{pm_debug, pm_event, verbose};
use crate::pm::messages::{
    CmdSpec, CmdStatus, DeputyInfo, Discovery, Orders, Output, DISCOVERY_CHANNEL, INFO_CHANNEL,
    ORDERS_CHANNEL, OUTPUT_CHANNEL,
};
use crate::pm::procinfo::{self, ProcessInfo, SystemInfo};
use crate::pm::procman::{CommandPtr, CommandStatus, Procman};
use crate::pm::reactor::{timestamp_now, EventLoop, FdKind, FdNotifier, Timer, TimerKind};
use crate::pm::transport::{Subscription, Transport};

pub const MIN_RESPAWN_DELAY_MS: i64 = 10;
pub const MAX_RESPAWN_DELAY_MS: i64 = 1000;
pub const RESPAWN_BACKOFF_RATE: i64 = 2;
pub const DISCOVERY_TIME_MS: i64 = 500;
pub const MAX_MESSAGE_AGE_USEC: i64 = 60_000_000;

/// Exit code when a conflicting peer is detected through discovery.
pub const EXIT_CONFLICT: i32 = 2;
/// Exit code when a conflicting peer is detected through its info messages.
pub const EXIT_CONFLICT_VIA_INFO: i32 = 1;

#[derive(Debug, Clone)]
pub struct DeputyOptions {
    /// Identity on the wire; must be unique among deputies.
    pub deputy_id: String,
    pub transport_url: String,
    pub verbose: bool,
}

impl DeputyOptions {
    pub fn defaults() -> DeputyOptions {
        let deputy_id = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "deputy".to_string());
        DeputyOptions {
            deputy_id,
            transport_url: crate::pm::transport::DEFAULT_URL.to_string(),
            verbose: false,
        }
    }
}

/// Controller-side state for one managed command, 1:1 with the supervisor's
/// record.
struct DeputyCommand {
    cmd: CommandPtr,
    group: String,
    auto_respawn: bool,
    stop_signal: i32,
    stop_time_allowed: f32,
    /// Run generation currently realised locally; the sheriff bumps its
    /// desired counterpart to force a restart.
    actual_runid: i32,
    should_be_running: bool,
    respawn_backoff_ms: i64,
    last_start_time: i64,
    first_kill_time: i64,
    num_kills_sent: i32,
    respawn_timer: Timer,
    stdout_notifier: Option<FdNotifier>,
    cpu_time: [ProcessInfo; 2],
    cpu_usage: f32,
    /// Set when orders no longer mention the command; honoured once the
    /// process is confirmed dead.
    remove_requested: bool,
}

/// Pending `output` message being batched for transmission.
struct OutputBatcher {
    msg: Output,
    buf_size: usize,
    last_transmit_utime: i64,
}

impl OutputBatcher {
    fn new(deputy_id: &str) -> OutputBatcher {
        OutputBatcher {
            msg: Output {
                deputy_id: deputy_id.to_string(),
                ..Output::default()
            },
            buf_size: 0,
            last_transmit_utime: 0,
        }
    }

    fn append(&mut self, command_id: &str, text: &str) {
        match self
            .msg
            .command_ids
            .iter()
            .position(|id| id == command_id)
        {
            Some(i) => self.msg.text[i].push_str(text),
            None => {
                self.msg.num_commands += 1;
                self.msg.command_ids.push(command_id.to_string());
                self.msg.text.push(text.to_string());
            }
        }
        self.buf_size += text.len();
    }

    /// Hands back the batch when a flush is due: more than 4096 bytes
    /// buffered, or 10 ms or more since the last transmit.
    fn take_if_due(&mut self, now: i64) -> Option<Output> {
        if self.buf_size == 0 {
            return None;
        }
        let ms_since_last_transmit = (now - self.last_transmit_utime).abs() / 1000;
        if self.buf_size <= 4096 && ms_since_last_transmit < 10 {
            return None;
        }
        let deputy_id = self.msg.deputy_id.clone();
        let mut out = std::mem::replace(
            &mut self.msg,
            Output {
                deputy_id,
                ..Output::default()
            },
        );
        out.utime = now;
        self.buf_size = 0;
        self.last_transmit_utime = now;
        Some(out)
    }
}

/// Respawn throttle: double while restarts come faster than once per
/// second, decay by halving once the process stays up.
fn next_respawn_backoff(backoff_ms: i64, ms_since_started: i64) -> i64 {
    if ms_since_started < MAX_RESPAWN_DELAY_MS {
        (backoff_ms * RESPAWN_BACKOFF_RATE).min(MAX_RESPAWN_DELAY_MS)
    } else {
        let halvings = (ms_since_started / MAX_RESPAWN_DELAY_MS).min(62) as u32;
        (backoff_ms >> halvings).max(MIN_RESPAWN_DELAY_MS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrdersAction {
    Start,
    Stop,
    AdoptRunid,
    None,
}

/// The start/stop decision for one command in an orders message. A stopped
/// command is only started by a runid change; a liveness flip alone waits
/// for the sheriff to bump the runid.
fn transition_action(
    status: CommandStatus,
    should_be_running: bool,
    actual_runid: i32,
    desired_runid: i32,
) -> OrdersAction {
    match status {
        CommandStatus::Stopped if actual_runid != desired_runid && should_be_running => {
            OrdersAction::Start
        }
        CommandStatus::Running
            if !should_be_running || (desired_runid != actual_runid && desired_runid != 0) =>
        {
            OrdersAction::Stop
        }
        _ if desired_runid != 0 => OrdersAction::AdoptRunid,
        _ => OrdersAction::None,
    }
}

fn signal_name(signum: i32) -> String {
    match Signal::try_from(signum) {
        Ok(sig) => sig.to_string(),
        Err(_) => format!("signal {signum}"),
    }
}

struct DeputyState {
    weak: Weak<RefCell<DeputyState>>,
    deputy_id: String,
    deputy_pid: i32,
    deputy_start_time: i64,
    exiting: bool,

    event_loop: EventLoop,
    transport: Rc<Transport>,
    pm: Procman,
    commands: HashMap<String, DeputyCommand>,

    cpu_time: [SystemInfo; 2],
    cpu_load: f32,

    discovery_timer: Option<Timer>,
    one_second_timer: Option<Timer>,
    introspection_timer: Option<Timer>,
    _check_output_timer: Option<Timer>,
    _quit_timer: Option<Timer>,
    _transport_notifier: Option<FdNotifier>,

    _discovery_sub: Option<Subscription>,
    info_sub: Option<Subscription>,
    _orders_sub: Option<Subscription>,

    output: OutputBatcher,
}

fn with_state(weak: &Weak<RefCell<DeputyState>>, f: impl FnOnce(&mut DeputyState)) {
    if let Some(state) = weak.upgrade() {
        f(&mut state.borrow_mut());
    }
}

pub struct ProcmanDeputy {
    state: Rc<RefCell<DeputyState>>,
}

impl ProcmanDeputy {
    pub fn new(options: DeputyOptions) -> anyhow::Result<ProcmanDeputy> {
        crate::pm::log::set_verbose(options.verbose);

        let transport = Rc::new(Transport::new(&options.transport_url)?);
        let event_loop = EventLoop::new();
        let deputy_id = options.deputy_id.clone();

        let state = Rc::new(RefCell::new(DeputyState {
            weak: Weak::new(),
            deputy_id: deputy_id.clone(),
            deputy_pid: std::process::id() as i32,
            deputy_start_time: timestamp_now(),
            exiting: false,
            event_loop: event_loop.clone(),
            transport: Rc::clone(&transport),
            pm: Procman::new(),
            commands: HashMap::new(),
            cpu_time: [SystemInfo::default(); 2],
            cpu_load: 0.0,
            discovery_timer: None,
            one_second_timer: None,
            introspection_timer: None,
            _check_output_timer: None,
            _quit_timer: None,
            _transport_notifier: None,
            _discovery_sub: None,
            info_sub: None,
            _orders_sub: None,
            output: OutputBatcher::new(&deputy_id),
        }));
        state.borrow_mut().weak = Rc::downgrade(&state);

        {
            let mut s = state.borrow_mut();

            // Initial subscriptions: watch for an identity clash until the
            // discovery window closes.
            let weak = Rc::downgrade(&state);
            s.info_sub = Some(transport.subscribe(INFO_CHANNEL, move |msg: DeputyInfo| {
                with_state(&weak, |s| s.info_received(&msg));
            }));
            let weak = Rc::downgrade(&state);
            s._discovery_sub =
                Some(transport.subscribe(DISCOVERY_CHANNEL, move |msg: Discovery| {
                    with_state(&weak, |s| s.discovery_received(&msg));
                }));

            let weak = Rc::downgrade(&state);
            s.discovery_timer = Some(event_loop.add_timer(
                200,
                TimerKind::Repeating,
                true,
                move || with_state(&weak, |s| s.on_discovery_timer()),
            ));

            let weak = Rc::downgrade(&state);
            s.one_second_timer = Some(event_loop.add_timer(
                1000,
                TimerKind::Repeating,
                false,
                move || with_state(&weak, |s| s.on_one_second_timer()),
            ));

            let weak = Rc::downgrade(&state);
            s.introspection_timer = Some(event_loop.add_timer(
                120_000,
                TimerKind::Repeating,
                false,
                move || with_state(&weak, |s| s.on_introspection_timer()),
            ));

            let weak = Rc::downgrade(&state);
            s._check_output_timer = Some(event_loop.add_timer(
                10,
                TimerKind::Repeating,
                true,
                move || with_state(&weak, |s| s.maybe_publish_output_message()),
            ));

            let weak = Rc::downgrade(&state);
            event_loop.set_posix_signals(
                &[
                    Signal::SIGINT,
                    Signal::SIGHUP,
                    Signal::SIGQUIT,
                    Signal::SIGTERM,
                    Signal::SIGCHLD,
                ],
                move |signum| with_state(&weak, |s| s.on_posix_signal(signum)),
            )?;

            let tr = Rc::clone(&transport);
            s._transport_notifier =
                Some(event_loop.add_fd(transport.fileno(), FdKind::Read, move || {
                    if let Err(e) = tr.handle() {
                        pm_event("transport", None, format!("handle failed: {e}"));
                    }
                }));
        }

        // First discovery ping goes out right away.
        state.borrow_mut().on_discovery_timer();

        Ok(ProcmanDeputy { state })
    }

    pub fn run(&self) -> anyhow::Result<()> {
        let event_loop = self.state.borrow().event_loop.clone();
        event_loop.run()
    }
}

impl DeputyState {
    fn transmit_str(&mut self, command_id: &str, text: &str) {
        self.output.append(command_id, text);
        self.maybe_publish_output_message();
    }

    fn printf_and_transmit(&mut self, command_id: &str, text: String) {
        if verbose() {
            eprint!("{text}");
        }
        if !text.is_empty() {
            self.transmit_str(command_id, &text);
        }
    }

    fn maybe_publish_output_message(&mut self) {
        if let Some(msg) = self.output.take_if_due(timestamp_now()) {
            if let Err(e) = self.transport.publish(OUTPUT_CHANNEL, &msg) {
                pm_event("deputy", None, format!("publish output failed: {e}"));
            }
        }
    }

    /// Routes freshly readable pty bytes into the output batcher.
    fn on_process_output_available(&mut self, cmd_id: &str) {
        let fd = match self.commands.get(cmd_id) {
            Some(dc) => dc.cmd.borrow().stdout_fd(),
            None => return,
        };
        if fd < 0 {
            return;
        }
        let mut buf = [0u8; 1024];
        // SAFETY: fd is the pty master, kept open until cleanup.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n > 0 {
            let text = String::from_utf8_lossy(&buf[..n as usize]).into_owned();
            self.transmit_str(cmd_id, &text);
        }
    }

    fn maybe_schedule_respawn(&mut self, cmd_id: &str) {
        let Some(dc) = self.commands.get(cmd_id) else {
            return;
        };
        if dc.auto_respawn && dc.should_be_running {
            dc.respawn_timer.set_interval(dc.respawn_backoff_ms);
            dc.respawn_timer.start();
        }
    }

    fn on_respawn_timer(&mut self, cmd_id: &str) {
        let Some(dc) = self.commands.get(cmd_id) else {
            return;
        };
        if dc.auto_respawn && dc.should_be_running && !self.exiting {
            let runid = dc.actual_runid;
            self.start_command(cmd_id, runid);
        }
    }

    fn start_command(&mut self, cmd_id: &str, desired_runid: i32) {
        if self.exiting {
            return;
        }
        pm_event("deputy", Some(cmd_id), "start");
        let now = timestamp_now();

        let cmd = {
            let Some(dc) = self.commands.get_mut(cmd_id) else {
                return;
            };
            dc.should_be_running = true;
            dc.respawn_timer.stop();
            dc.respawn_backoff_ms =
                next_respawn_backoff(dc.respawn_backoff_ms, (now - dc.last_start_time) / 1000);
            dc.last_start_time = now;
            Rc::clone(&dc.cmd)
        };

        if let Err(e) = self.pm.start_command(&cmd) {
            pm_event("deputy", Some(cmd_id), format!("start failed: {e}"));
        }

        let fd = cmd.borrow().stdout_fd();
        if fd >= 0 {
            // SAFETY: setting O_NONBLOCK on the pty master owned by `cmd`.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
            let weak = self.weak.clone();
            let id = cmd_id.to_string();
            let notifier = self.event_loop.add_fd(fd, FdKind::Read, move || {
                with_state(&weak, |s| s.on_process_output_available(&id));
            });
            if let Some(dc) = self.commands.get_mut(cmd_id) {
                dc.stdout_notifier = Some(notifier);
            }
        }

        if let Some(dc) = self.commands.get_mut(cmd_id) {
            dc.actual_runid = desired_runid;
            dc.num_kills_sent = 0;
            dc.first_kill_time = 0;
        }
    }

    /// Polite stop, escalating to SIGKILL once the grace period runs out.
    /// Called repeatedly (from orders and from the quit path); in between
    /// the first signal and the escalation deadline it does nothing.
    fn stop_command(&mut self, cmd_id: &str) {
        let (cmd, signum) = {
            let Some(dc) = self.commands.get_mut(cmd_id) else {
                return;
            };
            if dc.cmd.borrow().pid() == 0 {
                return;
            }
            dc.should_be_running = false;
            dc.respawn_timer.stop();

            let now = timestamp_now();
            let sigkill_time = dc.first_kill_time + (dc.stop_time_allowed as f64 * 1e6) as i64;
            let signum = if dc.first_kill_time == 0 {
                dc.first_kill_time = now;
                dc.num_kills_sent += 1;
                dc.stop_signal
            } else if now > sigkill_time {
                pm_debug(
                    "deputy",
                    Some(cmd_id),
                    format!("escalating after {} polite signal(s)", dc.num_kills_sent),
                );
                libc::SIGKILL
            } else {
                return;
            };
            (Rc::clone(&dc.cmd), signum)
        };

        pm_event("deputy", Some(cmd_id), format!("stop (signal {signum})"));
        if let Err(e) = self.pm.kill_command(&cmd, signum) {
            self.printf_and_transmit(
                cmd_id,
                format!("failed to send kill signal to command: {e}\n"),
            );
        }
    }

    /// Drains the supervisor's dead-children queue: final output flush,
    /// termination diagnostics, cleanup, then either removal or a scheduled
    /// respawn.
    fn check_for_stopped_commands(&mut self) {
        let mut reaped_any = false;

        while let Some(cmd) = self.pm.check_for_stopped_commands() {
            reaped_any = true;

            let Some(cmd_id) = self.find_cmd_id(&cmd) else {
                self.pm.cleanup_stopped_command(&cmd);
                continue;
            };

            // Catch any bytes the child wrote just before dying.
            let fd = cmd.borrow().stdout_fd();
            if fd >= 0 {
                let mut pfd = libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                };
                // SAFETY: zero-timeout poll on the pty master.
                let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
                if rc > 0 && pfd.revents & libc::POLLIN != 0 {
                    self.on_process_output_available(&cmd_id);
                }
            }

            let status = cmd.borrow().exit_status();
            if status.signaled() {
                self.printf_and_transmit(&cmd_id, format!("{}\n", signal_name(status.term_signal())));
                if status.core_dumped() {
                    self.printf_and_transmit(&cmd_id, "Core dumped.\n".to_string());
                }
            }

            if let Some(dc) = self.commands.get_mut(&cmd_id) {
                // Deregister from the reactor before the pty fd is closed.
                drop(dc.stdout_notifier.take());
            }
            self.pm.cleanup_stopped_command(&cmd);

            let remove = self
                .commands
                .get(&cmd_id)
                .map(|dc| dc.remove_requested)
                .unwrap_or(false);
            if remove {
                pm_event("deputy", Some(&cmd_id), "remove");
                self.commands.remove(&cmd_id);
                self.pm.remove_command(&cmd);
            } else {
                self.maybe_schedule_respawn(&cmd_id);
            }
        }

        if reaped_any {
            self.transmit_deputy_info();
        }
    }

    fn find_cmd_id(&self, cmd: &CommandPtr) -> Option<String> {
        self.commands
            .iter()
            .find(|(_, dc)| Rc::ptr_eq(&dc.cmd, cmd))
            .map(|(id, _)| id.clone())
    }

    /// Grace period is over: SIGKILL everything still alive and leave.
    fn on_quit_timer(&mut self) {
        let ids: Vec<String> = self.commands.keys().cloned().collect();
        for cmd_id in ids {
            let Some(dc) = self.commands.get(&cmd_id) else {
                continue;
            };
            let cmd = Rc::clone(&dc.cmd);
            if cmd.borrow().pid() != 0 {
                pm_event("deputy", Some(&cmd_id), format!("stop (signal {})", libc::SIGKILL));
                if let Err(e) = self.pm.kill_command(&cmd, libc::SIGKILL) {
                    pm_event("deputy", Some(&cmd_id), format!("SIGKILL failed: {e}"));
                }
            }
            self.commands.remove(&cmd_id);
            self.pm.remove_command(&cmd);
        }
        pm_event("deputy", None, "stopping deputy main loop");
        self.event_loop.quit();
    }

    fn transmit_deputy_info(&mut self) {
        let mut msg = DeputyInfo {
            utime: timestamp_now(),
            deputy_id: self.deputy_id.clone(),
            cpu_load: self.cpu_load,
            phys_mem_total_bytes: self.cpu_time[1].memtotal,
            phys_mem_free_bytes: self.cpu_time[1].memfree,
            swap_total_bytes: self.cpu_time[1].swaptotal,
            swap_free_bytes: self.cpu_time[1].swapfree,
            cmds: Vec::with_capacity(self.commands.len()),
        };
        for (cmd_id, dc) in &self.commands {
            let c = dc.cmd.borrow();
            msg.cmds.push(CmdStatus {
                cmd: CmdSpec {
                    exec_str: c.exec_str().to_string(),
                    command_id: cmd_id.clone(),
                    group: dc.group.clone(),
                    auto_respawn: dc.auto_respawn,
                    stop_signal: dc.stop_signal,
                    stop_time_allowed: dc.stop_time_allowed,
                },
                actual_runid: dc.actual_runid,
                pid: c.pid(),
                exit_code: c.exit_status().0,
                cpu_usage: dc.cpu_usage,
                mem_vsize_bytes: dc.cpu_time[1].vsize,
                mem_rss_bytes: dc.cpu_time[1].rss,
            });
        }
        pm_debug("deputy", None, "transmitting deputy info");
        if let Err(e) = self.transport.publish(INFO_CHANNEL, &msg) {
            pm_event("deputy", None, format!("publish deputy info failed: {e}"));
        }
    }

    /// Resamples the two-slot jiffy rings and derives load fractions. Any
    /// degenerate interval (zero elapsed, unpopulated previous sample, or
    /// used > elapsed) reports zero.
    fn update_cpu_times(&mut self) {
        let current = match procinfo::read_system_info() {
            Ok(info) => info,
            Err(e) => {
                pm_debug("deputy", None, format!("system info unavailable: {e}"));
                return;
            }
        };
        self.cpu_time[1] = current;
        let a = self.cpu_time[1];
        let b = self.cpu_time[0];

        let elapsed_jiffies = a.user.saturating_sub(b.user)
            + a.user_low.saturating_sub(b.user_low)
            + a.system.saturating_sub(b.system)
            + a.idle.saturating_sub(b.idle);
        let loaded_jiffies = a.user.saturating_sub(b.user)
            + a.user_low.saturating_sub(b.user_low)
            + a.system.saturating_sub(b.system);
        if elapsed_jiffies == 0 || loaded_jiffies > elapsed_jiffies {
            self.cpu_load = 0.0;
        } else {
            self.cpu_load = loaded_jiffies as f32 / elapsed_jiffies as f32;
        }

        for dc in self.commands.values_mut() {
            let pid = dc.cmd.borrow().pid();
            if pid != 0 {
                match procinfo::read_process_info(pid) {
                    Ok(info) => {
                        dc.cpu_time[1] = info;
                        let pa = dc.cpu_time[1];
                        let pb = dc.cpu_time[0];
                        let used_jiffies =
                            pa.user.saturating_sub(pb.user) + pa.system.saturating_sub(pb.system);
                        if elapsed_jiffies == 0
                            || pb.user == 0
                            || pb.system == 0
                            || used_jiffies > elapsed_jiffies
                        {
                            dc.cpu_usage = 0.0;
                        } else {
                            dc.cpu_usage = used_jiffies as f32 / elapsed_jiffies as f32;
                        }
                    }
                    Err(e) => {
                        dc.cpu_usage = 0.0;
                        dc.cpu_time[1].vsize = 0;
                        dc.cpu_time[1].rss = 0;
                        pm_debug("deputy", None, format!("process info for {pid}: {e}"));
                    }
                }
            } else {
                dc.cpu_usage = 0.0;
                dc.cpu_time[1].vsize = 0;
                dc.cpu_time[1].rss = 0;
            }
            dc.cpu_time[0] = dc.cpu_time[1];
        }

        self.cpu_time[0] = self.cpu_time[1];
    }

    fn on_one_second_timer(&mut self) {
        self.update_cpu_times();
        self.transmit_deputy_info();
    }

    fn on_introspection_timer(&mut self) {
        let pid = std::process::id() as i32;
        let info = procinfo::read_process_info(pid).unwrap_or_default();
        let nrunning = self
            .commands
            .values()
            .filter(|dc| dc.cmd.borrow().pid() != 0)
            .count();
        pm_event(
            "deputy",
            None,
            format!(
                "MARK - rss: {} kB vsz: {} kB procs: {} ({} alive)",
                info.rss / 1024,
                info.vsize / 1024,
                self.commands.len(),
                nrunning
            ),
        );
    }

    fn on_posix_signal(&mut self, signum: i32) {
        if signum == libc::SIGCHLD {
            // A child died; find out which and clean up its remains.
            self.check_for_stopped_commands();
        } else {
            pm_event(
                "deputy",
                None,
                format!(
                    "received signal {signum} ({}), stopping all processes",
                    signal_name(signum)
                ),
            );

            let ids: Vec<String> = self.commands.keys().cloned().collect();
            for cmd_id in &ids {
                self.stop_command(cmd_id);
            }
            self.exiting = true;

            // Bounded shutdown: after this fires, anything still alive is
            // SIGKILLed and removed.
            let weak = self.weak.clone();
            self._quit_timer = Some(self.event_loop.add_timer(
                1000,
                TimerKind::SingleShot,
                true,
                move || with_state(&weak, |s| s.on_quit_timer()),
            ));
        }

        if self.exiting {
            let all_dead = self
                .commands
                .values()
                .all(|dc| dc.cmd.borrow().pid() == 0);
            if all_dead {
                pm_debug("deputy", None, "all child processes are dead, exiting");
                self.event_loop.quit();
            }
        }
    }

    fn orders_received(&mut self, orders: &Orders) {
        if self.exiting {
            return;
        }
        if orders.deputy_id != self.deputy_id {
            pm_debug(
                "deputy",
                None,
                format!("ignoring orders for other deputy {}", orders.deputy_id),
            );
            return;
        }

        let now = timestamp_now();
        if now - orders.utime > MAX_MESSAGE_AGE_USEC {
            let age_sec = (now - orders.utime) / 1_000_000;
            for cmd_msg in &orders.cmds {
                self.printf_and_transmit(
                    &cmd_msg.cmd.command_id,
                    format!(
                        "ignoring stale orders (utime {age_sec} seconds ago). \
                         You may want to check the system clocks!\n"
                    ),
                );
            }
            return;
        }

        let mut action_taken = false;
        pm_debug(
            "deputy",
            None,
            format!("orders received with {} commands", orders.cmds.len()),
        );

        for cmd_msg in &orders.cmds {
            let cmd_id = &cmd_msg.cmd.command_id;

            if !self.commands.contains_key(cmd_id) {
                let cmd = self.pm.add_command(&cmd_msg.cmd.exec_str);
                let weak = self.weak.clone();
                let timer_cmd_id = cmd_id.clone();
                let respawn_timer = self.event_loop.add_timer(
                    MIN_RESPAWN_DELAY_MS,
                    TimerKind::SingleShot,
                    false,
                    move || with_state(&weak, |s| s.on_respawn_timer(&timer_cmd_id)),
                );
                self.commands.insert(
                    cmd_id.clone(),
                    DeputyCommand {
                        cmd,
                        group: cmd_msg.cmd.group.clone(),
                        auto_respawn: cmd_msg.cmd.auto_respawn,
                        stop_signal: cmd_msg.cmd.stop_signal,
                        stop_time_allowed: cmd_msg.cmd.stop_time_allowed,
                        actual_runid: 0,
                        should_be_running: false,
                        respawn_backoff_ms: MIN_RESPAWN_DELAY_MS,
                        last_start_time: 0,
                        first_kill_time: 0,
                        num_kills_sent: 0,
                        respawn_timer,
                        stdout_notifier: None,
                        cpu_time: [ProcessInfo::default(); 2],
                        cpu_usage: 0.0,
                        remove_requested: false,
                    },
                );
                action_taken = true;
                pm_event(
                    "deputy",
                    Some(cmd_id),
                    format!("new command [{}]", cmd_msg.cmd.exec_str),
                );
            }

            let (cmd, status, should_be_running, actual_runid) = {
                let Some(dc) = self.commands.get_mut(cmd_id) else {
                    continue;
                };
                let cmd = Rc::clone(&dc.cmd);

                // Exec string changes are byte-for-byte and only take
                // effect on the next start.
                if cmd.borrow().exec_str() != cmd_msg.cmd.exec_str {
                    pm_event(
                        "deputy",
                        Some(cmd_id),
                        format!("exec str -> [{}]", cmd_msg.cmd.exec_str),
                    );
                    action_taken = true;
                }
                if cmd_msg.cmd.auto_respawn != dc.auto_respawn {
                    pm_event(
                        "deputy",
                        Some(cmd_id),
                        format!("auto-respawn -> {}", cmd_msg.cmd.auto_respawn),
                    );
                    dc.auto_respawn = cmd_msg.cmd.auto_respawn;
                }
                if cmd_msg.cmd.group != dc.group {
                    pm_event(
                        "deputy",
                        Some(cmd_id),
                        format!("group -> [{}]", cmd_msg.cmd.group),
                    );
                    dc.group = cmd_msg.cmd.group.clone();
                    action_taken = true;
                }
                if cmd_msg.cmd.stop_signal != dc.stop_signal {
                    pm_debug(
                        "deputy",
                        Some(cmd_id),
                        format!("stop signal -> {}", cmd_msg.cmd.stop_signal),
                    );
                    dc.stop_signal = cmd_msg.cmd.stop_signal;
                }
                if cmd_msg.cmd.stop_time_allowed != dc.stop_time_allowed {
                    pm_debug(
                        "deputy",
                        Some(cmd_id),
                        format!("stop time allowed -> {}", cmd_msg.cmd.stop_time_allowed),
                    );
                    dc.stop_time_allowed = cmd_msg.cmd.stop_time_allowed;
                }

                dc.should_be_running = !cmd_msg.force_quit;
                let status = if cmd.borrow().pid() > 0 {
                    CommandStatus::Running
                } else {
                    CommandStatus::Stopped
                };
                (cmd, status, dc.should_be_running, dc.actual_runid)
            };
            if cmd.borrow().exec_str() != cmd_msg.cmd.exec_str {
                self.pm.set_command_exec_str(&cmd, &cmd_msg.cmd.exec_str);
            }

            match transition_action(
                status,
                should_be_running,
                actual_runid,
                cmd_msg.desired_runid,
            ) {
                OrdersAction::Start => {
                    self.start_command(cmd_id, cmd_msg.desired_runid);
                    action_taken = true;
                }
                OrdersAction::Stop => {
                    self.stop_command(cmd_id);
                    action_taken = true;
                }
                OrdersAction::AdoptRunid => {
                    if let Some(dc) = self.commands.get_mut(cmd_id) {
                        dc.actual_runid = cmd_msg.desired_runid;
                    }
                }
                OrdersAction::None => {}
            }
        }

        // Cull locally known commands the orders no longer mention.
        let known: Vec<String> = self.commands.keys().cloned().collect();
        for cmd_id in known {
            if orders.cmds.iter().any(|c| c.cmd.command_id == cmd_id) {
                continue;
            }
            let Some(dc) = self.commands.get_mut(&cmd_id) else {
                continue;
            };
            let cmd = Rc::clone(&dc.cmd);
            if cmd.borrow().pid() != 0 {
                pm_event("deputy", Some(&cmd_id), "scheduling removal");
                dc.remove_requested = true;
                self.stop_command(&cmd_id);
            } else {
                pm_event("deputy", Some(&cmd_id), "remove");
                self.commands.remove(&cmd_id);
                self.pm.remove_command(&cmd);
            }
            action_taken = true;
        }

        if action_taken {
            self.transmit_deputy_info();
        }
    }

    fn discovery_received(&mut self, msg: &Discovery) {
        let now = timestamp_now();
        if now < self.deputy_start_time + DISCOVERY_TIME_MS * 1000 {
            // Still probing: a matching id with a foreign nonce is a twin.
            if msg.transmitter_id == self.deputy_id && msg.nonce != self.deputy_pid {
                pm_event(
                    "deputy",
                    None,
                    format!(
                        "ERROR: detected another deputy [{}], aborting to avoid conflicts",
                        msg.transmitter_id
                    ),
                );
                std::process::exit(EXIT_CONFLICT);
            }
        } else {
            // A peer (or sheriff) is probing; answer with current status.
            self.transmit_deputy_info();
        }
    }

    fn info_received(&mut self, msg: &DeputyInfo) {
        let now = timestamp_now();
        if now < self.deputy_start_time + DISCOVERY_TIME_MS * 1000 {
            if msg.deputy_id == self.deputy_id {
                pm_event(
                    "deputy",
                    None,
                    format!(
                        "ERROR: detected another deputy [{}], aborting to avoid conflicts",
                        msg.deputy_id
                    ),
                );
                std::process::exit(EXIT_CONFLICT_VIA_INFO);
            }
        } else {
            pm_debug(
                "deputy",
                None,
                "still receiving deputy info while not in discovery mode",
            );
        }
    }

    fn on_discovery_timer(&mut self) {
        let now = timestamp_now();
        if now < self.deputy_start_time + DISCOVERY_TIME_MS * 1000 {
            let msg = Discovery {
                utime: now,
                transmitter_id: self.deputy_id.clone(),
                nonce: self.deputy_pid,
            };
            if let Err(e) = self.transport.publish(DISCOVERY_CHANNEL, &msg) {
                pm_event("deputy", None, format!("publish discovery failed: {e}"));
            }
        } else {
            // Discovery period is over. Stop watching for peer info and
            // start taking orders.
            if let Some(timer) = &self.discovery_timer {
                timer.stop();
            }
            if let Some(sub) = self.info_sub.take() {
                self.transport.unsubscribe(sub);
            }

            let weak = self.weak.clone();
            self._orders_sub = Some(self.transport.subscribe(
                ORDERS_CHANNEL,
                move |msg: Orders| {
                    with_state(&weak, |s| s.orders_received(&msg));
                },
            ));

            if let Some(timer) = &self.one_second_timer {
                timer.start();
            }
            if let Some(timer) = &self.introspection_timer {
                timer.start();
            }
            self.on_one_second_timer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respawn_backoff_doubles_then_caps() {
        // Cold start (process ran for a long time): stays at the floor.
        assert_eq!(next_respawn_backoff(MIN_RESPAWN_DELAY_MS, i64::MAX / 2), 10);

        // Five rapid crashes in a row.
        let mut backoff = MIN_RESPAWN_DELAY_MS;
        let mut seen = vec![backoff];
        for _ in 0..4 {
            backoff = next_respawn_backoff(backoff, 5);
            seen.push(backoff);
        }
        assert_eq!(seen, vec![10, 20, 40, 80, 160]);

        // Keeps doubling up to the cap and never beyond.
        for _ in 0..10 {
            backoff = next_respawn_backoff(backoff, 5);
            assert!(backoff <= MAX_RESPAWN_DELAY_MS);
        }
        assert_eq!(backoff, MAX_RESPAWN_DELAY_MS);

        // Decays one halving per second of uptime, floored.
        assert_eq!(next_respawn_backoff(1000, 2000), 250);
        assert_eq!(next_respawn_backoff(1000, 10_000), MIN_RESPAWN_DELAY_MS);
        assert_eq!(next_respawn_backoff(80, 1_000_000), MIN_RESPAWN_DELAY_MS);
    }

    #[test]
    fn transitions_follow_runid_and_liveness() {
        use CommandStatus::{Running, Stopped};

        // Stopped + new runid + should run -> start.
        assert_eq!(transition_action(Stopped, true, 0, 1), OrdersAction::Start);
        // Stopped but runid already realised: wait for a runid bump even if
        // liveness flips back on.
        assert_eq!(
            transition_action(Stopped, true, 3, 3),
            OrdersAction::AdoptRunid
        );
        // Stopped and not supposed to run: adopt a nonzero runid silently.
        assert_eq!(
            transition_action(Stopped, false, 0, 2),
            OrdersAction::AdoptRunid
        );
        assert_eq!(transition_action(Stopped, false, 0, 0), OrdersAction::None);

        // Running + force_quit -> stop.
        assert_eq!(transition_action(Running, false, 1, 1), OrdersAction::Stop);
        // Running + runid bump -> stop (restart follows after the reap).
        assert_eq!(transition_action(Running, true, 1, 2), OrdersAction::Stop);
        // Running + desired_runid 0 -> leave it alone.
        assert_eq!(transition_action(Running, true, 1, 0), OrdersAction::None);
        // Running, nothing changed.
        assert_eq!(
            transition_action(Running, true, 2, 2),
            OrdersAction::AdoptRunid
        );
    }

    #[test]
    fn output_batcher_flushes_by_size() {
        let mut batcher = OutputBatcher::new("host1");
        batcher.last_transmit_utime = 1_000_000;

        batcher.append("c1", &"x".repeat(3000));
        // Under both thresholds: 3000 bytes, 5 ms since last transmit.
        assert!(batcher.take_if_due(1_005_000).is_none());

        batcher.append("c1", &"y".repeat(2000));
        let out = batcher.take_if_due(1_006_000).expect("size flush");
        assert_eq!(out.num_commands, 1);
        assert_eq!(out.command_ids, vec!["c1".to_string()]);
        assert_eq!(out.text[0].len(), 5000);
        assert_eq!(out.utime, 1_006_000);

        // Flush resets the pending message.
        assert!(batcher.take_if_due(2_000_000).is_none());
    }

    #[test]
    fn output_batcher_flushes_by_age_with_parallel_entries() {
        let mut batcher = OutputBatcher::new("host1");
        batcher.last_transmit_utime = 1_000_000;

        batcher.append("a", "aaa");
        batcher.append("b", "bbb");
        batcher.append("a", "AAA");
        assert!(batcher.take_if_due(1_002_000).is_none());

        let out = batcher.take_if_due(1_011_000).expect("age flush");
        assert_eq!(out.num_commands, 2);
        assert_eq!(out.command_ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(out.text, vec!["aaaAAA".to_string(), "bbb".to_string()]);
        assert_eq!(out.deputy_id, "host1");
    }

    #[test]
    fn output_batcher_stays_quiet_with_nothing_buffered() {
        let mut batcher = OutputBatcher::new("host1");
        assert!(batcher.take_if_due(5_000_000).is_none());
    }
}
