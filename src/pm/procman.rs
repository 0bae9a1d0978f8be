//! The process supervisor: owns managed commands and their lifecycles.
//!
//! `Procman` is a pure library. It owns no timers and no fds besides pty
//! masters, publishes nothing and subscribes to nothing. The deputy layer
//! drives it from the reactor: signal delivery on stop requests, a
//! non-blocking reap pass whenever SIGCHLD arrives, cleanup once a dead
//! command's output has been drained.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context as _;
use nix::pty::{forkpty, ForkptyResult};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{execvp, Pid};

use crate::pm::exec_string::{expand_variables, separate_args};
use crate::pm::log::{pm_debug, pm_event};
use crate::pm::procinfo;

/// Raw wait-status word from the most recent reap, with the usual decoders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatus(pub i32);

impl ExitStatus {
    pub fn exited(self) -> bool {
        libc::WIFEXITED(self.0)
    }

    pub fn exit_code(self) -> i32 {
        libc::WEXITSTATUS(self.0)
    }

    pub fn signaled(self) -> bool {
        libc::WIFSIGNALED(self.0)
    }

    pub fn term_signal(self) -> i32 {
        libc::WTERMSIG(self.0)
    }

    pub fn core_dumped(self) -> bool {
        libc::WCOREDUMP(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Stopped,
    Running,
}

/// One managed command. `pid == 0` is the single source of truth for "not
/// running"; the pty master fd doubles as stdin (write side) and stdout
/// (read side) and is `-1` while no pty is open.
pub struct Command {
    exec_str: String,
    pid: i32,
    stdin_fd: RawFd,
    stdout_fd: RawFd,
    exit_status: ExitStatus,
    argv: Vec<CString>,
    env_overrides: Vec<(String, String)>,
    /// Pids signalled alongside the main process; swept for orphans after
    /// the main process dies.
    descendants_to_kill: Vec<i32>,
}

pub type CommandPtr = Rc<RefCell<Command>>;

impl Command {
    fn new(exec_str: &str) -> Command {
        Command {
            exec_str: exec_str.to_string(),
            pid: 0,
            stdin_fd: -1,
            stdout_fd: -1,
            exit_status: ExitStatus(0),
            argv: Vec::new(),
            env_overrides: Vec::new(),
            descendants_to_kill: Vec::new(),
        }
    }

    pub fn exec_str(&self) -> &str {
        &self.exec_str
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn stdin_fd(&self) -> RawFd {
        self.stdin_fd
    }

    pub fn stdout_fd(&self) -> RawFd {
        self.stdout_fd
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.exit_status
    }

    /// Re-tokenises the exec string. Leading `KEY=VALUE` tokens become env
    /// overrides; the remaining tokens become argv, each passed through
    /// variable expansion.
    fn prepare_args_and_environment(
        &mut self,
        variables: &HashMap<String, String>,
    ) -> anyhow::Result<()> {
        self.argv.clear();
        self.env_overrides.clear();

        let mut past_env = false;
        for arg in separate_args(&self.exec_str) {
            if !past_env {
                if let Some((key, value)) = arg.split_once('=') {
                    self.env_overrides.push((key.to_string(), value.to_string()));
                    continue;
                }
                past_env = true;
            }
            let expanded = expand_variables(&arg, variables);
            self.argv
                .push(CString::new(expanded).context("argument contains NUL byte")?);
        }
        anyhow::ensure!(
            !self.argv.is_empty(),
            "command line has no executable: [{}]",
            self.exec_str
        );
        Ok(())
    }
}

pub struct Procman {
    commands: Vec<CommandPtr>,
    /// Expansion table consulted before the process environment.
    variables: HashMap<String, String>,
    /// Commands reaped but not yet cleaned up by the caller.
    dead_children: VecDeque<CommandPtr>,
}

impl Default for Procman {
    fn default() -> Self {
        Self::new()
    }
}

impl Procman {
    pub fn new() -> Procman {
        Procman {
            commands: Vec::new(),
            variables: HashMap::new(),
            dead_children: VecDeque::new(),
        }
    }

    pub fn commands(&self) -> &[CommandPtr] {
        &self.commands
    }

    pub fn add_command(&mut self, exec_str: &str) -> CommandPtr {
        let cmd = Rc::new(RefCell::new(Command::new(exec_str)));
        self.commands.push(Rc::clone(&cmd));
        cmd
    }

    pub fn set_command_exec_str(&self, cmd: &CommandPtr, exec_str: &str) {
        cmd.borrow_mut().exec_str = exec_str.to_string();
    }

    pub fn command_status(&self, cmd: &CommandPtr) -> CommandStatus {
        if cmd.borrow().pid > 0 {
            CommandStatus::Running
        } else {
            CommandStatus::Stopped
        }
    }

    pub fn set_variable(&mut self, name: &str, value: &str) {
        self.variables.insert(name.to_string(), value.to_string());
    }

    pub fn remove_all_variables(&mut self) {
        self.variables.clear();
    }

    /// Allocates a pty and forks the command as the pty slave's session
    /// leader. On success the pty master is the command's stdin and stdout
    /// fd. A child-side exec failure surfaces later as a normal termination
    /// with a nonzero exit code.
    pub fn start_command(&mut self, cmd: &CommandPtr) -> anyhow::Result<()> {
        let mut c = cmd.borrow_mut();
        anyhow::ensure!(
            c.pid == 0,
            "[{}] already running with pid {}, not starting again",
            c.exec_str,
            c.pid
        );

        c.prepare_args_and_environment(&self.variables)?;

        // Close any pty left over from the previous run.
        if c.stdout_fd >= 0 {
            // SAFETY: the fd is a pty master owned by this command.
            unsafe { libc::close(c.stdout_fd) };
        }
        c.stdout_fd = -1;
        c.stdin_fd = -1;
        c.exit_status = ExitStatus(0);

        // Back up stderr so a child-side exec failure can still report on
        // the real stderr after the pty swap. In the parent (and in a child
        // that execs successfully) the backup is just closed again.
        // SAFETY: dup of a standard fd.
        let stderr_backup = unsafe { libc::dup(libc::STDERR_FILENO) };

        // SAFETY: the reactor is single-threaded, and the child calls
        // nothing but setenv/exec/write/_exit before the image is replaced.
        let fork = match unsafe { forkpty(None, None) } {
            Ok(fork) => fork,
            Err(e) => {
                // SAFETY: closing the backup fd created above.
                unsafe { libc::close(stderr_backup) };
                return Err(e).with_context(|| format!("forkpty for [{}]", c.exec_str));
            }
        };
        match fork {
            ForkptyResult::Child => {
                for (key, value) in &c.env_overrides {
                    std::env::set_var(key, value);
                }
                let err = match execvp(&c.argv[0], &c.argv) {
                    Err(err) => err,
                    Ok(infallible) => match infallible {},
                };
                // exec failed (bad path, permissions, ...). Put the real
                // stderr back and leave a diagnostic before dying.
                // SAFETY: stderr_backup was dup'd before the pty swap.
                unsafe {
                    libc::dup2(stderr_backup, libc::STDERR_FILENO);
                }
                let msg = format!("ERROR executing [{}]: {}\n", c.exec_str, err.desc());
                // SAFETY: write to stderr, then exit without unwinding into
                // the parent's state.
                unsafe {
                    libc::write(
                        libc::STDERR_FILENO,
                        msg.as_ptr() as *const libc::c_void,
                        msg.len(),
                    );
                    libc::_exit(1)
                }
            }
            ForkptyResult::Parent { child, master } => {
                // SAFETY: closing the backup fd created above.
                unsafe { libc::close(stderr_backup) };
                let master_fd = master.into_raw_fd();
                c.pid = child.as_raw();
                c.stdin_fd = master_fd;
                c.stdout_fd = master_fd;
                Ok(())
            }
        }
    }

    /// Sends `signum` to the command and, best-effort, to every currently
    /// known descendant. Descendants are remembered so the reap path can
    /// SIGKILL any that end up orphaned. Signalling a stopped command is a
    /// no-op.
    pub fn kill_command(&mut self, cmd: &CommandPtr, signum: i32) -> anyhow::Result<()> {
        let mut c = cmd.borrow_mut();
        if c.pid == 0 {
            pm_debug(
                "procman",
                None,
                format!("[{}] has no pid, not signalling (already dead)", c.exec_str),
            );
            return Ok(());
        }
        let signal = Signal::try_from(signum)
            .map_err(|_| anyhow::anyhow!("bad signal number {signum}"))?;

        // Enumerate before signalling the parent, while the tree is intact.
        let descendants = procinfo::descendants_of(c.pid);

        kill(Pid::from_raw(c.pid), signal)
            .with_context(|| format!("signal {signum} to pid {}", c.pid))?;

        for child_pid in descendants {
            let _ = kill(Pid::from_raw(child_pid), signal);
            if !c.descendants_to_kill.contains(&child_pid) {
                c.descendants_to_kill.push(child_pid);
            }
        }
        Ok(())
    }

    /// Non-blocking reap pass. Newly dead commands are pushed onto an
    /// internal queue; the queue front is returned until
    /// [`Procman::cleanup_stopped_command`] removes it, so callers drain by
    /// calling repeatedly.
    pub fn check_for_stopped_commands(&mut self) -> Option<CommandPtr> {
        loop {
            let mut status: libc::c_int = 0;
            // SAFETY: non-blocking wait for any child.
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }

            let Some(cmd) = self
                .commands
                .iter()
                .find(|c| c.borrow().pid == pid)
                .cloned()
            else {
                pm_event("procman", None, format!("reaped unknown child {pid}"));
                continue;
            };

            {
                let mut c = cmd.borrow_mut();
                c.pid = 0;
                c.exit_status = ExitStatus(status);

                let st = c.exit_status;
                if st.signaled() {
                    pm_event(
                        "procman",
                        None,
                        format!(
                            "[{}] terminated by signal {}",
                            c.exec_str,
                            st.term_signal()
                        ),
                    );
                } else if status != 0 {
                    pm_event(
                        "procman",
                        None,
                        format!("[{}] exited with status {}", c.exec_str, st.exit_code()),
                    );
                } else {
                    pm_event("procman", None, format!("[{}] exited", c.exec_str));
                }

                // Sweep descendants that lost their parent but still sit in
                // its process group and session.
                for &child_pid in &c.descendants_to_kill {
                    if procinfo::is_orphaned_child_of(child_pid, pid) {
                        pm_event(
                            "procman",
                            None,
                            format!("sending SIGKILL to orphan process {child_pid}"),
                        );
                        let _ = kill(Pid::from_raw(child_pid), Signal::SIGKILL);
                    }
                }
            }

            self.dead_children.push_back(cmd);
        }

        self.dead_children.front().cloned()
    }

    /// Closes the pty of a reaped command and removes it from the
    /// dead-children queue. Precondition: the command has been reaped
    /// (`pid == 0`).
    pub fn cleanup_stopped_command(&mut self, cmd: &CommandPtr) {
        let Some(pos) = self
            .dead_children
            .iter()
            .position(|c| Rc::ptr_eq(c, cmd))
        else {
            return;
        };
        self.dead_children.remove(pos);

        let mut c = cmd.borrow_mut();
        debug_assert_eq!(c.pid, 0);
        if c.stdout_fd >= 0 {
            // SAFETY: the pty master owned by this command.
            unsafe { libc::close(c.stdout_fd) };
        }
        c.stdout_fd = -1;
        c.stdin_fd = -1;
    }

    /// Waits for the command to be reaped, then cleans up and forgets it.
    /// Idempotent: removing an already-removed command is a no-op. Only the
    /// quit path and the culling of stopped commands call this, so the
    /// ~1 ms reap polling never stalls live traffic.
    pub fn remove_command(&mut self, cmd: &CommandPtr) {
        if !self.commands.iter().any(|c| Rc::ptr_eq(c, cmd)) {
            return;
        }
        while cmd.borrow().pid != 0 {
            std::thread::sleep(Duration::from_millis(1));
            self.check_for_stopped_commands();
        }
        self.cleanup_stopped_command(cmd);
        self.commands.retain(|c| !Rc::ptr_eq(c, cmd));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_split_off_before_argv() {
        let mut variables = HashMap::new();
        variables.insert("TARGET".to_string(), "/tmp/out".to_string());

        let mut cmd = Command::new("LOG_LEVEL=debug A=1 cp --dest=$TARGET src");
        cmd.prepare_args_and_environment(&variables).unwrap();

        assert_eq!(
            cmd.env_overrides,
            vec![
                ("LOG_LEVEL".to_string(), "debug".to_string()),
                ("A".to_string(), "1".to_string()),
            ]
        );
        let argv: Vec<&str> = cmd.argv.iter().map(|a| a.to_str().unwrap()).collect();
        // Tokens with '=' after the first non-env token stay in argv.
        assert_eq!(argv, ["cp", "--dest=/tmp/out", "src"]);
    }

    #[test]
    fn empty_command_line_is_rejected() {
        let mut cmd = Command::new("ONLY=env VARS=here");
        assert!(cmd
            .prepare_args_and_environment(&HashMap::new())
            .is_err());
    }

    #[test]
    fn signalling_a_stopped_command_is_a_no_op() {
        let mut pm = Procman::new();
        let cmd = pm.add_command("sleep 10");
        assert!(pm.kill_command(&cmd, libc::SIGTERM).is_ok());
        assert_eq!(pm.command_status(&cmd), CommandStatus::Stopped);
    }

    fn reap_one(pm: &mut Procman) -> Option<CommandPtr> {
        for _ in 0..500 {
            if let Some(dead) = pm.check_for_stopped_commands() {
                return Some(dead);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        None
    }

    /// Full lifecycle against real child processes: start, signal, reap via
    /// the pull queue, cleanup, remove, plus the child-side exec failure
    /// path. Kept as a single test because the reap loop waits on any child
    /// of the test process; a second concurrently spawning test could have
    /// its children stolen.
    #[test]
    fn lifecycle_start_kill_reap_cleanup_remove() {
        let mut pm = Procman::new();
        let cmd = pm.add_command("sleep 10");

        pm.start_command(&cmd).unwrap();
        {
            let c = cmd.borrow();
            assert!(c.pid() > 0);
            assert!(c.stdout_fd() >= 0);
            assert_eq!(c.stdin_fd(), c.stdout_fd());
        }
        assert_eq!(pm.command_status(&cmd), CommandStatus::Running);

        // Starting a running command must fail without touching it.
        let pid_before = cmd.borrow().pid();
        assert!(pm.start_command(&cmd).is_err());
        assert_eq!(cmd.borrow().pid(), pid_before);

        pm.kill_command(&cmd, libc::SIGTERM).unwrap();

        let dead = reap_one(&mut pm).expect("child was reaped");
        assert!(Rc::ptr_eq(&dead, &cmd));

        {
            let c = cmd.borrow();
            assert_eq!(c.pid(), 0);
            assert!(c.exit_status().signaled());
            assert_eq!(c.exit_status().term_signal(), libc::SIGTERM);
        }

        // The command stays queued until cleanup.
        assert!(pm.check_for_stopped_commands().is_some());
        pm.cleanup_stopped_command(&cmd);
        assert!(pm.check_for_stopped_commands().is_none());
        {
            let c = cmd.borrow();
            assert_eq!(c.stdout_fd(), -1);
            assert_eq!(c.stdin_fd(), -1);
        }

        pm.remove_command(&cmd);
        assert!(pm.commands().is_empty());
        // Double remove is a real path (culled-then-reaped) and must be
        // harmless.
        pm.remove_command(&cmd);

        // A command whose exec fails in the child surfaces as a normal
        // termination with a nonzero exit code.
        let doomed = pm.add_command("/nonexistent/binary/for/this/test");
        pm.start_command(&doomed).unwrap();
        assert!(doomed.borrow().pid() > 0);

        let dead = reap_one(&mut pm).expect("failed child was reaped");
        assert!(Rc::ptr_eq(&dead, &doomed));

        let status = doomed.borrow().exit_status();
        assert!(status.exited());
        assert_ne!(status.exit_code(), 0);

        pm.cleanup_stopped_command(&doomed);
        pm.remove_command(&doomed);
    }
}
