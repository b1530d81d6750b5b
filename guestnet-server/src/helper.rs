//! Supervision of the helper subprocesses (ADB proxy, multicast proxy, ND
//! proxy).
//!
//! Each helper gets one end of a socketpair as `--control-fd <n>` and runs
//! with `no_new_privs`. When the manager runs as root the helper is switched
//! to an unprivileged user, keeping only `CAP_NET_RAW` where it needs raw
//! sockets. Helpers that exit unexpectedly are restarted with exponential
//! backoff.
#![allow(unsafe_code)]

use anyhow::{Context, Result};
use guestnet_common::ipc::{read_message, write_message, IpHelperMessage};
use guestnet_common::Error;
use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const RESTART_DELAY: Duration = Duration::from_millis(900);
pub const MAX_RESTARTS: u32 = 5;

const CAP_NET_RAW: u32 = 13;
const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// Delay before restart number `restarts + 1`.
pub fn restart_delay(restarts: u32) -> Duration {
    RESTART_DELAY * (2u32 << restarts.min(MAX_RESTARTS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HelperKind {
    AdbProxy,
    McastProxy,
    NdProxy,
}

impl HelperKind {
    pub fn name(self) -> &'static str {
        match self {
            HelperKind::AdbProxy => "adb_proxy",
            HelperKind::McastProxy => "mcast_proxy",
            HelperKind::NdProxy => "nd_proxy",
        }
    }

    fn keeps_net_raw(self) -> bool {
        !matches!(self, HelperKind::AdbProxy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperSpec {
    pub kind: HelperKind,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl HelperSpec {
    /// This binary re-executed in ND proxy mode.
    pub fn nd_proxy() -> Result<Self> {
        Ok(Self {
            kind: HelperKind::NdProxy,
            program: std::env::current_exe().context("Failed to resolve own executable")?,
            args: vec!["nd-proxy".to_string()],
        })
    }

    /// Parse a whitespace-separated command line. Empty lines yield `None`.
    pub fn from_command_line(kind: HelperKind, line: &str) -> Option<Self> {
        let mut words = line.split_whitespace().map(str::to_string);
        let program = PathBuf::from(words.next()?);
        Some(Self {
            kind,
            program,
            args: words.collect(),
        })
    }
}

/// User and group a helper runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub fn for_user(name: &str) -> Result<Self> {
        let user = nix::unistd::User::from_name(name)
            .with_context(|| format!("Failed to look up user {name}"))?
            .with_context(|| format!("User {name} does not exist"))?;
        Ok(Self {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        })
    }
}

#[derive(Debug)]
pub enum HelperEvent {
    Message(HelperKind, IpHelperMessage),
    Exited(HelperKind),
    RestartDue(HelperKind),
}

#[repr(C)]
struct CapHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct CapData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

fn check(ret: libc::c_long) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

unsafe fn prctl(option: libc::c_int, arg: libc::c_ulong) -> libc::c_long {
    libc::prctl(option, arg, 0 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong).into()
}

/// Runs in the forked child before exec. Only raw syscalls here.
fn enter_sandbox(control_fd: RawFd, creds: Option<Credentials>, keep_net_raw: bool) -> io::Result<()> {
    // SAFETY: plain syscalls on integer arguments and on stack-owned
    // structs that outlive each call.
    unsafe {
        check(prctl(libc::PR_SET_NO_NEW_PRIVS, 1))?;
        check(libc::fcntl(control_fd, libc::F_SETFD, 0).into())?;

        let Some(creds) = creds else {
            return Ok(());
        };
        if keep_net_raw {
            check(prctl(libc::PR_SET_KEEPCAPS, 1))?;
        }
        check(libc::setgroups(0, std::ptr::null()).into())?;
        check(libc::setresgid(creds.gid, creds.gid, creds.gid).into())?;
        check(libc::setresuid(creds.uid, creds.uid, creds.uid).into())?;

        if keep_net_raw {
            let header = CapHeader {
                version: LINUX_CAPABILITY_VERSION_3,
                pid: 0,
            };
            let bit = 1u32 << CAP_NET_RAW;
            let data = [
                CapData {
                    effective: bit,
                    permitted: bit,
                    inheritable: bit,
                },
                CapData::default(),
            ];
            check(libc::syscall(
                libc::SYS_capset,
                std::ptr::addr_of!(header),
                data.as_ptr(),
            ))?;
            check(
                libc::prctl(
                    libc::PR_CAP_AMBIENT,
                    libc::PR_CAP_AMBIENT_RAISE as libc::c_ulong,
                    libc::c_ulong::from(CAP_NET_RAW),
                    0 as libc::c_ulong,
                    0 as libc::c_ulong,
                )
                .into(),
            )?;
        }
    }
    Ok(())
}

struct Running {
    writer: OwnedWriteHalf,
    pid: Option<u32>,
}

struct Slot {
    spec: HelperSpec,
    running: Option<Running>,
    restarts: u32,
}

pub struct HelperSupervisor {
    slots: BTreeMap<HelperKind, Slot>,
    credentials: Option<Credentials>,
    events: mpsc::UnboundedSender<HelperEvent>,
    shutting_down: bool,
}

impl HelperSupervisor {
    pub fn new(credentials: Option<Credentials>, events: mpsc::UnboundedSender<HelperEvent>) -> Self {
        Self {
            slots: BTreeMap::new(),
            credentials,
            events,
            shutting_down: false,
        }
    }

    /// Start `spec` and supervise it from now on.
    pub fn add(&mut self, spec: HelperSpec) -> Result<()> {
        let running = self.spawn(&spec)?;
        self.slots.insert(
            spec.kind,
            Slot {
                spec,
                running: Some(running),
                restarts: 0,
            },
        );
        Ok(())
    }

    #[tracing::instrument(name = "helper.spawn", skip(self, spec), fields(helper = spec.kind.name()))]
    fn spawn(&self, spec: &HelperSpec) -> Result<Running> {
        let (parent, child) =
            std::os::unix::net::UnixStream::pair().context("Failed to create control socketpair")?;
        let child_fd = child.as_raw_fd();
        let creds = self.credentials;
        let keep_net_raw = spec.kind.keeps_net_raw();

        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .arg("--control-fd")
            .arg(child_fd.to_string())
            .stdin(Stdio::null());
        // SAFETY: enter_sandbox only issues syscalls and touches no state
        // shared with the parent.
        unsafe {
            cmd.pre_exec(move || enter_sandbox(child_fd, creds, keep_net_raw));
        }
        let mut process = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", spec.program.display()))?;
        drop(child);

        parent
            .set_nonblocking(true)
            .context("Failed to make control socket non-blocking")?;
        let stream = tokio::net::UnixStream::from_std(parent).context("Failed to register control socket")?;
        let (mut reader, writer) = stream.into_split();
        let pid = process.id();
        info!("Started {} with PID {}", spec.kind.name(), pid.unwrap_or(0));

        let kind = spec.kind;
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match read_message(&mut reader).await {
                    Ok(Some(msg)) => {
                        if events.send(HelperEvent::Message(kind, msg)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Control socket of {} failed: {:#}", kind.name(), e);
                        break;
                    }
                }
            }
            match process.wait().await {
                Ok(status) => debug!("{} exited with {}", kind.name(), status),
                Err(e) => warn!("Failed to wait for {}: {}", kind.name(), e),
            }
            let _ = events.send(HelperEvent::Exited(kind));
        });

        Ok(Running { writer, pid })
    }

    pub fn is_running(&self, kind: HelperKind) -> bool {
        self.slots.get(&kind).is_some_and(|s| s.running.is_some())
    }

    pub fn pid(&self, kind: HelperKind) -> Option<u32> {
        self.slots.get(&kind)?.running.as_ref()?.pid
    }

    pub async fn send(&mut self, kind: HelperKind, msg: &IpHelperMessage) -> guestnet_common::Result<()> {
        let Some(running) = self.slots.get_mut(&kind).and_then(|s| s.running.as_mut()) else {
            return Err(Error::HelperUnavailable(format!("{} is not running", kind.name())));
        };
        if let Err(e) = write_message(&mut running.writer, msg).await {
            warn!("Failed to message {}: {:#}", kind.name(), e);
            if let Some(slot) = self.slots.get_mut(&kind) {
                slot.running = None;
            }
            return Err(Error::HelperUnavailable(format!("{} is not reachable", kind.name())));
        }
        Ok(())
    }

    /// Send `msg` to every running helper; failures are logged.
    pub async fn broadcast(&mut self, msg: &IpHelperMessage) {
        let kinds: Vec<HelperKind> = self.slots.keys().copied().collect();
        for kind in kinds {
            if self.is_running(kind) {
                let _ = self.send(kind, msg).await;
            }
        }
    }

    fn schedule_restart(&self, kind: HelperKind, restarts: u32) {
        let delay = restart_delay(restarts);
        let events = self.events.clone();
        warn!("Restarting {} in {:?}", kind.name(), delay);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(HelperEvent::RestartDue(kind));
        });
    }

    pub fn on_exited(&mut self, kind: HelperKind) {
        if self.shutting_down {
            return;
        }
        let Some(slot) = self.slots.get_mut(&kind) else {
            return;
        };
        slot.running = None;
        if slot.restarts >= MAX_RESTARTS {
            error!("{} exited too many times, giving up", kind.name());
            return;
        }
        error!("{} exited unexpectedly", kind.name());
        let restarts = slot.restarts;
        self.schedule_restart(kind, restarts);
    }

    #[tracing::instrument(name = "helper.restart", skip(self), fields(helper = kind.name()))]
    pub fn on_restart_due(&mut self, kind: HelperKind) {
        if self.shutting_down {
            return;
        }
        let Some(spec) = self.slots.get(&kind).map(|s| s.spec.clone()) else {
            return;
        };
        let result = self.spawn(&spec);
        let Some(slot) = self.slots.get_mut(&kind) else {
            return;
        };
        slot.restarts += 1;
        match result {
            Ok(running) => slot.running = Some(running),
            Err(e) => {
                error!("Failed to restart {}: {:#}", kind.name(), e);
                if slot.restarts < MAX_RESTARTS {
                    let restarts = slot.restarts;
                    self.schedule_restart(kind, restarts);
                }
            }
        }
    }

    /// Close every control socket. Helpers exit on EOF.
    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        for slot in self.slots.values_mut() {
            if slot.running.take().is_some() {
                info!("Stopping {}", slot.spec.kind.name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestnet_common::ipc::{GuestEvent, GuestMessage, GuestType};
    use guestnet_common::ErrorKind;

    fn echo_helper() -> HelperSpec {
        // Echo every frame back on the control fd passed as $2
        HelperSpec {
            kind: HelperKind::McastProxy,
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), "exec cat <&$2 >&$2".into(), "mcast".into()],
        }
    }

    #[test]
    fn test_restart_delay_doubles() {
        assert_eq!(restart_delay(0), Duration::from_millis(1800));
        assert_eq!(restart_delay(1), Duration::from_millis(3600));
        assert_eq!(restart_delay(2), Duration::from_millis(7200));
    }

    #[test]
    fn test_command_line_parsing() {
        let spec = HelperSpec::from_command_line(HelperKind::AdbProxy, " /usr/bin/adb_proxy --log  v ").unwrap();
        assert_eq!(spec.program, PathBuf::from("/usr/bin/adb_proxy"));
        assert_eq!(spec.args, vec!["--log", "v"]);
        assert!(HelperSpec::from_command_line(HelperKind::AdbProxy, "  ").is_none());
    }

    #[tokio::test]
    async fn test_send_without_helper_is_unavailable() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut supervisor = HelperSupervisor::new(None, tx);
        let msg: IpHelperMessage = GuestMessage::new(GuestEvent::Start, GuestType::Arc, 1).into();
        let err = supervisor.send(HelperKind::NdProxy, &msg).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HelperUnavailable);
    }

    #[tokio::test]
    async fn test_messages_flow_and_exit_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = HelperSupervisor::new(None, tx);
        supervisor.add(echo_helper()).unwrap();
        assert!(supervisor.is_running(HelperKind::McastProxy));

        let msg: IpHelperMessage = GuestMessage::new(GuestEvent::Start, GuestType::ArcVm, 3).into();
        supervisor.broadcast(&msg).await;
        match rx.recv().await.unwrap() {
            HelperEvent::Message(kind, got) => {
                assert_eq!(kind, HelperKind::McastProxy);
                assert_eq!(got, msg);
            }
            other => panic!("unexpected event {other:?}"),
        }

        supervisor.shutdown();
        assert!(!supervisor.is_running(HelperKind::McastProxy));
        assert!(matches!(rx.recv().await.unwrap(), HelperEvent::Exited(HelperKind::McastProxy)));
        // No restart once shutting down
        supervisor.on_exited(HelperKind::McastProxy);
        assert!(!supervisor.is_running(HelperKind::McastProxy));
    }

    #[tokio::test]
    async fn test_unexpected_exit_schedules_restart() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = HelperSupervisor::new(None, tx);
        supervisor.add(HelperSpec {
            kind: HelperKind::AdbProxy,
            program: PathBuf::from("/bin/true"),
            args: Vec::new(),
        })
        .unwrap();

        assert!(matches!(rx.recv().await.unwrap(), HelperEvent::Exited(HelperKind::AdbProxy)));
        supervisor.on_exited(HelperKind::AdbProxy);
        assert!(!supervisor.is_running(HelperKind::AdbProxy));
        assert!(matches!(rx.recv().await.unwrap(), HelperEvent::RestartDue(HelperKind::AdbProxy)));
        supervisor.on_restart_due(HelperKind::AdbProxy);
        assert!(supervisor.is_running(HelperKind::AdbProxy));
        supervisor.shutdown();
    }
}
