//! Bluetooth LE remote ingress.
//!
//! Connection loss is the normal case, not the exception. The supervision
//! loop escalates through four reset levels, backs off per the fixed
//! ladder, enters a cooling-off period after too many consecutive
//! failures, and past the total-failure ceiling exits the process so the
//! health supervisor takes over.
//!
//! Notifications are read from a `gatttool --listen` child whose stdout
//! carries one line per keypress; the first value byte is the key code.

use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ingress::{IntentSink, Translator, EXIT_RESTART};

/// Connect backoff ladder, indexed by consecutive failures.
const BACKOFF_LADDER: [Duration; 5] = [
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(60),
];
/// Consecutive failures before the cooling-off period.
const MAX_CONSECUTIVE_FAILURES: u32 = 30;
/// Cooling-off duration: quiescent, controller untouched.
const COOL_OFF: Duration = Duration::from_secs(600);
/// Total failures before the process gives up and exits.
const MAX_TOTAL_FAILURES: u32 = 50;
/// Consecutive failures at one level before escalating to the next.
const ESCALATE_EVERY: u32 = 5;

/// Reset escalation levels, mildest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResetLevel {
    ControllerPowerCycle,
    InterfaceBounce,
    StackRestart,
    ModuleReload,
}

impl ResetLevel {
    fn for_failures(consecutive: u32) -> Self {
        match consecutive / ESCALATE_EVERY {
            0 => Self::ControllerPowerCycle,
            1 => Self::InterfaceBounce,
            2 => Self::StackRestart,
            _ => Self::ModuleReload,
        }
    }
}

/// What the supervision state machine wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Reset at `level`, wait `delay`, reconnect.
    Retry { level: ResetLevel, delay: Duration },
    /// Sit quiet for the duration, then restart from level one.
    CoolOff { duration: Duration },
    /// Defer to the health supervisor: exit the process.
    Exit,
}

/// Pure failure bookkeeping, separated from I/O so the ladder is testable.
#[derive(Debug, Default)]
pub struct Supervision {
    consecutive: u32,
    total: u32,
}

impl Supervision {
    pub fn on_failure(&mut self) -> Recovery {
        self.consecutive += 1;
        self.total += 1;

        if self.total >= MAX_TOTAL_FAILURES {
            return Recovery::Exit;
        }
        if self.consecutive >= MAX_CONSECUTIVE_FAILURES {
            return Recovery::CoolOff { duration: COOL_OFF };
        }

        let index = ((self.consecutive - 1) as usize).min(BACKOFF_LADDER.len() - 1);
        Recovery::Retry {
            level: ResetLevel::for_failures(self.consecutive - 1),
            delay: BACKOFF_LADDER[index],
        }
    }

    /// Cooling off restores level one and zeroes the consecutive counter.
    pub fn after_cool_off(&mut self) {
        self.consecutive = 0;
    }

    /// A successful connect resets everything.
    pub fn on_success(&mut self) {
        self.consecutive = 0;
        self.total = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}

/// Run the BT ingress; returns the process exit code.
pub async fn run(
    adapter: String,
    mac: String,
    sink: IntentSink,
    cancel: CancellationToken,
) -> i32 {
    let mut supervision = Supervision::default();
    let mut translator = Translator::default();

    info!(adapter = %adapter, device = %mac, "BT ingress starting");

    loop {
        if cancel.is_cancelled() {
            return 0;
        }

        match listen(&adapter, &mac, &mut translator, &sink, &cancel).await {
            ListenOutcome::Cancelled => return 0,
            ListenOutcome::Connected => {
                // The session delivered notifications before dropping:
                // counters restart from a clean slate.
                supervision.on_success();
            }
            ListenOutcome::Failed => {}
        }

        match supervision.on_failure() {
            Recovery::Retry { level, delay } => {
                warn!(
                    consecutive = supervision.consecutive(),
                    total = supervision.total(),
                    ?level,
                    "BT connect failed, resetting"
                );
                reset(&adapter, level).await;
                tokio::select! {
                    _ = cancel.cancelled() => return 0,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Recovery::CoolOff { duration } => {
                warn!(secs = duration.as_secs(), "BT ingress cooling off");
                tokio::select! {
                    _ = cancel.cancelled() => return 0,
                    _ = tokio::time::sleep(duration) => {}
                }
                supervision.after_cool_off();
            }
            Recovery::Exit => {
                warn!(
                    total = supervision.total(),
                    "BT failure ceiling reached; deferring to supervisor"
                );
                return EXIT_RESTART;
            }
        }
    }
}

enum ListenOutcome {
    /// At least one notification arrived before the session dropped.
    Connected,
    Failed,
    Cancelled,
}

/// One connect-and-listen session over a gatttool child.
async fn listen(
    adapter: &str,
    mac: &str,
    translator: &mut Translator,
    sink: &IntentSink,
    cancel: &CancellationToken,
) -> ListenOutcome {
    let mut child = match Command::new("gatttool")
        .args(["-i", adapter, "-b", mac, "--listen"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, "gatttool spawn failed");
            return ListenOutcome::Failed;
        }
    };

    let Some(stdout) = child.stdout.take() else {
        let _ = child.kill().await;
        return ListenOutcome::Failed;
    };
    let mut lines = BufReader::new(stdout).lines();
    let mut received_any = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return ListenOutcome::Cancelled;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let Some(code) = parse_notification(&line) else {
                        continue;
                    };
                    received_any = true;
                    if let Some(intent) = translator.feed(code) {
                        debug!(code = format!("{:02x}", code), ?intent, "BT intent");
                        sink.dispatch(intent).await;
                    }
                }
                Ok(None) | Err(_) => {
                    let _ = child.kill().await;
                    return if received_any {
                        ListenOutcome::Connected
                    } else {
                        ListenOutcome::Failed
                    };
                }
            }
        }
    }
}

/// `Notification handle = 0x000b value: 60 00` -> first value byte.
fn parse_notification(line: &str) -> Option<u8> {
    let value = line.split("value:").nth(1)?;
    let first = value.split_whitespace().next()?;
    u8::from_str_radix(first, 16).ok()
}

/// Execute one reset level. Failures are logged and tolerated; the next
/// connect attempt is the real test.
async fn reset(adapter: &str, level: ResetLevel) {
    let commands: Vec<(&str, Vec<&str>)> = match level {
        ResetLevel::ControllerPowerCycle => vec![
            ("bluetoothctl", vec!["power", "off"]),
            ("bluetoothctl", vec!["power", "on"]),
        ],
        ResetLevel::InterfaceBounce => vec![
            ("hciconfig", vec![adapter, "down"]),
            ("hciconfig", vec![adapter, "up"]),
        ],
        ResetLevel::StackRestart => vec![("systemctl", vec!["restart", "bluetooth"])],
        ResetLevel::ModuleReload => vec![
            ("modprobe", vec!["-r", "btusb"]),
            ("modprobe", vec!["btusb"]),
        ],
    };

    for (program, args) in &commands {
        match Command::new(program).args(args).output().await {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(
                program = %program,
                code = output.status.code(),
                "reset command failed"
            ),
            Err(e) => warn!(program = %program, error = %e, "reset command not runnable"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ladder_caps_at_sixty_seconds() {
        let mut supervision = Supervision::default();
        let mut delays = Vec::new();
        for _ in 0..6 {
            if let Recovery::Retry { delay, .. } = supervision.on_failure() {
                delays.push(delay.as_secs());
            }
        }
        assert_eq!(delays, vec![2, 5, 15, 30, 60, 60]);
    }

    #[test]
    fn levels_escalate_every_five_failures() {
        let mut supervision = Supervision::default();
        let mut levels = Vec::new();
        for _ in 0..16 {
            if let Recovery::Retry { level, .. } = supervision.on_failure() {
                levels.push(level);
            }
        }
        assert_eq!(levels[0], ResetLevel::ControllerPowerCycle);
        assert_eq!(levels[5], ResetLevel::InterfaceBounce);
        assert_eq!(levels[10], ResetLevel::StackRestart);
        assert_eq!(levels[15], ResetLevel::ModuleReload);
    }

    #[test]
    fn thirty_consecutive_failures_cool_off_then_restart_at_level_one() {
        let mut supervision = Supervision::default();
        let mut last = None;
        for _ in 0..30 {
            last = Some(supervision.on_failure());
        }
        assert_eq!(
            last,
            Some(Recovery::CoolOff {
                duration: Duration::from_secs(600)
            })
        );

        supervision.after_cool_off();
        assert_eq!(supervision.consecutive(), 0);
        match supervision.on_failure() {
            Recovery::Retry { level, delay } => {
                assert_eq!(level, ResetLevel::ControllerPowerCycle);
                assert_eq!(delay, Duration::from_secs(2));
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn fifty_total_failures_exit() {
        let mut supervision = Supervision::default();
        let mut outcome = None;
        for _ in 0..30 {
            outcome = Some(supervision.on_failure());
        }
        supervision.after_cool_off();
        for _ in 0..20 {
            outcome = Some(supervision.on_failure());
        }
        assert_eq!(outcome, Some(Recovery::Exit));
    }

    #[test]
    fn success_resets_both_counters() {
        let mut supervision = Supervision::default();
        for _ in 0..10 {
            supervision.on_failure();
        }
        supervision.on_success();
        assert_eq!(supervision.consecutive(), 0);
        assert_eq!(supervision.total(), 0);
    }

    #[test]
    fn notification_lines_parse() {
        assert_eq!(
            parse_notification("Notification handle = 0x000b value: 60 00"),
            Some(0x60)
        );
        assert_eq!(
            parse_notification("Indication   handle = 0x0010 value: 0c"),
            Some(0x0c)
        );
        assert_eq!(parse_notification("Connection refused"), None);
    }
}
