//! Host-side probing: one scanner child per candidate binary.
//!
//! The prober never loads plugin code itself. It spawns the scanner,
//! drains its report pipe, and classifies how the child ended. A crash or
//! hang costs exactly one candidate; every record the child finished
//! writing beforehand is kept.

use crate::error::{is_arch_mismatch, DiscoveryError, Result};
use crate::format::PluginFormat;
use crate::record::{Notification, PluginRecord, RecordCollector};
use bravura_bridge::{BridgeError, ControlPipe, Message, Severity};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-probe settings.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Wall-clock budget for one candidate, handshake included.
    pub timeout: Duration,
    /// Run the behavioral exercise pass, not just inspection.
    pub do_init: bool,
    /// Scanner executable.
    pub scanner: PathBuf,
    /// Alternate-architecture scanner, tried once when a candidate fails
    /// with an architecture-mismatch loader error.
    pub alt_arch_scanner: Option<PathBuf>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            do_init: true,
            scanner: default_scanner_path(),
            alt_arch_scanner: None,
        }
    }
}

/// The scanner binary normally sits next to the host executable.
fn default_scanner_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("bravura-discovery")))
        .unwrap_or_else(|| PathBuf::from("bravura-discovery"))
}

/// How a probe ended. All variants carry whatever the child managed to
/// report before ending.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// Clean exit, status zero.
    Exited {
        records: Vec<PluginRecord>,
        notifications: Vec<Notification>,
    },
    /// Nonzero exit or killed by a signal.
    Crashed {
        records: Vec<PluginRecord>,
        notifications: Vec<Notification>,
    },
    /// Deadline passed; the child was killed and reaped.
    TimedOut {
        records: Vec<PluginRecord>,
        notifications: Vec<Notification>,
    },
    /// The probe was cancelled; the pipe was drained before the kill.
    Aborted {
        records: Vec<PluginRecord>,
        notifications: Vec<Notification>,
    },
}

impl ProbeOutcome {
    pub fn records(&self) -> &[PluginRecord] {
        match self {
            ProbeOutcome::Exited { records, .. }
            | ProbeOutcome::Crashed { records, .. }
            | ProbeOutcome::TimedOut { records, .. }
            | ProbeOutcome::Aborted { records, .. } => records,
        }
    }

    pub fn notifications(&self) -> &[Notification] {
        match self {
            ProbeOutcome::Exited { notifications, .. }
            | ProbeOutcome::Crashed { notifications, .. }
            | ProbeOutcome::TimedOut { notifications, .. }
            | ProbeOutcome::Aborted { notifications, .. } => notifications,
        }
    }

    fn notifications_mut(&mut self) -> &mut Vec<Notification> {
        match self {
            ProbeOutcome::Exited { notifications, .. }
            | ProbeOutcome::Crashed { notifications, .. }
            | ProbeOutcome::TimedOut { notifications, .. }
            | ProbeOutcome::Aborted { notifications, .. } => notifications,
        }
    }
}

/// One in-flight scanner child.
#[derive(Debug)]
pub struct ProbeRequest {
    pipe: ControlPipe,
    child: Child,
    collector: RecordCollector,
    deadline: Instant,
    saw_exiting: bool,
    done: bool,
}

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

impl ProbeRequest {
    /// Launch the scanner for one candidate.
    pub fn spawn(
        format: PluginFormat,
        path: &Path,
        scanner: &Path,
        config: &ProbeConfig,
    ) -> Result<Self> {
        let mut command = Command::new(scanner);
        command.arg(format.as_str()).arg(path);

        // third-party loader messages must stay pattern-matchable
        command.env("LC_ALL", "C").env_remove("LC_MESSAGES").env_remove("LANG");

        if !config.do_init {
            command.env("BRAVURA_DISCOVERY_NO_INIT", "1");
        }

        Self::spawn_with(command, config.timeout)
    }

    /// Launch an arbitrary command as the scanner child. The four pipe fds
    /// are appended to its argv. `timeout` starts counting before the
    /// spawn, so the handshake wait is inside the budget.
    pub fn spawn_with(command: Command, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;

        let handshake = timeout.min(HANDSHAKE_TIMEOUT);
        let (pipe, child) = ControlPipe::spawn(command, handshake).map_err(|e| match e {
            BridgeError::Io(io) => DiscoveryError::Spawn(io),
            other => DiscoveryError::Bridge(other),
        })?;

        Ok(Self {
            pipe,
            child,
            collector: RecordCollector::new(),
            deadline,
            saw_exiting: false,
            done: false,
        })
    }

    fn drain(&mut self) {
        loop {
            match self.pipe.poll_once() {
                Ok(Some(Message::Exiting)) => self.saw_exiting = true,
                Ok(Some(msg)) => {
                    if !self.collector.feed(&msg) {
                        tracing::debug!(key = msg.key(), "ignoring non-discovery message");
                    }
                }
                Ok(None) => break,
                // one bad message is the scanner's problem, not the scan's
                Err(BridgeError::Protocol(e)) => tracing::warn!(error = %e, "malformed report"),
                Err(e) => {
                    tracing::debug!(error = %e, "report pipe error, stopping drain");
                    break;
                }
            }
        }
    }

    fn take_results(&mut self) -> (Vec<PluginRecord>, Vec<Notification>) {
        std::mem::take(&mut self.collector).finish()
    }

    /// Advance the probe. Non-blocking; call on an idle tick until it
    /// yields an outcome, after which it always returns `None`.
    pub fn poll(&mut self) -> Option<ProbeOutcome> {
        if self.done {
            return None;
        }

        self.drain();

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.done = true;
                let (records, notifications) = self.take_results();
                if status.success() {
                    if !self.saw_exiting {
                        tracing::debug!("scanner exited zero without the exiting sentinel");
                    }
                    Some(ProbeOutcome::Exited {
                        records,
                        notifications,
                    })
                } else {
                    tracing::warn!(%status, "scanner died abnormally");
                    Some(ProbeOutcome::Crashed {
                        records,
                        notifications,
                    })
                }
            }
            Ok(None) => {
                if Instant::now() < self.deadline {
                    return None;
                }
                tracing::warn!("scanner exceeded its deadline, killing it");
                self.done = true;
                self.drain();
                self.kill();
                let (records, notifications) = self.take_results();
                Some(ProbeOutcome::TimedOut {
                    records,
                    notifications,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "lost track of scanner child");
                self.done = true;
                self.kill();
                let (records, notifications) = self.take_results();
                Some(ProbeOutcome::Crashed {
                    records,
                    notifications,
                })
            }
        }
    }

    /// Block until the probe ends, polling on a short interval.
    pub fn wait(&mut self) -> ProbeOutcome {
        loop {
            if let Some(outcome) = self.poll() {
                return outcome;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Cancel the probe. The pipe is drained before the kill so nothing
    /// the child already wrote is lost.
    pub fn abort(mut self) -> (Vec<PluginRecord>, Vec<Notification>) {
        self.drain();
        self.kill();
        self.take_results()
    }

    fn kill(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        // a wedged plugin gets no grace period
        let _ = kill(Pid::from_raw(self.child.id() as i32), Signal::SIGKILL);
        let _ = self.child.wait();
    }
}

/// Result of probing one candidate within a session.
#[derive(Debug)]
pub struct CandidateResult {
    pub format: PluginFormat,
    pub path: PathBuf,
    pub outcome: ProbeOutcome,
    /// The candidate was retried under the alternate-architecture scanner.
    pub retried_alt_arch: bool,
}

/// One explicit scan run over a list of candidates. No global state: two
/// sessions with different configs can coexist.
pub struct ScanSession {
    config: ProbeConfig,
    cancel: Arc<AtomicBool>,
    results: Vec<CandidateResult>,
}

impl ScanSession {
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            results: Vec::new(),
        }
    }

    /// Flag another thread can set to stop the session. Honored between
    /// candidates and mid-probe.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn results(&self) -> &[CandidateResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<CandidateResult> {
        self.results
    }

    /// Probe each candidate in turn. On cancellation, results gathered so
    /// far stay available through [`Self::results`] - including whatever
    /// the cancelled probe itself had already reported, as an `Aborted`
    /// result.
    pub fn run(&mut self, candidates: &[(PluginFormat, PathBuf)]) -> Result<()> {
        for (format, path) in candidates {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(DiscoveryError::Cancelled);
            }
            let result = self.probe_candidate(*format, path)?;
            let aborted = matches!(result.outcome, ProbeOutcome::Aborted { .. });
            self.results.push(result);
            if aborted {
                return Err(DiscoveryError::Cancelled);
            }
        }
        Ok(())
    }

    fn probe_candidate(&self, format: PluginFormat, path: &Path) -> Result<CandidateResult> {
        let mut outcome = self.probe_once(format, path, &self.config.scanner)?;

        // a wrong-architecture binary is not broken, just unreadable by
        // this scanner; retry once under the alternate one if we have it
        let mut retried = false;
        let cancelled = matches!(outcome, ProbeOutcome::Aborted { .. });
        if !cancelled && downgrade_arch_errors(outcome.notifications_mut()) {
            if let Some(alt) = &self.config.alt_arch_scanner {
                tracing::info!(
                    path = %path.display(),
                    alt = %alt.display(),
                    "architecture mismatch, retrying under alternate scanner"
                );
                outcome = self.probe_once(format, path, alt)?;
                retried = true;
            }
        }

        Ok(CandidateResult {
            format,
            path: path.to_path_buf(),
            outcome,
            retried_alt_arch: retried,
        })
    }

    fn probe_once(&self, format: PluginFormat, path: &Path, scanner: &Path) -> Result<ProbeOutcome> {
        let mut request = ProbeRequest::spawn(format, path, scanner, &self.config)?;

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                let (records, notifications) = request.abort();
                tracing::info!(
                    records = records.len(),
                    notifications = notifications.len(),
                    "probe aborted by cancellation"
                );
                return Ok(ProbeOutcome::Aborted {
                    records,
                    notifications,
                });
            }
            if let Some(outcome) = request.poll() {
                return Ok(outcome);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Rewrite architecture-mismatch error notifications as warnings. Returns
/// whether any were found.
fn downgrade_arch_errors(notifications: &mut [Notification]) -> bool {
    let mut found = false;
    for note in notifications {
        if note.severity == Severity::Error && is_arch_mismatch(&note.text) {
            note.severity = Severity::Warning;
            found = true;
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run `script` under `sh -c` as a scanner child. The four fd args
    /// land in `$0..$3`, so `$3` is the child's write end.
    fn spawn_script(script: &str, timeout: Duration) -> ProbeRequest {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(format!(r#"eval "exec 1>&$3"; printf '\n'; {script}"#));
        ProbeRequest::spawn_with(command, timeout).unwrap()
    }

    #[test]
    fn test_clean_exit_yields_records() {
        let mut probe = spawn_script(
            "printf 'init\\nname\\nGrand Piano\\naudio.outs\\n2\\nend\\nexiting\\n'",
            Duration::from_secs(10),
        );

        let outcome = probe.wait();
        let ProbeOutcome::Exited { records, .. } = outcome else {
            panic!("expected clean exit, got {outcome:?}");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].get(bravura_bridge::RecordKey::Name),
            Some("Grand Piano")
        );
    }

    #[test]
    fn test_crash_preserves_completed_records() {
        // one finished record, one left open, then a hard self-kill
        let mut probe = spawn_script(
            "printf 'init\\nname\\nsolid\\nend\\ninit\\nname\\ndoomed\\n'; kill -9 $$",
            Duration::from_secs(10),
        );

        let outcome = probe.wait();
        let ProbeOutcome::Crashed { records, .. } = outcome else {
            panic!("expected crash, got {outcome:?}");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].get(bravura_bridge::RecordKey::Name),
            Some("solid")
        );
    }

    #[test]
    fn test_timeout_kills_and_reports_partials() {
        let mut probe = spawn_script(
            "printf 'init\\nname\\nearly\\nend\\n'; sleep 60",
            Duration::from_millis(300),
        );

        let start = Instant::now();
        let outcome = probe.wait();
        assert!(start.elapsed() < Duration::from_secs(10), "kill was not prompt");

        let ProbeOutcome::TimedOut { records, .. } = outcome else {
            panic!("expected timeout, got {outcome:?}");
        };
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_nonzero_exit_is_a_crash() {
        let mut probe = spawn_script("printf 'exiting\\n'; exit 3", Duration::from_secs(10));
        assert!(matches!(probe.wait(), ProbeOutcome::Crashed { .. }));
    }

    #[test]
    fn test_abort_drains_before_killing() {
        let mut probe = spawn_script(
            "printf 'init\\nname\\nkept\\nend\\n'; sleep 60",
            Duration::from_secs(60),
        );

        // let the child get its record out first
        let deadline = Instant::now() + Duration::from_secs(10);
        while probe.collector.records().is_empty() && Instant::now() < deadline {
            probe.drain();
            std::thread::sleep(Duration::from_millis(5));
        }

        let (records, _) = probe.abort();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_notifications_survive_alongside_records() {
        let mut probe = spawn_script(
            "printf 'warning\\nslow binary\\ninit\\nname\\nok\\nend\\nexiting\\n'",
            Duration::from_secs(10),
        );

        let outcome = probe.wait();
        assert_eq!(outcome.records().len(), 1);
        assert_eq!(outcome.notifications().len(), 1);
        assert_eq!(outcome.notifications()[0].severity, Severity::Warning);
    }

    #[test]
    fn test_downgrade_rewrites_only_arch_errors() {
        let mut notes = vec![
            Notification {
                severity: Severity::Error,
                text: "foo.so: wrong ELF class: ELFCLASS32".into(),
            },
            Notification {
                severity: Severity::Error,
                text: "undefined symbol: clap_entry".into(),
            },
        ];
        assert!(downgrade_arch_errors(&mut notes));
        assert_eq!(notes[0].severity, Severity::Warning);
        assert_eq!(notes[1].severity, Severity::Error);
    }

    #[test]
    fn test_timeout_budget_covers_handshake() {
        // child that never sends the handshake byte
        let mut command = Command::new("sleep");
        command.arg("30");

        let start = Instant::now();
        let err = ProbeRequest::spawn_with(command, Duration::from_millis(200)).unwrap_err();
        assert!(
            matches!(err, DiscoveryError::Bridge(BridgeError::HandshakeTimeout)),
            "{err}"
        );
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_session_cancel_before_start() {
        let mut session = ScanSession::new(ProbeConfig {
            timeout: Duration::from_secs(1),
            ..Default::default()
        });
        session.cancel_flag().store(true, Ordering::Relaxed);

        let err = session
            .run(&[(PluginFormat::Ladspa, PathBuf::from("/x.so"))])
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Cancelled));
        assert!(session.results().is_empty());
    }
}
