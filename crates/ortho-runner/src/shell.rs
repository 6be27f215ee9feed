//! `bash -c` wrapper used as the engine-call function, and the detached
//! background runner.

use crossbeam_channel::RecvTimeoutError;
use ortho_core::console;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const TAIL_LINES: usize = 20;
const POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("cannot start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with code {code}{tail}")]
    Failed {
        command: String,
        code: i32,
        tail: String,
    },
    #[error("`{command}` was stopped by the time limit")]
    TimedOut { command: String },
    #[error("`{command}` was interrupted")]
    Interrupted { command: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct ShellOptions {
    pub cwd: Option<PathBuf>,
    pub log: Option<PathBuf>,
    pub scroll: bool,
    pub deadline: Option<Instant>,
    /// Polled while the command runs; when set, the command is killed.
    pub interrupt: Option<Arc<AtomicBool>>,
}

fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn log_tail(path: &Path) -> Vec<String> {
    let text = fs::read_to_string(path).unwrap_or_default();
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    lines[start..].iter().map(|s| s.to_string()).collect()
}

fn format_tail(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!("; last output:\n{}", lines.join("\n"))
    }
}

enum Halt {
    TimeLimit,
    Interrupt,
}

fn should_halt(opts: &ShellOptions) -> Option<Halt> {
    if let Some(flag) = &opts.interrupt {
        if flag.load(Ordering::SeqCst) {
            return Some(Halt::Interrupt);
        }
    }
    match opts.deadline {
        Some(d) if Instant::now() >= d => Some(Halt::TimeLimit),
        _ => None,
    }
}

/// Every command runs as the leader of its own process group, so stopping
/// it also stops whatever it spawned.
fn own_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
}

fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: signals only the group this child leads.
            if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
                return;
            }
        }
    }
    let _ = child.kill();
}

fn stop(child: &mut Child, command: &str, halt: Halt) -> ShellError {
    kill_group(child);
    let _ = child.wait();
    let command = command.to_string();
    match halt {
        Halt::TimeLimit => {
            warn!(command, "killed command group at time limit");
            ShellError::TimedOut { command }
        }
        Halt::Interrupt => {
            warn!(command, "killed command group on interrupt");
            ShellError::Interrupted { command }
        }
    }
}

/// Run `bash -c command`. The command line is written to the log first;
/// a nonzero exit is an error carrying the tail of the output.
pub fn bash(command: &str, opts: &ShellOptions) -> Result<String, ShellError> {
    if let Some(log) = &opts.log {
        let mut file = open_log(log)?;
        writeln!(file, "$ {}", command)?;
    }
    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(command).stdin(Stdio::null());
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }
    own_group(&mut cmd);
    debug!(command, scroll = opts.scroll, "running shell command");
    if opts.scroll {
        return run_scrolled(cmd, command, opts);
    }

    match &opts.log {
        Some(log) => {
            let out = open_log(log)?;
            let err = out.try_clone()?;
            cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
        }
        None => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
    }
    let mut child = cmd.spawn().map_err(|source| ShellError::Spawn {
        command: command.to_string(),
        source,
    })?;
    let status = wait_halting(&mut child, command, opts)?;
    let tail = opts.log.as_deref().map(log_tail).unwrap_or_default();
    finish(command, status, &tail)
}

fn wait_halting(
    child: &mut Child,
    command: &str,
    opts: &ShellOptions,
) -> Result<ExitStatus, ShellError> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if let Some(halt) = should_halt(opts) {
            return Err(stop(child, command, halt));
        }
        thread::sleep(POLL);
    }
}

fn finish(command: &str, status: ExitStatus, tail: &[String]) -> Result<String, ShellError> {
    if status.success() {
        return Ok(tail.join("\n"));
    }
    Err(ShellError::Failed {
        command: command.to_string(),
        code: status.code().unwrap_or(-1),
        tail: format_tail(tail),
    })
}

fn drain<R: Read + Send + 'static>(
    stream: R,
    tx: crossbeam_channel::Sender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Both output streams are drained by reader threads into one queue; each
/// line is printed and appended to the log as it arrives.
fn run_scrolled(mut cmd: Command, command: &str, opts: &ShellOptions) -> Result<String, ShellError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|source| ShellError::Spawn {
        command: command.to_string(),
        source,
    })?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        readers.push(drain(out, tx.clone()));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(drain(err, tx.clone()));
    }
    drop(tx);

    let mut log = match &opts.log {
        Some(path) => Some(open_log(path)?),
        None => None,
    };
    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
    loop {
        if let Some(halt) = should_halt(opts) {
            // The group is gone, so the pipes are closed and the readers end.
            let err = stop(&mut child, command, halt);
            for reader in readers {
                let _ = reader.join();
            }
            return Err(err);
        }
        match rx.recv_timeout(POLL) {
            Ok(line) => {
                console::say(&line);
                if let Some(file) = log.as_mut() {
                    writeln!(file, "{}", line)?;
                }
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for reader in readers {
        let _ = reader.join();
    }
    let status = wait_halting(&mut child, command, opts)?;
    let tail: Vec<String> = tail.into_iter().collect();
    finish(command, status, &tail)
}

#[derive(Debug, Clone)]
pub struct BackgroundJob {
    pub pid: u32,
    pub kill_script: PathBuf,
    pub log: PathBuf,
}

/// Launch `bash -c command` in its own process group, detached from the
/// terminal, and write an executable script that terminates the group.
pub fn background(
    root: &Path,
    command: &str,
    stop_script: &str,
    log: &str,
) -> Result<BackgroundJob, ShellError> {
    let log_path = root.join(log);
    let out = open_log(&log_path)?;
    let err = out.try_clone()?;
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err));
    own_group(&mut cmd);
    let child = cmd.spawn().map_err(|source| ShellError::Spawn {
        command: command.to_string(),
        source,
    })?;
    let pid = child.id();
    let kill_script = root.join(stop_script);
    fs::write(
        &kill_script,
        format!(
            "#!/bin/bash\n# stops: {}\nkill -TERM -- -{} 2>/dev/null || kill -TERM {}\nrm -f \"$0\"\n",
            command.replace('\n', " "),
            pid,
            pid
        ),
    )?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&kill_script, fs::Permissions::from_mode(0o755))?;
    }
    console::status(&format!(
        "background job {} started; stop it with ./{}",
        pid, stop_script
    ));
    Ok(BackgroundJob {
        pid,
        kill_script,
        log: log_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch;

    #[test]
    fn command_output_goes_to_log() {
        let root = scratch("shell_log");
        let log = root.join("step.log");
        let opts = ShellOptions {
            log: Some(log.clone()),
            ..Default::default()
        };
        bash("echo hello; echo oops >&2", &opts).expect("bash");
        let text = fs::read_to_string(&log).expect("log");
        assert!(text.starts_with("$ echo hello"));
        assert!(text.contains("hello\n") && text.contains("oops\n"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn nonzero_exit_reports_code_and_tail() {
        let root = scratch("shell_fail");
        let opts = ShellOptions {
            log: Some(root.join("fail.log")),
            ..Default::default()
        };
        match bash("echo last words; exit 3", &opts) {
            Err(ShellError::Failed { code, tail, .. }) => {
                assert_eq!(code, 3);
                assert!(tail.contains("last words"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn scroll_mode_drains_both_streams() {
        let root = scratch("shell_scroll");
        let log = root.join("scroll.log");
        let opts = ShellOptions {
            log: Some(log.clone()),
            scroll: true,
            ..Default::default()
        };
        let out = bash("for i in 1 2 3; do echo out$i; echo err$i >&2; done", &opts).expect("scroll");
        for i in 1..=3 {
            assert!(out.contains(&format!("out{}", i)));
            assert!(out.contains(&format!("err{}", i)));
        }
        assert_eq!(fs::read_to_string(&log).expect("log").lines().count(), 7);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn deadline_kills_the_child() {
        let opts = ShellOptions {
            deadline: Some(Instant::now() + Duration::from_millis(200)),
            ..Default::default()
        };
        let started = Instant::now();
        assert!(matches!(
            bash("sleep 5", &opts),
            Err(ShellError::TimedOut { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn deadline_kills_the_whole_group() {
        let root = scratch("shell_group");
        let opts = ShellOptions {
            cwd: Some(root.clone()),
            deadline: Some(Instant::now() + Duration::from_millis(200)),
            ..Default::default()
        };
        assert!(matches!(
            bash("(sleep 1; touch marker); true", &opts),
            Err(ShellError::TimedOut { .. })
        ));
        let opts = ShellOptions {
            deadline: Some(Instant::now() + Duration::from_millis(200)),
            ..opts
        };
        assert!(matches!(
            bash("(sleep 1; touch marker2) & sleep 5", &opts),
            Err(ShellError::TimedOut { .. })
        ));
        thread::sleep(Duration::from_millis(1500));
        assert!(!root.join("marker").exists());
        assert!(!root.join("marker2").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn scroll_mode_deadline_does_not_wait_for_descendants() {
        let opts = ShellOptions {
            scroll: true,
            deadline: Some(Instant::now() + Duration::from_millis(200)),
            ..Default::default()
        };
        let started = Instant::now();
        assert!(matches!(
            bash("echo early; sleep 3; echo late", &opts),
            Err(ShellError::TimedOut { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn raised_interrupt_flag_stops_the_command() {
        let opts = ShellOptions {
            interrupt: Some(Arc::new(AtomicBool::new(true))),
            ..Default::default()
        };
        let started = Instant::now();
        assert!(matches!(
            bash("sleep 5", &opts),
            Err(ShellError::Interrupted { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn background_job_writes_kill_script() {
        let root = scratch("shell_back");
        let job = background(&root, "sleep 30", "script-stop-job.sh", "log-back").expect("back");
        let script = fs::read_to_string(&job.kill_script).expect("kill script");
        assert!(script.contains(&format!("-{}", job.pid)));
        let status = Command::new("bash")
            .arg(&job.kill_script)
            .status()
            .expect("run kill script");
        assert!(status.success());
        let _ = fs::remove_dir_all(root);
    }
}
