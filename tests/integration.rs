//! End-to-end tests driving the `forksh` binary with a script on stdin.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

struct Output {
    stdout: String,
    stderr: String,
    code: Option<i32>,
    elapsed: Duration,
}

/// A working directory for the shell plus a separate place for its captured streams.
struct Session {
    work: tempfile::TempDir,
    capture: tempfile::TempDir,
}

impl Session {
    fn new() -> Self {
        Session {
            work: tempfile::tempdir().unwrap(),
            capture: tempfile::tempdir().unwrap(),
        }
    }

    fn dir(&self) -> PathBuf {
        fs::canonicalize(self.work.path()).unwrap()
    }

    fn stdout_path(&self) -> PathBuf {
        self.capture.path().join("stdout")
    }

    fn stderr_path(&self) -> PathBuf {
        self.capture.path().join("stderr")
    }

    /// Starts the shell with stdout/stderr going to files, so that orphaned
    /// background jobs holding them open cannot stall the test.
    fn spawn(&self, args: &[&str], envs: &[(&str, &Path)]) -> Child {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_forksh"));
        cmd.args(args)
            .current_dir(self.dir())
            .env("HOME", self.dir())
            .stdin(Stdio::piped())
            .stdout(File::create(self.stdout_path()).unwrap())
            .stderr(File::create(self.stderr_path()).unwrap());
        for (key, val) in envs {
            cmd.env(key, val);
        }
        cmd.spawn().expect("failed to start forksh")
    }

    fn finish(&self, mut child: Child, started: Instant) -> Output {
        let status = child.wait().unwrap();
        Output {
            stdout: fs::read_to_string(self.stdout_path()).unwrap(),
            stderr: fs::read_to_string(self.stderr_path()).unwrap(),
            code: status.code(),
            elapsed: started.elapsed(),
        }
    }

    fn run(&self, script: &str) -> Output {
        self.run_with(script, &[], &[])
    }

    fn run_with(&self, script: &str, args: &[&str], envs: &[(&str, &Path)]) -> Output {
        let started = Instant::now();
        let mut child = self.spawn(args, envs);
        child
            .stdin
            .take()
            .unwrap()
            .write_all(script.as_bytes())
            .unwrap();
        self.finish(child, started)
    }

    fn read(&self, name: &str) -> String {
        fs::read_to_string(self.dir().join(name)).unwrap()
    }
}

#[test]
fn pipeline_passes_bytes_through() {
    let sh = Session::new();
    let out = sh.run("printf hello | cat | cat > piped\n");
    assert_eq!(out.code, Some(0), "stderr: {}", out.stderr);
    assert_eq!(sh.read("piped"), "hello");
}

#[test]
fn pipeline_output_reaches_stdout() {
    let sh = Session::new();
    let out = sh.run("echo through the pipe | cat\n");
    assert!(out.stdout.contains("through the pipe\n"), "stdout: {}", out.stdout);
}

#[test]
fn list_runs_in_order() {
    let sh = Session::new();
    let out = sh.run("echo first > marker ; cat marker\n");
    assert!(out.stdout.contains("first\n"), "stdout: {}", out.stdout);
    assert!(out.stderr.is_empty(), "stderr: {}", out.stderr);
}

#[test]
fn redirection_target_is_not_an_argument() {
    let sh = Session::new();
    sh.run("echo > a one two\necho one two > b\n");
    assert_eq!(sh.read("a"), "one two\n");
    assert_eq!(sh.read("b"), "one two\n");
}

#[test]
fn append_and_input_redirection() {
    let sh = Session::new();
    sh.run("echo one > log\necho two >> log\ncat < log > copy\n");
    assert_eq!(sh.read("copy"), "one\ntwo\n");
}

#[test]
fn block_output_is_redirected_as_a_whole() {
    let sh = Session::new();
    sh.run("(echo a ; echo b) > both\n");
    assert_eq!(sh.read("both"), "a\nb\n");
}

#[test]
fn blank_lines_are_ignored() {
    let sh = Session::new();
    let out = sh.run("   \n\n\t\necho ok\n");
    assert!(out.stdout.contains("ok\n"));
    assert!(out.stderr.is_empty(), "stderr: {}", out.stderr);
}

#[test]
fn syntax_error_does_not_stop_the_shell() {
    let sh = Session::new();
    let out = sh.run("(echo oops\necho next\n");
    assert!(out.stderr.contains("forksh: syntax - missing )"), "stderr: {}", out.stderr);
    assert!(out.stdout.contains("next\n"));
    assert!(!out.stdout.contains("oops"));
}

#[test]
fn other_syntax_errors_are_reported() {
    let sh = Session::new();
    let out = sh.run("echo >\necho a ) b\necho 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15\necho fine\n");
    assert!(out.stderr.contains("missing file for redirection"), "stderr: {}", out.stderr);
    assert!(out.stderr.contains("trailing input"), "stderr: {}", out.stderr);
    assert!(out.stderr.contains("too many args"), "stderr: {}", out.stderr);
    assert!(out.stdout.contains("fine\n"));
}

#[test]
fn failed_exec_is_reported() {
    let sh = Session::new();
    let out = sh.run("no_such_program_for_forksh\necho next\n");
    assert!(
        out.stderr.contains("exec no_such_program_for_forksh failed"),
        "stderr: {}",
        out.stderr
    );
    assert!(out.stdout.contains("next\n"));
}

#[test]
fn failed_redirection_is_reported() {
    let sh = Session::new();
    let out = sh.run("cat < missing_input\necho next\n");
    assert!(out.stderr.contains("open missing_input failed"), "stderr: {}", out.stderr);
    assert!(out.stdout.contains("next\n"));
}

#[test]
fn cd_changes_directory_of_the_shell() {
    let sh = Session::new();
    fs::create_dir(sh.dir().join("sub")).unwrap();
    let out = sh.run("cd sub\npwd\n");
    let expected = format!("{}\n", sh.dir().join("sub").display());
    assert!(out.stdout.contains(&expected), "stdout: {}", out.stdout);
}

#[test]
fn cd_without_argument_goes_home() {
    let sh = Session::new();
    let home = tempfile::tempdir().unwrap();
    let home_path = fs::canonicalize(home.path()).unwrap();
    let out = sh.run_with("cd\npwd\n", &[], &[("HOME", &home_path)]);
    assert!(
        out.stdout.contains(&format!("{}\n", home_path.display())),
        "stdout: {}",
        out.stdout
    );
}

#[test]
fn cd_to_missing_directory_is_not_fatal() {
    let sh = Session::new();
    let out = sh.run("cd /nonexistent/forksh\npwd\n");
    assert!(out.stderr.contains("cd:"), "stderr: {}", out.stderr);
    assert!(out.stdout.contains(&format!("{}\n", sh.dir().display())));
    assert_eq!(out.code, Some(0));
}

#[test]
fn exit_stops_reading() {
    let sh = Session::new();
    let out = sh.run("exit\necho unreachable\n");
    assert_eq!(out.code, Some(0));
    assert!(!out.stdout.contains("unreachable"));
}

#[test]
fn end_of_input_exits_cleanly() {
    let sh = Session::new();
    let out = sh.run("");
    assert_eq!(out.code, Some(0));
}

#[test]
fn tee_copies_and_logs() {
    let sh = Session::new();
    let out = sh.run("echo data | tee copy1 copy2\n");
    assert!(out.stdout.contains("data\n"));
    assert_eq!(sh.read("copy1"), "data\n");
    assert_eq!(sh.read("copy2"), "data\n");
    let log = sh.read(".tee.log");
    assert!(log.ends_with(":5 byte(s):2 file(s)\n"), "log: {}", log);
}

#[test]
fn du_reports_file_and_directory_sizes() {
    let sh = Session::new();
    fs::create_dir(sh.dir().join("tree")).unwrap();
    fs::write(sh.dir().join("tree").join("f"), vec![b'x'; 100]).unwrap();
    fs::write(sh.dir().join("tree").join("g"), vec![b'x'; 20]).unwrap();
    let out = sh.run("du tree\ndu tree/f\ndu -t 50 tree\n");
    assert!(out.stdout.contains("(D) tree: 120\n"), "stdout: {}", out.stdout);
    assert!(out.stdout.contains("(F) tree/f: 100\n"), "stdout: {}", out.stdout);
    assert!(out.stdout.contains("(D) tree: 100\n"), "stdout: {}", out.stdout);
}

#[test]
fn background_job_does_not_block() {
    let sh = Session::new();
    let out = sh.run("sleep 3 &\necho quick\n");
    assert!(out.stdout.contains("quick\n"));
    assert!(out.elapsed < Duration::from_millis(2500), "took {:?}", out.elapsed);
}

#[test]
fn foreground_command_is_killed_after_timeout() {
    let sh = Session::new();
    let out = sh.run("sleep 100\necho after\n");
    assert_eq!(kill_reports(&out.stderr).len(), 1, "stderr: {}", out.stderr);
    assert!(out.stdout.contains("after\n"));
    assert!(out.elapsed >= Duration::from_secs(5), "took {:?}", out.elapsed);
    assert!(out.elapsed < Duration::from_secs(15), "took {:?}", out.elapsed);
}

/// PIDs named by `forksh: [<count>] killed child with PID <pid>` lines, with their counts.
fn kill_reports(stderr: &str) -> Vec<(usize, i32)> {
    stderr
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("forksh: [")?;
            let (count, rest) = rest.split_once(']')?;
            let pid = rest.strip_prefix(" killed child with PID ")?;
            Some((count.parse().ok()?, pid.trim().parse().ok()?))
        })
        .collect()
}

#[test]
fn kill_report_counts_reaped_children() {
    let sh = Session::new();
    let out = sh.run("true\ntrue\nsleep 100\nsleep 100\necho after\n");
    let reports = kill_reports(&out.stderr);
    assert_eq!(reports.len(), 2, "stderr: {}", out.stderr);
    assert_eq!(reports[0].0, 2, "stderr: {}", out.stderr);
    assert_eq!(reports[1].0, 3, "stderr: {}", out.stderr);
    assert_ne!(reports[0].1, reports[1].1);
    assert!(out.stdout.contains("after\n"));
}

/// SIGKILLs a leftover process when the test ends, whatever the outcome.
struct KillOnDrop(Pid);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = kill(self.0, Signal::SIGKILL);
    }
}

/// Parent PID and state letter from `/proc/<pid>/stat`.
fn proc_parent(pid: Pid) -> Option<(i32, char)> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let (_, fields) = stat.rsplit_once(')')?;
    let mut fields = fields.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((ppid, state))
}

#[test]
fn killing_a_pipeline_orphans_its_stages() {
    let sh = Session::new();
    fs::write(
        sh.dir().join("stage.sh"),
        "echo $$ > stage.pid\nexec sleep 37\n",
    )
    .unwrap();

    let out = sh.run("sh stage.sh | cat\necho after\n");
    let stage = Pid::from_raw(sh.read("stage.pid").trim().parse().unwrap());
    let _guard = KillOnDrop(stage);

    let reports = kill_reports(&out.stderr);
    assert_eq!(reports.len(), 1, "stderr: {}", out.stderr);
    let killed = reports[0].1;
    assert!(out.stdout.contains("after\n"));

    // The killed child was reaped by the shell.
    assert!(kill(Pid::from_raw(killed), None).is_err());

    // Its pipeline stage is still running, now under another parent.
    let (ppid, state) = proc_parent(stage).expect("pipeline stage is gone");
    assert_ne!(state, 'Z');
    assert_ne!(ppid, killed);
}

#[test]
fn timeout_flag_sets_the_initial_timeout() {
    let sh = Session::new();
    let out = sh.run_with("sleep 6\necho done\n", &["--timeout", "10"], &[]);
    assert!(!out.stderr.contains("killed"), "stderr: {}", out.stderr);
    assert!(out.stdout.contains("done\n"));
}

#[test]
fn sigusr_signals_adjust_the_timeout() {
    let sh = Session::new();
    let started = Instant::now();
    let mut child = sh.spawn(&[], &[]);
    let mut stdin = child.stdin.take().unwrap();

    // Wait until the shell is up and its handlers are installed.
    stdin.write_all(b"echo ready\n").unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !fs::read_to_string(sh.stdout_path())
        .unwrap()
        .contains("ready")
    {
        assert!(Instant::now() < deadline, "shell did not start");
        thread::sleep(Duration::from_millis(50));
    }

    let pid = Pid::from_raw(child.id() as i32);
    for signal in [Signal::SIGUSR1, Signal::SIGUSR1, Signal::SIGUSR2] {
        kill(pid, signal).unwrap();
        thread::sleep(Duration::from_millis(200));
    }

    // 5 + 5 + 5 - 5 = 10 seconds now.
    stdin.write_all(b"sleep 7\necho survived\n").unwrap();
    drop(stdin);

    let out = sh.finish(child, started);
    assert!(!out.stderr.contains("killed"), "stderr: {}", out.stderr);
    assert!(out.stdout.contains("survived\n"));
    assert_eq!(out.code, Some(0));
}

#[test]
fn sigusr2_never_goes_below_the_floor() {
    let sh = Session::new();
    let started = Instant::now();
    let mut child = sh.spawn(&[], &[]);
    let mut stdin = child.stdin.take().unwrap();

    stdin.write_all(b"echo ready\n").unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !fs::read_to_string(sh.stdout_path())
        .unwrap()
        .contains("ready")
    {
        assert!(Instant::now() < deadline, "shell did not start");
        thread::sleep(Duration::from_millis(50));
    }

    let pid = Pid::from_raw(child.id() as i32);
    for _ in 0..3 {
        kill(pid, Signal::SIGUSR2).unwrap();
        thread::sleep(Duration::from_millis(100));
    }

    stdin.write_all(b"sleep 3\necho still\n").unwrap();
    drop(stdin);

    let out = sh.finish(child, started);
    assert!(!out.stderr.contains("killed"), "stderr: {}", out.stderr);
    assert!(out.stdout.contains("still\n"));
}

#[test]
fn help_flag_prints_usage() {
    let sh = Session::new();
    let out = sh.run_with("", &["--help"], &[]);
    assert_eq!(out.code, Some(0));
    assert!(out.stdout.contains("--timeout"), "stdout: {}", out.stdout);
}
