#![cfg(unix)]
//! Signal handling tests for the driftsync binary.
//!
//! Spawns the real binary in watch mode and drives it with real signals:
//! SIGTERM stops, SIGUSR1 pauses draining, SIGUSR2 resumes, SIGHUP reloads
//! the configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use driftsync::SnapshotStore;

fn bin_path() -> String {
    std::env::var("CARGO_BIN_EXE_driftsync").unwrap_or_else(|_| {
        let mut path = std::env::current_exe().unwrap();
        path.pop();
        path.pop();
        path.push("driftsync");
        path.to_str().unwrap().to_string()
    })
}

/// Write a config file mirroring each root into "/R".
fn write_config(path: &Path, roots: &[&Path]) {
    let dirs: Vec<String> = roots
        .iter()
        .map(|root| {
            format!(
                r#"{{"source_path": {:?}, "remote_root": "/R"}}"#,
                root.to_string_lossy()
            )
        })
        .collect();
    fs::write(
        path,
        format!(
            r#"{{"sync_dirs": [{}], "sync_concurrency": 2}}"#,
            dirs.join(", ")
        ),
    )
    .unwrap();
}

fn spawn_watch(config: &Path, state: &Path, target: &Path) -> Child {
    Command::new(bin_path())
        .arg("watch")
        .arg("--config")
        .arg(config)
        .arg("--state-dir")
        .arg(state)
        .arg("--target")
        .arg(target)
        .arg("--debounce-ms")
        .arg("100")
        .stdout(Stdio::piped())
        // tracing writes here; an unread pipe would eventually block the
        // daemon, so drop it.
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start driftsync binary")
}

fn send_signal(child: &Child, signal: &str) {
    let status = Command::new("kill")
        .arg(format!("-{}", signal))
        .arg(child.id().to_string())
        .status()
        .expect("failed to run kill");
    assert!(status.success(), "kill -{} failed", signal);
}

fn wait_until(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > timeout {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(100));
    }
}

fn wait_for_exit(mut child: Child, timeout: Duration) -> std::process::Output {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_status)) => {
                break child
                    .wait_with_output()
                    .expect("failed to wait for process");
            }
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    panic!("process did not exit within timeout");
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => panic!("failed to wait for process: {}", e),
        }
    }
}

struct Setup {
    _tmp: TempDir,
    root: PathBuf,
    state: PathBuf,
    target: PathBuf,
    config: PathBuf,
}

fn setup() -> Setup {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().canonicalize().unwrap();
    let root = base.join("a");
    fs::create_dir_all(&root).unwrap();
    let config = base.join("config.json");
    write_config(&config, &[&root]);
    Setup {
        _tmp: tmp,
        root,
        state: base.join("state"),
        target: base.join("remote"),
        config,
    }
}

/// Mirrored path of a file in a watch root named `a`.
fn mirrored(target: &Path, root_name: &str, rel: &str) -> PathBuf {
    target.join("R").join(root_name).join(rel)
}

/// The daemon writes the root's snapshot right after its startup scan, and
/// signal handlers are installed before the engine starts, so a visible
/// snapshot means signals are safe to send.
fn wait_ready(state: &Path, root: &Path) {
    let snapshot = SnapshotStore::new(state).path_for(root);
    wait_until("daemon startup scan", Duration::from_secs(15), || {
        snapshot.exists()
    });
}

#[test]
fn test_sigterm_prints_shutdown_and_exits() {
    let s = setup();
    fs::write(s.root.join("x.txt"), b"hello").unwrap();

    let child = spawn_watch(&s.config, &s.state, &s.target);
    wait_ready(&s.state, &s.root);

    // Prove the daemon is actually syncing before stopping it.
    let synced = mirrored(&s.target, "a", "x.txt");
    wait_until("initial file to mirror", Duration::from_secs(15), || {
        synced.exists()
    });

    send_signal(&child, "TERM");
    let output = wait_for_exit(child, Duration::from_secs(15));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("SHUTDOWN"),
        "expected SHUTDOWN in stdout, got: {}",
        stdout
    );
    assert!(output.status.success(), "process should exit successfully");
}

#[test]
fn test_sigusr1_pauses_and_sigusr2_resumes() {
    let s = setup();
    let child = spawn_watch(&s.config, &s.state, &s.target);
    wait_ready(&s.state, &s.root);

    send_signal(&child, "USR1");
    // Give the pause a moment to reach the engine loop.
    thread::sleep(Duration::from_secs(1));

    fs::write(s.root.join("live.txt"), b"streamed").unwrap();
    let synced = mirrored(&s.target, "a", "live.txt");

    // While paused, the change must not reach the mirror. Well past the
    // 100 ms debounce plus a few engine ticks.
    thread::sleep(Duration::from_secs(3));
    assert!(
        !synced.exists(),
        "paused daemon must not drain jobs, but {} appeared",
        synced.display()
    );

    send_signal(&child, "USR2");
    wait_until("resume to drain the queued change", Duration::from_secs(15), || {
        synced.exists()
    });
    assert_eq!(fs::read(&synced).unwrap(), b"streamed");

    send_signal(&child, "TERM");
    let output = wait_for_exit(child, Duration::from_secs(15));
    assert!(output.status.success());
}

#[test]
fn test_sighup_reloads_config_and_picks_up_new_root() {
    let s = setup();
    let child = spawn_watch(&s.config, &s.state, &s.target);
    wait_ready(&s.state, &s.root);

    // A second root appears on disk and in the config file; only SIGHUP
    // makes the daemon see it.
    let base = s.root.parent().unwrap().to_path_buf();
    let root_b = base.join("b");
    fs::create_dir_all(&root_b).unwrap();
    fs::write(root_b.join("extra.txt"), b"late arrival").unwrap();
    write_config(&s.config, &[&s.root, &root_b]);

    thread::sleep(Duration::from_secs(1));
    let synced = mirrored(&s.target, "b", "extra.txt");
    assert!(!synced.exists(), "new root must not sync before reload");

    send_signal(&child, "HUP");
    wait_until("reload to sync the new root", Duration::from_secs(15), || {
        synced.exists()
    });
    assert_eq!(fs::read(&synced).unwrap(), b"late arrival");

    // The reloaded configuration also got its own snapshot baseline.
    assert!(SnapshotStore::new(&s.state).path_for(&root_b).exists());

    send_signal(&child, "TERM");
    let output = wait_for_exit(child, Duration::from_secs(15));
    assert!(output.status.success());
}
