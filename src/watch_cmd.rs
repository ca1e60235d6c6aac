//! Watch command: run the sync daemon until stopped.

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::Arc;

use driftsync::engine::SyncEngine;
use driftsync::{Config, FsDriver, WatcherConfig};

pub fn run_watch(
    config_path: PathBuf,
    state_dir: PathBuf,
    target: PathBuf,
    debounce_ms: u64,
) -> Result<()> {
    let config = Config::load(&config_path)?;
    let driver = Arc::new(FsDriver::open(&target).map_err(|e| anyhow!(e.0))?);
    let mut engine = SyncEngine::new(config, &state_dir, driver)?;
    let controls = engine.controls();

    // Control signals: stop, pause, resume, config reload.
    #[cfg(unix)]
    {
        use signal_hook::consts::signal;
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([
            signal::SIGTERM,
            signal::SIGINT,
            signal::SIGUSR1,
            signal::SIGUSR2,
            signal::SIGHUP,
        ])?;

        let controls = Arc::clone(&controls);
        std::thread::spawn(move || {
            for sig in &mut signals {
                match sig {
                    signal::SIGTERM | signal::SIGINT => {
                        controls.request_stop();
                        break;
                    }
                    signal::SIGUSR1 => controls.pause(),
                    signal::SIGUSR2 => controls.resume(),
                    signal::SIGHUP => controls.request_reload(),
                    _ => {}
                }
            }
        });
    }

    let watcher_config = WatcherConfig { debounce_ms };
    engine.run_watch(&watcher_config, Some(&config_path))?;
    println!("SHUTDOWN");
    Ok(())
}
