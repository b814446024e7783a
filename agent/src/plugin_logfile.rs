//! Log file monitoring
//!
//! `log.watch[path]` is a watched metric: the scheduler hands the full
//! item batch over and the plugin polls the files on its own cadence
//! from a background thread started through the Runner interface. New
//! lines matching the owning client's expression set are written to the
//! client sink; with an empty expression set every line matches.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use metricd_core::plugin::{
    CheckResult, ExportContext, MetricRegistry, Plugin, Request, ResultWriter, Runner, Watcher,
};
use metricd_core::{parse_key, ExpressionSet};

/// Seconds between file polls.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

struct WatchedFile {
    itemid: u64,
    path: PathBuf,
    offset: u64,
    sink: Arc<dyn ResultWriter>,
    expressions: Arc<ExpressionSet>,
}

#[derive(Default)]
struct WatchState {
    items: Vec<WatchedFile>,
}

pub(crate) struct LogfilePlugin {
    state: Arc<Mutex<WatchState>>,
    running: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl LogfilePlugin {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(WatchState::default())),
            running: Arc::new(AtomicBool::new(false)),
            poller: Mutex::new(None),
        }
    }

    pub fn register(registry: &mut MetricRegistry) {
        registry.register(
            Arc::new(LogfilePlugin::new()),
            &[("log.watch", "New lines of a monitored log file.")],
        );
    }
}

impl Plugin for LogfilePlugin {
    fn name(&self) -> &str {
        "logfile"
    }

    fn max_capacity(&self) -> usize {
        1
    }

    fn watcher(&self) -> Option<&dyn Watcher> {
        Some(self)
    }

    fn runner(&self) -> Option<&dyn Runner> {
        Some(self)
    }
}

impl Watcher for LogfilePlugin {
    /// Replaces the watched item batch. Offsets of files that stay
    /// watched are preserved; new files start from the consumer's
    /// last-logsize hint, or at the end of the file when there is none.
    fn watch(&self, requests: &[Request], sink: Arc<dyn ResultWriter>, ctx: &ExportContext) {
        let mut state = self.state.lock().expect("watch state lock");
        let previous = std::mem::take(&mut state.items);
        for request in requests {
            let path = match parse_key(&request.key) {
                Ok((_, params)) if params.len() == 1 && !params[0].is_empty() => {
                    PathBuf::from(&params[0])
                }
                _ => {
                    sink.write(CheckResult::error(
                        request.itemid,
                        "Invalid first parameter.",
                        Utc::now(),
                    ));
                    continue;
                }
            };
            let offset = previous
                .iter()
                .find(|item| item.itemid == request.itemid && item.path == path)
                .map(|item| item.offset)
                .or(request.last_logsize)
                .unwrap_or_else(|| file_size(&path));
            state.items.push(WatchedFile {
                itemid: request.itemid,
                path,
                offset,
                sink: Arc::clone(&sink),
                expressions: Arc::clone(&ctx.expressions),
            });
        }
        debug!("watching {} log files", state.items.len());
    }
}

impl Runner for LogfilePlugin {
    fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("starting log file poller");
        let state = Arc::clone(&self.state);
        let running = Arc::clone(&self.running);
        let handle = std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                poll_once(&state);
                std::thread::sleep(POLL_INTERVAL);
            }
        });
        *self.poller.lock().expect("poller lock") = Some(handle);
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("stopping log file poller");
        if let Some(handle) = self.poller.lock().expect("poller lock").take() {
            let _ = handle.join();
        }
        self.state.lock().expect("watch state lock").items.clear();
    }
}

fn file_size(path: &PathBuf) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// One poll pass over every watched file.
fn poll_once(state: &Mutex<WatchState>) {
    let mut state = state.lock().expect("watch state lock");
    for item in &mut state.items {
        if let Err(err) = poll_file(item) {
            warn!("cannot read {}: {err:#}", item.path.display());
        }
    }
}

fn poll_file(item: &mut WatchedFile) -> anyhow::Result<()> {
    let size = file_size(&item.path);
    if size < item.offset {
        // truncation or rotation, start over
        item.offset = 0;
    }
    if size == item.offset {
        return Ok(());
    }

    let mut file = File::open(&item.path)?;
    file.seek(SeekFrom::Start(item.offset))?;
    let mut buffer = String::new();
    file.read_to_string(&mut buffer)?;

    // only complete lines are reported; a trailing fragment waits for
    // the next poll
    let complete = match buffer.rfind('\n') {
        Some(end) => &buffer[..=end],
        None => return Ok(()),
    };
    let mut consumed = 0usize;
    for line in complete.split_inclusive('\n') {
        let text = line.trim_end_matches(['\r', '\n']);
        if item.expressions.matches(text) {
            if item.sink.slots_available() == 0 {
                // sink is full, retry the remainder on the next poll
                break;
            }
            item.sink
                .write(CheckResult::value(item.itemid, text, Utc::now()));
        }
        consumed += line.len();
    }
    item.offset += consumed as u64;
    item.sink.flush();
    Ok(())
}
