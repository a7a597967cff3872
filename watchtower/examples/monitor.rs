//! Watches a path given on the command line and logs every event it sees.
//!
//! Run with `RUST_LOG=info cargo run --example monitor -- <path>`.

use std::path::Path;

use watchtower::{recommended_observer, Config, Handler, RecursiveMode, WatchPathConfig};
use watchtower_types::Event;

struct Logger;

impl Handler for Logger {
    fn on_any_event(&mut self, event: &Event) {
        log::info!("{}: {:?}", event.label(), event.paths);
    }
}

fn watch<P: AsRef<Path>>(path: P) -> watchtower::Result<()> {
    let observer = recommended_observer(Config::default())?;
    let watch = observer.schedule(path.as_ref(), WatchPathConfig::new(RecursiveMode::Recursive))?;
    observer.add_handler_for_watch(&watch, Box::new(Logger))?;
    observer.start()?;

    log::info!("watching {}", path.as_ref().display());
    loop {
        std::thread::park();
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args()
        .nth(1)
        .expect("usage: monitor <path>");

    if let Err(error) = watch(path) {
        log::error!("error: {error:?}");
    }
}
