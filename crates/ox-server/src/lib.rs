#![forbid(unsafe_code)]

//! Bootstrap: wire the engine into the event loop and serve forever.

use std::io;

use tracing::info;

use ox_config::Config;
use ox_eventloop::EventLoop;
use ox_store::Engine;

/// Bind, then serve until the readiness poll fails.
pub fn run(config: &Config) -> io::Result<()> {
    let engine = Engine::new();
    let mut event_loop = EventLoop::new(config, engine)?;
    info!(addr = %event_loop.local_addr()?, "listening");
    event_loop.run()
}
