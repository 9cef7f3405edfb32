// src/main.rs
#![cfg(not(target_arch = "wasm32"))]

use std::backtrace::Backtrace;
use std::fs::File;
use std::io::Write;
use std::panic;

use slop_render::logging::{init_logging, LoggingConfig};
use slop_render::RendererConfig;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const CRASH_LOG: &str = "render_crash.log";

fn main() {
    init_logging(&LoggingConfig::default());
    install_panic_hook();
    raise_priority();

    // SLOP_WATCH_SHADERS=1 recompiles shaders/ on save; Ctrl+R always works.
    let watch = std::env::var("SLOP_WATCH_SHADERS").is_ok_and(|v| v != "0");
    let config = RendererConfig::default().with_watch_shaders(watch);

    log::info!("starting slop_render (native)");
    if let Err(err) = slop_render::run_native(config) {
        log::error!("renderer terminated: {err}");
        std::process::exit(1);
    }
}

fn raise_priority() {
    #[cfg(feature = "high_priority")]
    {
        match thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max) {
            Ok(()) => log::info!("render thread priority raised"),
            Err(err) => log::warn!("could not raise render thread priority: {err:?}"),
        }
    }
}

fn install_panic_hook() {
    panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::force_capture();

        let reason = match info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };
        let location = info
            .location()
            .map_or("unknown location".to_string(), |loc| format!("{}:{}", loc.file(), loc.line()));

        let report = format!("=== RENDERER CRASH ===\nReason: {reason}\nLocation: {location}\n\nStack trace:\n{backtrace}");
        eprintln!("\x1b[31;1m{report}\x1b[0m");

        if let Ok(mut file) = File::create(CRASH_LOG) {
            let _ = file.write_all(report.as_bytes());
            eprintln!("crash report saved to {CRASH_LOG}");
        }
    }));
}
