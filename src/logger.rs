// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::Once;

use slog::Drain;

static INIT: Once = Once::new();

/// Installs a terminal drain as the global logger. Safe to call repeatedly;
/// only the first call takes effect.
pub fn init() {
    INIT.call_once(|| {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        let logger = slog::Logger::root(drain, slog::o!());
        slog_global::set_global(logger);
    });
}
