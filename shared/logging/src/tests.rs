use std::sync::Mutex;

use once_cell::sync::OnceCell;
use slog::{Drain, Level, OwnedKVList, Record};
use slog_scope::GlobalLoggerGuard;

static LOGGER: OnceCell<GlobalLoggerGuard> = OnceCell::new();

/// Turns warnings and errors into test failures
struct StrictDrain<D>(D);

impl<D: Drain> Drain for StrictDrain<D> {
    type Ok = ();
    type Err = slog::Never;

    fn log(&self, record: &Record, values: &OwnedKVList) -> Result<(), slog::Never> {
        let _ = self.0.log(record, values);
        if record.level().is_at_least(Level::Warning) {
            panic!("unexpected diagnostic in test: {}", record.msg());
        }
        Ok(())
    }
}

/// Only works for running a single test :(
#[allow(dead_code)]
pub fn for_tests() {
    LOGGER.get_or_init(|| {
        let drain = slog_term::TermDecorator::new().stdout().build();
        let drain = slog_term::CompactFormat::new(drain).build();
        let drain = Mutex::new(drain).fuse();
        let logger = slog::Logger::root(drain, slog::o!());
        slog_scope::set_global_logger(logger)
    });
}

/// Like [for_tests] but any warning or error fails the test
#[allow(dead_code)]
pub fn for_tests_strict() {
    LOGGER.get_or_init(|| {
        let drain = slog_term::TermDecorator::new().stdout().build();
        let drain = slog_term::CompactFormat::new(drain).build();
        let drain = StrictDrain(Mutex::new(drain).fuse()).fuse();
        let logger = slog::Logger::root(drain, slog::o!());
        slog_scope::set_global_logger(logger)
    });
}
