//! A `log`-facade logger backed by whatever serial sink the active
//! architecture module provides. There is no framebuffer console here:
//! rendering consoles is out of scope for the loader core.

use conquer_once::spin::OnceCell;
use core::fmt::Write;
use spinning_top::Spinlock;

/// The global logger instance used for the `log` crate.
pub static LOGGER: OnceCell<LockedLogger<'static>> = OnceCell::uninit();

/// Wraps any `core::fmt::Write` sink in a spinlock so `log` calls from
/// anywhere in the loader serialise onto it.
pub struct LockedLogger<'a>(Spinlock<&'a mut (dyn Write + Send)>);

impl<'a> LockedLogger<'a> {
    pub fn new(sink: &'a mut (dyn Write + Send)) -> Self {
        LockedLogger(Spinlock::new(sink))
    }

    /// Force-unlocks the logger to prevent a deadlock.
    ///
    /// # Safety
    /// Only call this from a panic handler, after the rest of the system
    /// has stopped making progress.
    pub unsafe fn force_unlock(&self) {
        unsafe { self.0.force_unlock() };
    }
}

impl log::Log for LockedLogger<'_> {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let mut sink = self.0.lock();
        let _ = writeln!(sink, "{:5}: {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Installs the global logger over `sink`. Must be called at most once.
pub fn init(sink: &'static mut (dyn Write + Send), level: log::LevelFilter) {
    let logger = LOGGER.get_or_init(move || LockedLogger::new(sink));
    log::set_logger(logger).expect("logger already set");
    log::set_max_level(level);
}
