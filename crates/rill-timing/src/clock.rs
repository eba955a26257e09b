use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use once_cell::sync::OnceCell;
use quanta::Mock;

use crate::Millis;

pub type Clock = quanta::Clock;

/// Process-wide time source.
///
/// `System` reads the wall clock; `Quanta` is only installed by
/// [`init_mock_clock`], where raw ticks are nanoseconds.
#[derive(Clone, Debug)]
pub enum ClockSource {
    Quanta(Clock),
    System,
}

impl ClockSource {
    pub fn raw_nanos(&self) -> u64 {
        match self {
            ClockSource::Quanta(clock) => clock.raw(),
            ClockSource::System => unsafe {
                SystemTime::now().duration_since(UNIX_EPOCH).unwrap_unchecked().as_nanos() as u64
            },
        }
    }

    #[inline]
    pub fn now(&self) -> Millis {
        Millis(self.raw_nanos() / 1_000_000)
    }
}

// might be mocked
static GLOBAL_CLOCK: OnceCell<ClockSource> = OnceCell::new();

/// Installs a controllable mock as the process clock. Must run before the
/// first [`global_clock`] call and from a single thread.
#[inline]
pub fn init_mock_clock() -> Arc<Mock> {
    let (mock, controller) = Clock::mock();
    let installed = GLOBAL_CLOCK.get_or_init(|| ClockSource::Quanta(mock));
    assert_eq!(
        installed.raw_nanos(),
        0,
        "Do not initialize the global mock clock from 2 different threads"
    );
    controller.increment(1);
    controller
}

#[inline]
pub fn global_clock() -> &'static ClockSource {
    GLOBAL_CLOCK.get_or_init(|| ClockSource::System)
}
