mod clock;
mod millis;

pub use clock::{Clock, ClockSource, global_clock, init_mock_clock};
pub use millis::Millis;
