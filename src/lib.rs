//! Bridges a game's render loop to an OpenXR runtime: instance and session
//! lifecycle, the per-frame wait/begin/locate/submit/end protocol, color
//! and depth swapchains bound to the host GL context, pose translation
//! into engine coordinates, and a stable per-frame controller snapshot.
//!
//! The entry point is [`XrConnector`]; the engine supplies a
//! [`driver::VideoDriver`]. Runtime crashes, device sleeps, and focus loss
//! are absorbed internally: the connector reconnects on retry timers and
//! reports "no view this frame" in the meantime.

#![deny(clippy::all)]

mod connector;
pub mod driver;
mod error;
mod graphics;
mod input;
mod instance;
mod math;
mod session;
mod swapchain;
mod types;

#[cfg(test)]
mod test_util;

pub use connector::XrConnector;
pub use error::{InitError, SessionInitError};
pub use math::Pose;
pub use types::{
    Button, FloatingHud, FrameConfig, Hand, HandState, InputPose, InputState, PlayArea, ViewInfo,
    ViewKind,
};

/// Install the crate's logging setup: an env_logger writing timestamped
/// records to stderr, plus a panic hook that logs the panic and backtrace
/// before aborting. Safe to call more than once.
///
/// Invariant violations in this crate (nested frames, unbalanced swapchain
/// acquire/release) are deliberate process-aborts: letting them continue
/// corrupts the runtime's internal state.
pub fn init_logging() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        #[cfg(not(test))]
        std::panic::set_hook(Box::new(|info| {
            log::error!("{info}");
            let backtrace = std::backtrace::Backtrace::force_capture();
            log::error!("Backtrace: \n{backtrace}");
            std::process::abort();
        }));

        // safety: who cares lol
        unsafe {
            time::util::local_offset::set_soundness(time::util::local_offset::Soundness::Unsound)
        };

        env_logger::Builder::new()
            .filter_level(log::LevelFilter::Info)
            .parse_default_env()
            .is_test(cfg!(test))
            .format(|buf, record| {
                use std::io::Write;
                use time::macros::format_description;

                let style = buf.default_level_style(record.level());
                let now = time::OffsetDateTime::now_local()
                    .unwrap_or_else(|_| time::OffsetDateTime::now_utc());
                let now = now
                    .format(format_description!(
                        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                    ))
                    .unwrap();

                write!(buf, "[{now} {style}{:5}{style:#}", record.level())?;
                if let Some(path) = record.module_path() {
                    write!(buf, " {}", path)?;
                }
                writeln!(buf, "] {}", record.args())
            })
            .init();
    });
}
