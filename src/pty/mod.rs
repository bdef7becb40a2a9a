//! PTY subsystem (spec §4.3): terminal emulation and the per-PTY worker
//! thread that drives it.

pub mod emulator;
pub mod worker;

pub use emulator::{Cell, Emulator, FeedResult, Screen, VteEmulator};
pub use worker::{PtyEvent, PtyWorker};
