pub mod event_loop;

pub use event_loop::{Callback, DispatchStats, EventLoop, ExitStatus, LoopHandle};
