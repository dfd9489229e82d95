pub mod bus;
pub mod control;
pub mod daemon;
pub mod ingress;
pub mod machine;
pub mod notification;
pub mod state;

pub use daemon::{Config, DaemonError, run, start};
pub use machine::{MachineHandle, StateMachine};
pub use state::NowPlaying;
