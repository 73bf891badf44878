pub mod audio_queue;
pub mod capture;
pub mod context;
pub mod control_queue;
pub mod hotkey;
pub mod manager;
pub mod rpc;
pub mod session;
pub mod settings;
pub mod state;
pub mod typing;
