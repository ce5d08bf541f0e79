pub mod archive;
pub mod collect;
pub mod control_client;
pub mod flag;
pub mod lock;
pub mod monitor;
pub mod paths;
pub mod relay;
pub mod replay;
pub mod server;
pub mod session;
pub mod settings;
pub mod signals;
pub mod stats;
pub mod util;
