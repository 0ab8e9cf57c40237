//! 命令定义和实现

pub mod config;
pub mod record;
pub mod simulate;
pub mod stream;

pub use config::ConfigCommand;
pub use record::RecordCommand;
pub use simulate::SimulateCommand;
pub use stream::StreamCommand;
