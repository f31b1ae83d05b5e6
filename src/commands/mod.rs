mod changes;
mod config_cmd;
mod get;
mod sync_cmd;
mod validate;

pub use changes::ChangesCommand;
pub use config_cmd::ConfigCommand;
pub use get::GetCommand;
pub use sync_cmd::SyncCommand;
pub use validate::ValidateCommand;
