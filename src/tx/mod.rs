//! Transaction submission module with nonce management and gas buffering

mod gas;
mod nonce;
mod sender;

pub use nonce::NonceManager;
pub use sender::TransactionSender;
