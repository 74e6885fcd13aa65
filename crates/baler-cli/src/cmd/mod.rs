pub(crate) mod break_lock;
pub(crate) mod build;
pub(crate) mod config;
pub(crate) mod expand;
pub(crate) mod purge;
pub(crate) mod status;
pub(crate) mod transfer;
pub(crate) mod tree;

pub(crate) type CmdResult = Result<(), Box<dyn std::error::Error>>;
