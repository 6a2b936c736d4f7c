pub mod auto_sync;
pub mod bootstrap;
pub mod commands;
pub mod remote_sync;

#[cfg(test)]
pub(crate) mod testing;
