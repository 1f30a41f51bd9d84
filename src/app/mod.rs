//! Dialplan application commands.

pub mod dptools;
