pub(crate) mod admin;
pub(crate) mod alarm;
pub(crate) mod bot;
pub(crate) mod clown;
pub(crate) mod commands;
pub(crate) mod error;
pub(crate) mod help;
pub(crate) mod links;
pub(crate) mod misc;
pub(crate) mod poll;
pub(crate) mod reminders;
pub(crate) mod state;
pub(crate) mod utils;
pub(crate) mod voice;
