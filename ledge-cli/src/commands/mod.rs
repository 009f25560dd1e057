pub mod plugin;
pub mod run;
pub mod send;
