pub mod cleanup;
pub mod run;
pub mod send;
pub mod status;
