pub mod catalog;
pub mod compiler;
pub mod config;
pub mod fixes;
pub mod fixscript;
pub mod providers;
pub mod reconcile;
pub mod repository;
pub mod runtime;
