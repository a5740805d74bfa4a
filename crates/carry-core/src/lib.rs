pub mod accounting;
pub mod candle;
pub mod config;
pub mod control;
pub mod engine;
pub mod features;
pub mod guidance;
pub mod indicators;
pub mod position;
pub mod reason_codes;
pub mod regime;
pub mod report;
pub mod shadow;
pub mod venue;
