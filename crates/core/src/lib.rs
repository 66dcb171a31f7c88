pub mod singleflight;
pub mod telemetry;
