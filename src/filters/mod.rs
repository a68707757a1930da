pub mod kalman;
pub mod policy;
pub mod rolling;
