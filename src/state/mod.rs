pub mod app;
pub mod status;
pub mod subscription;
