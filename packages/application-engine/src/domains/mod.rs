pub mod applications;
pub mod automation;
pub mod crawling;
pub mod jobs;
pub mod metering;
